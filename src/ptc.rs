//! Reader for turn-by-turn data from PTC tracking output (MAD-X PTC
//! `trackone` files).
//!
//! The files look like TFS tables, but the data part is split into
//! `#segment` blocks, one per observation point and turn, framed by `start`
//! and `end` marker segments. The file is traversed twice: a first pass over
//! the opening segment collects the observation points, particle numbers,
//! column layout and turn count, a second pass fills the matrices.

use std::fs;
use std::path::Path;

use fxhash::FxHashMap;
use ndarray::Array2;
use time::{Date, Month, OffsetDateTime, PrimitiveDateTime, Time};

use super::error::TbtError;
use super::structures::{BpmMatrix, BunchMatrices, Meta, TbtData, TransverseData};

const HEADER: &str = "@";
const NAMES: &str = "*";
const TYPES: &str = "$";
const SEGMENTS: &str = "#segment";
const SEGMENT_MARKER: [&str; 2] = ["start", "end"];
const COL_X: &str = "X";
const COL_Y: &str = "Y";
const COL_TURN: &str = "TURN";
const COL_PARTICLE: &str = "NUMBER";
const DATE: &str = "DATE";
const TIME: &str = "TIME";

#[derive(Debug)]
struct Segment {
    turns: usize,
    particles: usize,
    name: String,
}

impl Segment {
    /// Parse the fields after the `#segment` tag: number, turns, particles,
    /// element count and name.
    fn parse(parts: &[&str]) -> Result<Self, TbtError> {
        if parts.len() < 6 {
            return Err(TbtError::MalformedSource(format!(
                "segment line holds {} fields, expected 6",
                parts.len()
            )));
        }
        let number = |field: &str| {
            field.parse::<usize>().map_err(|_| {
                TbtError::MalformedSource(format!("cannot parse segment field '{field}'"))
            })
        };
        Ok(Segment {
            turns: number(parts[2])?,
            particles: number(parts[3])?,
            name: parts[5].to_string(),
        })
    }
}

#[derive(Debug, Default)]
struct FirstTurn {
    monitors: Vec<String>,
    particles: Vec<usize>,
    columns: Option<Columns>,
    nturns: usize,
    nparticles: usize,
}

#[derive(Debug, Clone, Copy)]
struct Columns {
    x: usize,
    y: usize,
    turn: usize,
    particle: usize,
}

/// Read a PTC tracking output file.
pub fn read_tbt(path: &Path) -> Result<TbtData, TbtError> {
    log::debug!("reading PTC trackone file {}", path.display());
    let content = fs::read_to_string(path)?;
    let lines: Vec<&str> = content.lines().collect();

    log::debug!("reading header from file");
    let (date, header_length) = read_header(&lines);
    let lines = &lines[header_length..];

    let params = read_from_first_turn(lines)?;
    let columns = params
        .columns
        .ok_or_else(|| TbtError::MalformedSource("columns not defined in tracking file".into()))?;

    let monitor_rows: FxHashMap<&str, usize> = params
        .monitors
        .iter()
        .enumerate()
        .map(|(row, name)| (name.as_str(), row))
        .collect();
    let mut x_matrices =
        vec![Array2::<f64>::zeros((params.monitors.len(), params.nturns)); params.nparticles];
    let mut y_matrices = x_matrices.clone();

    log::debug!("reading data");
    let mut segment: Option<Segment> = None;
    for line in lines {
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.is_empty() || [HEADER, TYPES, NAMES].contains(&parts[0]) {
            continue;
        }
        if parts[0] == SEGMENTS {
            segment = Some(Segment::parse(&parts)?);
            continue;
        }
        let current = segment
            .as_ref()
            .ok_or_else(|| TbtError::MalformedSource("data written before segment definition".into()))?;
        if SEGMENT_MARKER.contains(&current.name.as_str()) {
            continue;
        }
        let row = *monitor_rows.get(current.name.as_str()).ok_or_else(|| {
            TbtError::MalformedSource(format!(
                "observation point '{}' did not appear in the first segment",
                current.name
            ))
        })?;
        let (particle, turn) = match (
            column_value(&parts, columns.particle)?.checked_sub(1),
            column_value(&parts, columns.turn)?.checked_sub(1),
        ) {
            (Some(particle), Some(turn)) => (particle, turn),
            _ => continue, // pre-tracking state at turn 0
        };
        if particle >= params.nparticles || turn >= params.nturns {
            return Err(TbtError::InconsistentShape(format!(
                "sample for particle {} at turn {} exceeds the declared {} particles and {} turns",
                particle + 1,
                turn + 1,
                params.nparticles,
                params.nturns
            )));
        }
        x_matrices[particle][[row, turn]] = float_field(&parts, columns.x)?;
        y_matrices[particle][[row, turn]] = float_field(&parts, columns.y)?;
    }

    let matrices = x_matrices
        .into_iter()
        .zip(y_matrices)
        .map(|(x, y)| {
            Ok(BunchMatrices::Transverse(TransverseData::new(
                BpmMatrix::new(params.monitors.clone(), x)?,
                BpmMatrix::new(params.monitors.clone(), y)?,
            )?))
        })
        .collect::<Result<Vec<_>, TbtError>>()?;

    let meta = Meta {
        date,
        file: Some(path.to_path_buf()),
        source_format: Some("ptc".to_string()),
        ..Meta::default()
    };
    TbtData::new(matrices, params.nturns, Some(params.particles), meta)
}

/// Read the date and the header length from the `@` lines.
fn read_header(lines: &[&str]) -> (Option<OffsetDateTime>, usize) {
    let mut date_str: Option<String> = None;
    let mut time_str: Option<String> = None;
    let mut header_length = 0;
    for (index, line) in lines.iter().enumerate() {
        header_length = index;
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.is_empty() {
            continue;
        }
        if parts[0] != HEADER {
            break;
        }
        if parts.len() >= 2 {
            let value = parts[parts.len() - 1].trim_matches(|c| c == '\'' || c == '"');
            match parts[1] {
                DATE => date_str = Some(value.to_string()),
                TIME => time_str = Some(value.to_string()),
                _ => {}
            }
        }
    }
    let date = match (&date_str, &time_str) {
        (Some(date), Some(time)) => parse_datetime(date, time),
        _ => {
            log::warn!("no date found in file header");
            None
        }
    };
    (date, header_length)
}

/// Parse the `dd/mm/yy hh.mm.ss` stamps PTC writes.
fn parse_datetime(date: &str, time: &str) -> Option<OffsetDateTime> {
    let date_parts: Vec<u16> = date.split('/').filter_map(|p| p.parse().ok()).collect();
    let time_parts: Vec<u8> = time.split('.').filter_map(|p| p.parse().ok()).collect();
    let (&[day, month, year], &[hour, minute, second]) =
        (date_parts.as_slice(), time_parts.as_slice())
    else {
        log::warn!("could not parse date '{date} {time}'");
        return None;
    };
    let month = Month::try_from(month as u8).ok()?;
    let date = Date::from_calendar_date(2000 + year as i32, month, day as u8).ok()?;
    let time = Time::from_hms(hour, minute, second).ok()?;
    Some(PrimitiveDateTime::new(date, time).assume_utc())
}

/// Collect monitors, particle numbers, the column layout and the turn count
/// from the first segment.
fn read_from_first_turn(lines: &[&str]) -> Result<FirstTurn, TbtError> {
    log::debug!("reading first turn to define boundary parameters");
    let mut data = FirstTurn::default();
    let mut first_segment = true;

    for line in lines {
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.is_empty() || [HEADER, TYPES].contains(&parts[0]) {
            continue;
        }
        if parts[0] == NAMES {
            if data.columns.is_some() {
                return Err(TbtError::MalformedSource(
                    "column names are defined twice in tracking file".into(),
                ));
            }
            data.columns = Some(parse_column_names(&parts[1..])?);
            continue;
        }
        if parts[0] == SEGMENTS {
            let segment = Segment::parse(&parts)?;
            if segment.name == SEGMENT_MARKER[0] {
                data.nturns = segment.turns.saturating_sub(1);
                data.nparticles = segment.particles;
            } else if segment.name == SEGMENT_MARKER[1] {
                break;
            } else {
                first_segment = false;
                data.monitors.push(segment.name);
            }
        } else if first_segment {
            let columns = data.columns.ok_or_else(|| {
                TbtError::MalformedSource("columns not defined in tracking file".into())
            })?;
            let particle = column_value(&parts, columns.particle)?;
            data.particles.push(particle.saturating_sub(1));
        }
    }

    if data.particles.is_empty() {
        return Err(TbtError::MalformedSource(
            "no particles found in tracking file".into(),
        ));
    }
    Ok(data)
}

fn parse_column_names(parts: &[&str]) -> Result<Columns, TbtError> {
    let mut indices: FxHashMap<&str, usize> = FxHashMap::default();
    for (index, column) in parts.iter().enumerate() {
        if ![COL_X, COL_Y, COL_TURN, COL_PARTICLE].contains(column) {
            log::debug!("column '{column}' will be ignored");
            continue;
        }
        if indices.insert(column, index).is_some() {
            return Err(TbtError::MalformedSource(format!(
                "column '{column}' is defined twice"
            )));
        }
    }
    let required = |name: &str| {
        indices.get(name).copied().ok_or_else(|| {
            TbtError::MalformedSource(format!("column '{name}' is missing in tracking file"))
        })
    };
    Ok(Columns {
        x: required(COL_X)?,
        y: required(COL_Y)?,
        turn: required(COL_TURN)?,
        particle: required(COL_PARTICLE)?,
    })
}

fn float_field(parts: &[&str], index: usize) -> Result<f64, TbtError> {
    let field = parts.get(index).ok_or_else(|| {
        TbtError::MalformedSource(format!("data line holds fewer than {} fields", index + 1))
    })?;
    field
        .parse::<f64>()
        .map_err(|_| TbtError::MalformedSource(format!("cannot parse value '{field}'")))
}

fn column_value(parts: &[&str], index: usize) -> Result<usize, TbtError> {
    Ok(float_field(parts, index)? as usize)
}
