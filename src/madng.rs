//! Reader and writer for MAD-NG turn-by-turn tracking output (TFS format).
//!
//! Every table row holds one observation point for one particle and one
//! turn, with lower-case `x`/`y` columns and 1-based `turn` and `id`
//! counters. Values of one particle and plane reshape column-major into the
//! observation point x turn matrix.

use std::path::Path;

use ndarray::Array2;
use time::format_description::FormatItem;
use time::macros::format_description;
use time::OffsetDateTime;

use super::error::TbtError;
use super::lhc::shared_monitor_names;
use super::structures::{BpmMatrix, BunchMatrices, Meta, TbtData, TransverseData};
use super::tfs::{self, TfsData, TfsTable, TfsValue};

const NAME: &str = "name";
const TURN: &str = "turn";
const PARTICLE_ID: &str = "id";

const HEADER_NAME: &str = "name";
const ORIGIN: &str = "origin";
const DATE: &str = "date";
const TIME: &str = "time";
const REFCOL: &str = "refcol";
const DATE_FORMAT: &[FormatItem<'static>] = format_description!("[day]/[month]/[year]");
const TIME_FORMAT: &[FormatItem<'static>] = format_description!("[hour]:[minute]:[second]");

/// Read a MAD-NG TFS file.
pub fn read_tbt(path: &Path) -> Result<TbtData, TbtError> {
    log::debug!("reading MAD-NG file {}", path.display());
    let table = tfs::read_tfs_file(path)?;
    let mut tbt = from_table(&table)?;
    tbt.meta.file = Some(path.to_path_buf());
    Ok(tbt)
}

/// Build a measurement from an in-memory MAD-NG table.
pub fn from_table(table: &TfsTable) -> Result<TbtData, TbtError> {
    let names = text_column(table, NAME)?;
    let x = number_column(table, "x")?;
    let y = number_column(table, "y")?;
    let turns = integer_column(table, TURN)?;
    let ids = integer_column(table, PARTICLE_ID)?;

    let nturns = *turns
        .last()
        .ok_or_else(|| TbtError::MalformedSource("table holds no data rows".into()))?
        as usize;
    // the particle count is the highest 1-based id, so ids must run
    // contiguously from 1; a sparse id set fails the row-count check below
    let npart = *ids.last().unwrap_or(&0) as usize;
    log::info!("number of turns: {nturns}, number of particles: {npart}");
    if nturns == 0 || npart == 0 {
        return Err(TbtError::MalformedSource(
            "turn and particle counters must be 1-based and positive".into(),
        ));
    }

    // order rows by particle, then turn, keeping the row order within a turn
    let mut order: Vec<usize> = (0..names.len()).collect();
    order.sort_by_key(|&row| (ids[row], turns[row]));

    let first_key = (ids[order[0]], turns[order[0]]);
    let observe_points: Vec<String> = order
        .iter()
        .take_while(|&&row| (ids[row], turns[row]) == first_key)
        .map(|&row| names[row].clone())
        .collect();
    let nbpms = observe_points.len();

    if names.len() != nbpms * nturns * npart {
        return Err(TbtError::InconsistentShape(
            "the number of observed points is not consistent for all particles and turns, \
             the simulation may have lost particles"
                .into(),
        ));
    }

    let mut matrices = Vec::with_capacity(npart);
    for particle in 0..npart {
        let block = &order[particle * nbpms * nturns..(particle + 1) * nbpms * nturns];
        let plane = |values: &[f64]| -> Result<BpmMatrix, TbtError> {
            let mut data = Array2::zeros((nbpms, nturns));
            for turn in 0..nturns {
                for bpm in 0..nbpms {
                    data[[bpm, turn]] = values[block[turn * nbpms + bpm]];
                }
            }
            BpmMatrix::new(observe_points.clone(), data)
        };
        // no TrackingData here, MAD-NG does not provide the energy
        matrices.push(BunchMatrices::Transverse(TransverseData::new(
            plane(&x)?,
            plane(&y)?,
        )?));
    }

    let meta = Meta {
        source_format: Some("madng".to_string()),
        ..Meta::default()
    };
    TbtData::new(matrices, nturns, Some((0..npart).collect()), meta)
}

/// Write a measurement as a MAD-NG TFS file.
///
/// Rows are ordered by turn, then observation point, then particle, with
/// 1-based turn and particle counters.
pub fn write_tbt(path: &Path, data: &TbtData) -> Result<(), TbtError> {
    log::debug!("writing MAD-NG file {}", path.display());
    let table = to_table(data)?;
    tfs::write_tfs_file(path, &table)?;
    Ok(())
}

/// Build the MAD-NG table for a measurement.
pub fn to_table(data: &TbtData) -> Result<TfsTable, TbtError> {
    let monitors = shared_monitor_names(data)?;
    let nbpms = monitors.len();
    let nturns = data.nturns;
    let nrows = nbpms * nturns * data.nbunches();

    let mut names = Vec::with_capacity(nrows);
    let mut x = Vec::with_capacity(nrows);
    let mut y = Vec::with_capacity(nrows);
    let mut turns = Vec::with_capacity(nrows);
    let mut ids = Vec::with_capacity(nrows);
    for turn in 0..nturns {
        for (bpm, monitor) in monitors.iter().enumerate() {
            for (bunch, matrices) in data.matrices.iter().enumerate() {
                let field = |name: &str| -> Result<f64, TbtError> {
                    let table = matrices.field(name).ok_or_else(|| {
                        TbtError::InconsistentShape(format!("bunch {bunch} has no '{name}' field"))
                    })?;
                    Ok(table.data[[bpm, turn]])
                };
                names.push(monitor.clone());
                x.push(field("X")?);
                y.push(field("Y")?);
                turns.push(turn as i64 + 1);
                ids.push(data.bunch_ids[bunch] as i64 + 1);
            }
        }
    }

    let now = data.meta.date.unwrap_or_else(OffsetDateTime::now_utc);
    let stamp = |format: &[FormatItem<'_>]| {
        now.format(format)
            .map_err(|e| TbtError::MalformedSource(format!("cannot format date: {e}")))
    };
    Ok(TfsTable {
        headers: vec![
            (HEADER_NAME.to_string(), TfsValue::Text("TbtData".to_string())),
            (ORIGIN.to_string(), TfsValue::Text("turn_by_turn".to_string())),
            (DATE.to_string(), TfsValue::Text(stamp(DATE_FORMAT)?)),
            (TIME.to_string(), TfsValue::Text(stamp(TIME_FORMAT)?)),
            (REFCOL.to_string(), TfsValue::Text(NAME.to_string())),
        ],
        columns: vec![
            (NAME.to_string(), TfsData::Text(names)),
            ("x".to_string(), TfsData::Number(x)),
            ("y".to_string(), TfsData::Number(y)),
            (TURN.to_string(), TfsData::Integer(turns)),
            (PARTICLE_ID.to_string(), TfsData::Integer(ids)),
        ],
    })
}

fn text_column(table: &TfsTable, name: &str) -> Result<Vec<String>, TbtError> {
    match table.column(name) {
        Some(TfsData::Text(values)) => Ok(values.clone()),
        _ => Err(missing_column(name)),
    }
}

fn number_column(table: &TfsTable, name: &str) -> Result<Vec<f64>, TbtError> {
    match table.column(name) {
        Some(TfsData::Number(values)) => Ok(values.clone()),
        Some(TfsData::Integer(values)) => Ok(values.iter().map(|&v| v as f64).collect()),
        _ => Err(missing_column(name)),
    }
}

fn integer_column(table: &TfsTable, name: &str) -> Result<Vec<i64>, TbtError> {
    match table.column(name) {
        Some(TfsData::Integer(values)) => Ok(values.clone()),
        Some(TfsData::Number(values)) => Ok(values.iter().map(|&v| v as i64).collect()),
        _ => Err(missing_column(name)),
    }
}

fn missing_column(name: &str) -> TbtError {
    TbtError::MalformedSource(format!("required table column '{name}' is absent or mistyped"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn measurement(nbunches: usize, nturns: usize) -> TbtData {
        let names: Vec<String> = ["BPM1", "BPM2", "BPM3"].iter().map(|s| s.to_string()).collect();
        let matrices = (0..nbunches)
            .map(|bunch| {
                let x = Array2::from_shape_fn((3, nturns), |(i, j)| {
                    (bunch * 100 + i * 10 + j) as f64 / 7.0
                });
                let y = x.mapv(|v| -v);
                BunchMatrices::Transverse(
                    TransverseData::new(
                        BpmMatrix::new(names.clone(), x).unwrap(),
                        BpmMatrix::new(names.clone(), y).unwrap(),
                    )
                    .unwrap(),
                )
            })
            .collect();
        TbtData::new(matrices, nturns, None, Meta::default()).unwrap()
    }

    #[test]
    fn file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("madng.tfs");
        let origin = measurement(2, 4);
        write_tbt(&path, &origin).unwrap();
        let read = read_tbt(&path).unwrap();
        assert_eq!(read.matrices, origin.matrices);
        assert_eq!(read.nturns, 4);
        assert_eq!(read.bunch_ids, vec![0, 1]);
    }

    #[test]
    fn table_round_trip_without_files() {
        let origin = measurement(1, 3);
        let table = to_table(&origin).unwrap();
        assert_eq!(table.n_rows(), 9);
        assert_eq!(
            table.header(HEADER_NAME),
            Some(&TfsValue::Text("TbtData".to_string()))
        );
        let rebuilt = from_table(&table).unwrap();
        assert_eq!(rebuilt.matrices, origin.matrices);
    }

    #[test]
    fn column_major_reshape_matches_row_layout() {
        // two monitors, two turns, one particle, x encodes (monitor, turn)
        let table = TfsTable {
            headers: Vec::new(),
            columns: vec![
                (
                    NAME.to_string(),
                    TfsData::Text(
                        ["A", "B", "A", "B"].iter().map(|s| s.to_string()).collect(),
                    ),
                ),
                ("x".to_string(), TfsData::Number(vec![11.0, 21.0, 12.0, 22.0])),
                ("y".to_string(), TfsData::Number(vec![0.0; 4])),
                (TURN.to_string(), TfsData::Integer(vec![1, 1, 2, 2])),
                (PARTICLE_ID.to_string(), TfsData::Integer(vec![1, 1, 1, 1])),
            ],
        };
        let tbt = from_table(&table).unwrap();
        let x = tbt.matrices[0].field("X").unwrap();
        assert_eq!(x.index, vec!["A".to_string(), "B".to_string()]);
        assert_eq!(x.data[[0, 1]], 12.0);
        assert_eq!(x.data[[1, 0]], 21.0);
    }

    #[test]
    fn sparse_bunch_ids_do_not_round_trip() {
        let mut origin = measurement(2, 3);
        origin.bunch_ids = vec![7, 11];
        let table = to_table(&origin).unwrap();
        // ids [7, 11] write as [8, 12], from which no contiguous particle
        // range can be rebuilt
        assert!(matches!(
            from_table(&table),
            Err(TbtError::InconsistentShape(_))
        ));
    }

    #[test]
    fn lost_particles_are_rejected() {
        let origin = measurement(2, 4);
        let mut table = to_table(&origin).unwrap();
        for (_, data) in &mut table.columns {
            match data {
                TfsData::Text(v) => {
                    v.pop();
                }
                TfsData::Number(v) => {
                    v.pop();
                }
                TfsData::Integer(v) => {
                    v.pop();
                }
            }
        }
        assert!(matches!(
            from_table(&table),
            Err(TbtError::InconsistentShape(_))
        ));
    }
}
