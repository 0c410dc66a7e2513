//! Reader and writer for the legacy turn-by-turn ASCII table format.
//!
//! These files predate the binary SDDS acquisition output. Each data line
//! holds a plane number (0 horizontal, 1 vertical), the monitor name, its
//! index, and the samples of all turns with six decimals of precision.
//! Comment lines start with `#`; one of them may carry the acquisition date.

use std::fs;
use std::io::{BufWriter, Write};
use std::path::Path;

use ndarray::Array2;
use regex::Regex;
use time::format_description::FormatItem;
use time::macros::format_description;
use time::{OffsetDateTime, PrimitiveDateTime};

use super::error::TbtError;
use super::structures::{BpmMatrix, BunchMatrices, Meta, TbtData, TransverseData};

const ASCII_ID: &str = "SDDSASCIIFORMAT";
const ACQ_DATE_PREFIX: &str = "Acquisition date:";
const ACQ_DATE_FORMAT: &[FormatItem<'static>] =
    format_description!("[year]-[month]-[day] at [hour]:[minute]:[second]");

/// Whether the file looks like a readable turn-by-turn ASCII file.
///
/// Some machines omit the format tag, so any leading comment line counts.
pub fn is_ascii_file(path: &Path) -> Result<bool, TbtError> {
    let bytes = fs::read(path)?;
    let Ok(content) = String::from_utf8(bytes) else {
        return Ok(false);
    };
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        return Ok(line.starts_with('#'));
    }
    Ok(false)
}

/// Read turn-by-turn data from an ASCII file.
///
/// The bunch id is parsed from a trailing `_<id>` in the file name and
/// defaults to 0.
pub fn read_tbt(path: &Path) -> Result<TbtData, TbtError> {
    log::debug!("reading ASCII file {}", path.display());
    let content = fs::read_to_string(path)?;

    let mut names: [Vec<String>; 2] = [Vec::new(), Vec::new()];
    let mut samples: [Vec<Vec<f64>>; 2] = [Vec::new(), Vec::new()];
    let mut date = None;

    for line in content.lines() {
        let line = line.trim();
        if line.contains(ACQ_DATE_PREFIX) {
            date = parse_date(line);
            continue;
        }
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let mut parts = line.split_whitespace();
        let (Some(plane), Some(name)) = (parts.next(), parts.next()) else {
            return Err(TbtError::MalformedSource(format!(
                "incomplete data line: '{line}'"
            )));
        };
        let plane = match plane {
            "0" => 0,
            "1" => 1,
            other => {
                return Err(TbtError::MalformedSource(format!(
                    "plane number '{other}' found, only '0' and '1' are allowed"
                )))
            }
        };
        let row = parts
            .skip(1) // monitor index, unused
            .map(|part| {
                part.parse::<f64>().map_err(|_| {
                    TbtError::MalformedSource(format!("cannot parse sample '{part}'"))
                })
            })
            .collect::<Result<Vec<f64>, _>>()?;
        names[plane].push(name.to_string());
        samples[plane].push(row);
    }

    let x = plane_matrix(&names[0], &samples[0], "horizontal")?;
    let y = plane_matrix(&names[1], &samples[1], "vertical")?;
    let nturns = x.n_turns();

    let meta = Meta {
        date,
        file: Some(path.to_path_buf()),
        source_format: Some("ascii".to_string()),
        ..Meta::default()
    };
    TbtData::new(
        vec![BunchMatrices::Transverse(TransverseData::new(x, y)?)],
        nturns,
        Some(vec![parse_bunch_id(path)]),
        meta,
    )
}

/// Write a measurement in the ASCII format.
///
/// A single bunch goes to `path` itself; with several bunches, each one goes
/// to its own file with `_<bunch id>` appended to the file stem.
pub fn write_tbt(path: &Path, data: &TbtData) -> Result<(), TbtError> {
    log::info!("writing ASCII data to {}", path.display());
    for (bunch, matrices) in data.matrices.iter().enumerate() {
        let target = if data.nbunches() > 1 {
            bunch_path(path, data.bunch_ids[bunch])
        } else {
            path.to_path_buf()
        };
        let mut writer = BufWriter::new(fs::File::create(&target)?);
        write_header(&mut writer, data, matrices)?;
        for (plane, field) in ["X", "Y"].iter().enumerate() {
            let table = matrices.field(field).ok_or_else(|| {
                TbtError::InconsistentShape(format!("bunch {bunch} has no '{field}' field"))
            })?;
            for (index, name) in table.index.iter().enumerate() {
                write!(writer, "{plane} {name} {index} ")?;
                for sample in table.data.row(index) {
                    write!(writer, " {sample:.6}")?;
                }
                writeln!(writer)?;
            }
        }
        writer.flush()?;
    }
    Ok(())
}

fn write_header(
    writer: &mut impl Write,
    data: &TbtData,
    matrices: &BunchMatrices,
) -> Result<(), TbtError> {
    writeln!(writer, "#{ASCII_ID} v1")?;
    let now = OffsetDateTime::now_utc();
    let created = PrimitiveDateTime::new(now.date(), now.time())
        .format(ACQ_DATE_FORMAT)
        .map_err(|e| TbtError::MalformedSource(format!("cannot format date: {e}")))?;
    writeln!(writer, "#Created: {created} By: turn_by_turn")?;
    writeln!(writer, "#Number of turns: {}", data.nturns)?;
    for (label, field) in [("horizontal", "X"), ("vertical", "Y")] {
        if let Some(table) = matrices.field(field) {
            writeln!(writer, "#Number of {label} monitors: {}", table.n_monitors())?;
        }
    }
    if let Some(date) = data.meta.date {
        let stamp = PrimitiveDateTime::new(date.date(), date.time())
            .format(ACQ_DATE_FORMAT)
            .map_err(|e| TbtError::MalformedSource(format!("cannot format date: {e}")))?;
        writeln!(writer, "#{ACQ_DATE_PREFIX} {stamp}")?;
    }
    Ok(())
}

fn plane_matrix(
    names: &[String],
    samples: &[Vec<f64>],
    label: &str,
) -> Result<BpmMatrix, TbtError> {
    let nturns = samples.first().map(Vec::len).unwrap_or(0);
    for (name, row) in names.iter().zip(samples) {
        if row.len() != nturns {
            return Err(TbtError::InconsistentShape(format!(
                "{label} monitor '{name}' has {} samples, expected {nturns}",
                row.len()
            )));
        }
    }
    let flat: Vec<f64> = samples.iter().flatten().copied().collect();
    let data = Array2::from_shape_vec((names.len(), nturns), flat)
        .map_err(|e| TbtError::InconsistentShape(e.to_string()))?;
    BpmMatrix::new(names.to_vec(), data)
}

fn parse_date(line: &str) -> Option<OffsetDateTime> {
    let stamp = line.replace(ACQ_DATE_PREFIX, "").replace('#', "");
    match PrimitiveDateTime::parse(stamp.trim(), ACQ_DATE_FORMAT) {
        Ok(datetime) => Some(datetime.assume_utc()),
        Err(_) => {
            log::warn!("could not parse acquisition date '{}'", stamp.trim());
            None
        }
    }
}

fn parse_bunch_id(path: &Path) -> usize {
    let pattern = Regex::new(r".*_(?P<bunch_id>\d+)(\.sdds)?$").expect("pattern is valid");
    path.file_name()
        .and_then(|name| name.to_str())
        .and_then(|name| pattern.captures(name))
        .and_then(|captures| captures["bunch_id"].parse().ok())
        .unwrap_or(0)
}

fn bunch_path(path: &Path, bunch_id: usize) -> std::path::PathBuf {
    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or_default();
    let name = match path.extension().and_then(|e| e.to_str()) {
        Some(extension) => format!("{stem}_{bunch_id}.{extension}"),
        None => format!("{stem}_{bunch_id}"),
    };
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array;
    use time::macros::datetime;

    const ASCII_PRECISION: f64 = 0.6e-6;

    fn measurement(nturns: usize) -> TbtData {
        let names: Vec<String> = (1..=4).map(|i| format!("TBPM{i}")).collect();
        let turns = Array::linspace(0.0, (nturns - 1) as f64, nturns);
        let mut x = Array2::zeros((4, nturns));
        let mut y = Array2::zeros((4, nturns));
        for i in 0..4 {
            x.row_mut(i).assign(&turns.mapv(|t| (0.31 * t + i as f64).sin()));
            y.row_mut(i).assign(&turns.mapv(|t| (0.32 * t + i as f64).cos()));
        }
        TbtData::new(
            vec![BunchMatrices::Transverse(
                TransverseData::new(
                    BpmMatrix::new(names.clone(), x).unwrap(),
                    BpmMatrix::new(names, y).unwrap(),
                )
                .unwrap(),
            )],
            nturns,
            None,
            Meta {
                date: Some(datetime!(2020-01-01 12:00:00 UTC)),
                ..Meta::default()
            },
        )
        .unwrap()
    }

    fn assert_close(read: &TbtData, origin: &TbtData) {
        for (got, want) in read.matrices.iter().zip(&origin.matrices) {
            for field in got.fieldnames() {
                let got = got.field(field).unwrap();
                let want = want.field(field).unwrap();
                assert_eq!(got.index, want.index);
                for (a, b) in got.data.iter().zip(want.data.iter()) {
                    assert!((a - b).abs() < ASCII_PRECISION);
                }
            }
        }
    }

    #[test]
    fn round_trip_within_write_precision() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("meas.sdds");
        let origin = measurement(100);
        write_tbt(&path, &origin).unwrap();
        let read = read_tbt(&path).unwrap();
        assert_close(&read, &origin);
        assert_eq!(read.nturns, 100);
        assert_eq!(read.meta.date, origin.meta.date);
        assert_eq!(read.bunch_ids, vec![0]);
    }

    #[test]
    fn multibunch_write_splits_files_and_ids_come_from_names() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("meas.sdds");
        let single = measurement(10);
        let origin = TbtData::new(
            vec![single.matrices[0].clone(), single.matrices[0].clone()],
            10,
            Some(vec![3, 12]),
            single.meta.clone(),
        )
        .unwrap();
        write_tbt(&path, &origin).unwrap();
        let first = read_tbt(&dir.path().join("meas_3.sdds")).unwrap();
        let second = read_tbt(&dir.path().join("meas_12.sdds")).unwrap();
        assert_eq!(first.bunch_ids, vec![3]);
        assert_eq!(second.bunch_ids, vec![12]);
        assert_close(&first, &single);
    }

    #[test]
    fn unknown_plane_number_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.sdds");
        fs::write(&path, "#SDDSASCIIFORMAT v1\n2 BPM1 0  1.0 2.0\n").unwrap();
        assert!(matches!(read_tbt(&path), Err(TbtError::MalformedSource(_))));
    }

    #[test]
    fn unparseable_date_is_omitted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nodate.sdds");
        fs::write(
            &path,
            "#SDDSASCIIFORMAT v1\n#Acquisition date: whenever\n0 BPM1 0  1.0\n1 BPM1 0  2.0\n",
        )
        .unwrap();
        let read = read_tbt(&path).unwrap();
        assert!(read.meta.date.is_none());
        assert_eq!(read.nturns, 1);
    }

    #[test]
    fn ragged_rows_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ragged.sdds");
        fs::write(
            &path,
            "#SDDSASCIIFORMAT v1\n0 BPM1 0  1.0 2.0\n0 BPM2 1  1.0\n1 BPM1 0  1.0 2.0\n1 BPM2 1  1.0 2.0\n",
        )
        .unwrap();
        assert!(matches!(
            read_tbt(&path),
            Err(TbtError::InconsistentShape(_))
        ));
    }

    #[test]
    fn ascii_detection() {
        let dir = tempfile::tempdir().unwrap();
        let text = dir.path().join("a.sdds");
        fs::write(&text, "#SDDSASCIIFORMAT v1\n0 BPM1 0  1.0\n").unwrap();
        assert!(is_ascii_file(&text).unwrap());
        let binary = dir.path().join("b.sdds");
        fs::write(&binary, b"SDDS1\n\xff\xfe\x00").unwrap();
        assert!(!is_ascii_file(&binary).unwrap());
    }
}
