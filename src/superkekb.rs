//! Reader for SuperKEKB turn-by-turn measurement files.
//!
//! The files are Mathematica-style expression dumps. After stripping
//! newlines, spaces and line-continuation backslashes, each monitor appears
//! as `("NAME"->{{x values},{y values},{standard errors}})`; the acquisition
//! date sits in the header as `YYYY-MM-DD_hh:mm:ss.ffffff`.

use std::fs;
use std::path::Path;

use ndarray::Array2;
use regex::Regex;
use time::macros::format_description;
use time::{OffsetDateTime, PrimitiveDateTime};

use super::error::TbtError;
use super::structures::{BpmMatrix, BunchMatrices, Meta, TbtData, TransverseData};

/// Read a SuperKEKB measurement file.
pub fn read_tbt(path: &Path) -> Result<TbtData, TbtError> {
    log::debug!("reading SuperKEKB file {}", path.display());
    let content = fs::read_to_string(path)?
        .replace(['\n', ' '], "")
        .replace('\\', "");

    let date = parse_date(&content);

    let monitor_pattern =
        Regex::new(r#"\("([A-Z0-9]+)"->\{\{([^}]+)\},\{([^}]+)\},\{([^}]+)\}\}\)"#)
            .expect("pattern is valid");
    let mut monitors = Vec::new();
    let mut x_rows: Vec<Vec<f64>> = Vec::new();
    let mut y_rows: Vec<Vec<f64>> = Vec::new();
    for captures in monitor_pattern.captures_iter(&content) {
        monitors.push(captures[1].to_string());
        x_rows.push(parse_values(&captures[2])?);
        y_rows.push(parse_values(&captures[3])?);
    }
    if monitors.is_empty() {
        return Err(TbtError::MalformedSource(
            "no monitor entries found in file".into(),
        ));
    }

    let nturns = x_rows[0].len();
    let meta = Meta {
        date,
        file: Some(path.to_path_buf()),
        source_format: Some("superkekb".to_string()),
        ..Meta::default()
    };
    let matrices = BunchMatrices::Transverse(TransverseData::new(
        plane_matrix(&monitors, x_rows, nturns, "horizontal")?,
        plane_matrix(&monitors, y_rows, nturns, "vertical")?,
    )?);
    TbtData::new(vec![matrices], nturns, None, meta)
}

fn parse_date(content: &str) -> Option<OffsetDateTime> {
    let pattern = Regex::new(r"\d{4}-[01]\d-[0-3]\d_[0-2]\d:[0-5]\d:[0-5]\d\.\d+")
        .expect("pattern is valid");
    let stamp = pattern.find(content)?.as_str();
    let format = format_description!(
        "[year]-[month]-[day]_[hour]:[minute]:[second].[subsecond]"
    );
    match PrimitiveDateTime::parse(stamp, format) {
        Ok(datetime) => Some(datetime.assume_utc()),
        Err(_) => {
            log::warn!("could not parse acquisition date '{stamp}'");
            None
        }
    }
}

fn parse_values(list: &str) -> Result<Vec<f64>, TbtError> {
    list.split(',')
        .map(|value| {
            value
                .parse::<f64>()
                .map_err(|_| TbtError::MalformedSource(format!("cannot parse sample '{value}'")))
        })
        .collect()
}

fn plane_matrix(
    monitors: &[String],
    rows: Vec<Vec<f64>>,
    nturns: usize,
    label: &str,
) -> Result<BpmMatrix, TbtError> {
    for (monitor, row) in monitors.iter().zip(&rows) {
        if row.len() != nturns {
            return Err(TbtError::InconsistentShape(format!(
                "{label} samples of monitor '{monitor}' have length {}, expected {nturns}",
                row.len()
            )));
        }
    }
    let flat: Vec<f64> = rows.into_iter().flatten().collect();
    let data = Array2::from_shape_vec((monitors.len(), nturns), flat)
        .map_err(|e| TbtError::InconsistentShape(e.to_string()))?;
    BpmMatrix::new(monitors.to_vec(), data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    const FILE: &str = "\
{\"2024-03-15_08:45:30.125000\", \\
(\"MQC1LE\"->{{0.1, 0.2, \\
0.3},{-0.1,-0.2,-0.3},{0.01,0.01,0.01}}), \\
(\"MQC2LE\"->{{1.1,1.2,1.3},{-1.1, \\
-1.2,-1.3},{0.02,0.02,0.02}})}
";

    fn fixture(content: &str) -> (tempfile::TempDir, std::path::PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kekb.txt");
        fs::write(&path, content).unwrap();
        (dir, path)
    }

    #[test]
    fn reads_monitors_across_continuation_lines() {
        let (_dir, path) = fixture(FILE);
        let read = read_tbt(&path).unwrap();
        assert_eq!(read.nturns, 3);
        assert_eq!(read.nbunches(), 1);
        let x = read.matrices[0].field("X").unwrap();
        assert_eq!(x.index, vec!["MQC1LE".to_string(), "MQC2LE".to_string()]);
        assert_eq!(x.data[[0, 2]], 0.3);
        assert_eq!(x.data[[1, 0]], 1.1);
        let y = read.matrices[0].field("Y").unwrap();
        assert_eq!(y.data[[1, 2]], -1.3);
        assert_eq!(read.meta.date, Some(datetime!(2024-03-15 08:45:30.125 UTC)));
    }

    #[test]
    fn missing_date_is_omitted() {
        let undated = FILE.replace("\"2024-03-15_08:45:30.125000\", \\\n", "");
        let (_dir, path) = fixture(&undated);
        let read = read_tbt(&path).unwrap();
        assert!(read.meta.date.is_none());
        assert_eq!(read.nturns, 3);
    }

    #[test]
    fn ragged_monitor_lengths_are_rejected() {
        let ragged = FILE.replace("{-1.1, \\\n-1.2,-1.3}", "{-1.1,-1.2}");
        let (_dir, path) = fixture(&ragged);
        assert!(matches!(
            read_tbt(&path),
            Err(TbtError::InconsistentShape(_))
        ));
    }

    #[test]
    fn file_without_monitors_is_rejected() {
        let (_dir, path) = fixture("{\"no data here\"}");
        assert!(matches!(read_tbt(&path), Err(TbtError::MalformedSource(_))));
    }
}
