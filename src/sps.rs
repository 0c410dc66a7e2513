//! Reader and writer for SPS turn-by-turn SDDS files.
//!
//! Unlike the LHC layout, the SPS acquisition stores one array per monitor,
//! named after it, plus a `MonNames`/`MonPlanes` pair describing which plane
//! each monitor belongs to. Monitor names usually carry a trailing `.H` or
//! `.V` plane marker; it is stripped on read and restored on write so the
//! in-memory names line up with the machine model.

use std::path::Path;

use ndarray::Array2;
use regex::Regex;
use time::OffsetDateTime;

use super::ascii;
use super::error::TbtError;
use super::sdds::{self, SddsArray, SddsEntry, SddsFile, SddsScalar};
use super::structures::{BpmMatrix, BunchMatrices, Meta, TbtData, TransverseData};

const N_TURNS: &str = "nbOfTurns";
const TIMESTAMP: &str = "timestamp";
const BPM_NAMES: &str = "MonNames";
const BPM_PLANES: &str = "MonPlanes";

/// Read an SPS measurement file, delegating ASCII-looking files to the
/// legacy reader.
pub fn read_tbt(path: &Path) -> Result<TbtData, TbtError> {
    if ascii::is_ascii_file(path)? {
        return ascii::read_tbt(path);
    }
    log::debug!("reading SPS SDDS file {}", path.display());
    let sdds = sdds::read_sdds_file(path)?;

    let nturns = sdds
        .scalar_i64(N_TURNS)
        .ok_or_else(|| TbtError::MalformedSource(format!("required SDDS entry '{N_TURNS}' is absent")))?
        as usize;
    let names = sdds
        .array_str(BPM_NAMES)
        .ok_or_else(|| TbtError::MalformedSource(format!("required SDDS entry '{BPM_NAMES}' is absent")))?
        .to_vec();
    let planes = sdds.array_i64(BPM_PLANES).unwrap_or_default();

    let suffix = plane_suffix();
    let vertical = split_monitors_to_planes(&names, &planes, &suffix)?;
    let mut names_x = Vec::new();
    let mut names_y = Vec::new();
    let mut data_x = Vec::new();
    let mut data_y = Vec::new();
    for (name, is_vertical) in names.iter().zip(&vertical) {
        let samples = sdds.array_f64(name).ok_or_else(|| {
            TbtError::MalformedSource(format!("monitor array '{name}' is absent"))
        })?;
        if samples.len() != nturns {
            return Err(TbtError::InconsistentShape(format!(
                "monitor '{name}' has {} samples, expected {nturns} turns",
                samples.len()
            )));
        }
        if *is_vertical {
            names_y.push(strip_plane_suffix(&suffix, name));
            data_y.push(samples);
        } else {
            names_x.push(strip_plane_suffix(&suffix, name));
            data_x.push(samples);
        }
    }

    let date = sdds
        .scalar_i64(TIMESTAMP)
        .and_then(|nanoseconds| OffsetDateTime::from_unix_timestamp_nanos(nanoseconds as i128).ok());
    let meta = Meta {
        date,
        file: Some(path.to_path_buf()),
        source_format: Some("sps".to_string()),
        ..Meta::default()
    };
    let matrices = BunchMatrices::Transverse(TransverseData::new(
        plane_matrix(names_x, data_x, nturns)?,
        plane_matrix(names_y, data_y, nturns)?,
    )?);
    TbtData::new(vec![matrices], nturns, Some(vec![0]), meta)
}

/// Write a measurement as an SPS SDDS file, reduced to the entries the
/// reader uses. Only single-bunch measurements fit this layout.
pub fn write_tbt(path: &Path, data: &TbtData) -> Result<(), TbtError> {
    log::info!("writing SPS SDDS data to {}", path.display());
    if data.nbunches() != 1 {
        return Err(TbtError::InconsistentShape(format!(
            "this format holds a single bunch, got {}",
            data.nbunches()
        )));
    }
    let matrices = &data.matrices[0];
    let x = matrices
        .field("X")
        .ok_or_else(|| TbtError::InconsistentShape("measurement has no 'X' field".into()))?;
    let y = matrices
        .field("Y")
        .ok_or_else(|| TbtError::InconsistentShape("measurement has no 'Y' field".into()))?;

    let names_x: Vec<String> = x.index.iter().map(|n| add_plane_suffix(n, "H")).collect();
    let names_y: Vec<String> = y.index.iter().map(|n| add_plane_suffix(n, "V")).collect();
    let mut names = names_x.clone();
    names.extend(names_y.iter().cloned());
    let mut planes = vec![0i32; names_x.len()];
    planes.extend(std::iter::repeat(1).take(names_y.len()));

    let mut entries = Vec::new();
    if let Some(date) = data.meta.date {
        entries.push(SddsEntry::Parameter {
            name: TIMESTAMP.to_string(),
            value: SddsScalar::LLong(date.unix_timestamp_nanos() as i64),
        });
    }
    entries.push(SddsEntry::Parameter {
        name: N_TURNS.to_string(),
        value: SddsScalar::Long(data.nturns as i32),
    });
    entries.push(SddsEntry::Array {
        name: BPM_NAMES.to_string(),
        value: SddsArray::Str(names.clone()),
    });
    entries.push(SddsEntry::Array {
        name: BPM_PLANES.to_string(),
        value: SddsArray::Long(planes),
    });
    for (row, name) in names_x.iter().enumerate() {
        entries.push(SddsEntry::Array {
            name: name.clone(),
            value: SddsArray::Double(x.data.row(row).to_vec()),
        });
    }
    for (row, name) in names_y.iter().enumerate() {
        entries.push(SddsEntry::Array {
            name: name.clone(),
            value: SddsArray::Double(y.data.row(row).to_vec()),
        });
    }

    sdds::write_sdds_file(path, &SddsFile { entries })?;
    Ok(())
}

/// Decide which monitors are vertical.
///
/// When every name ends in `.H`/`.V` the split comes from the names. Only
/// otherwise is the `MonPlanes` array consulted, whose encoding changed over
/// the years: `3` marks vertical in recent files, a plain boolean in older
/// ones.
fn split_monitors_to_planes(
    names: &[String],
    planes: &[i64],
    suffix: &Regex,
) -> Result<Vec<bool>, TbtError> {
    if !names.is_empty() && names.iter().all(|name| suffix.is_match(name)) {
        return Ok(names.iter().map(|name| name.ends_with(".V")).collect());
    }
    log::warn!(
        "could not determine monitor planes from the names, splitting by '{BPM_PLANES}'"
    );
    if planes.len() != names.len() {
        return Err(TbtError::InconsistentShape(format!(
            "'{BPM_PLANES}' lists {} entries for {} monitors",
            planes.len(),
            names.len()
        )));
    }
    if planes.contains(&3) {
        Ok(planes.iter().map(|&p| p == 3).collect())
    } else if planes.contains(&0) {
        Ok(planes.iter().map(|&p| p != 0).collect())
    } else {
        Err(TbtError::MalformedSource(
            "could not determine the file layout to split monitors into planes".into(),
        ))
    }
}

fn plane_suffix() -> Regex {
    Regex::new(r"(?i)\.[HV]$").expect("pattern is valid")
}

fn strip_plane_suffix(suffix: &Regex, name: &str) -> String {
    suffix.replace(name, "").to_string()
}

fn add_plane_suffix(name: &str, plane: &str) -> String {
    if name.ends_with(&format!(".{plane}")) {
        name.to_string()
    } else {
        format!("{name}.{plane}")
    }
}

fn plane_matrix(
    names: Vec<String>,
    rows: Vec<Vec<f64>>,
    nturns: usize,
) -> Result<BpmMatrix, TbtError> {
    let flat: Vec<f64> = rows.into_iter().flatten().collect();
    let data = Array2::from_shape_vec((names.len(), nturns), flat)
        .map_err(|e| TbtError::InconsistentShape(e.to_string()))?;
    BpmMatrix::new(names, data)
}
