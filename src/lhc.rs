//! Reader and writer for LHC turn-by-turn acquisition files.
//!
//! The binary flavour is an SDDS page whose arrays hold the concatenated
//! positions of all monitors, bunches and turns per plane. Files that do not
//! carry the SDDS version tag are handed over to the legacy ASCII reader,
//! which the acquisition system produced before the binary format.

use std::fs::File;
use std::io::Read;
use std::path::Path;

use ndarray::Array2;
use time::OffsetDateTime;

use super::ascii;
use super::error::TbtError;
use super::sdds::{self, SddsArray, SddsEntry, SddsFile, SddsScalar};
use super::structures::{BpmMatrix, BunchMatrices, Meta, TbtData, TransverseData};

const N_BUNCHES: &str = "nbOfCapBunches";
const N_TURNS: &str = "nbOfCapTurns";
const BUNCH_ID: &str = "BunchId";
const HOR_BUNCH_ID: &str = "horBunchId"; // older acquisitions only wrote the per-plane list
const ACQ_STAMP: &str = "acqStamp";
const BPM_NAMES: &str = "bpmNames";
const HOR_POSITIONS: &str = "horPositionsConcentratedAndSorted";
const VER_POSITIONS: &str = "verPositionsConcentratedAndSorted";

/// Read an LHC measurement file, binary SDDS or legacy ASCII.
pub fn read_tbt(path: &Path) -> Result<TbtData, TbtError> {
    if !is_binary_sdds(path)? {
        log::debug!("file {} is not binary SDDS, reading as ASCII", path.display());
        return ascii::read_tbt(path);
    }
    log::debug!("reading binary SDDS file {}", path.display());
    let sdds = sdds::read_sdds_file(path)?;

    let nbunches = required_scalar(&sdds, N_BUNCHES)? as usize;
    let nturns = required_scalar(&sdds, N_TURNS)? as usize;
    let names = sdds
        .array_str(BPM_NAMES)
        .ok_or_else(|| missing(BPM_NAMES))?
        .to_vec();
    let nbpms = names.len();

    let mut bunch_ids: Vec<usize> = sdds
        .array_i64(BUNCH_ID)
        .or_else(|| sdds.array_i64(HOR_BUNCH_ID))
        .ok_or_else(|| missing(BUNCH_ID))?
        .iter()
        .map(|&id| id as usize)
        .collect();
    if bunch_ids.len() > nbunches {
        bunch_ids.truncate(nbunches);
    }

    let hor = plane_block(&sdds, HOR_POSITIONS, nbpms, nbunches, nturns)?;
    let ver = plane_block(&sdds, VER_POSITIONS, nbpms, nbunches, nturns)?;

    let mut matrices = Vec::with_capacity(nbunches);
    for bunch in 0..nbunches {
        let slice = |flat: &[f64]| -> Result<BpmMatrix, TbtError> {
            let mut data = Array2::zeros((nbpms, nturns));
            for bpm in 0..nbpms {
                for turn in 0..nturns {
                    data[[bpm, turn]] = flat[(bpm * nbunches + bunch) * nturns + turn];
                }
            }
            BpmMatrix::new(names.clone(), data)
        };
        matrices.push(BunchMatrices::Transverse(TransverseData::new(
            slice(&hor)?,
            slice(&ver)?,
        )?));
    }

    let date = sdds
        .scalar_i64(ACQ_STAMP)
        .and_then(|nanoseconds| OffsetDateTime::from_unix_timestamp_nanos(nanoseconds as i128).ok());
    let meta = Meta {
        date,
        file: Some(path.to_path_buf()),
        source_format: Some("lhc".to_string()),
        ..Meta::default()
    };
    TbtData::new(matrices, nturns, Some(bunch_ids), meta)
}

/// Write a measurement as a binary SDDS page in the LHC layout.
///
/// Positions go to the wire as the acquisition system's single-precision
/// arrays; a write/read cycle is exact up to that width.
pub fn write_tbt(path: &Path, data: &TbtData) -> Result<(), TbtError> {
    let names = shared_monitor_names(data)?;
    let nbpms = names.len();
    let nbunches = data.nbunches();
    let nturns = data.nturns;

    let flatten = |field: &str| -> Result<Vec<f64>, TbtError> {
        let mut flat = vec![0.0; nbpms * nbunches * nturns];
        for (bunch, matrices) in data.matrices.iter().enumerate() {
            let table = matrices.field(field).ok_or_else(|| {
                TbtError::InconsistentShape(format!("bunch {bunch} has no '{field}' field"))
            })?;
            if table.data.dim() != (nbpms, nturns) {
                return Err(TbtError::InconsistentShape(format!(
                    "bunch {bunch} field '{field}' has shape {:?}, expected ({nbpms}, {nturns})",
                    table.data.dim()
                )));
            }
            for bpm in 0..nbpms {
                for turn in 0..nturns {
                    flat[(bpm * nbunches + bunch) * nturns + turn] = table.data[[bpm, turn]];
                }
            }
        }
        Ok(flat)
    };

    let mut entries = Vec::new();
    if let Some(date) = data.meta.date {
        entries.push(SddsEntry::Parameter {
            name: ACQ_STAMP.to_string(),
            value: SddsScalar::LLong(date.unix_timestamp_nanos() as i64),
        });
    }
    entries.push(SddsEntry::Parameter {
        name: N_BUNCHES.to_string(),
        value: SddsScalar::Long(nbunches as i32),
    });
    entries.push(SddsEntry::Parameter {
        name: N_TURNS.to_string(),
        value: SddsScalar::Long(nturns as i32),
    });
    entries.push(SddsEntry::Array {
        name: BUNCH_ID.to_string(),
        value: SddsArray::Long(data.bunch_ids.iter().map(|&id| id as i32).collect()),
    });
    entries.push(SddsEntry::Array {
        name: BPM_NAMES.to_string(),
        value: SddsArray::Str(names),
    });
    entries.push(SddsEntry::Array {
        name: HOR_POSITIONS.to_string(),
        value: SddsArray::Float(flatten("X")?.into_iter().map(|v| v as f32).collect()),
    });
    entries.push(SddsEntry::Array {
        name: VER_POSITIONS.to_string(),
        value: SddsArray::Float(flatten("Y")?.into_iter().map(|v| v as f32).collect()),
    });

    sdds::write_sdds_file(path, &SddsFile { entries })?;
    Ok(())
}

/// The monitor names all bunches must share in this format.
pub(crate) fn shared_monitor_names(data: &TbtData) -> Result<Vec<String>, TbtError> {
    let first = data
        .matrices
        .first()
        .and_then(|m| m.field("X"))
        .ok_or_else(|| TbtError::InconsistentShape("measurement holds no matrices".into()))?;
    for (bunch, matrices) in data.matrices.iter().enumerate().skip(1) {
        let index = matrices
            .field("X")
            .map(|table| &table.index)
            .ok_or_else(|| {
                TbtError::InconsistentShape(format!("bunch {bunch} has no 'X' field"))
            })?;
        if index != &first.index {
            return Err(TbtError::InconsistentShape(format!(
                "bunch {bunch} lists different monitors than bunch 0"
            )));
        }
    }
    Ok(first.index.clone())
}

fn is_binary_sdds(path: &Path) -> Result<bool, TbtError> {
    let mut file = File::open(path)?;
    let mut tag = [0u8; 5];
    Ok(matches!(file.read_exact(&mut tag), Ok(())) && &tag == b"SDDS1")
}

fn plane_block(
    sdds: &SddsFile,
    key: &str,
    nbpms: usize,
    nbunches: usize,
    nturns: usize,
) -> Result<Vec<f64>, TbtError> {
    let flat = sdds.array_f64(key).ok_or_else(|| missing(key))?;
    let expected = nbpms * nbunches * nturns;
    if flat.len() != expected {
        return Err(TbtError::InconsistentShape(format!(
            "array '{key}' has {} samples, expected {nbpms} monitors x {nbunches} bunches x {nturns} turns = {expected}",
            flat.len()
        )));
    }
    Ok(flat)
}

fn required_scalar(sdds: &SddsFile, key: &str) -> Result<i64, TbtError> {
    sdds.scalar_i64(key).ok_or_else(|| missing(key))
}

fn missing(key: &str) -> TbtError {
    TbtError::MalformedSource(format!("required SDDS entry '{key}' is absent"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array;
    use time::macros::datetime;

    fn oscillation_data(nbpms: usize, nturns: usize, phase: f64) -> Array2<f64> {
        let turns = Array::linspace(0.0, (nturns - 1) as f64, nturns);
        let mut data = Array2::zeros((nbpms, nturns));
        for (i, mut row) in data.rows_mut().into_iter().enumerate() {
            row.assign(&turns.mapv(|t| (0.31 * t + phase + i as f64).sin()));
        }
        data
    }

    fn measurement(nbunches: usize, nturns: usize) -> TbtData {
        let names: Vec<String> = (1..=4).map(|i| format!("TBPM{i}")).collect();
        let matrices = (0..nbunches)
            .map(|bunch| {
                BunchMatrices::Transverse(
                    TransverseData::new(
                        BpmMatrix::new(names.clone(), oscillation_data(4, nturns, bunch as f64))
                            .unwrap(),
                        BpmMatrix::new(names.clone(), oscillation_data(4, nturns, 0.5 + bunch as f64))
                            .unwrap(),
                    )
                    .unwrap(),
                )
            })
            .collect();
        TbtData::new(
            matrices,
            nturns,
            Some((0..nbunches).map(|b| 10 * b + 1).collect()),
            Meta {
                date: Some(datetime!(2020-01-01 12:00:00 UTC)),
                ..Meta::default()
            },
        )
        .unwrap()
    }

    /// Exact comparison at the wire's single precision.
    fn assert_wire_exact(read: &TbtData, origin: &TbtData) {
        for (got, want) in read.matrices.iter().zip(&origin.matrices) {
            for field in got.fieldnames() {
                let got = got.field(field).unwrap();
                let want = want.field(field).unwrap();
                assert_eq!(got.index, want.index);
                for (a, b) in got.data.iter().zip(want.data.iter()) {
                    assert_eq!(*a, *b as f32 as f64);
                }
            }
        }
    }

    #[test]
    fn binary_round_trip_is_exact_at_wire_precision() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("acq.sdds");
        let origin = measurement(1, 2000);
        write_tbt(&path, &origin).unwrap();
        let read = read_tbt(&path).unwrap();
        assert_wire_exact(&read, &origin);
        assert_eq!(read.nturns, 2000);
        assert_eq!(read.bunch_ids, origin.bunch_ids);
        assert_eq!(read.meta.date, origin.meta.date);
    }

    #[test]
    fn multibunch_round_trip_keeps_bunch_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("multi.sdds");
        let origin = measurement(3, 50);
        write_tbt(&path, &origin).unwrap();
        let read = read_tbt(&path).unwrap();
        assert_eq!(read.nbunches(), 3);
        assert_eq!(read.bunch_ids, vec![1, 11, 21]);
        assert_wire_exact(&read, &origin);
    }

    #[test]
    fn surplus_bunch_ids_are_truncated() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ids.sdds");
        let origin = measurement(1, 10);
        write_tbt(&path, &origin).unwrap();
        // rewrite the page with an overlong id list
        let mut sdds = sdds::read_sdds_file(&path).unwrap();
        for entry in &mut sdds.entries {
            if let SddsEntry::Array { name, value } = entry {
                if name == BUNCH_ID {
                    *value = SddsArray::Long(vec![7, 8, 9]);
                }
            }
        }
        sdds::write_sdds_file(&path, &sdds).unwrap();
        let read = read_tbt(&path).unwrap();
        assert_eq!(read.bunch_ids, vec![7]);
    }

    #[test]
    fn bunch_ids_fall_back_to_the_horizontal_key() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hor_ids.sdds");
        let origin = measurement(2, 10);
        write_tbt(&path, &origin).unwrap();
        // rewrite the page as an older acquisition would have stored it
        let mut sdds = sdds::read_sdds_file(&path).unwrap();
        for entry in &mut sdds.entries {
            if let SddsEntry::Array { name, .. } = entry {
                if name == BUNCH_ID {
                    *name = HOR_BUNCH_ID.to_string();
                }
            }
        }
        sdds::write_sdds_file(&path, &sdds).unwrap();
        let read = read_tbt(&path).unwrap();
        assert_eq!(read.bunch_ids, vec![1, 11]);
    }

    #[test]
    fn wrong_sample_count_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cut.sdds");
        let origin = measurement(1, 10);
        write_tbt(&path, &origin).unwrap();
        let mut sdds = sdds::read_sdds_file(&path).unwrap();
        for entry in &mut sdds.entries {
            if let SddsEntry::Array { name, value } = entry {
                if name == HOR_POSITIONS {
                    *value = SddsArray::Double(vec![0.0; 7]);
                }
            }
        }
        sdds::write_sdds_file(&path, &sdds).unwrap();
        assert!(matches!(
            read_tbt(&path),
            Err(TbtError::InconsistentShape(_))
        ));
    }

    #[test]
    fn missing_bpm_names_is_malformed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nonames.sdds");
        let origin = measurement(1, 10);
        write_tbt(&path, &origin).unwrap();
        let mut sdds = sdds::read_sdds_file(&path).unwrap();
        sdds.entries.retain(|entry| {
            !matches!(entry, SddsEntry::Array { name, .. } if name == BPM_NAMES)
        });
        sdds::write_sdds_file(&path, &sdds).unwrap();
        assert!(matches!(read_tbt(&path), Err(TbtError::MalformedSource(_))));
    }
}
