//! Reader for turn-by-turn measurement files from the ESRF (Matlab format).
//!
//! The `.mat` file holds the `allx` and `allz` blocks, dimensioned turn x
//! monitor x kick in column-major order. Monitor names are not part of the
//! file; they come from a `bpm_names.json` next to it. Each kick becomes one
//! bunch of the measurement. Considered experimental, like the acquisition
//! side it mirrors.

use std::fs;
use std::path::Path;

use ndarray::Array4;

use super::error::TbtError;
use super::structures::TbtData;
use super::utils;

const BPM_NAMES_FILE: &str = "bpm_names.json";
const HOR_KEY: &str = "allx";
const VER_KEY: &str = "allz";

/// Read an ESRF Matlab measurement file.
pub fn read_tbt(path: &Path) -> Result<TbtData, TbtError> {
    log::debug!("reading ESRF file {}", path.display());
    let mat = matfile::MatFile::parse(fs::File::open(path)?)
        .map_err(|e| TbtError::MalformedSource(format!("cannot parse Matlab file: {e:?}")))?;
    let (hor_dims, hor) = numeric_block(&mat, HOR_KEY)?;
    let (ver_dims, ver) = numeric_block(&mat, VER_KEY)?;
    if hor_dims != ver_dims {
        return Err(TbtError::InconsistentShape(
            "number of turns, monitors or kicks in X and Y do not match".into(),
        ));
    }

    let names_path = path
        .parent()
        .unwrap_or_else(|| Path::new("."))
        .join(BPM_NAMES_FILE);
    let names: Vec<String> = serde_json::from_str(&fs::read_to_string(&names_path)?)
        .map_err(|e| TbtError::MalformedSource(format!("cannot parse monitor names: {e}")))?;

    let mut data = assemble(&hor_dims, &hor, &ver)?;
    if data.dim().1 != names.len() {
        return Err(TbtError::InconsistentShape(format!(
            "file holds {} monitors but {} names were listed",
            data.dim().1,
            names.len()
        )));
    }
    clean_block(&mut data);
    let mut tbt = utils::matrix_to_tbt(&names, data.view())?;
    tbt.meta.file = Some(path.to_path_buf());
    tbt.meta.source_format = Some("esrf".to_string());
    Ok(tbt)
}

/// Reorder the column-major turn x monitor x kick blocks of both planes into
/// one `[plane, monitor, kick, turn]` array.
pub(crate) fn assemble(
    dims: &[usize],
    hor: &[f64],
    ver: &[f64],
) -> Result<Array4<f64>, TbtError> {
    let [nturns, nbpms, nkicks] = match dims {
        &[t, b] => [t, b, 1],
        &[t, b, k] => [t, b, k],
        other => {
            return Err(TbtError::InconsistentShape(format!(
                "expected a 3-dimensional block, got dimensions {other:?}"
            )))
        }
    };
    let expected = nturns * nbpms * nkicks;
    if hor.len() != expected || ver.len() != expected {
        return Err(TbtError::InconsistentShape(format!(
            "block holds {} samples, expected {expected}",
            hor.len()
        )));
    }
    let mut block = Array4::zeros((2, nbpms, nkicks, nturns));
    for (plane, flat) in [hor, ver].into_iter().enumerate() {
        for kick in 0..nkicks {
            for bpm in 0..nbpms {
                for turn in 0..nturns {
                    block[[plane, bpm, kick, turn]] =
                        flat[turn + bpm * nturns + kick * nturns * nbpms];
                }
            }
        }
    }
    Ok(block)
}

/// Zero out unusable kick rows: rows containing NaN samples, and rows that
/// repeat the previous kick unchanged (stale acquisition buffers).
pub(crate) fn clean_block(block: &mut Array4<f64>) {
    let (nplanes, nbpms, nkicks, nturns) = block.dim();
    for plane in 0..nplanes {
        for bpm in 0..nbpms {
            for kick in 0..nkicks {
                if (0..nturns).any(|turn| block[[plane, bpm, kick, turn]].is_nan()) {
                    for turn in 0..nturns {
                        block[[plane, bpm, kick, turn]] = 0.0;
                    }
                }
            }
            // compare against the values before this pass zeroes them
            let mut repeated = vec![false; nkicks];
            for kick in 1..nkicks {
                repeated[kick] = (0..nturns).all(|turn| {
                    block[[plane, bpm, kick, turn]] == block[[plane, bpm, kick - 1, turn]]
                });
            }
            for (kick, flagged) in repeated.into_iter().enumerate() {
                if flagged {
                    for turn in 0..nturns {
                        block[[plane, bpm, kick, turn]] = 0.0;
                    }
                }
            }
        }
    }
}

fn numeric_block(mat: &matfile::MatFile, name: &str) -> Result<(Vec<usize>, Vec<f64>), TbtError> {
    let array = mat
        .find_by_name(name)
        .ok_or_else(|| TbtError::MalformedSource(format!("Matlab entry '{name}' is absent")))?;
    let flat = match array.data() {
        matfile::NumericData::Double { real, .. } => real.clone(),
        matfile::NumericData::Single { real, .. } => real.iter().map(|&v| v as f64).collect(),
        _ => {
            return Err(TbtError::MalformedSource(format!(
                "Matlab entry '{name}' is not a floating point block"
            )))
        }
    };
    Ok((array.size().to_vec(), flat))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assemble_reorders_column_major_data() {
        // 2 turns, 2 monitors, 2 kicks
        let dims = [2, 2, 2];
        let hor: Vec<f64> = (0..8).map(|v| v as f64).collect();
        let ver: Vec<f64> = (0..8).map(|v| v as f64 + 100.0).collect();
        let block = assemble(&dims, &hor, &ver).unwrap();
        assert_eq!(block.dim(), (2, 2, 2, 2));
        // flat index = turn + bpm * 2 + kick * 4
        assert_eq!(block[[0, 0, 0, 1]], 1.0);
        assert_eq!(block[[0, 1, 0, 0]], 2.0);
        assert_eq!(block[[0, 0, 1, 0]], 4.0);
        assert_eq!(block[[1, 1, 1, 1]], 107.0);
    }

    #[test]
    fn assemble_rejects_wrong_sample_count() {
        assert!(matches!(
            assemble(&[2, 2, 2], &[0.0; 7], &[0.0; 8]),
            Err(TbtError::InconsistentShape(_))
        ));
    }

    #[test]
    fn nan_rows_are_zeroed() {
        let mut block = Array4::from_elem((1, 1, 1, 3), 1.0);
        block[[0, 0, 0, 1]] = f64::NAN;
        clean_block(&mut block);
        assert_eq!(block, Array4::<f64>::zeros((1, 1, 1, 3)));
    }

    #[test]
    fn repeated_kick_rows_are_zeroed() {
        let mut block = Array4::zeros((1, 1, 3, 2));
        for kick in 0..3 {
            block[[0, 0, kick, 0]] = 1.0;
            block[[0, 0, kick, 1]] = 2.0;
        }
        block[[0, 0, 2, 1]] = 5.0; // third kick differs
        clean_block(&mut block);
        // first kick kept, identical second kick dropped, third kept
        assert_eq!(block[[0, 0, 0, 1]], 2.0);
        assert_eq!(block[[0, 0, 1, 0]], 0.0);
        assert_eq!(block[[0, 0, 1, 1]], 0.0);
        assert_eq!(block[[0, 0, 2, 1]], 5.0);
    }
}
