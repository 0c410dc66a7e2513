//! Reader for MAD-X `trackone` tracking output.
//!
//! Same segment-text layout as the PTC output, but every data line carries
//! the full 6-D phase space plus the longitudinal position and the energy.
//! The default read exposes the planar view (x, y); the full eight-field
//! tracking view is available separately.

use std::fs;
use std::path::Path;

use fxhash::FxHashMap;
use ndarray::{Array4, s};

use super::error::TbtError;
use super::structures::{TbtData, TRACKING_FIELDS};
use super::utils;

const SEGMENTS: &str = "#segment";

/// Read a `trackone` file as transverse positions per particle.
pub fn read_tbt(path: &Path) -> Result<TbtData, TbtError> {
    let (names, block) = read_structure(path)?;
    // keep only the x and y rows of the phase space
    let mut planar = Array4::zeros((2, block.dim().1, block.dim().2, block.dim().3));
    planar.slice_mut(s![0, .., .., ..]).assign(&block.slice(s![0, .., .., ..]));
    planar.slice_mut(s![1, .., .., ..]).assign(&block.slice(s![2, .., .., ..]));
    finish(path, names, planar)
}

/// Read a `trackone` file with all eight phase-space fields per particle.
pub fn read_tbt_tracking(path: &Path) -> Result<TbtData, TbtError> {
    let (names, block) = read_structure(path)?;
    finish(path, names, block)
}

fn finish(path: &Path, names: Vec<String>, block: Array4<f64>) -> Result<TbtData, TbtError> {
    let mut tbt = utils::matrix_to_tbt(&names, block.view())?;
    tbt.meta.file = Some(path.to_path_buf());
    tbt.meta.source_format = Some("trackone".to_string());
    Ok(tbt)
}

/// Determine the number of turns and particles from the opening segment.
///
/// A lone `-1` line marks single-particle output regardless of the segment
/// header.
pub(crate) fn get_trackone_stats(path: &Path) -> Result<(usize, usize), TbtError> {
    let content = fs::read_to_string(path)?;
    let mut nturns = 0usize;
    let mut nparticles = 0usize;
    let mut first_segment = true;
    for line in content.lines() {
        let parts: Vec<&str> = line.split_whitespace().collect();
        let Some(&first) = parts.first() else {
            continue;
        };
        if ["@", "*", "$"].contains(&first) {
            continue;
        }
        if first == SEGMENTS {
            if !first_segment {
                break;
            }
            if parts.len() < 4 {
                return Err(TbtError::MalformedSource(format!(
                    "segment line holds {} fields, expected at least 4",
                    parts.len()
                )));
            }
            nturns = parse_count(parts[2])?;
            nparticles = parse_count(parts[3])?;
            first_segment = false;
        }
        if first == "-1" {
            nparticles = 1;
        }
    }
    Ok((nturns.saturating_sub(1), nparticles))
}

/// Extract the observation point names and the phase-space block, indexed
/// `[field, observation point, particle, turn]` in the field order of
/// [`TRACKING_FIELDS`].
fn read_structure(path: &Path) -> Result<(Vec<String>, Array4<f64>), TbtError> {
    log::debug!("reading trackone file {}", path.display());
    let (nturns, nparticles) = get_trackone_stats(path)?;
    if nturns == 0 || nparticles == 0 {
        return Err(TbtError::MalformedSource(
            "no tracked turns or particles declared in file".into(),
        ));
    }

    let content = fs::read_to_string(path)?;
    let mut names: Vec<String> = Vec::new();
    let mut rows: FxHashMap<String, usize> = FxHashMap::default();
    let mut block: Option<Array4<f64>> = None;
    let mut current: Option<usize> = None; // row of the active observation point

    for line in content.lines() {
        let parts: Vec<&str> = line.split_whitespace().collect();
        let Some(&first) = parts.first() else {
            continue;
        };
        if ["@", "*", "$"].contains(&first) {
            continue;
        }
        if first == SEGMENTS {
            let name = parts[parts.len() - 1].to_uppercase();
            let lowered = name.to_lowercase();
            if lowered.contains("start") || lowered.contains("end") {
                current = None;
                continue;
            }
            let row = *rows.entry(name.clone()).or_insert_with(|| {
                names.push(name);
                names.len() - 1
            });
            current = Some(row);
            continue;
        }
        let Some(row) = current else {
            continue;
        };
        if parts.len() < 2 + TRACKING_FIELDS.len() {
            return Err(TbtError::MalformedSource(format!(
                "data line holds {} fields, expected {}",
                parts.len(),
                2 + TRACKING_FIELDS.len()
            )));
        }
        let particle = parse_float(parts[0])?.abs() as usize;
        let turn = parse_float(parts[1])? as usize;
        let (Some(particle), Some(turn)) = (particle.checked_sub(1), turn.checked_sub(1)) else {
            continue; // pre-tracking state at turn 0
        };
        if particle >= nparticles || turn >= nturns {
            return Err(TbtError::InconsistentShape(format!(
                "sample for particle {} at turn {} exceeds the declared {nparticles} particles and {nturns} turns",
                particle + 1,
                turn + 1
            )));
        }
        let block = block.get_or_insert_with(|| {
            Array4::zeros((TRACKING_FIELDS.len(), 0, nparticles, nturns))
        });
        if block.dim().1 < names.len() {
            let mut grown = Array4::zeros((TRACKING_FIELDS.len(), names.len(), nparticles, nturns));
            grown
                .slice_mut(s![.., ..block.dim().1, .., ..])
                .assign(block);
            *block = grown;
        }
        for (field, part) in parts[2..2 + TRACKING_FIELDS.len()].iter().enumerate() {
            block[[field, row, particle, turn]] = parse_float(part)?;
        }
    }

    let block = block.ok_or_else(|| {
        TbtError::MalformedSource("no observation point data found in file".into())
    })?;
    if block.dim().1 != names.len() {
        return Err(TbtError::InconsistentShape(format!(
            "found {} observation points but data for {}",
            names.len(),
            block.dim().1
        )));
    }
    Ok((names, block))
}

fn parse_count(field: &str) -> Result<usize, TbtError> {
    field
        .parse::<usize>()
        .map_err(|_| TbtError::MalformedSource(format!("cannot parse segment field '{field}'")))
}

fn parse_float(field: &str) -> Result<f64, TbtError> {
    field
        .parse::<f64>()
        .map_err(|_| TbtError::MalformedSource(format!("cannot parse value '{field}'")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::structures::BunchMatrices;

    const FILE: &str = "\
@ NAME %s \"TRACKONE\"
* NUMBER TURN X PX Y PY T PT S E
$ %d %d %le %le %le %le %le %le %le %le
#segment 1 3 2 4 start
#segment 2 3 2 4 bpm1
 1 1 0.001 0.1 -0.002 0.2 0.3 0.4 0.5 1.0
 2 1 0.003 0.1 -0.004 0.2 0.3 0.4 0.5 1.0
 1 2 0.005 0.1 -0.006 0.2 0.3 0.4 0.5 1.0
 2 2 0.007 0.1 -0.008 0.2 0.3 0.4 0.5 1.0
#segment 3 3 2 4 bpm2
 1 1 0.011 0.1 -0.012 0.2 0.3 0.4 0.5 1.0
 2 1 0.013 0.1 -0.014 0.2 0.3 0.4 0.5 1.0
 1 2 0.015 0.1 -0.016 0.2 0.3 0.4 0.5 1.0
 2 2 0.017 0.1 -0.018 0.2 0.3 0.4 0.5 1.0
#segment 4 3 2 4 end
";

    fn fixture(content: &str) -> (tempfile::TempDir, std::path::PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trackone");
        fs::write(&path, content).unwrap();
        (dir, path)
    }

    #[test]
    fn stats_come_from_the_first_segment() {
        let (_dir, path) = fixture(FILE);
        assert_eq!(get_trackone_stats(&path).unwrap(), (2, 2));
    }

    #[test]
    fn lone_particle_marker_overrides_the_count() {
        let marked = FILE.replace(
            "#segment 2 3 2 4 bpm1",
            "-1\n#segment 2 3 2 4 bpm1",
        );
        let (_dir, path) = fixture(&marked);
        assert_eq!(get_trackone_stats(&path).unwrap(), (2, 1));
    }

    #[test]
    fn planar_read_keeps_x_and_y() {
        let (_dir, path) = fixture(FILE);
        let read = read_tbt(&path).unwrap();
        assert_eq!(read.nturns, 2);
        assert_eq!(read.nbunches(), 2);
        let x = read.matrices[0].field("X").unwrap();
        assert_eq!(x.index, vec!["BPM1".to_string(), "BPM2".to_string()]);
        assert_eq!(x.data[[1, 1]], 0.015);
        let y = read.matrices[1].field("Y").unwrap();
        assert_eq!(y.data[[0, 0]], -0.004);
        assert!(read.matrices[0].field("PX").is_none());
    }

    #[test]
    fn tracking_read_keeps_all_fields() {
        let (_dir, path) = fixture(FILE);
        let read = read_tbt_tracking(&path).unwrap();
        assert!(matches!(read.matrices[0], BunchMatrices::Tracking(_)));
        assert_eq!(read.matrices[0].field("PT").unwrap().data[[0, 0]], 0.4);
        assert_eq!(read.matrices[1].field("E").unwrap().data[[1, 1]], 1.0);
    }

    #[test]
    fn out_of_bounds_particle_is_rejected() {
        let extended = FILE.replace(
            "#segment 4 3 2 4 end",
            "#segment 4 3 2 4 bpm3\n 5 1 0.0 0.0 0.0 0.0 0.0 0.0 0.0 1.0",
        );
        let (_dir, path) = fixture(&extended);
        assert!(matches!(
            read_tbt(&path),
            Err(TbtError::InconsistentShape(_))
        ));
    }
}
