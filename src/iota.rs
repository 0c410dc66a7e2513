//! Reader for turn-by-turn measurement files from IOTA (HDF5).
//!
//! Two layout versions exist. Version 1 stores one dataset per monitor and
//! plane, the plane encoded as a trailing `H`/`V` in the key. Version 2
//! stores one group per monitor holding `Horizontal` and `Vertical`
//! datasets. Monitor arrays may differ in length; everything is truncated to
//! the shortest one so the matrices stay rectangular.

use std::path::Path;

use ndarray::Array2;

use super::error::TbtError;
use super::structures::{BpmMatrix, BunchMatrices, Meta, TbtData, TransverseData};

/// The two layout versions of the IOTA HDF5 files.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Version {
    One,
    Two,
}

/// Read an IOTA measurement file of the given layout version.
pub fn read_tbt(path: &Path, version: Version) -> Result<TbtData, TbtError> {
    log::debug!("reading IOTA file {}", path.display());
    let file = hdf5::File::open(path)?;
    let keys = file.member_names()?;

    let monitor_names = unique_in_order(
        keys.iter()
            .filter(|key| is_monitor_key(version, key, None))
            .map(|key| monitor_name(version, key)),
    );
    if monitor_names.is_empty() {
        return Err(TbtError::MalformedSource(format!(
            "no monitor entries found, wrong layout version for file {}",
            path.display()
        )));
    }

    let x_keys: Vec<&String> = keys
        .iter()
        .filter(|key| is_monitor_key(version, key, Some("X")))
        .collect();
    let y_keys: Vec<&String> = keys
        .iter()
        .filter(|key| is_monitor_key(version, key, Some("Y")))
        .collect();
    if x_keys.len() != monitor_names.len() || y_keys.len() != monitor_names.len() {
        return Err(TbtError::InconsistentShape(format!(
            "found {} monitors but {} horizontal and {} vertical entries",
            monitor_names.len(),
            x_keys.len(),
            y_keys.len()
        )));
    }

    // maximum common turn count over all monitors and planes
    let mut nturns = usize::MAX;
    for (keys, plane) in [(&x_keys, "X"), (&y_keys, "Y")] {
        for key in keys.iter() {
            nturns = nturns.min(read_samples(&file, version, key, plane)?.len());
        }
    }

    let plane_matrix = |keys: &[&String], plane: &str| -> Result<BpmMatrix, TbtError> {
        let mut data = Array2::zeros((monitor_names.len(), nturns));
        for (row, key) in keys.iter().enumerate() {
            let samples = read_samples(&file, version, key, plane)?;
            for (turn, value) in samples.iter().take(nturns).enumerate() {
                data[[row, turn]] = *value;
            }
        }
        BpmMatrix::new(monitor_names.clone(), data)
    };

    let matrices = BunchMatrices::Transverse(TransverseData::new(
        plane_matrix(&x_keys, "X")?,
        plane_matrix(&y_keys, "Y")?,
    )?);
    let meta = Meta {
        file: Some(path.to_path_buf()),
        source_format: Some("iota".to_string()),
        ..Meta::default()
    };
    TbtData::new(vec![matrices], nturns, Some(vec![1]), meta)
}

fn read_samples(
    file: &hdf5::File,
    version: Version,
    key: &str,
    plane: &str,
) -> Result<Vec<f64>, TbtError> {
    let samples = match version {
        // the plane is already part of the key
        Version::One => file.dataset(key)?.read_1d::<f64>()?,
        Version::Two => {
            let dataset = if plane == "X" { "Horizontal" } else { "Vertical" };
            file.group(key)?.dataset(dataset)?.read_1d::<f64>()?
        }
    };
    Ok(samples.to_vec())
}

fn is_monitor_key(version: Version, key: &str, plane: Option<&str>) -> bool {
    match version {
        Version::One => {
            let is_monitor = !key.contains("state") || key.starts_with("N:");
            match plane {
                None => is_monitor && (key.ends_with('H') || key.ends_with('V')),
                Some("X") => is_monitor && key.ends_with('H'),
                Some(_) => is_monitor && key.ends_with('V'),
            }
        }
        // the second clause filters version 1 entries out, to be safe
        Version::Two => !key.contains("NL") && !key.starts_with("N:"),
    }
}

fn monitor_name(version: Version, key: &str) -> String {
    match version {
        Version::One => {
            let inner: String = key.chars().skip(4).collect();
            let inner = &inner[..inner.len().saturating_sub(1)];
            format!("IBPM{inner}")
        }
        Version::Two => format!("IBPM{key}"),
    }
}

fn unique_in_order(names: impl Iterator<Item = String>) -> Vec<String> {
    let mut seen = Vec::new();
    for name in names {
        if !seen.contains(&name) {
            seen.push(name);
        }
    }
    seen
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_v1_fixture(path: &Path) {
        let file = hdf5::File::create(path).unwrap();
        for (key, offset) in [
            ("N:IBA1RH", 0.0),
            ("N:IBA1RV", 10.0),
            ("N:IBB2LH", 20.0),
            ("N:IBB2LV", 30.0),
        ] {
            let samples: Vec<f64> = (0..6).map(|t| offset + t as f64).collect();
            file.new_dataset_builder()
                .with_data(&samples)
                .create(key)
                .unwrap();
        }
    }

    fn write_v2_fixture(path: &Path, lengths: [usize; 2]) {
        let file = hdf5::File::create(path).unwrap();
        for (key, length) in ["A1R", "B2L"].iter().zip(lengths) {
            let group = file.create_group(key).unwrap();
            let samples: Vec<f64> = (0..length).map(|t| t as f64).collect();
            group
                .new_dataset_builder()
                .with_data(&samples)
                .create("Horizontal")
                .unwrap();
            group
                .new_dataset_builder()
                .with_data(&samples)
                .create("Vertical")
                .unwrap();
        }
    }

    #[test]
    fn version_one_maps_keys_to_monitor_names() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("iota1.h5");
        write_v1_fixture(&path);
        let read = read_tbt(&path, Version::One).unwrap();
        let x = read.matrices[0].field("X").unwrap();
        assert_eq!(x.index, vec!["IBPMA1R".to_string(), "IBPMB2L".to_string()]);
        assert_eq!(read.nturns, 6);
        assert_eq!(read.bunch_ids, vec![1]);
        assert_eq!(x.data[[1, 3]], 23.0);
        assert_eq!(read.matrices[0].field("Y").unwrap().data[[0, 0]], 10.0);
    }

    #[test]
    fn version_two_truncates_to_common_turns() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("iota2.h5");
        write_v2_fixture(&path, [9, 6]);
        let read = read_tbt(&path, Version::Two).unwrap();
        assert_eq!(read.nturns, 6);
        let x = read.matrices[0].field("X").unwrap();
        assert_eq!(x.index, vec!["IBPMA1R".to_string(), "IBPMB2L".to_string()]);
        assert_eq!(x.data.dim(), (2, 6));
    }

    #[test]
    fn wrong_version_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("iota1.h5");
        write_v1_fixture(&path);
        // version 1 keys all start with "N:", which version 2 filters out
        assert!(matches!(
            read_tbt(&path, Version::Two),
            Err(TbtError::MalformedSource(_))
        ));
    }
}
