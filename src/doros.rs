//! Reader and writer for DOROS BPM files from the LHC (HDF5).
//!
//! Besides an unused `METADATA` entry, the file holds one group per monitor
//! with microsecond timestamps (`acqStamp`, `bstTimestamp`) and two data
//! kinds side by side: orbit positions, the beam position per turn averaged
//! over all bunches, and oscillation data. Each kind carries its own sample
//! count. Only one kind is read at a time; the writer fills the sibling
//! kind's entries with the acquisition system's placeholder values.

use std::ffi::CString;
use std::path::Path;

use hdf5::globals::H5P_FILE_CREATE;
use hdf5_sys::h5f::{H5Fclose, H5Fcreate, H5F_ACC_TRUNC};
use hdf5_sys::h5p::{
    H5Pclose, H5Pcreate, H5Pset_link_creation_order, H5P_CRT_ORDER_INDEXED, H5P_CRT_ORDER_TRACKED,
    H5P_DEFAULT,
};
use ndarray::Array2;
use time::OffsetDateTime;

use super::error::TbtError;
use super::structures::{BpmMatrix, BunchMatrices, Meta, TbtData, TransverseData};

const DEFAULT_BUNCH_ID: usize = 0; // not stored in the file
const METADATA: &str = "METADATA";
const BST_TIMESTAMP: &str = "bstTimestamp"; // microseconds
const ACQ_STAMP: &str = "acqStamp"; // microseconds
const OSCILLATION_FILLER: f64 = -1.0; // from the FESA class

/// Which of the two data kinds of a DOROS file to access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataKind {
    Positions,
    Oscillations,
}

impl DataKind {
    fn n_samples_key(self) -> &'static str {
        match self {
            DataKind::Positions => "nbOrbitSamplesRead",
            DataKind::Oscillations => "nbOscillationSamplesRead",
        }
    }

    fn plane_key(self, field: &str) -> &'static str {
        match (self, field) {
            (DataKind::Positions, "X") => "horPositions",
            (DataKind::Positions, _) => "verPositions",
            (DataKind::Oscillations, "X") => "horOscillationData",
            (DataKind::Oscillations, _) => "verOscillationData",
        }
    }

    fn sibling(self) -> DataKind {
        match self {
            DataKind::Positions => DataKind::Oscillations,
            DataKind::Oscillations => DataKind::Positions,
        }
    }
}

/// Read one data kind from a DOROS file.
pub fn read_tbt(path: &Path, kind: DataKind) -> Result<TbtData, TbtError> {
    log::debug!("reading DOROS file {}", path.display());
    let file = hdf5::File::open(path)?;

    let monitors: Vec<String> = ordered_member_names(&file)?
        .into_iter()
        .filter(|name| {
            name != METADATA
                && file
                    .group(name)
                    .map(|group| group.link_exists(kind.n_samples_key()))
                    .unwrap_or(false)
        })
        .collect();
    log::debug!("found monitors in DOROS file: {monitors:?}");
    if monitors.is_empty() {
        return Err(TbtError::MalformedSource(
            "no monitor groups with sample counts found".into(),
        ));
    }

    let nturns = check_data_lengths(&file, kind, &monitors)?;

    let mut time_stamps = Vec::with_capacity(monitors.len());
    for monitor in &monitors {
        let group = file.group(monitor)?;
        if group.link_exists(ACQ_STAMP) {
            let stamp = group.dataset(ACQ_STAMP)?.read_1d::<f64>()?;
            if let Some(&first) = stamp.first() {
                time_stamps.push(first);
            }
        }
    }
    let date = time_stamps
        .iter()
        .copied()
        .fold(None::<f64>, |acc, stamp| {
            Some(acc.map_or(stamp, |m| m.min(stamp)))
        })
        .and_then(|microseconds| {
            OffsetDateTime::from_unix_timestamp_nanos(microseconds as i128 * 1_000).ok()
        });

    let plane = |field: &str| -> Result<BpmMatrix, TbtError> {
        let mut data = Array2::zeros((monitors.len(), nturns));
        for (row, monitor) in monitors.iter().enumerate() {
            let samples = file
                .group(monitor)?
                .dataset(kind.plane_key(field))?
                .read_1d::<f64>()?;
            data.row_mut(row)
                .assign(&samples.slice(ndarray::s![..nturns]));
        }
        BpmMatrix::new(monitors.clone(), data)
    };

    let matrices = BunchMatrices::Transverse(TransverseData::new(plane("X")?, plane("Y")?)?);
    let meta = Meta {
        date,
        file: Some(path.to_path_buf()),
        source_format: Some(match kind {
            DataKind::Positions => "doros_positions".to_string(),
            DataKind::Oscillations => "doros_oscillations".to_string(),
        }),
        ..Meta::default()
    };
    TbtData::new(
        vec![matrices],
        nturns,
        Some(vec![DEFAULT_BUNCH_ID]),
        meta,
    )
}

/// Write a single-bunch measurement as one data kind of a DOROS file.
pub fn write_tbt(path: &Path, data: &TbtData, kind: DataKind) -> Result<(), TbtError> {
    log::debug!("writing DOROS file {}", path.display());
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
    if x.index != y.index {
        return Err(TbtError::InconsistentShape(
            "the planes list different monitors".into(),
        ));
    }

    let file = create_order_tracked(path)?;
    file.create_group(METADATA)?;
    let sibling = kind.sibling();
    for (row, monitor) in x.index.iter().enumerate() {
        let group = file.create_group(monitor)?;
        if let Some(date) = data.meta.date {
            let microseconds = (date.unix_timestamp_nanos() / 1_000) as f64;
            group
                .new_dataset_builder()
                .with_data(&[microseconds])
                .create(ACQ_STAMP)?;
            group
                .new_dataset_builder()
                .with_data(&[microseconds])
                .create(BST_TIMESTAMP)?;
        }

        group
            .new_dataset_builder()
            .with_data(&[data.nturns as i64])
            .create(kind.n_samples_key())?;
        group
            .new_dataset_builder()
            .with_data(&x.data.row(row).to_vec())
            .create(kind.plane_key("X"))?;
        group
            .new_dataset_builder()
            .with_data(&y.data.row(row).to_vec())
            .create(kind.plane_key("Y"))?;

        group
            .new_dataset_builder()
            .with_data(&[0i64])
            .create(sibling.n_samples_key())?;
        group
            .new_dataset_builder()
            .with_data(&[OSCILLATION_FILLER])
            .create(sibling.plane_key("X"))?;
        group
            .new_dataset_builder()
            .with_data(&[OSCILLATION_FILLER])
            .create(sibling.plane_key("Y"))?;
    }
    Ok(())
}

/// The root group's member names in the order the acquisition wrote them.
///
/// Monitor order is row order in the measurement, so it must survive a
/// write/read cycle. Files carrying a creation-order index (h5py needs
/// `track_order=True` for that) are iterated by it; files without one only
/// store the name order, which is what `member_names` walks.
fn ordered_member_names(file: &hdf5::File) -> Result<Vec<String>, TbtError> {
    let by_creation = file.iter_visit(
        hdf5::IterationOrder::Increasing,
        hdf5::TraversalOrder::Creation,
        Vec::new(),
        |_, name, _, names| {
            names.push(name.to_owned());
            true
        },
    );
    match by_creation {
        Ok(names) => Ok(names),
        Err(_) => Ok(file.member_names()?),
    }
}

/// Create an HDF5 file whose root group tracks and indexes link creation
/// order, then reopen it through the safe handle. The file-creation builder
/// of the bindings does not cover this property, hence the raw calls.
fn create_order_tracked(path: &Path) -> Result<hdf5::File, TbtError> {
    let Some(name) = path.to_str().and_then(|p| CString::new(p).ok()) else {
        return Err(TbtError::MalformedSource(format!(
            "path {} cannot be passed to the HDF5 library",
            path.display()
        )));
    };
    let created = unsafe {
        let fcpl = H5Pcreate(*H5P_FILE_CREATE);
        if fcpl < 0 {
            return Err(hdf5_failure("could not create a file creation property list"));
        }
        let mut status =
            H5Pset_link_creation_order(fcpl, H5P_CRT_ORDER_TRACKED | H5P_CRT_ORDER_INDEXED);
        if status >= 0 {
            let file = H5Fcreate(name.as_ptr(), H5F_ACC_TRUNC, fcpl, H5P_DEFAULT);
            status = if file < 0 { -1 } else { H5Fclose(file) };
        }
        H5Pclose(fcpl);
        status
    };
    if created < 0 {
        return Err(hdf5_failure("could not create an order-tracked file"));
    }
    Ok(hdf5::File::open_rw(path)?)
}

fn hdf5_failure(message: &str) -> TbtError {
    TbtError::Hdf5Error(hdf5::Error::from(message))
}

/// Confirm that every monitor's arrays match its declared sample count and
/// that all monitors agree on it. Returns the common turn count.
fn check_data_lengths(
    file: &hdf5::File,
    kind: DataKind,
    monitors: &[String],
) -> Result<usize, TbtError> {
    let mut suspicious = Vec::new();
    let mut counts = Vec::with_capacity(monitors.len());
    for monitor in monitors {
        let group = file.group(monitor)?;
        let nturns = group
            .dataset(kind.n_samples_key())?
            .read_1d::<i64>()?
            .first()
            .copied()
            .unwrap_or(0) as usize;
        for field in ["X", "Y"] {
            let length = group.dataset(kind.plane_key(field))?.read_1d::<f64>()?.len();
            if length != nturns && !suspicious.contains(monitor) {
                suspicious.push(monitor.clone());
            }
        }
        counts.push(nturns);
    }
    if !suspicious.is_empty() {
        return Err(TbtError::InconsistentShape(format!(
            "found monitors with different data lengths than defined in '{}': {suspicious:?}",
            kind.n_samples_key()
        )));
    }
    if counts.windows(2).any(|pair| pair[0] != pair[1]) {
        return Err(TbtError::InconsistentShape(
            "not all monitors have the same number of turns".into(),
        ));
    }
    Ok(counts[0])
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    fn measurement() -> TbtData {
        // deliberately not in name order, row order must survive the file
        let names = vec!["BPMB.2_DOROS".to_string(), "BPMA.1_DOROS".to_string()];
        let x = Array2::from_shape_fn((2, 8), |(i, j)| (i * 8 + j) as f64 / 3.0);
        let y = x.mapv(|v| v + 0.5);
        TbtData::new(
            vec![BunchMatrices::Transverse(
                TransverseData::new(
                    BpmMatrix::new(names.clone(), x).unwrap(),
                    BpmMatrix::new(names, y).unwrap(),
                )
                .unwrap(),
            )],
            8,
            None,
            Meta {
                date: Some(datetime!(2023-05-01 10:00:00 UTC)),
                ..Meta::default()
            },
        )
        .unwrap()
    }

    #[test]
    fn positions_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("doros.h5");
        let origin = measurement();
        write_tbt(&path, &origin, DataKind::Positions).unwrap();
        let read = read_tbt(&path, DataKind::Positions).unwrap();
        assert_eq!(read.matrices, origin.matrices);
        assert_eq!(read.nturns, 8);
        assert_eq!(read.bunch_ids, vec![0]);
        assert_eq!(read.meta.date, origin.meta.date);
    }

    #[test]
    fn monitor_order_follows_the_file_not_the_names() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("doros.h5");
        write_tbt(&path, &measurement(), DataKind::Positions).unwrap();
        let read = read_tbt(&path, DataKind::Positions).unwrap();
        let x = read.matrices[0].field("X").unwrap();
        assert_eq!(
            x.index,
            vec!["BPMB.2_DOROS".to_string(), "BPMA.1_DOROS".to_string()]
        );
    }

    #[test]
    fn oscillations_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("doros.h5");
        let origin = measurement();
        write_tbt(&path, &origin, DataKind::Oscillations).unwrap();
        let read = read_tbt(&path, DataKind::Oscillations).unwrap();
        assert_eq!(read.matrices, origin.matrices);
    }

    #[test]
    fn reading_the_unwritten_kind_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("doros.h5");
        write_tbt(&path, &measurement(), DataKind::Positions).unwrap();
        // the sibling kind only holds placeholder entries of length one
        assert!(matches!(
            read_tbt(&path, DataKind::Oscillations),
            Err(TbtError::InconsistentShape(_))
        ));
    }

    #[test]
    fn monitor_with_short_arrays_is_named() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("doros.h5");
        write_tbt(&path, &measurement(), DataKind::Positions).unwrap();
        // truncate one plane of one monitor
        let file = hdf5::File::open_rw(&path).unwrap();
        let group = file.group("BPMA.1_DOROS").unwrap();
        group.unlink("horPositions").unwrap();
        group
            .new_dataset_builder()
            .with_data(&[1.0, 2.0, 3.0])
            .create("horPositions")
            .unwrap();
        drop(file);
        match read_tbt(&path, DataKind::Positions) {
            Err(TbtError::InconsistentShape(message)) => {
                assert!(message.contains("BPMA.1_DOROS"))
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn disagreeing_turn_counts_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("doros.h5");
        write_tbt(&path, &measurement(), DataKind::Positions).unwrap();
        // shrink one monitor consistently so only the cross-monitor check fires
        let file = hdf5::File::open_rw(&path).unwrap();
        let group = file.group("BPMA.1_DOROS").unwrap();
        for key in ["nbOrbitSamplesRead", "horPositions", "verPositions"] {
            group.unlink(key).unwrap();
        }
        group
            .new_dataset_builder()
            .with_data(&[3i64])
            .create("nbOrbitSamplesRead")
            .unwrap();
        for key in ["horPositions", "verPositions"] {
            group
                .new_dataset_builder()
                .with_data(&[1.0, 2.0, 3.0])
                .create(key)
                .unwrap();
        }
        drop(file);
        assert!(matches!(
            read_tbt(&path, DataKind::Positions),
            Err(TbtError::InconsistentShape(_))
        ));
    }

    #[test]
    fn multibunch_write_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("doros.h5");
        let single = measurement();
        let double = TbtData::new(
            vec![single.matrices[0].clone(), single.matrices[0].clone()],
            8,
            None,
            Meta::default(),
        )
        .unwrap();
        assert!(matches!(
            write_tbt(&path, &double, DataKind::Positions),
            Err(TbtError::InconsistentShape(_))
        ));
    }
}
