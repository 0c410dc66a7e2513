//! Data structures holding turn-by-turn measurement data.
//!
//! The measurement model is built from three layers: [`BpmMatrix`] is one
//! named-row sample table (observation points x turns), [`TransverseData`]
//! and [`TrackingData`] group such tables into the per-bunch field sets of a
//! measurement or a 6D tracking result, and [`TbtData`] is the top-level
//! container holding one field set per bunch (or per tracked particle).

use std::path::PathBuf;

use ndarray::{Array2, ArrayView1};
use time::OffsetDateTime;

use super::error::TbtError;

/// Field names of [`TransverseData`], in field order.
pub const TRANSVERSE_FIELDS: &[&str] = &["X", "Y"];
/// Field names of [`TrackingData`], in field order.
pub const TRACKING_FIELDS: &[&str] = &["X", "PX", "Y", "PY", "T", "PT", "S", "E"];

/// A 2D sample table with named rows.
///
/// Rows are observation points (e.g. beam position monitors) in the order of
/// the source machine or lattice; columns are turn numbers, 0-based and
/// contiguous. Row order carries meaning and is preserved through all
/// read/write round trips.
#[derive(Debug, Clone, PartialEq)]
pub struct BpmMatrix {
    pub index: Vec<String>,
    pub data: Array2<f64>,
}

impl BpmMatrix {
    /// Create a matrix, validating that the row names match the data rows.
    pub fn new(index: Vec<String>, data: Array2<f64>) -> Result<Self, TbtError> {
        if index.len() != data.nrows() {
            return Err(TbtError::InconsistentShape(format!(
                "matrix has {} rows but {} row names were given",
                data.nrows(),
                index.len()
            )));
        }
        Ok(Self { index, data })
    }

    pub fn n_monitors(&self) -> usize {
        self.data.nrows()
    }

    pub fn n_turns(&self) -> usize {
        self.data.ncols()
    }

    /// The samples of a single observation point, looked up by name.
    pub fn row(&self, name: &str) -> Option<ArrayView1<'_, f64>> {
        self.index
            .iter()
            .position(|n| n == name)
            .map(|i| self.data.row(i))
    }
}

/// Measured turn-by-turn data for both transverse planes.
#[derive(Debug, Clone, PartialEq)]
pub struct TransverseData {
    pub x: BpmMatrix,
    pub y: BpmMatrix,
}

impl TransverseData {
    /// Create the field set, validating that both planes share one shape.
    pub fn new(x: BpmMatrix, y: BpmMatrix) -> Result<Self, TbtError> {
        if x.data.dim() != y.data.dim() {
            return Err(TbtError::InconsistentShape(format!(
                "transverse planes have different shapes: X is {:?}, Y is {:?}",
                x.data.dim(),
                y.data.dim()
            )));
        }
        Ok(Self { x, y })
    }
}

/// Full 6D phase-space tracking output: positions, momenta, the time-like
/// and energy-deviation coordinates, longitudinal position and energy.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackingData {
    pub x: BpmMatrix,
    pub px: BpmMatrix,
    pub y: BpmMatrix,
    pub py: BpmMatrix,
    pub t: BpmMatrix,
    pub pt: BpmMatrix,
    pub s: BpmMatrix,
    pub e: BpmMatrix,
}

impl TrackingData {
    /// Create the field set, validating that all eight fields share one shape.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        x: BpmMatrix,
        px: BpmMatrix,
        y: BpmMatrix,
        py: BpmMatrix,
        t: BpmMatrix,
        pt: BpmMatrix,
        s: BpmMatrix,
        e: BpmMatrix,
    ) -> Result<Self, TbtError> {
        let shape = x.data.dim();
        for (name, field) in [
            ("PX", &px),
            ("Y", &y),
            ("PY", &py),
            ("T", &t),
            ("PT", &pt),
            ("S", &s),
            ("E", &e),
        ] {
            if field.data.dim() != shape {
                return Err(TbtError::InconsistentShape(format!(
                    "tracking field '{name}' has shape {:?}, expected {shape:?}",
                    field.data.dim()
                )));
            }
        }
        Ok(Self {
            x,
            px,
            y,
            py,
            t,
            pt,
            s,
            e,
        })
    }
}

/// The per-bunch field sets a measurement can hold.
///
/// All aggregation and IO glue is written against the field-enumeration
/// capability ([`fieldnames`](Self::fieldnames) / [`field`](Self::field))
/// rather than against a concrete kind, so a new kind only needs to be added
/// here.
#[derive(Debug, Clone, PartialEq)]
pub enum BunchMatrices {
    Transverse(TransverseData),
    Tracking(TrackingData),
}

impl BunchMatrices {
    /// The field names of this kind, in field order.
    pub fn fieldnames(&self) -> &'static [&'static str] {
        match self {
            BunchMatrices::Transverse(_) => TRANSVERSE_FIELDS,
            BunchMatrices::Tracking(_) => TRACKING_FIELDS,
        }
    }

    /// Dictionary-style field access by name.
    pub fn field(&self, name: &str) -> Option<&BpmMatrix> {
        match self {
            BunchMatrices::Transverse(data) => match name {
                "X" => Some(&data.x),
                "Y" => Some(&data.y),
                _ => None,
            },
            BunchMatrices::Tracking(data) => match name {
                "X" => Some(&data.x),
                "PX" => Some(&data.px),
                "Y" => Some(&data.y),
                "PY" => Some(&data.py),
                "T" => Some(&data.t),
                "PT" => Some(&data.pt),
                "S" => Some(&data.s),
                "E" => Some(&data.e),
                _ => None,
            },
        }
    }

    /// Build a new field set of the same kind by transforming every field,
    /// visiting them in field order.
    pub fn try_map<F>(&self, mut f: F) -> Result<BunchMatrices, TbtError>
    where
        F: FnMut(&'static str, &BpmMatrix) -> Result<BpmMatrix, TbtError>,
    {
        match self {
            BunchMatrices::Transverse(data) => Ok(BunchMatrices::Transverse(TransverseData {
                x: f("X", &data.x)?,
                y: f("Y", &data.y)?,
            })),
            BunchMatrices::Tracking(data) => Ok(BunchMatrices::Tracking(TrackingData {
                x: f("X", &data.x)?,
                px: f("PX", &data.px)?,
                y: f("Y", &data.y)?,
                py: f("PY", &data.py)?,
                t: f("T", &data.t)?,
                pt: f("PT", &data.pt)?,
                s: f("S", &data.s)?,
                e: f("E", &data.e)?,
            })),
        }
    }
}

/// Optional information about the origin of a measurement.
///
/// Every entry is optional; readers fill in what the source file provides.
/// An unparseable date in a source file is omitted here, never replaced by a
/// wall-clock fallback.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Meta {
    pub date: Option<OffsetDateTime>,
    pub file: Option<PathBuf>,
    pub source_format: Option<String>,
    pub comment: Option<String>,
    pub machine: Option<String>,
}

/// A turn-by-turn measurement.
///
/// Holds one [`BunchMatrices`] per bunch (for real measurements) or per
/// tracked particle (for simulation output), the common turn count, the
/// bunch/particle identifiers and the measurement metadata. Constructed once
/// per read/convert operation; utilities produce new instances instead of
/// mutating in place.
#[derive(Debug, Clone, PartialEq)]
pub struct TbtData {
    pub matrices: Vec<BunchMatrices>,
    pub nturns: usize,
    pub bunch_ids: Vec<usize>,
    pub meta: Meta,
}

impl TbtData {
    /// Create a measurement, validating the container invariants.
    ///
    /// `bunch_ids` defaults to `0..N-1` when `None`; when given, it must
    /// align positionally with `matrices`.
    pub fn new(
        matrices: Vec<BunchMatrices>,
        nturns: usize,
        bunch_ids: Option<Vec<usize>>,
        meta: Meta,
    ) -> Result<Self, TbtError> {
        if nturns == 0 {
            return Err(TbtError::InconsistentShape(
                "turn count must be positive".into(),
            ));
        }
        let bunch_ids = match bunch_ids {
            Some(ids) => {
                if ids.len() != matrices.len() {
                    return Err(TbtError::InconsistentShape(format!(
                        "got {} bunch ids for {} matrices",
                        ids.len(),
                        matrices.len()
                    )));
                }
                ids
            }
            None => (0..matrices.len()).collect(),
        };
        Ok(Self {
            matrices,
            nturns,
            bunch_ids,
            meta,
        })
    }

    /// Number of bunches/particles, derived from the matrix sequence.
    pub fn nbunches(&self) -> usize {
        self.matrices.len()
    }
}
