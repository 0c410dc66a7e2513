//! Convenience operations on turn-by-turn measurements: bunch averaging,
//! reproducible noise injection and conversion from raw numeric blocks.

use ndarray::{Array2, Array4, ArrayView4};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;

use super::error::TbtError;
use super::structures::{
    BpmMatrix, BunchMatrices, Meta, TbtData, TrackingData, TransverseData,
};

/// Average the matrices of a measurement over all bunches/particles.
///
/// Every field is the element-wise mean across the source matrices at all
/// shared observation points. Matrices with fewer turns contribute only
/// their available columns; the missing tail is treated as absent rather
/// than as zeros, so ragged inputs do not bias the average. The result is a
/// single-bunch measurement with bunch id list `[1]`.
pub fn generate_average_tbtdata(tbtdata: &TbtData) -> Result<TbtData, TbtError> {
    let template = tbtdata
        .matrices
        .first()
        .ok_or_else(|| TbtError::InconsistentShape("cannot average an empty measurement".into()))?;
    let nturns = tbtdata.nturns;

    let averaged = template.try_map(|name, first| {
        let nbpms = first.index.len();
        let mut sums = Array2::<f64>::zeros((nbpms, nturns));
        let mut counts = Array2::<f64>::zeros((nbpms, nturns));
        for matrices in &tbtdata.matrices {
            let field = matrices.field(name).ok_or_else(|| {
                TbtError::InconsistentShape(format!(
                    "matrix kinds differ across bunches, field '{name}' is missing"
                ))
            })?;
            for (row, bpm) in first.index.iter().enumerate() {
                let samples = field.row(bpm).ok_or_else(|| {
                    TbtError::InconsistentShape(format!(
                        "observation point '{bpm}' is missing from one of the bunches"
                    ))
                })?;
                for (turn, value) in samples.iter().enumerate().take(nturns) {
                    sums[[row, turn]] += value;
                    counts[[row, turn]] += 1.0;
                }
            }
        }
        let mean = sums
            .indexed_iter()
            .map(|(idx, sum)| {
                let n = counts[idx];
                if n > 0.0 {
                    sum / n
                } else {
                    f64::NAN
                }
            })
            .collect::<Vec<f64>>();
        let mean = Array2::from_shape_vec((nbpms, nturns), mean)
            .map_err(|e| TbtError::InconsistentShape(e.to_string()))?;
        BpmMatrix::new(first.index.clone(), mean)
    })?;

    TbtData::new(vec![averaged], nturns, Some(vec![1]), tbtdata.meta.clone())
}

/// Add Gaussian noise to a sample table.
///
/// Noise is drawn as a standard normal of the table's shape and scaled
/// before being added. Exactly one of `noise` (fixed scale) and `sigma`
/// (multiple of the table's own standard deviation) must be given; anything
/// else is an [`TbtError::ExclusiveParameterViolation`]. A zero scale
/// returns the input unchanged. `seed` makes the result reproducible.
pub fn add_noise(
    data: &Array2<f64>,
    noise: Option<f64>,
    sigma: Option<f64>,
    seed: Option<u64>,
) -> Result<Array2<f64>, TbtError> {
    let mut rng = rng_from_seed(seed);
    add_noise_with_rng(data, noise, sigma, &mut rng)
}

/// [`add_noise`] drawing from a caller-owned generator.
///
/// Used when perturbing several tables in sequence: one generator state is
/// advanced across all of them, so each table receives different noise even
/// under a single fixed seed.
pub fn add_noise_with_rng(
    data: &Array2<f64>,
    noise: Option<f64>,
    sigma: Option<f64>,
    rng: &mut StdRng,
) -> Result<Array2<f64>, TbtError> {
    let scaling = match (noise, sigma) {
        (Some(scale), None) => scale,
        (None, Some(multiple)) => multiple * standard_deviation(data),
        _ => {
            return Err(TbtError::ExclusiveParameterViolation {
                first: "noise",
                second: "sigma",
            })
        }
    };
    Ok(data.mapv(|value| {
        let draw: f64 = rng.sample(StandardNormal);
        value + scaling * draw
    }))
}

/// Return a copy of a measurement with added noise on all matrices.
///
/// All fields of all bunches draw from one shared generator, i.e. the noise
/// is not repeated on each table.
pub fn add_noise_to_tbt(
    data: &TbtData,
    noise: Option<f64>,
    sigma: Option<f64>,
    seed: Option<u64>,
) -> Result<TbtData, TbtError> {
    let mut rng = rng_from_seed(seed);
    let matrices = data
        .matrices
        .iter()
        .map(|matrices| {
            matrices.try_map(|_, field| {
                let noised = add_noise_with_rng(&field.data, noise, sigma, &mut rng)?;
                BpmMatrix::new(field.index.clone(), noised)
            })
        })
        .collect::<Result<Vec<_>, _>>()?;
    TbtData::new(
        matrices,
        data.nturns,
        Some(data.bunch_ids.clone()),
        data.meta.clone(),
    )
}

/// Convert the transverse matrices of a measurement to one numeric block
/// indexed `[plane, observation point, bunch, turn]`.
pub fn matrices_to_array(tbt_data: &TbtData) -> Result<Array4<f64>, TbtError> {
    log::debug!("Getting the monitor count from the measurement data");
    let first = tbt_data
        .matrices
        .first()
        .and_then(|m| m.field("X"))
        .ok_or_else(|| TbtError::InconsistentShape("measurement holds no matrices".into()))?;
    let nbpms = first.n_monitors();
    let nbunches = tbt_data.nbunches();
    let nturns = tbt_data.nturns;

    let mut block = Array4::<f64>::zeros((2, nbpms, nbunches, nturns));
    for (bunch, matrices) in tbt_data.matrices.iter().enumerate() {
        for (plane, name) in ["X", "Y"].iter().enumerate() {
            let field = matrices.field(name).ok_or_else(|| {
                TbtError::InconsistentShape(format!("bunch {bunch} has no '{name}' field"))
            })?;
            if field.data.dim() != (nbpms, nturns) {
                return Err(TbtError::InconsistentShape(format!(
                    "bunch {bunch} field '{name}' has shape {:?}, expected ({nbpms}, {nturns})",
                    field.data.dim()
                )));
            }
            block
                .slice_mut(ndarray::s![plane, .., bunch, ..])
                .assign(&field.data);
        }
    }
    Ok(block)
}

/// Assemble a measurement from observation point names and a 4D block
/// indexed `[field, observation point, bunch-or-particle, turn]`.
///
/// A 2-field block yields transverse matrices, an 8-field block full
/// tracking matrices. This is the common tail step of several codecs after
/// their format-specific decode.
pub fn matrix_to_tbt(names: &[String], block: ArrayView4<'_, f64>) -> Result<TbtData, TbtError> {
    let (nfields, nbpms, nbunches, nturns) = block.dim();
    if nbpms != names.len() {
        return Err(TbtError::InconsistentShape(format!(
            "block has {nbpms} observation points but {} names were given",
            names.len()
        )));
    }
    let take = |field: usize, bunch: usize| -> Result<BpmMatrix, TbtError> {
        BpmMatrix::new(
            names.to_vec(),
            block.slice(ndarray::s![field, .., bunch, ..]).to_owned(),
        )
    };
    let mut matrices = Vec::with_capacity(nbunches);
    for bunch in 0..nbunches {
        let kind = match nfields {
            2 => BunchMatrices::Transverse(TransverseData::new(take(0, bunch)?, take(1, bunch)?)?),
            8 => BunchMatrices::Tracking(TrackingData::new(
                take(0, bunch)?,
                take(1, bunch)?,
                take(2, bunch)?,
                take(3, bunch)?,
                take(4, bunch)?,
                take(5, bunch)?,
                take(6, bunch)?,
                take(7, bunch)?,
            )?),
            other => {
                return Err(TbtError::InconsistentShape(format!(
                    "cannot build matrices from a block with {other} fields, expected 2 or 8"
                )))
            }
        };
        matrices.push(kind);
    }
    TbtData::new(matrices, nturns, None, Meta::default())
}

fn rng_from_seed(seed: Option<u64>) -> StdRng {
    match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    }
}

fn standard_deviation(data: &Array2<f64>) -> f64 {
    let mean = data.mean().unwrap_or(0.0);
    let variance = data.mapv(|v| (v - mean).powi(2)).mean().unwrap_or(0.0);
    variance.sqrt()
}
