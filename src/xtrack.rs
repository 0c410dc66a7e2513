//! Converter for in-memory xtrack tracking results.
//!
//! There is no file format here: tracking is run elsewhere and leaves one
//! particles monitor per observation point in the lattice line, each holding
//! flat per-sample records (turn number, particle id, positions). The
//! converter collects those monitors in line order, checks that they agree
//! on turns and particles, and assembles one matrix set per particle.

use ndarray::Array2;

use super::error::TbtError;
use super::structures::{BpmMatrix, BunchMatrices, Meta, TbtData, TransverseData};

/// Recorded samples of one particles monitor, one entry per particle
/// passage. All vectors run in parallel.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParticlesMonitor {
    pub at_turn: Vec<usize>,
    pub particle_id: Vec<usize>,
    pub x: Vec<f64>,
    pub y: Vec<f64>,
}

/// One element of a lattice line. Only monitors matter for the conversion;
/// everything else is opaque.
#[derive(Debug, Clone, PartialEq)]
pub enum Element {
    Monitor(ParticlesMonitor),
    Other,
}

/// A lattice line: named elements in machine order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Line {
    pub element_names: Vec<String>,
    pub elements: Vec<Element>,
}

/// Convert tracked line data into a turn-by-turn measurement, one matrix
/// set per tracked particle.
pub fn convert_to_tbt(line: &Line) -> Result<TbtData, TbtError> {
    let monitor_pairs: Vec<(&String, &ParticlesMonitor)> = line
        .element_names
        .iter()
        .zip(&line.elements)
        .filter_map(|(name, element)| match element {
            Element::Monitor(monitor) => Some((name, monitor)),
            Element::Other => None,
        })
        .collect();
    if monitor_pairs.is_empty() {
        return Err(TbtError::MalformedSource(
            "no particles monitor found in the line".into(),
        ));
    }

    // lost particles leave trailing records of other ids, which would show
    // up as silent zero rows in the matrices
    for (name, monitor) in &monitor_pairs {
        let last = monitor.particle_id.last().copied();
        let max = monitor.particle_id.iter().max().copied();
        if last != max {
            return Err(TbtError::InconsistentShape(format!(
                "monitor '{name}' recorded lost particles, all particles must survive tracking"
            )));
        }
    }

    let nturns = consistent_count(&monitor_pairs, |monitor| {
        monitor.at_turn.iter().max().map_or(0, |&t| t + 1)
    })
    .ok_or_else(|| {
        TbtError::InconsistentShape(
            "monitors recorded different numbers of turns, check their turn windows".into(),
        )
    })?;
    let npart = consistent_count(&monitor_pairs, |monitor| {
        let mut ids: Vec<usize> = monitor.particle_id.clone();
        ids.sort_unstable();
        ids.dedup();
        ids.len()
    })
    .ok_or_else(|| {
        TbtError::InconsistentShape(
            "monitors recorded different numbers of particles".into(),
        )
    })?;
    if nturns == 0 || npart == 0 {
        return Err(TbtError::MalformedSource(
            "the monitors recorded no samples".into(),
        ));
    }

    let names: Vec<String> = monitor_pairs.iter().map(|(name, _)| (*name).clone()).collect();
    let mut matrices = Vec::with_capacity(npart);
    for pid in 0..npart {
        let plane = |samples: fn(&ParticlesMonitor) -> &Vec<f64>| -> Result<BpmMatrix, TbtError> {
            let mut data = Array2::zeros((names.len(), nturns));
            for (row, (name, monitor)) in monitor_pairs.iter().enumerate() {
                for (sample, (&id, &turn)) in monitor
                    .particle_id
                    .iter()
                    .zip(&monitor.at_turn)
                    .enumerate()
                {
                    if id != pid {
                        continue;
                    }
                    if turn >= nturns {
                        return Err(TbtError::InconsistentShape(format!(
                            "monitor '{name}' recorded turn {turn} beyond the common {nturns} turns"
                        )));
                    }
                    data[[row, turn]] = samples(monitor)[sample];
                }
            }
            BpmMatrix::new(names.clone(), data)
        };
        matrices.push(BunchMatrices::Transverse(TransverseData::new(
            plane(|monitor| &monitor.x)?,
            plane(|monitor| &monitor.y)?,
        )?));
    }

    let meta = Meta {
        source_format: Some("xtrack".to_string()),
        ..Meta::default()
    };
    TbtData::new(matrices, nturns, Some((0..npart).collect()), meta)
}

/// The common value of `count` over all monitors, or `None` if they differ.
fn consistent_count(
    monitors: &[(&String, &ParticlesMonitor)],
    count: impl Fn(&ParticlesMonitor) -> usize,
) -> Option<usize> {
    let mut common = None;
    for (_, monitor) in monitors {
        let value = count(monitor);
        match common {
            None => common = Some(value),
            Some(seen) if seen != value => return None,
            Some(_) => {}
        }
    }
    common
}
