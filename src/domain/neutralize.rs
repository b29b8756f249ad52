//! Weight neutralization.
//!
//! Turns a cross-section of raw signals into a dollar-neutral, unit-gross
//! weight vector: demean so the weights sum to ~0, then scale so absolute
//! weights sum to ~1. Instruments with an undefined signal get weight 0 and
//! are excluded from both the mean and the gross normalizer.

use std::collections::BTreeMap;

use crate::domain::series::Value;

/// Below this gross exposure the demeaned vector is considered degenerate
/// (all signals equal or all undefined) and every weight is zero.
const GROSS_EPSILON: f64 = 1e-12;

/// Instrument → latest signal value; `None` marks an undefined signal.
pub type SignalVector = BTreeMap<String, Value>;

/// Instrument → portfolio weight in [-1, 1].
pub type WeightVector = BTreeMap<String, f64>;

pub fn neutralize(signals: &SignalVector) -> WeightVector {
    let finite: Vec<(&String, f64)> = signals
        .iter()
        .filter_map(|(instrument, v)| {
            v.filter(|x| x.is_finite()).map(|x| (instrument, x))
        })
        .collect();

    let mut weights: WeightVector = signals.keys().map(|i| (i.clone(), 0.0)).collect();
    if finite.is_empty() {
        return weights;
    }

    let mean: f64 = finite.iter().map(|(_, v)| v).sum::<f64>() / finite.len() as f64;
    let demeaned: Vec<(&String, f64)> =
        finite.iter().map(|(i, v)| (*i, v - mean)).collect();

    let gross: f64 = demeaned.iter().map(|(_, v)| v.abs()).sum();
    if gross < GROSS_EPSILON {
        return weights;
    }

    for (instrument, v) in demeaned {
        weights.insert(instrument.clone(), v / gross);
    }
    weights
}
