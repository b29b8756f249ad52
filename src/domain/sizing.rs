//! Position sizing: weights to integer lot deltas.
//!
//! Per instrument the target notional is `portfolio_value × weight ×
//! safety_fraction`, converted to whole lots with banker's rounding and
//! compared against the lots currently held. An instrument without a
//! reference price is a per-instrument sizing error, never a silent skip.

use std::collections::BTreeMap;

use crate::domain::neutralize::WeightVector;
use crate::domain::series::Value;
use crate::ports::broker_port::InstrumentMeta;

/// One intended market order, alive for a single iteration.
#[derive(Debug, Clone, PartialEq)]
pub struct TradeIntent {
    pub instrument: String,
    /// Signed lot delta: negative sells, positive buys.
    pub delta_lots: i64,
    pub reference_price: f64,
    pub target_notional: f64,
}

/// A per-instrument sizing failure, reported alongside the usable intents.
#[derive(Debug, Clone, PartialEq)]
pub struct SizingError {
    pub instrument: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default)]
pub struct SizingOutcome {
    pub intents: Vec<TradeIntent>,
    pub errors: Vec<SizingError>,
}

/// Round to the nearest integer, ties to even.
pub fn round_half_even(x: f64) -> i64 {
    let floor = x.floor();
    let frac = x - floor;
    let down = floor as i64;
    if frac > 0.5 {
        down + 1
    } else if frac < 0.5 {
        down
    } else if down % 2 == 0 {
        down
    } else {
        down + 1
    }
}

/// Convert a weight vector into trade intents against current positions.
///
/// `positions` maps instrument id to held base-unit quantity; `prices` maps
/// instrument id to the latest reference price (undefined when the panel
/// had no defined close).
pub fn size(
    weights: &WeightVector,
    portfolio_value: f64,
    positions: &BTreeMap<String, i64>,
    instruments: &BTreeMap<String, InstrumentMeta>,
    prices: &BTreeMap<String, Value>,
    safety_fraction: f64,
) -> SizingOutcome {
    let mut outcome = SizingOutcome::default();

    for (instrument, meta) in instruments {
        let weight = weights.get(instrument).copied().unwrap_or(0.0);

        let price = match prices.get(instrument).copied().flatten() {
            Some(p) if p > 0.0 => p,
            Some(p) => {
                outcome.errors.push(SizingError {
                    instrument: instrument.clone(),
                    reason: format!("non-positive reference price {}", p),
                });
                continue;
            }
            None => {
                outcome.errors.push(SizingError {
                    instrument: instrument.clone(),
                    reason: "no reference price available".to_string(),
                });
                continue;
            }
        };

        if meta.lot_size <= 0 {
            outcome.errors.push(SizingError {
                instrument: instrument.clone(),
                reason: format!("invalid lot size {}", meta.lot_size),
            });
            continue;
        }

        let target_notional = portfolio_value * weight * safety_fraction;
        let target_lots = round_half_even(target_notional / (price * meta.lot_size as f64));

        let held = positions.get(instrument).copied().unwrap_or(0);
        let held_lots = held.div_euclid(meta.lot_size);

        let delta_lots = target_lots - held_lots;
        if delta_lots == 0 {
            continue;
        }

        outcome.intents.push(TradeIntent {
            instrument: instrument.clone(),
            delta_lots,
            reference_price: price,
            target_notional,
        });
    }

    outcome
}
