//! Daily OHLCV candle representation.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// One daily price/volume observation for a single instrument.
///
/// Candles arrive from the broker ordered by ascending date; the evaluator
/// aligns them by date across instruments before building a panel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub date: NaiveDate,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: i64,
}

impl Candle {
    /// Close-over-close percentage change against the previous candle.
    pub fn return_from(&self, prev: &Candle) -> Option<f64> {
        if prev.close == 0.0 {
            return None;
        }
        let r = self.close / prev.close - 1.0;
        r.is_finite().then_some(r)
    }
}
