//! Time-indexed value series with explicit undefined points.
//!
//! Every series produced by the evaluator shares one date index per panel.
//! A point is `None` when it cannot be computed: not enough window history,
//! division by zero, log of a non-positive value, and so on. Undefined
//! points propagate through arithmetic instead of aborting evaluation.

/// A single observation: defined or undefined.
pub type Value = Option<f64>;

/// Clamp a raw float to a defined value; NaN and infinities are undefined.
pub fn defined(v: f64) -> Value {
    v.is_finite().then_some(v)
}

/// An ordered run of values aligned to a shared date index.
#[derive(Debug, Clone, PartialEq)]
pub struct Series {
    values: Vec<Value>,
}

impl Series {
    pub fn new(values: Vec<Value>) -> Self {
        Series { values }
    }

    /// A series with every point undefined.
    pub fn undefined(len: usize) -> Self {
        Series {
            values: vec![None; len],
        }
    }

    /// A series repeating one constant.
    pub fn constant(value: f64, len: usize) -> Self {
        Series {
            values: vec![defined(value); len],
        }
    }

    /// Build from raw floats, mapping non-finite inputs to undefined.
    pub fn from_f64s(raw: &[f64]) -> Self {
        Series {
            values: raw.iter().map(|&v| defined(v)).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn get(&self, index: usize) -> Value {
        self.values.get(index).copied().flatten()
    }

    /// The most recent point; `None` when empty or undefined.
    pub fn latest(&self) -> Value {
        self.values.last().copied().flatten()
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    pub fn iter(&self) -> impl Iterator<Item = Value> + '_ {
        self.values.iter().copied()
    }

    /// Apply a pointwise function; undefined in, undefined out.
    pub fn map(&self, f: impl Fn(f64) -> f64) -> Series {
        Series {
            values: self
                .values
                .iter()
                .map(|v| v.and_then(|x| defined(f(x))))
                .collect(),
        }
    }

    /// Apply a pointwise partial function; undefined in, undefined out.
    pub fn map_partial(&self, f: impl Fn(f64) -> Value) -> Series {
        Series {
            values: self.values.iter().map(|v| v.and_then(&f)).collect(),
        }
    }

    /// Combine two equal-length series pointwise; either side undefined
    /// makes the result undefined.
    pub fn zip_with(&self, other: &Series, f: impl Fn(f64, f64) -> f64) -> Series {
        debug_assert_eq!(self.len(), other.len());
        Series {
            values: self
                .values
                .iter()
                .zip(other.values.iter())
                .map(|(a, b)| match (a, b) {
                    (Some(x), Some(y)) => defined(f(*x, *y)),
                    _ => None,
                })
                .collect(),
        }
    }

    /// Like [`zip_with`](Self::zip_with) but the combiner may itself yield
    /// undefined (division by zero and friends).
    pub fn zip_partial(&self, other: &Series, f: impl Fn(f64, f64) -> Value) -> Series {
        debug_assert_eq!(self.len(), other.len());
        Series {
            values: self
                .values
                .iter()
                .zip(other.values.iter())
                .map(|(a, b)| match (a, b) {
                    (Some(x), Some(y)) => f(*x, *y).and_then(defined),
                    _ => None,
                })
                .collect(),
        }
    }
}

/// A defined nonzero value is true; zero is false; undefined stays undefined.
pub fn truthy(v: Value) -> Option<bool> {
    v.map(|x| x != 0.0)
}

/// Encode a boolean as the numeric 1.0 / 0.0 the formula language uses.
pub fn from_bool(b: bool) -> f64 {
    if b { 1.0 } else { 0.0 }
}
