//! Rolling-window statistics over value series.
//!
//! Every function here is closed on the left: the window of size W at index
//! t covers indices `t-W .. t-1`, never t itself. The first W points are
//! therefore undefined, and a window containing any undefined observation
//! yields an undefined result until that observation falls out.
//!
//! Statistics are maintained incrementally while sliding: running sums and
//! co-moments for mean/stddev/sum/correlation/covariance, monotonic index
//! deques for min/max/argmax/argmin, so a full pass costs O(n), not
//! O(n·W).

use std::collections::VecDeque;

use crate::domain::formula::{PairwiseStat, RollingStat};
use crate::domain::series::{defined, Series, Value};

/// Value at `t - lag`; undefined for the first `lag` points.
pub fn delay(xs: &Series, lag: usize) -> Series {
    let vals = xs.values();
    let out = (0..vals.len())
        .map(|t| {
            if t < lag {
                None
            } else {
                vals[t - lag]
            }
        })
        .collect();
    Series::new(out)
}

/// Difference against the value `lag` observations earlier.
pub fn delta(xs: &Series, lag: usize) -> Series {
    let vals = xs.values();
    let out = (0..vals.len())
        .map(|t| {
            if t < lag {
                return None;
            }
            match (vals[t], vals[t - lag]) {
                (Some(now), Some(then)) => defined(now - then),
                _ => None,
            }
        })
        .collect();
    Series::new(out)
}

/// Apply a rolling statistic over the prior-W window of `xs`.
pub fn rolling(stat: RollingStat, xs: &Series, window: usize) -> Series {
    if window == 0 {
        return Series::undefined(xs.len());
    }
    match stat {
        RollingStat::Mean | RollingStat::Stddev | RollingStat::Sum => moments(xs, window, stat),
        RollingStat::Product => product(xs, window),
        RollingStat::Min => extremes(xs, window, Extreme::Min, false),
        RollingStat::Max => extremes(xs, window, Extreme::Max, false),
        RollingStat::ArgMin => extremes(xs, window, Extreme::Min, true),
        RollingStat::ArgMax => extremes(xs, window, Extreme::Max, true),
    }
}

/// Apply a rolling pairwise statistic over the prior-W windows of `xs`/`ys`.
///
/// Both series share the window: a point where either side is undefined
/// poisons the window for both. Population moments throughout; correlation
/// is undefined when either side has zero variance.
pub fn rolling_pair(stat: PairwiseStat, xs: &Series, ys: &Series, window: usize) -> Series {
    debug_assert_eq!(xs.len(), ys.len());
    let n = xs.len();
    if window == 0 {
        return Series::undefined(n);
    }

    let w = window as f64;
    let mut buf: VecDeque<Option<(f64, f64)>> = VecDeque::with_capacity(window + 1);
    let mut undefined = 0usize;
    let (mut sum_x, mut sum_y, mut sum_xy, mut sum_x2, mut sum_y2) = (0.0, 0.0, 0.0, 0.0, 0.0);

    let mut out = Vec::with_capacity(n);
    for t in 0..n {
        if buf.len() == window && undefined == 0 {
            let mean_x = sum_x / w;
            let mean_y = sum_y / w;
            let cov = sum_xy / w - mean_x * mean_y;
            let value = match stat {
                PairwiseStat::Covariance => defined(cov),
                PairwiseStat::Correlation => {
                    let var_x = (sum_x2 / w - mean_x * mean_x).max(0.0);
                    let var_y = (sum_y2 / w - mean_y * mean_y).max(0.0);
                    let denom = (var_x * var_y).sqrt();
                    if denom == 0.0 {
                        None
                    } else {
                        defined((cov / denom).clamp(-1.0, 1.0))
                    }
                }
            };
            out.push(value);
        } else {
            out.push(None);
        }

        let pair = match (xs.get(t), ys.get(t)) {
            (Some(x), Some(y)) => Some((x, y)),
            _ => None,
        };
        match pair {
            Some((x, y)) => {
                sum_x += x;
                sum_y += y;
                sum_xy += x * y;
                sum_x2 += x * x;
                sum_y2 += y * y;
            }
            None => undefined += 1,
        }
        buf.push_back(pair);

        if buf.len() > window {
            match buf.pop_front().unwrap() {
                Some((x, y)) => {
                    sum_x -= x;
                    sum_y -= y;
                    sum_xy -= x * y;
                    sum_x2 -= x * x;
                    sum_y2 -= y * y;
                }
                None => undefined -= 1,
            }
        }
    }

    Series::new(out)
}

fn moments(xs: &Series, window: usize, stat: RollingStat) -> Series {
    let n = xs.len();
    let w = window as f64;
    let mut buf: VecDeque<Value> = VecDeque::with_capacity(window + 1);
    let mut undefined = 0usize;
    let mut sum = 0.0;
    let mut sum_sq = 0.0;

    let mut out = Vec::with_capacity(n);
    for t in 0..n {
        if buf.len() == window && undefined == 0 {
            let value = match stat {
                RollingStat::Sum => defined(sum),
                RollingStat::Mean => defined(sum / w),
                RollingStat::Stddev => {
                    let mean = sum / w;
                    let variance = (sum_sq / w - mean * mean).max(0.0);
                    defined(variance.sqrt())
                }
                _ => unreachable!("moments only handles sum/mean/stddev"),
            };
            out.push(value);
        } else {
            out.push(None);
        }

        let v = xs.get(t);
        match v {
            Some(x) => {
                sum += x;
                sum_sq += x * x;
            }
            None => undefined += 1,
        }
        buf.push_back(v);

        if buf.len() > window {
            match buf.pop_front().unwrap() {
                Some(x) => {
                    sum -= x;
                    sum_sq -= x * x;
                }
                None => undefined -= 1,
            }
        }
    }

    Series::new(out)
}

fn product(xs: &Series, window: usize) -> Series {
    let n = xs.len();
    let mut buf: VecDeque<Value> = VecDeque::with_capacity(window + 1);
    let mut undefined = 0usize;

    let mut out = Vec::with_capacity(n);
    for t in 0..n {
        if buf.len() == window && undefined == 0 {
            // Recomputed by scan: an incremental product cannot recover
            // after a zero passes through the window.
            let p: f64 = buf.iter().map(|v| v.unwrap()).product();
            out.push(defined(p));
        } else {
            out.push(None);
        }

        let v = xs.get(t);
        if v.is_none() {
            undefined += 1;
        }
        buf.push_back(v);

        if buf.len() > window && buf.pop_front().unwrap().is_none() {
            undefined -= 1;
        }
    }

    Series::new(out)
}

#[derive(Clone, Copy, PartialEq)]
enum Extreme {
    Min,
    Max,
}

/// Shared sliding-extreme machinery.
///
/// The monotonic deque keeps candidate (index, value) pairs; its front is
/// always the earliest occurrence of the window extreme, which is also the
/// tie-breaking rule for argmax/argmin.
fn extremes(xs: &Series, window: usize, extreme: Extreme, arg: bool) -> Series {
    let n = xs.len();
    let mut buf: VecDeque<Value> = VecDeque::with_capacity(window + 1);
    let mut undefined = 0usize;
    let mut deque: VecDeque<(usize, f64)> = VecDeque::new();

    let beats = |candidate: f64, incumbent: f64| match extreme {
        Extreme::Min => candidate < incumbent,
        Extreme::Max => candidate > incumbent,
    };

    let mut out = Vec::with_capacity(n);
    for t in 0..n {
        // Drop candidates that fell out of the window [t-window, t).
        if t >= window {
            let cutoff = t - window;
            while deque.front().is_some_and(|&(i, _)| i < cutoff) {
                deque.pop_front();
            }
        }

        if buf.len() == window && undefined == 0 {
            let &(index, value) = deque.front().expect("full defined window has an extreme");
            let result = if arg {
                (index - (t - window)) as f64
            } else {
                value
            };
            out.push(defined(result));
        } else {
            out.push(None);
        }

        let v = xs.get(t);
        match v {
            Some(x) => {
                // Strict pops keep the earliest equal extreme at the front.
                while deque.back().is_some_and(|&(_, back)| beats(x, back)) {
                    deque.pop_back();
                }
                deque.push_back((t, x));
            }
            None => undefined += 1,
        }
        buf.push_back(v);

        if buf.len() > window && buf.pop_front().unwrap().is_none() {
            undefined -= 1;
        }
    }

    Series::new(out)
}
