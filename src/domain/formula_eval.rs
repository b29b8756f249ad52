//! Formula evaluation engine.
//!
//! Executes a compiled [`Program`] against aligned OHLCV history. Two modes:
//!
//! - Per-instrument: [`evaluate`] binds each variable to one instrument's
//!   series and walks the tree.
//! - Cross-sectional: [`evaluate_panel`] runs over every instrument at once
//!   so `rank` and `indneutralize` can look across the whole universe at
//!   each date. In per-instrument mode those operators see a one-element
//!   cross-section (`rank` → 0.5, `indneutralize` → 0).
//!
//! There are no runtime evaluation failures: division by zero, logs of
//! non-positive values, and short windows all surface as undefined points
//! and flow through arithmetic as such.

use std::collections::BTreeMap;

use chrono::NaiveDate;

use crate::domain::candle::Candle;
use crate::domain::error::AlphaloopError;
use crate::domain::formula::{BinaryOp, Call, CompareOp, Expr, Program, UnaryOp, Variable};
use crate::domain::rolling;
use crate::domain::series::{defined, from_bool, truthy, Series, Value};

/// One instrument's aligned variable bindings.
#[derive(Debug, Clone, PartialEq)]
pub struct SymbolContext {
    dates: Vec<NaiveDate>,
    open: Series,
    high: Series,
    low: Series,
    close: Series,
    volume: Series,
    returns: Series,
}

impl SymbolContext {
    /// Build a context from ascending daily candles. `returns` is derived
    /// as close-over-close percentage change; its first point is undefined.
    pub fn from_candles(candles: &[Candle]) -> SymbolContext {
        let dates = candles.iter().map(|c| c.date).collect();
        let open = Series::from_f64s(&candles.iter().map(|c| c.open).collect::<Vec<_>>());
        let high = Series::from_f64s(&candles.iter().map(|c| c.high).collect::<Vec<_>>());
        let low = Series::from_f64s(&candles.iter().map(|c| c.low).collect::<Vec<_>>());
        let close = Series::from_f64s(&candles.iter().map(|c| c.close).collect::<Vec<_>>());
        let volume =
            Series::from_f64s(&candles.iter().map(|c| c.volume as f64).collect::<Vec<_>>());

        let mut returns = vec![None; candles.len()];
        for i in 1..candles.len() {
            returns[i] = candles[i].return_from(&candles[i - 1]);
        }

        SymbolContext {
            dates,
            open,
            high,
            low,
            close,
            volume,
            returns: Series::new(returns),
        }
    }

    pub fn series(&self, var: Variable) -> &Series {
        match var {
            Variable::Open => &self.open,
            Variable::High => &self.high,
            Variable::Low => &self.low,
            Variable::Close => &self.close,
            Variable::Volume => &self.volume,
            Variable::Returns => &self.returns,
        }
    }

    pub fn dates(&self) -> &[NaiveDate] {
        &self.dates
    }

    pub fn len(&self) -> usize {
        self.dates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dates.is_empty()
    }
}

/// Date-aligned contexts for a whole instrument set.
#[derive(Debug, Clone)]
pub struct Panel {
    contexts: BTreeMap<String, SymbolContext>,
    len: usize,
}

impl Panel {
    /// Build a panel by inner-joining candle histories on date: only dates
    /// observed for every instrument survive, which keeps the
    /// aligned-by-timestamp invariant without inventing data.
    pub fn align(histories: &BTreeMap<String, Vec<Candle>>) -> Panel {
        let mut common: Option<Vec<NaiveDate>> = None;
        for candles in histories.values() {
            let dates: Vec<NaiveDate> = candles.iter().map(|c| c.date).collect();
            common = Some(match common {
                None => dates,
                Some(prev) => prev.into_iter().filter(|d| dates.contains(d)).collect(),
            });
        }
        let common = common.unwrap_or_default();

        let contexts: BTreeMap<String, SymbolContext> = histories
            .iter()
            .map(|(instrument, candles)| {
                let aligned: Vec<Candle> = candles
                    .iter()
                    .filter(|c| common.contains(&c.date))
                    .cloned()
                    .collect();
                (instrument.clone(), SymbolContext::from_candles(&aligned))
            })
            .collect();

        Panel {
            len: common.len(),
            contexts,
        }
    }

    /// Assemble a panel from prebuilt contexts, checking alignment.
    pub fn from_contexts(
        contexts: BTreeMap<String, SymbolContext>,
    ) -> Result<Panel, AlphaloopError> {
        let mut dates: Option<&[NaiveDate]> = None;
        for (instrument, ctx) in &contexts {
            match dates {
                None => dates = Some(ctx.dates()),
                Some(expected) if expected == ctx.dates() => {}
                Some(_) => {
                    return Err(AlphaloopError::Evaluation {
                        reason: format!("instrument {} is not date-aligned with the panel", instrument),
                    });
                }
            }
        }
        let len = dates.map(|d| d.len()).unwrap_or(0);
        Ok(Panel { contexts, len })
    }

    pub fn instruments(&self) -> impl Iterator<Item = &String> {
        self.contexts.keys()
    }

    pub fn context(&self, instrument: &str) -> Option<&SymbolContext> {
        self.contexts.get(instrument)
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Latest close per instrument, for sizing reference prices.
    pub fn last_closes(&self) -> BTreeMap<String, Value> {
        self.contexts
            .iter()
            .map(|(instrument, ctx)| (instrument.clone(), ctx.close.latest()))
            .collect()
    }
}

type Columns = BTreeMap<String, Series>;

/// Evaluate a program for a single instrument.
pub fn evaluate(program: &Program, ctx: &SymbolContext) -> Series {
    let mut contexts = BTreeMap::new();
    contexts.insert(String::new(), ctx.clone());
    let panel = Panel {
        len: ctx.len(),
        contexts,
    };
    eval(&program.root, &panel)
        .remove("")
        .expect("single-instrument panel always yields one column")
}

/// Evaluate a program across a panel, one series per instrument.
pub fn evaluate_panel(program: &Program, panel: &Panel) -> Columns {
    eval(&program.root, panel)
}

/// The latest evaluated point per instrument.
pub fn signal_vector(program: &Program, panel: &Panel) -> BTreeMap<String, Value> {
    evaluate_panel(program, panel)
        .into_iter()
        .map(|(instrument, series)| (instrument, series.latest()))
        .collect()
}

fn eval(expr: &Expr, panel: &Panel) -> Columns {
    match expr {
        Expr::Constant(v) => per_instrument(panel, |_| Series::constant(*v, panel.len())),
        Expr::Variable(var) => per_instrument(panel, |ctx| ctx.series(*var).clone()),
        Expr::Unary(op, operand) => {
            let cols = eval(operand, panel);
            map_columns(cols, |s| match op {
                UnaryOp::Plus => s,
                UnaryOp::Minus => s.map(|x| -x),
            })
        }
        Expr::Binary(op, left, right) => {
            let lhs = eval(left, panel);
            let rhs = eval(right, panel);
            zip_columns(lhs, rhs, |a, b| apply_binary(*op, a, b))
        }
        Expr::Compare(op, left, right) => {
            let lhs = eval(left, panel);
            let rhs = eval(right, panel);
            let op = *op;
            zip_columns(lhs, rhs, move |a, b| {
                a.zip_with(b, move |x, y| {
                    from_bool(match op {
                        CompareOp::Lt => x < y,
                        CompareOp::Le => x <= y,
                        CompareOp::Gt => x > y,
                        CompareOp::Ge => x >= y,
                        CompareOp::Eq => x == y,
                        CompareOp::Ne => x != y,
                    })
                })
            })
        }
        Expr::Not(operand) => {
            let cols = eval(operand, panel);
            map_columns(cols, |s| {
                Series::new(
                    s.iter()
                        .map(|v| truthy(v).map(|b| from_bool(!b)))
                        .collect(),
                )
            })
        }
        Expr::And(left, right) => {
            let lhs = eval(left, panel);
            let rhs = eval(right, panel);
            zip_columns(lhs, rhs, |a, b| bool_combine(a, b, BoolOp::And))
        }
        Expr::Or(left, right) => {
            let lhs = eval(left, panel);
            let rhs = eval(right, panel);
            zip_columns(lhs, rhs, |a, b| bool_combine(a, b, BoolOp::Or))
        }
        Expr::Ternary {
            cond,
            if_true,
            if_false,
        } => {
            let conds = eval(cond, panel);
            let trues = eval(if_true, panel);
            let falses = eval(if_false, panel);
            conds
                .into_iter()
                .map(|(instrument, cond)| {
                    let t = &trues[&instrument];
                    let f = &falses[&instrument];
                    let values = cond
                        .iter()
                        .enumerate()
                        .map(|(i, c)| match truthy(c) {
                            Some(true) => t.get(i),
                            Some(false) => f.get(i),
                            None => None,
                        })
                        .collect();
                    (instrument, Series::new(values))
                })
                .collect()
        }
        Expr::Call(call) => eval_call(call, panel),
    }
}

fn eval_call(call: &Call, panel: &Panel) -> Columns {
    match call {
        Call::Abs(operand) => map_columns(eval(operand, panel), |s| s.map(f64::abs)),
        Call::Sign(operand) => map_columns(eval(operand, panel), |s| {
            s.map(|x| {
                if x > 0.0 {
                    1.0
                } else if x < 0.0 {
                    -1.0
                } else {
                    0.0
                }
            })
        }),
        Call::Log(operand) => map_columns(eval(operand, panel), |s| {
            s.map_partial(|x| (x > 0.0).then(|| x.ln()))
        }),
        Call::Rank(operand) => cross_rank(eval(operand, panel), panel.len()),
        Call::IndNeutralize { operand, group } => {
            let values = eval(operand, panel);
            let groups = group.as_ref().map(|g| eval(g, panel));
            cross_demean(values, groups, panel.len())
        }
        Call::Delay { operand, lag } => {
            map_columns(eval(operand, panel), |s| rolling::delay(&s, *lag))
        }
        Call::Delta { operand, lag } => {
            map_columns(eval(operand, panel), |s| rolling::delta(&s, *lag))
        }
        Call::Rolling {
            stat,
            operand,
            window,
        } => map_columns(eval(operand, panel), |s| {
            rolling::rolling(*stat, &s, *window)
        }),
        Call::Pairwise {
            stat,
            left,
            right,
            window,
        } => {
            let lhs = eval(left, panel);
            let rhs = eval(right, panel);
            zip_columns(lhs, rhs, |a, b| rolling::rolling_pair(*stat, a, b, *window))
        }
    }
}

fn per_instrument(panel: &Panel, f: impl Fn(&SymbolContext) -> Series) -> Columns {
    panel
        .contexts
        .iter()
        .map(|(instrument, ctx)| (instrument.clone(), f(ctx)))
        .collect()
}

fn map_columns(cols: Columns, f: impl Fn(Series) -> Series) -> Columns {
    cols.into_iter()
        .map(|(instrument, series)| (instrument, f(series)))
        .collect()
}

fn zip_columns(lhs: Columns, rhs: Columns, f: impl Fn(&Series, &Series) -> Series) -> Columns {
    lhs.into_iter()
        .map(|(instrument, left)| {
            let right = &rhs[&instrument];
            let combined = f(&left, right);
            (instrument, combined)
        })
        .collect()
}

fn apply_binary(op: BinaryOp, a: &Series, b: &Series) -> Series {
    match op {
        BinaryOp::Add => a.zip_with(b, |x, y| x + y),
        BinaryOp::Sub => a.zip_with(b, |x, y| x - y),
        BinaryOp::Mul => a.zip_with(b, |x, y| x * y),
        BinaryOp::Div => a.zip_partial(b, |x, y| (y != 0.0).then(|| x / y)),
        BinaryOp::Mod => a.zip_partial(b, |x, y| (y != 0.0).then(|| x % y)),
        // powf produces NaN/inf for 0^negative and fractional powers of
        // negatives; zip_partial discards those as undefined.
        BinaryOp::Pow => a.zip_partial(b, |x, y| Some(x.powf(y))),
    }
}

enum BoolOp {
    And,
    Or,
}

/// Three-valued and/or: a defined dominant operand decides the result even
/// when the other side is undefined.
fn bool_combine(a: &Series, b: &Series, op: BoolOp) -> Series {
    let values = a
        .iter()
        .zip(b.iter())
        .map(|(x, y)| {
            let (tx, ty) = (truthy(x), truthy(y));
            match op {
                BoolOp::And => match (tx, ty) {
                    (Some(false), _) | (_, Some(false)) => Some(0.0),
                    (Some(true), Some(true)) => Some(1.0),
                    _ => None,
                },
                BoolOp::Or => match (tx, ty) {
                    (Some(true), _) | (_, Some(true)) => Some(1.0),
                    (Some(false), Some(false)) => Some(0.0),
                    _ => None,
                },
            }
        })
        .collect();
    Series::new(values)
}

/// Cross-sectional percentile rank minus 0.5 at each date.
///
/// Ties receive their average rank; instruments undefined at a date stay
/// undefined and do not count toward the denominator.
fn cross_rank(cols: Columns, len: usize) -> Columns {
    let instruments: Vec<String> = cols.keys().cloned().collect();
    let mut out: BTreeMap<String, Vec<Value>> = instruments
        .iter()
        .map(|i| (i.clone(), vec![None; len]))
        .collect();

    for t in 0..len {
        let snapshot: Vec<(&String, f64)> = instruments
            .iter()
            .filter_map(|i| cols[i].get(t).map(|v| (i, v)))
            .collect();
        let n = snapshot.len() as f64;
        for (instrument, value) in &snapshot {
            let below = snapshot.iter().filter(|(_, v)| v < value).count() as f64;
            let tied = snapshot.iter().filter(|(_, v)| v == value).count() as f64;
            // Average 1-based rank of the tie group.
            let rank = below + (tied + 1.0) / 2.0;
            out.get_mut(*instrument).expect("known instrument")[t] = defined(rank / n - 0.5);
        }
    }

    out.into_iter()
        .map(|(instrument, values)| (instrument, Series::new(values)))
        .collect()
}

/// Cross-sectional demean at each date, optionally within groups keyed by
/// a second expression's value.
fn cross_demean(cols: Columns, groups: Option<Columns>, len: usize) -> Columns {
    let instruments: Vec<String> = cols.keys().cloned().collect();
    let mut out: BTreeMap<String, Vec<Value>> = instruments
        .iter()
        .map(|i| (i.clone(), vec![None; len]))
        .collect();

    for t in 0..len {
        // Instruments with a defined value (and defined group, when
        // grouping) participate; the rest stay undefined at this date.
        let mut members: Vec<(&String, f64, u64)> = Vec::new();
        for instrument in &instruments {
            let Some(value) = cols[instrument].get(t) else {
                continue;
            };
            let key = match &groups {
                None => 0,
                Some(g) => match g[instrument].get(t) {
                    Some(k) => k.to_bits(),
                    None => continue,
                },
            };
            members.push((instrument, value, key));
        }

        let mut keys: Vec<u64> = members.iter().map(|(_, _, k)| *k).collect();
        keys.sort_unstable();
        keys.dedup();

        for key in keys {
            let group: Vec<&(&String, f64, u64)> =
                members.iter().filter(|(_, _, k)| *k == key).collect();
            let mean: f64 =
                group.iter().map(|(_, v, _)| v).sum::<f64>() / group.len() as f64;
            for (instrument, value, _) in group {
                out.get_mut(*instrument).expect("known instrument")[t] = defined(value - mean);
            }
        }
    }

    out.into_iter()
        .map(|(instrument, values)| (instrument, Series::new(values)))
        .collect()
}
