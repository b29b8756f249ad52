//! Formula AST data structures.
//!
//! The grammar is closed: every node kind, variable, and function lives in
//! a fixed enum, so "is this construct allowed" is settled by the type
//! system rather than a runtime name list. Window and lag arguments are
//! parsed into `usize` fields at compile time; a formula that reaches
//! [`Program`] form cannot name an unknown symbol or call with the wrong
//! arity.

/// The fixed set of input symbols a formula may reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Variable {
    Open,
    High,
    Low,
    Close,
    Volume,
    Returns,
}

impl Variable {
    pub const ALL: [Variable; 6] = [
        Variable::Open,
        Variable::High,
        Variable::Low,
        Variable::Close,
        Variable::Volume,
        Variable::Returns,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Variable::Open => "open",
            Variable::High => "high",
            Variable::Low => "low",
            Variable::Close => "close",
            Variable::Volume => "volume",
            Variable::Returns => "returns",
        }
    }

    pub fn from_name(name: &str) -> Option<Variable> {
        Variable::ALL.into_iter().find(|v| v.name() == name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Plus,
    Minus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Pow,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
}

/// Rolling statistics over the W observations strictly before each point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RollingStat {
    Mean,
    Stddev,
    Min,
    Max,
    Sum,
    Product,
    ArgMax,
    ArgMin,
}

impl RollingStat {
    pub fn name(self) -> &'static str {
        match self {
            RollingStat::Mean => "mean",
            RollingStat::Stddev => "stddev",
            RollingStat::Min => "min",
            RollingStat::Max => "max",
            RollingStat::Sum => "sum",
            RollingStat::Product => "product",
            RollingStat::ArgMax => "ts_argmax",
            RollingStat::ArgMin => "ts_argmin",
        }
    }
}

/// Rolling statistics over two series at once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairwiseStat {
    Correlation,
    Covariance,
}

impl PairwiseStat {
    pub fn name(self) -> &'static str {
        match self {
            PairwiseStat::Correlation => "correlation",
            PairwiseStat::Covariance => "covariance",
        }
    }
}

/// A validated function application.
///
/// Lag and window counts are plain fields, not sub-expressions: the parser
/// only accepts non-negative integer literals there, which is what rules
/// out lookahead through a negative lag.
#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    Abs(Box<Expr>),
    Sign(Box<Expr>),
    Log(Box<Expr>),
    /// Cross-sectional percentile rank minus 0.5.
    Rank(Box<Expr>),
    /// Cross-sectional demean, optionally within groups.
    IndNeutralize {
        operand: Box<Expr>,
        group: Option<Box<Expr>>,
    },
    Delay {
        operand: Box<Expr>,
        lag: usize,
    },
    Delta {
        operand: Box<Expr>,
        lag: usize,
    },
    Rolling {
        stat: RollingStat,
        operand: Box<Expr>,
        window: usize,
    },
    Pairwise {
        stat: PairwiseStat,
        left: Box<Expr>,
        right: Box<Expr>,
        window: usize,
    },
}

/// A formula expression node.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Constant(f64),
    Variable(Variable),
    Unary(UnaryOp, Box<Expr>),
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
    Compare(CompareOp, Box<Expr>, Box<Expr>),
    Not(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Ternary {
        cond: Box<Expr>,
        if_true: Box<Expr>,
        if_false: Box<Expr>,
    },
    Call(Call),
}

impl Expr {
    /// Whether the expression contains a cross-sectional operation
    /// (`rank` or `indneutralize`) anywhere in its tree.
    pub fn is_cross_sectional(&self) -> bool {
        match self {
            Expr::Constant(_) | Expr::Variable(_) => false,
            Expr::Unary(_, e) | Expr::Not(e) => e.is_cross_sectional(),
            Expr::Binary(_, a, b) | Expr::Compare(_, a, b) | Expr::And(a, b) | Expr::Or(a, b) => {
                a.is_cross_sectional() || b.is_cross_sectional()
            }
            Expr::Ternary {
                cond,
                if_true,
                if_false,
            } => {
                cond.is_cross_sectional()
                    || if_true.is_cross_sectional()
                    || if_false.is_cross_sectional()
            }
            Expr::Call(call) => match call {
                Call::Rank(_) | Call::IndNeutralize { .. } => true,
                Call::Abs(e) | Call::Sign(e) | Call::Log(e) => e.is_cross_sectional(),
                Call::Delay { operand, .. }
                | Call::Delta { operand, .. }
                | Call::Rolling { operand, .. } => operand.is_cross_sectional(),
                Call::Pairwise { left, right, .. } => {
                    left.is_cross_sectional() || right.is_cross_sectional()
                }
            },
        }
    }
}

/// A compiled, validated formula.
///
/// Compiling the same text twice yields structurally equal programs, so
/// `PartialEq` here is the determinism check.
#[derive(Debug, Clone, PartialEq)]
pub struct Program {
    pub root: Expr,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn variable_name_round_trip() {
        for v in Variable::ALL {
            assert_eq!(Variable::from_name(v.name()), Some(v));
        }
        assert_eq!(Variable::from_name("vwap"), None);
        assert_eq!(Variable::from_name("Close"), None);
    }

    #[test]
    fn cross_sectional_detection() {
        let plain = Expr::Binary(
            BinaryOp::Sub,
            Box::new(Expr::Variable(Variable::Close)),
            Box::new(Expr::Call(Call::Rolling {
                stat: RollingStat::Mean,
                operand: Box::new(Expr::Variable(Variable::Close)),
                window: 5,
            })),
        );
        assert!(!plain.is_cross_sectional());

        let ranked = Expr::Call(Call::Rank(Box::new(plain)));
        assert!(ranked.is_cross_sectional());
    }

    #[test]
    fn program_structural_equality() {
        let a = Program {
            root: Expr::Constant(1.0),
        };
        let b = Program {
            root: Expr::Constant(1.0),
        };
        let c = Program {
            root: Expr::Constant(2.0),
        };
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
