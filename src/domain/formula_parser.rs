//! Formula compiler.
//!
//! Recursive descent parser for the alpha formula grammar. Converts text to
//! a validated [`Program`] or a [`ParseError`] carrying the character
//! offset. Compilation either succeeds completely or fails; there is no
//! partial program.
//!
//! Grammar, loosest binding first:
//!
//! ```text
//! ternary    := or ('?' ternary ':' ternary)?
//! or         := and ('or' and)*
//! and        := not ('and' not)*
//! not        := 'not' not | comparison
//! comparison := additive (('<'|'<='|'>'|'>='|'=='|'!=') additive)?
//! additive   := term (('+'|'-') term)*
//! term       := power (('*'|'/'|'%') power)*
//! power      := unary ('^' power)?
//! unary      := ('+'|'-') unary | primary
//! primary    := number | variable | function '(' args ')' | '(' ternary ')'
//! ```
//!
//! Comparison chains, attribute access, subscripting, and any name outside
//! the fixed variable/function sets are compile errors.

use crate::domain::error::ParseError;
use crate::domain::formula::{
    BinaryOp, Call, CompareOp, Expr, PairwiseStat, Program, RollingStat, UnaryOp, Variable,
};

/// Compile formula text into a validated program.
///
/// Pure and deterministic: identical text always yields a structurally
/// identical [`Program`].
pub fn compile(input: &str) -> Result<Program, ParseError> {
    let mut parser = Parser::new(input);
    let root = parser.parse()?;
    Ok(Program { root })
}

struct Parser<'a> {
    input: &'a str,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn new(input: &'a str) -> Self {
        Self { input, pos: 0 }
    }

    fn remaining(&self) -> &'a str {
        &self.input[self.pos..]
    }

    fn peek(&self) -> Option<char> {
        self.remaining().chars().next()
    }

    fn advance(&mut self) -> Option<char> {
        let ch = self.peek()?;
        self.pos += ch.len_utf8();
        Some(ch)
    }

    fn skip_whitespace(&mut self) {
        while let Some(ch) = self.peek() {
            if ch.is_whitespace() {
                self.advance();
            } else {
                break;
            }
        }
    }

    fn error(&self, message: impl Into<String>) -> ParseError {
        ParseError {
            message: message.into(),
            position: self.pos,
        }
    }

    fn error_at(&self, position: usize, message: impl Into<String>) -> ParseError {
        ParseError {
            message: message.into(),
            position,
        }
    }

    fn expect_char(&mut self, expected: char) -> Result<(), ParseError> {
        self.skip_whitespace();
        match self.peek() {
            Some(ch) if ch == expected => {
                self.advance();
                Ok(())
            }
            Some(ch) => Err(self.error(format!("expected '{}', found '{}'", expected, ch))),
            None => Err(self.error(format!("expected '{}', found end of input", expected))),
        }
    }

    fn peek_word(&self) -> String {
        let mut word = String::new();
        for ch in self.remaining().chars() {
            if ch.is_alphanumeric() || ch == '_' {
                word.push(ch);
            } else {
                break;
            }
        }
        if word.is_empty() {
            self.peek()
                .map(|c| c.to_string())
                .unwrap_or_else(|| "end of input".to_string())
        } else {
            word
        }
    }

    fn peek_keyword(&self, keyword: &str) -> bool {
        let remaining = self.remaining();
        remaining.starts_with(keyword)
            && !remaining[keyword.len()..]
                .chars()
                .next()
                .map(|c| c.is_alphanumeric() || c == '_')
                .unwrap_or(false)
    }

    fn consume_keyword(&mut self, keyword: &str) -> bool {
        if self.peek_keyword(keyword) {
            self.pos += keyword.len();
            true
        } else {
            false
        }
    }

    fn consume_operator(&mut self, op: &str) -> bool {
        if self.remaining().starts_with(op) {
            self.pos += op.len();
            true
        } else {
            false
        }
    }

    fn parse_number(&mut self) -> Result<f64, ParseError> {
        let start = self.pos;
        let mut has_dot = false;
        let mut digits = 0;

        while let Some(ch) = self.peek() {
            if ch.is_ascii_digit() {
                digits += 1;
                self.advance();
            } else if ch == '.' && !has_dot {
                has_dot = true;
                self.advance();
            } else {
                break;
            }
        }

        if digits == 0 {
            return Err(self.error_at(start, "expected number"));
        }

        let num_str = &self.input[start..self.pos];
        num_str
            .parse::<f64>()
            .map_err(|_| self.error_at(start, format!("invalid number: {}", num_str)))
    }

    fn parse(&mut self) -> Result<Expr, ParseError> {
        let expr = self.parse_ternary()?;
        self.skip_whitespace();
        if self.pos < self.input.len() {
            return Err(self.error(format!(
                "unexpected input after formula: '{}'",
                self.remaining()
            )));
        }
        Ok(expr)
    }

    fn parse_ternary(&mut self) -> Result<Expr, ParseError> {
        let cond = self.parse_or()?;
        self.skip_whitespace();
        if self.peek() == Some('?') {
            self.advance();
            let if_true = self.parse_ternary()?;
            self.expect_char(':')?;
            let if_false = self.parse_ternary()?;
            return Ok(Expr::Ternary {
                cond: Box::new(cond),
                if_true: Box::new(if_true),
                if_false: Box::new(if_false),
            });
        }
        Ok(cond)
    }

    fn parse_or(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.parse_and()?;
        loop {
            self.skip_whitespace();
            if self.consume_keyword("or") {
                let right = self.parse_and()?;
                left = Expr::Or(Box::new(left), Box::new(right));
            } else {
                return Ok(left);
            }
        }
    }

    fn parse_and(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.parse_not()?;
        loop {
            self.skip_whitespace();
            if self.consume_keyword("and") {
                let right = self.parse_not()?;
                left = Expr::And(Box::new(left), Box::new(right));
            } else {
                return Ok(left);
            }
        }
    }

    fn parse_not(&mut self) -> Result<Expr, ParseError> {
        self.skip_whitespace();
        if self.consume_keyword("not") {
            let operand = self.parse_not()?;
            return Ok(Expr::Not(Box::new(operand)));
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> Result<Expr, ParseError> {
        let left = self.parse_additive()?;
        self.skip_whitespace();

        let op = if self.consume_operator("<=") {
            CompareOp::Le
        } else if self.consume_operator(">=") {
            CompareOp::Ge
        } else if self.consume_operator("==") {
            CompareOp::Eq
        } else if self.consume_operator("!=") {
            CompareOp::Ne
        } else if self.peek() == Some('<') {
            self.advance();
            CompareOp::Lt
        } else if self.peek() == Some('>') {
            self.advance();
            CompareOp::Gt
        } else {
            return Ok(left);
        };

        let right = self.parse_additive()?;

        self.skip_whitespace();
        let rest = self.remaining();
        if rest.starts_with('<')
            || rest.starts_with('>')
            || rest.starts_with("==")
            || rest.starts_with("!=")
        {
            return Err(self.error("chained comparisons are not supported"));
        }

        Ok(Expr::Compare(op, Box::new(left), Box::new(right)))
    }

    fn parse_additive(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.parse_term()?;
        loop {
            self.skip_whitespace();
            match self.peek() {
                Some('+') => {
                    self.advance();
                    let right = self.parse_term()?;
                    left = Expr::Binary(BinaryOp::Add, Box::new(left), Box::new(right));
                }
                Some('-') => {
                    self.advance();
                    let right = self.parse_term()?;
                    left = Expr::Binary(BinaryOp::Sub, Box::new(left), Box::new(right));
                }
                _ => return Ok(left),
            }
        }
    }

    fn parse_term(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.parse_power()?;
        loop {
            self.skip_whitespace();
            match self.peek() {
                Some('*') => {
                    self.advance();
                    let right = self.parse_power()?;
                    left = Expr::Binary(BinaryOp::Mul, Box::new(left), Box::new(right));
                }
                Some('/') => {
                    self.advance();
                    let right = self.parse_power()?;
                    left = Expr::Binary(BinaryOp::Div, Box::new(left), Box::new(right));
                }
                Some('%') => {
                    self.advance();
                    let right = self.parse_power()?;
                    left = Expr::Binary(BinaryOp::Mod, Box::new(left), Box::new(right));
                }
                _ => return Ok(left),
            }
        }
    }

    fn parse_power(&mut self) -> Result<Expr, ParseError> {
        let base = self.parse_unary()?;
        self.skip_whitespace();
        if self.peek() == Some('^') {
            self.advance();
            // Right-associative: 2^3^2 is 2^(3^2).
            let exponent = self.parse_power()?;
            return Ok(Expr::Binary(
                BinaryOp::Pow,
                Box::new(base),
                Box::new(exponent),
            ));
        }
        Ok(base)
    }

    fn parse_unary(&mut self) -> Result<Expr, ParseError> {
        self.skip_whitespace();
        match self.peek() {
            Some('+') => {
                self.advance();
                let operand = self.parse_unary()?;
                Ok(Expr::Unary(UnaryOp::Plus, Box::new(operand)))
            }
            Some('-') => {
                self.advance();
                let operand = self.parse_unary()?;
                Ok(Expr::Unary(UnaryOp::Minus, Box::new(operand)))
            }
            _ => self.parse_primary(),
        }
    }

    fn parse_primary(&mut self) -> Result<Expr, ParseError> {
        self.skip_whitespace();

        match self.peek() {
            Some('(') => {
                self.advance();
                let inner = self.parse_ternary()?;
                self.expect_char(')')?;
                return Ok(inner);
            }
            Some(ch) if ch.is_ascii_digit() || ch == '.' => {
                let value = self.parse_number()?;
                return Ok(Expr::Constant(value));
            }
            _ => {}
        }

        let start = self.pos;
        match self.peek() {
            None => return Err(self.error("expected expression, found end of input")),
            Some(ch) if !(ch.is_alphabetic() || ch == '_') => {
                return Err(self.error(format!("expected expression, found '{}'", ch)));
            }
            _ => {}
        }
        let word = self.peek_word();
        self.pos += word.len();

        self.skip_whitespace();
        if self.peek() == Some('(') {
            return self.parse_call(&word, start);
        }

        match Variable::from_name(&word) {
            Some(var) => Ok(Expr::Variable(var)),
            None => Err(self.error_at(start, format!("unknown variable '{}'", word))),
        }
    }

    fn parse_args(&mut self) -> Result<Vec<(Expr, usize)>, ParseError> {
        self.expect_char('(')?;
        let mut args = Vec::new();

        self.skip_whitespace();
        if self.peek() == Some(')') {
            self.advance();
            return Ok(args);
        }

        loop {
            self.skip_whitespace();
            let start = self.pos;
            let arg = self.parse_ternary()?;
            args.push((arg, start));

            self.skip_whitespace();
            match self.peek() {
                Some(',') => {
                    self.advance();
                }
                Some(')') => {
                    self.advance();
                    return Ok(args);
                }
                Some(ch) => {
                    return Err(self.error(format!("expected ',' or ')', found '{}'", ch)));
                }
                None => return Err(self.error("expected ',' or ')', found end of input")),
            }
        }
    }

    /// Lag and window arguments must be non-negative integer literals; an
    /// expression there would let a formula smuggle in a negative lag.
    fn count_arg(&self, arg: &(Expr, usize), func: &str, what: &str) -> Result<usize, ParseError> {
        match arg.0 {
            Expr::Constant(v) if v >= 0.0 && v.fract() == 0.0 && v <= u32::MAX as f64 => {
                Ok(v as usize)
            }
            _ => Err(self.error_at(
                arg.1,
                format!("{} expects a non-negative integer {}", func, what),
            )),
        }
    }

    fn arity_error(&self, start: usize, func: &str, expected: &str, found: usize) -> ParseError {
        self.error_at(
            start,
            format!("{} expects {} argument(s), found {}", func, expected, found),
        )
    }

    fn parse_call(&mut self, name: &str, start: usize) -> Result<Expr, ParseError> {
        let args = self.parse_args()?;
        let found = args.len();

        let unary = |args: Vec<(Expr, usize)>| Box::new(args.into_iter().next().unwrap().0);

        let call = match name {
            "abs" | "sign" | "log" | "rank" => {
                if found != 1 {
                    return Err(self.arity_error(start, name, "1", found));
                }
                match name {
                    "abs" => Call::Abs(unary(args)),
                    "sign" => Call::Sign(unary(args)),
                    "log" => Call::Log(unary(args)),
                    _ => Call::Rank(unary(args)),
                }
            }
            "indneutralize" => {
                if found != 1 && found != 2 {
                    return Err(self.arity_error(start, name, "1 or 2", found));
                }
                let mut iter = args.into_iter();
                let operand = Box::new(iter.next().unwrap().0);
                let group = iter.next().map(|(expr, _)| Box::new(expr));
                Call::IndNeutralize { operand, group }
            }
            "delay" | "delta" => {
                if found != 2 {
                    return Err(self.arity_error(start, name, "2", found));
                }
                let lag = self.count_arg(&args[1], name, "lag")?;
                let operand = Box::new(args.into_iter().next().unwrap().0);
                if name == "delay" {
                    Call::Delay { operand, lag }
                } else {
                    Call::Delta { operand, lag }
                }
            }
            "mean" | "sma" | "stddev" | "min" | "max" | "sum" | "product" | "ts_argmax"
            | "ts_argmin" => {
                if found != 2 {
                    return Err(self.arity_error(start, name, "2", found));
                }
                let window = self.count_arg(&args[1], name, "window")?;
                let operand = Box::new(args.into_iter().next().unwrap().0);
                let stat = match name {
                    "mean" | "sma" => RollingStat::Mean,
                    "stddev" => RollingStat::Stddev,
                    "min" => RollingStat::Min,
                    "max" => RollingStat::Max,
                    "sum" => RollingStat::Sum,
                    "product" => RollingStat::Product,
                    "ts_argmax" => RollingStat::ArgMax,
                    _ => RollingStat::ArgMin,
                };
                Call::Rolling {
                    stat,
                    operand,
                    window,
                }
            }
            "correlation" | "covariance" => {
                if found != 3 {
                    return Err(self.arity_error(start, name, "3", found));
                }
                let window = self.count_arg(&args[2], name, "window")?;
                let mut iter = args.into_iter();
                let left = Box::new(iter.next().unwrap().0);
                let right = Box::new(iter.next().unwrap().0);
                let stat = if name == "correlation" {
                    PairwiseStat::Correlation
                } else {
                    PairwiseStat::Covariance
                };
                Call::Pairwise {
                    stat,
                    left,
                    right,
                    window,
                }
            }
            _ => return Err(self.error_at(start, format!("unknown function '{}'", name))),
        };

        Ok(Expr::Call(call))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(input: &str) -> Result<Expr, ParseError> {
        compile(input).map(|p| p.root)
    }

    #[test]
    fn parse_constant() {
        assert_eq!(parse("42").unwrap(), Expr::Constant(42.0));
        assert_eq!(parse("1.5").unwrap(), Expr::Constant(1.5));
        assert_eq!(parse(".5").unwrap(), Expr::Constant(0.5));
    }

    #[test]
    fn parse_variables() {
        for (text, var) in [
            ("open", Variable::Open),
            ("high", Variable::High),
            ("low", Variable::Low),
            ("close", Variable::Close),
            ("volume", Variable::Volume),
            ("returns", Variable::Returns),
        ] {
            assert_eq!(parse(text).unwrap(), Expr::Variable(var));
        }
    }

    #[test]
    fn parse_arithmetic_precedence() {
        // 1 + 2 * 3 parses as 1 + (2 * 3)
        let expr = parse("1 + 2 * 3").unwrap();
        assert_eq!(
            expr,
            Expr::Binary(
                BinaryOp::Add,
                Box::new(Expr::Constant(1.0)),
                Box::new(Expr::Binary(
                    BinaryOp::Mul,
                    Box::new(Expr::Constant(2.0)),
                    Box::new(Expr::Constant(3.0)),
                )),
            )
        );
    }

    #[test]
    fn parse_power_right_associative() {
        let expr = parse("2 ^ 3 ^ 2").unwrap();
        assert_eq!(
            expr,
            Expr::Binary(
                BinaryOp::Pow,
                Box::new(Expr::Constant(2.0)),
                Box::new(Expr::Binary(
                    BinaryOp::Pow,
                    Box::new(Expr::Constant(3.0)),
                    Box::new(Expr::Constant(2.0)),
                )),
            )
        );
    }

    #[test]
    fn parse_power_binds_tighter_than_mul() {
        let expr = parse("2 * 3 ^ 2").unwrap();
        assert!(matches!(expr, Expr::Binary(BinaryOp::Mul, _, _)));
    }

    #[test]
    fn parse_modulo() {
        let expr = parse("volume % 2").unwrap();
        assert!(matches!(expr, Expr::Binary(BinaryOp::Mod, _, _)));
    }

    #[test]
    fn parse_unary_minus() {
        let expr = parse("-close").unwrap();
        assert_eq!(
            expr,
            Expr::Unary(UnaryOp::Minus, Box::new(Expr::Variable(Variable::Close)))
        );
    }

    #[test]
    fn parse_double_unary() {
        let expr = parse("--1").unwrap();
        assert_eq!(
            expr,
            Expr::Unary(
                UnaryOp::Minus,
                Box::new(Expr::Unary(UnaryOp::Minus, Box::new(Expr::Constant(1.0)))),
            )
        );
    }

    #[test]
    fn parse_comparisons() {
        for (text, op) in [
            ("close < 100", CompareOp::Lt),
            ("close <= 100", CompareOp::Le),
            ("close > 100", CompareOp::Gt),
            ("close >= 100", CompareOp::Ge),
            ("close == 100", CompareOp::Eq),
            ("close != 100", CompareOp::Ne),
        ] {
            let expr = parse(text).unwrap();
            match expr {
                Expr::Compare(found, _, _) => assert_eq!(found, op, "for {}", text),
                other => panic!("expected comparison for {}, got {:?}", text, other),
            }
        }
    }

    #[test]
    fn error_chained_comparison() {
        let err = parse("1 < close < 100").unwrap_err();
        assert!(err.message.contains("chained comparisons"));
    }

    #[test]
    fn parse_boolean_operators() {
        let expr = parse("close > 1 and volume > 0 or returns > 0").unwrap();
        // or is loosest: (and ...) or (...)
        assert!(matches!(expr, Expr::Or(_, _)));

        let expr = parse("not close > 100").unwrap();
        assert!(matches!(expr, Expr::Not(_)));
    }

    #[test]
    fn parse_ternary() {
        let expr = parse("close > 100 ? 1 : -1").unwrap();
        match expr {
            Expr::Ternary {
                cond,
                if_true,
                if_false,
            } => {
                assert!(matches!(*cond, Expr::Compare(CompareOp::Gt, _, _)));
                assert_eq!(*if_true, Expr::Constant(1.0));
                assert!(matches!(*if_false, Expr::Unary(UnaryOp::Minus, _)));
            }
            other => panic!("expected ternary, got {:?}", other),
        }
    }

    #[test]
    fn parse_nested_ternary_right_associative() {
        let expr = parse("close > 2 ? 1 : close > 1 ? 2 : 3").unwrap();
        match expr {
            Expr::Ternary { if_false, .. } => {
                assert!(matches!(*if_false, Expr::Ternary { .. }));
            }
            other => panic!("expected ternary, got {:?}", other),
        }
    }

    #[test]
    fn parse_rolling_calls() {
        for (text, stat) in [
            ("mean(close, 5)", RollingStat::Mean),
            ("sma(close, 5)", RollingStat::Mean),
            ("stddev(close, 20)", RollingStat::Stddev),
            ("min(low, 10)", RollingStat::Min),
            ("max(high, 10)", RollingStat::Max),
            ("sum(volume, 5)", RollingStat::Sum),
            ("product(returns, 3)", RollingStat::Product),
            ("ts_argmax(close, 5)", RollingStat::ArgMax),
            ("ts_argmin(close, 5)", RollingStat::ArgMin),
        ] {
            let expr = parse(text).unwrap();
            match expr {
                Expr::Call(Call::Rolling { stat: found, .. }) => {
                    assert_eq!(found, stat, "for {}", text)
                }
                other => panic!("expected rolling call for {}, got {:?}", text, other),
            }
        }
    }

    #[test]
    fn sma_is_mean() {
        assert_eq!(parse("sma(close, 5)").unwrap(), parse("mean(close, 5)").unwrap());
    }

    #[test]
    fn parse_pairwise_calls() {
        let expr = parse("correlation(close, volume, 10)").unwrap();
        match expr {
            Expr::Call(Call::Pairwise { stat, window, .. }) => {
                assert_eq!(stat, PairwiseStat::Correlation);
                assert_eq!(window, 10);
            }
            other => panic!("expected pairwise call, got {:?}", other),
        }

        let expr = parse("covariance(high, low, 5)").unwrap();
        assert!(matches!(
            expr,
            Expr::Call(Call::Pairwise {
                stat: PairwiseStat::Covariance,
                ..
            })
        ));
    }

    #[test]
    fn parse_delay_delta() {
        let expr = parse("delay(close, 3)").unwrap();
        assert!(matches!(expr, Expr::Call(Call::Delay { lag: 3, .. })));

        let expr = parse("delta(close, 1)").unwrap();
        assert!(matches!(expr, Expr::Call(Call::Delta { lag: 1, .. })));
    }

    #[test]
    fn parse_simple_calls() {
        assert!(matches!(parse("abs(returns)").unwrap(), Expr::Call(Call::Abs(_))));
        assert!(matches!(parse("sign(returns)").unwrap(), Expr::Call(Call::Sign(_))));
        assert!(matches!(parse("log(close)").unwrap(), Expr::Call(Call::Log(_))));
        assert!(matches!(parse("rank(close)").unwrap(), Expr::Call(Call::Rank(_))));
    }

    #[test]
    fn parse_indneutralize_arities() {
        let one = parse("indneutralize(close)").unwrap();
        assert!(matches!(
            one,
            Expr::Call(Call::IndNeutralize { group: None, .. })
        ));

        let two = parse("indneutralize(close, volume)").unwrap();
        assert!(matches!(
            two,
            Expr::Call(Call::IndNeutralize { group: Some(_), .. })
        ));

        let err = parse("indneutralize(close, volume, open)").unwrap_err();
        assert!(err.message.contains("1 or 2"));
    }

    #[test]
    fn parse_nested_calls() {
        let expr = parse("rank(ts_argmax(sign(returns) * abs(returns) ^ 2, 5))").unwrap();
        assert!(matches!(expr, Expr::Call(Call::Rank(_))));
    }

    #[test]
    fn parse_whitespace_insensitive() {
        assert_eq!(
            parse("  sma( close ,  5 )  -  close ").unwrap(),
            parse("sma(close,5)-close").unwrap()
        );
    }

    #[test]
    fn compile_is_deterministic() {
        let text = "rank(stddev(returns, 20)) > 0.3 ? -delta(close, 1) : sma(close, 5) - close";
        assert_eq!(compile(text).unwrap(), compile(text).unwrap());
    }

    #[test]
    fn error_unknown_variable() {
        let err = parse("vwap + 1").unwrap_err();
        assert!(err.message.contains("unknown variable 'vwap'"));
        assert_eq!(err.position, 0);
    }

    #[test]
    fn error_unknown_function() {
        let err = parse("magic(close, 5)").unwrap_err();
        assert!(err.message.contains("unknown function 'magic'"));
    }

    #[test]
    fn error_case_sensitive_names() {
        assert!(parse("Close").is_err());
        assert!(parse("SMA(close, 5)").is_err());
        assert!(parse("close AND volume").is_err());
    }

    #[test]
    fn error_wrong_arity() {
        let err = parse("abs(close, 5)").unwrap_err();
        assert!(err.message.contains("abs expects 1 argument(s), found 2"));

        let err = parse("mean(close)").unwrap_err();
        assert!(err.message.contains("mean expects 2 argument(s), found 1"));

        let err = parse("correlation(close, volume)").unwrap_err();
        assert!(err.message.contains("correlation expects 3 argument(s), found 2"));
    }

    #[test]
    fn error_non_integer_window() {
        let err = parse("mean(close, 2.5)").unwrap_err();
        assert!(err.message.contains("non-negative integer window"));

        let err = parse("delay(close, -1)").unwrap_err();
        assert!(err.message.contains("non-negative integer lag"));

        let err = parse("sum(close, volume)").unwrap_err();
        assert!(err.message.contains("non-negative integer window"));
    }

    #[test]
    fn error_attribute_access() {
        let err = parse("close.shift").unwrap_err();
        assert!(err.message.contains("unexpected input"));
    }

    #[test]
    fn error_subscripting() {
        let err = parse("close[0]").unwrap_err();
        assert!(err.message.contains("unexpected input"));
    }

    #[test]
    fn error_lambda_like_input() {
        assert!(parse("lambda x: x + 1").is_err());
        assert!(parse("[c for c in close]").is_err());
    }

    #[test]
    fn error_trailing_input() {
        let err = parse("close + 1 garbage").unwrap_err();
        assert!(err.message.contains("unexpected input"));
    }

    #[test]
    fn error_empty_input() {
        assert!(parse("").is_err());
        assert!(parse("   ").is_err());
    }

    #[test]
    fn error_unbalanced_parens() {
        let err = parse("(close + 1").unwrap_err();
        assert!(err.message.contains("expected ')'"));

        let err = parse("mean(close, 5").unwrap_err();
        assert!(err.message.contains("expected ',' or ')'"));
    }

    #[test]
    fn error_empty_call() {
        let err = parse("abs()").unwrap_err();
        assert!(err.message.contains("abs expects 1 argument(s), found 0"));
    }

    #[test]
    fn error_missing_operand() {
        let err = parse("close +").unwrap_err();
        assert!(err.message.contains("expected"));
    }

    #[test]
    fn window_zero_compiles() {
        // An empty window is legal at compile time; it evaluates to
        // undefined everywhere.
        assert!(parse("mean(close, 0)").is_ok());
        assert!(parse("delay(close, 0)").is_ok());
    }

    #[test]
    fn alpha_one_shape_compiles() {
        // The canonical alpha#1-style formula exercises most of the grammar.
        let text = "rank(ts_argmax((returns < 0 ? stddev(returns, 20) : close) ^ 2, 5)) - 0.5";
        assert!(compile(text).is_ok());
    }

    proptest::proptest! {
        #[test]
        fn determinism_over_random_windows(w in 1usize..200) {
            let text = format!("sma(close, {}) - delay(close, {})", w, w / 2);
            let first = compile(&text).unwrap();
            let second = compile(&text).unwrap();
            proptest::prop_assert_eq!(first, second);
        }

        #[test]
        fn garbage_never_panics(input in "[a-z0-9+*/()., ?:^%<>=!-]{0,40}") {
            let _ = compile(&input);
        }
    }
}
