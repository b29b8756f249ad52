//! Forward-test run records and lifecycle phases.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::ports::broker_port::AccountRef;

/// Persistent identifier of a forward-test run, assigned by the run store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RunId(pub i64);

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The persisted record of a forward test. Created on start, closed on
/// stop, never deleted; `last_execution_date` is the only field mutated
/// during normal operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForwardTestRun {
    pub id: RunId,
    pub account: AccountRef,
    pub formula: String,
    pub tickers: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub running: bool,
    pub last_execution_date: Option<NaiveDate>,
    pub trade_on_weekends: bool,
}

/// Everything needed to create a run record; the store assigns the id.
#[derive(Debug, Clone)]
pub struct NewRun {
    pub account: AccountRef,
    pub formula: String,
    pub tickers: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub trade_on_weekends: bool,
}

/// In-memory lifecycle of one run's driver-side service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunPhase {
    Created,
    Initializing,
    Idle,
    Evaluating,
    Executing,
    Stopped,
}

impl RunPhase {
    pub fn name(self) -> &'static str {
        match self {
            RunPhase::Created => "created",
            RunPhase::Initializing => "initializing",
            RunPhase::Idle => "idle",
            RunPhase::Evaluating => "evaluating",
            RunPhase::Executing => "executing",
            RunPhase::Stopped => "stopped",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_record_round_trips_through_json() {
        let run = ForwardTestRun {
            id: RunId(7),
            account: AccountRef("sandbox-1".to_string()),
            formula: "sma(close, 5) - close".to_string(),
            tickers: vec!["SBER".to_string(), "GAZP".to_string()],
            started_at: "2024-03-01T10:00:00Z".parse().unwrap(),
            ended_at: None,
            running: true,
            last_execution_date: Some(NaiveDate::from_ymd_opt(2024, 3, 4).unwrap()),
            trade_on_weekends: false,
        };
        let json = serde_json::to_string(&run).unwrap();
        let back: ForwardTestRun = serde_json::from_str(&json).unwrap();
        assert_eq!(run, back);
    }

    #[test]
    fn phase_names() {
        assert_eq!(RunPhase::Idle.name(), "idle");
        assert_eq!(RunPhase::Evaluating.name(), "evaluating");
    }
}
