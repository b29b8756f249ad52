//! Per-run forward-test service.
//!
//! Owns one run's compiled program, resolved instrument set, and lifecycle
//! phase, and drives a single iteration: eligibility checks, market data
//! fetch, evaluate → neutralize → size → sequence, then the once-per-day
//! marker advance. The driver tears this instance down on any iteration
//! error and rebuilds it lazily from the persisted record.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Days, Utc};
use tracing::{debug, info, warn};

use crate::domain::calendar::TradingCalendar;
use crate::domain::candle::Candle;
use crate::domain::error::AlphaloopError;
use crate::domain::formula::Program;
use crate::domain::formula_eval::{signal_vector, Panel};
use crate::domain::formula_parser;
use crate::domain::neutralize::neutralize;
use crate::domain::run::{ForwardTestRun, RunPhase};
use crate::domain::sizing::{size, SizingError};
use crate::ports::broker_port::{AccountRef, BrokerPort, InstrumentMeta};
use crate::ports::run_store_port::RunStorePort;
use crate::scheduler::sequencer::{self, OrderResult};

/// Per-iteration tunables, read from `[scheduler]`/`[sizing]` config.
#[derive(Debug, Clone, Copy)]
pub struct IterationSettings {
    /// Fraction of portfolio value deployed by the sizer.
    pub safety_fraction: f64,
    /// Calendar days of history fetched before each evaluation.
    pub history_days: u64,
    /// Bound on every broker call.
    pub broker_timeout: Duration,
}

impl Default for IterationSettings {
    fn default() -> Self {
        IterationSettings {
            safety_fraction: 0.95,
            history_days: 60,
            broker_timeout: Duration::from_secs(10),
        }
    }
}

/// Why an eligible tick did not trade.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Outside the trading window or on a non-trading day.
    OutsideWindow,
    /// The once-per-day marker already points at today.
    AlreadyExecuted,
    /// A stop request was observed.
    Stopping,
}

/// Result of one iteration attempt.
#[derive(Debug)]
pub enum IterationOutcome {
    Skipped(SkipReason),
    Executed {
        orders: Vec<OrderResult>,
        sizing_errors: Vec<SizingError>,
    },
}

pub struct RunService {
    account: AccountRef,
    program: Program,
    /// Ticker → resolved metadata, fixed at initialization.
    instruments: BTreeMap<String, InstrumentMeta>,
    broker: Arc<dyn BrokerPort>,
    store: Arc<dyn RunStorePort>,
    calendar: TradingCalendar,
    settings: IterationSettings,
    stop: Arc<AtomicBool>,
    phase: RunPhase,
}

impl RunService {
    /// Build a service for a run: compile the formula, resolve the
    /// instrument set against the tradable universe, and load the current
    /// portfolio once. Any unresolved ticker is fatal; the run must not
    /// start.
    pub async fn initialize(
        account: AccountRef,
        formula: &str,
        tickers: &[String],
        broker: Arc<dyn BrokerPort>,
        store: Arc<dyn RunStorePort>,
        calendar: TradingCalendar,
        settings: IterationSettings,
        stop: Arc<AtomicBool>,
    ) -> Result<RunService, AlphaloopError> {
        debug!(account = %account, "initializing run service");

        let program = formula_parser::compile(formula)?;

        let resolved = bounded(
            settings.broker_timeout,
            broker.resolve_instruments(tickers),
        )
        .await?;
        let instruments: BTreeMap<String, InstrumentMeta> = resolved
            .into_iter()
            .map(|meta| (meta.ticker.clone(), meta))
            .collect();

        let missing: Vec<&String> = tickers
            .iter()
            .filter(|t| !instruments.contains_key(*t))
            .collect();
        if !missing.is_empty() {
            return Err(AlphaloopError::Initialization {
                reason: format!(
                    "unresolved instruments: {}",
                    missing
                        .iter()
                        .map(|s| s.as_str())
                        .collect::<Vec<_>>()
                        .join(", ")
                ),
            });
        }

        // Portfolio must be reachable before the run is considered live.
        bounded(settings.broker_timeout, broker.get_portfolio(&account)).await?;

        info!(
            account = %account,
            instruments = instruments.len(),
            cross_sectional = program.root.is_cross_sectional(),
            "run service initialized"
        );

        Ok(RunService {
            account,
            program,
            instruments,
            broker,
            store,
            calendar,
            settings,
            stop,
            phase: RunPhase::Idle,
        })
    }

    pub fn phase(&self) -> RunPhase {
        self.phase
    }

    /// Attempt one iteration for the given persisted record at `now`.
    ///
    /// The record is re-read by the driver each tick, so the
    /// last-execution-date guard always sees persisted state. A stop
    /// request is honored both here and again immediately before order
    /// submission.
    pub async fn iterate(
        &mut self,
        run: &ForwardTestRun,
        now: DateTime<Utc>,
    ) -> Result<IterationOutcome, AlphaloopError> {
        if self.stop.load(Ordering::SeqCst) {
            self.phase = RunPhase::Stopped;
            return Ok(IterationOutcome::Skipped(SkipReason::Stopping));
        }

        if !self.calendar.may_trade(now, run.trade_on_weekends) {
            debug!(run = %run.id, "outside trading window");
            return Ok(IterationOutcome::Skipped(SkipReason::OutsideWindow));
        }

        let today = self.calendar.local_date(now);
        if run.last_execution_date == Some(today) {
            debug!(run = %run.id, %today, "already executed today");
            return Ok(IterationOutcome::Skipped(SkipReason::AlreadyExecuted));
        }

        self.phase = RunPhase::Evaluating;
        info!(run = %run.id, %today, "starting daily iteration");

        // Positions and value are re-read from the broker every iteration.
        let portfolio = self
            .bounded(self.broker.get_portfolio(&self.account))
            .await?;

        let from = today - Days::new(self.settings.history_days);
        let mut histories: BTreeMap<String, Vec<Candle>> = BTreeMap::new();
        for (ticker, meta) in &self.instruments {
            let candles = self
                .bounded(self.broker.get_candles(&meta.id, from, today))
                .await?;
            debug!(run = %run.id, ticker = %ticker, candles = candles.len(), "history loaded");
            histories.insert(ticker.clone(), candles);
        }

        let panel = Panel::align(&histories);
        if panel.is_empty() {
            warn!(run = %run.id, "no overlapping history across instruments");
        }

        let signals = signal_vector(&self.program, &panel);
        for (ticker, signal) in &signals {
            debug!(run = %run.id, ticker = %ticker, signal = ?signal, "signal");
        }

        let weights = neutralize(&signals);

        let positions_by_ticker: BTreeMap<String, i64> = self
            .instruments
            .iter()
            .map(|(ticker, meta)| {
                let held = portfolio.positions.get(&meta.id).copied().unwrap_or(0);
                (ticker.clone(), held)
            })
            .collect();

        let sizing = size(
            &weights,
            portfolio.total_value,
            &positions_by_ticker,
            &self.instruments,
            &panel.last_closes(),
            self.settings.safety_fraction,
        );
        for err in &sizing.errors {
            warn!(run = %run.id, instrument = %err.instrument, reason = %err.reason, "sizing error");
        }

        // A stop issued while we were fetching data must win: no order may
        // carry a logical timestamp after the stop call.
        if self.stop.load(Ordering::SeqCst) {
            self.phase = RunPhase::Stopped;
            info!(run = %run.id, "stop observed before submission; aborting iteration");
            return Ok(IterationOutcome::Skipped(SkipReason::Stopping));
        }

        self.phase = RunPhase::Executing;
        // Order ids are routed by instrument id, not ticker.
        let intents: Vec<_> = sizing
            .intents
            .iter()
            .map(|intent| {
                let mut routed = intent.clone();
                routed.instrument = self.instruments[&intent.instrument].id.clone();
                routed
            })
            .collect();
        let orders = sequencer::execute(
            &intents,
            self.broker.as_ref(),
            &self.account,
            self.settings.broker_timeout,
        )
        .await;

        let failed = orders.iter().filter(|o| !o.is_ok()).count();
        if failed > 0 {
            warn!(run = %run.id, failed, total = orders.len(), "iteration completed with failed orders");
        }

        // At-most-once-per-day: the marker advances even when some orders
        // failed; those instruments wait for the next trading day.
        if !self.store.mark_executed(run.id, today)? {
            warn!(run = %run.id, %today, "execution marker was already advanced for today");
        }

        self.phase = RunPhase::Idle;
        info!(run = %run.id, orders = orders.len(), "iteration complete");

        Ok(IterationOutcome::Executed {
            orders,
            sizing_errors: sizing.errors,
        })
    }

    async fn bounded<T>(
        &self,
        fut: impl Future<Output = Result<T, AlphaloopError>>,
    ) -> Result<T, AlphaloopError> {
        bounded(self.settings.broker_timeout, fut).await
    }
}

/// Bound a broker call; an elapsed timer is a transient failure that
/// aborts only the current iteration.
async fn bounded<T>(
    limit: Duration,
    fut: impl Future<Output = Result<T, AlphaloopError>>,
) -> Result<T, AlphaloopError> {
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(AlphaloopError::TransientInfra {
            reason: format!("broker call exceeded {:?}", limit),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn bounded_times_out() {
        let result: Result<(), AlphaloopError> = bounded(Duration::from_millis(5), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;
        assert!(matches!(
            result,
            Err(AlphaloopError::TransientInfra { .. })
        ));
    }

    #[tokio::test]
    async fn bounded_passes_through() {
        let result = bounded(Duration::from_secs(1), async { Ok(42) }).await;
        assert_eq!(result.unwrap(), 42);
    }

    #[test]
    fn default_settings() {
        let s = IterationSettings::default();
        assert!((s.safety_fraction - 0.95).abs() < f64::EPSILON);
        assert_eq!(s.history_days, 60);
    }
}
