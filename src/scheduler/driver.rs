//! Polling driver and in-process API for forward tests.
//!
//! One [`ForwardTester`] polls every active run on a fixed interval.
//! Iterations for distinct runs proceed concurrently; a per-run lock makes
//! overlapping iterations of the same run impossible; a tick that finds a
//! run still iterating skips it. A run whose iteration fails is torn down
//! in memory and lazily reinitialized from its untouched persisted record
//! on a later tick.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, error, info, warn};

use crate::domain::calendar::TradingCalendar;
use crate::domain::error::AlphaloopError;
use crate::domain::run::{ForwardTestRun, NewRun, RunId, RunPhase};
use crate::ports::broker_port::{AccountRef, BrokerPort, EquityPoint};
use crate::ports::config_port::ConfigPort;
use crate::ports::run_store_port::RunStorePort;
use crate::scheduler::service::{IterationOutcome, IterationSettings, RunService};

/// Driver-level tunables.
#[derive(Debug, Clone, Copy)]
pub struct SchedulerSettings {
    /// Fixed polling cadence of the driver loop.
    pub poll_interval: Duration,
    pub iteration: IterationSettings,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        SchedulerSettings {
            poll_interval: Duration::from_secs(300),
            iteration: IterationSettings::default(),
        }
    }
}

impl SchedulerSettings {
    pub fn from_config(config: &dyn ConfigPort) -> Self {
        let default = Self::default();
        SchedulerSettings {
            poll_interval: Duration::from_secs(
                config.get_int(
                    "scheduler",
                    "poll_seconds",
                    default.poll_interval.as_secs() as i64,
                ) as u64,
            ),
            iteration: IterationSettings {
                safety_fraction: config.get_double(
                    "sizing",
                    "safety_fraction",
                    default.iteration.safety_fraction,
                ),
                history_days: config.get_int(
                    "scheduler",
                    "history_days",
                    default.iteration.history_days as i64,
                ) as u64,
                broker_timeout: Duration::from_secs(
                    config.get_int(
                        "scheduler",
                        "broker_timeout_seconds",
                        default.iteration.broker_timeout.as_secs() as i64,
                    ) as u64,
                ),
            },
        }
    }
}

/// Everything needed to start a forward test. The formula text comes from
/// an external alpha-management component; it is not stored here beyond
/// the run record.
#[derive(Debug, Clone)]
pub struct StartRequest {
    pub account: AccountRef,
    pub formula: String,
    pub tickers: Vec<String>,
    pub trade_on_weekends: bool,
}

/// In-memory state for one run: the lazily built service and its stop flag.
struct RunHandle {
    service: AsyncMutex<Option<RunService>>,
    stop: Arc<AtomicBool>,
}

impl RunHandle {
    fn new() -> Arc<RunHandle> {
        Arc::new(RunHandle {
            service: AsyncMutex::new(None),
            stop: Arc::new(AtomicBool::new(false)),
        })
    }
}

pub struct ForwardTester {
    broker: Arc<dyn BrokerPort>,
    store: Arc<dyn RunStorePort>,
    calendar: TradingCalendar,
    settings: SchedulerSettings,
    handles: Mutex<HashMap<RunId, Arc<RunHandle>>>,
}

impl ForwardTester {
    pub fn new(
        broker: Arc<dyn BrokerPort>,
        store: Arc<dyn RunStorePort>,
        calendar: TradingCalendar,
        settings: SchedulerSettings,
    ) -> Self {
        ForwardTester {
            broker,
            store,
            calendar,
            settings,
            handles: Mutex::new(HashMap::new()),
        }
    }

    /// Start a forward test. Initialization runs eagerly: a formula that
    /// does not compile or a ticker that does not resolve means no record
    /// is created and the run is never marked started.
    pub async fn start_run(&self, request: StartRequest) -> Result<RunId, AlphaloopError> {
        info!(account = %request.account, tickers = request.tickers.len(), "starting forward test");

        let handle = RunHandle::new();
        let service = RunService::initialize(
            request.account.clone(),
            &request.formula,
            &request.tickers,
            Arc::clone(&self.broker),
            Arc::clone(&self.store),
            self.calendar,
            self.settings.iteration,
            Arc::clone(&handle.stop),
        )
        .await?;

        let record = self.store.create_run(NewRun {
            account: request.account,
            formula: request.formula,
            tickers: request.tickers,
            started_at: Utc::now(),
            trade_on_weekends: request.trade_on_weekends,
        })?;

        *handle.service.try_lock().expect("fresh handle is uncontended") = Some(service);
        self.handles
            .lock()
            .expect("handle map lock")
            .insert(record.id, handle);

        info!(run = %record.id, "forward test started");
        Ok(record.id)
    }

    /// Stop a run: raise the stop flag so an in-flight iteration aborts
    /// before submitting, close the broker-side account, and close the
    /// record (end timestamp + running flag in one store update).
    pub async fn stop_run(&self, id: RunId) -> Result<(), AlphaloopError> {
        let record = self
            .store
            .get_run(id)?
            .ok_or(AlphaloopError::RunNotFound { id: id.0 })?;
        if !record.running {
            return Err(AlphaloopError::RunNotActive { id: id.0 });
        }

        if let Some(handle) = self.handles.lock().expect("handle map lock").get(&id) {
            handle.stop.store(true, Ordering::SeqCst);
        }

        self.broker.close_account(&record.account).await?;
        self.store.close_run(id, Utc::now())?;
        self.handles.lock().expect("handle map lock").remove(&id);

        info!(run = %id, "forward test stopped");
        Ok(())
    }

    /// Portfolio value over time for a run, live or already stopped.
    pub async fn get_history(&self, id: RunId) -> Result<Vec<EquityPoint>, AlphaloopError> {
        let record = self
            .store
            .get_run(id)?
            .ok_or(AlphaloopError::RunNotFound { id: id.0 })?;
        let from = record.started_at.date_naive();
        let to = record
            .ended_at
            .map(|t| t.date_naive())
            .unwrap_or_else(|| Utc::now().date_naive());
        self.broker
            .get_value_history(&record.account, from, to)
            .await
    }

    pub fn list_active(&self) -> Result<Vec<ForwardTestRun>, AlphaloopError> {
        self.store.list_active_runs()
    }

    /// One polling pass over every active run.
    pub async fn tick(&self, now: DateTime<Utc>) {
        let records = match self.store.list_active_runs() {
            Ok(records) => records,
            Err(err) => {
                error!(error = %err, "failed to list active runs");
                return;
            }
        };
        debug!(active = records.len(), "driver tick");

        // Drop in-memory state for runs no longer active in the store.
        {
            let mut handles = self.handles.lock().expect("handle map lock");
            let active: std::collections::HashSet<RunId> =
                records.iter().map(|r| r.id).collect();
            handles.retain(|id, _| active.contains(id));
        }

        let mut tasks = Vec::with_capacity(records.len());
        for record in records {
            let handle = {
                let mut handles = self.handles.lock().expect("handle map lock");
                Arc::clone(handles.entry(record.id).or_insert_with(RunHandle::new))
            };
            let broker = Arc::clone(&self.broker);
            let store = Arc::clone(&self.store);
            let calendar = self.calendar;
            let settings = self.settings.iteration;

            tasks.push(tokio::spawn(async move {
                drive_run(record, handle, broker, store, calendar, settings, now).await;
            }));
        }

        for task in tasks {
            if let Err(err) = task.await {
                error!(error = %err, "run iteration task panicked");
            }
        }
    }

    /// Poll forever on the configured interval. Cancel by dropping the
    /// future (e.g. racing it against a shutdown signal).
    pub async fn run_forever(&self) {
        info!(
            poll_seconds = self.settings.poll_interval.as_secs(),
            "forward-test driver started"
        );
        loop {
            self.tick(Utc::now()).await;
            tokio::time::sleep(self.settings.poll_interval).await;
        }
    }
}

/// Iterate one run, lazily (re)building its service from the persisted
/// record. Never lets an error escape across run boundaries.
async fn drive_run(
    record: ForwardTestRun,
    handle: Arc<RunHandle>,
    broker: Arc<dyn BrokerPort>,
    store: Arc<dyn RunStorePort>,
    calendar: TradingCalendar,
    settings: IterationSettings,
    now: DateTime<Utc>,
) {
    // Per-run serialization: if the previous iteration is still holding
    // the lock, this tick skips the run entirely.
    let Ok(mut guard) = handle.service.try_lock() else {
        debug!(run = %record.id, "iteration still in progress; skipping tick");
        return;
    };

    if guard.is_none() {
        debug!(run = %record.id, phase = RunPhase::Initializing.name(), "rebuilding run service");
        match RunService::initialize(
            record.account.clone(),
            &record.formula,
            &record.tickers,
            broker,
            store,
            calendar,
            settings,
            Arc::clone(&handle.stop),
        )
        .await
        {
            Ok(service) => *guard = Some(service),
            Err(err) => {
                // The record stays untouched; the next tick retries.
                error!(run = %record.id, error = %err, "run initialization failed");
                return;
            }
        }
    }

    let service = guard.as_mut().expect("service present after initialization");
    match service.iterate(&record, now).await {
        Ok(IterationOutcome::Skipped(reason)) => {
            debug!(run = %record.id, reason = ?reason, "iteration skipped");
        }
        Ok(IterationOutcome::Executed {
            orders,
            sizing_errors,
        }) => {
            info!(
                run = %record.id,
                orders = orders.len(),
                failed_orders = orders.iter().filter(|o| !o.is_ok()).count(),
                sizing_errors = sizing_errors.len(),
                "iteration executed"
            );
        }
        Err(err) => {
            // Tear down the in-memory instance; the persisted record is
            // untouched and the run self-heals on a later tick.
            warn!(run = %record.id, error = %err, "iteration failed; tearing down run service");
            *guard = None;
        }
    }
}
