//! Shared helpers for integration tests.

#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Days, NaiveDate, Utc};

use alphaloop::adapters::paper_broker::PaperBroker;
use alphaloop::domain::candle::Candle;
use alphaloop::domain::error::AlphaloopError;
use alphaloop::ports::broker_port::{
    AccountRef, BrokerPort, EquityPoint, InstrumentMeta, OrderAck, PortfolioState, Side,
};

/// A Monday inside the MOEX session (12:00 Moscow time).
pub fn trading_monday() -> DateTime<Utc> {
    "2024-03-04T09:00:00Z".parse().unwrap()
}

/// The exchange-local date of [`trading_monday`].
pub fn monday_date() -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 3, 4).unwrap()
}

pub fn meta(ticker: &str, lot_size: i64) -> InstrumentMeta {
    InstrumentMeta {
        id: format!("paper-{}", ticker),
        ticker: ticker.to_string(),
        name: ticker.to_string(),
        currency: "RUB".to_string(),
        lot_size,
    }
}

/// Candles ending on `last_date`, one per calendar day going backwards.
pub fn candles_ending(last_date: NaiveDate, closes: &[f64]) -> Vec<Candle> {
    closes
        .iter()
        .enumerate()
        .map(|(i, &close)| Candle {
            date: last_date - Days::new((closes.len() - 1 - i) as u64),
            open: close,
            high: close + 1.0,
            low: close - 1.0,
            close,
            volume: 1_000_000,
        })
        .collect()
}

pub fn rising(n: usize, start: f64) -> Vec<f64> {
    (0..n).map(|i| start + i as f64).collect()
}

pub fn falling(n: usize, start: f64) -> Vec<f64> {
    (0..n).map(|i| start - i as f64).collect()
}

/// A sandbox with SBER trending up and GAZP trending down through the test
/// Monday, and one funded account.
pub fn seeded_broker() -> (Arc<PaperBroker>, AccountRef) {
    let broker = Arc::new(PaperBroker::new());
    broker.add_instrument(
        meta("SBER", 10),
        candles_ending(monday_date(), &rising(10, 240.0)),
    );
    broker.add_instrument(
        meta("GAZP", 100),
        candles_ending(monday_date(), &falling(10, 160.0)),
    );
    let account = broker.open_account("sandbox-1", 1_000_000.0);
    (broker, account)
}

/// Wraps a [`PaperBroker`] with failure injection and an order log.
pub struct FlakyBroker {
    inner: Arc<PaperBroker>,
    /// Fail this many upcoming `get_candles` calls with a transient error.
    fail_candles: AtomicUsize,
    /// Instrument ids whose submissions are rejected.
    reject: Mutex<HashSet<String>>,
    /// Called at the top of every `get_candles`.
    on_candles: Mutex<Option<Box<dyn Fn() + Send + Sync>>>,
    /// Successful and rejected submissions, in submission order.
    orders: Mutex<Vec<(String, i64, Side)>>,
}

impl FlakyBroker {
    pub fn new(inner: Arc<PaperBroker>) -> Arc<FlakyBroker> {
        Arc::new(FlakyBroker {
            inner,
            fail_candles: AtomicUsize::new(0),
            reject: Mutex::new(HashSet::new()),
            on_candles: Mutex::new(None),
            orders: Mutex::new(Vec::new()),
        })
    }

    pub fn fail_next_candles(&self, n: usize) {
        self.fail_candles.store(n, Ordering::SeqCst);
    }

    pub fn reject_instrument(&self, instrument_id: &str) {
        self.reject
            .lock()
            .unwrap()
            .insert(instrument_id.to_string());
    }

    pub fn set_on_candles(&self, hook: impl Fn() + Send + Sync + 'static) {
        *self.on_candles.lock().unwrap() = Some(Box::new(hook));
    }

    pub fn orders(&self) -> Vec<(String, i64, Side)> {
        self.orders.lock().unwrap().clone()
    }

    pub fn order_count(&self) -> usize {
        self.orders.lock().unwrap().len()
    }
}

#[async_trait]
impl BrokerPort for FlakyBroker {
    async fn resolve_instruments(
        &self,
        tickers: &[String],
    ) -> Result<Vec<InstrumentMeta>, AlphaloopError> {
        self.inner.resolve_instruments(tickers).await
    }

    async fn get_portfolio(
        &self,
        account: &AccountRef,
    ) -> Result<PortfolioState, AlphaloopError> {
        self.inner.get_portfolio(account).await
    }

    async fn get_candles(
        &self,
        instrument_id: &str,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<Candle>, AlphaloopError> {
        if let Some(hook) = self.on_candles.lock().unwrap().as_ref() {
            hook();
        }
        let remaining = self.fail_candles.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_candles.store(remaining - 1, Ordering::SeqCst);
            return Err(AlphaloopError::TransientInfra {
                reason: "injected market data failure".to_string(),
            });
        }
        self.inner.get_candles(instrument_id, from, to).await
    }

    async fn submit_order(
        &self,
        account: &AccountRef,
        instrument_id: &str,
        lots: i64,
        side: Side,
    ) -> Result<OrderAck, AlphaloopError> {
        self.orders
            .lock()
            .unwrap()
            .push((instrument_id.to_string(), lots, side));
        if self.reject.lock().unwrap().contains(instrument_id) {
            return Err(AlphaloopError::Order {
                instrument: instrument_id.to_string(),
                reason: "injected rejection".to_string(),
            });
        }
        self.inner
            .submit_order(account, instrument_id, lots, side)
            .await
    }

    async fn get_value_history(
        &self,
        account: &AccountRef,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<EquityPoint>, AlphaloopError> {
        self.inner.get_value_history(account, from, to).await
    }

    async fn close_account(&self, account: &AccountRef) -> Result<(), AlphaloopError> {
        self.inner.close_account(account).await
    }
}
