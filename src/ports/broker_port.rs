//! Broker / market-data port trait.
//!
//! Every method is a suspension point; callers bound each call with a
//! timeout and map elapsed timers to transient errors. Implementations
//! must be safe to share across concurrently iterating runs.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::domain::candle::Candle;
use crate::domain::error::AlphaloopError;

/// Opaque reference to a (sandbox) brokerage account.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AccountRef(pub String);

impl std::fmt::Display for AccountRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Static description of a tradable instrument.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstrumentMeta {
    /// Broker-assigned instrument id (figi-style), used on orders.
    pub id: String,
    pub ticker: String,
    pub name: String,
    pub currency: String,
    /// Base units per lot; orders are sized in whole lots.
    pub lot_size: i64,
}

/// Positions and total value in one snapshot, as the broker reports them.
/// Always re-read before sizing; never cached as source of truth.
#[derive(Debug, Clone, PartialEq)]
pub struct PortfolioState {
    /// Instrument id → held base-unit quantity.
    pub positions: BTreeMap<String, i64>,
    pub total_value: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn name(self) -> &'static str {
        match self {
            Side::Buy => "buy",
            Side::Sell => "sell",
        }
    }
}

/// Broker acknowledgement of an accepted market order.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderAck {
    pub order_id: String,
}

/// One point of the account's value history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EquityPoint {
    pub date: NaiveDate,
    pub value: f64,
}

#[async_trait]
pub trait BrokerPort: Send + Sync {
    /// Resolve tickers against the tradable universe. Unknown tickers are
    /// simply absent from the result; the caller treats a short answer as
    /// an initialization failure.
    async fn resolve_instruments(
        &self,
        tickers: &[String],
    ) -> Result<Vec<InstrumentMeta>, AlphaloopError>;

    async fn get_portfolio(&self, account: &AccountRef)
        -> Result<PortfolioState, AlphaloopError>;

    /// Daily candles for one instrument, ascending, inclusive date bounds.
    async fn get_candles(
        &self,
        instrument_id: &str,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<Candle>, AlphaloopError>;

    /// Submit one market order sized in whole lots (`lots` > 0).
    async fn submit_order(
        &self,
        account: &AccountRef,
        instrument_id: &str,
        lots: i64,
        side: Side,
    ) -> Result<OrderAck, AlphaloopError>;

    /// Portfolio value over time, backing `get_history`.
    async fn get_value_history(
        &self,
        account: &AccountRef,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<EquityPoint>, AlphaloopError>;

    /// Close the broker-side sandbox account on run stop.
    async fn close_account(&self, account: &AccountRef) -> Result<(), AlphaloopError>;
}
