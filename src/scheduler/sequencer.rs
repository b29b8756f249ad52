//! Order sequencing.
//!
//! Sells are submitted before buys so freed capital and margin are
//! available when the buys land; this ordering is a correctness
//! requirement of the iteration, not a tuning choice. Within each side
//! submissions run in instrument order, so the full sequence is fixed for
//! a given intent set. Failures are isolated per instrument: a rejected or
//! timed-out order is recorded and the remaining submissions proceed.

use std::time::Duration;

use tracing::{info, warn};

use crate::domain::error::AlphaloopError;
use crate::domain::sizing::TradeIntent;
use crate::ports::broker_port::{AccountRef, BrokerPort, OrderAck, Side};

/// Outcome of one order submission.
#[derive(Debug)]
pub struct OrderResult {
    pub instrument: String,
    /// Whole lots submitted, always positive.
    pub lots: i64,
    pub side: Side,
    pub outcome: Result<OrderAck, AlphaloopError>,
}

impl OrderResult {
    pub fn is_ok(&self) -> bool {
        self.outcome.is_ok()
    }
}

/// Submit every intent as a market order, sells first.
pub async fn execute(
    intents: &[TradeIntent],
    broker: &dyn BrokerPort,
    account: &AccountRef,
    call_timeout: Duration,
) -> Vec<OrderResult> {
    let mut sells: Vec<&TradeIntent> = intents.iter().filter(|i| i.delta_lots < 0).collect();
    let mut buys: Vec<&TradeIntent> = intents.iter().filter(|i| i.delta_lots > 0).collect();
    sells.sort_by(|a, b| a.instrument.cmp(&b.instrument));
    buys.sort_by(|a, b| a.instrument.cmp(&b.instrument));

    let mut results = Vec::with_capacity(sells.len() + buys.len());
    for intent in sells.into_iter().chain(buys) {
        results.push(submit(intent, broker, account, call_timeout).await);
    }
    results
}

async fn submit(
    intent: &TradeIntent,
    broker: &dyn BrokerPort,
    account: &AccountRef,
    call_timeout: Duration,
) -> OrderResult {
    let side = if intent.delta_lots < 0 {
        Side::Sell
    } else {
        Side::Buy
    };
    let lots = intent.delta_lots.abs();

    let outcome = match tokio::time::timeout(
        call_timeout,
        broker.submit_order(account, &intent.instrument, lots, side),
    )
    .await
    {
        Ok(result) => result,
        Err(_) => Err(AlphaloopError::TransientInfra {
            reason: format!("order submission for {} timed out", intent.instrument),
        }),
    };

    match &outcome {
        Ok(ack) => info!(
            instrument = %intent.instrument,
            side = side.name(),
            lots,
            price = intent.reference_price,
            order_id = %ack.order_id,
            "order accepted"
        ),
        Err(err) => warn!(
            instrument = %intent.instrument,
            side = side.name(),
            lots,
            error = %err,
            "order failed"
        ),
    }

    OrderResult {
        instrument: intent.instrument.clone(),
        lots,
        side,
        outcome,
    }
}
