//! In-process paper broker.
//!
//! A sandbox [`BrokerPort`] backed by preloaded candle history: market
//! orders fill immediately at the latest close, positions and cash are
//! tracked per account, and portfolio value snapshots build the equity
//! history that `get_history` reports. Used by the daemon's sandbox mode
//! and by the integration tests.

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};

use crate::domain::candle::Candle;
use crate::domain::error::AlphaloopError;
use crate::ports::broker_port::{
    AccountRef, BrokerPort, EquityPoint, InstrumentMeta, OrderAck, PortfolioState, Side,
};

#[derive(Default)]
pub struct PaperBroker {
    state: Mutex<State>,
}

#[derive(Default)]
struct State {
    /// Ticker → metadata for the tradable universe.
    universe: BTreeMap<String, InstrumentMeta>,
    /// Instrument id → ascending candle history.
    candles: BTreeMap<String, Vec<Candle>>,
    accounts: BTreeMap<String, PaperAccount>,
    next_order: u64,
}

struct PaperAccount {
    cash: f64,
    /// Instrument id → held base units.
    positions: BTreeMap<String, i64>,
    equity_history: Vec<EquityPoint>,
    closed: bool,
}

impl PaperBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a tradable instrument with its candle history.
    pub fn add_instrument(&self, meta: InstrumentMeta, candles: Vec<Candle>) {
        let mut state = self.state.lock().expect("broker lock");
        state.candles.insert(meta.id.clone(), candles);
        state.universe.insert(meta.ticker.clone(), meta);
    }

    /// Open a sandbox account funded with `cash`.
    pub fn open_account(&self, id: &str, cash: f64) -> AccountRef {
        let mut state = self.state.lock().expect("broker lock");
        state.accounts.insert(
            id.to_string(),
            PaperAccount {
                cash,
                positions: BTreeMap::new(),
                equity_history: Vec::new(),
                closed: false,
            },
        );
        AccountRef(id.to_string())
    }

    /// Latest close for an instrument id, if any candle is loaded.
    pub fn last_price(&self, instrument_id: &str) -> Option<f64> {
        let state = self.state.lock().expect("broker lock");
        state
            .candles
            .get(instrument_id)
            .and_then(|cs| cs.last())
            .map(|c| c.close)
    }

    fn total_value(state: &State, account: &PaperAccount) -> f64 {
        let position_value: f64 = account
            .positions
            .iter()
            .filter_map(|(id, units)| {
                state
                    .candles
                    .get(id)
                    .and_then(|cs| cs.last())
                    .map(|c| *units as f64 * c.close)
            })
            .sum();
        account.cash + position_value
    }
}

fn unknown_account(account: &AccountRef) -> AlphaloopError {
    AlphaloopError::TransientInfra {
        reason: format!("unknown account {}", account),
    }
}

#[async_trait]
impl BrokerPort for PaperBroker {
    async fn resolve_instruments(
        &self,
        tickers: &[String],
    ) -> Result<Vec<InstrumentMeta>, AlphaloopError> {
        let state = self.state.lock().expect("broker lock");
        Ok(tickers
            .iter()
            .filter_map(|t| state.universe.get(t).cloned())
            .collect())
    }

    async fn get_portfolio(
        &self,
        account: &AccountRef,
    ) -> Result<PortfolioState, AlphaloopError> {
        let mut state = self.state.lock().expect("broker lock");
        let Some(acc) = state.accounts.get(&account.0) else {
            return Err(unknown_account(account));
        };
        let total_value = Self::total_value(&state, acc);
        let positions = acc.positions.clone();

        // Snapshot the equity curve: one point per calendar day, the
        // latest snapshot winning.
        let today = Utc::now().date_naive();
        let acc = state
            .accounts
            .get_mut(&account.0)
            .expect("account just looked up");
        match acc.equity_history.last_mut() {
            Some(last) if last.date == today => last.value = total_value,
            _ => acc.equity_history.push(EquityPoint {
                date: today,
                value: total_value,
            }),
        }

        Ok(PortfolioState {
            positions,
            total_value,
        })
    }

    async fn get_candles(
        &self,
        instrument_id: &str,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<Candle>, AlphaloopError> {
        let state = self.state.lock().expect("broker lock");
        let Some(candles) = state.candles.get(instrument_id) else {
            return Err(AlphaloopError::TransientInfra {
                reason: format!("no market data for instrument {}", instrument_id),
            });
        };
        Ok(candles
            .iter()
            .filter(|c| c.date >= from && c.date <= to)
            .cloned()
            .collect())
    }

    async fn submit_order(
        &self,
        account: &AccountRef,
        instrument_id: &str,
        lots: i64,
        side: Side,
    ) -> Result<OrderAck, AlphaloopError> {
        let mut state = self.state.lock().expect("broker lock");

        let order_err = |reason: String| AlphaloopError::Order {
            instrument: instrument_id.to_string(),
            reason,
        };

        if lots <= 0 {
            return Err(order_err(format!("non-positive lot count {}", lots)));
        }

        let lot_size = state
            .universe
            .values()
            .find(|m| m.id == instrument_id)
            .map(|m| m.lot_size)
            .ok_or_else(|| order_err("unknown instrument".to_string()))?;

        let price = state
            .candles
            .get(instrument_id)
            .and_then(|cs| cs.last())
            .map(|c| c.close)
            .ok_or_else(|| order_err("no price available".to_string()))?;

        let order_id = {
            state.next_order += 1;
            format!("paper-{}", state.next_order)
        };

        let acc = state
            .accounts
            .get_mut(&account.0)
            .ok_or_else(|| unknown_account(account))?;
        if acc.closed {
            return Err(order_err("account is closed".to_string()));
        }

        let units = lots * lot_size;
        let signed_units = match side {
            Side::Buy => units,
            Side::Sell => -units,
        };
        acc.cash -= signed_units as f64 * price;
        let held = acc.positions.entry(instrument_id.to_string()).or_insert(0);
        *held += signed_units;
        if *held == 0 {
            acc.positions.remove(instrument_id);
        }

        Ok(OrderAck { order_id })
    }

    async fn get_value_history(
        &self,
        account: &AccountRef,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<EquityPoint>, AlphaloopError> {
        let state = self.state.lock().expect("broker lock");
        let acc = state
            .accounts
            .get(&account.0)
            .ok_or_else(|| unknown_account(account))?;
        Ok(acc
            .equity_history
            .iter()
            .filter(|p| p.date >= from && p.date <= to)
            .cloned()
            .collect())
    }

    async fn close_account(&self, account: &AccountRef) -> Result<(), AlphaloopError> {
        let mut state = self.state.lock().expect("broker lock");
        let acc = state
            .accounts
            .get_mut(&account.0)
            .ok_or_else(|| unknown_account(account))?;
        acc.closed = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(ticker: &str, lot_size: i64) -> InstrumentMeta {
        InstrumentMeta {
            id: format!("figi-{}", ticker),
            ticker: ticker.to_string(),
            name: ticker.to_string(),
            currency: "RUB".to_string(),
            lot_size,
        }
    }

    fn candles(closes: &[f64]) -> Vec<Candle> {
        closes
            .iter()
            .enumerate()
            .map(|(i, &close)| Candle {
                date: NaiveDate::from_ymd_opt(2024, 3, 1).unwrap()
                    + chrono::Days::new(i as u64),
                open: close,
                high: close,
                low: close,
                close,
                volume: 1000,
            })
            .collect()
    }

    fn broker_with_sber() -> PaperBroker {
        let broker = PaperBroker::new();
        broker.add_instrument(meta("SBER", 10), candles(&[240.0, 245.0, 250.0]));
        broker
    }

    #[tokio::test]
    async fn resolve_returns_only_known_tickers() {
        let broker = broker_with_sber();
        let resolved = broker
            .resolve_instruments(&["SBER".to_string(), "NOPE".to_string()])
            .await
            .unwrap();
        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved[0].ticker, "SBER");
        assert_eq!(resolved[0].lot_size, 10);
    }

    #[tokio::test]
    async fn candle_window_is_inclusive() {
        let broker = broker_with_sber();
        let from = NaiveDate::from_ymd_opt(2024, 3, 2).unwrap();
        let to = NaiveDate::from_ymd_opt(2024, 3, 3).unwrap();
        let out = broker.get_candles("figi-SBER", from, to).await.unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].close, 245.0);
    }

    #[tokio::test]
    async fn buy_fills_at_last_close_and_moves_cash() {
        let broker = broker_with_sber();
        let account = broker.open_account("acc", 100_000.0);
        assert_eq!(broker.last_price("figi-SBER"), Some(250.0));

        broker
            .submit_order(&account, "figi-SBER", 4, Side::Buy)
            .await
            .unwrap();

        let portfolio = broker.get_portfolio(&account).await.unwrap();
        // 4 lots × 10 units × 250 = 10 000 moved from cash into stock.
        assert_eq!(portfolio.positions["figi-SBER"], 40);
        assert!((portfolio.total_value - 100_000.0).abs() < 1e-9);

        // Selling back flattens the position entirely.
        broker
            .submit_order(&account, "figi-SBER", 4, Side::Sell)
            .await
            .unwrap();
        let portfolio = broker.get_portfolio(&account).await.unwrap();
        assert!(portfolio.positions.is_empty());
        assert!((portfolio.total_value - 100_000.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn short_positions_allowed_in_sandbox() {
        let broker = broker_with_sber();
        let account = broker.open_account("acc", 100_000.0);

        broker
            .submit_order(&account, "figi-SBER", 2, Side::Sell)
            .await
            .unwrap();

        let portfolio = broker.get_portfolio(&account).await.unwrap();
        assert_eq!(portfolio.positions["figi-SBER"], -20);
        assert!((portfolio.total_value - 100_000.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn equity_history_tracks_snapshots() {
        let broker = broker_with_sber();
        let account = broker.open_account("acc", 50_000.0);

        broker.get_portfolio(&account).await.unwrap();
        broker.get_portfolio(&account).await.unwrap();

        let history = broker
            .get_value_history(
                &account,
                NaiveDate::from_ymd_opt(2000, 1, 1).unwrap(),
                NaiveDate::from_ymd_opt(2100, 1, 1).unwrap(),
            )
            .await
            .unwrap();
        // Same-day snapshots collapse into one point.
        assert_eq!(history.len(), 1);
        assert!((history[0].value - 50_000.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn closed_account_rejects_orders() {
        let broker = broker_with_sber();
        let account = broker.open_account("acc", 100_000.0);

        broker.close_account(&account).await.unwrap();

        let err = broker
            .submit_order(&account, "figi-SBER", 1, Side::Buy)
            .await
            .unwrap_err();
        assert!(matches!(err, AlphaloopError::Order { .. }));
        assert!(err.to_string().contains("closed"));
    }

    #[tokio::test]
    async fn unknown_instrument_rejected() {
        let broker = broker_with_sber();
        let account = broker.open_account("acc", 100_000.0);
        let err = broker
            .submit_order(&account, "figi-NOPE", 1, Side::Buy)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("unknown instrument"));
    }

    #[tokio::test]
    async fn unknown_account_is_transient() {
        let broker = broker_with_sber();
        let err = broker
            .get_portfolio(&AccountRef("ghost".to_string()))
            .await
            .unwrap_err();
        assert!(err.is_transient());
    }
}
