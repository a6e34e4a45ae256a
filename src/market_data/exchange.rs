//! Exchange client contract plus an in-process simulated implementation.
//!
//! The real REST/WebSocket client lives outside this core; components depend
//! only on this trait.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::{Result, TradingError};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ticker {
    pub symbol: String,
    pub last: Decimal,
    #[serde(default)]
    pub bid: Option<Decimal>,
    #[serde(default)]
    pub ask: Option<Decimal>,
    #[serde(default)]
    pub base_volume: Option<Decimal>,
    #[serde(default)]
    pub high: Option<Decimal>,
    #[serde(default)]
    pub low: Option<Decimal>,
    #[serde(default)]
    pub open: Option<Decimal>,
    #[serde(default)]
    pub close: Option<Decimal>,
    #[serde(default)]
    pub change: Option<Decimal>,
    #[serde(default)]
    pub percentage: Option<Decimal>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BalanceSnapshot {
    pub free: HashMap<String, Decimal>,
}

#[async_trait]
pub trait ExchangeClient: Send + Sync {
    async fn fetch_ticker(&self, symbol: &str) -> Result<Ticker>;
    async fn fetch_balance(&self) -> Result<BalanceSnapshot>;
}

/// Deterministic in-process exchange used for paper runs and tests.
pub struct SimExchange {
    prices: Mutex<HashMap<String, Decimal>>,
    balances: Mutex<HashMap<String, Decimal>>,
}

impl SimExchange {
    pub fn new() -> Self {
        Self {
            prices: Mutex::new(HashMap::new()),
            balances: Mutex::new(HashMap::new()),
        }
    }

    pub fn set_price(&self, symbol: &str, price: Decimal) {
        self.prices.lock().unwrap().insert(symbol.to_string(), price);
    }

    pub fn set_balance(&self, asset: &str, amount: Decimal) {
        self.balances.lock().unwrap().insert(asset.to_string(), amount);
    }
}

impl Default for SimExchange {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ExchangeClient for SimExchange {
    async fn fetch_ticker(&self, symbol: &str) -> Result<Ticker> {
        let last = self
            .prices
            .lock()
            .unwrap()
            .get(symbol)
            .copied()
            .ok_or_else(|| TradingError::MarketData(format!("No price for {symbol}")))?;
        let spread = last * Decimal::new(5, 4); // 0.05%
        Ok(Ticker {
            symbol: symbol.to_string(),
            last,
            bid: Some(last - spread),
            ask: Some(last + spread),
            base_volume: Some(Decimal::from(1_000)),
            high: Some(last + spread),
            low: Some(last - spread),
            open: Some(last),
            close: Some(last),
            change: Some(Decimal::ZERO),
            percentage: Some(Decimal::ZERO),
        })
    }

    async fn fetch_balance(&self) -> Result<BalanceSnapshot> {
        Ok(BalanceSnapshot {
            free: self.balances.lock().unwrap().clone(),
        })
    }
}
