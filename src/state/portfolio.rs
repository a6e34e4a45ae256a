//! Global portfolio store: the single source of truth for positions,
//! balances, PnL history, drawdown log and aggregated risk metrics.
//!
//! All other components read through it or publish events; only this store
//! (driven by the risk service) mutates the global keys.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::{Result, TradingError};
use crate::events::{OptionGreeks, Side};

use super::kv::KvBackend;

const PNL_HISTORY_CAP: usize = 10_000;
const DRAWDOWN_CAP: usize = 1_000;
const TTL: Duration = Duration::from_secs(86_400 * 30);

/// A live position. Quantity is negative for shorts; zero-quantity records
/// are retained.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,
    pub quantity: Decimal,
    pub avg_price: Decimal,
    #[serde(default)]
    pub unrealized_pnl: Decimal,
    #[serde(default)]
    pub strategy_id: Option<String>,
    #[serde(default)]
    pub greeks: Option<OptionGreeks>,
    pub updated_at: DateTime<Utc>,
}

impl Position {
    pub fn notional(&self) -> Decimal {
        self.quantity * self.avg_price
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PnlRecord {
    pub realized_pnl: Decimal,
    pub unrealized_pnl: Decimal,
    pub total_pnl: Decimal,
    pub total_value: Decimal,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DrawdownRecord {
    pub current_value: Decimal,
    pub peak_value: Decimal,
    pub drawdown_pct: f64,
    pub timestamp: DateTime<Utc>,
}

pub struct PortfolioStore {
    kv: Arc<dyn KvBackend>,
    prefix: String,
}

impl PortfolioStore {
    pub fn new(kv: Arc<dyn KvBackend>, prefix: impl Into<String>) -> Self {
        Self {
            kv,
            prefix: format!("{}:portfolio", prefix.into()),
        }
    }

    fn balance_key(&self) -> String {
        format!("{}:balance", self.prefix)
    }

    fn positions_key(&self) -> String {
        format!("{}:positions", self.prefix)
    }

    fn pnl_key(&self) -> String {
        format!("{}:pnl_history", self.prefix)
    }

    fn metrics_key(&self) -> String {
        format!("{}:risk_metrics", self.prefix)
    }

    fn drawdown_key(&self) -> String {
        format!("{}:drawdown", self.prefix)
    }

    pub async fn update_global_balance(&self, balances: &HashMap<String, Decimal>) -> Result<()> {
        let key = self.balance_key();
        let mut fields: Vec<(String, String)> = balances
            .iter()
            .map(|(asset, amount)| Ok((asset.clone(), serde_json::to_string(amount)?)))
            .collect::<Result<_>>()?;
        fields.push(("updated_at".to_string(), serde_json::to_string(&Utc::now())?));
        self.kv.hash_set(&key, fields).await?;
        self.kv.expire(&key, TTL).await
    }

    pub async fn get_global_balance(&self) -> Result<HashMap<String, Decimal>> {
        let raw = self.kv.hash_get_all(&self.balance_key()).await?;
        let mut balances = HashMap::new();
        for (asset, value) in raw {
            if asset == "updated_at" {
                continue;
            }
            balances.insert(asset, serde_json::from_str(&value)?);
        }
        Ok(balances)
    }

    /// Overwrite a position record. Cached Greeks survive a plain update so a
    /// fill does not wipe the per-unit sensitivities.
    pub async fn update_position(
        &self,
        symbol: &str,
        quantity: Decimal,
        avg_price: Decimal,
        unrealized_pnl: Decimal,
        strategy_id: Option<&str>,
    ) -> Result<Position> {
        let greeks = self.get_position(symbol).await?.and_then(|p| p.greeks);
        let position = Position {
            symbol: symbol.to_string(),
            quantity,
            avg_price,
            unrealized_pnl,
            strategy_id: strategy_id.map(|s| s.to_string()),
            greeks,
            updated_at: Utc::now(),
        };
        self.write_position(&position).await?;
        Ok(position)
    }

    async fn write_position(&self, position: &Position) -> Result<()> {
        let key = self.positions_key();
        self.kv
            .hash_set(
                &key,
                vec![(position.symbol.clone(), serde_json::to_string(position)?)],
            )
            .await?;
        self.kv.expire(&key, TTL).await
    }

    pub async fn get_position(&self, symbol: &str) -> Result<Option<Position>> {
        match self.kv.hash_get(&self.positions_key(), symbol).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    pub async fn get_all_positions(&self) -> Result<HashMap<String, Position>> {
        let raw = self.kv.hash_get_all(&self.positions_key()).await?;
        let mut positions = HashMap::new();
        for (symbol, value) in raw {
            positions.insert(symbol, serde_json::from_str(&value)?);
        }
        Ok(positions)
    }

    /// Fold a fill into the position book. Buys move the average price to the
    /// quantity-weighted mean; sells reduce quantity and leave it untouched.
    pub async fn apply_fill(
        &self,
        symbol: &str,
        side: Side,
        quantity: Decimal,
        price: Decimal,
        strategy_id: Option<&str>,
    ) -> Result<Position> {
        if quantity <= Decimal::ZERO {
            return Err(TradingError::Validation(
                "Fill quantity must be positive".to_string(),
            ));
        }
        if price <= Decimal::ZERO {
            return Err(TradingError::Validation("Fill price must be positive".to_string()));
        }

        let current = self.get_position(symbol).await?;
        let (current_qty, current_avg) = current
            .as_ref()
            .map(|p| (p.quantity, p.avg_price))
            .unwrap_or((Decimal::ZERO, Decimal::ZERO));

        let (new_qty, new_avg) = match side {
            Side::Buy => {
                let new_qty = current_qty + quantity;
                let new_avg = if new_qty > Decimal::ZERO {
                    (current_qty * current_avg + quantity * price) / new_qty
                } else {
                    price
                };
                (new_qty, new_avg)
            }
            Side::Sell => (current_qty - quantity, current_avg),
        };

        self.update_position(symbol, new_qty, new_avg, Decimal::ZERO, strategy_id)
            .await
    }

    pub async fn update_position_greeks(&self, symbol: &str, greeks: OptionGreeks) -> Result<()> {
        if let Some(mut position) = self.get_position(symbol).await? {
            position.greeks = Some(greeks);
            position.updated_at = Utc::now();
            self.write_position(&position).await?;
        }
        Ok(())
    }

    pub async fn record_pnl(
        &self,
        realized_pnl: Decimal,
        unrealized_pnl: Decimal,
        total_value: Decimal,
    ) -> Result<()> {
        let record = PnlRecord {
            realized_pnl,
            unrealized_pnl,
            total_pnl: realized_pnl + unrealized_pnl,
            total_value,
            timestamp: Utc::now(),
        };
        let key = self.pnl_key();
        self.kv
            .list_push(&key, serde_json::to_string(&record)?, PNL_HISTORY_CAP)
            .await?;
        self.kv.expire(&key, TTL).await
    }

    pub async fn get_recent_pnl(&self, limit: usize) -> Result<Vec<PnlRecord>> {
        let raw = self.kv.list_tail(&self.pnl_key(), limit).await?;
        raw.iter()
            .map(|item| Ok(serde_json::from_str(item)?))
            .collect()
    }

    pub async fn update_risk_metrics(&self, metrics: &HashMap<String, f64>) -> Result<()> {
        let key = self.metrics_key();
        let mut fields: Vec<(String, String)> = metrics
            .iter()
            .map(|(name, value)| Ok((name.clone(), serde_json::to_string(value)?)))
            .collect::<Result<_>>()?;
        fields.push(("updated_at".to_string(), serde_json::to_string(&Utc::now())?));
        self.kv.hash_set(&key, fields).await?;
        self.kv.expire(&key, TTL).await
    }

    pub async fn get_risk_metrics(&self) -> Result<HashMap<String, f64>> {
        let raw = self.kv.hash_get_all(&self.metrics_key()).await?;
        let mut metrics = HashMap::new();
        for (name, value) in raw {
            if name == "updated_at" {
                continue;
            }
            metrics.insert(name, serde_json::from_str(&value)?);
        }
        Ok(metrics)
    }

    pub async fn get_total_delta(&self) -> Result<f64> {
        Ok(self
            .get_risk_metrics()
            .await?
            .get("total_delta")
            .copied()
            .unwrap_or(0.0))
    }

    pub async fn record_drawdown(
        &self,
        current_value: Decimal,
        peak_value: Decimal,
        drawdown_pct: f64,
    ) -> Result<()> {
        let record = DrawdownRecord {
            current_value,
            peak_value,
            drawdown_pct,
            timestamp: Utc::now(),
        };
        let key = self.drawdown_key();
        self.kv
            .list_push(&key, serde_json::to_string(&record)?, DRAWDOWN_CAP)
            .await?;
        self.kv.expire(&key, TTL).await
    }

    pub async fn get_current_drawdown(&self) -> Result<Option<DrawdownRecord>> {
        let raw = self.kv.list_tail(&self.drawdown_key(), 1).await?;
        match raw.last() {
            Some(item) => Ok(Some(serde_json::from_str(item)?)),
            None => Ok(None),
        }
    }

    /// Historical peak total value over the PnL history.
    pub async fn get_peak_value(&self) -> Result<Decimal> {
        let history = self.get_recent_pnl(PNL_HISTORY_CAP).await?;
        Ok(history
            .iter()
            .map(|r| r.total_value)
            .max()
            .unwrap_or(Decimal::ZERO))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::kv::MemoryKv;
    use rust_decimal_macros::dec;

    fn store() -> PortfolioStore {
        PortfolioStore::new(Arc::new(MemoryKv::new()), "test")
    }

    #[tokio::test]
    async fn buy_fills_use_weighted_average() {
        let store = store();
        store
            .apply_fill("BTC/USDT", Side::Buy, dec!(1), dec!(100), Some("s1"))
            .await
            .unwrap();
        let position = store
            .apply_fill("BTC/USDT", Side::Buy, dec!(1), dec!(200), Some("s1"))
            .await
            .unwrap();
        assert_eq!(position.quantity, dec!(2));
        assert_eq!(position.avg_price, dec!(150));
    }

    #[tokio::test]
    async fn sells_leave_average_price_unchanged() {
        let store = store();
        store
            .apply_fill("BTC/USDT", Side::Buy, dec!(2), dec!(100), None)
            .await
            .unwrap();
        store
            .apply_fill("BTC/USDT", Side::Buy, dec!(2), dec!(200), None)
            .await
            .unwrap();
        // Unwind the whole position.
        let position = store
            .apply_fill("BTC/USDT", Side::Sell, dec!(4), dec!(500), None)
            .await
            .unwrap();
        assert_eq!(position.quantity, Decimal::ZERO);
        assert_eq!(position.avg_price, dec!(150));
    }

    #[tokio::test]
    async fn short_positions_carry_negative_quantity() {
        let store = store();
        let position = store
            .apply_fill("ETH/USDT", Side::Sell, dec!(3), dec!(2000), None)
            .await
            .unwrap();
        assert_eq!(position.quantity, dec!(-3));
    }

    #[tokio::test]
    async fn greeks_survive_a_plain_position_update() {
        let store = store();
        store
            .update_position("BTC-20261225-40000-C", dec!(1), dec!(1000), Decimal::ZERO, None)
            .await
            .unwrap();
        store
            .update_position_greeks(
                "BTC-20261225-40000-C",
                OptionGreeks { delta: 0.5, gamma: 0.01, theta: -2.0, vega: 10.0, rho: 1.0 },
            )
            .await
            .unwrap();
        let updated = store
            .update_position("BTC-20261225-40000-C", dec!(2), dec!(1100), Decimal::ZERO, None)
            .await
            .unwrap();
        assert_eq!(updated.greeks.unwrap().delta, 0.5);
    }

    #[tokio::test]
    async fn peak_value_is_max_over_pnl_history() {
        let store = store();
        for value in [dec!(1000), dec!(1200), dec!(900)] {
            store.record_pnl(Decimal::ZERO, Decimal::ZERO, value).await.unwrap();
        }
        assert_eq!(store.get_peak_value().await.unwrap(), dec!(1200));
    }

    #[tokio::test]
    async fn drawdown_log_keeps_latest() {
        let store = store();
        store.record_drawdown(dec!(1000), dec!(1000), 0.0).await.unwrap();
        store.record_drawdown(dec!(790), dec!(1000), 0.21).await.unwrap();
        let current = store.get_current_drawdown().await.unwrap().unwrap();
        assert_eq!(current.current_value, dec!(790));
        assert!((current.drawdown_pct - 0.21).abs() < 1e-12);
    }
}
