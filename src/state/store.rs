//! Per-strategy scratch state: strategy blobs, positions, balances, orders
//! and a bounded event log, all keyed by strategy id.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rust_decimal::Decimal;
use serde_json::Value;

use crate::error::Result;

use super::kv::KvBackend;

const EVENT_LOG_CAP: usize = 1_000;
const TTL: Duration = Duration::from_secs(86_400 * 7);

pub struct StrategyStateStore {
    kv: Arc<dyn KvBackend>,
    prefix: String,
}

impl StrategyStateStore {
    pub fn new(kv: Arc<dyn KvBackend>, prefix: impl Into<String>) -> Self {
        Self {
            kv,
            prefix: format!("{}:state", prefix.into()),
        }
    }

    fn key(&self, kind: &str, strategy_id: &str) -> String {
        format!("{}:{}:{}", self.prefix, kind, strategy_id)
    }

    pub async fn set_strategy_state(&self, strategy_id: &str, state: &Value) -> Result<()> {
        let key = self.key("strategy", strategy_id);
        let mut fields = match state {
            Value::Object(map) => map
                .iter()
                .map(|(k, v)| Ok((k.clone(), serde_json::to_string(v)?)))
                .collect::<Result<Vec<_>>>()?,
            other => vec![("state".to_string(), serde_json::to_string(other)?)],
        };
        fields.push(("updated_at".to_string(), serde_json::to_string(&Utc::now())?));
        self.kv.hash_set(&key, fields).await?;
        self.kv.expire(&key, TTL).await
    }

    pub async fn get_strategy_state(&self, strategy_id: &str) -> Result<Option<Value>> {
        let raw = self.kv.hash_get_all(&self.key("strategy", strategy_id)).await?;
        if raw.is_empty() {
            return Ok(None);
        }
        let mut map = serde_json::Map::new();
        for (field, value) in raw {
            map.insert(field, serde_json::from_str(&value)?);
        }
        Ok(Some(Value::Object(map)))
    }

    pub async fn set_position(
        &self,
        strategy_id: &str,
        symbol: &str,
        quantity: Decimal,
        avg_price: Decimal,
        unrealized_pnl: Decimal,
    ) -> Result<()> {
        let key = self.key("position", strategy_id);
        let record = serde_json::json!({
            "symbol": symbol,
            "quantity": quantity,
            "avg_price": avg_price,
            "unrealized_pnl": unrealized_pnl,
            "updated_at": Utc::now(),
        });
        self.kv
            .hash_set(&key, vec![(symbol.to_string(), record.to_string())])
            .await?;
        self.kv.expire(&key, TTL).await
    }

    pub async fn get_position(&self, strategy_id: &str, symbol: &str) -> Result<Option<Value>> {
        match self.kv.hash_get(&self.key("position", strategy_id), symbol).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    pub async fn get_all_positions(&self, strategy_id: &str) -> Result<HashMap<String, Value>> {
        let raw = self.kv.hash_get_all(&self.key("position", strategy_id)).await?;
        let mut positions = HashMap::new();
        for (symbol, value) in raw {
            positions.insert(symbol, serde_json::from_str(&value)?);
        }
        Ok(positions)
    }

    pub async fn set_balance(
        &self,
        strategy_id: &str,
        balances: &HashMap<String, Decimal>,
    ) -> Result<()> {
        let key = self.key("balance", strategy_id);
        let mut fields: Vec<(String, String)> = balances
            .iter()
            .map(|(asset, amount)| Ok((asset.clone(), serde_json::to_string(amount)?)))
            .collect::<Result<_>>()?;
        fields.push(("updated_at".to_string(), serde_json::to_string(&Utc::now())?));
        self.kv.hash_set(&key, fields).await?;
        self.kv.expire(&key, TTL).await
    }

    pub async fn get_balance(&self, strategy_id: &str) -> Result<HashMap<String, Decimal>> {
        let raw = self.kv.hash_get_all(&self.key("balance", strategy_id)).await?;
        let mut balances = HashMap::new();
        for (asset, value) in raw {
            if asset == "updated_at" {
                continue;
            }
            balances.insert(asset, serde_json::from_str(&value)?);
        }
        Ok(balances)
    }

    pub async fn add_order(&self, strategy_id: &str, order_id: &str, order: &Value) -> Result<()> {
        let key = self.key("orders", strategy_id);
        let mut record = order.clone();
        if let Value::Object(map) = &mut record {
            map.insert("created_at".to_string(), serde_json::to_value(Utc::now())?);
        }
        self.kv
            .hash_set(&key, vec![(order_id.to_string(), record.to_string())])
            .await?;
        self.kv.expire(&key, TTL).await
    }

    pub async fn get_order(&self, strategy_id: &str, order_id: &str) -> Result<Option<Value>> {
        match self.kv.hash_get(&self.key("orders", strategy_id), order_id).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    pub async fn get_all_orders(&self, strategy_id: &str) -> Result<HashMap<String, Value>> {
        let raw = self.kv.hash_get_all(&self.key("orders", strategy_id)).await?;
        let mut orders = HashMap::new();
        for (order_id, value) in raw {
            orders.insert(order_id, serde_json::from_str(&value)?);
        }
        Ok(orders)
    }

    pub async fn remove_order(&self, strategy_id: &str, order_id: &str) -> Result<()> {
        self.kv.hash_del(&self.key("orders", strategy_id), order_id).await
    }

    /// Append to the strategy event log; the tail is bounded.
    pub async fn append_event(&self, strategy_id: &str, event: &Value) -> Result<()> {
        let key = self.key("events", strategy_id);
        let mut record = event.clone();
        if let Value::Object(map) = &mut record {
            map.insert("timestamp".to_string(), serde_json::to_value(Utc::now())?);
        }
        self.kv.list_push(&key, record.to_string(), EVENT_LOG_CAP).await?;
        self.kv.expire(&key, TTL).await
    }

    pub async fn get_recent_events(&self, strategy_id: &str, limit: usize) -> Result<Vec<Value>> {
        let raw = self.kv.list_tail(&self.key("events", strategy_id), limit).await?;
        raw.iter()
            .map(|item| Ok(serde_json::from_str(item)?))
            .collect()
    }
}
