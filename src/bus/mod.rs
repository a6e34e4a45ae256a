//! Message bus: ordered append-only streams with consumer-group semantics.
//!
//! Every inter-component signal is a JSON-encoded event on a named stream.
//! Components subscribe as `(group, consumer)` pairs; delivery is
//! at-least-once per group, acknowledged after successful decode.

pub mod memory;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::Result;

pub use memory::MemoryStreamBus;

/// Logical stream names. The bus prefixes these with its namespace.
pub mod streams {
    pub const MARKET_TICK: &str = "market.tick";
    pub const MARKET_VOL_SURFACE: &str = "market.vol_surface";
    pub const MARKET_MACRO_STATE: &str = "market.macro_state";
    pub const STRATEGY_FORECAST_VOLATILITY: &str = "strategy.forecast.volatility";
    pub const STRATEGY_SIGNAL: &str = "strategy.signal";
    pub const STRATEGY_INTENT: &str = "strategy.intent";
    pub const EXECUTION_COMMAND: &str = "execution.command";
    pub const ORDER_COMMAND: &str = "order.command";
    pub const ORDER_FILL: &str = "order.fill";
    pub const POSITION_UPDATE: &str = "position.update";
    pub const PORTFOLIO_RISK: &str = "portfolio.risk";
    pub const RISK_ALERT: &str = "risk.alert";
}

/// A decoded message delivered to a subscription.
#[derive(Debug, Clone)]
pub struct BusEvent {
    /// Logical stream name (namespace prefix stripped).
    pub stream: String,
    pub payload: serde_json::Value,
}

/// Item yielded by a subscription.
#[derive(Debug, Clone)]
pub enum BusItem {
    Event(BusEvent),
    /// Emitted by multi-stream subscriptions when no message arrived within
    /// the block window, so consumers can run periodic housekeeping.
    KeepAlive,
}

#[async_trait]
pub trait Subscription: Send {
    /// Next item for this consumer. `None` once the bus is closed.
    async fn next(&mut self) -> Result<Option<BusItem>>;
}

#[async_trait]
pub trait MessageBus: Send + Sync {
    async fn publish(&self, stream: &str, payload: &serde_json::Value) -> Result<()>;

    async fn subscribe(&self, stream: &str) -> Result<Box<dyn Subscription>>;

    async fn subscribe_multiple(&self, streams: &[&str]) -> Result<Box<dyn Subscription>>;

    async fn close(&self) -> Result<()>;
}

/// Serialize and publish a typed event.
pub async fn publish_event<T: Serialize + Sync>(
    bus: &dyn MessageBus,
    stream: &str,
    event: &T,
) -> Result<()> {
    let payload = serde_json::to_value(event)?;
    bus.publish(stream, &payload).await
}

/// Decode a bus payload into a typed event.
pub fn decode_event<T: DeserializeOwned>(payload: serde_json::Value) -> Result<T> {
    Ok(serde_json::from_value(payload)?)
}
