//! Strategy plugin contract.
//!
//! A strategy receives events through optional handlers and answers with
//! intents (modern) or signals (legacy). It never owns engine references:
//! the immutable [`StrategyContext`] handle passed at construction is its
//! only window onto the bus and state store.

use std::sync::Arc;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::bus::{publish_event, streams, MessageBus};
use crate::error::Result;
use crate::events::{
    MacroState, MarketTick, OrderFill, PortfolioRisk, PositionUpdate, StrategyIntent,
    StrategySignal, VolatilityForecast, VolatilitySurface,
};
use crate::market_data::exchange::ExchangeClient;
use crate::state::StrategyStateStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstrumentType {
    Spot,
    Perpetual,
    Futures,
    Option,
}

/// Which broadcast streams a strategy actually handles. Computed once at
/// registration so the engine never probes per event.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EventInterests {
    pub volatility_surface: bool,
    pub volatility_forecast: bool,
    pub macro_state: bool,
    pub portfolio_risk: bool,
}

#[derive(Debug, Clone)]
pub struct StrategyCapability {
    pub strategy_id: String,
    pub strategy_name: String,
    pub instrument_types: Vec<InstrumentType>,
    pub symbols: Vec<String>,
    pub leverage_required: bool,
    pub max_leverage: f64,
    pub min_capital: Decimal,
    pub dependencies: Vec<String>,
    pub interests: EventInterests,
}

/// A strategy's answer to an event.
#[derive(Debug, Clone)]
pub enum StrategyOutput {
    Signal(StrategySignal),
    Intent(StrategyIntent),
}

/// Immutable handle giving strategies access to shared infrastructure.
#[derive(Clone)]
pub struct StrategyContext {
    pub bus: Arc<dyn MessageBus>,
    pub state: Arc<StrategyStateStore>,
    pub exchange: Option<Arc<dyn ExchangeClient>>,
}

impl StrategyContext {
    pub fn new(
        bus: Arc<dyn MessageBus>,
        state: Arc<StrategyStateStore>,
        exchange: Option<Arc<dyn ExchangeClient>>,
    ) -> Self {
        Self { bus, state, exchange }
    }

    pub async fn publish_signal(&self, signal: &StrategySignal) -> Result<()> {
        publish_event(self.bus.as_ref(), streams::STRATEGY_SIGNAL, signal).await
    }

    pub async fn publish_intent(&self, intent: &StrategyIntent) -> Result<()> {
        publish_event(self.bus.as_ref(), streams::STRATEGY_INTENT, intent).await
    }
}

#[async_trait]
pub trait Strategy: Send + Sync {
    /// One-shot async setup.
    async fn initialize(&mut self) -> Result<()>;

    fn capability(&self) -> StrategyCapability;

    fn is_initialized(&self) -> bool;

    async fn on_tick(&mut self, _tick: &MarketTick) -> Result<Option<StrategyOutput>> {
        Ok(None)
    }

    async fn on_fill(&mut self, _fill: &OrderFill) -> Result<()> {
        Ok(())
    }

    async fn on_position_update(&mut self, _position: &PositionUpdate) -> Result<()> {
        Ok(())
    }

    async fn on_volatility_surface(
        &mut self,
        _surface: &VolatilitySurface,
    ) -> Result<Option<StrategyOutput>> {
        Ok(None)
    }

    async fn on_volatility_forecast(
        &mut self,
        _forecast: &VolatilityForecast,
    ) -> Result<Option<StrategyOutput>> {
        Ok(None)
    }

    async fn on_macro_state(&mut self, _state: &MacroState) -> Result<Option<StrategyOutput>> {
        Ok(None)
    }

    async fn on_portfolio_risk(
        &mut self,
        _risk: &PortfolioRisk,
    ) -> Result<Option<StrategyOutput>> {
        Ok(None)
    }

    async fn shutdown(&mut self) -> Result<()>;
}
