//! Delta hedger: keeps the portfolio's aggregate delta pinned near zero by
//! trading the hedge instrument against every `portfolio.risk` broadcast.
//!
//! This is the scalping leg of a long-gamma book: spot up pushes delta
//! positive and the hedger sells into strength; spot down does the reverse.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;
use serde::Deserialize;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::Result;
use crate::events::{
    IntentAction, Metadata, OrderFill, PortfolioRisk, PositionUpdate, Side, StrategyIntent,
};
use crate::strategy::engine::StrategyFactory;
use crate::strategy::plugin::{
    EventInterests, InstrumentType, Strategy, StrategyCapability, StrategyOutput,
};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DeltaHedgerConfig {
    pub underlying: String,
    /// Instrument used to neutralize delta, typically the perpetual.
    pub hedge_instrument: String,
    /// Absolute delta beyond which a hedge is placed.
    pub delta_threshold: f64,
    pub hedge_cooldown_secs: u64,
}

impl Default for DeltaHedgerConfig {
    fn default() -> Self {
        Self {
            underlying: "BTC/USDT".to_string(),
            hedge_instrument: "BTC/USDT:USDT".to_string(),
            delta_threshold: 0.05,
            hedge_cooldown_secs: 60,
        }
    }
}

pub struct DeltaHedgerStrategy {
    strategy_id: String,
    config: DeltaHedgerConfig,
    initialized: bool,
    current_total_delta: f64,
    hedge_position: f64,
    last_hedge_time: Option<DateTime<Utc>>,
}

impl DeltaHedgerStrategy {
    pub fn new(strategy_id: impl Into<String>, config: DeltaHedgerConfig) -> Self {
        Self {
            strategy_id: strategy_id.into(),
            config,
            initialized: false,
            current_total_delta: 0.0,
            hedge_position: 0.0,
            last_hedge_time: None,
        }
    }

    pub fn factory() -> StrategyFactory {
        std::sync::Arc::new(|strategy_id, config, _context| {
            let config: DeltaHedgerConfig = serde_json::from_value(config.clone())?;
            Ok(Box::new(DeltaHedgerStrategy::new(strategy_id, config)))
        })
    }

    fn check_hedge_needed(&mut self, total_delta: f64) -> Option<StrategyOutput> {
        self.current_total_delta = total_delta;

        if total_delta.abs() < self.config.delta_threshold {
            debug!(
                strategy_id = %self.strategy_id,
                delta = %format!("{total_delta:+.4}"),
                threshold = self.config.delta_threshold,
                "delta inside band"
            );
            return None;
        }

        if let Some(last) = self.last_hedge_time {
            let elapsed = (Utc::now() - last).num_seconds();
            if elapsed < self.config.hedge_cooldown_secs as i64 {
                return None;
            }
        }

        // Hedge against the exposure: positive delta sells, negative buys.
        let hedge_quantity = -total_delta;
        info!(
            strategy_id = %self.strategy_id,
            delta = %format!("{total_delta:+.4}"),
            hedge = %format!("{hedge_quantity:+.4}"),
            "delta hedge required"
        );

        let mut metadata = Metadata::new();
        metadata.insert(
            "strategy_type".to_string(),
            serde_json::json!("delta_hedger"),
        );
        metadata.insert("current_delta".to_string(), serde_json::json!(total_delta));
        metadata.insert(
            "hedge_quantity".to_string(),
            serde_json::json!(hedge_quantity.abs()),
        );

        let intent = StrategyIntent {
            intent_id: Uuid::new_v4().to_string(),
            strategy_id: self.strategy_id.clone(),
            symbol: self.config.hedge_instrument.clone(),
            intent_type: "delta_hedge".to_string(),
            action: IntentAction::DeltaHedge,
            direction: Some(if hedge_quantity > 0.0 { Side::Buy } else { Side::Sell }),
            quantity: Decimal::from_f64(hedge_quantity.abs()).unwrap_or(Decimal::ZERO),
            confidence: 1.0,
            reason: Some("maintain_delta_neutral".to_string()),
            metadata,
            timestamp: Utc::now(),
        };
        self.last_hedge_time = Some(Utc::now());
        Some(StrategyOutput::Intent(intent))
    }
}

#[async_trait]
impl Strategy for DeltaHedgerStrategy {
    async fn initialize(&mut self) -> Result<()> {
        info!(
            strategy_id = %self.strategy_id,
            hedge_instrument = %self.config.hedge_instrument,
            delta_threshold = self.config.delta_threshold,
            "initializing delta hedger"
        );
        self.initialized = true;
        Ok(())
    }

    fn capability(&self) -> StrategyCapability {
        StrategyCapability {
            strategy_id: self.strategy_id.clone(),
            strategy_name: "DeltaHedgerStrategy".to_string(),
            instrument_types: vec![InstrumentType::Perpetual, InstrumentType::Futures],
            symbols: vec![self.config.hedge_instrument.clone()],
            leverage_required: true,
            max_leverage: 5.0,
            min_capital: Decimal::from(100),
            dependencies: vec!["portfolio_store".to_string(), "risk_service".to_string()],
            interests: EventInterests {
                volatility_surface: false,
                volatility_forecast: false,
                macro_state: false,
                portfolio_risk: true,
            },
        }
    }

    fn is_initialized(&self) -> bool {
        self.initialized
    }

    async fn on_portfolio_risk(
        &mut self,
        risk: &PortfolioRisk,
    ) -> Result<Option<StrategyOutput>> {
        Ok(self.check_hedge_needed(risk.total_delta))
    }

    async fn on_fill(&mut self, fill: &OrderFill) -> Result<()> {
        let quantity = fill.quantity.to_f64().unwrap_or(0.0);
        match fill.side {
            Side::Buy => self.hedge_position += quantity,
            Side::Sell => self.hedge_position -= quantity,
        }
        info!(
            strategy_id = %self.strategy_id,
            position = %format!("{:+.4}", self.hedge_position),
            "hedge position updated"
        );
        Ok(())
    }

    async fn on_position_update(&mut self, position: &PositionUpdate) -> Result<()> {
        if position.symbol == self.config.hedge_instrument {
            self.hedge_position = position.quantity.to_f64().unwrap_or(0.0);
        }
        Ok(())
    }

    async fn shutdown(&mut self) -> Result<()> {
        self.initialized = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn risk_event(total_delta: f64) -> PortfolioRisk {
        PortfolioRisk {
            total_delta,
            total_gamma: 0.0,
            total_vega: 0.0,
            total_theta: 0.0,
            total_rho: 0.0,
            position_ratio: None,
            leverage: None,
            timestamp: Utc::now(),
            metadata: Metadata::new(),
        }
    }

    fn strategy() -> DeltaHedgerStrategy {
        DeltaHedgerStrategy::new(
            "hedger-1",
            DeltaHedgerConfig {
                hedge_cooldown_secs: 0,
                ..DeltaHedgerConfig::default()
            },
        )
    }

    #[tokio::test]
    async fn positive_delta_sells_the_perp() {
        let mut s = strategy();
        let output = s.on_portfolio_risk(&risk_event(0.5)).await.unwrap();
        let Some(StrategyOutput::Intent(intent)) = output else {
            panic!("expected hedge intent");
        };
        assert_eq!(intent.action, IntentAction::DeltaHedge);
        assert_eq!(intent.direction, Some(Side::Sell));
        assert_eq!(intent.quantity, dec!(0.5));
        assert_eq!(intent.symbol, "BTC/USDT:USDT");
    }

    #[tokio::test]
    async fn negative_delta_buys_the_perp() {
        let mut s = strategy();
        let output = s.on_portfolio_risk(&risk_event(-0.3)).await.unwrap();
        let Some(StrategyOutput::Intent(intent)) = output else {
            panic!("expected hedge intent");
        };
        assert_eq!(intent.direction, Some(Side::Buy));
        assert_eq!(intent.quantity, dec!(0.3));
    }

    #[tokio::test]
    async fn delta_inside_band_does_nothing() {
        let mut s = strategy();
        assert!(s.on_portfolio_risk(&risk_event(0.01)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn cooldown_suppresses_back_to_back_hedges() {
        let mut s = DeltaHedgerStrategy::new(
            "hedger-1",
            DeltaHedgerConfig {
                hedge_cooldown_secs: 3_600,
                ..DeltaHedgerConfig::default()
            },
        );
        assert!(s.on_portfolio_risk(&risk_event(0.5)).await.unwrap().is_some());
        assert!(s.on_portfolio_risk(&risk_event(0.6)).await.unwrap().is_none());
    }
}
