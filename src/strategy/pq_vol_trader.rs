//! P vs Q volatility trader.
//!
//! P is the market-implied ATM volatility read off the surface; Q is the
//! model-predicted volatility from the forecast stream. The strategy trades
//! their spread: when the model sees more volatility than the market prices
//! (Q > P + threshold) it buys straddles, in the opposite case it sells
//! them. A FOMO guard flips the intent to hold when sentiment and realized
//! volatility jointly run hot.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;
use serde::Deserialize;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::Result;
use crate::events::{
    IntentAction, MacroState, Metadata, OrderFill, PositionUpdate, Regime, Side, StrategyIntent,
    VolatilityForecast, VolatilitySurface,
};
use crate::strategy::engine::StrategyFactory;
use crate::strategy::plugin::{
    EventInterests, InstrumentType, Strategy, StrategyCapability, StrategyOutput,
};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PqVolTraderConfig {
    pub underlying: String,
    /// Minimum |Q - P| spread before trading.
    pub vol_threshold: f64,
    pub forecast_horizon: String,
    /// Maximum absolute volatility position, in structure units.
    pub max_position_size: f64,
    /// Size of each individual intent.
    pub intent_base_size: f64,
    /// Above this FOMO score the strategy refuses to add exposure.
    pub max_fomo_score: f64,
    pub signal_cooldown_secs: u64,
}

impl Default for PqVolTraderConfig {
    fn default() -> Self {
        Self {
            underlying: "BTC/USDT".to_string(),
            vol_threshold: 0.05,
            forecast_horizon: "24h".to_string(),
            max_position_size: 1.0,
            intent_base_size: 0.1,
            max_fomo_score: 0.7,
            signal_cooldown_secs: 3_600,
        }
    }
}

/// Aggregated view the intent decision runs on.
#[derive(Debug, Clone)]
struct MarketView {
    p_vol: f64,
    q_vol: f64,
    pq_spread: f64,
    regime: Option<Regime>,
    regime_score: f64,
    fomo_score: Option<f64>,
}

#[derive(Debug, Clone)]
struct Decision {
    intent_type: &'static str,
    direction: Option<Side>,
    reason: &'static str,
}

pub struct PqVolTraderStrategy {
    strategy_id: String,
    config: PqVolTraderConfig,
    initialized: bool,
    latest_p_vol: Option<f64>,
    latest_q_vol: Option<f64>,
    regime: Option<Regime>,
    regime_score: f64,
    latest_sentiment: Option<f64>,
    latest_fomo: Option<f64>,
    /// Net volatility position: positive long gamma, negative short.
    current_position: f64,
    last_signal_time: Option<DateTime<Utc>>,
}

impl PqVolTraderStrategy {
    pub fn new(strategy_id: impl Into<String>, config: PqVolTraderConfig) -> Self {
        Self {
            strategy_id: strategy_id.into(),
            config,
            initialized: false,
            latest_p_vol: None,
            latest_q_vol: None,
            regime: None,
            regime_score: 0.0,
            latest_sentiment: None,
            latest_fomo: None,
            current_position: 0.0,
            last_signal_time: None,
        }
    }

    pub fn factory() -> StrategyFactory {
        std::sync::Arc::new(|strategy_id, config, _context| {
            let config: PqVolTraderConfig = serde_json::from_value(config.clone())?;
            Ok(Box::new(PqVolTraderStrategy::new(strategy_id, config)))
        })
    }

    fn market_view(&self) -> Option<MarketView> {
        let p_vol = self.latest_p_vol?;
        let q_vol = self.latest_q_vol?;
        Some(MarketView {
            p_vol,
            q_vol,
            pq_spread: q_vol - p_vol,
            regime: self.regime,
            regime_score: self.regime_score,
            fomo_score: self.latest_fomo,
        })
    }

    fn decide(&self, view: &MarketView) -> Decision {
        // FOMO defence: refuse to add exposure into euphoric tape.
        if let Some(fomo) = view.fomo_score {
            if fomo > self.config.max_fomo_score {
                return Decision {
                    intent_type: "hold",
                    direction: None,
                    reason: "high_fomo_risk",
                };
            }
        }

        if view.pq_spread > self.config.vol_threshold
            && self.current_position < self.config.max_position_size
        {
            return Decision {
                intent_type: "increase_long_gamma",
                direction: Some(Side::Buy),
                reason: "market_underpricing_volatility",
            };
        }

        if view.pq_spread < -self.config.vol_threshold
            && self.current_position > -self.config.max_position_size
        {
            return Decision {
                intent_type: "increase_short_gamma",
                direction: Some(Side::Sell),
                reason: "market_overpricing_volatility",
            };
        }

        Decision {
            intent_type: "hold",
            direction: None,
            reason: "threshold_not_met",
        }
    }

    fn check_pq_spread(&mut self) -> Option<StrategyOutput> {
        if let Some(last) = self.last_signal_time {
            let elapsed = (Utc::now() - last).num_seconds();
            if elapsed < self.config.signal_cooldown_secs as i64 {
                return None;
            }
        }

        let view = self.market_view()?;
        let decision = self.decide(&view);

        info!(
            strategy_id = %self.strategy_id,
            p_vol = %format!("{:.2}%", view.p_vol * 100.0),
            q_vol = %format!("{:.2}%", view.q_vol * 100.0),
            pq_spread = %format!("{:+.2}%", view.pq_spread * 100.0),
            regime = view.regime.map(|r| r.as_str()).unwrap_or("unknown"),
            intent = decision.intent_type,
            "state evaluated"
        );

        let quantity = match decision.direction {
            Some(direction) => {
                let available = match direction {
                    Side::Buy => (self.config.max_position_size - self.current_position).max(0.0),
                    Side::Sell => (self.config.max_position_size + self.current_position).max(0.0),
                };
                let quantity = self.config.intent_base_size.min(available);
                if quantity <= 0.0 {
                    // Clipped to nothing: no room left in the book.
                    return None;
                }
                quantity
            }
            None => 0.0,
        };

        let action = match decision.direction {
            Some(Side::Buy) => IntentAction::BuyStraddle,
            Some(Side::Sell) => IntentAction::SellStraddle,
            None => IntentAction::Hold,
        };

        let mut metadata = Metadata::new();
        let entries = [
            ("strategy_type", serde_json::json!("pq_vol_trader")),
            ("p_vol", serde_json::json!(view.p_vol)),
            ("q_vol", serde_json::json!(view.q_vol)),
            ("pq_spread", serde_json::json!(view.pq_spread)),
            ("fomo_score", serde_json::json!(view.fomo_score)),
            (
                "macro_regime",
                serde_json::json!(view.regime.map(|r| r.as_str())),
            ),
            ("regime_score", serde_json::json!(view.regime_score)),
            ("quantity", serde_json::json!(quantity)),
        ];
        for (key, value) in entries {
            metadata.insert(key.to_string(), value);
        }

        let intent = StrategyIntent {
            intent_id: Uuid::new_v4().to_string(),
            strategy_id: self.strategy_id.clone(),
            symbol: self.config.underlying.clone(),
            intent_type: decision.intent_type.to_string(),
            action,
            direction: decision.direction,
            quantity: Decimal::from_f64(quantity).unwrap_or(Decimal::ZERO),
            confidence: (view.pq_spread.abs() / self.config.vol_threshold).min(1.0),
            reason: Some(decision.reason.to_string()),
            metadata,
            timestamp: Utc::now(),
        };

        self.last_signal_time = Some(Utc::now());
        Some(StrategyOutput::Intent(intent))
    }
}

#[async_trait]
impl Strategy for PqVolTraderStrategy {
    async fn initialize(&mut self) -> Result<()> {
        info!(
            strategy_id = %self.strategy_id,
            underlying = %self.config.underlying,
            vol_threshold = %format!("{:.2}%", self.config.vol_threshold * 100.0),
            "initializing P/Q volatility trader"
        );
        self.initialized = true;
        Ok(())
    }

    fn capability(&self) -> StrategyCapability {
        StrategyCapability {
            strategy_id: self.strategy_id.clone(),
            strategy_name: "PqVolTraderStrategy".to_string(),
            instrument_types: vec![InstrumentType::Option],
            symbols: vec![self.config.underlying.clone()],
            leverage_required: false,
            max_leverage: 1.0,
            min_capital: Decimal::from(1_000),
            dependencies: vec![
                "options_chain_adapter".to_string(),
                "volatility_forecast_service".to_string(),
            ],
            interests: EventInterests {
                volatility_surface: true,
                volatility_forecast: true,
                macro_state: true,
                portfolio_risk: false,
            },
        }
    }

    fn is_initialized(&self) -> bool {
        self.initialized
    }

    async fn on_volatility_surface(
        &mut self,
        surface: &VolatilitySurface,
    ) -> Result<Option<StrategyOutput>> {
        if surface.underlying != self.config.underlying {
            return Ok(None);
        }
        self.latest_p_vol = Some(surface.atm_iv);
        debug!(
            strategy_id = %self.strategy_id,
            atm_iv = %format!("{:.2}%", surface.atm_iv * 100.0),
            "P updated"
        );
        if self.latest_q_vol.is_some() {
            return Ok(self.check_pq_spread());
        }
        Ok(None)
    }

    async fn on_volatility_forecast(
        &mut self,
        forecast: &VolatilityForecast,
    ) -> Result<Option<StrategyOutput>> {
        if forecast.underlying != self.config.underlying
            || forecast.horizon != self.config.forecast_horizon
        {
            return Ok(None);
        }
        self.latest_q_vol = Some(forecast.predicted_volatility);
        debug!(
            strategy_id = %self.strategy_id,
            predicted = %format!("{:.2}%", forecast.predicted_volatility * 100.0),
            confidence = %format!("{:.2}", forecast.confidence),
            "Q updated"
        );
        if self.latest_p_vol.is_some() {
            return Ok(self.check_pq_spread());
        }
        Ok(None)
    }

    async fn on_macro_state(&mut self, state: &MacroState) -> Result<Option<StrategyOutput>> {
        if let Some(symbol) = &state.symbol {
            if symbol != &self.config.underlying {
                return Ok(None);
            }
        }
        self.regime = Some(state.regime);
        self.regime_score = state.regime_score;
        if state.sentiment_score.is_some() {
            self.latest_sentiment = state.sentiment_score;
        }
        if state.fomo_score.is_some() {
            self.latest_fomo = state.fomo_score;
        }
        Ok(None)
    }

    async fn on_fill(&mut self, fill: &OrderFill) -> Result<()> {
        let quantity = fill.quantity.to_f64().unwrap_or(0.0);
        match fill.side {
            Side::Buy => self.current_position += quantity,
            Side::Sell => self.current_position -= quantity,
        }
        info!(
            strategy_id = %self.strategy_id,
            side = fill.side.as_str(),
            position = %format!("{:+.2}", self.current_position),
            "volatility position updated"
        );
        Ok(())
    }

    async fn on_position_update(&mut self, position: &PositionUpdate) -> Result<()> {
        self.current_position = position.quantity.to_f64().unwrap_or(0.0);
        Ok(())
    }

    async fn shutdown(&mut self) -> Result<()> {
        self.initialized = false;
        Ok(())
    }
}
