use std::collections::HashMap;

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::{Result, TradingError};

pub type Metadata = HashMap<String, serde_json::Value>;

/// Order / intent direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "buy",
            Side::Sell => "sell",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderType {
    Market,
    Limit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderAction {
    Create,
    Cancel,
    Modify,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OptionKind {
    Call,
    Put,
}

/// High-level action carried by a strategy intent. Option structures are
/// translated by the option execution service; everything else becomes a
/// direct order command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntentAction {
    BuyStraddle,
    SellStraddle,
    BuyStrangle,
    SellStrangle,
    DeltaHedge,
    Hold,
}

impl IntentAction {
    /// True for multi-leg option structures that need the translation layer.
    pub fn is_option_structure(&self) -> bool {
        matches!(
            self,
            IntentAction::BuyStraddle
                | IntentAction::SellStraddle
                | IntentAction::BuyStrangle
                | IntentAction::SellStrangle
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalKind {
    Buy,
    Sell,
    Hold,
    Close,
}

/// Joint (volatility, sentiment) market state label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Regime {
    Bull,
    Bear,
    Panic,
    HighVolBull,
    Chop,
    Unknown,
}

impl Regime {
    pub fn as_str(&self) -> &'static str {
        match self {
            Regime::Bull => "bull",
            Regime::Bear => "bear",
            Regime::Panic => "panic",
            Regime::HighVolBull => "high_vol_bull",
            Regime::Chop => "chop",
            Regime::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertType {
    Drawdown,
    PositionLimit,
    LossLimit,
    Volatility,
    Liquidity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    Info,
    Warning,
    Critical,
}

/// Market ticker sample published by the market data adapter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketTick {
    pub symbol: String,
    pub price: Decimal,
    #[serde(default)]
    pub volume: Decimal,
    #[serde(default)]
    pub bid: Option<Decimal>,
    #[serde(default)]
    pub ask: Option<Decimal>,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub metadata: Metadata,
}

impl MarketTick {
    pub fn validate(&self) -> Result<()> {
        if self.symbol.is_empty() {
            return Err(TradingError::Validation("Symbol cannot be empty".to_string()));
        }
        if self.price <= Decimal::ZERO {
            return Err(TradingError::Validation("Price must be positive".to_string()));
        }
        if self.volume < Decimal::ZERO {
            return Err(TradingError::Validation("Volume cannot be negative".to_string()));
        }
        if let (Some(bid), Some(ask)) = (self.bid, self.ask) {
            if bid > ask {
                return Err(TradingError::Validation(format!(
                    "Crossed quote for {}: bid {} > ask {}",
                    self.symbol, bid, ask
                )));
            }
        }
        Ok(())
    }
}

/// Option price sensitivities. Theta is quoted per calendar day, vega and rho
/// per 1% move.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct OptionGreeks {
    pub delta: f64,
    pub gamma: f64,
    pub theta: f64,
    pub vega: f64,
    pub rho: f64,
}

impl OptionGreeks {
    pub fn zero() -> Self {
        Self::default()
    }
}

/// One quoted contract of an option chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptionChainEntry {
    pub underlying: String,
    pub strike: Decimal,
    pub expiry: NaiveDate,
    pub option_type: OptionKind,
    pub bid: Decimal,
    pub ask: Decimal,
    pub last: Decimal,
    pub volume: Decimal,
    pub open_interest: Decimal,
    pub implied_volatility: f64,
    #[serde(default)]
    pub greeks: Option<OptionGreeks>,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

/// Snapshot of the implied-volatility surface for one underlying.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolatilitySurface {
    pub underlying: String,
    pub entries: Vec<OptionChainEntry>,
    pub atm_iv: f64,
    /// Volatility skew keyed by integer strike.
    #[serde(default)]
    pub iv_skew: HashMap<String, f64>,
    /// Term structure keyed by expiry date (ISO).
    #[serde(default)]
    pub term_structure: HashMap<String, f64>,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

/// Model-predicted volatility for one underlying and horizon.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolatilityForecast {
    pub underlying: String,
    pub horizon: String,
    pub predicted_volatility: f64,
    pub confidence: f64,
    pub model_version: String,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

/// Periodic macro / sentiment broadcast from the risk service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MacroState {
    #[serde(default)]
    pub symbol: Option<String>,
    pub regime: Regime,
    pub regime_score: f64,
    #[serde(default)]
    pub sentiment_score: Option<f64>,
    #[serde(default)]
    pub fomo_score: Option<f64>,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

/// Legacy per-tick strategy output, routed as a limit order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategySignal {
    pub strategy_id: String,
    pub signal_type: SignalKind,
    pub symbol: String,
    pub confidence: f64,
    #[serde(default)]
    pub target_price: Option<Decimal>,
    #[serde(default)]
    pub stop_loss: Option<Decimal>,
    #[serde(default)]
    pub take_profit: Option<Decimal>,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub metadata: Metadata,
}

/// High-level strategy desire, prior to risk approval.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyIntent {
    pub intent_id: String,
    pub strategy_id: String,
    pub symbol: String,
    pub intent_type: String,
    pub action: IntentAction,
    #[serde(default)]
    pub direction: Option<Side>,
    #[serde(default)]
    pub quantity: Decimal,
    pub confidence: f64,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub metadata: Metadata,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

/// Risk-approved intent, ready for the execution translation layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionCommand {
    pub intent_id: String,
    pub strategy_id: String,
    pub symbol: String,
    pub action: IntentAction,
    #[serde(default)]
    pub direction: Option<Side>,
    #[serde(default)]
    pub quantity: Decimal,
    pub approved_by: String,
    #[serde(default)]
    pub metadata: Metadata,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

/// Concrete instruction for the order router.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderCommand {
    pub strategy_id: String,
    pub symbol: String,
    pub side: Side,
    pub order_type: OrderType,
    pub quantity: Decimal,
    #[serde(default)]
    pub price: Option<Decimal>,
    pub command: OrderAction,
    #[serde(default)]
    pub order_id: Option<String>,
    #[serde(default)]
    pub metadata: Metadata,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderFill {
    pub strategy_id: String,
    pub order_id: String,
    pub symbol: String,
    pub side: Side,
    pub quantity: Decimal,
    pub price: Decimal,
    #[serde(default)]
    pub fee: Decimal,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub metadata: Metadata,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionUpdate {
    pub strategy_id: String,
    pub symbol: String,
    pub quantity: Decimal,
    pub avg_price: Decimal,
    #[serde(default)]
    pub unrealized_pnl: Decimal,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskAlert {
    pub strategy_id: String,
    pub alert_type: AlertType,
    pub severity: AlertSeverity,
    pub message: String,
    pub current_value: f64,
    pub threshold_value: f64,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub metadata: Metadata,
}

/// Aggregated portfolio Greeks broadcast after every risk-metric refresh.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortfolioRisk {
    pub total_delta: f64,
    pub total_gamma: f64,
    pub total_vega: f64,
    pub total_theta: f64,
    pub total_rho: f64,
    #[serde(default)]
    pub position_ratio: Option<f64>,
    #[serde(default)]
    pub leverage: Option<f64>,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub metadata: Metadata,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn tick(price: Decimal, bid: Option<Decimal>, ask: Option<Decimal>) -> MarketTick {
        MarketTick {
            symbol: "BTC/USDT".to_string(),
            price,
            volume: dec!(1),
            bid,
            ask,
            timestamp: Utc::now(),
            metadata: Metadata::new(),
        }
    }

    #[test]
    fn tick_validation_rejects_crossed_quote() {
        let t = tick(dec!(100), Some(dec!(101)), Some(dec!(100)));
        assert!(t.validate().is_err());
    }

    #[test]
    fn tick_validation_accepts_sane_quote() {
        let t = tick(dec!(100), Some(dec!(99)), Some(dec!(101)));
        assert!(t.validate().is_ok());
    }

    #[test]
    fn option_structure_actions() {
        assert!(IntentAction::BuyStraddle.is_option_structure());
        assert!(IntentAction::SellStrangle.is_option_structure());
        assert!(!IntentAction::DeltaHedge.is_option_structure());
        assert!(!IntentAction::Hold.is_option_structure());
    }

    #[test]
    fn intent_round_trips_through_json() {
        let intent = StrategyIntent {
            intent_id: "i1".to_string(),
            strategy_id: "pq".to_string(),
            symbol: "BTC/USDT".to_string(),
            intent_type: "increase_long_gamma".to_string(),
            action: IntentAction::BuyStraddle,
            direction: Some(Side::Buy),
            quantity: dec!(0.1),
            confidence: 1.0,
            reason: None,
            metadata: Metadata::new(),
            timestamp: Utc::now(),
        };
        let value = serde_json::to_value(&intent).unwrap();
        assert_eq!(value["action"], "buy_straddle");
        assert_eq!(value["direction"], "buy");
        let back: StrategyIntent = serde_json::from_value(value).unwrap();
        assert_eq!(back.action, IntentAction::BuyStraddle);
        assert_eq!(back.quantity, dec!(0.1));
    }
}
