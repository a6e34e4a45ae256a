//! Grid trading strategy, kept on the legacy signal path.
//!
//! Price crossing a band around the base price arms the side; the signal
//! fires once price pulls back from the extreme by the flip threshold. The
//! engine turns the resulting signals into limit orders.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use serde::Deserialize;
use tracing::{debug, info};

use crate::error::Result;
use crate::events::{MarketTick, Metadata, OrderFill, PositionUpdate, SignalKind, StrategySignal};
use crate::strategy::engine::StrategyFactory;
use crate::strategy::plugin::{
    EventInterests, InstrumentType, Strategy, StrategyCapability, StrategyContext, StrategyOutput,
};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GridConfig {
    pub symbol: String,
    /// 0 means: adopt the first observed price.
    pub base_price: f64,
    /// Band width as a percentage of base price.
    pub grid_size: f64,
    /// Pullback fraction of the grid that confirms a reversal.
    pub flip_threshold_factor: f64,
    pub min_trade_interval_secs: u64,
    pub order_quantity: f64,
}

impl Default for GridConfig {
    fn default() -> Self {
        Self {
            symbol: "BNB/USDT".to_string(),
            base_price: 0.0,
            grid_size: 2.0,
            flip_threshold_factor: 0.3,
            min_trade_interval_secs: 30,
            order_quantity: 0.1,
        }
    }
}

pub struct GridStrategy {
    strategy_id: String,
    config: GridConfig,
    context: Option<StrategyContext>,
    initialized: bool,
    base_price: Decimal,
    current_price: Option<Decimal>,
    highest: Option<Decimal>,
    lowest: Option<Decimal>,
    last_trade_time: Option<DateTime<Utc>>,
    sell_watch: bool,
    buy_watch: bool,
}

impl GridStrategy {
    pub fn new(
        strategy_id: impl Into<String>,
        config: GridConfig,
        context: Option<StrategyContext>,
    ) -> Self {
        let base_price = Decimal::from_f64(config.base_price).unwrap_or(Decimal::ZERO);
        Self {
            strategy_id: strategy_id.into(),
            config,
            context,
            initialized: false,
            base_price,
            current_price: None,
            highest: None,
            lowest: None,
            last_trade_time: None,
            sell_watch: false,
            buy_watch: false,
        }
    }

    pub fn factory() -> StrategyFactory {
        std::sync::Arc::new(|strategy_id, config, context| {
            let config: GridConfig = serde_json::from_value(config.clone())?;
            Ok(Box::new(GridStrategy::new(strategy_id, config, Some(context))))
        })
    }

    fn grid_fraction(&self) -> Decimal {
        Decimal::from_f64(self.config.grid_size / 100.0).unwrap_or(Decimal::ZERO)
    }

    fn flip_threshold(&self) -> Decimal {
        self.grid_fraction()
            * Decimal::from_f64(self.config.flip_threshold_factor).unwrap_or(Decimal::ZERO)
    }

    fn upper_band(&self) -> Decimal {
        self.base_price * (Decimal::ONE + self.grid_fraction())
    }

    fn lower_band(&self) -> Decimal {
        self.base_price * (Decimal::ONE - self.grid_fraction())
    }

    fn reset_extremes(&mut self) {
        if self.highest.is_some() || self.lowest.is_some() {
            debug!(
                strategy_id = %self.strategy_id,
                highest = ?self.highest,
                lowest = ?self.lowest,
                "resetting extremes"
            );
        }
        self.highest = None;
        self.lowest = None;
        self.sell_watch = false;
        self.buy_watch = false;
    }

    fn signal(&self, kind: SignalKind, price: Decimal, extreme: Decimal) -> StrategySignal {
        let mut metadata = Metadata::new();
        metadata.insert("grid_size".to_string(), serde_json::json!(self.config.grid_size));
        metadata.insert("base_price".to_string(), serde_json::json!(self.base_price));
        metadata.insert("extreme_price".to_string(), serde_json::json!(extreme));
        metadata.insert(
            "quantity".to_string(),
            serde_json::json!(self.config.order_quantity),
        );
        StrategySignal {
            strategy_id: self.strategy_id.clone(),
            signal_type: kind,
            symbol: self.config.symbol.clone(),
            confidence: 1.0,
            target_price: Some(price),
            stop_loss: None,
            take_profit: None,
            timestamp: Utc::now(),
            metadata,
        }
    }

    fn check_sell(&mut self, price: Decimal) -> Option<StrategySignal> {
        if price < self.upper_band() {
            if self.sell_watch {
                self.sell_watch = false;
                self.highest = None;
            }
            return None;
        }

        self.sell_watch = true;
        let highest = self.highest.map_or(price, |h| h.max(price));
        if Some(highest) != self.highest {
            self.highest = Some(highest);
            info!(
                strategy_id = %self.strategy_id,
                price = %price,
                trigger = %self.upper_band(),
                highest = %highest,
                "sell watch"
            );
        }

        let pullback = highest * (Decimal::ONE - self.flip_threshold());
        if price <= pullback {
            self.sell_watch = false;
            self.highest = None;
            info!(strategy_id = %self.strategy_id, price = %price, "sell signal");
            return Some(self.signal(SignalKind::Sell, price, highest));
        }
        None
    }

    fn check_buy(&mut self, price: Decimal) -> Option<StrategySignal> {
        if price > self.lower_band() {
            if self.buy_watch {
                self.buy_watch = false;
                self.lowest = None;
            }
            return None;
        }

        self.buy_watch = true;
        let lowest = self.lowest.map_or(price, |l| l.min(price));
        if Some(lowest) != self.lowest {
            self.lowest = Some(lowest);
            info!(
                strategy_id = %self.strategy_id,
                price = %price,
                trigger = %self.lower_band(),
                lowest = %lowest,
                "buy watch"
            );
        }

        let rebound = lowest * (Decimal::ONE + self.flip_threshold());
        if price >= rebound {
            self.buy_watch = false;
            self.lowest = None;
            info!(strategy_id = %self.strategy_id, price = %price, "buy signal");
            return Some(self.signal(SignalKind::Buy, price, lowest));
        }
        None
    }
}

#[async_trait]
impl Strategy for GridStrategy {
    async fn initialize(&mut self) -> Result<()> {
        info!(
            strategy_id = %self.strategy_id,
            symbol = %self.config.symbol,
            base_price = %self.base_price,
            grid_size = %format!("{}%", self.config.grid_size),
            "initializing grid strategy"
        );
        self.initialized = true;
        Ok(())
    }

    fn capability(&self) -> StrategyCapability {
        StrategyCapability {
            strategy_id: self.strategy_id.clone(),
            strategy_name: "GridStrategy".to_string(),
            instrument_types: vec![InstrumentType::Spot],
            symbols: vec![self.config.symbol.clone()],
            leverage_required: false,
            max_leverage: 1.0,
            min_capital: Decimal::from(100),
            dependencies: Vec::new(),
            interests: EventInterests::default(),
        }
    }

    fn is_initialized(&self) -> bool {
        self.initialized
    }

    async fn on_tick(&mut self, tick: &MarketTick) -> Result<Option<StrategyOutput>> {
        if tick.symbol != self.config.symbol {
            return Ok(None);
        }
        self.current_price = Some(tick.price);

        if self.base_price == Decimal::ZERO {
            self.base_price = tick.price;
            info!(
                strategy_id = %self.strategy_id,
                base_price = %self.base_price,
                "adopted first price as grid base"
            );
            return Ok(None);
        }

        if let Some(last) = self.last_trade_time {
            let elapsed = (Utc::now() - last).num_seconds();
            if elapsed < self.config.min_trade_interval_secs as i64 {
                return Ok(None);
            }
        }

        if let Some(signal) = self.check_sell(tick.price) {
            return Ok(Some(StrategyOutput::Signal(signal)));
        }
        if let Some(signal) = self.check_buy(tick.price) {
            return Ok(Some(StrategyOutput::Signal(signal)));
        }
        Ok(None)
    }

    async fn on_fill(&mut self, fill: &OrderFill) -> Result<()> {
        info!(
            strategy_id = %self.strategy_id,
            side = fill.side.as_str(),
            price = %fill.price,
            quantity = %fill.quantity,
            "grid fill, rebasing"
        );
        self.base_price = fill.price;
        self.last_trade_time = Some(Utc::now());
        self.reset_extremes();

        if let Some(context) = &self.context {
            let state = serde_json::json!({
                "base_price": self.base_price,
                "grid_size": self.config.grid_size,
            });
            context
                .state
                .set_strategy_state(&self.strategy_id, &state)
                .await?;
        }
        Ok(())
    }

    async fn on_position_update(&mut self, position: &PositionUpdate) -> Result<()> {
        debug!(
            strategy_id = %self.strategy_id,
            symbol = %position.symbol,
            quantity = %position.quantity,
            "position update"
        );
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
    use crate::events::Side;
    use rust_decimal_macros::dec;

    fn tick(price: Decimal) -> MarketTick {
        MarketTick {
            symbol: "BNB/USDT".to_string(),
            price,
            volume: dec!(1),
            bid: None,
            ask: None,
            timestamp: Utc::now(),
            metadata: Metadata::new(),
        }
    }

    fn strategy(base: f64) -> GridStrategy {
        GridStrategy::new(
            "grid-1",
            GridConfig {
                base_price: base,
                min_trade_interval_secs: 0,
                ..GridConfig::default()
            },
            None,
        )
    }

    #[tokio::test]
    async fn adopts_first_price_when_base_unset() {
        let mut s = strategy(0.0);
        assert!(s.on_tick(&tick(dec!(600))).await.unwrap().is_none());
        assert_eq!(s.base_price, dec!(600));
    }

    #[tokio::test]
    async fn buy_fires_after_rebound_from_low() {
        let mut s = strategy(600.0);
        // 2% lower band is 588; dip well below it, then rebound 0.6% off
        // the low while still under the band.
        assert!(s.on_tick(&tick(dec!(588))).await.unwrap().is_none());
        assert!(s.on_tick(&tick(dec!(580))).await.unwrap().is_none());
        let output = s.on_tick(&tick(dec!(584))).await.unwrap();
        let Some(StrategyOutput::Signal(signal)) = output else {
            panic!("expected buy signal");
        };
        assert_eq!(signal.signal_type, SignalKind::Buy);
        assert_eq!(signal.target_price, Some(dec!(584)));
    }

    #[tokio::test]
    async fn sell_fires_after_pullback_from_high() {
        let mut s = strategy(600.0);
        // 2% upper band is 612; rally through it, then fade 0.6%.
        assert!(s.on_tick(&tick(dec!(612))).await.unwrap().is_none());
        assert!(s.on_tick(&tick(dec!(620))).await.unwrap().is_none());
        let output = s.on_tick(&tick(dec!(616))).await.unwrap();
        let Some(StrategyOutput::Signal(signal)) = output else {
            panic!("expected sell signal");
        };
        assert_eq!(signal.signal_type, SignalKind::Sell);
    }

    #[tokio::test]
    async fn fill_rebases_the_grid() {
        let mut s = strategy(600.0);
        let fill = OrderFill {
            strategy_id: "grid-1".to_string(),
            order_id: "o1".to_string(),
            symbol: "BNB/USDT".to_string(),
            side: Side::Buy,
            quantity: dec!(0.1),
            price: dec!(589),
            fee: Decimal::ZERO,
            timestamp: Utc::now(),
            metadata: Metadata::new(),
        };
        s.on_fill(&fill).await.unwrap();
        assert_eq!(s.base_price, dec!(589));
        assert!(s.highest.is_none() && s.lowest.is_none());
        assert!(!s.sell_watch && !s.buy_watch);
    }

    #[tokio::test]
    async fn ignores_other_symbols() {
        let mut s = strategy(600.0);
        let mut other = tick(dec!(650));
        other.symbol = "ETH/USDT".to_string();
        assert!(s.on_tick(&other).await.unwrap().is_none());
        assert!(s.current_price.is_none());
    }
}
