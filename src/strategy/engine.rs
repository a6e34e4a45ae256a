//! Strategy engine: hosts plugin instances, fans bus events out to them, and
//! drives the intent pipeline (intent -> risk gate -> execution command or
//! direct order).

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::bus::{publish_event, streams, BusEvent, BusItem, MessageBus};
use crate::error::{Result, TradingError};
use crate::events::{
    ExecutionCommand, MacroState, MarketTick, OrderAction, OrderCommand, OrderFill, OrderType,
    PortfolioRisk, PositionUpdate, SignalKind, StrategyIntent, StrategySignal, VolatilityForecast,
    VolatilitySurface,
};
use crate::risk::RiskService;
use crate::strategy::plugin::{Strategy, StrategyCapability, StrategyContext, StrategyOutput};

/// Streams the engine consumes.
const INPUT_STREAMS: [&str; 8] = [
    streams::MARKET_TICK,
    streams::ORDER_FILL,
    streams::POSITION_UPDATE,
    streams::STRATEGY_INTENT,
    streams::MARKET_VOL_SURFACE,
    streams::STRATEGY_FORECAST_VOLATILITY,
    streams::PORTFOLIO_RISK,
    streams::MARKET_MACRO_STATE,
];

/// Redelivery guard: one intent id produces at most one downstream command.
const SEEN_INTENTS_CAP: usize = 1_024;

/// Fallback order size when an intent or signal carries no quantity.
fn default_order_quantity() -> Decimal {
    Decimal::new(1, 1) // 0.1
}

pub type StrategyFactory =
    Arc<dyn Fn(&str, &serde_json::Value, StrategyContext) -> Result<Box<dyn Strategy>> + Send + Sync>;

struct LoadedStrategy {
    strategy: Box<dyn Strategy>,
    capability: StrategyCapability,
}

#[derive(Default)]
struct SeenIntents {
    set: HashSet<String>,
    order: VecDeque<String>,
}

impl SeenIntents {
    /// True when the id is new.
    fn mark(&mut self, intent_id: &str) -> bool {
        if !self.set.insert(intent_id.to_string()) {
            return false;
        }
        self.order.push_back(intent_id.to_string());
        while self.order.len() > SEEN_INTENTS_CAP {
            if let Some(evicted) = self.order.pop_front() {
                self.set.remove(&evicted);
            }
        }
        true
    }
}

pub struct StrategyEngine {
    bus: Arc<dyn MessageBus>,
    risk: Option<Arc<RiskService>>,
    context: StrategyContext,
    factories: Mutex<HashMap<String, StrategyFactory>>,
    strategies: Arc<tokio::sync::Mutex<HashMap<String, LoadedStrategy>>>,
    running: Arc<AtomicBool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    seen_intents: Mutex<SeenIntents>,
}

impl StrategyEngine {
    pub fn new(
        bus: Arc<dyn MessageBus>,
        context: StrategyContext,
        risk: Option<Arc<RiskService>>,
    ) -> Self {
        Self {
            bus,
            risk,
            context,
            factories: Mutex::new(HashMap::new()),
            strategies: Arc::new(tokio::sync::Mutex::new(HashMap::new())),
            running: Arc::new(AtomicBool::new(false)),
            tasks: Mutex::new(Vec::new()),
            seen_intents: Mutex::new(SeenIntents::default()),
        }
    }

    /// Register a strategy constructor under a name.
    pub fn register_factory(&self, name: impl Into<String>, factory: StrategyFactory) {
        let name = name.into();
        info!(strategy_name = %name, "registered strategy factory");
        self.factories.lock().unwrap().insert(name, factory);
    }

    /// Instantiate, initialize and activate a strategy. Reloading a live id
    /// shuts the previous instance down first.
    pub async fn load_strategy(
        &self,
        strategy_id: &str,
        strategy_name: &str,
        config: &serde_json::Value,
    ) -> Result<()> {
        let factory = self
            .factories
            .lock()
            .unwrap()
            .get(strategy_name)
            .cloned()
            .ok_or_else(|| {
                TradingError::Validation(format!("Unknown strategy class: {strategy_name}"))
            })?;

        if self.strategies.lock().await.contains_key(strategy_id) {
            warn!(strategy_id, "strategy already loaded, replacing");
            self.unload_strategy(strategy_id).await?;
        }

        let mut strategy = factory(strategy_id, config, self.context.clone())?;
        strategy.initialize().await?;
        let capability = strategy.capability();
        info!(
            strategy_id,
            strategy_name,
            symbols = ?capability.symbols,
            instruments = ?capability.instrument_types,
            "strategy loaded"
        );
        self.strategies
            .lock()
            .await
            .insert(strategy_id.to_string(), LoadedStrategy { strategy, capability });
        Ok(())
    }

    pub async fn unload_strategy(&self, strategy_id: &str) -> Result<()> {
        let mut strategies = self.strategies.lock().await;
        match strategies.remove(strategy_id) {
            Some(mut loaded) => {
                loaded.strategy.shutdown().await?;
                info!(strategy_id, "strategy unloaded");
            }
            None => warn!(strategy_id, "strategy not loaded"),
        }
        Ok(())
    }

    pub async fn active_strategies(&self) -> Vec<StrategyCapability> {
        self.strategies
            .lock()
            .await
            .values()
            .map(|loaded| loaded.capability.clone())
            .collect()
    }

    pub async fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("strategy engine already running");
            return;
        }
        let engine = Arc::clone(self);
        let task = tokio::spawn(async move { engine.run_loop().await });
        self.tasks.lock().unwrap().push(task);
        info!(
            active = self.strategies.lock().await.len(),
            "strategy engine started"
        );
    }

    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().unwrap().drain(..).collect();
        for task in tasks {
            task.abort();
            let _ = task.await;
        }
        let ids: Vec<String> = self.strategies.lock().await.keys().cloned().collect();
        for strategy_id in ids {
            if let Err(err) = self.unload_strategy(&strategy_id).await {
                error!(%err, %strategy_id, "strategy shutdown failed");
            }
        }
        info!("strategy engine stopped");
    }

    async fn run_loop(self: Arc<Self>) {
        let mut sub = match self.bus.subscribe_multiple(&INPUT_STREAMS).await {
            Ok(sub) => sub,
            Err(err) => {
                error!(%err, "strategy engine could not subscribe");
                return;
            }
        };
        while self.running.load(Ordering::SeqCst) {
            match sub.next().await {
                Ok(Some(BusItem::Event(event))) => {
                    if let Err(err) = self.dispatch(event).await {
                        error!(%err, "event dispatch failed");
                    }
                }
                Ok(Some(BusItem::KeepAlive)) => continue,
                Ok(None) => break,
                Err(err) => error!(%err, "engine subscription error"),
            }
        }
        debug!("engine loop exiting");
    }

    async fn dispatch(&self, event: BusEvent) -> Result<()> {
        match event.stream.as_str() {
            streams::MARKET_TICK => {
                let tick: MarketTick = crate::bus::decode_event(event.payload)?;
                self.dispatch_tick(&tick).await;
            }
            streams::ORDER_FILL => {
                let fill: OrderFill = crate::bus::decode_event(event.payload)?;
                self.dispatch_fill(&fill).await;
            }
            streams::POSITION_UPDATE => {
                let update: PositionUpdate = crate::bus::decode_event(event.payload)?;
                self.dispatch_position_update(&update).await;
            }
            streams::STRATEGY_INTENT => {
                let intent: StrategyIntent = crate::bus::decode_event(event.payload)?;
                self.process_intent(intent).await?;
            }
            streams::MARKET_VOL_SURFACE => {
                let surface: VolatilitySurface = crate::bus::decode_event(event.payload)?;
                self.dispatch_vol_surface(&surface).await;
            }
            streams::STRATEGY_FORECAST_VOLATILITY => {
                let forecast: VolatilityForecast = crate::bus::decode_event(event.payload)?;
                self.dispatch_vol_forecast(&forecast).await;
            }
            streams::PORTFOLIO_RISK => {
                let risk: PortfolioRisk = crate::bus::decode_event(event.payload)?;
                self.dispatch_portfolio_risk(&risk).await;
            }
            streams::MARKET_MACRO_STATE => {
                let state: MacroState = crate::bus::decode_event(event.payload)?;
                self.dispatch_macro_state(&state).await;
            }
            other => debug!(stream = other, "ignoring event on unexpected stream"),
        }
        Ok(())
    }

    async fn dispatch_tick(&self, tick: &MarketTick) {
        let mut outputs = Vec::new();
        {
            let mut strategies = self.strategies.lock().await;
            for (strategy_id, loaded) in strategies.iter_mut() {
                if !loaded.capability.symbols.iter().any(|s| s == &tick.symbol) {
                    continue;
                }
                match loaded.strategy.on_tick(tick).await {
                    Ok(Some(output)) => outputs.push(output),
                    Ok(None) => {}
                    Err(err) => error!(%err, %strategy_id, "on_tick failed"),
                }
            }
        }
        self.handle_outputs(outputs).await;
    }

    async fn dispatch_fill(&self, fill: &OrderFill) {
        let mut strategies = self.strategies.lock().await;
        if let Some(loaded) = strategies.get_mut(&fill.strategy_id) {
            if let Err(err) = loaded.strategy.on_fill(fill).await {
                error!(%err, strategy_id = %fill.strategy_id, "on_fill failed");
            }
        }
    }

    async fn dispatch_position_update(&self, update: &PositionUpdate) {
        let mut strategies = self.strategies.lock().await;
        if let Some(loaded) = strategies.get_mut(&update.strategy_id) {
            if let Err(err) = loaded.strategy.on_position_update(update).await {
                error!(%err, strategy_id = %update.strategy_id, "on_position_update failed");
            }
        }
    }

    /// Broadcast dispatch below honors the capability map computed at load
    /// time: a strategy only sees the streams it declared interest in, and a
    /// failing handler never takes down its peers.
    async fn dispatch_vol_surface(&self, surface: &VolatilitySurface) {
        let mut outputs = Vec::new();
        {
            let mut strategies = self.strategies.lock().await;
            for (strategy_id, loaded) in strategies.iter_mut() {
                if !loaded.capability.interests.volatility_surface {
                    continue;
                }
                match loaded.strategy.on_volatility_surface(surface).await {
                    Ok(Some(output)) => outputs.push(output),
                    Ok(None) => {}
                    Err(err) => error!(%err, %strategy_id, "on_volatility_surface failed"),
                }
            }
        }
        self.handle_outputs(outputs).await;
    }

    async fn dispatch_vol_forecast(&self, forecast: &VolatilityForecast) {
        let mut outputs = Vec::new();
        {
            let mut strategies = self.strategies.lock().await;
            for (strategy_id, loaded) in strategies.iter_mut() {
                if !loaded.capability.interests.volatility_forecast {
                    continue;
                }
                match loaded.strategy.on_volatility_forecast(forecast).await {
                    Ok(Some(output)) => outputs.push(output),
                    Ok(None) => {}
                    Err(err) => error!(%err, %strategy_id, "on_volatility_forecast failed"),
                }
            }
        }
        self.handle_outputs(outputs).await;
    }

    async fn dispatch_portfolio_risk(&self, risk: &PortfolioRisk) {
        let mut outputs = Vec::new();
        {
            let mut strategies = self.strategies.lock().await;
            for (strategy_id, loaded) in strategies.iter_mut() {
                if !loaded.capability.interests.portfolio_risk {
                    continue;
                }
                match loaded.strategy.on_portfolio_risk(risk).await {
                    Ok(Some(output)) => outputs.push(output),
                    Ok(None) => {}
                    Err(err) => error!(%err, %strategy_id, "on_portfolio_risk failed"),
                }
            }
        }
        self.handle_outputs(outputs).await;
    }

    async fn dispatch_macro_state(&self, state: &MacroState) {
        let mut outputs = Vec::new();
        {
            let mut strategies = self.strategies.lock().await;
            for (strategy_id, loaded) in strategies.iter_mut() {
                if !loaded.capability.interests.macro_state {
                    continue;
                }
                match loaded.strategy.on_macro_state(state).await {
                    Ok(Some(output)) => outputs.push(output),
                    Ok(None) => {}
                    Err(err) => error!(%err, %strategy_id, "on_macro_state failed"),
                }
            }
        }
        self.handle_outputs(outputs).await;
    }

    async fn handle_outputs(&self, outputs: Vec<StrategyOutput>) {
        for output in outputs {
            let result = match output {
                StrategyOutput::Intent(intent) => {
                    info!(
                        strategy_id = %intent.strategy_id,
                        intent_type = %intent.intent_type,
                        "strategy produced intent"
                    );
                    publish_event(self.bus.as_ref(), streams::STRATEGY_INTENT, &intent).await
                }
                StrategyOutput::Signal(signal) => self.process_legacy_signal(&signal).await,
            };
            if let Err(err) = result {
                error!(%err, "failed to handle strategy output");
            }
        }
    }

    /// Intent pipeline: dedupe, drop directionless intents, risk gate, then
    /// route option structures to the execution service and everything else
    /// straight to the order stream.
    pub async fn process_intent(&self, intent: StrategyIntent) -> Result<()> {
        if !self.seen_intents.lock().unwrap().mark(&intent.intent_id) {
            debug!(intent_id = %intent.intent_id, "duplicate intent ignored");
            return Ok(());
        }
        let Some(direction) = intent.direction else {
            debug!(
                strategy_id = %intent.strategy_id,
                intent_type = %intent.intent_type,
                "ignoring directionless intent"
            );
            return Ok(());
        };

        let quantity = if intent.quantity > Decimal::ZERO {
            intent.quantity
        } else {
            default_order_quantity()
        };
        let reference_price = intent
            .metadata
            .get("reference_price")
            .and_then(|v| v.as_f64())
            .and_then(Decimal::from_f64);

        if let Some(risk) = &self.risk {
            let check = risk
                .check_pre_order(
                    &intent.strategy_id,
                    &intent.symbol,
                    direction,
                    quantity,
                    reference_price.unwrap_or(Decimal::ZERO),
                )
                .await?;
            if !check.approved {
                warn!(
                    strategy_id = %intent.strategy_id,
                    action = ?intent.action,
                    reason = %check.reason,
                    "intent vetoed by risk service"
                );
                return Ok(());
            }
        }

        if intent.action.is_option_structure() {
            let command = ExecutionCommand {
                intent_id: intent.intent_id.clone(),
                strategy_id: intent.strategy_id.clone(),
                symbol: intent.symbol.clone(),
                action: intent.action,
                direction: Some(direction),
                quantity,
                approved_by: if self.risk.is_some() {
                    "risk_service".to_string()
                } else {
                    "engine".to_string()
                },
                metadata: intent.metadata.clone(),
                timestamp: intent.timestamp,
            };
            publish_event(self.bus.as_ref(), streams::EXECUTION_COMMAND, &command).await?;
            info!(
                strategy_id = %intent.strategy_id,
                action = ?intent.action,
                "intent approved, execution command published"
            );
        } else {
            let mut metadata = intent.metadata.clone();
            metadata.insert(
                "intent_id".to_string(),
                serde_json::Value::String(intent.intent_id.clone()),
            );
            let command = OrderCommand {
                strategy_id: intent.strategy_id.clone(),
                symbol: intent.symbol.clone(),
                side: direction,
                order_type: OrderType::Market,
                quantity,
                price: reference_price,
                command: OrderAction::Create,
                order_id: None,
                metadata,
            };
            publish_event(self.bus.as_ref(), streams::ORDER_COMMAND, &command).await?;
            info!(
                strategy_id = %intent.strategy_id,
                action = ?intent.action,
                "intent approved, order command published"
            );
        }
        Ok(())
    }

    /// Legacy path: buy/sell signals become risk-gated limit orders at the
    /// signal's target price.
    pub async fn process_legacy_signal(&self, signal: &StrategySignal) -> Result<()> {
        if !matches!(signal.signal_type, SignalKind::Buy | SignalKind::Sell) {
            return Ok(());
        }
        let side = match signal.signal_type {
            SignalKind::Buy => crate::events::Side::Buy,
            _ => crate::events::Side::Sell,
        };
        let quantity = signal
            .metadata
            .get("quantity")
            .and_then(|v| v.as_f64())
            .and_then(Decimal::from_f64)
            .filter(|q| *q > Decimal::ZERO)
            .unwrap_or(default_order_quantity());
        let price = signal.target_price.unwrap_or(Decimal::ZERO);

        if let Some(risk) = &self.risk {
            let check = risk
                .check_pre_order(&signal.strategy_id, &signal.symbol, side, quantity, price)
                .await?;
            if !check.approved {
                warn!(
                    strategy_id = %signal.strategy_id,
                    reason = %check.reason,
                    "legacy signal vetoed by risk service"
                );
                return Ok(());
            }
        }

        let command = OrderCommand {
            strategy_id: signal.strategy_id.clone(),
            symbol: signal.symbol.clone(),
            side,
            order_type: OrderType::Limit,
            quantity,
            price: Some(price),
            command: OrderAction::Create,
            order_id: None,
            metadata: signal.metadata.clone(),
        };
        publish_event(self.bus.as_ref(), streams::ORDER_COMMAND, &command).await?;
        info!(
            strategy_id = %signal.strategy_id,
            side = side.as_str(),
            symbol = %signal.symbol,
            "legacy signal routed to order command"
        );
        Ok(())
    }
}
