//! Option execution service: the strategy-language to exchange-language
//! translation layer.
//!
//! Consumes risk-approved `execution.command` events, keeps the latest
//! volatility surface per underlying, and emits one concrete `order.command`
//! per option leg. "Buy a straddle" comes in; "buy BTC-20241229-40000-C and
//! BTC-20241229-40000-P" goes out.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::bus::{publish_event, streams, BusItem, MessageBus};
use crate::error::Result;
use crate::events::{
    ExecutionCommand, IntentAction, Metadata, OptionChainEntry, OrderAction, OrderCommand,
    OrderType, Side, VolatilitySurface,
};
use crate::options::format_option_symbol;

pub struct OptionExecutionService {
    bus: Arc<dyn MessageBus>,
    surfaces: Arc<Mutex<HashMap<String, VolatilitySurface>>>,
    running: Arc<AtomicBool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl OptionExecutionService {
    pub fn new(bus: Arc<dyn MessageBus>) -> Self {
        Self {
            bus,
            surfaces: Arc::new(Mutex::new(HashMap::new())),
            running: Arc::new(AtomicBool::new(false)),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub async fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("option execution service already running");
            return;
        }
        info!("option execution service starting");
        let service = Arc::clone(self);
        let task = tokio::spawn(async move { service.run_loop().await });
        self.tasks.lock().unwrap().push(task);
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
        info!("option execution service stopped");
    }

    async fn run_loop(self: Arc<Self>) {
        let inputs = [streams::EXECUTION_COMMAND, streams::MARKET_VOL_SURFACE];
        let mut sub = match self.bus.subscribe_multiple(&inputs).await {
            Ok(sub) => sub,
            Err(err) => {
                error!(%err, "option execution service could not subscribe");
                return;
            }
        };
        while self.running.load(Ordering::SeqCst) {
            match sub.next().await {
                Ok(Some(BusItem::Event(event))) => match event.stream.as_str() {
                    streams::EXECUTION_COMMAND => {
                        match crate::bus::decode_event::<ExecutionCommand>(event.payload) {
                            Ok(command) => {
                                if let Err(err) = self.handle_command(&command).await {
                                    error!(%err, intent_id = %command.intent_id, "execution command failed");
                                }
                            }
                            Err(err) => warn!(%err, "dropping malformed execution command"),
                        }
                    }
                    streams::MARKET_VOL_SURFACE => {
                        match crate::bus::decode_event::<VolatilitySurface>(event.payload) {
                            Ok(surface) => self.cache_surface(surface),
                            Err(err) => warn!(%err, "dropping malformed surface"),
                        }
                    }
                    other => debug!(stream = other, "ignoring unexpected stream"),
                },
                Ok(Some(BusItem::KeepAlive)) => continue,
                Ok(None) => break,
                Err(err) => error!(%err, "execution subscription error"),
            }
        }
        debug!("option execution loop exiting");
    }

    pub fn cache_surface(&self, surface: VolatilitySurface) {
        debug!(underlying = %surface.underlying, "volatility surface cached");
        self.surfaces
            .lock()
            .unwrap()
            .insert(surface.underlying.clone(), surface);
    }

    pub async fn handle_command(&self, command: &ExecutionCommand) -> Result<()> {
        info!(
            strategy_id = %command.strategy_id,
            action = ?command.action,
            symbol = %command.symbol,
            "handling execution command"
        );
        match command.action {
            IntentAction::BuyStraddle => self.execute_straddle(command, Side::Buy).await,
            IntentAction::SellStraddle => self.execute_straddle(command, Side::Sell).await,
            IntentAction::BuyStrangle | IntentAction::SellStrangle => {
                self.execute_strangle(command).await
            }
            other => {
                debug!(action = ?other, "unrecognized execution action");
                Ok(())
            }
        }
    }

    /// Straddle: ATM call + ATM put, same strike and nearest expiry.
    async fn execute_straddle(&self, command: &ExecutionCommand, side: Side) -> Result<()> {
        let legs = {
            let surfaces = self.surfaces.lock().unwrap();
            let Some(surface) = surfaces.get(&command.symbol) else {
                warn!(
                    underlying = %command.symbol,
                    "no volatility surface cached, dropping straddle"
                );
                return Ok(());
            };
            Self::find_atm_legs(surface)
        };
        if legs.is_empty() {
            warn!(underlying = %command.symbol, "no ATM contracts on surface");
            return Ok(());
        }

        let quantity = if command.quantity > Decimal::ZERO {
            command.quantity
        } else {
            command
                .metadata
                .get("quantity")
                .and_then(|v| v.as_f64())
                .and_then(Decimal::from_f64)
                .unwrap_or(Decimal::new(1, 1))
        };

        for leg in legs {
            let symbol =
                format_option_symbol(&leg.underlying, leg.expiry, leg.strike, leg.option_type);
            let mut metadata = Metadata::new();
            metadata.insert(
                "intent_id".to_string(),
                serde_json::json!(command.intent_id),
            );
            metadata.insert("option_type".to_string(), serde_json::json!(leg.option_type));
            metadata.insert("strike".to_string(), serde_json::json!(leg.strike));
            metadata.insert("expiry".to_string(), serde_json::json!(leg.expiry));
            metadata.insert("strategy".to_string(), serde_json::json!("straddle"));

            let order = OrderCommand {
                strategy_id: command.strategy_id.clone(),
                symbol: symbol.clone(),
                side,
                order_type: OrderType::Limit,
                quantity,
                price: Some(leg.last),
                command: OrderAction::Create,
                order_id: None,
                metadata,
            };
            publish_event(self.bus.as_ref(), streams::ORDER_COMMAND, &order).await?;
            info!(
                side = side.as_str(),
                option_type = ?leg.option_type,
                strike = %leg.strike,
                expiry = %leg.expiry,
                %symbol,
                "option leg order published"
            );
        }
        Ok(())
    }

    /// Strangle: OTM call + OTM put around spot. The translation is not
    /// wired up yet; commands are logged and dropped.
    async fn execute_strangle(&self, command: &ExecutionCommand) -> Result<()> {
        info!(
            strategy_id = %command.strategy_id,
            action = ?command.action,
            "strangle translation not implemented yet"
        );
        Ok(())
    }

    /// ATM legs: nearest expiry, median of the sorted unique strikes.
    fn find_atm_legs(surface: &VolatilitySurface) -> Vec<OptionChainEntry> {
        let Some(nearest_expiry) = surface.entries.iter().map(|e| e.expiry).min() else {
            return Vec::new();
        };
        let nearest: Vec<&OptionChainEntry> = surface
            .entries
            .iter()
            .filter(|e| e.expiry == nearest_expiry)
            .collect();

        let strikes: BTreeSet<Decimal> = nearest.iter().map(|e| e.strike).collect();
        let strikes: Vec<Decimal> = strikes.into_iter().collect();
        if strikes.is_empty() {
            return Vec::new();
        }
        let atm_strike = strikes[strikes.len() / 2];

        nearest
            .into_iter()
            .filter(|e| e.strike == atm_strike)
            .cloned()
            .collect()
    }
}
