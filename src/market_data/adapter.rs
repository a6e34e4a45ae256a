//! Tick polling adapter: one task per subscribed symbol, each publishing
//! `market.tick` events.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use rust_decimal::Decimal;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::bus::{publish_event, streams, MessageBus};
use crate::events::{MarketTick, Metadata};
use crate::market_data::exchange::ExchangeClient;

pub struct MarketDataAdapter {
    exchange: Arc<dyn ExchangeClient>,
    bus: Arc<dyn MessageBus>,
    symbols: Arc<Mutex<Vec<String>>>,
    poll_interval: Duration,
    running: Arc<AtomicBool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl MarketDataAdapter {
    pub fn new(
        exchange: Arc<dyn ExchangeClient>,
        bus: Arc<dyn MessageBus>,
        symbols: Vec<String>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            exchange,
            bus,
            symbols: Arc::new(Mutex::new(symbols)),
            poll_interval,
            running: Arc::new(AtomicBool::new(false)),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub async fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("market data adapter already running");
            return;
        }
        let symbols = self.symbols.lock().unwrap().clone();
        info!(?symbols, "market data adapter starting");
        for symbol in symbols {
            self.spawn_poller(symbol);
        }
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
        info!("market data adapter stopped");
    }

    /// Add a symbol at runtime; a poll task is spawned only while running.
    pub fn add_symbol(&self, symbol: &str) {
        let mut symbols = self.symbols.lock().unwrap();
        if symbols.iter().any(|s| s == symbol) {
            return;
        }
        symbols.push(symbol.to_string());
        drop(symbols);
        if self.running.load(Ordering::SeqCst) {
            self.spawn_poller(symbol.to_string());
            info!(%symbol, "now polling symbol");
        }
    }

    /// Remove a symbol; its task exits on the next cycle.
    pub fn remove_symbol(&self, symbol: &str) {
        self.symbols.lock().unwrap().retain(|s| s != symbol);
        info!(%symbol, "stopped polling symbol");
    }

    fn spawn_poller(&self, symbol: String) {
        let exchange = Arc::clone(&self.exchange);
        let bus = Arc::clone(&self.bus);
        let running = Arc::clone(&self.running);
        let symbols = Arc::clone(&self.symbols);
        let interval = self.poll_interval;

        let task = tokio::spawn(async move {
            debug!(%symbol, "poll task started");
            while running.load(Ordering::SeqCst) {
                if !symbols.lock().unwrap().iter().any(|s| s == &symbol) {
                    debug!(%symbol, "symbol removed, poll task exiting");
                    break;
                }
                match exchange.fetch_ticker(&symbol).await {
                    Ok(ticker) => {
                        let mut metadata = Metadata::new();
                        for (key, value) in [
                            ("high", ticker.high),
                            ("low", ticker.low),
                            ("open", ticker.open),
                            ("close", ticker.close),
                            ("change", ticker.change),
                            ("percentage", ticker.percentage),
                        ] {
                            if let Some(value) = value {
                                if let Ok(value) = serde_json::to_value(value) {
                                    metadata.insert(key.to_string(), value);
                                }
                            }
                        }
                        let tick = MarketTick {
                            symbol: symbol.clone(),
                            price: ticker.last,
                            volume: ticker.base_volume.unwrap_or(Decimal::ZERO),
                            bid: ticker.bid,
                            ask: ticker.ask,
                            timestamp: Utc::now(),
                            metadata,
                        };
                        if let Err(err) = tick.validate() {
                            warn!(%symbol, %err, "discarding invalid ticker");
                        } else if let Err(err) =
                            publish_event(bus.as_ref(), streams::MARKET_TICK, &tick).await
                        {
                            warn!(%symbol, %err, "failed to publish tick");
                        }
                        tokio::time::sleep(interval).await;
                    }
                    Err(err) => {
                        warn!(%symbol, %err, "ticker fetch failed, backing off");
                        tokio::time::sleep(interval * 2).await;
                    }
                }
            }
        });
        self.tasks.lock().unwrap().push(task);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{BusItem, MemoryStreamBus, Subscription};
    use crate::market_data::exchange::SimExchange;
    use rust_decimal_macros::dec;

    async fn recv_tick(sub: &mut Box<dyn Subscription>) -> Option<MarketTick> {
        for _ in 0..20 {
            match sub.next().await.unwrap() {
                Some(BusItem::Event(event)) => {
                    return crate::bus::decode_event(event.payload).ok()
                }
                Some(BusItem::KeepAlive) => continue,
                None => return None,
            }
        }
        None
    }

    #[tokio::test]
    async fn polls_and_publishes_ticks() {
        let bus = MemoryStreamBus::with_blocks(
            "test",
            Duration::from_millis(50),
            Duration::from_millis(50),
        );
        let exchange = Arc::new(SimExchange::new());
        exchange.set_price("BTC/USDT", dec!(40000));

        let adapter = MarketDataAdapter::new(
            exchange,
            Arc::new(bus.clone()),
            vec!["BTC/USDT".to_string()],
            Duration::from_millis(10),
        );
        let mut sub = bus.subscribe_multiple(&[streams::MARKET_TICK]).await.unwrap();
        adapter.start().await;

        let tick = recv_tick(&mut sub).await.expect("tick published");
        assert_eq!(tick.symbol, "BTC/USDT");
        assert_eq!(tick.price, dec!(40000));

        adapter.stop().await;
        // Stop twice: idempotent.
        adapter.stop().await;
    }

    #[tokio::test]
    async fn add_symbol_spawns_poller_when_running() {
        let bus = MemoryStreamBus::with_blocks(
            "test",
            Duration::from_millis(50),
            Duration::from_millis(50),
        );
        let exchange = Arc::new(SimExchange::new());
        exchange.set_price("ETH/USDT", dec!(2500));

        let adapter = MarketDataAdapter::new(
            exchange,
            Arc::new(bus.clone()),
            Vec::new(),
            Duration::from_millis(10),
        );
        adapter.start().await;
        let mut sub = bus.subscribe_multiple(&[streams::MARKET_TICK]).await.unwrap();
        adapter.add_symbol("ETH/USDT");

        let tick = recv_tick(&mut sub).await.expect("tick for added symbol");
        assert_eq!(tick.symbol, "ETH/USDT");
        adapter.stop().await;
    }
}
