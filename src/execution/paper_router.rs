//! Paper order router: the in-process stand-in for the exchange-facing
//! router. Fills `create` commands at their limit price, keeps a small
//! per-strategy book, and publishes `order.fill` and `position.update`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use rust_decimal::Decimal;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::bus::{publish_event, streams, BusItem, MessageBus};
use crate::error::Result;
use crate::events::{OrderAction, OrderCommand, OrderFill, PositionUpdate, Side};

const FEE_RATE: (i64, u32) = (5, 4); // 0.05%

#[derive(Debug, Clone, Copy, Default)]
struct BookEntry {
    quantity: Decimal,
    avg_price: Decimal,
}

pub struct PaperOrderRouter {
    bus: Arc<dyn MessageBus>,
    book: Arc<Mutex<HashMap<(String, String), BookEntry>>>,
    next_order_id: AtomicU64,
    running: Arc<AtomicBool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl PaperOrderRouter {
    pub fn new(bus: Arc<dyn MessageBus>) -> Self {
        Self {
            bus,
            book: Arc::new(Mutex::new(HashMap::new())),
            next_order_id: AtomicU64::new(1),
            running: Arc::new(AtomicBool::new(false)),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub async fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("paper order router already running");
            return;
        }
        info!("paper order router starting");
        let router = Arc::clone(self);
        let task = tokio::spawn(async move { router.run_loop().await });
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
        info!("paper order router stopped");
    }

    async fn run_loop(self: Arc<Self>) {
        let mut sub = match self.bus.subscribe(streams::ORDER_COMMAND).await {
            Ok(sub) => sub,
            Err(err) => {
                error!(%err, "paper router could not subscribe");
                return;
            }
        };
        while self.running.load(Ordering::SeqCst) {
            match sub.next().await {
                Ok(Some(BusItem::Event(event))) => {
                    match crate::bus::decode_event::<OrderCommand>(event.payload) {
                        Ok(command) => {
                            if let Err(err) = self.handle_command(&command).await {
                                error!(%err, symbol = %command.symbol, "order handling failed");
                            }
                        }
                        Err(err) => warn!(%err, "dropping malformed order command"),
                    }
                }
                Ok(Some(BusItem::KeepAlive)) => continue,
                Ok(None) => break,
                Err(err) => error!(%err, "order subscription error"),
            }
        }
        debug!("paper router loop exiting");
    }

    pub async fn handle_command(&self, command: &OrderCommand) -> Result<()> {
        if command.command != OrderAction::Create {
            debug!(command = ?command.command, "paper router only simulates creates");
            return Ok(());
        }
        let Some(price) = command.price.filter(|p| *p > Decimal::ZERO) else {
            warn!(
                symbol = %command.symbol,
                "order without a reference price cannot be paper-filled"
            );
            return Ok(());
        };
        if command.quantity <= Decimal::ZERO {
            warn!(symbol = %command.symbol, "ignoring non-positive order quantity");
            return Ok(());
        }

        let order_id = format!(
            "paper-{}",
            self.next_order_id.fetch_add(1, Ordering::SeqCst)
        );
        let fee_rate = Decimal::new(FEE_RATE.0, FEE_RATE.1);
        let fill = OrderFill {
            strategy_id: command.strategy_id.clone(),
            order_id,
            symbol: command.symbol.clone(),
            side: command.side,
            quantity: command.quantity,
            price,
            fee: (price * command.quantity * fee_rate).round_dp(8),
            timestamp: Utc::now(),
            metadata: command.metadata.clone(),
        };
        publish_event(self.bus.as_ref(), streams::ORDER_FILL, &fill).await?;
        info!(
            symbol = %fill.symbol,
            side = fill.side.as_str(),
            quantity = %fill.quantity,
            price = %fill.price,
            "paper fill"
        );

        let entry = {
            let mut book = self.book.lock().unwrap();
            let entry = book
                .entry((command.strategy_id.clone(), command.symbol.clone()))
                .or_default();
            match command.side {
                Side::Buy => {
                    let new_qty = entry.quantity + command.quantity;
                    if new_qty > Decimal::ZERO {
                        entry.avg_price = (entry.quantity * entry.avg_price
                            + command.quantity * price)
                            / new_qty;
                    } else {
                        entry.avg_price = price;
                    }
                    entry.quantity = new_qty;
                }
                Side::Sell => {
                    entry.quantity -= command.quantity;
                }
            }
            *entry
        };

        let update = PositionUpdate {
            strategy_id: command.strategy_id.clone(),
            symbol: command.symbol.clone(),
            quantity: entry.quantity,
            avg_price: entry.avg_price,
            unrealized_pnl: Decimal::ZERO,
            timestamp: Utc::now(),
        };
        publish_event(self.bus.as_ref(), streams::POSITION_UPDATE, &update).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{MemoryStreamBus, Subscription};
    use crate::events::{Metadata, OrderType};
    use rust_decimal_macros::dec;
    use std::time::Duration;

    fn order(side: Side, quantity: Decimal, price: Option<Decimal>) -> OrderCommand {
        OrderCommand {
            strategy_id: "s1".to_string(),
            symbol: "BTC/USDT".to_string(),
            side,
            order_type: OrderType::Limit,
            quantity,
            price,
            command: OrderAction::Create,
            order_id: None,
            metadata: Metadata::new(),
        }
    }

    fn test_bus() -> MemoryStreamBus {
        MemoryStreamBus::with_blocks(
            "test",
            Duration::from_millis(50),
            Duration::from_millis(50),
        )
    }

    async fn next_of<T: serde::de::DeserializeOwned>(
        sub: &mut Box<dyn Subscription>,
    ) -> Option<T> {
        match sub.next().await.unwrap() {
            Some(BusItem::Event(event)) => crate::bus::decode_event(event.payload).ok(),
            _ => None,
        }
    }

    #[tokio::test]
    async fn create_order_fills_and_updates_position() {
        let bus = test_bus();
        let router = PaperOrderRouter::new(Arc::new(bus.clone()));
        let mut fills = bus
            .with_group("risk_service", "t")
            .subscribe_multiple(&[streams::ORDER_FILL])
            .await
            .unwrap();
        let mut updates = bus
            .with_group("engine", "t")
            .subscribe_multiple(&[streams::POSITION_UPDATE])
            .await
            .unwrap();

        router
            .handle_command(&order(Side::Buy, dec!(2), Some(dec!(100))))
            .await
            .unwrap();

        let fill: OrderFill = next_of(&mut fills).await.unwrap();
        assert_eq!(fill.quantity, dec!(2));
        assert_eq!(fill.price, dec!(100));
        assert_eq!(fill.fee, dec!(0.1));

        let update: PositionUpdate = next_of(&mut updates).await.unwrap();
        assert_eq!(update.quantity, dec!(2));
        assert_eq!(update.avg_price, dec!(100));
    }

    #[tokio::test]
    async fn buys_average_and_sells_keep_price() {
        let bus = test_bus();
        let router = PaperOrderRouter::new(Arc::new(bus.clone()));
        let mut updates = bus
            .with_group("engine", "t")
            .subscribe_multiple(&[streams::POSITION_UPDATE])
            .await
            .unwrap();

        router.handle_command(&order(Side::Buy, dec!(1), Some(dec!(100)))).await.unwrap();
        router.handle_command(&order(Side::Buy, dec!(1), Some(dec!(200)))).await.unwrap();
        router.handle_command(&order(Side::Sell, dec!(1), Some(dec!(300)))).await.unwrap();

        let _first: PositionUpdate = next_of(&mut updates).await.unwrap();
        let second: PositionUpdate = next_of(&mut updates).await.unwrap();
        assert_eq!(second.avg_price, dec!(150));
        let third: PositionUpdate = next_of(&mut updates).await.unwrap();
        assert_eq!(third.quantity, dec!(1));
        assert_eq!(third.avg_price, dec!(150));
    }

    #[tokio::test]
    async fn priceless_order_is_dropped() {
        let bus = test_bus();
        let router = PaperOrderRouter::new(Arc::new(bus.clone()));
        let mut fills = bus
            .with_group("risk_service", "t")
            .subscribe_multiple(&[streams::ORDER_FILL])
            .await
            .unwrap();
        router.handle_command(&order(Side::Buy, dec!(1), None)).await.unwrap();
        assert!(next_of::<OrderFill>(&mut fills).await.is_none());
    }
}
