//! In-process stream store with consumer groups.
//!
//! Streams are append-only entry logs with monotonically increasing ids.
//! Each group tracks its own cursor and pending set, so independent groups
//! replay the full stream while consumers inside one group share progress.
//! Entries are acknowledged after successful JSON decode; malformed entries
//! are acknowledged and dropped so they cannot wedge a consumer loop.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tracing::warn;

use crate::error::Result;

use super::{BusEvent, BusItem, MessageBus, Subscription};

const DEFAULT_BLOCK: Duration = Duration::from_secs(5);
const DEFAULT_MULTI_BLOCK: Duration = Duration::from_secs(2);

#[derive(Debug)]
struct Entry {
    id: u64,
    data: String,
}

#[derive(Debug, Default)]
struct GroupState {
    /// Next entry id this group has not yet delivered.
    cursor: u64,
    /// Delivered-but-unacknowledged entry ids, by claiming consumer.
    pending: BTreeMap<u64, String>,
}

#[derive(Debug, Default)]
struct StreamState {
    next_id: u64,
    entries: VecDeque<Entry>,
    groups: HashMap<String, GroupState>,
}

#[derive(Debug)]
struct BusShared {
    prefix: String,
    streams: Mutex<HashMap<String, StreamState>>,
    notify: Notify,
    closed: AtomicBool,
    block: Duration,
    multi_block: Duration,
}

/// In-memory message bus with stream + consumer-group semantics.
///
/// Cloning shares the underlying store; [`MemoryStreamBus::with_group`]
/// derives a handle reading as a different `(group, consumer)` pair.
#[derive(Debug, Clone)]
pub struct MemoryStreamBus {
    shared: Arc<BusShared>,
    group: String,
    consumer: String,
}

impl MemoryStreamBus {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self::with_blocks(prefix, DEFAULT_BLOCK, DEFAULT_MULTI_BLOCK)
    }

    /// Override block windows; short windows keep tests fast.
    pub fn with_blocks(
        prefix: impl Into<String>,
        block: Duration,
        multi_block: Duration,
    ) -> Self {
        Self {
            shared: Arc::new(BusShared {
                prefix: prefix.into(),
                streams: Mutex::new(HashMap::new()),
                notify: Notify::new(),
                closed: AtomicBool::new(false),
                block,
                multi_block,
            }),
            group: "trading_service".to_string(),
            consumer: "engine".to_string(),
        }
    }

    /// Handle over the same store for another consumer group.
    pub fn with_group(&self, group: impl Into<String>, consumer: impl Into<String>) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
            group: group.into(),
            consumer: consumer.into(),
        }
    }

    fn stream_key(&self, stream: &str) -> String {
        format!("{}:{}", self.shared.prefix, stream)
    }

    fn logical_name(&self, stream_key: &str) -> String {
        stream_key
            .strip_prefix(&format!("{}:", self.shared.prefix))
            .unwrap_or(stream_key)
            .to_string()
    }

    /// Append a raw payload without JSON validation. Exists so tests can
    /// exercise the poison-pill path.
    pub fn publish_raw(&self, stream: &str, data: impl Into<String>) {
        let key = self.stream_key(stream);
        {
            let mut streams = self.shared.streams.lock().unwrap();
            let state = streams.entry(key).or_default();
            let id = state.next_id;
            state.next_id += 1;
            state.entries.push_back(Entry { id, data: data.into() });
        }
        self.shared.notify.notify_waiters();
    }

    /// Idempotent group creation: a pre-existing group is left untouched.
    fn ensure_group(&self, stream_key: &str) {
        let mut streams = self.shared.streams.lock().unwrap();
        let state = streams.entry(stream_key.to_string()).or_default();
        state.groups.entry(self.group.clone()).or_default();
    }

    fn make_subscription(&self, streams: Vec<String>, multi: bool) -> MemorySubscription {
        for key in &streams {
            self.ensure_group(key);
        }
        MemorySubscription {
            shared: Arc::clone(&self.shared),
            group: self.group.clone(),
            consumer: self.consumer.clone(),
            streams,
            cursor: 0,
            multi,
        }
    }
}

#[async_trait]
impl MessageBus for MemoryStreamBus {
    async fn publish(&self, stream: &str, payload: &serde_json::Value) -> Result<()> {
        self.publish_raw(stream, payload.to_string());
        Ok(())
    }

    async fn subscribe(&self, stream: &str) -> Result<Box<dyn Subscription>> {
        let keys = vec![self.stream_key(stream)];
        Ok(Box::new(self.make_subscription(keys, false)))
    }

    async fn subscribe_multiple(&self, streams: &[&str]) -> Result<Box<dyn Subscription>> {
        let keys = streams.iter().map(|s| self.stream_key(s)).collect();
        Ok(Box::new(self.make_subscription(keys, true)))
    }

    async fn close(&self) -> Result<()> {
        self.shared.closed.store(true, Ordering::SeqCst);
        self.shared.notify.notify_waiters();
        Ok(())
    }
}

pub struct MemorySubscription {
    shared: Arc<BusShared>,
    group: String,
    consumer: String,
    streams: Vec<String>,
    /// Round-robin offset into `streams`.
    cursor: usize,
    multi: bool,
}

impl MemorySubscription {
    /// Claim the next undelivered (or previously pending) entry across the
    /// subscribed streams, acknowledging it once its JSON decodes.
    fn poll_once(&mut self) -> Option<BusEvent> {
        let mut streams = self.shared.streams.lock().unwrap();
        let n = self.streams.len();

        for offset in 0..n {
            let idx = (self.cursor + offset) % n;
            let key = &self.streams[idx];
            let Some(state) = streams.get_mut(key) else {
                continue;
            };
            let Some(group) = state.groups.get_mut(&self.group) else {
                continue;
            };

            // Pending entries from a crashed consumer come first.
            let claimed = if let Some((&id, _)) = group.pending.iter().next() {
                Some(id)
            } else if group.cursor < state.next_id {
                let id = state
                    .entries
                    .iter()
                    .map(|e| e.id)
                    .find(|&id| id >= group.cursor);
                if let Some(id) = id {
                    group.pending.insert(id, self.consumer.clone());
                    group.cursor = id + 1;
                    Some(id)
                } else {
                    group.cursor = state.next_id;
                    None
                }
            } else {
                None
            };

            let Some(id) = claimed else {
                continue;
            };
            let data = state
                .entries
                .iter()
                .find(|e| e.id == id)
                .map(|e| e.data.clone());
            let group = state.groups.get_mut(&self.group).unwrap();
            // Acknowledge after decode either way: poison entries are dropped.
            group.pending.remove(&id);

            self.cursor = (idx + 1) % n;

            let Some(data) = data else {
                continue;
            };
            match serde_json::from_str::<serde_json::Value>(&data) {
                Ok(payload) => {
                    let stream = key
                        .strip_prefix(&format!("{}:", self.shared.prefix))
                        .unwrap_or(key)
                        .to_string();
                    return Some(BusEvent { stream, payload });
                }
                Err(err) => {
                    warn!(stream = %key, %err, "dropping malformed bus entry");
                    continue;
                }
            }
        }
        None
    }
}

#[async_trait]
impl Subscription for MemorySubscription {
    async fn next(&mut self) -> Result<Option<BusItem>> {
        loop {
            if self.shared.closed.load(Ordering::SeqCst) {
                return Ok(None);
            }
            if let Some(event) = self.poll_once() {
                return Ok(Some(BusItem::Event(event)));
            }

            let block = if self.multi {
                self.shared.multi_block
            } else {
                self.shared.block
            };
            let timed_out =
                tokio::time::timeout(block, self.shared.notify.notified()).await.is_err();
            if timed_out && self.multi {
                return Ok(Some(BusItem::KeepAlive));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::publish_event;
    use serde_json::json;

    fn test_bus() -> MemoryStreamBus {
        MemoryStreamBus::with_blocks(
            "test",
            Duration::from_millis(50),
            Duration::from_millis(50),
        )
    }

    async fn next_event(sub: &mut Box<dyn Subscription>) -> Option<BusEvent> {
        match sub.next().await.unwrap() {
            Some(BusItem::Event(event)) => Some(event),
            Some(BusItem::KeepAlive) | None => None,
        }
    }

    #[tokio::test]
    async fn delivers_in_publish_order() {
        let bus = test_bus();
        let mut sub = bus.subscribe_multiple(&["market.tick"]).await.unwrap();
        for i in 0..3 {
            bus.publish("market.tick", &json!({ "seq": i })).await.unwrap();
        }
        for i in 0..3 {
            let event = next_event(&mut sub).await.unwrap();
            assert_eq!(event.payload["seq"], i);
            assert_eq!(event.stream, "market.tick");
        }
    }

    #[tokio::test]
    async fn acked_message_not_redelivered_within_group() {
        let bus = test_bus();
        let mut first = bus.subscribe_multiple(&["order.fill"]).await.unwrap();
        bus.publish("order.fill", &json!({ "id": "f1" })).await.unwrap();
        assert!(next_event(&mut first).await.is_some());

        // A fresh consumer in the same group starts after the ack.
        let mut rejoin = bus
            .with_group("trading_service", "engine-2")
            .subscribe_multiple(&["order.fill"])
            .await
            .unwrap();
        assert!(next_event(&mut rejoin).await.is_none());
    }

    #[tokio::test]
    async fn independent_groups_each_receive() {
        let bus = test_bus();
        let mut engine = bus
            .with_group("engineA", "c1")
            .subscribe_multiple(&["order.command"])
            .await
            .unwrap();
        let mut audit = bus
            .with_group("audit", "c1")
            .subscribe_multiple(&["order.command"])
            .await
            .unwrap();

        bus.publish("order.command", &json!({ "id": 7 })).await.unwrap();

        assert_eq!(next_event(&mut engine).await.unwrap().payload["id"], 7);
        assert_eq!(next_event(&mut audit).await.unwrap().payload["id"], 7);
        // Consumed once per group.
        assert!(next_event(&mut engine).await.is_none());
        assert!(next_event(&mut audit).await.is_none());
    }

    #[tokio::test]
    async fn malformed_entry_is_dropped_not_wedged() {
        let bus = test_bus();
        let mut sub = bus.subscribe_multiple(&["market.tick"]).await.unwrap();
        bus.publish_raw("market.tick", "{not json");
        bus.publish("market.tick", &json!({ "ok": true })).await.unwrap();

        let event = next_event(&mut sub).await.unwrap();
        assert_eq!(event.payload["ok"], true);
    }

    #[tokio::test]
    async fn keepalive_on_idle_multi_subscription() {
        let bus = test_bus();
        let mut sub = bus
            .subscribe_multiple(&["market.tick", "order.fill"])
            .await
            .unwrap();
        match sub.next().await.unwrap() {
            Some(BusItem::KeepAlive) => {}
            other => panic!("expected keep-alive, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn close_ends_subscriptions_and_is_idempotent() {
        let bus = test_bus();
        let mut sub = bus.subscribe("market.tick").await.unwrap();
        bus.close().await.unwrap();
        bus.close().await.unwrap();
        assert!(sub.next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn typed_publish_helper_round_trips() {
        use crate::events::{MarketTick, Metadata};
        use chrono::Utc;
        use rust_decimal_macros::dec;

        let bus = test_bus();
        let mut sub = bus.subscribe_multiple(&["market.tick"]).await.unwrap();
        let tick = MarketTick {
            symbol: "BTC/USDT".to_string(),
            price: dec!(40000),
            volume: dec!(1),
            bid: None,
            ask: None,
            timestamp: Utc::now(),
            metadata: Metadata::new(),
        };
        publish_event(&bus, "market.tick", &tick).await.unwrap();
        let event = next_event(&mut sub).await.unwrap();
        let decoded: MarketTick = crate::bus::decode_event(event.payload).unwrap();
        assert_eq!(decoded.symbol, "BTC/USDT");
        assert_eq!(decoded.price, dec!(40000));
    }
}
