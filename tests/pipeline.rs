//! End-to-end pipeline tests: every component wired through the in-memory
//! bus exactly as in the binary, driven by published events.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{NaiveDate, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use voltrader::bus::{
    publish_event, streams, BusItem, MemoryStreamBus, MessageBus, Subscription,
};
use voltrader::config::RiskConfig;
use voltrader::events::{
    ExecutionCommand, IntentAction, MacroState, Metadata, OptionChainEntry, OptionKind,
    OrderCommand, OrderType, PortfolioRisk, Regime, Side, StrategyIntent, VolatilityForecast,
    VolatilitySurface,
};
use voltrader::execution::{OptionExecutionService, PaperOrderRouter};
use voltrader::risk::RiskService;
use voltrader::state::{MemoryKv, PortfolioStore, StrategyStateStore};
use voltrader::strategy::{PqVolTraderStrategy, StrategyContext, StrategyEngine};

fn test_bus() -> MemoryStreamBus {
    MemoryStreamBus::with_blocks(
        "vt-test",
        Duration::from_millis(50),
        Duration::from_millis(50),
    )
}

struct Stack {
    engine: Arc<StrategyEngine>,
    risk: Arc<RiskService>,
    portfolio: Arc<PortfolioStore>,
}

fn build_stack(bus: &MemoryStreamBus) -> Stack {
    let kv = Arc::new(MemoryKv::new());
    let portfolio = Arc::new(PortfolioStore::new(kv.clone(), "vt-test"));
    let state = Arc::new(StrategyStateStore::new(kv, "vt-test"));
    let risk = Arc::new(RiskService::new(
        Arc::new(bus.with_group("risk_service", "risk-1")),
        Arc::clone(&portfolio),
        None,
        None,
        RiskConfig::default(),
    ));
    let engine_bus: Arc<dyn MessageBus> = Arc::new(bus.with_group("strategy_engine", "e-1"));
    let context = StrategyContext::new(Arc::clone(&engine_bus), state, None);
    let engine = Arc::new(StrategyEngine::new(engine_bus, context, Some(Arc::clone(&risk))));
    Stack { engine, risk, portfolio }
}

fn straddle_surface() -> VolatilitySurface {
    let expiry = NaiveDate::from_ymd_opt(2024, 12, 29).unwrap();
    let mut entries = Vec::new();
    for strike in [36_000, 38_000, 40_000, 42_000, 44_000] {
        for option_type in [OptionKind::Call, OptionKind::Put] {
            entries.push(OptionChainEntry {
                underlying: "BTC/USDT".to_string(),
                strike: Decimal::from(strike),
                expiry,
                option_type,
                bid: dec!(990),
                ask: dec!(1010),
                last: dec!(1000),
                volume: dec!(100),
                open_interest: dec!(500),
                implied_volatility: 0.6,
                greeks: None,
                timestamp: Utc::now(),
            });
        }
    }
    VolatilitySurface {
        underlying: "BTC/USDT".to_string(),
        entries,
        atm_iv: 0.6,
        iv_skew: HashMap::new(),
        term_structure: HashMap::new(),
        timestamp: Utc::now(),
    }
}

fn straddle_intent(intent_id: &str) -> StrategyIntent {
    StrategyIntent {
        intent_id: intent_id.to_string(),
        strategy_id: "pq-1".to_string(),
        symbol: "BTC/USDT".to_string(),
        intent_type: "increase_long_gamma".to_string(),
        action: IntentAction::BuyStraddle,
        direction: Some(Side::Buy),
        quantity: dec!(0.1),
        confidence: 1.0,
        reason: None,
        metadata: Metadata::new(),
        timestamp: Utc::now(),
    }
}

/// Read events off a subscription until `count` decoded items or timeout.
async fn collect<T: serde::de::DeserializeOwned>(
    sub: &mut Box<dyn Subscription>,
    count: usize,
    deadline: Duration,
) -> Vec<T> {
    let mut items = Vec::new();
    let _ = tokio::time::timeout(deadline, async {
        while items.len() < count {
            match sub.next().await {
                Ok(Some(BusItem::Event(event))) => {
                    if let Ok(item) = serde_json::from_value(event.payload) {
                        items.push(item);
                    }
                }
                Ok(Some(BusItem::KeepAlive)) => continue,
                _ => break,
            }
        }
    })
    .await;
    items
}

#[tokio::test]
async fn straddle_path_produces_both_legs() {
    let bus = test_bus();
    let stack = build_stack(&bus);
    let execution = Arc::new(OptionExecutionService::new(Arc::new(
        bus.with_group("option_execution", "x-1"),
    )));

    stack.engine.start().await;
    execution.start().await;

    let mut orders = bus
        .with_group("order_router", "t")
        .subscribe_multiple(&[streams::ORDER_COMMAND])
        .await
        .unwrap();

    publish_event(&bus, streams::MARKET_VOL_SURFACE, &straddle_surface())
        .await
        .unwrap();
    // Let the execution service cache the surface before the intent lands.
    tokio::time::sleep(Duration::from_millis(200)).await;
    publish_event(&bus, streams::STRATEGY_INTENT, &straddle_intent("i1"))
        .await
        .unwrap();

    let orders: Vec<OrderCommand> = collect(&mut orders, 2, Duration::from_secs(5)).await;
    assert_eq!(orders.len(), 2, "expected both straddle legs");

    let symbols: Vec<&str> = orders.iter().map(|o| o.symbol.as_str()).collect();
    assert!(symbols.contains(&"BTC-20241229-40000-C"));
    assert!(symbols.contains(&"BTC-20241229-40000-P"));
    for order in &orders {
        assert_eq!(order.side, Side::Buy);
        assert_eq!(order.order_type, OrderType::Limit);
        assert_eq!(order.quantity, dec!(0.1));
        assert_eq!(order.price, Some(dec!(1000)));
        assert_eq!(order.metadata["intent_id"], "i1");
    }

    execution.stop().await;
    stack.engine.stop().await;
    bus.close().await.unwrap();
}

#[tokio::test]
async fn fills_flow_back_into_portfolio_and_risk_broadcast() {
    let bus = test_bus();
    let stack = build_stack(&bus);
    let router = Arc::new(PaperOrderRouter::new(Arc::new(
        bus.with_group("order_router", "r-1"),
    )));

    stack.risk.start().await.unwrap();
    router.start().await;

    let mut risk_events = bus
        .with_group("observer", "t")
        .subscribe_multiple(&[streams::PORTFOLIO_RISK])
        .await
        .unwrap();

    let order = OrderCommand {
        strategy_id: "grid-1".to_string(),
        symbol: "BTC/USDT".to_string(),
        side: Side::Buy,
        order_type: OrderType::Limit,
        quantity: dec!(2),
        price: Some(dec!(40000)),
        command: voltrader::events::OrderAction::Create,
        order_id: None,
        metadata: Metadata::new(),
    };
    publish_event(&bus, streams::ORDER_COMMAND, &order).await.unwrap();

    let events: Vec<PortfolioRisk> = collect(&mut risk_events, 1, Duration::from_secs(5)).await;
    assert_eq!(events.len(), 1);
    // Spot position: delta equals quantity.
    assert!((events[0].total_delta - 2.0).abs() < 1e-9);

    let position = stack
        .portfolio
        .get_position("BTC/USDT")
        .await
        .unwrap()
        .expect("position recorded");
    assert_eq!(position.quantity, dec!(2));
    assert_eq!(position.avg_price, dec!(40000));

    router.stop().await;
    stack.risk.stop().await;
    bus.close().await.unwrap();
}

#[tokio::test]
async fn pq_strategy_drives_the_full_intent_pipeline() {
    let bus = test_bus();
    let stack = build_stack(&bus);
    stack
        .engine
        .register_factory("PqVolTraderStrategy", PqVolTraderStrategy::factory());
    stack
        .engine
        .load_strategy(
            "pq-1",
            "PqVolTraderStrategy",
            &serde_json::json!({ "signal_cooldown_secs": 0 }),
        )
        .await
        .unwrap();
    stack.engine.start().await;

    let mut commands = bus
        .with_group("option_execution", "t")
        .subscribe_multiple(&[streams::EXECUTION_COMMAND])
        .await
        .unwrap();

    let macro_state = MacroState {
        symbol: None,
        regime: Regime::Bull,
        regime_score: 0.5,
        sentiment_score: Some(0.4),
        fomo_score: Some(0.2),
        timestamp: Utc::now(),
    };
    publish_event(&bus, streams::MARKET_MACRO_STATE, &macro_state)
        .await
        .unwrap();
    publish_event(&bus, streams::MARKET_VOL_SURFACE, &straddle_surface())
        .await
        .unwrap();
    let forecast = VolatilityForecast {
        underlying: "BTC/USDT".to_string(),
        horizon: "24h".to_string(),
        predicted_volatility: 0.70,
        confidence: 0.9,
        model_version: "glm-gamma".to_string(),
        timestamp: Utc::now(),
    };
    publish_event(&bus, streams::STRATEGY_FORECAST_VOLATILITY, &forecast)
        .await
        .unwrap();

    let commands: Vec<ExecutionCommand> = collect(&mut commands, 1, Duration::from_secs(5)).await;
    assert_eq!(commands.len(), 1);
    assert_eq!(commands[0].action, IntentAction::BuyStraddle);
    assert_eq!(commands[0].strategy_id, "pq-1");
    assert_eq!(commands[0].quantity, dec!(0.1));

    stack.engine.stop().await;
    bus.close().await.unwrap();
}

#[tokio::test]
async fn consumer_groups_replay_independently() {
    let bus = test_bus();
    publish_event(&bus, streams::ORDER_FILL, &serde_json::json!({ "marker": 1 }))
        .await
        .unwrap();

    // engineA consumes and acknowledges.
    let mut engine_a = bus
        .with_group("engineA", "c1")
        .subscribe_multiple(&[streams::ORDER_FILL])
        .await
        .unwrap();
    let seen: Vec<serde_json::Value> = collect(&mut engine_a, 1, Duration::from_secs(2)).await;
    assert_eq!(seen.len(), 1);

    // A fresh consumer joining engineA does not re-receive it.
    let mut rejoined = bus
        .with_group("engineA", "c2")
        .subscribe_multiple(&[streams::ORDER_FILL])
        .await
        .unwrap();
    let replayed: Vec<serde_json::Value> = collect(&mut rejoined, 1, Duration::from_millis(200)).await;
    assert!(replayed.is_empty());

    // An independent audit group receives the same message.
    let mut audit = bus
        .with_group("audit", "c1")
        .subscribe_multiple(&[streams::ORDER_FILL])
        .await
        .unwrap();
    let audited: Vec<serde_json::Value> = collect(&mut audit, 1, Duration::from_secs(2)).await;
    assert_eq!(audited.len(), 1);
    assert_eq!(audited[0]["marker"], 1);

    bus.close().await.unwrap();
}
