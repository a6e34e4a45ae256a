//! Trading core entrypoint: wires the bus, stores, adapters, risk service,
//! strategy engine, option execution service and paper router, then runs
//! until interrupted.

use std::sync::Arc;

use anyhow::Context;
use rust_decimal::Decimal;
use tracing::info;
use tracing_subscriber::EnvFilter;

use voltrader::bus::{MemoryStreamBus, MessageBus};
use voltrader::config::Settings;
use voltrader::execution::{OptionExecutionService, PaperOrderRouter};
use voltrader::market_data::{MarketDataAdapter, OptionsChainAdapter, SimExchange};
use voltrader::net::{EndpointPool, ForecastClient, ForecastPoller, SentimentClient};
use voltrader::risk::RiskService;
use voltrader::state::{MemoryKv, PortfolioStore, StrategyStateStore};
use voltrader::strategy::{
    DeltaHedgerStrategy, GridStrategy, PqVolTraderStrategy, StrategyContext, StrategyEngine,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let settings = Settings::load().context("loading settings")?;
    info!(symbols = ?settings.symbols, underlying = %settings.underlying, "starting trading core");

    // Shared infrastructure. Each component reads the bus under its own
    // consumer group so streams fan out correctly.
    let bus = MemoryStreamBus::new(settings.stream_prefix.clone());
    let kv = Arc::new(MemoryKv::new());
    let portfolio = Arc::new(PortfolioStore::new(kv.clone(), settings.stream_prefix.clone()));
    let strategy_state = Arc::new(StrategyStateStore::new(
        kv.clone(),
        settings.stream_prefix.clone(),
    ));

    let exchange = Arc::new(SimExchange::new());
    exchange.set_balance("USDT", settings.sim_balance_usdt);
    exchange.set_price("BTC/USDT", Decimal::from(40_000));
    exchange.set_price("BNB/USDT", Decimal::from(600));

    let sentiment_pool = EndpointPool::new(
        "sentiment_service",
        &settings.sentiment_endpoints,
        settings.http_timeout,
        settings.endpoint_failure_threshold,
        settings.endpoint_cooldown,
    )
    .context("building sentiment endpoint pool")?;
    let sentiment = Arc::new(SentimentClient::new(sentiment_pool, "BTC", 20));

    let forecast_pool = EndpointPool::new(
        "strategy_service",
        &settings.forecast_endpoints,
        settings.http_timeout,
        settings.endpoint_failure_threshold,
        settings.endpoint_cooldown,
    )
    .context("building forecast endpoint pool")?;
    let forecast_client = Arc::new(ForecastClient::new(forecast_pool));

    // Risk service owns the portfolio store and gates every intent.
    let risk = Arc::new(RiskService::new(
        Arc::new(bus.with_group("risk_service", "risk-1")),
        Arc::clone(&portfolio),
        Some(exchange.clone() as Arc<dyn voltrader::market_data::ExchangeClient>),
        Some(Arc::clone(&sentiment)),
        settings.risk.clone(),
    ));

    // Strategy engine plus the plugin set.
    let engine_bus: Arc<dyn MessageBus> = Arc::new(bus.with_group("strategy_engine", "engine-1"));
    let context = StrategyContext::new(
        Arc::clone(&engine_bus),
        Arc::clone(&strategy_state),
        Some(exchange.clone() as Arc<dyn voltrader::market_data::ExchangeClient>),
    );
    let engine = Arc::new(StrategyEngine::new(
        engine_bus,
        context,
        Some(Arc::clone(&risk)),
    ));
    engine.register_factory("PqVolTraderStrategy", PqVolTraderStrategy::factory());
    engine.register_factory("DeltaHedgerStrategy", DeltaHedgerStrategy::factory());
    engine.register_factory("GridStrategy", GridStrategy::factory());

    engine
        .load_strategy(
            "pq-vol-1",
            "PqVolTraderStrategy",
            &serde_json::json!({ "underlying": settings.underlying }),
        )
        .await?;
    engine
        .load_strategy(
            "delta-hedger-1",
            "DeltaHedgerStrategy",
            &serde_json::json!({ "underlying": settings.underlying }),
        )
        .await?;
    engine
        .load_strategy("grid-1", "GridStrategy", &serde_json::json!({}))
        .await?;

    // Execution side.
    let option_execution = Arc::new(OptionExecutionService::new(Arc::new(
        bus.with_group("option_execution", "exec-1"),
    )));
    let router = Arc::new(PaperOrderRouter::new(Arc::new(
        bus.with_group("order_router", "router-1"),
    )));

    // Market data.
    let market_adapter = MarketDataAdapter::new(
        exchange.clone(),
        Arc::new(bus.clone()),
        settings.symbols.clone(),
        settings.tick_poll_interval,
    );
    let options_adapter = Arc::new(OptionsChainAdapter::new(
        exchange.clone(),
        Arc::new(bus.clone()),
        settings.underlying.clone(),
        settings.options_poll_interval,
        settings.risk.risk_free_rate,
        settings.risk.assumed_volatility,
    ));
    let forecast_poller = ForecastPoller::new(
        Arc::new(bus.with_group("forecast_adapter", "forecast-1")),
        forecast_client,
        settings.underlying.clone(),
        "24h",
        settings.forecast_poll_interval,
    );

    risk.start().await?;
    engine.start().await;
    option_execution.start().await;
    router.start().await;
    market_adapter.start().await;
    options_adapter.start().await;
    forecast_poller.start().await;

    info!(
        strategies = engine.active_strategies().await.len(),
        "trading core running, press ctrl-c to stop"
    );
    tokio::signal::ctrl_c().await.context("waiting for shutdown signal")?;
    info!("shutting down");

    // Producers first, the bus last.
    forecast_poller.stop().await;
    options_adapter.stop().await;
    market_adapter.stop().await;
    router.stop().await;
    option_execution.stop().await;
    engine.stop().await;
    risk.stop().await;
    bus.close().await?;

    Ok(())
}
