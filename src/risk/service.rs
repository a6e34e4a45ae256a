//! Risk service: consumes fills into the portfolio store, runs the pre-order
//! veto chain, aggregates portfolio Greeks, and broadcasts macro state.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::bus::{publish_event, streams, BusItem, MessageBus};
use crate::config::RiskConfig;
use crate::error::{Result, TradingError};
use crate::events::{
    AlertSeverity, AlertType, MacroState, Metadata, OptionGreeks, OrderFill, PortfolioRisk,
    RiskAlert, Side,
};
use crate::market_data::exchange::ExchangeClient;
use crate::net::SentimentClient;
use crate::options::{black_scholes, OptionContractId};
use crate::risk::regime::{classify_regime, fomo_score};
use crate::state::PortfolioStore;

/// Outcome of a risk check. A veto is control flow, not an error.
#[derive(Debug, Clone)]
pub struct RiskCheck {
    pub approved: bool,
    pub reason: String,
    pub metrics: HashMap<String, f64>,
}

impl RiskCheck {
    fn approved(reason: impl Into<String>) -> Self {
        Self {
            approved: true,
            reason: reason.into(),
            metrics: HashMap::new(),
        }
    }

    fn vetoed(reason: impl Into<String>, metrics: HashMap<String, f64>) -> Self {
        Self {
            approved: false,
            reason: reason.into(),
            metrics,
        }
    }
}

pub struct RiskService {
    bus: Arc<dyn MessageBus>,
    portfolio: Arc<PortfolioStore>,
    exchange: Option<Arc<dyn ExchangeClient>>,
    sentiment: Option<Arc<SentimentClient>>,
    config: RiskConfig,
    running: Arc<AtomicBool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    peak_value: Mutex<Option<Decimal>>,
}

impl RiskService {
    pub fn new(
        bus: Arc<dyn MessageBus>,
        portfolio: Arc<PortfolioStore>,
        exchange: Option<Arc<dyn ExchangeClient>>,
        sentiment: Option<Arc<SentimentClient>>,
        config: RiskConfig,
    ) -> Self {
        Self {
            bus,
            portfolio,
            exchange,
            sentiment,
            config,
            running: Arc::new(AtomicBool::new(false)),
            tasks: Mutex::new(Vec::new()),
            peak_value: Mutex::new(None),
        }
    }

    pub async fn start(self: &Arc<Self>) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("risk service already running");
            return Ok(());
        }
        info!("risk service starting");

        let stored_peak = self.portfolio.get_peak_value().await?;
        let initial = if stored_peak > Decimal::ZERO {
            stored_peak
        } else {
            self.total_value().await?
        };
        *self.peak_value.lock().unwrap() = Some(initial);
        info!(peak = %initial, "initialized portfolio peak value");

        {
            let svc = Arc::clone(self);
            let task = tokio::spawn(async move { svc.consume_fills().await });
            self.tasks.lock().unwrap().push(task);
        }
        {
            let svc = Arc::clone(self);
            let task = tokio::spawn(async move { svc.periodic_check_loop().await });
            self.tasks.lock().unwrap().push(task);
        }
        {
            let svc = Arc::clone(self);
            let task = tokio::spawn(async move { svc.macro_broadcast_loop().await });
            self.tasks.lock().unwrap().push(task);
        }
        Ok(())
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
        info!("risk service stopped");
    }

    async fn consume_fills(self: Arc<Self>) {
        let mut sub = match self.bus.subscribe(streams::ORDER_FILL).await {
            Ok(sub) => sub,
            Err(err) => {
                error!(%err, "risk service could not subscribe to fills");
                return;
            }
        };
        while self.running.load(Ordering::SeqCst) {
            match sub.next().await {
                Ok(Some(BusItem::Event(event))) => {
                    match crate::bus::decode_event::<OrderFill>(event.payload) {
                        Ok(fill) => {
                            if let Err(err) = self.process_fill(&fill).await {
                                error!(%err, symbol = %fill.symbol, "fill processing failed");
                            }
                        }
                        Err(err) => warn!(%err, "dropping malformed fill"),
                    }
                }
                Ok(Some(BusItem::KeepAlive)) => continue,
                Ok(None) => break,
                Err(err) => error!(%err, "fill subscription error"),
            }
        }
        debug!("fill consumer exiting");
    }

    /// Fold a fill into the portfolio and refresh derived state.
    pub async fn process_fill(&self, fill: &OrderFill) -> Result<()> {
        info!(
            symbol = %fill.symbol,
            side = fill.side.as_str(),
            quantity = %fill.quantity,
            price = %fill.price,
            "processing fill"
        );

        self.portfolio
            .apply_fill(
                &fill.symbol,
                fill.side,
                fill.quantity,
                fill.price,
                Some(&fill.strategy_id),
            )
            .await?;

        if let Some(exchange) = &self.exchange {
            match exchange.fetch_balance().await {
                Ok(snapshot) => {
                    if let Err(err) = self.portfolio.update_global_balance(&snapshot.free).await {
                        error!(%err, "failed to persist balance snapshot");
                    }
                }
                Err(err) => error!(%err, "balance refresh failed"),
            }
        }

        let total_value = self.total_value().await?;
        self.portfolio
            .record_pnl(Decimal::ZERO, Decimal::ZERO, total_value)
            .await?;

        self.refresh_risk_metrics().await
    }

    /// Pre-order veto: drawdown, position ratio, then order impact.
    pub async fn check_pre_order(
        &self,
        strategy_id: &str,
        symbol: &str,
        side: Side,
        quantity: Decimal,
        price: Decimal,
    ) -> Result<RiskCheck> {
        debug!(
            strategy_id,
            symbol,
            side = side.as_str(),
            %quantity,
            %price,
            "pre-order check"
        );

        let drawdown = self.check_drawdown().await?;
        if !drawdown.approved {
            return Ok(drawdown);
        }

        let limits = self.check_position_limits().await?;
        if !limits.approved {
            return Ok(limits);
        }

        let impact = self.simulate_order_impact(symbol, side, quantity, price).await?;
        if !impact.approved {
            return Ok(impact);
        }

        Ok(RiskCheck::approved("All risk checks passed"))
    }

    pub async fn check_drawdown(&self) -> Result<RiskCheck> {
        let current = self.total_value().await?;

        // Peak cache is seeded from the store outside the lock.
        let stored = if self.peak_value.lock().unwrap().is_none() {
            Some(self.portfolio.get_peak_value().await?)
        } else {
            None
        };
        let peak = {
            let mut guard = self.peak_value.lock().unwrap();
            let peak = (*guard).or(stored).unwrap_or(Decimal::ZERO);
            if current > peak {
                *guard = Some(current);
                current
            } else {
                *guard = Some(peak);
                peak
            }
        };

        if current >= peak {
            self.portfolio.record_drawdown(current, peak, 0.0).await?;
            return Ok(RiskCheck::approved("At or above peak"));
        }

        let drawdown_pct = if peak > Decimal::ZERO {
            ((peak - current) / peak).to_f64().unwrap_or(0.0)
        } else {
            0.0
        };
        self.portfolio.record_drawdown(current, peak, drawdown_pct).await?;

        if drawdown_pct > self.config.max_drawdown_pct {
            let mut metrics = HashMap::new();
            metrics.insert("current_value".to_string(), current.to_f64().unwrap_or(0.0));
            metrics.insert("peak_value".to_string(), peak.to_f64().unwrap_or(0.0));
            metrics.insert("drawdown_pct".to_string(), drawdown_pct);
            metrics.insert(
                "threshold_value".to_string(),
                self.config.max_drawdown_pct,
            );
            return Ok(RiskCheck::vetoed(
                format!(
                    "Drawdown limit breached: {:.2}% > {:.2}%",
                    drawdown_pct * 100.0,
                    self.config.max_drawdown_pct * 100.0
                ),
                metrics,
            ));
        }

        Ok(RiskCheck::approved("Drawdown within limit"))
    }

    pub async fn check_position_limits(&self) -> Result<RiskCheck> {
        let total = self.total_value().await?;
        if total == Decimal::ZERO {
            return Ok(RiskCheck::approved("No portfolio value yet"));
        }

        let positions = self.portfolio.get_all_positions().await?;
        let position_value: Decimal = positions.values().map(|p| p.notional()).sum();
        let ratio = (position_value / total).to_f64().unwrap_or(0.0);

        let mut metrics = HashMap::new();
        metrics.insert("position_ratio".to_string(), ratio);
        metrics.insert("current_value".to_string(), total.to_f64().unwrap_or(0.0));

        if ratio > self.config.max_position_ratio {
            metrics.insert("threshold_value".to_string(), self.config.max_position_ratio);
            return Ok(RiskCheck::vetoed(
                format!(
                    "Position ratio above limit: {:.2}% > {:.2}%",
                    ratio * 100.0,
                    self.config.max_position_ratio * 100.0
                ),
                metrics,
            ));
        }
        if ratio < self.config.min_position_ratio {
            metrics.insert("threshold_value".to_string(), self.config.min_position_ratio);
            return Ok(RiskCheck::vetoed(
                format!(
                    "Position ratio below floor: {:.2}% < {:.2}%",
                    ratio * 100.0,
                    self.config.min_position_ratio * 100.0
                ),
                metrics,
            ));
        }

        Ok(RiskCheck::approved("Position ratio within band"))
    }

    /// Hypothetical post-order concentration and gross-leverage check.
    pub async fn simulate_order_impact(
        &self,
        symbol: &str,
        side: Side,
        quantity: Decimal,
        price: Decimal,
    ) -> Result<RiskCheck> {
        let current_qty = self
            .portfolio
            .get_position(symbol)
            .await?
            .map(|p| p.quantity)
            .unwrap_or(Decimal::ZERO);
        let new_qty = match side {
            Side::Buy => current_qty + quantity,
            Side::Sell => current_qty - quantity,
        };

        let total = self.total_value().await?;
        if total == Decimal::ZERO {
            // No capital under management: sizing is the caller's problem.
            return Ok(RiskCheck::approved("No portfolio value yet"));
        }

        let new_position_value = (new_qty * price).abs();
        let position_pct = (new_position_value / total).to_f64().unwrap_or(0.0);
        if position_pct > self.config.max_single_position_pct {
            let mut metrics = HashMap::new();
            metrics.insert("position_pct".to_string(), position_pct);
            metrics.insert(
                "new_position_value".to_string(),
                new_position_value.to_f64().unwrap_or(0.0),
            );
            metrics.insert(
                "threshold_value".to_string(),
                self.config.max_single_position_pct,
            );
            return Ok(RiskCheck::vetoed(
                format!(
                    "Single position limit breached: {:.2}% > {:.2}%",
                    position_pct * 100.0,
                    self.config.max_single_position_pct * 100.0
                ),
                metrics,
            ));
        }

        let positions = self.portfolio.get_all_positions().await?;
        let other_notional: Decimal = positions
            .iter()
            .filter(|(sym, _)| sym.as_str() != symbol)
            .map(|(_, p)| p.notional().abs())
            .sum();
        let order_notional = (quantity * price).abs();
        let leverage = ((other_notional + order_notional) / total)
            .to_f64()
            .unwrap_or(0.0);
        if leverage > self.config.max_gross_leverage {
            let mut metrics = HashMap::new();
            metrics.insert("new_leverage".to_string(), leverage);
            metrics.insert("threshold_value".to_string(), self.config.max_gross_leverage);
            return Ok(RiskCheck::vetoed(
                format!(
                    "Gross leverage breached: {:.2}x > {:.2}x",
                    leverage, self.config.max_gross_leverage
                ),
                metrics,
            ));
        }

        Ok(RiskCheck::approved("Order impact within limits"))
    }

    /// Free USDT plus the book value of all positions.
    pub async fn total_value(&self) -> Result<Decimal> {
        let balances = self.portfolio.get_global_balance().await?;
        let positions = self.portfolio.get_all_positions().await?;
        let mut total = balances.get("USDT").copied().unwrap_or(Decimal::ZERO);
        for position in positions.values() {
            total += position.notional();
        }
        Ok(total)
    }

    /// Recompute aggregated risk metrics, Greeks included, and broadcast
    /// `portfolio.risk`.
    pub async fn refresh_risk_metrics(&self) -> Result<()> {
        let total = self.total_value().await?;
        let positions = self.portfolio.get_all_positions().await?;

        let mut position_value = Decimal::ZERO;
        let mut total_delta = 0.0_f64;
        let mut total_gamma = 0.0_f64;
        let mut total_vega = 0.0_f64;
        let mut total_theta = 0.0_f64;
        let mut total_rho = 0.0_f64;

        for (symbol, position) in &positions {
            position_value += position.notional();
            let quantity = position.quantity.to_f64().unwrap_or(0.0);

            if let Some(contract) = OptionContractId::parse(symbol) {
                let greeks = match position.greeks {
                    Some(greeks) => Some(greeks),
                    None => self.compute_position_greeks(&contract, position).await,
                };
                if let Some(greeks) = greeks {
                    total_delta += greeks.delta * quantity;
                    total_gamma += greeks.gamma * quantity;
                    total_vega += greeks.vega * quantity;
                    total_theta += greeks.theta * quantity;
                    total_rho += greeks.rho * quantity;
                }
            } else {
                // Spot and linear contracts: delta is the quantity itself.
                total_delta += quantity;
            }
        }

        let position_ratio = if total > Decimal::ZERO {
            Some((position_value / total).to_f64().unwrap_or(0.0))
        } else {
            None
        };

        let mut metrics = HashMap::new();
        metrics.insert("total_value".to_string(), total.to_f64().unwrap_or(0.0));
        metrics.insert(
            "position_value".to_string(),
            position_value.to_f64().unwrap_or(0.0),
        );
        metrics.insert(
            "position_ratio".to_string(),
            position_ratio.unwrap_or(0.0),
        );
        metrics.insert("num_positions".to_string(), positions.len() as f64);
        metrics.insert("total_delta".to_string(), total_delta);
        metrics.insert("total_gamma".to_string(), total_gamma);
        metrics.insert("total_vega".to_string(), total_vega);
        metrics.insert("total_theta".to_string(), total_theta);
        metrics.insert("total_rho".to_string(), total_rho);
        self.portfolio.update_risk_metrics(&metrics).await?;

        debug!(
            total_delta = %format!("{total_delta:.4}"),
            total_gamma = %format!("{total_gamma:.4}"),
            total_vega = %format!("{total_vega:.4}"),
            "risk metrics updated"
        );

        let mut metadata = Metadata::new();
        metadata.insert(
            "total_value".to_string(),
            serde_json::to_value(total.to_f64().unwrap_or(0.0))?,
        );
        let event = PortfolioRisk {
            total_delta,
            total_gamma,
            total_vega,
            total_theta,
            total_rho,
            position_ratio,
            leverage: None,
            timestamp: Utc::now(),
            metadata,
        };
        publish_event(self.bus.as_ref(), streams::PORTFOLIO_RISK, &event).await
    }

    /// Black-Scholes Greeks for an option position lacking a cached set,
    /// written back to the store on success.
    async fn compute_position_greeks(
        &self,
        contract: &OptionContractId,
        position: &crate::state::Position,
    ) -> Option<OptionGreeks> {
        let spot = match &self.exchange {
            Some(exchange) => {
                let pair = format!("{}/USDT", contract.underlying);
                match exchange.fetch_ticker(&pair).await {
                    Ok(ticker) => ticker.last.to_f64().unwrap_or(0.0),
                    Err(err) => {
                        debug!(%err, %pair, "spot fetch failed, using position average");
                        position.avg_price.to_f64().unwrap_or(0.0)
                    }
                }
            }
            None => position.avg_price.to_f64().unwrap_or(0.0),
        };
        if spot <= 0.0 {
            return None;
        }

        let days = (contract.expiry - Utc::now().date_naive()).num_days();
        let time_to_expiry = (days as f64 / 365.0).max(0.001);
        let greeks = black_scholes::greeks(
            spot,
            contract.strike as f64,
            time_to_expiry,
            self.config.risk_free_rate,
            self.config.assumed_volatility,
            contract.kind,
        );

        if let Err(err) = self
            .portfolio
            .update_position_greeks(&position.symbol, greeks)
            .await
        {
            error!(%err, symbol = %position.symbol, "failed to cache position greeks");
        }
        Some(greeks)
    }

    async fn periodic_check_loop(self: Arc<Self>) {
        while self.running.load(Ordering::SeqCst) {
            tokio::time::sleep(self.config.check_interval).await;
            if !self.running.load(Ordering::SeqCst) {
                break;
            }
            if let Err(err) = self.run_periodic_checks().await {
                error!(%err, "periodic risk check failed");
            }
        }
    }

    async fn run_periodic_checks(&self) -> Result<()> {
        let drawdown = self.check_drawdown().await?;
        if !drawdown.approved {
            self.send_risk_alert(
                AlertType::Drawdown,
                AlertSeverity::Critical,
                &drawdown.reason,
                &drawdown.metrics,
            )
            .await?;
        }

        let limits = self.check_position_limits().await?;
        if !limits.approved {
            self.send_risk_alert(
                AlertType::PositionLimit,
                AlertSeverity::Warning,
                &limits.reason,
                &limits.metrics,
            )
            .await?;
        }
        Ok(())
    }

    async fn macro_broadcast_loop(self: Arc<Self>) {
        while self.running.load(Ordering::SeqCst) {
            if let Err(err) = self.broadcast_macro_state().await {
                warn!(%err, "macro state broadcast failed");
            }
            tokio::time::sleep(self.config.macro_broadcast_interval).await;
        }
    }

    async fn broadcast_macro_state(&self) -> Result<()> {
        let sentiment = match &self.sentiment {
            Some(client) => match client.fetch_score().await {
                Ok(score) => score,
                Err(TradingError::RateLimited(detail)) => {
                    warn!(%detail, "sentiment service rate limited, backing off this cycle");
                    None
                }
                Err(err) => {
                    debug!(%err, "sentiment fetch failed");
                    None
                }
            },
            None => None,
        };

        let realized_vol = self.estimate_realized_vol().await?;
        let (regime, regime_score) = classify_regime(realized_vol, sentiment);
        let event = MacroState {
            symbol: None,
            regime,
            regime_score,
            sentiment_score: sentiment,
            fomo_score: fomo_score(sentiment, realized_vol),
            timestamp: Utc::now(),
        };
        publish_event(self.bus.as_ref(), streams::MARKET_MACRO_STATE, &event).await
    }

    /// Step-to-step total-value change over the last two PnL samples,
    /// clipped to 1.5.
    pub(crate) async fn estimate_realized_vol(&self) -> Result<Option<f64>> {
        let samples = self.portfolio.get_recent_pnl(2).await?;
        if samples.len() < 2 {
            return Ok(None);
        }
        let prev = samples[0].total_value.to_f64().unwrap_or(0.0);
        let curr = samples[1].total_value.to_f64().unwrap_or(0.0);
        let change = (curr - prev).abs() / prev.abs().max(1.0);
        Ok(Some(change.min(1.5)))
    }

    async fn send_risk_alert(
        &self,
        alert_type: AlertType,
        severity: AlertSeverity,
        message: &str,
        metrics: &HashMap<String, f64>,
    ) -> Result<()> {
        let mut metadata = Metadata::new();
        for (key, value) in metrics {
            metadata.insert(key.clone(), serde_json::to_value(value)?);
        }
        let alert = RiskAlert {
            strategy_id: "global".to_string(),
            alert_type,
            severity,
            message: message.to_string(),
            current_value: metrics.get("current_value").copied().unwrap_or(0.0),
            threshold_value: metrics.get("threshold_value").copied().unwrap_or(0.0),
            timestamp: Utc::now(),
            metadata,
        };
        warn!(?severity, message, "risk alert");
        publish_event(self.bus.as_ref(), streams::RISK_ALERT, &alert).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{MemoryStreamBus, Subscription};
    use crate::state::{MemoryKv, PortfolioStore};
    use rust_decimal_macros::dec;
    use std::time::Duration;

    fn test_bus() -> MemoryStreamBus {
        MemoryStreamBus::with_blocks(
            "test",
            Duration::from_millis(50),
            Duration::from_millis(50),
        )
    }

    fn service(bus: &MemoryStreamBus, config: RiskConfig) -> (Arc<RiskService>, Arc<PortfolioStore>) {
        let portfolio = Arc::new(PortfolioStore::new(Arc::new(MemoryKv::new()), "test"));
        let service = Arc::new(RiskService::new(
            Arc::new(bus.clone()),
            Arc::clone(&portfolio),
            None,
            None,
            config,
        ));
        (service, portfolio)
    }

    async fn set_usdt(portfolio: &PortfolioStore, amount: Decimal) {
        let mut balances = HashMap::new();
        balances.insert("USDT".to_string(), amount);
        portfolio.update_global_balance(&balances).await.unwrap();
    }

    #[tokio::test]
    async fn empty_portfolio_approves_everything() {
        let bus = test_bus();
        let (service, _) = service(&bus, RiskConfig::default());
        let check = service
            .check_pre_order("s1", "BTC/USDT", Side::Buy, dec!(0.1), dec!(40000))
            .await
            .unwrap();
        assert!(check.approved, "rejected: {}", check.reason);
    }

    #[tokio::test]
    async fn drawdown_past_limit_vetoes_with_percentage() {
        let bus = test_bus();
        let (service, portfolio) = service(&bus, RiskConfig::default());

        // Peak at 1000, then the book bleeds down to 790: 21% drawdown.
        portfolio
            .record_pnl(Decimal::ZERO, Decimal::ZERO, dec!(1000))
            .await
            .unwrap();
        set_usdt(&portfolio, dec!(790)).await;

        let check = service
            .check_pre_order("s1", "BTC/USDT", Side::Buy, dec!(0.1), dec!(40000))
            .await
            .unwrap();
        assert!(!check.approved);
        assert!(
            check.reason.contains("21.00%"),
            "reason was: {}",
            check.reason
        );
    }

    #[tokio::test]
    async fn position_ratio_above_limit_vetoes() {
        let bus = test_bus();
        let (service, portfolio) = service(&bus, RiskConfig::default());
        set_usdt(&portfolio, dec!(100)).await;
        portfolio
            .update_position("BTC/USDT", dec!(1), dec!(900), Decimal::ZERO, None)
            .await
            .unwrap();
        // 900 of 1000 total: 90% > 80%.
        let check = service.check_position_limits().await.unwrap();
        assert!(!check.approved);
        assert!(check.reason.contains("above limit"));
    }

    #[tokio::test]
    async fn single_position_concentration_vetoes() {
        let bus = test_bus();
        let config = RiskConfig {
            min_position_ratio: 0.0,
            ..RiskConfig::default()
        };
        let (service, portfolio) = service(&bus, config);
        set_usdt(&portfolio, dec!(1000)).await;

        // 0.01 BTC at 40k is 400, i.e. 40% of a 1000-value book.
        let check = service
            .simulate_order_impact("BTC/USDT", Side::Buy, dec!(0.01), dec!(40000))
            .await
            .unwrap();
        assert!(!check.approved);
        assert!(check.reason.contains("Single position"));
    }

    #[tokio::test]
    async fn gross_leverage_vetoes() {
        let bus = test_bus();
        let config = RiskConfig {
            min_position_ratio: 0.0,
            max_single_position_pct: 10.0,
            ..RiskConfig::default()
        };
        let (service, portfolio) = service(&bus, config);
        set_usdt(&portfolio, dec!(1000)).await;
        portfolio
            .update_position("ETH/USDT", dec!(1), dec!(2500), Decimal::ZERO, None)
            .await
            .unwrap();

        // Existing 2500 notional plus a 4000 order on a 3500 book: > 3x.
        let check = service
            .simulate_order_impact("BTC/USDT", Side::Buy, dec!(0.1), dec!(40000))
            .await
            .unwrap();
        assert!(!check.approved);
        assert!(check.reason.contains("Gross leverage"));
    }

    #[tokio::test]
    async fn delta_aggregates_options_and_spot() {
        let bus = test_bus();
        let (service, portfolio) = service(&bus, RiskConfig::default());

        portfolio
            .update_position("BTC-20241229-40000-C", dec!(1), dec!(1000), Decimal::ZERO, None)
            .await
            .unwrap();
        portfolio
            .update_position_greeks(
                "BTC-20241229-40000-C",
                OptionGreeks { delta: 0.5, gamma: 0.0, theta: 0.0, vega: 0.0, rho: 0.0 },
            )
            .await
            .unwrap();
        portfolio
            .update_position("BTC/USDT", dec!(2), dec!(40000), Decimal::ZERO, None)
            .await
            .unwrap();

        let mut sub = bus
            .with_group("observer", "t")
            .subscribe_multiple(&[streams::PORTFOLIO_RISK])
            .await
            .unwrap();

        service.refresh_risk_metrics().await.unwrap();

        let metrics = portfolio.get_risk_metrics().await.unwrap();
        assert!((metrics["total_delta"] - 2.5).abs() < 1e-9);

        match sub.next().await.unwrap() {
            Some(BusItem::Event(event)) => {
                let risk: PortfolioRisk = crate::bus::decode_event(event.payload).unwrap();
                assert!((risk.total_delta - 2.5).abs() < 1e-9);
            }
            other => panic!("expected portfolio risk event, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn uncached_option_greeks_are_computed_and_stored() {
        let bus = test_bus();
        let (service, portfolio) = service(&bus, RiskConfig::default());

        // Far-dated ATM-ish call priced off its own average as spot proxy.
        let expiry = (Utc::now().date_naive() + chrono::Duration::days(90)).format("%Y%m%d");
        let symbol = format!("BTC-{expiry}-40000-C");
        portfolio
            .update_position(&symbol, dec!(1), dec!(40000), Decimal::ZERO, None)
            .await
            .unwrap();

        service.refresh_risk_metrics().await.unwrap();

        let position = portfolio.get_position(&symbol).await.unwrap().unwrap();
        let greeks = position.greeks.expect("greeks cached after refresh");
        assert!(greeks.delta > 0.0 && greeks.delta <= 1.0);

        let metrics = portfolio.get_risk_metrics().await.unwrap();
        assert!((metrics["total_delta"] - greeks.delta).abs() < 1e-9);
    }

    #[tokio::test]
    async fn fill_processing_updates_book_and_broadcasts() {
        let bus = test_bus();
        let (service, portfolio) = service(&bus, RiskConfig::default());
        let mut sub = bus
            .with_group("observer", "t")
            .subscribe_multiple(&[streams::PORTFOLIO_RISK])
            .await
            .unwrap();

        let fill = OrderFill {
            strategy_id: "s1".to_string(),
            order_id: "o1".to_string(),
            symbol: "BTC/USDT".to_string(),
            side: Side::Buy,
            quantity: dec!(2),
            price: dec!(40000),
            fee: Decimal::ZERO,
            timestamp: Utc::now(),
            metadata: Metadata::new(),
        };
        service.process_fill(&fill).await.unwrap();

        let position = portfolio.get_position("BTC/USDT").await.unwrap().unwrap();
        assert_eq!(position.quantity, dec!(2));
        assert_eq!(position.avg_price, dec!(40000));
        assert_eq!(portfolio.get_recent_pnl(10).await.unwrap().len(), 1);
        assert!(matches!(
            sub.next().await.unwrap(),
            Some(BusItem::Event(_))
        ));
    }

    #[tokio::test]
    async fn realized_vol_from_last_two_samples() {
        let bus = test_bus();
        let (service, portfolio) = service(&bus, RiskConfig::default());
        assert_eq!(service.estimate_realized_vol().await.unwrap(), None);

        portfolio.record_pnl(Decimal::ZERO, Decimal::ZERO, dec!(1000)).await.unwrap();
        portfolio.record_pnl(Decimal::ZERO, Decimal::ZERO, dec!(1100)).await.unwrap();
        let vol = service.estimate_realized_vol().await.unwrap().unwrap();
        assert!((vol - 0.1).abs() < 1e-9);

        // Huge swings clip at 1.5.
        portfolio.record_pnl(Decimal::ZERO, Decimal::ZERO, dec!(10000)).await.unwrap();
        let vol = service.estimate_realized_vol().await.unwrap().unwrap();
        assert!((vol - 1.5).abs() < 1e-9);
    }
}
