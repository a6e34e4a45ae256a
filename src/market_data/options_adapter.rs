//! Options chain adapter: polls spot, prices a simulated chain around it,
//! inverts implied volatility per contract, computes greeks and publishes the
//! resulting `market.vol_surface`.
//!
//! The chain itself is simulated (strikes at fixed moneyness, three expiry
//! horizons); a venue-backed chain source slots in behind the same cycle.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{NaiveDate, Utc};
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::bus::{publish_event, streams, MessageBus};
use crate::error::{Result, TradingError};
use crate::events::{OptionChainEntry, OptionKind, VolatilitySurface};
use crate::market_data::exchange::ExchangeClient;
use crate::options::black_scholes;

/// Strike moneyness ladder around spot.
const STRIKE_FACTORS: [(i64, u32); 5] = [(90, 2), (95, 2), (100, 2), (105, 2), (110, 2)];
/// Expiry horizons in days.
const EXPIRY_HORIZONS: [i64; 3] = [7, 30, 90];

pub struct OptionsChainAdapter {
    exchange: Arc<dyn ExchangeClient>,
    bus: Arc<dyn MessageBus>,
    underlying: String,
    poll_interval: Duration,
    risk_free_rate: f64,
    assumed_volatility: f64,
    running: Arc<AtomicBool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl OptionsChainAdapter {
    pub fn new(
        exchange: Arc<dyn ExchangeClient>,
        bus: Arc<dyn MessageBus>,
        underlying: impl Into<String>,
        poll_interval: Duration,
        risk_free_rate: f64,
        assumed_volatility: f64,
    ) -> Self {
        Self {
            exchange,
            bus,
            underlying: underlying.into(),
            poll_interval,
            risk_free_rate,
            assumed_volatility,
            running: Arc::new(AtomicBool::new(false)),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub async fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("options chain adapter already running");
            return;
        }
        info!(underlying = %self.underlying, "options chain adapter starting");
        let adapter = Arc::clone(self);
        let task = tokio::spawn(async move {
            while adapter.running.load(Ordering::SeqCst) {
                match adapter.run_cycle().await {
                    Ok(()) => tokio::time::sleep(adapter.poll_interval).await,
                    Err(err) => {
                        warn!(%err, "options chain cycle failed, backing off");
                        tokio::time::sleep(adapter.poll_interval * 2).await;
                    }
                }
            }
        });
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
        info!("options chain adapter stopped");
    }

    async fn run_cycle(&self) -> Result<()> {
        let ticker = self.exchange.fetch_ticker(&self.underlying).await?;
        let surface = self.build_surface(ticker.last)?;
        info!(
            underlying = %self.underlying,
            atm_iv = %format!("{:.2}%", surface.atm_iv * 100.0),
            contracts = surface.entries.len(),
            "publishing volatility surface"
        );
        publish_event(self.bus.as_ref(), streams::MARKET_VOL_SURFACE, &surface).await
    }

    fn build_surface(&self, spot: Decimal) -> Result<VolatilitySurface> {
        let spot_f = spot
            .to_f64()
            .ok_or_else(|| TradingError::MarketData("Spot price out of range".to_string()))?;
        if spot_f <= 0.0 {
            return Err(TradingError::MarketData("Spot price must be positive".to_string()));
        }

        let today = Utc::now().date_naive();
        let mut entries = Vec::new();
        for days in EXPIRY_HORIZONS {
            let expiry = today + chrono::Duration::days(days);
            let time_to_expiry = (days as f64 / 365.0).max(0.001);
            for (num, scale) in STRIKE_FACTORS {
                let strike = (spot * Decimal::new(num, scale)).round_dp(0);
                let strike_f = strike.to_f64().unwrap_or(0.0);
                for option_type in [OptionKind::Call, OptionKind::Put] {
                    entries.push(self.build_entry(
                        spot_f,
                        strike,
                        strike_f,
                        expiry,
                        time_to_expiry,
                        option_type,
                    ));
                }
            }
        }

        let atm_entries: Vec<&OptionChainEntry> = entries
            .iter()
            .filter(|e| {
                let strike = e.strike.to_f64().unwrap_or(0.0);
                ((strike - spot_f) / spot_f).abs() < 0.02
            })
            .collect();
        let atm_iv = if atm_entries.is_empty() {
            0.5
        } else {
            atm_entries.iter().map(|e| e.implied_volatility).sum::<f64>()
                / atm_entries.len() as f64
        };

        let mut iv_skew: HashMap<String, f64> = HashMap::new();
        for entry in &entries {
            let key = entry.strike.trunc().to_i64().unwrap_or(0).to_string();
            iv_skew.entry(key).or_insert(entry.implied_volatility);
        }

        let mut term_structure: HashMap<String, f64> = HashMap::new();
        for entry in &entries {
            let key = entry.expiry.to_string();
            if !term_structure.contains_key(&key) {
                let same_expiry: Vec<f64> = entries
                    .iter()
                    .filter(|e| e.expiry == entry.expiry)
                    .map(|e| e.implied_volatility)
                    .collect();
                let mean = same_expiry.iter().sum::<f64>() / same_expiry.len() as f64;
                term_structure.insert(key, mean);
            }
        }

        Ok(VolatilitySurface {
            underlying: self.underlying.clone(),
            entries,
            atm_iv,
            iv_skew,
            term_structure,
            timestamp: Utc::now(),
        })
    }

    fn build_entry(
        &self,
        spot: f64,
        strike: Decimal,
        strike_f: f64,
        expiry: NaiveDate,
        time_to_expiry: f64,
        option_type: OptionKind,
    ) -> OptionChainEntry {
        // Market price stands in for a venue quote.
        let market_price = black_scholes::price(
            spot,
            strike_f,
            time_to_expiry,
            self.risk_free_rate,
            self.assumed_volatility,
            option_type,
        );
        let iv = black_scholes::implied_volatility(
            market_price,
            spot,
            strike_f,
            time_to_expiry,
            self.risk_free_rate,
            option_type,
        );
        let greeks = black_scholes::greeks(
            spot,
            strike_f,
            time_to_expiry,
            self.risk_free_rate,
            iv,
            option_type,
        );

        let to_dec = |v: f64| Decimal::from_f64(v).unwrap_or(Decimal::ZERO).round_dp(8);
        OptionChainEntry {
            underlying: self.underlying.clone(),
            strike,
            expiry,
            option_type,
            bid: to_dec(market_price * 0.99),
            ask: to_dec(market_price * 1.01),
            last: to_dec(market_price),
            volume: Decimal::from(100),
            open_interest: Decimal::from(500),
            implied_volatility: iv,
            greeks: Some(greeks),
            timestamp: Utc::now(),
        }
    }
}
