//! Process configuration, loaded from the environment (`.env` supported).

use std::str::FromStr;
use std::time::Duration;

use rust_decimal::Decimal;

use crate::error::Result;

/// Risk gate thresholds and service cadences.
#[derive(Debug, Clone)]
pub struct RiskConfig {
    pub max_drawdown_pct: f64,
    pub max_position_ratio: f64,
    pub min_position_ratio: f64,
    pub max_single_position_pct: f64,
    pub max_gross_leverage: f64,
    pub assumed_volatility: f64,
    pub risk_free_rate: f64,
    pub check_interval: Duration,
    pub macro_broadcast_interval: Duration,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            max_drawdown_pct: 0.20,
            max_position_ratio: 0.80,
            min_position_ratio: 0.10,
            max_single_position_pct: 0.30,
            max_gross_leverage: 3.0,
            assumed_volatility: 0.6,
            risk_free_rate: 0.03,
            check_interval: Duration::from_secs(60),
            macro_broadcast_interval: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub stream_prefix: String,
    pub symbols: Vec<String>,
    pub underlying: String,
    pub tick_poll_interval: Duration,
    pub options_poll_interval: Duration,
    pub forecast_poll_interval: Duration,
    pub risk: RiskConfig,
    pub sentiment_endpoints: Vec<String>,
    pub forecast_endpoints: Vec<String>,
    pub http_timeout: Duration,
    pub endpoint_failure_threshold: u32,
    pub endpoint_cooldown: Duration,
    pub sim_balance_usdt: Decimal,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            stream_prefix: "vt".to_string(),
            symbols: vec!["BTC/USDT".to_string(), "BNB/USDT".to_string()],
            underlying: "BTC/USDT".to_string(),
            tick_poll_interval: Duration::from_secs(1),
            options_poll_interval: Duration::from_secs(60),
            forecast_poll_interval: Duration::from_secs(300),
            risk: RiskConfig::default(),
            sentiment_endpoints: vec![
                "http://sentiment_service:8000".to_string(),
                "http://localhost:8002".to_string(),
            ],
            forecast_endpoints: vec![
                "http://strategy_service:8000".to_string(),
                "http://localhost:8003".to_string(),
            ],
            http_timeout: Duration::from_secs(10),
            endpoint_failure_threshold: 2,
            endpoint_cooldown: Duration::from_secs(120),
            sim_balance_usdt: Decimal::from(10_000),
        }
    }
}

impl Settings {
    /// Load settings from the environment, falling back to defaults.
    /// A `.env` file in the working directory is honored.
    pub fn load() -> Result<Self> {
        dotenv::dotenv().ok();
        let defaults = Self::default();
        Ok(Self {
            stream_prefix: env_or("STREAM_PREFIX", defaults.stream_prefix),
            symbols: env_list("SYMBOLS", defaults.symbols),
            underlying: env_or("UNDERLYING", defaults.underlying),
            tick_poll_interval: env_secs("TICK_POLL_INTERVAL_SECS", defaults.tick_poll_interval),
            options_poll_interval: env_secs(
                "OPTIONS_POLL_INTERVAL_SECS",
                defaults.options_poll_interval,
            ),
            forecast_poll_interval: env_secs(
                "FORECAST_POLL_INTERVAL_SECS",
                defaults.forecast_poll_interval,
            ),
            risk: RiskConfig {
                max_drawdown_pct: env_parse("MAX_DRAWDOWN_PCT", defaults.risk.max_drawdown_pct),
                max_position_ratio: env_parse(
                    "MAX_POSITION_RATIO",
                    defaults.risk.max_position_ratio,
                ),
                min_position_ratio: env_parse(
                    "MIN_POSITION_RATIO",
                    defaults.risk.min_position_ratio,
                ),
                max_single_position_pct: env_parse(
                    "MAX_SINGLE_POSITION_PCT",
                    defaults.risk.max_single_position_pct,
                ),
                max_gross_leverage: env_parse(
                    "MAX_GROSS_LEVERAGE",
                    defaults.risk.max_gross_leverage,
                ),
                assumed_volatility: env_parse(
                    "ASSUMED_VOLATILITY",
                    defaults.risk.assumed_volatility,
                ),
                risk_free_rate: env_parse("RISK_FREE_RATE", defaults.risk.risk_free_rate),
                check_interval: env_secs("RISK_CHECK_INTERVAL_SECS", defaults.risk.check_interval),
                macro_broadcast_interval: env_secs(
                    "MACRO_BROADCAST_INTERVAL_SECS",
                    defaults.risk.macro_broadcast_interval,
                ),
            },
            sentiment_endpoints: env_list("SENTIMENT_SERVICE_ENDPOINTS", defaults.sentiment_endpoints),
            forecast_endpoints: env_list("STRATEGY_SERVICE_ENDPOINTS", defaults.forecast_endpoints),
            http_timeout: env_secs("API_TIMEOUT_SECS", defaults.http_timeout),
            endpoint_failure_threshold: env_parse(
                "API_PROXY_FAIL_THRESHOLD",
                defaults.endpoint_failure_threshold,
            ),
            endpoint_cooldown: env_secs(
                "API_PROXY_COOLDOWN_SECONDS",
                defaults.endpoint_cooldown,
            ),
            sim_balance_usdt: env_parse("SIM_USDT_BALANCE", defaults.sim_balance_usdt),
        })
    }
}

fn env_or(key: &str, default: String) -> String {
    std::env::var(key).unwrap_or(default)
}

fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|raw| raw.parse().ok())
        .unwrap_or(default)
}

fn env_secs(key: &str, default: Duration) -> Duration {
    std::env::var(key)
        .ok()
        .and_then(|raw| raw.parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or(default)
}

fn env_list(key: &str, default: Vec<String>) -> Vec<String> {
    std::env::var(key)
        .ok()
        .map(|raw| {
            raw.split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect()
        })
        .unwrap_or(default)
}
