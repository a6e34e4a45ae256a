use thiserror::Error;

#[derive(Debug, Error)]
pub enum TradingError {
    #[error("Market data error: {0}")]
    MarketData(String),

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Execution error: {0}")]
    Execution(String),

    #[error("Risk error: {0}")]
    Risk(String),

    #[error("Bus error: {0}")]
    Bus(String),

    #[error("State store error: {0}")]
    State(String),

    #[error("Rate limited: {0}")]
    RateLimited(String),

    #[error("Upstream service error: {0}")]
    Upstream(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Invalid decimal: {0}")]
    Decimal(#[from] rust_decimal::Error),
}

pub type Result<T> = std::result::Result<T, TradingError>;
