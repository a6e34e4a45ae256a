//! HTTP collaborators: endpoint pool with health tracking, sentiment service
//! client and volatility-forecast service client.

pub mod forecast;
pub mod proxy_pool;
pub mod sentiment;

pub use forecast::{ForecastClient, ForecastPoller, ForecastRequest, ForecastResponse};
pub use proxy_pool::EndpointPool;
pub use sentiment::SentimentClient;
