//! Client for the external sentiment service.

use serde::Deserialize;
use tracing::debug;

use crate::error::{Result, TradingError};

use super::proxy_pool::EndpointPool;

#[derive(Debug, Clone, Deserialize)]
pub struct SentimentResponse {
    pub weighted_score: f64,
    #[serde(default)]
    pub overall_sentiment: Option<String>,
    #[serde(default)]
    pub tweets_analyzed: Option<u64>,
}

pub struct SentimentClient {
    pool: EndpointPool,
    query: String,
    max_results: u32,
}

impl SentimentClient {
    pub fn new(pool: EndpointPool, query: impl Into<String>, max_results: u32) -> Self {
        Self {
            pool,
            query: query.into(),
            max_results,
        }
    }

    /// Weighted sentiment score in [-1, 1], or `None` when the service is
    /// unreachable. Rate limiting is surfaced so callers can back off.
    pub async fn fetch_score(&self) -> Result<Option<f64>> {
        let query = [
            ("query", self.query.clone()),
            ("max_results", self.max_results.to_string()),
        ];
        match self
            .pool
            .get_json::<SentimentResponse>("/api/v1/sentiment/twitter", &query)
            .await
        {
            Ok(response) => Ok(Some(response.weighted_score)),
            Err(err @ TradingError::RateLimited(_)) => Err(err),
            Err(err) => {
                debug!(%err, "sentiment fetch failed");
                Ok(None)
            }
        }
    }
}
