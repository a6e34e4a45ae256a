//! Round-robin endpoint pool with per-endpoint health tracking.
//!
//! Repeated failures put an endpoint into a cooldown window; selection skips
//! cooling endpoints and falls back to the least-recently-unhealthy one when
//! every endpoint is cooling. An upstream 429 surfaces as
//! [`TradingError::RateLimited`] so callers back off instead of hammering the
//! next endpoint.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::warn;

use crate::error::{Result, TradingError};

#[derive(Debug, Clone)]
struct Endpoint {
    base_url: String,
    failure_count: u32,
    unhealthy_until: Option<Instant>,
}

impl Endpoint {
    fn available(&self, now: Instant) -> bool {
        self.unhealthy_until.map(|until| until <= now).unwrap_or(true)
    }
}

#[derive(Debug)]
struct PoolState {
    endpoints: Vec<Endpoint>,
    cursor: usize,
}

pub struct EndpointPool {
    service: String,
    state: Mutex<PoolState>,
    client: reqwest::Client,
    failure_threshold: u32,
    cooldown: Duration,
}

impl EndpointPool {
    pub fn new(
        service: impl Into<String>,
        endpoints: &[String],
        timeout: Duration,
        failure_threshold: u32,
        cooldown: Duration,
    ) -> Result<Self> {
        let mut unique: Vec<Endpoint> = Vec::new();
        for endpoint in endpoints {
            let normalized = endpoint.trim_end_matches('/').to_string();
            if normalized.is_empty() || unique.iter().any(|e| e.base_url == normalized) {
                continue;
            }
            unique.push(Endpoint {
                base_url: normalized,
                failure_count: 0,
                unhealthy_until: None,
            });
        }
        if unique.is_empty() {
            return Err(TradingError::Config(
                "Endpoint pool requires at least one endpoint".to_string(),
            ));
        }
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(TradingError::Network)?;
        Ok(Self {
            service: service.into(),
            state: Mutex::new(PoolState { endpoints: unique, cursor: 0 }),
            client,
            failure_threshold,
            cooldown,
        })
    }

    fn endpoint_count(&self) -> usize {
        self.state.lock().unwrap().endpoints.len()
    }

    /// Round-robin pick skipping cooling endpoints; if every endpoint is
    /// cooling, the one whose cooldown expires first.
    fn next_endpoint(&self) -> String {
        let mut state = self.state.lock().unwrap();
        let now = Instant::now();
        let total = state.endpoints.len();
        for _ in 0..total {
            let idx = state.cursor;
            state.cursor = (state.cursor + 1) % total;
            if state.endpoints[idx].available(now) {
                return state.endpoints[idx].base_url.clone();
            }
        }
        state
            .endpoints
            .iter()
            .min_by_key(|e| e.unhealthy_until.unwrap_or(now))
            .map(|e| e.base_url.clone())
            .unwrap()
    }

    fn register_success(&self, base_url: &str) {
        let mut state = self.state.lock().unwrap();
        if let Some(endpoint) = state.endpoints.iter_mut().find(|e| e.base_url == base_url) {
            endpoint.failure_count = 0;
            endpoint.unhealthy_until = None;
        }
    }

    fn register_failure(&self, base_url: &str) {
        let mut state = self.state.lock().unwrap();
        if let Some(endpoint) = state.endpoints.iter_mut().find(|e| e.base_url == base_url) {
            endpoint.failure_count += 1;
            if endpoint.failure_count >= self.failure_threshold {
                endpoint.unhealthy_until = Some(Instant::now() + self.cooldown);
                endpoint.failure_count = 0;
                warn!(
                    service = %self.service,
                    endpoint = %base_url,
                    cooldown_secs = self.cooldown.as_secs(),
                    "endpoint marked unhealthy"
                );
            }
        }
    }

    /// Endpoint health for observability.
    pub fn health_snapshot(&self) -> Vec<(String, bool)> {
        let state = self.state.lock().unwrap();
        let now = Instant::now();
        state
            .endpoints
            .iter()
            .map(|e| (e.base_url.clone(), e.available(now)))
            .collect()
    }

    pub async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T> {
        let attempts = self.endpoint_count();
        let mut last_err = None;
        for _ in 0..attempts {
            let base = self.next_endpoint();
            let url = Self::join(&base, path);
            let sent = self.client.get(&url).query(query).send().await;
            match self.handle_response(&base, sent).await {
                Ok(value) => return Ok(value),
                Err(err @ TradingError::RateLimited(_)) => return Err(err),
                Err(err) => last_err = Some(err),
            }
        }
        Err(self.exhausted(last_err))
    }

    pub async fn post_json<B: Serialize, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T> {
        let attempts = self.endpoint_count();
        let mut last_err = None;
        for _ in 0..attempts {
            let base = self.next_endpoint();
            let url = Self::join(&base, path);
            let sent = self.client.post(&url).json(body).send().await;
            match self.handle_response(&base, sent).await {
                Ok(value) => return Ok(value),
                Err(err @ TradingError::RateLimited(_)) => return Err(err),
                Err(err) => last_err = Some(err),
            }
        }
        Err(self.exhausted(last_err))
    }

    async fn handle_response<T: DeserializeOwned>(
        &self,
        base: &str,
        sent: std::result::Result<reqwest::Response, reqwest::Error>,
    ) -> Result<T> {
        match sent {
            Ok(response) if response.status() == StatusCode::TOO_MANY_REQUESTS => Err(
                TradingError::RateLimited(format!("{} for {}", base, self.service)),
            ),
            Ok(response) => {
                let status = response.status();
                if !status.is_success() {
                    self.register_failure(base);
                    return Err(TradingError::Upstream(format!(
                        "{} returned {status} for {}",
                        base, self.service
                    )));
                }
                match response.json::<T>().await {
                    Ok(value) => {
                        self.register_success(base);
                        Ok(value)
                    }
                    Err(err) => {
                        self.register_failure(base);
                        Err(TradingError::Network(err))
                    }
                }
            }
            Err(err) => {
                self.register_failure(base);
                Err(TradingError::Network(err))
            }
        }
    }

    fn exhausted(&self, last_err: Option<TradingError>) -> TradingError {
        last_err.unwrap_or_else(|| {
            TradingError::Upstream(format!("All endpoints failed for {}", self.service))
        })
    }

    fn join(base: &str, path: &str) -> String {
        format!("{}/{}", base, path.trim_start_matches('/'))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(urls: &[&str]) -> EndpointPool {
        let endpoints: Vec<String> = urls.iter().map(|s| s.to_string()).collect();
        EndpointPool::new(
            "test",
            &endpoints,
            Duration::from_secs(1),
            2,
            Duration::from_secs(60),
        )
        .unwrap()
    }

    #[test]
    fn rejects_empty_endpoint_list() {
        assert!(EndpointPool::new(
            "test",
            &[],
            Duration::from_secs(1),
            2,
            Duration::from_secs(60),
        )
        .is_err());
    }

    #[test]
    fn deduplicates_and_normalizes() {
        let p = pool(&["http://a:8000/", "http://a:8000", "http://b:8000"]);
        assert_eq!(p.endpoint_count(), 2);
    }

    #[test]
    fn round_robin_rotation() {
        let p = pool(&["http://a", "http://b"]);
        assert_eq!(p.next_endpoint(), "http://a");
        assert_eq!(p.next_endpoint(), "http://b");
        assert_eq!(p.next_endpoint(), "http://a");
    }

    #[test]
    fn failures_put_endpoint_on_cooldown() {
        let p = pool(&["http://a", "http://b"]);
        p.register_failure("http://a");
        p.register_failure("http://a");
        let health = p.health_snapshot();
        assert_eq!(health[0], ("http://a".to_string(), false));
        assert_eq!(health[1], ("http://b".to_string(), true));
        // Selection now skips the cooling endpoint.
        assert_eq!(p.next_endpoint(), "http://b");
        assert_eq!(p.next_endpoint(), "http://b");
    }

    #[test]
    fn all_cooling_falls_back_to_least_recently_unhealthy() {
        let p = pool(&["http://a", "http://b"]);
        for url in ["http://a", "http://a", "http://b", "http://b"] {
            p.register_failure(url);
        }
        // a went unhealthy first, so its cooldown expires first.
        assert_eq!(p.next_endpoint(), "http://a");
    }

    #[test]
    fn success_clears_cooldown() {
        let p = pool(&["http://a"]);
        p.register_failure("http://a");
        p.register_failure("http://a");
        p.register_success("http://a");
        assert_eq!(p.health_snapshot()[0].1, true);
    }
}
