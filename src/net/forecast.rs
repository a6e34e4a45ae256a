//! Client and bus adapter for the volatility-forecast service.
//!
//! The service speaks the richer contract: `macro_regime` is optional in the
//! request and mirrored back with a regime score in the response, so callers
//! built against the older shape keep working.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::bus::{publish_event, streams, BusItem, MessageBus};
use crate::error::Result;
use crate::events::{MacroState, VolatilityForecast};

use super::proxy_pool::EndpointPool;

#[derive(Debug, Clone, Serialize)]
pub struct ForecastRequest {
    pub sentiment_score_lag1: f64,
    pub volatility_lag1: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub macro_regime: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ForecastResponse {
    pub predicted_volatility: f64,
    pub recommended_grid_size: f64,
    pub confidence_level: f64,
    #[serde(default)]
    pub macro_regime: Option<String>,
    #[serde(default)]
    pub regime_score: Option<f64>,
}

pub struct ForecastClient {
    pool: EndpointPool,
}

impl ForecastClient {
    pub fn new(pool: EndpointPool) -> Self {
        Self { pool }
    }

    pub async fn fetch_dynamic_parameters(
        &self,
        request: &ForecastRequest,
    ) -> Result<ForecastResponse> {
        self.pool
            .post_json("/api/v1/predict/dynamic-parameters", request)
            .await
    }
}

/// Bridges the forecast service onto `strategy.forecast.volatility`.
///
/// Lag features come from the macro-state broadcast; the previous prediction
/// seeds `volatility_lag1` until real samples arrive.
pub struct ForecastPoller {
    bus: Arc<dyn MessageBus>,
    client: Arc<ForecastClient>,
    underlying: String,
    horizon: String,
    poll_interval: Duration,
    running: Arc<AtomicBool>,
    tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl ForecastPoller {
    pub fn new(
        bus: Arc<dyn MessageBus>,
        client: Arc<ForecastClient>,
        underlying: impl Into<String>,
        horizon: impl Into<String>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            bus,
            client,
            underlying: underlying.into(),
            horizon: horizon.into(),
            poll_interval,
            running: Arc::new(AtomicBool::new(false)),
            tasks: std::sync::Mutex::new(Vec::new()),
        }
    }

    pub async fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(underlying = %self.underlying, "forecast poller starting");

        let macro_state: Arc<std::sync::Mutex<Option<MacroState>>> =
            Arc::new(std::sync::Mutex::new(None));

        // Track the latest macro broadcast for lag features.
        {
            let bus = Arc::clone(&self.bus);
            let running = Arc::clone(&self.running);
            let macro_state = Arc::clone(&macro_state);
            let task = tokio::spawn(async move {
                let mut sub = match bus.subscribe_multiple(&[streams::MARKET_MACRO_STATE]).await {
                    Ok(sub) => sub,
                    Err(err) => {
                        warn!(%err, "forecast poller could not subscribe to macro state");
                        return;
                    }
                };
                while running.load(Ordering::SeqCst) {
                    match sub.next().await {
                        Ok(Some(BusItem::Event(event))) => {
                            match crate::bus::decode_event::<MacroState>(event.payload) {
                                Ok(state) => {
                                    *macro_state.lock().unwrap() = Some(state);
                                }
                                Err(err) => debug!(%err, "ignoring malformed macro state"),
                            }
                        }
                        Ok(Some(BusItem::KeepAlive)) => continue,
                        Ok(None) => break,
                        Err(err) => {
                            warn!(%err, "macro state subscription error");
                        }
                    }
                }
            });
            self.tasks.lock().unwrap().push(task);
        }

        // Poll the service and publish forecasts.
        {
            let bus = Arc::clone(&self.bus);
            let client = Arc::clone(&self.client);
            let running = Arc::clone(&self.running);
            let underlying = self.underlying.clone();
            let horizon = self.horizon.clone();
            let interval = self.poll_interval;
            let task = tokio::spawn(async move {
                let mut volatility_lag = 0.5;
                while running.load(Ordering::SeqCst) {
                    let (sentiment_lag, regime) = {
                        let state = macro_state.lock().unwrap();
                        (
                            state.as_ref().and_then(|s| s.sentiment_score).unwrap_or(0.0),
                            state.as_ref().map(|s| s.regime.as_str().to_string()),
                        )
                    };
                    let request = ForecastRequest {
                        sentiment_score_lag1: sentiment_lag,
                        volatility_lag1: volatility_lag,
                        macro_regime: regime,
                    };
                    match client.fetch_dynamic_parameters(&request).await {
                        Ok(response) => {
                            volatility_lag = response.predicted_volatility;
                            let forecast = VolatilityForecast {
                                underlying: underlying.clone(),
                                horizon: horizon.clone(),
                                predicted_volatility: response.predicted_volatility,
                                confidence: response.confidence_level,
                                model_version: "glm-gamma".to_string(),
                                timestamp: chrono::Utc::now(),
                            };
                            if let Err(err) = publish_event(
                                bus.as_ref(),
                                streams::STRATEGY_FORECAST_VOLATILITY,
                                &forecast,
                            )
                            .await
                            {
                                warn!(%err, "failed to publish volatility forecast");
                            }
                        }
                        Err(err) => debug!(%err, "forecast fetch failed"),
                    }
                    tokio::time::sleep(interval).await;
                }
            });
            self.tasks.lock().unwrap().push(task);
        }
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
        info!("forecast poller stopped");
    }
}
