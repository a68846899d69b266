//! Remote service health monitoring
//!
//! Background liveness probes of the inference services with a three-strike
//! circuit breaker. The breaker is informational: stages keep attempting
//! (and retrying) against a FAILED service; the monitor only feeds the
//! `/health` surface and the logs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::pipeline::CancelToken;

/// Consecutive failures at which a service is marked FAILED.
const FAILURE_THRESHOLD: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceId {
    Stt,
    Llm,
    TtsPrimary,
    TtsFallback,
}

impl ServiceId {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceId::Stt => "stt",
            ServiceId::Llm => "llm",
            ServiceId::TtsPrimary => "tts_primary",
            ServiceId::TtsFallback => "tts_fallback",
        }
    }
}

impl FromStr for ServiceId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "stt" => Ok(ServiceId::Stt),
            "llm" => Ok(ServiceId::Llm),
            "tts_primary" => Ok(ServiceId::TtsPrimary),
            "tts_fallback" => Ok(ServiceId::TtsFallback),
            other => Err(format!("unknown service id: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ServiceState {
    Healthy,
    Degraded,
    Failed,
}

/// Probe-derived status for one service.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceHealth {
    pub service_id: ServiceId,
    pub state: ServiceState,
    pub failure_count: u32,
    pub last_check: Option<DateTime<Utc>>,
    pub last_success: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub latency_ms: Option<u64>,
}

impl ServiceHealth {
    fn new(service_id: ServiceId) -> Self {
        Self {
            service_id,
            state: ServiceState::Healthy,
            failure_count: 0,
            last_check: None,
            last_success: None,
            last_error: None,
            latency_ms: None,
        }
    }

    fn record_success(&mut self, latency_ms: u64) {
        let now = Utc::now();
        self.state = ServiceState::Healthy;
        self.failure_count = 0;
        self.last_check = Some(now);
        self.last_success = Some(now);
        self.last_error = None;
        self.latency_ms = Some(latency_ms);
    }

    fn record_failure(&mut self, error: String) {
        self.failure_count += 1;
        self.last_check = Some(Utc::now());
        self.last_error = Some(error);
        self.state = if self.failure_count >= FAILURE_THRESHOLD {
            ServiceState::Failed
        } else {
            ServiceState::Degraded
        };
    }

    fn reset(&mut self) {
        self.state = ServiceState::Healthy;
        self.failure_count = 0;
        self.last_error = None;
    }
}

/// Periodic prober of every configured inference endpoint.
pub struct HealthMonitor {
    client: reqwest::Client,
    interval: Duration,
    probe_timeout: Duration,
    targets: Vec<(ServiceId, String)>,
    states: RwLock<HashMap<ServiceId, ServiceHealth>>,
}

impl HealthMonitor {
    pub fn new(config: &Config) -> Self {
        let mut targets = vec![
            (ServiceId::Stt, config.asr.endpoint.clone()),
            (ServiceId::Llm, config.llm.endpoint.clone()),
            (ServiceId::TtsPrimary, config.tts.endpoint.clone()),
        ];
        if let Some(fallback) = &config.tts.fallback_endpoint {
            targets.push((ServiceId::TtsFallback, fallback.clone()));
        }

        let states = targets
            .iter()
            .map(|(id, _)| (*id, ServiceHealth::new(*id)))
            .collect();

        Self {
            client: reqwest::Client::new(),
            interval: Duration::from_secs(config.health.check_interval_secs),
            probe_timeout: Duration::from_secs(config.health.probe_timeout_secs),
            targets,
            states: RwLock::new(states),
        }
    }

    /// Probe every service once and fold the outcomes into the breaker.
    pub async fn probe_all(&self) {
        for (service_id, endpoint) in &self.targets {
            let outcome = self.probe(endpoint).await;
            let mut states = self.states.write().await;
            let health = states
                .entry(*service_id)
                .or_insert_with(|| ServiceHealth::new(*service_id));
            match outcome {
                Ok(latency_ms) => {
                    if health.state != ServiceState::Healthy {
                        info!(service = service_id.as_str(), "Service recovered");
                    }
                    health.record_success(latency_ms);
                }
                Err(error) => {
                    health.record_failure(error.clone());
                    warn!(
                        service = service_id.as_str(),
                        failures = health.failure_count,
                        state = ?health.state,
                        "Health probe failed: {}", error
                    );
                }
            }
        }
    }

    async fn probe(&self, endpoint: &str) -> Result<u64, String> {
        let started = Instant::now();
        let response = self
            .client
            .get(format!("{}/health", endpoint))
            .timeout(self.probe_timeout)
            .send()
            .await
            .map_err(|e| e.to_string())?;

        if response.status().is_success() {
            Ok(started.elapsed().as_millis() as u64)
        } else {
            Err(format!("probe returned {}", response.status()))
        }
    }

    /// Probe loop; runs until cancelled.
    pub async fn run(self: Arc<Self>, cancel: CancelToken) {
        info!(
            interval_secs = self.interval.as_secs(),
            services = self.targets.len(),
            "Health monitor started"
        );
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.interval) => {}
            }
            self.probe_all().await;
        }
        debug!("Health monitor stopped");
    }

    /// Admin reset: force HEALTHY and zero the counters.
    pub async fn reset(&self, service_id: ServiceId) -> bool {
        let mut states = self.states.write().await;
        match states.get_mut(&service_id) {
            Some(health) => {
                health.reset();
                info!(service = service_id.as_str(), "Service state reset");
                true
            }
            None => false,
        }
    }

    pub async fn snapshot(&self) -> Vec<ServiceHealth> {
        let states = self.states.read().await;
        let mut all: Vec<ServiceHealth> = states.values().cloned().collect();
        all.sort_by_key(|h| h.service_id.as_str());
        all
    }

    /// True while no service sits in the FAILED state.
    pub async fn overall_healthy(&self) -> bool {
        self.states
            .read()
            .await
            .values()
            .all(|h| h.state != ServiceState::Failed)
    }
}
