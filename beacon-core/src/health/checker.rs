//! Concurrent, timeout-bounded health checks
//!
//! Probes are registered once by name. Every [`HealthChecker::check`] runs all
//! of them in parallel on the tokio runtime, each raced against the probe
//! timeout, and folds the results into one [`ServiceHealth`]. Nothing is
//! cached between calls.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinError;
use tokio::time::{error::Elapsed, Instant};
use tracing::{debug, warn};

/// Default per-probe timeout
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_millis(5000);

/// Message recorded for a probe that did not finish in time
pub const TIMEOUT_MESSAGE: &str = "Health check timeout";

/// Three-level health, ordered by severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::Unhealthy => "unhealthy",
        }
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one probe
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthCheckResult {
    pub name: String,
    pub status: HealthStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Wall-clock duration of the probe; absent when it timed out
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
    pub timestamp: DateTime<Utc>,
}

impl HealthCheckResult {
    pub fn new(name: impl Into<String>, status: HealthStatus) -> Self {
        Self {
            name: name.into(),
            status,
            message: None,
            latency_ms: None,
            timestamp: Utc::now(),
        }
    }

    pub fn healthy(name: impl Into<String>) -> Self {
        Self::new(name, HealthStatus::Healthy)
    }

    pub fn degraded(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(name, HealthStatus::Degraded).with_message(message)
    }

    pub fn unhealthy(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(name, HealthStatus::Unhealthy).with_message(message)
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

/// Aggregated health of the whole service
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceHealth {
    pub service: String,
    pub version: String,
    pub status: HealthStatus,
    pub uptime_seconds: u64,
    pub timestamp: DateTime<Utc>,
    pub checks: Vec<HealthCheckResult>,
}

/// Liveness answer, produced without running any probe
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Liveness {
    pub status: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Readiness {
    pub ready: bool,
    pub checks: Vec<HealthCheckResult>,
}

/// A named health probe.
///
/// Returning `Err` records the probe as unhealthy with the error's message.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn check(&self) -> anyhow::Result<HealthCheckResult>;
}

/// Adapter turning an async closure into a [`HealthProbe`]
pub struct FnProbe<F>(F);

#[async_trait]
impl<F, Fut> HealthProbe for FnProbe<F>
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<HealthCheckResult>> + Send + 'static,
{
    async fn check(&self) -> anyhow::Result<HealthCheckResult> {
        (self.0)().await
    }
}

/// Wrap an async closure as a probe
pub fn probe_fn<F, Fut>(f: F) -> FnProbe<F>
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<HealthCheckResult>> + Send + 'static,
{
    FnProbe(f)
}

type ProbeOutcome = (Result<anyhow::Result<HealthCheckResult>, Elapsed>, Duration);

/// Registry of probes for one service
pub struct HealthChecker {
    service: String,
    version: String,
    started_at: Instant,
    probe_timeout: Duration,
    checks: RwLock<Vec<(String, Arc<dyn HealthProbe>)>>,
}

impl HealthChecker {
    pub fn new(service: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            version: version.into(),
            started_at: Instant::now(),
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
            checks: RwLock::new(Vec::new()),
        }
    }

    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    /// Register a probe. A second registration under the same name replaces
    /// the first and keeps its position in the report.
    pub fn add_check(&self, name: impl Into<String>, probe: impl HealthProbe + 'static) {
        let name = name.into();
        let probe: Arc<dyn HealthProbe> = Arc::new(probe);
        let mut checks = self.checks.write();

        match checks.iter_mut().find(|(existing, _)| *existing == name) {
            Some(slot) => {
                debug!(check = %name, "health check replaced");
                slot.1 = probe;
            }
            None => {
                debug!(check = %name, "health check registered");
                checks.push((name, probe));
            }
        }
    }

    pub fn check_names(&self) -> Vec<String> {
        self.checks.read().iter().map(|(name, _)| name.clone()).collect()
    }

    /// Run every probe concurrently and aggregate.
    ///
    /// Never fails: timeouts, errors and panics become unhealthy results.
    /// Returns within roughly one probe timeout regardless of probe count.
    pub async fn check(&self) -> ServiceHealth {
        let probes = self.checks.read().clone();
        let timeout = self.probe_timeout;

        let handles: Vec<_> = probes
            .iter()
            .map(|(_, probe)| {
                let probe = Arc::clone(probe);
                // Dropping the timed-out future cancels the probe
                tokio::spawn(async move {
                    let start = Instant::now();
                    let outcome = tokio::time::timeout(timeout, probe.check()).await;
                    (outcome, start.elapsed())
                })
            })
            .collect();

        let outcomes = join_all(handles).await;

        let checks: Vec<HealthCheckResult> = probes
            .into_iter()
            .zip(outcomes)
            .map(|((name, _), joined)| settle(name, joined))
            .collect();

        let status = checks
            .iter()
            .map(|result| result.status)
            .max()
            .unwrap_or(HealthStatus::Healthy);

        ServiceHealth {
            service: self.service.clone(),
            version: self.version.clone(),
            status,
            uptime_seconds: self.started_at.elapsed().as_secs(),
            timestamp: Utc::now(),
            checks,
        }
    }

    pub fn liveness(&self) -> Liveness {
        Liveness {
            status: "ok".to_string(),
            timestamp: Utc::now(),
        }
    }

    /// Ready unless the service is unhealthy; degraded still serves traffic
    pub async fn readiness(&self) -> Readiness {
        let health = self.check().await;
        Readiness {
            ready: health.status != HealthStatus::Unhealthy,
            checks: health.checks,
        }
    }
}

impl fmt::Debug for HealthChecker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HealthChecker")
            .field("service", &self.service)
            .field("version", &self.version)
            .field("probe_timeout", &self.probe_timeout)
            .field("checks", &self.check_names())
            .finish()
    }
}

fn settle(name: String, joined: Result<ProbeOutcome, JoinError>) -> HealthCheckResult {
    let (outcome, elapsed) = match joined {
        Ok(done) => done,
        Err(err) => {
            warn!(check = %name, error = %err, "health check task panicked");
            return HealthCheckResult::unhealthy(name, format!("Health check panicked: {err}"));
        }
    };

    let latency_ms = Some(elapsed.as_millis() as u64);
    match outcome {
        Ok(Ok(mut result)) => {
            result.name = name;
            result.latency_ms = latency_ms;
            result
        }
        Ok(Err(err)) => {
            warn!(check = %name, error = %err, "health check failed");
            let mut result = HealthCheckResult::unhealthy(name, format!("{err:#}"));
            result.latency_ms = latency_ms;
            result
        }
        Err(_) => {
            warn!(check = %name, timeout_ms = elapsed.as_millis() as u64, "health check timed out");
            HealthCheckResult::unhealthy(name, TIMEOUT_MESSAGE)
        }
    }
}
