//! Beacon Core - In-process observability toolkit
//!
//! Beacon gives every service the same three instruments, owned explicitly
//! by the process rather than hidden in globals:
//!
//! ## Core Modules
//! - `core`: Label sets and the error taxonomy
//! - `metrics`: Counters, gauges and histograms keyed by label set, exported
//!   as Prometheus text and JSON
//! - `health`: Concurrent, timeout-bounded health probes rolled into one
//!   service status
//! - `alerting`: Deduplicated, rate-limited alert fan-out to Slack, Discord,
//!   webhooks and email, driven by edge-triggered rules
//! - `server`: HTTP endpoints for scrapers and orchestrators
//! - `config`: Typed configuration with environment overrides
//! - `utils`: Logger setup
//!
//! ## Example
//! ```no_run
//! use beacon_core::prelude::*;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # async fn run() -> anyhow::Result<()> {
//! let registry = MetricsRegistry::new("auth");
//! let in_flight = registry.gauge("http_requests_in_flight", "Requests in flight")?;
//!
//! let alerts = Arc::new(AlertManager::new(AlertManagerConfig::new(
//!     "auth",
//!     vec![AlertChannel::slack("ops", "https://hooks.slack.com/services/T000/B000/XXX")],
//! ))?);
//! let evaluator = Arc::new(AlertRuleEvaluator::new(alerts));
//! evaluator.add_rule(
//!     AlertRule::new(
//!         "overload",
//!         AlertSeverity::Warning,
//!         "Too many requests in flight",
//!         GaugeAbove::new(in_flight, LabelSet::new(), 100.0),
//!     )
//!     .with_message("More than 100 requests in flight"),
//! );
//! evaluator.start(Duration::from_secs(30));
//! # Ok(())
//! # }
//! ```

pub mod alerting;
pub mod config;
pub mod core;
pub mod health;
pub mod metrics;
pub mod server;
pub mod utils;

pub use crate::core::{ConfigError, DispatchError, LabelSet, MetricsError};
pub use alerting::{
    Alert, AlertChannel, AlertManager, AlertManagerConfig, AlertRule, AlertRuleEvaluator,
    AlertSeverity,
};
pub use config::MonitoringConfig;
pub use health::{HealthCheckResult, HealthChecker, HealthStatus, ServiceHealth};
pub use metrics::{MetricsRegistry, ServiceMetrics};
pub use server::{MonitoringServer, ServerConfig};

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::core::{LabelSet, MetricsError};

    pub use crate::metrics::{
        CounterHandle, GaugeHandle, HistogramHandle, MetricsRegistry, ServiceMetrics,
    };

    pub use crate::health::{
        probe_fn, probes, HealthCheckResult, HealthChecker, HealthProbe, HealthStatus,
    };

    pub use crate::alerting::{
        condition_fn, Alert, AlertChannel, AlertCondition, AlertManager, AlertManagerConfig,
        AlertRule, AlertRuleEvaluator, AlertSeverity, GaugeAbove,
    };

    pub use crate::server::{MonitoringServer, ServerConfig};
}
