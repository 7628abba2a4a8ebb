//! Beacon monitoring agent
//!
//! Wires the full stack for one service:
//! - MetricsRegistry with the default HTTP metrics
//! - HealthChecker with the built-in resource probes
//! - AlertManager fanning out to the configured channels
//! - AlertRuleEvaluator watching the in-flight request gauge
//! - HTTP server exposing /metrics and /health
//!
//! Runs until Ctrl+C.

use anyhow::{Context, Result};
use beacon_bins::common::{init_logging, CommonArgs};
use beacon_core::alerting::{AlertManager, AlertRule, AlertRuleEvaluator, AlertSeverity, GaugeAbove};
use beacon_core::health::{probe_fn, probes, HealthCheckResult, HealthChecker};
use beacon_core::metrics::{MetricsRegistry, ServiceMetrics};
use beacon_core::server::MonitoringServer;
use beacon_core::LabelSet;
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;

/// In-flight requests above which the overload rule fires
const IN_FLIGHT_THRESHOLD: f64 = 500.0;

#[tokio::main]
async fn main() -> Result<()> {
    let args = CommonArgs::parse();
    let config = args.load_config()?;
    init_logging(&config)?;

    tracing::info!("=== Beacon agent: {} v{} ===", config.service, config.version);

    let registry = MetricsRegistry::new(&config.service);
    let service_metrics = ServiceMetrics::new(&registry).context("Failed to register service metrics")?;

    let health = Arc::new(
        HealthChecker::new(config.service.as_str(), config.version.as_str())
            .with_probe_timeout(config.health.probe_timeout()),
    );
    health.add_check("memory", probes::memory("memory", probes::DEFAULT_THRESHOLD_PERCENT));
    health.add_check(
        "disk",
        probes::disk_space("disk", ".", probes::DEFAULT_THRESHOLD_PERCENT),
    );
    let channel_count = config.alerts.channels.len();
    health.add_check(
        "alert_channels",
        probe_fn(move || async move {
            Ok(if channel_count == 0 {
                HealthCheckResult::degraded("alert_channels", "No alert channels configured")
            } else {
                HealthCheckResult::healthy("alert_channels")
                    .with_message(format!("{channel_count} channel(s) configured"))
            })
        }),
    );

    let alert_manager = Arc::new(
        AlertManager::new(config.alert_manager_config()).context("Failed to build alert manager")?,
    );

    let evaluator = Arc::new(AlertRuleEvaluator::new(Arc::clone(&alert_manager)));
    let in_flight = service_metrics.http_requests_in_flight.clone();
    evaluator.add_rule(
        AlertRule::new(
            "http_overload",
            AlertSeverity::Warning,
            "HTTP overload",
            GaugeAbove::new(in_flight.clone(), LabelSet::new(), IN_FLIGHT_THRESHOLD),
        )
        .with_dynamic_message(move || {
            format!(
                "{} requests in flight (threshold {})",
                in_flight.get(&LabelSet::new()),
                IN_FLIGHT_THRESHOLD
            )
        })
        .with_check_interval(Duration::from_secs(60)),
    );
    evaluator.start(config.rules.evaluation_interval());

    let server = MonitoringServer::new(config.server_config(), registry, Arc::clone(&health));
    let served = server
        .serve_with_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for Ctrl+C: {}", e);
                std::future::pending::<()>().await;
            }
        })
        .await;

    evaluator.stop_and_wait().await;
    tracing::info!("Beacon agent stopped");
    served
}
