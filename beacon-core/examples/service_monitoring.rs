//! Service Monitoring Example
//!
//! Demonstrates the full setup for one service:
//! - Metrics registry with the default HTTP metrics
//! - Health checks with a custom and a stock probe
//! - Alert manager and an edge-triggered rule on a gauge
//! - Prometheus text export
//!
//! Alerts go to an email channel, which needs no network, so the example
//! runs anywhere.

use beacon_core::prelude::*;
use beacon_core::utils::init_logger;
use std::sync::Arc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logger("info", false)?;

    // ===================================================================
    // STEP 1: Metrics
    // ===================================================================
    println!("Setting up metrics...");

    let registry = MetricsRegistry::new("orders");
    let service = ServiceMetrics::new(&registry)?;
    service.record_request("GET", "/orders", 200, 0.012)?;
    service.record_request("POST", "/orders", 201, 0.087)?;
    service.record_request("POST", "/orders", 503, 2.4)?;

    let queue_depth = registry.gauge("queue_depth", "Orders waiting for fulfilment")?;
    println!("   registered: {:?}\n", registry.metric_names());

    // ===================================================================
    // STEP 2: Health checks
    // ===================================================================
    println!("Running health checks...");

    let health = Arc::new(HealthChecker::new("orders", "1.4.0"));
    health.add_check("database", probes::database("database", || async { Ok(()) }));
    health.add_check("disk", probes::disk_space("disk", "/", probes::DEFAULT_THRESHOLD_PERCENT));

    let report = health.check().await;
    println!("   overall: {}", report.status);
    for check in &report.checks {
        println!(
            "   - {}: {} ({})",
            check.name,
            check.status,
            check.message.as_deref().unwrap_or("-")
        );
    }
    println!();

    // ===================================================================
    // STEP 3: Alerting
    // ===================================================================
    println!("Evaluating alert rules...");

    let alerts = Arc::new(AlertManager::new(AlertManagerConfig::new(
        "orders",
        vec![AlertChannel::email("oncall")],
    ))?);
    let evaluator = AlertRuleEvaluator::new(Arc::clone(&alerts));
    evaluator.add_rule(
        AlertRule::new(
            "fulfilment_backlog",
            AlertSeverity::Warning,
            "Fulfilment backlog",
            GaugeAbove::new(queue_depth.clone(), LabelSet::new(), 250.0),
        )
        .with_message("More than 250 orders waiting"),
    );

    for depth in [40.0, 300.0, 420.0, 10.0] {
        queue_depth.set(depth, &LabelSet::new())?;
        let summary = evaluator.evaluate().await;
        println!(
            "   depth {:>5}: fired={} resolved={}",
            depth, summary.fired, summary.resolved
        );
    }
    println!();

    // ===================================================================
    // STEP 4: Export
    // ===================================================================
    println!("Prometheus exposition:\n");
    print!("{}", registry.export()?);

    Ok(())
}
