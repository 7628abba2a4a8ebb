//! Rule evaluation driving real alert delivery
//!
//! A gauge-backed rule feeds the manager, which posts to a wiremock
//! webhook. Checks the fire/resolve edges end to end, including through the
//! periodic loop.

use beacon_core::alerting::{
    AlertChannel, AlertManager, AlertManagerConfig, AlertRule, AlertRuleEvaluator, AlertSeverity,
    GaugeAbove,
};
use beacon_core::metrics::MetricsRegistry;
use beacon_core::LabelSet;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

async fn webhook() -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/alerts"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;
    server
}

async fn delivered(server: &MockServer) -> Vec<Value> {
    server
        .received_requests()
        .await
        .unwrap_or_default()
        .iter()
        .map(|request| request.body_json::<Value>().unwrap())
        .collect()
}

fn evaluator_for(server: &MockServer) -> Arc<AlertRuleEvaluator> {
    let config = AlertManagerConfig::new(
        "queue",
        vec![AlertChannel::webhook("hook", format!("{}/alerts", server.uri()))],
    );
    Arc::new(AlertRuleEvaluator::new(Arc::new(
        AlertManager::new(config).unwrap(),
    )))
}

#[tokio::test]
async fn test_gauge_rule_fires_and_resolves_once() {
    let server = webhook().await;
    let registry = MetricsRegistry::new("queue");
    let depth = registry.gauge("queue_depth", "Messages waiting").unwrap();
    let partition = LabelSet::from([("partition", "7")]);

    let evaluator = evaluator_for(&server);
    evaluator.add_rule(
        AlertRule::new(
            "backlog",
            AlertSeverity::Critical,
            "Queue backlog",
            GaugeAbove::new(depth.clone(), partition.clone(), 1000.0),
        )
        .with_message("Partition 7 is behind")
        .with_labels(partition.clone()),
    );

    depth.set(10.0, &partition).unwrap();
    evaluator.evaluate().await;
    assert!(delivered(&server).await.is_empty());

    depth.set(5000.0, &partition).unwrap();
    let summary = evaluator.evaluate().await;
    assert_eq!(summary.fired, 1);

    // Still above threshold: no second notification
    depth.set(7000.0, &partition).unwrap();
    let summary = evaluator.evaluate().await;
    assert_eq!(summary.fired, 0);
    assert!(evaluator.rule_state("backlog").unwrap().firing);

    depth.set(0.0, &partition).unwrap();
    let summary = evaluator.evaluate().await;
    assert_eq!(summary.resolved, 1);

    let bodies = delivered(&server).await;
    assert_eq!(bodies.len(), 2);

    assert_eq!(bodies[0]["title"], "Queue backlog");
    assert_eq!(bodies[0]["severity"], "critical");
    assert_eq!(bodies[0]["message"], "Partition 7 is behind");
    assert_eq!(bodies[0]["labels"]["partition"], "7");

    assert_eq!(bodies[1]["title"], "[RESOLVED] Queue backlog");
    assert_eq!(bodies[1]["severity"], "info");
    assert_eq!(bodies[1]["message"], "Partition 7 is behind - Issue resolved");
    assert_eq!(bodies[1]["resolved"], true);
}

#[tokio::test]
async fn test_refire_after_resolve_is_delivered() {
    let server = webhook().await;
    let registry = MetricsRegistry::new("queue");
    let depth = registry.gauge("queue_depth", "Messages waiting").unwrap();

    let evaluator = evaluator_for(&server);
    evaluator.add_rule(AlertRule::new(
        "backlog",
        AlertSeverity::Warning,
        "Queue backlog",
        GaugeAbove::new(depth.clone(), LabelSet::new(), 100.0),
    ));

    for value in [500.0, 0.0, 500.0] {
        depth.set(value, &LabelSet::new()).unwrap();
        evaluator.evaluate().await;
    }

    // fire, resolve, fire again: the resolution cleared the dedup entry
    let titles: Vec<String> = delivered(&server)
        .await
        .iter()
        .map(|body| body["title"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(
        titles,
        vec!["Queue backlog", "[RESOLVED] Queue backlog", "Queue backlog"]
    );
}

#[tokio::test]
async fn test_periodic_loop_delivers_and_stops() {
    let server = webhook().await;
    let registry = MetricsRegistry::new("queue");
    let depth = registry.gauge("queue_depth", "Messages waiting").unwrap();
    depth.set(5000.0, &LabelSet::new()).unwrap();

    let evaluator = evaluator_for(&server);
    evaluator.add_rule(AlertRule::new(
        "backlog",
        AlertSeverity::Critical,
        "Queue backlog",
        GaugeAbove::new(depth.clone(), LabelSet::new(), 1000.0),
    ));

    assert!(evaluator.start(Duration::from_millis(20)));
    assert!(!evaluator.start(Duration::from_millis(20)));
    assert!(evaluator.is_running());

    // The first pass runs immediately; allow a few ticks
    tokio::time::sleep(Duration::from_millis(200)).await;
    evaluator.stop_and_wait().await;
    assert!(!evaluator.is_running());

    // Edge-triggered: many passes, one notification
    assert_eq!(delivered(&server).await.len(), 1);

    depth.set(0.0, &LabelSet::new()).unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(delivered(&server).await.len(), 1);
}
