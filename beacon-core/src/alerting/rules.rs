//! Alert rules engine
//!
//! A rule pairs a condition with alert metadata. Evaluation is
//! edge-triggered: the manager hears about a rule only when its condition
//! flips, `alert()` on false -> true and `resolve()` on true -> false.
//! A rule that keeps firing is not re-announced.

use super::alert::AlertSeverity;
use super::manager::AlertManager;
use crate::core::LabelSet;
use crate::metrics::GaugeHandle;
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Default period of the evaluation loop
pub const DEFAULT_EVALUATION_INTERVAL: Duration = Duration::from_secs(30);

/// Suffix appended to the rule message when it resolves
pub const RESOLVED_SUFFIX: &str = " - Issue resolved";

/// Predicate deciding whether a rule fires
#[async_trait]
pub trait AlertCondition: Send + Sync {
    async fn is_firing(&self) -> anyhow::Result<bool>;
}

/// Adapter turning an async closure into an [`AlertCondition`]
pub struct FnCondition<F>(F);

#[async_trait]
impl<F, Fut> AlertCondition for FnCondition<F>
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<bool>> + Send + 'static,
{
    async fn is_firing(&self) -> anyhow::Result<bool> {
        (self.0)().await
    }
}

pub fn condition_fn<F, Fut>(f: F) -> FnCondition<F>
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<bool>> + Send + 'static,
{
    FnCondition(f)
}

/// Fires while a gauge series is strictly above `threshold`
pub struct GaugeAbove {
    gauge: GaugeHandle,
    labels: LabelSet,
    threshold: f64,
}

impl GaugeAbove {
    pub fn new(gauge: GaugeHandle, labels: LabelSet, threshold: f64) -> Self {
        Self {
            gauge,
            labels,
            threshold,
        }
    }
}

#[async_trait]
impl AlertCondition for GaugeAbove {
    async fn is_firing(&self) -> anyhow::Result<bool> {
        Ok(self.gauge.get(&self.labels) > self.threshold)
    }
}

/// Rule message, fixed or rendered at notification time
#[derive(Clone)]
pub enum RuleMessage {
    Static(String),
    Dynamic(Arc<dyn Fn() -> String + Send + Sync>),
}

impl RuleMessage {
    pub fn render(&self) -> String {
        match self {
            Self::Static(message) => message.clone(),
            Self::Dynamic(produce) => produce(),
        }
    }
}

impl fmt::Debug for RuleMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Static(message) => f.debug_tuple("Static").field(message).finish(),
            Self::Dynamic(_) => f.write_str("Dynamic(..)"),
        }
    }
}

/// Condition plus the alert it raises
#[derive(Clone)]
pub struct AlertRule {
    name: String,
    severity: AlertSeverity,
    title: String,
    message: RuleMessage,
    check_interval: Duration,
    labels: LabelSet,
    condition: Arc<dyn AlertCondition>,
}

impl AlertRule {
    /// New rule with an empty message, no labels and no minimum check
    /// interval (evaluated on every pass)
    pub fn new(
        name: impl Into<String>,
        severity: AlertSeverity,
        title: impl Into<String>,
        condition: impl AlertCondition + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            severity,
            title: title.into(),
            message: RuleMessage::Static(String::new()),
            check_interval: Duration::ZERO,
            labels: LabelSet::new(),
            condition: Arc::new(condition),
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = RuleMessage::Static(message.into());
        self
    }

    pub fn with_dynamic_message<F>(mut self, produce: F) -> Self
    where
        F: Fn() -> String + Send + Sync + 'static,
    {
        self.message = RuleMessage::Dynamic(Arc::new(produce));
        self
    }

    /// Minimum time between two evaluations of this rule
    pub fn with_check_interval(mut self, interval: Duration) -> Self {
        self.check_interval = interval;
        self
    }

    pub fn with_labels(mut self, labels: LabelSet) -> Self {
        self.labels = labels;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn severity(&self) -> AlertSeverity {
        self.severity
    }

    pub fn title(&self) -> &str {
        &self.title
    }
}

impl fmt::Debug for AlertRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AlertRule")
            .field("name", &self.name)
            .field("severity", &self.severity)
            .field("title", &self.title)
            .field("message", &self.message)
            .field("check_interval", &self.check_interval)
            .field("labels", &self.labels)
            .finish_non_exhaustive()
    }
}

/// Mutable per-rule state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RuleState {
    pub firing: bool,
    /// `None` until the first evaluation
    pub last_checked: Option<Instant>,
}

/// What one [`AlertRuleEvaluator::evaluate`] pass did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EvaluationSummary {
    pub evaluated: usize,
    /// Skipped because their check interval had not elapsed
    pub skipped: usize,
    pub fired: usize,
    pub resolved: usize,
    /// Conditions that returned an error
    pub failed: usize,
}

struct RuleEntry {
    rule: AlertRule,
    state: Mutex<RuleState>,
}

struct EvaluationTask {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Periodically evaluates rules and drives an [`AlertManager`]
pub struct AlertRuleEvaluator {
    alert_manager: Arc<AlertManager>,
    rules: RwLock<Vec<Arc<RuleEntry>>>,
    task: Mutex<Option<EvaluationTask>>,
}

impl AlertRuleEvaluator {
    pub fn new(alert_manager: Arc<AlertManager>) -> Self {
        Self {
            alert_manager,
            rules: RwLock::new(Vec::new()),
            task: Mutex::new(None),
        }
    }

    /// Register a rule with fresh state. A rule with the same name is
    /// replaced.
    pub fn add_rule(&self, rule: AlertRule) {
        debug!("Adding alert rule: {}", rule.name);
        let entry = Arc::new(RuleEntry {
            rule,
            state: Mutex::new(RuleState::default()),
        });

        let mut rules = self.rules.write();
        match rules.iter_mut().find(|e| e.rule.name == entry.rule.name) {
            Some(slot) => *slot = entry,
            None => rules.push(entry),
        }
    }

    pub fn rule_count(&self) -> usize {
        self.rules.read().len()
    }

    pub fn rule_state(&self, name: &str) -> Option<RuleState> {
        self.rules
            .read()
            .iter()
            .find(|e| e.rule.name == name)
            .map(|e| *e.state.lock())
    }

    /// Run one pass over every rule whose check interval has elapsed.
    ///
    /// A rule's `last_checked` is stamped before its condition runs, so
    /// overlapping passes evaluate it at most once per interval. A failing
    /// condition is logged and leaves the rule's firing state unchanged.
    pub async fn evaluate(&self) -> EvaluationSummary {
        let rules: Vec<Arc<RuleEntry>> = self.rules.read().clone();
        let mut summary = EvaluationSummary::default();

        for entry in rules {
            if !claim(&entry) {
                summary.skipped += 1;
                continue;
            }
            summary.evaluated += 1;

            let rule = &entry.rule;
            let firing = match rule.condition.is_firing().await {
                Ok(firing) => firing,
                Err(err) => {
                    error!(rule = %rule.name, error = %err, "Error evaluating rule");
                    summary.failed += 1;
                    continue;
                }
            };

            let was_firing = {
                let mut state = entry.state.lock();
                std::mem::replace(&mut state.firing, firing)
            };

            match (was_firing, firing) {
                (false, true) => {
                    summary.fired += 1;
                    info!(rule = %rule.name, "Alert rule firing");
                    self.alert_manager
                        .alert(
                            rule.severity,
                            rule.title.as_str(),
                            rule.message.render(),
                            rule.labels.clone(),
                        )
                        .await;
                }
                (true, false) => {
                    summary.resolved += 1;
                    info!(rule = %rule.name, "Alert rule resolved");
                    let message = format!("{}{}", rule.message.render(), RESOLVED_SUFFIX);
                    self.alert_manager
                        .resolve(&rule.title, message, rule.labels.clone())
                        .await;
                }
                _ => {}
            }
        }

        summary
    }

    /// Start evaluating every `interval`, beginning immediately.
    ///
    /// Returns `false` if the loop is already running. Must be called from
    /// within a tokio runtime.
    pub fn start(self: &Arc<Self>, interval: Duration) -> bool {
        let mut task = self.task.lock();
        if task.is_some() {
            debug!("Alert rule evaluation already running");
            return false;
        }

        let period = interval.max(Duration::from_millis(1));
        let (shutdown, signal) = watch::channel(false);
        let handle = tokio::spawn(run_loop(Arc::downgrade(self), period, signal));

        info!(
            interval_ms = period.as_millis() as u64,
            rules = self.rule_count(),
            "Alert rule evaluation started"
        );
        *task = Some(EvaluationTask { shutdown, handle });
        true
    }

    /// Stop scheduling evaluations. A pass already underway runs to
    /// completion. Returns `false` if nothing was running.
    pub fn stop(&self) -> bool {
        match self.task.lock().take() {
            Some(task) => {
                let _ = task.shutdown.send(true);
                info!("Alert rule evaluation stopped");
                true
            }
            None => false,
        }
    }

    /// Like [`stop`](Self::stop), then wait for an in-flight pass to finish
    pub async fn stop_and_wait(&self) {
        let Some(task) = self.task.lock().take() else {
            return;
        };
        let _ = task.shutdown.send(true);
        if let Err(err) = task.handle.await {
            warn!(error = %err, "Alert rule evaluation task ended abnormally");
        }
        info!("Alert rule evaluation stopped");
    }

    pub fn is_running(&self) -> bool {
        self.task.lock().is_some()
    }
}

/// Stamp `last_checked` if the rule is due. Returns whether it is.
fn claim(entry: &RuleEntry) -> bool {
    let now = Instant::now();
    let mut state = entry.state.lock();
    if let Some(last) = state.last_checked {
        if now.duration_since(last) < entry.rule.check_interval {
            return false;
        }
    }
    state.last_checked = Some(now);
    true
}

async fn run_loop(
    evaluator: Weak<AlertRuleEvaluator>,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let Some(evaluator) = evaluator.upgrade() else {
                    break;
                };
                let summary = evaluator.evaluate().await;
                debug!(?summary, "Alert rules evaluated");
            }
            _ = shutdown.changed() => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerting::{AlertChannel, AlertManagerConfig, ChannelTransport};
    use crate::core::DispatchError;
    use futures_util::future::join_all;
    use serde_json::Value;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    fn manager() -> Arc<AlertManager> {
        let config = AlertManagerConfig::new("auth", vec![AlertChannel::email("oncall")]);
        Arc::new(AlertManager::new(config).unwrap())
    }

    /// Counts webhook posts and always answers 200
    #[derive(Default)]
    struct CountingTransport {
        posts: AtomicUsize,
    }

    #[async_trait]
    impl ChannelTransport for CountingTransport {
        async fn post_json(&self, _url: &str, _body: &Value) -> Result<u16, DispatchError> {
            self.posts.fetch_add(1, Ordering::SeqCst);
            Ok(200)
        }
    }

    fn counted_manager(transport: Arc<CountingTransport>) -> Arc<AlertManager> {
        let config =
            AlertManagerConfig::new("auth", vec![AlertChannel::webhook("hook", "http://hook")]);
        Arc::new(AlertManager::with_transport(config, transport))
    }

    /// Condition that sleeps before answering `true`, counting completions
    fn slow_rule(delay: Duration, completed: Arc<AtomicUsize>) -> AlertRule {
        AlertRule::new(
            "slow",
            AlertSeverity::Critical,
            "Slow condition",
            condition_fn(move || {
                let completed = completed.clone();
                async move {
                    tokio::time::sleep(delay).await;
                    completed.fetch_add(1, Ordering::SeqCst);
                    Ok(true)
                }
            }),
        )
    }

    fn flag_rule(name: &str, flag: Arc<AtomicBool>) -> AlertRule {
        AlertRule::new(
            name,
            AlertSeverity::Critical,
            "Flag raised",
            condition_fn(move || {
                let firing = flag.load(Ordering::SeqCst);
                async move { Ok(firing) }
            }),
        )
        .with_message("flag is up")
    }

    #[tokio::test]
    async fn test_edge_triggering() {
        let evaluator = AlertRuleEvaluator::new(manager());
        let flag = Arc::new(AtomicBool::new(false));
        evaluator.add_rule(flag_rule("flag", flag.clone()));

        let mut fired = 0;
        let mut resolved = 0;
        for value in [false, false, true, true, false] {
            flag.store(value, Ordering::SeqCst);
            let summary = evaluator.evaluate().await;
            fired += summary.fired;
            resolved += summary.resolved;
        }

        assert_eq!(fired, 1);
        assert_eq!(resolved, 1);
        assert!(!evaluator.rule_state("flag").unwrap().firing);
    }

    #[tokio::test]
    async fn test_failing_condition_keeps_state() {
        let evaluator = AlertRuleEvaluator::new(manager());
        let fail = Arc::new(AtomicBool::new(false));
        let fail_flag = fail.clone();
        evaluator.add_rule(AlertRule::new(
            "flaky",
            AlertSeverity::Warning,
            "Flaky",
            condition_fn(move || {
                let fail = fail_flag.load(Ordering::SeqCst);
                async move {
                    if fail {
                        anyhow::bail!("metrics backend unavailable");
                    }
                    Ok(true)
                }
            }),
        ));

        assert_eq!(evaluator.evaluate().await.fired, 1);

        fail.store(true, Ordering::SeqCst);
        let summary = evaluator.evaluate().await;
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.resolved, 0);
        assert!(evaluator.rule_state("flaky").unwrap().firing);
    }

    #[tokio::test(start_paused = true)]
    async fn test_check_interval_is_respected() {
        let evaluator = AlertRuleEvaluator::new(manager());
        evaluator.add_rule(
            flag_rule("slow", Arc::new(AtomicBool::new(false)))
                .with_check_interval(Duration::from_secs(60)),
        );

        assert_eq!(evaluator.evaluate().await.evaluated, 1);
        assert_eq!(evaluator.evaluate().await.skipped, 1);

        tokio::time::advance(Duration::from_secs(60)).await;
        assert_eq!(evaluator.evaluate().await.evaluated, 1);
    }

    #[tokio::test]
    async fn test_dynamic_message_is_rendered_per_edge() {
        let renders = Arc::new(AtomicUsize::new(0));
        let counter = renders.clone();
        let evaluator = AlertRuleEvaluator::new(manager());
        evaluator.add_rule(
            AlertRule::new(
                "dyn",
                AlertSeverity::Info,
                "Dynamic",
                condition_fn(|| async { Ok(true) }),
            )
            .with_dynamic_message(move || {
                format!("render #{}", counter.fetch_add(1, Ordering::SeqCst))
            }),
        );

        evaluator.evaluate().await;
        evaluator.evaluate().await;
        assert_eq!(renders.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_add_rule_replaces_by_name() {
        let evaluator = AlertRuleEvaluator::new(manager());
        evaluator.add_rule(flag_rule("flag", Arc::new(AtomicBool::new(true))));
        evaluator.evaluate().await;
        assert!(evaluator.rule_state("flag").unwrap().firing);

        evaluator.add_rule(flag_rule("flag", Arc::new(AtomicBool::new(false))));
        assert_eq!(evaluator.rule_count(), 1);
        assert_eq!(evaluator.rule_state("flag"), Some(RuleState::default()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_and_stop() {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        let evaluator = Arc::new(AlertRuleEvaluator::new(manager()));
        evaluator.add_rule(AlertRule::new(
            "counting",
            AlertSeverity::Info,
            "Counting",
            condition_fn(move || {
                seen.fetch_add(1, Ordering::SeqCst);
                async { Ok(false) }
            }),
        ));

        assert!(!evaluator.stop());
        assert!(evaluator.start(Duration::from_secs(30)));
        assert!(!evaluator.start(Duration::from_secs(30)));
        assert!(evaluator.is_running());

        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        assert!(evaluator.stop());
        assert!(!evaluator.stop());
        assert!(!evaluator.is_running());

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_gauge_condition() {
        let registry = crate::metrics::MetricsRegistry::new("svc");
        let gauge = registry.gauge("queue_depth", "Depth").unwrap();
        let condition = GaugeAbove::new(gauge.clone(), LabelSet::new(), 10.0);

        assert!(!condition.is_firing().await.unwrap());
        gauge.set(11.0, &LabelSet::new()).unwrap();
        assert!(condition.is_firing().await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_overlapping_passes_fire_once() {
        let transport = Arc::new(CountingTransport::default());
        let evaluator = Arc::new(AlertRuleEvaluator::new(counted_manager(transport.clone())));
        let completed = Arc::new(AtomicUsize::new(0));
        evaluator.add_rule(slow_rule(Duration::from_millis(50), completed.clone()));

        let passes = (0..8).map(|_| {
            let evaluator = Arc::clone(&evaluator);
            tokio::spawn(async move { evaluator.evaluate().await })
        });
        let fired: usize = join_all(passes)
            .await
            .into_iter()
            .map(|summary| summary.unwrap().fired)
            .sum();

        assert_eq!(completed.load(Ordering::SeqCst), 8);
        assert_eq!(fired, 1);
        assert_eq!(transport.posts.load(Ordering::SeqCst), 1);
        assert!(evaluator.rule_state("slow").unwrap().firing);
    }

    #[tokio::test(start_paused = true)]
    async fn test_overlapping_passes_respect_check_interval() {
        let transport = Arc::new(CountingTransport::default());
        let evaluator = Arc::new(AlertRuleEvaluator::new(counted_manager(transport.clone())));
        let completed = Arc::new(AtomicUsize::new(0));
        evaluator.add_rule(
            slow_rule(Duration::from_millis(50), completed.clone())
                .with_check_interval(Duration::from_secs(60)),
        );

        let passes = (0..8).map(|_| {
            let evaluator = Arc::clone(&evaluator);
            tokio::spawn(async move { evaluator.evaluate().await })
        });
        let summaries: Vec<EvaluationSummary> = join_all(passes)
            .await
            .into_iter()
            .map(|summary| summary.unwrap())
            .collect();

        assert_eq!(summaries.iter().map(|s| s.evaluated).sum::<usize>(), 1);
        assert_eq!(summaries.iter().map(|s| s.skipped).sum::<usize>(), 7);
        assert_eq!(completed.load(Ordering::SeqCst), 1);
        assert_eq!(transport.posts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_lets_running_pass_finish() {
        let transport = Arc::new(CountingTransport::default());
        let evaluator = Arc::new(AlertRuleEvaluator::new(counted_manager(transport.clone())));
        let completed = Arc::new(AtomicUsize::new(0));
        evaluator.add_rule(slow_rule(Duration::from_secs(10), completed.clone()));

        assert!(evaluator.start(Duration::from_secs(30)));
        // First pass is now inside the sleeping condition
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(completed.load(Ordering::SeqCst), 0);

        assert!(evaluator.stop());
        tokio::time::sleep(Duration::from_secs(20)).await;

        assert_eq!(completed.load(Ordering::SeqCst), 1);
        assert_eq!(transport.posts.load(Ordering::SeqCst), 1);
        assert!(evaluator.rule_state("slow").unwrap().firing);

        // No pass is scheduled after the stop
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(completed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_and_wait_returns_after_running_pass() {
        let transport = Arc::new(CountingTransport::default());
        let evaluator = Arc::new(AlertRuleEvaluator::new(counted_manager(transport.clone())));
        let completed = Arc::new(AtomicUsize::new(0));
        evaluator.add_rule(slow_rule(Duration::from_secs(10), completed.clone()));

        evaluator.start(Duration::from_secs(30));
        tokio::time::sleep(Duration::from_secs(1)).await;

        evaluator.stop_and_wait().await;
        assert_eq!(completed.load(Ordering::SeqCst), 1);
        assert_eq!(transport.posts.load(Ordering::SeqCst), 1);
        assert!(!evaluator.is_running());
    }
}
