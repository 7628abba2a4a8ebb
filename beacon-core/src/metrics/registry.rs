//! In-process metrics registry
//!
//! Metrics are created lazily by name and kind and hold one series per
//! distinct [`LabelSet`]. Every series is backed by a `prometheus` primitive
//! that carries its labels as const labels, so once a series exists updates
//! are plain atomic operations and the exposition comes from
//! `prometheus::TextEncoder`.
//!
//! Metric names are namespaced by service: `counter("http_requests_total")`
//! on a registry for `auth` registers `auth_http_requests_total`.

use super::export::{self, MetricSnapshot};
use crate::core::{LabelSet, MetricsError};
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::RwLock;
use prometheus::core::{Collector, Desc};
use prometheus::proto::MetricFamily;
use prometheus::{Counter, Gauge, Histogram, HistogramOpts, Opts};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

/// Default histogram boundaries in seconds, sub-millisecond to 10s
pub const DEFAULT_BUCKETS: [f64; 11] = [
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

/// Kind of a registered metric
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricKind {
    Counter,
    Gauge,
    Histogram,
}

impl MetricKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Counter => "counter",
            Self::Gauge => "gauge",
            Self::Histogram => "histogram",
        }
    }
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

enum SeriesValue {
    Counter(Counter),
    Gauge(Gauge),
    Histogram(Histogram),
}

/// One (metric, labelset) instance
pub(crate) struct Series {
    value: SeriesValue,
    updated_at_ms: AtomicI64,
}

impl Series {
    fn touch(&self) {
        self.updated_at_ms
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    fn add(&self, delta: f64) {
        match &self.value {
            SeriesValue::Counter(counter) => counter.inc_by(delta),
            SeriesValue::Gauge(gauge) => gauge.add(delta),
            SeriesValue::Histogram(_) => return,
        }
        self.touch();
    }

    fn set(&self, value: f64) {
        if let SeriesValue::Gauge(gauge) = &self.value {
            gauge.set(value);
            self.touch();
        }
    }

    fn observe(&self, value: f64) {
        if let SeriesValue::Histogram(histogram) = &self.value {
            histogram.observe(value);
            self.touch();
        }
    }

    /// Current value; for histograms, the observation count
    pub(crate) fn value(&self) -> f64 {
        match &self.value {
            SeriesValue::Counter(counter) => counter.get(),
            SeriesValue::Gauge(gauge) => gauge.get(),
            SeriesValue::Histogram(histogram) => histogram.get_sample_count() as f64,
        }
    }

    pub(crate) fn updated_at(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(self.updated_at_ms.load(Ordering::Relaxed))
            .unwrap_or_else(Utc::now)
    }

    pub(crate) fn collect(&self) -> Vec<MetricFamily> {
        match &self.value {
            SeriesValue::Counter(counter) => counter.collect(),
            SeriesValue::Gauge(gauge) => gauge.collect(),
            SeriesValue::Histogram(histogram) => histogram.collect(),
        }
    }
}

/// A named metric and its series table
pub(crate) struct Metric {
    pub(crate) name: String,
    pub(crate) help: String,
    pub(crate) kind: MetricKind,
    pub(crate) buckets: Vec<f64>,
    series: DashMap<LabelSet, Arc<Series>>,
}

impl Metric {
    fn new(name: String, help: String, kind: MetricKind, buckets: Vec<f64>) -> Self {
        Self {
            name,
            help,
            kind,
            buckets,
            series: DashMap::new(),
        }
    }

    /// Find or create the series for `labels`.
    ///
    /// Creation goes through the map entry, which holds the shard lock, so
    /// racing callers end up sharing one series and no update is lost.
    fn series(&self, labels: &LabelSet) -> Result<Arc<Series>, MetricsError> {
        if let Some(existing) = self.series.get(labels) {
            return Ok(Arc::clone(existing.value()));
        }

        match self.series.entry(labels.clone()) {
            Entry::Occupied(entry) => Ok(Arc::clone(entry.get())),
            Entry::Vacant(entry) => {
                let series = Arc::new(self.new_series(labels)?);
                entry.insert(Arc::clone(&series));
                Ok(series)
            }
        }
    }

    fn existing_series(&self, labels: &LabelSet) -> Option<Arc<Series>> {
        self.series.get(labels).map(|s| Arc::clone(s.value()))
    }

    fn new_series(&self, labels: &LabelSet) -> Result<Series, MetricsError> {
        let const_labels = labels.to_hash_map();
        let value = match self.kind {
            MetricKind::Counter => SeriesValue::Counter(Counter::with_opts(
                Opts::new(self.name.clone(), self.help.clone()).const_labels(const_labels),
            )?),
            MetricKind::Gauge => SeriesValue::Gauge(Gauge::with_opts(
                Opts::new(self.name.clone(), self.help.clone()).const_labels(const_labels),
            )?),
            MetricKind::Histogram => SeriesValue::Histogram(Histogram::with_opts(
                HistogramOpts::new(self.name.clone(), self.help.clone())
                    .const_labels(const_labels)
                    .buckets(self.buckets.clone()),
            )?),
        };

        let series = Series {
            value,
            updated_at_ms: AtomicI64::new(0),
        };
        series.touch();
        Ok(series)
    }

    /// Series sorted by label set, for deterministic export
    pub(crate) fn sorted_series(&self) -> Vec<(LabelSet, Arc<Series>)> {
        let mut series: Vec<_> = self
            .series
            .iter()
            .map(|entry| (entry.key().clone(), Arc::clone(entry.value())))
            .collect();
        series.sort_by(|a, b| a.0.cmp(&b.0));
        series
    }
}

/// Registry owning every metric of one service.
///
/// Cloning is cheap and clones share state.
#[derive(Clone)]
pub struct MetricsRegistry {
    namespace: Arc<str>,
    metrics: Arc<RwLock<BTreeMap<String, Arc<Metric>>>>,
}

impl MetricsRegistry {
    /// Create a registry whose metric names are prefixed with `service`.
    ///
    /// Characters that are not valid in a Prometheus metric name are
    /// replaced with `_`.
    pub fn new(service: &str) -> Self {
        let namespace = sanitize_namespace(service);
        debug!(namespace = %namespace, "metrics registry created");
        Self {
            namespace: namespace.into(),
            metrics: Arc::new(RwLock::new(BTreeMap::new())),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Look up or create a counter
    pub fn counter(&self, name: &str, help: &str) -> Result<CounterHandle, MetricsError> {
        let metric = self.get_or_create(name, help, MetricKind::Counter, Vec::new())?;
        Ok(CounterHandle { metric })
    }

    /// Look up or create a gauge
    pub fn gauge(&self, name: &str, help: &str) -> Result<GaugeHandle, MetricsError> {
        let metric = self.get_or_create(name, help, MetricKind::Gauge, Vec::new())?;
        Ok(GaugeHandle { metric })
    }

    /// Look up or create a histogram.
    ///
    /// `buckets` defaults to [`DEFAULT_BUCKETS`]. If the histogram already
    /// exists its original boundaries are kept.
    pub fn histogram(
        &self,
        name: &str,
        help: &str,
        buckets: Option<&[f64]>,
    ) -> Result<HistogramHandle, MetricsError> {
        let buckets = buckets.map(<[f64]>::to_vec).unwrap_or_else(|| DEFAULT_BUCKETS.to_vec());
        validate_buckets(name, &buckets)?;
        let metric = self.get_or_create(name, help, MetricKind::Histogram, buckets)?;
        Ok(HistogramHandle { metric })
    }

    fn get_or_create(
        &self,
        name: &str,
        help: &str,
        kind: MetricKind,
        buckets: Vec<f64>,
    ) -> Result<Arc<Metric>, MetricsError> {
        let full_name = format!("{}_{}", self.namespace, name);

        if let Some(existing) = self.metrics.read().get(&full_name) {
            return ensure_kind(existing, kind);
        }

        let mut metrics = self.metrics.write();
        if let Some(existing) = metrics.get(&full_name) {
            return ensure_kind(existing, kind);
        }

        // Validates the metric name and help text up front
        Desc::new(full_name.clone(), help.to_string(), Vec::new(), HashMap::new())?;

        let metric = Arc::new(Metric::new(full_name.clone(), help.to_string(), kind, buckets));
        metrics.insert(full_name, Arc::clone(&metric));
        debug!(metric = %metric.name, kind = %kind, "metric registered");
        Ok(metric)
    }

    /// Prometheus text exposition of every metric
    pub fn export(&self) -> Result<String, MetricsError> {
        export::encode_text(&self.sorted_metrics())
    }

    /// Structural dump of every metric
    pub fn snapshot(&self) -> Vec<MetricSnapshot> {
        self.sorted_metrics()
            .iter()
            .map(|metric| export::snapshot(metric))
            .collect()
    }

    /// JSON object keyed by metric name
    pub fn to_json(&self) -> serde_json::Value {
        export::to_json(&self.snapshot())
    }

    /// Names of all registered metrics, sorted
    pub fn metric_names(&self) -> Vec<String> {
        self.metrics.read().keys().cloned().collect()
    }

    /// Drop every metric. Intended for test isolation.
    ///
    /// Handles obtained before the reset keep working but are detached from
    /// the registry.
    pub fn reset(&self) {
        self.metrics.write().clear();
    }

    fn sorted_metrics(&self) -> Vec<Arc<Metric>> {
        self.metrics.read().values().cloned().collect()
    }
}

impl fmt::Debug for MetricsRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MetricsRegistry")
            .field("namespace", &self.namespace)
            .field("metrics", &self.metrics.read().len())
            .finish()
    }
}

fn ensure_kind(metric: &Arc<Metric>, requested: MetricKind) -> Result<Arc<Metric>, MetricsError> {
    if metric.kind != requested {
        return Err(MetricsError::KindConflict {
            name: metric.name.clone(),
            existing: metric.kind,
            requested,
        });
    }
    Ok(Arc::clone(metric))
}

fn sanitize_namespace(service: &str) -> String {
    let mut namespace: String = service
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == ':' { c } else { '_' })
        .collect();
    if namespace.starts_with(|c: char| c.is_ascii_digit()) {
        namespace.insert(0, '_');
    }
    namespace
}

fn validate_buckets(name: &str, buckets: &[f64]) -> Result<(), MetricsError> {
    let invalid = |reason: &str| MetricsError::InvalidBuckets {
        name: name.to_string(),
        reason: reason.to_string(),
    };

    if buckets.is_empty() {
        return Err(invalid("at least one boundary is required"));
    }
    if buckets.iter().any(|b| !b.is_finite()) {
        return Err(invalid("boundaries must be finite, +Inf is implicit"));
    }
    if buckets.windows(2).any(|pair| pair[0] >= pair[1]) {
        return Err(invalid("boundaries must be strictly ascending"));
    }
    Ok(())
}

/// Capability to increment one counter
#[derive(Clone)]
pub struct CounterHandle {
    metric: Arc<Metric>,
}

impl CounterHandle {
    pub fn name(&self) -> &str {
        &self.metric.name
    }

    /// Add 1 to the series for `labels`
    pub fn inc(&self, labels: &LabelSet) -> Result<(), MetricsError> {
        self.inc_by(labels, 1.0)
    }

    /// Add `delta` to the series for `labels`. `delta` must be finite and >= 0.
    pub fn inc_by(&self, labels: &LabelSet, delta: f64) -> Result<(), MetricsError> {
        if !delta.is_finite() || delta < 0.0 {
            return Err(MetricsError::InvalidIncrement {
                name: self.metric.name.clone(),
                delta,
            });
        }
        self.metric.series(labels)?.add(delta);
        Ok(())
    }

    /// Current value, 0 if the series does not exist yet
    pub fn get(&self, labels: &LabelSet) -> f64 {
        self.metric
            .existing_series(labels)
            .map_or(0.0, |series| series.value())
    }
}

/// Capability to move one gauge
#[derive(Clone)]
pub struct GaugeHandle {
    metric: Arc<Metric>,
}

impl GaugeHandle {
    pub fn name(&self) -> &str {
        &self.metric.name
    }

    pub fn set(&self, value: f64, labels: &LabelSet) -> Result<(), MetricsError> {
        self.metric.series(labels)?.set(value);
        Ok(())
    }

    pub fn inc(&self, labels: &LabelSet) -> Result<(), MetricsError> {
        self.inc_by(labels, 1.0)
    }

    pub fn inc_by(&self, labels: &LabelSet, delta: f64) -> Result<(), MetricsError> {
        self.metric.series(labels)?.add(delta);
        Ok(())
    }

    pub fn dec(&self, labels: &LabelSet) -> Result<(), MetricsError> {
        self.dec_by(labels, 1.0)
    }

    pub fn dec_by(&self, labels: &LabelSet, delta: f64) -> Result<(), MetricsError> {
        self.metric.series(labels)?.add(-delta);
        Ok(())
    }

    /// Current value, 0 if the series does not exist yet
    pub fn get(&self, labels: &LabelSet) -> f64 {
        self.metric
            .existing_series(labels)
            .map_or(0.0, |series| series.value())
    }
}

/// Capability to observe into one histogram
#[derive(Clone)]
pub struct HistogramHandle {
    metric: Arc<Metric>,
}

impl HistogramHandle {
    pub fn name(&self) -> &str {
        &self.metric.name
    }

    /// Configured upper bounds, ascending, without the implicit `+Inf`
    pub fn buckets(&self) -> &[f64] {
        &self.metric.buckets
    }

    /// Record one observation: every bucket whose bound is >= `value` is
    /// incremented, as are the running sum and count.
    pub fn observe(&self, value: f64, labels: &LabelSet) -> Result<(), MetricsError> {
        self.metric.series(labels)?.observe(value);
        Ok(())
    }

    /// Start timing; [`HistogramTimer::stop`] observes the elapsed seconds
    pub fn start_timer(&self, labels: &LabelSet) -> HistogramTimer {
        HistogramTimer {
            histogram: self.clone(),
            labels: labels.clone(),
            start: Instant::now(),
        }
    }

    /// Observation count for `labels`
    pub fn count(&self, labels: &LabelSet) -> u64 {
        self.metric
            .existing_series(labels)
            .map_or(0, |series| series.value() as u64)
    }

    /// Bucket counts, sum and count for `labels`
    pub fn snapshot(&self, labels: &LabelSet) -> Option<export::HistogramSnapshot> {
        self.metric
            .existing_series(labels)
            .and_then(|series| export::histogram_snapshot(&series))
    }
}

/// Running timer returned by [`HistogramHandle::start_timer`]
pub struct HistogramTimer {
    histogram: HistogramHandle,
    labels: LabelSet,
    start: Instant,
}

impl HistogramTimer {
    /// Observe the seconds elapsed since the timer started and return them.
    ///
    /// Each call records another observation; stopping twice double-counts.
    pub fn stop(&self) -> Result<f64, MetricsError> {
        let elapsed = self.start.elapsed().as_secs_f64();
        self.histogram.observe(elapsed, &self.labels)?;
        Ok(elapsed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn labels(pairs: &[(&str, &str)]) -> LabelSet {
        pairs.iter().copied().collect()
    }

    #[test]
    fn test_names_are_namespaced() {
        let registry = MetricsRegistry::new("auth");
        let counter = registry.counter("logins_total", "Total logins").unwrap();
        assert_eq!(counter.name(), "auth_logins_total");
        assert_eq!(registry.metric_names(), vec!["auth_logins_total".to_string()]);
    }

    #[test]
    fn test_namespace_is_sanitized() {
        let registry = MetricsRegistry::new("pre-drive.files");
        assert_eq!(registry.namespace(), "pre_drive_files");

        let registry = MetricsRegistry::new("9lives");
        assert_eq!(registry.namespace(), "_9lives");
    }

    #[test]
    fn test_lookup_is_idempotent() {
        let registry = MetricsRegistry::new("svc");
        let first = registry.counter("jobs_total", "Jobs").unwrap();
        let second = registry.counter("jobs_total", "Jobs").unwrap();

        first.inc(&LabelSet::new()).unwrap();
        second.inc(&LabelSet::new()).unwrap();

        assert_eq!(first.get(&LabelSet::new()), 2.0);
        assert_eq!(registry.metric_names().len(), 1);
    }

    #[test]
    fn test_kind_conflict_is_rejected() {
        let registry = MetricsRegistry::new("svc");
        registry.counter("queue_depth", "Depth").unwrap();

        let err = registry.gauge("queue_depth", "Depth").err().unwrap();
        assert!(matches!(
            err,
            MetricsError::KindConflict {
                existing: MetricKind::Counter,
                requested: MetricKind::Gauge,
                ..
            }
        ));
        assert!(registry.histogram("queue_depth", "Depth", None).is_err());
    }

    #[test]
    fn test_counter_rejects_negative_and_nan() {
        let registry = MetricsRegistry::new("svc");
        let counter = registry.counter("bytes_total", "Bytes").unwrap();

        assert!(matches!(
            counter.inc_by(&LabelSet::new(), -1.0),
            Err(MetricsError::InvalidIncrement { .. })
        ));
        assert!(counter.inc_by(&LabelSet::new(), f64::NAN).is_err());
        assert!(counter.inc_by(&LabelSet::new(), f64::INFINITY).is_err());
        assert_eq!(counter.get(&LabelSet::new()), 0.0);

        counter.inc_by(&LabelSet::new(), 0.0).unwrap();
        counter.inc_by(&LabelSet::new(), 2.5).unwrap();
        assert_eq!(counter.get(&LabelSet::new()), 2.5);
    }

    #[test]
    fn test_label_order_targets_same_series() {
        let registry = MetricsRegistry::new("svc");
        let counter = registry.counter("requests_total", "Requests").unwrap();

        counter.inc(&labels(&[("a", "1"), ("b", "2")])).unwrap();
        counter.inc(&labels(&[("b", "2"), ("a", "1")])).unwrap();

        assert_eq!(counter.get(&labels(&[("a", "1"), ("b", "2")])), 2.0);
        let snapshot = registry.snapshot();
        assert_eq!(snapshot[0].series.len(), 1);
    }

    #[test]
    fn test_gauge_moves_both_ways() {
        let registry = MetricsRegistry::new("svc");
        let gauge = registry.gauge("in_flight", "In flight").unwrap();
        let route = labels(&[("route", "/login")]);

        gauge.inc(&route).unwrap();
        gauge.inc_by(&route, 4.0).unwrap();
        gauge.dec(&route).unwrap();
        assert_eq!(gauge.get(&route), 4.0);

        gauge.set(-3.5, &route).unwrap();
        assert_eq!(gauge.get(&route), -3.5);

        gauge.dec_by(&LabelSet::new(), 2.0).unwrap();
        assert_eq!(gauge.get(&LabelSet::new()), -2.0);
    }

    #[test]
    fn test_histogram_buckets_are_cumulative() {
        let registry = MetricsRegistry::new("svc");
        let histogram = registry
            .histogram("latency_seconds", "Latency", Some(&[0.1, 0.5, 1.0]))
            .unwrap();
        let none = LabelSet::new();

        for value in [0.05, 0.1, 0.3, 0.7, 2.0] {
            histogram.observe(value, &none).unwrap();
        }

        let snapshot = histogram.snapshot(&none).unwrap();
        let counts: Vec<u64> = snapshot.buckets.iter().map(|b| b.count).collect();
        assert_eq!(counts, vec![2, 3, 4, 5]);
        assert_eq!(snapshot.buckets.last().unwrap().le, "+Inf");
        assert_eq!(snapshot.count, 5);
        assert!((snapshot.sum - 3.15).abs() < 1e-9);
    }

    #[test]
    fn test_histogram_default_buckets() {
        let registry = MetricsRegistry::new("svc");
        let histogram = registry.histogram("duration_seconds", "Duration", None).unwrap();
        assert_eq!(histogram.buckets(), &DEFAULT_BUCKETS[..]);
    }

    #[test]
    fn test_histogram_rejects_bad_buckets() {
        let registry = MetricsRegistry::new("svc");
        for bad in [&[][..], &[1.0, 0.5][..], &[0.1, 0.1][..], &[0.1, f64::INFINITY][..]] {
            assert!(matches!(
                registry.histogram("bad_seconds", "Bad", Some(bad)),
                Err(MetricsError::InvalidBuckets { .. })
            ));
        }
        assert!(registry.metric_names().is_empty());
    }

    #[test]
    fn test_invalid_label_name_is_rejected() {
        let registry = MetricsRegistry::new("svc");
        let histogram = registry.histogram("h_seconds", "H", None).unwrap();
        assert!(matches!(
            histogram.observe(0.1, &labels(&[("le", "oops")])),
            Err(MetricsError::Prometheus(_))
        ));
    }

    #[test]
    fn test_empty_help_is_rejected() {
        let registry = MetricsRegistry::new("svc");
        assert!(matches!(
            registry.counter("no_help_total", ""),
            Err(MetricsError::Prometheus(_))
        ));
    }

    #[test]
    fn test_timer_observes_elapsed_seconds() {
        let registry = MetricsRegistry::new("svc");
        let histogram = registry.histogram("op_seconds", "Op", None).unwrap();
        let route = labels(&[("op", "sleep")]);

        let timer = histogram.start_timer(&route);
        thread::sleep(std::time::Duration::from_millis(5));
        let elapsed = timer.stop().unwrap();

        assert!(elapsed >= 0.005);
        assert_eq!(histogram.count(&route), 1);

        // Not guarded: a second stop records a second observation
        timer.stop().unwrap();
        assert_eq!(histogram.count(&route), 2);
    }

    #[test]
    fn test_concurrent_increments_are_not_lost() {
        let registry = MetricsRegistry::new("svc");
        let threads: Vec<_> = (0..8)
            .map(|i| {
                let registry = registry.clone();
                thread::spawn(move || {
                    let counter = registry.counter("hits_total", "Hits").unwrap();
                    let shared = LabelSet::from([("route", "/")]);
                    let own = LabelSet::from([("worker", i.to_string())]);
                    for _ in 0..1000 {
                        counter.inc(&shared).unwrap();
                        counter.inc(&own).unwrap();
                    }
                })
            })
            .collect();
        for handle in threads {
            handle.join().unwrap();
        }

        let counter = registry.counter("hits_total", "Hits").unwrap();
        assert_eq!(counter.get(&LabelSet::from([("route", "/")])), 8000.0);
        assert_eq!(counter.get(&LabelSet::from([("worker", "3")])), 1000.0);
    }

    #[test]
    fn test_reset_clears_everything() {
        let registry = MetricsRegistry::new("svc");
        registry.counter("a_total", "A").unwrap().inc(&LabelSet::new()).unwrap();
        registry.gauge("b", "B").unwrap();

        registry.reset();

        assert!(registry.metric_names().is_empty());
        assert_eq!(registry.export().unwrap(), "");
        // Kind is free again after a reset
        assert!(registry.gauge("a_total", "A").is_ok());
    }
}
