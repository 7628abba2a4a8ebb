//! Metrics registry with Prometheus and JSON exposition
//!
//! ```
//! use beacon_core::{LabelSet, MetricsRegistry};
//!
//! let registry = MetricsRegistry::new("auth");
//! let logins = registry.counter("logins_total", "Total logins").unwrap();
//! logins.inc(&LabelSet::from([("result", "ok")])).unwrap();
//!
//! assert!(registry.export().unwrap().contains("auth_logins_total{result=\"ok\"} 1"));
//! ```

pub mod export;
pub mod registry;
pub mod service;

pub use export::{BucketSnapshot, HistogramSnapshot, MetricSnapshot, SeriesSnapshot};
pub use registry::{
    CounterHandle, GaugeHandle, HistogramHandle, HistogramTimer, MetricKind, MetricsRegistry,
    DEFAULT_BUCKETS,
};
pub use service::ServiceMetrics;
