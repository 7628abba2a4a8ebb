//! Error taxonomy for the observability core
//!
//! Only programmer mistakes surface as errors: reusing a metric name with a
//! different kind, a negative counter increment, malformed histogram buckets
//! or configuration. Probe, dispatch and rule failures are absorbed by the
//! component that sees them and degrade into a status or a suppressed alert.

use crate::metrics::MetricKind;
use thiserror::Error;

/// Metrics registry usage errors
#[derive(Debug, Error)]
pub enum MetricsError {
    /// A metric name was reused with a different kind
    #[error("metric {name} is already registered as a {existing}, cannot reuse it as a {requested}")]
    KindConflict {
        name: String,
        existing: MetricKind,
        requested: MetricKind,
    },

    /// Counters only move forward
    #[error("counter {name} cannot be incremented by {delta}")]
    InvalidIncrement { name: String, delta: f64 },

    /// Histogram boundaries must be finite and strictly ascending
    #[error("histogram {name} has invalid buckets: {reason}")]
    InvalidBuckets { name: String, reason: String },

    /// Name, help or label rejected by the prometheus encoder
    #[error("prometheus rejected metric: {0}")]
    Prometheus(#[from] prometheus::Error),
}

/// Failure to deliver an alert to one channel
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("channel {channel} has no URL configured")]
    MissingUrl { channel: String },

    #[error("channel {channel} responded with status {status}")]
    Status { channel: String, status: u16 },

    #[error("channel {channel} did not respond within {timeout_ms}ms")]
    Timeout { channel: String, timeout_ms: u64 },

    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// Failure reported by a non-HTTP transport
    #[error("transport failed: {0}")]
    Transport(String),

    #[error("failed to encode alert payload: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Malformed or unreadable configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Missing file, unparsable source or a value of the wrong type
    #[error("failed to load configuration: {0}")]
    Load(#[from] ::config::ConfigError),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}
