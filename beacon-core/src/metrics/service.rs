//! Default per-service HTTP metrics

use super::registry::{CounterHandle, GaugeHandle, HistogramHandle, MetricsRegistry};
use crate::core::{LabelSet, MetricsError};

/// Metrics every service exposes out of the box
#[derive(Clone)]
pub struct ServiceMetrics {
    pub http_requests_total: CounterHandle,
    pub http_request_duration_seconds: HistogramHandle,
    pub http_requests_in_flight: GaugeHandle,
    pub active_connections: GaugeHandle,
    pub errors_total: CounterHandle,
}

impl ServiceMetrics {
    pub fn new(registry: &MetricsRegistry) -> Result<Self, MetricsError> {
        Ok(Self {
            http_requests_total: registry
                .counter("http_requests_total", "Total number of HTTP requests")?,
            http_request_duration_seconds: registry.histogram(
                "http_request_duration_seconds",
                "HTTP request duration in seconds",
                None,
            )?,
            http_requests_in_flight: registry.gauge(
                "http_requests_in_flight",
                "Number of HTTP requests currently being processed",
            )?,
            active_connections: registry
                .gauge("active_connections", "Number of active connections")?,
            errors_total: registry.counter("errors_total", "Total number of errors")?,
        })
    }

    /// Record one completed request.
    ///
    /// Responses with a status of 500 or above also count as an error of
    /// type `http_5xx`.
    pub fn record_request(
        &self,
        method: &str,
        route: &str,
        status: u16,
        duration_secs: f64,
    ) -> Result<(), MetricsError> {
        let labels = LabelSet::new()
            .with("method", method)
            .with("route", route)
            .with("status", status.to_string());
        self.http_requests_total.inc(&labels)?;
        self.http_request_duration_seconds
            .observe(duration_secs, &labels)?;

        if status >= 500 {
            self.errors_total
                .inc(&LabelSet::from([("type", "http_5xx")]))?;
        }
        Ok(())
    }
}
