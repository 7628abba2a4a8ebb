//! Prometheus text and JSON exposition
//!
//! Each series collects into its own single-sample `MetricFamily`; samples of
//! one metric are merged into a single family (sorted by label set) before
//! handing them to `prometheus::TextEncoder`, so the output is stable across
//! calls.

use super::registry::{Metric, MetricKind, Series};
use crate::core::{LabelSet, MetricsError};
use chrono::{DateTime, Utc};
use prometheus::proto::MetricFamily;
use prometheus::{Encoder, TextEncoder};
use serde::Serialize;
use std::sync::Arc;
use tracing::warn;

/// Structural view of one metric
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricSnapshot {
    pub name: String,
    pub help: String,
    #[serde(rename = "type")]
    pub kind: MetricKind,
    pub series: Vec<SeriesSnapshot>,
}

/// Structural view of one series
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SeriesSnapshot {
    pub labels: LabelSet,
    /// Counter or gauge value; absent for histograms
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub histogram: Option<HistogramSnapshot>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HistogramSnapshot {
    /// Cumulative buckets in ascending order, ending with `+Inf`
    pub buckets: Vec<BucketSnapshot>,
    pub sum: f64,
    pub count: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BucketSnapshot {
    pub le: String,
    pub count: u64,
}

pub(crate) fn encode_text(metrics: &[Arc<Metric>]) -> Result<String, MetricsError> {
    let families: Vec<MetricFamily> = metrics.iter().filter_map(|m| merge_family(m)).collect();

    let mut buffer = Vec::new();
    TextEncoder::new().encode(&families, &mut buffer)?;
    Ok(String::from_utf8_lossy(&buffer).into_owned())
}

/// Fold every series of `metric` into one family. `None` when the metric has
/// no series yet: the encoder rejects empty families.
fn merge_family(metric: &Metric) -> Option<MetricFamily> {
    let mut merged: Option<MetricFamily> = None;

    for (_, series) in metric.sorted_series() {
        for mut family in series.collect() {
            match merged.as_mut() {
                None => merged = Some(family),
                Some(target) => {
                    for sample in family.take_metric().into_vec() {
                        target.mut_metric().push(sample);
                    }
                }
            }
        }
    }

    merged
}

pub(crate) fn snapshot(metric: &Metric) -> MetricSnapshot {
    let series = metric
        .sorted_series()
        .into_iter()
        .map(|(labels, series)| {
            let (value, histogram) = match metric.kind {
                MetricKind::Histogram => (None, histogram_snapshot(&series)),
                MetricKind::Counter | MetricKind::Gauge => (Some(series.value()), None),
            };
            SeriesSnapshot {
                labels,
                value,
                histogram,
                updated_at: series.updated_at(),
            }
        })
        .collect();

    MetricSnapshot {
        name: metric.name.clone(),
        help: metric.help.clone(),
        kind: metric.kind,
        series,
    }
}

pub(crate) fn histogram_snapshot(series: &Series) -> Option<HistogramSnapshot> {
    let families = series.collect();
    let sample = families.first()?.get_metric().first()?;
    if !sample.has_histogram() {
        return None;
    }
    let proto = sample.get_histogram();

    let mut buckets: Vec<BucketSnapshot> = proto
        .get_bucket()
        .iter()
        .map(|bucket| BucketSnapshot {
            le: bucket.get_upper_bound().to_string(),
            count: bucket.get_cumulative_count(),
        })
        .collect();
    buckets.push(BucketSnapshot {
        le: "+Inf".to_string(),
        count: proto.get_sample_count(),
    });

    Some(HistogramSnapshot {
        buckets,
        sum: proto.get_sample_sum(),
        count: proto.get_sample_count(),
    })
}

pub(crate) fn to_json(snapshots: &[MetricSnapshot]) -> serde_json::Value {
    let map = snapshots
        .iter()
        .map(|snapshot| {
            let value = match serde_json::to_value(snapshot) {
                Ok(value) => value,
                Err(e) => {
                    warn!(metric = %snapshot.name, "Failed to serialize metric: {}", e);
                    serde_json::Value::Null
                }
            };
            (snapshot.name.clone(), value)
        })
        .collect();
    serde_json::Value::Object(map)
}
