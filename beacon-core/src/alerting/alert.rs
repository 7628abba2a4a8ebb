//! Alert model and fingerprinting

use crate::core::LabelSet;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Alert severity levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    /// Informational, no action required
    Info,
    /// Should be investigated
    Warning,
    /// Immediate action required
    Critical,
}

impl AlertSeverity {
    pub const ALL: [AlertSeverity; 3] = [Self::Info, Self::Warning, Self::Critical];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Critical => "critical",
        }
    }

    /// Upper-case tag used in notification titles
    pub fn label(&self) -> &'static str {
        match self {
            Self::Info => "INFO",
            Self::Warning => "WARNING",
            Self::Critical => "CRITICAL",
        }
    }

    /// Blue, orange, red
    pub fn color_hex(&self) -> &'static str {
        match self {
            Self::Info => "#2196F3",
            Self::Warning => "#FF9800",
            Self::Critical => "#F44336",
        }
    }

    /// Same colors as integers, the form Discord embeds take
    pub fn color_code(&self) -> u32 {
        match self {
            Self::Info => 0x2196F3,
            Self::Warning => 0xFF9800,
            Self::Critical => 0xF44336,
        }
    }
}

impl fmt::Display for AlertSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of a logical alert condition.
///
/// Built from service, severity, title and the canonical label encoding, so
/// label order never changes it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn new(service: &str, severity: AlertSeverity, title: &str, labels: &LabelSet) -> Self {
        Self(format!(
            "{}:{}:{}:{{{}}}",
            service,
            severity,
            title,
            labels.canonical()
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One notification, fresh id and timestamp per call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Alert {
    pub id: String,
    pub service: String,
    pub severity: AlertSeverity,
    pub title: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "LabelSet::is_empty")]
    pub labels: LabelSet,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub resolved: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
}

impl Alert {
    pub fn new(
        service: impl Into<String>,
        severity: AlertSeverity,
        title: impl Into<String>,
        message: impl Into<String>,
        labels: LabelSet,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            service: service.into(),
            severity,
            title: title.into(),
            message: message.into(),
            timestamp: Utc::now(),
            labels,
            resolved: false,
            resolved_at: None,
        }
    }

    /// Resolution notice for the condition titled `title`
    pub fn resolution(
        service: impl Into<String>,
        title: &str,
        message: impl Into<String>,
        labels: LabelSet,
    ) -> Self {
        let mut alert = Self::new(
            service,
            AlertSeverity::Info,
            format!("[RESOLVED] {title}"),
            message,
            labels,
        );
        alert.resolved = true;
        alert.resolved_at = Some(alert.timestamp);
        alert
    }

    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint::new(&self.service, self.severity, &self.title, &self.labels)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fingerprint_ignores_label_order() {
        let ab = LabelSet::new().with("a", "1").with("b", "2");
        let ba = LabelSet::new().with("b", "2").with("a", "1");

        assert_eq!(
            Fingerprint::new("auth", AlertSeverity::Critical, "DB down", &ab),
            Fingerprint::new("auth", AlertSeverity::Critical, "DB down", &ba)
        );
        assert_eq!(
            Fingerprint::new("auth", AlertSeverity::Critical, "DB down", &ab).as_str(),
            r#"auth:critical:DB down:{a="1",b="2"}"#
        );
    }

    #[test]
    fn test_fingerprint_distinguishes_severity_and_labels() {
        let labels = LabelSet::from([("region", "eu")]);
        let critical = Fingerprint::new("auth", AlertSeverity::Critical, "X", &labels);
        let warning = Fingerprint::new("auth", AlertSeverity::Warning, "X", &labels);
        let unlabeled = Fingerprint::new("auth", AlertSeverity::Critical, "X", &LabelSet::new());

        assert_ne!(critical, warning);
        assert_ne!(critical, unlabeled);
    }

    #[test]
    fn test_alerts_get_fresh_ids() {
        let first = Alert::new("auth", AlertSeverity::Info, "X", "m", LabelSet::new());
        let second = Alert::new("auth", AlertSeverity::Info, "X", "m", LabelSet::new());
        assert_ne!(first.id, second.id);
        assert_eq!(first.fingerprint(), second.fingerprint());
    }

    #[test]
    fn test_resolution_alert() {
        let alert = Alert::resolution("auth", "DB down", "back", LabelSet::new());
        assert_eq!(alert.title, "[RESOLVED] DB down");
        assert_eq!(alert.severity, AlertSeverity::Info);
        assert!(alert.resolved);
        assert_eq!(alert.resolved_at, Some(alert.timestamp));
    }

    #[test]
    fn test_alert_json_shape() {
        let alert = Alert::new(
            "auth",
            AlertSeverity::Warning,
            "Slow",
            "p99 high",
            LabelSet::from([("route", "/login")]),
        );
        let json = serde_json::to_value(&alert).unwrap();

        assert_eq!(json["severity"], "warning");
        assert_eq!(json["labels"]["route"], "/login");
        assert!(json.get("resolved").is_none());
        assert!(json.get("resolvedAt").is_none());

        let resolved = serde_json::to_value(Alert::resolution("auth", "Slow", "ok", LabelSet::new())).unwrap();
        assert_eq!(resolved["resolved"], true);
        assert!(resolved["resolvedAt"].is_string());
        assert!(resolved.get("labels").is_none());
    }
}
