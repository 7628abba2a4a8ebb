//! Notification channels, payload formatting and the outbound transport
//!
//! A channel only receives alerts whose severity is in its allowed set.
//! Slack, Discord and generic webhooks get a JSON POST in their own schema;
//! email is a placeholder that accepts everything without sending.

use super::alert::{Alert, AlertSeverity};
use crate::core::DispatchError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeSet;
use std::fmt;
use std::time::Duration;

/// Footer stamped on chat notifications
pub const FOOTER: &str = "Beacon Alerting";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelKind {
    Slack,
    Discord,
    Webhook,
    Email,
}

impl ChannelKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Slack => "slack",
            Self::Discord => "discord",
            Self::Webhook => "webhook",
            Self::Email => "email",
        }
    }

    /// Whether delivery goes over HTTP and therefore needs a URL
    pub fn is_http(&self) -> bool {
        !matches!(self, Self::Email)
    }
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn all_severities() -> BTreeSet<AlertSeverity> {
    AlertSeverity::ALL.into_iter().collect()
}

/// A notification destination
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertChannel {
    pub name: String,
    pub kind: ChannelKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default = "all_severities")]
    pub severities: BTreeSet<AlertSeverity>,
}

impl AlertChannel {
    pub fn new(name: impl Into<String>, kind: ChannelKind, url: Option<String>) -> Self {
        Self {
            name: name.into(),
            kind,
            url,
            severities: all_severities(),
        }
    }

    pub fn slack(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self::new(name, ChannelKind::Slack, Some(url.into()))
    }

    pub fn discord(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self::new(name, ChannelKind::Discord, Some(url.into()))
    }

    pub fn webhook(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self::new(name, ChannelKind::Webhook, Some(url.into()))
    }

    pub fn email(name: impl Into<String>) -> Self {
        Self::new(name, ChannelKind::Email, None)
    }

    /// Restrict the channel to `severities`
    pub fn with_severities(mut self, severities: impl IntoIterator<Item = AlertSeverity>) -> Self {
        self.severities = severities.into_iter().collect();
        self
    }

    pub fn accepts(&self, severity: AlertSeverity) -> bool {
        self.severities.contains(&severity)
    }

    /// Request body for `alert`, or `None` for channels that do not POST
    pub fn payload(&self, alert: &Alert) -> Result<Option<Value>, DispatchError> {
        let body = match self.kind {
            ChannelKind::Slack => slack_payload(alert),
            ChannelKind::Discord => discord_payload(alert),
            ChannelKind::Webhook => webhook_payload(alert)?,
            ChannelKind::Email => return Ok(None),
        };
        Ok(Some(body))
    }
}

fn title_line(alert: &Alert) -> String {
    format!("[{}] {}", alert.severity.label(), alert.title)
}

/// Slack attachment schema
pub fn slack_payload(alert: &Alert) -> Value {
    let timestamp = alert.timestamp.to_rfc3339();
    let mut fields = vec![
        json!({ "title": "Service", "value": alert.service, "short": true }),
        json!({ "title": "Time", "value": timestamp, "short": true }),
    ];
    fields.extend(
        alert
            .labels
            .iter()
            .map(|(k, v)| json!({ "title": k, "value": v, "short": true })),
    );

    json!({
        "attachments": [{
            "color": alert.severity.color_hex(),
            "title": title_line(alert),
            "text": alert.message,
            "fields": fields,
            "footer": FOOTER,
            "ts": alert.timestamp.timestamp(),
        }]
    })
}

/// Discord embed schema
pub fn discord_payload(alert: &Alert) -> Value {
    let timestamp = alert.timestamp.to_rfc3339();
    let mut fields = vec![
        json!({ "name": "Service", "value": alert.service, "inline": true }),
        json!({ "name": "Time", "value": timestamp, "inline": true }),
    ];
    fields.extend(
        alert
            .labels
            .iter()
            .map(|(k, v)| json!({ "name": k, "value": v, "inline": true })),
    );

    json!({
        "embeds": [{
            "title": title_line(alert),
            "description": alert.message,
            "color": alert.severity.color_code(),
            "fields": fields,
            "footer": { "text": FOOTER },
            "timestamp": timestamp,
        }]
    })
}

/// Raw alert JSON
pub fn webhook_payload(alert: &Alert) -> Result<Value, DispatchError> {
    Ok(serde_json::to_value(alert)?)
}

/// Outbound delivery of a JSON body; returns the response status code
#[async_trait]
pub trait ChannelTransport: Send + Sync {
    async fn post_json(&self, url: &str, body: &Value) -> Result<u16, DispatchError>;
}

/// `reqwest`-backed transport
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(timeout: Duration) -> Result<Self, DispatchError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl ChannelTransport for HttpTransport {
    async fn post_json(&self, url: &str, body: &Value) -> Result<u16, DispatchError> {
        let response = self.client.post(url).json(body).send().await?;
        Ok(response.status().as_u16())
    }
}
