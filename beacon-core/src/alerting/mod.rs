//! Alerting: alert model, notification channels, the deduplicating and
//! rate-limited [`AlertManager`] and the edge-triggered
//! [`AlertRuleEvaluator`] that drives it.

pub mod alert;
pub mod channels;
pub mod manager;
pub mod rules;

pub use alert::{Alert, AlertSeverity, Fingerprint};
pub use channels::{
    discord_payload, slack_payload, webhook_payload, AlertChannel, ChannelKind, ChannelTransport,
    HttpTransport,
};
pub use manager::{AlertManager, AlertManagerConfig};
pub use rules::{
    condition_fn, AlertCondition, AlertRule, AlertRuleEvaluator, EvaluationSummary, FnCondition,
    GaugeAbove, RuleMessage, RuleState, DEFAULT_EVALUATION_INTERVAL,
};
