//! Alert manager: deduplication, rate limiting and channel fan-out
//!
//! `alert()` goes through three gates in order:
//! 1. Dedup: a fingerprint delivered within the dedup window (or currently
//!    being delivered) is suppressed.
//! 2. Rate limit: at most `rate_limit_per_minute` deliveries per rolling
//!    window, the window starting at its first use.
//! 3. Fan-out: every channel accepting the severity is called concurrently.
//!    At least one success commits the dedup entry and the rate slot; total
//!    failure rolls both back.
//!
//! Both gates are checked and reserved under one lock, so concurrent callers
//! cannot double-deliver a fingerprint or overshoot the limit.

use super::alert::{Alert, AlertSeverity, Fingerprint};
use super::channels::{AlertChannel, ChannelTransport, HttpTransport};
use crate::core::{DispatchError, LabelSet};
use futures_util::future::join_all;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Alert manager configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertManagerConfig {
    /// Service name stamped on every alert
    pub service: String,
    pub channels: Vec<AlertChannel>,
    /// Suppress repeats of a delivered fingerprint for this long
    pub deduplication_window_ms: u64,
    pub rate_limit_per_minute: u32,
    /// Length of the rate-limit window
    pub rate_limit_window_ms: u64,
    /// Upper bound on one channel call
    pub dispatch_timeout_ms: u64,
}

impl Default for AlertManagerConfig {
    fn default() -> Self {
        Self {
            service: "beacon".to_string(),
            channels: Vec::new(),
            deduplication_window_ms: 5 * 60 * 1000, // 5 minutes
            rate_limit_per_minute: 10,
            rate_limit_window_ms: 60_000,
            dispatch_timeout_ms: 10_000,
        }
    }
}

impl AlertManagerConfig {
    pub fn new(service: impl Into<String>, channels: Vec<AlertChannel>) -> Self {
        Self {
            service: service.into(),
            channels,
            ..Self::default()
        }
    }
}

#[derive(Debug, Default)]
struct DispatchState {
    /// Last successful delivery per fingerprint
    recent: HashMap<Fingerprint, Instant>,
    /// Fingerprints with a delivery underway
    in_flight: HashSet<Fingerprint>,
    window_started: Option<Instant>,
    sent_in_window: u32,
}

enum Admission {
    Duplicate,
    RateLimited,
    Admitted { window: Instant },
}

/// Central alert manager
pub struct AlertManager {
    config: AlertManagerConfig,
    transport: Arc<dyn ChannelTransport>,
    state: Mutex<DispatchState>,
}

impl AlertManager {
    /// Manager posting over HTTP with the configured dispatch timeout
    pub fn new(config: AlertManagerConfig) -> Result<Self, DispatchError> {
        let transport = HttpTransport::new(Duration::from_millis(config.dispatch_timeout_ms))?;
        Ok(Self::with_transport(config, Arc::new(transport)))
    }

    pub fn with_transport(config: AlertManagerConfig, transport: Arc<dyn ChannelTransport>) -> Self {
        info!(
            service = %config.service,
            channels = config.channels.len(),
            "AlertManager initialized"
        );
        Self {
            config,
            transport,
            state: Mutex::new(DispatchState::default()),
        }
    }

    pub fn service(&self) -> &str {
        &self.config.service
    }

    pub fn channels(&self) -> &[AlertChannel] {
        &self.config.channels
    }

    /// Raise an alert.
    ///
    /// Returns `None` when the alert was suppressed (duplicate or rate
    /// limited) or when no channel accepted it. Never fails.
    pub async fn alert(
        &self,
        severity: AlertSeverity,
        title: impl Into<String>,
        message: impl Into<String>,
        labels: LabelSet,
    ) -> Option<Alert> {
        let alert = Alert::new(self.config.service.as_str(), severity, title, message, labels);
        let fingerprint = alert.fingerprint();

        let window = match self.admit(&fingerprint) {
            Admission::Duplicate => {
                debug!(fingerprint = %fingerprint, "Alert deduplicated: {}", alert.title);
                return None;
            }
            Admission::RateLimited => {
                warn!(
                    title = %alert.title,
                    limit = self.config.rate_limit_per_minute,
                    "Alert rate limit exceeded"
                );
                return None;
            }
            Admission::Admitted { window } => window,
        };

        // Rolled back on drop unless committed, including when this future is
        // cancelled mid-dispatch
        let reservation = Reservation {
            manager: self,
            fingerprint,
            window,
            committed: false,
        };

        let channels: Vec<&AlertChannel> = self
            .config
            .channels
            .iter()
            .filter(|channel| channel.accepts(severity))
            .collect();
        let delivered = self.dispatch(&alert, &channels).await;

        if delivered == 0 {
            warn!(
                title = %alert.title,
                attempted = channels.len(),
                "Alert was not delivered to any channel"
            );
            return None;
        }

        reservation.commit();
        info!(
            id = %alert.id,
            severity = %severity,
            delivered,
            "Alert sent: {}",
            alert.title
        );
        Some(alert)
    }

    pub async fn info(
        &self,
        title: impl Into<String>,
        message: impl Into<String>,
        labels: LabelSet,
    ) -> Option<Alert> {
        self.alert(AlertSeverity::Info, title, message, labels).await
    }

    pub async fn warning(
        &self,
        title: impl Into<String>,
        message: impl Into<String>,
        labels: LabelSet,
    ) -> Option<Alert> {
        self.alert(AlertSeverity::Warning, title, message, labels).await
    }

    pub async fn critical(
        &self,
        title: impl Into<String>,
        message: impl Into<String>,
        labels: LabelSet,
    ) -> Option<Alert> {
        self.alert(AlertSeverity::Critical, title, message, labels).await
    }

    /// Announce that the condition titled `title` has cleared.
    ///
    /// Clears the dedup entries for every severity of that condition, so it
    /// can fire again immediately, then notifies all channels regardless of
    /// their severity filter. Not rate limited. Returns the notice whether or
    /// not any channel took it.
    pub async fn resolve(
        &self,
        title: &str,
        message: impl Into<String>,
        labels: LabelSet,
    ) -> Alert {
        let alert = Alert::resolution(self.config.service.as_str(), title, message, labels);

        {
            let mut state = self.state.lock();
            for severity in AlertSeverity::ALL {
                let fingerprint =
                    Fingerprint::new(&self.config.service, severity, title, &alert.labels);
                if state.recent.remove(&fingerprint).is_some() {
                    debug!(fingerprint = %fingerprint, "dedup entry cleared by resolution");
                }
            }
        }

        let channels: Vec<&AlertChannel> = self.config.channels.iter().collect();
        let delivered = self.dispatch(&alert, &channels).await;
        info!(id = %alert.id, delivered, "Alert resolved: {}", title);
        alert
    }

    fn dedup_window(&self) -> Duration {
        Duration::from_millis(self.config.deduplication_window_ms)
    }

    fn rate_window(&self) -> Duration {
        Duration::from_millis(self.config.rate_limit_window_ms)
    }

    fn admit(&self, fingerprint: &Fingerprint) -> Admission {
        let now = Instant::now();
        let dedup_window = self.dedup_window();
        let mut state = self.state.lock();

        state
            .recent
            .retain(|_, sent| now.duration_since(*sent) < dedup_window);

        if state.in_flight.contains(fingerprint) || state.recent.contains_key(fingerprint) {
            return Admission::Duplicate;
        }

        let window = match state.window_started {
            Some(started) if now.duration_since(started) < self.rate_window() => started,
            _ => {
                state.window_started = Some(now);
                state.sent_in_window = 0;
                now
            }
        };

        if state.sent_in_window >= self.config.rate_limit_per_minute {
            return Admission::RateLimited;
        }

        state.sent_in_window += 1;
        state.in_flight.insert(fingerprint.clone());
        Admission::Admitted { window }
    }

    /// Deliver to `channels` concurrently and wait for all of them.
    /// Returns the number of successful deliveries.
    async fn dispatch(&self, alert: &Alert, channels: &[&AlertChannel]) -> usize {
        let attempts = channels.iter().map(|channel| async move {
            let outcome = self.send_to_channel(channel, alert).await;
            if let Err(err) = &outcome {
                warn!(channel = %channel.name, kind = %channel.kind, error = %err, "Failed to send alert");
            }
            outcome.is_ok()
        });

        join_all(attempts)
            .await
            .into_iter()
            .filter(|delivered| *delivered)
            .count()
    }

    async fn send_to_channel(
        &self,
        channel: &AlertChannel,
        alert: &Alert,
    ) -> Result<(), DispatchError> {
        let Some(body) = channel.payload(alert)? else {
            // Real email delivery lives outside this crate
            debug!(channel = %channel.name, "Email alert: {}", alert.title);
            return Ok(());
        };

        let url = channel
            .url
            .as_deref()
            .ok_or_else(|| DispatchError::MissingUrl {
                channel: channel.name.clone(),
            })?;

        let timeout = Duration::from_millis(self.config.dispatch_timeout_ms);
        let status = tokio::time::timeout(timeout, self.transport.post_json(url, &body))
            .await
            .map_err(|_| DispatchError::Timeout {
                channel: channel.name.clone(),
                timeout_ms: self.config.dispatch_timeout_ms,
            })??;

        if (200..300).contains(&status) {
            Ok(())
        } else {
            Err(DispatchError::Status {
                channel: channel.name.clone(),
                status,
            })
        }
    }
}

/// Dedup and rate-limit slot held while an alert is being delivered
struct Reservation<'a> {
    manager: &'a AlertManager,
    fingerprint: Fingerprint,
    window: Instant,
    committed: bool,
}

impl Reservation<'_> {
    fn commit(mut self) {
        self.committed = true;
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        let mut state = self.manager.state.lock();
        state.in_flight.remove(&self.fingerprint);

        if self.committed {
            state.recent.insert(self.fingerprint.clone(), Instant::now());
        } else if state.window_started == Some(self.window) {
            state.sent_in_window = state.sent_in_window.saturating_sub(1);
        }
    }
}
