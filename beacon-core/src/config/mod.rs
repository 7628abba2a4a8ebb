//! Typed configuration
//!
//! Every field has a default, so an empty JSON object is a valid file.
//! Values are layered: defaults, then the JSON file, then `BEACON_*`
//! environment variables. Nested keys use `__`, so
//! `BEACON_SERVER__LISTEN_ADDR` sets `server.listen_addr`.

use crate::alerting::{AlertChannel, AlertManagerConfig};
use crate::core::ConfigError;
use crate::server::ServerConfig;
use ::config::{Config as ConfigLoader, Environment, File};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

/// Prefix of the environment overrides
pub const ENV_PREFIX: &str = "BEACON";

/// Environment variables as handed to the loader, name to value
pub type EnvVars = ::config::Map<String, String>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitoringConfig {
    /// Service name; prefixes metric names and tags alerts
    pub service: String,
    pub version: String,
    pub log: LogConfig,
    pub health: HealthConfig,
    pub alerts: AlertsConfig,
    pub rules: RulesConfig,
    pub server: ServerSection,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            service: "beacon".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            log: LogConfig::default(),
            health: HealthConfig::default(),
            alerts: AlertsConfig::default(),
            rules: RulesConfig::default(),
            server: ServerSection::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// `EnvFilter` directive used when `RUST_LOG` is unset
    pub level: String,
    pub json: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    pub probe_timeout_ms: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            probe_timeout_ms: 5000,
        }
    }
}

impl HealthConfig {
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertsConfig {
    pub channels: Vec<AlertChannel>,
    pub deduplication_window_ms: u64,
    pub rate_limit_per_minute: u32,
    pub rate_limit_window_ms: u64,
    pub dispatch_timeout_ms: u64,
}

impl Default for AlertsConfig {
    fn default() -> Self {
        let defaults = AlertManagerConfig::default();
        Self {
            channels: defaults.channels,
            deduplication_window_ms: defaults.deduplication_window_ms,
            rate_limit_per_minute: defaults.rate_limit_per_minute,
            rate_limit_window_ms: defaults.rate_limit_window_ms,
            dispatch_timeout_ms: defaults.dispatch_timeout_ms,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RulesConfig {
    pub evaluation_interval_ms: u64,
}

impl Default for RulesConfig {
    fn default() -> Self {
        Self {
            evaluation_interval_ms: 30_000,
        }
    }
}

impl RulesConfig {
    pub fn evaluation_interval(&self) -> Duration {
        Duration::from_millis(self.evaluation_interval_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    pub listen_addr: SocketAddr,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            listen_addr: ServerConfig::default().listen_addr,
        }
    }
}

impl MonitoringConfig {
    /// Load a JSON file, apply environment overrides and validate
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        Self::layered(Some(path.as_ref()), None)
    }

    /// Defaults plus environment overrides
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::layered(None, None)
    }

    /// Like [`load`](Self::load) or [`from_env`](Self::from_env), reading
    /// overrides from `vars` instead of the process environment
    pub fn load_with_env(path: Option<&Path>, vars: EnvVars) -> Result<Self, ConfigError> {
        Self::layered(path, Some(vars))
    }

    fn layered(path: Option<&Path>, vars: Option<EnvVars>) -> Result<Self, ConfigError> {
        let mut builder = ConfigLoader::builder()
            .set_default("service", "beacon")?
            .set_default("log.level", "info")?
            .set_default("log.json", false)?
            .set_default("health.probe_timeout_ms", 5000)?
            .set_default("rules.evaluation_interval_ms", 30_000)?;

        if let Some(path) = path {
            builder = builder.add_source(File::from(path));
        }

        let config = builder
            // BEACON_SERVICE, BEACON_LOG__LEVEL, BEACON_SERVER__LISTEN_ADDR, ...
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .source(vars),
            )
            .build()?;

        let cfg: Self = config.try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Reject values that would make a component misbehave
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.service.trim().is_empty() {
            return Err(ConfigError::Invalid("service name must not be empty".into()));
        }
        if self.health.probe_timeout_ms == 0 {
            return Err(ConfigError::Invalid("health.probe_timeout_ms must be positive".into()));
        }
        if self.alerts.rate_limit_per_minute == 0 {
            return Err(ConfigError::Invalid(
                "alerts.rate_limit_per_minute must be positive".into(),
            ));
        }
        if self.alerts.rate_limit_window_ms == 0 {
            return Err(ConfigError::Invalid(
                "alerts.rate_limit_window_ms must be positive".into(),
            ));
        }
        for channel in &self.alerts.channels {
            if channel.kind.is_http() && channel.url.as_deref().map_or(true, str::is_empty) {
                return Err(ConfigError::Invalid(format!(
                    "alert channel '{}' ({}) requires a url",
                    channel.name, channel.kind
                )));
            }
            if channel.severities.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "alert channel '{}' accepts no severity",
                    channel.name
                )));
            }
        }
        Ok(())
    }

    pub fn alert_manager_config(&self) -> AlertManagerConfig {
        AlertManagerConfig {
            service: self.service.clone(),
            channels: self.alerts.channels.clone(),
            deduplication_window_ms: self.alerts.deduplication_window_ms,
            rate_limit_per_minute: self.alerts.rate_limit_per_minute,
            rate_limit_window_ms: self.alerts.rate_limit_window_ms,
            dispatch_timeout_ms: self.alerts.dispatch_timeout_ms,
        }
    }

    pub fn server_config(&self) -> ServerConfig {
        ServerConfig {
            listen_addr: self.server.listen_addr,
        }
    }
}
