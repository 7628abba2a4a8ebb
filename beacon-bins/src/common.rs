//! Common utilities for all binaries
//!
//! Shared initialization, CLI parsing, and setup code.

use anyhow::{Context, Result};
use beacon_core::config::{EnvVars, MonitoringConfig};
use beacon_core::utils::init_logger;
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;

/// Common CLI arguments for all binaries
#[derive(Parser, Debug)]
#[command(author, version, about)]
pub struct CommonArgs {
    /// JSON configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Service name (overrides config and BEACON_SERVICE)
    #[arg(short, long)]
    pub service: Option<String>,

    /// Service version reported by health endpoints
    #[arg(long)]
    pub service_version: Option<String>,

    /// Address for the metrics and health endpoints
    #[arg(long)]
    pub listen_addr: Option<SocketAddr>,

    /// Log level
    #[arg(short, long)]
    pub log_level: Option<String>,

    /// Emit JSON logs
    #[arg(long)]
    pub json_logs: bool,
}

impl CommonArgs {
    /// Resolve the effective configuration: file or defaults, environment,
    /// then command line flags
    pub fn load_config(&self) -> Result<MonitoringConfig> {
        let config = match &self.config {
            Some(path) => MonitoringConfig::load(path)
                .with_context(|| format!("Failed to load config from {}", path.display()))?,
            None => MonitoringConfig::from_env().context("Invalid environment configuration")?,
        };
        self.apply(config)
    }

    /// Same as [`load_config`](Self::load_config) with environment
    /// overrides taken from `vars`
    pub fn load_config_with_env(&self, vars: EnvVars) -> Result<MonitoringConfig> {
        let config = MonitoringConfig::load_with_env(self.config.as_deref(), vars)
            .context("Failed to load configuration")?;
        self.apply(config)
    }

    fn apply(&self, mut config: MonitoringConfig) -> Result<MonitoringConfig> {
        if let Some(service) = &self.service {
            config.service = service.clone();
        }
        if let Some(version) = &self.service_version {
            config.version = version.clone();
        }
        if let Some(addr) = self.listen_addr {
            config.server.listen_addr = addr;
        }
        if let Some(level) = &self.log_level {
            config.log.level = level.clone();
        }
        if self.json_logs {
            config.log.json = true;
        }

        config.validate()?;
        Ok(config)
    }
}

/// Initialize tracing/logging from the resolved configuration
pub fn init_logging(config: &MonitoringConfig) -> Result<()> {
    init_logger(&config.log.level, config.log.json)
}
