//! Service health: probe registry, aggregation and stock probes

pub mod checker;
pub mod probes;

pub use checker::{
    probe_fn, FnProbe, HealthCheckResult, HealthChecker, HealthProbe, HealthStatus, Liveness,
    Readiness, ServiceHealth, DEFAULT_PROBE_TIMEOUT, TIMEOUT_MESSAGE,
};
pub use probes::HttpServiceProbe;
