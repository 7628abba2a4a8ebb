//! HTTP exposition of metrics and health
//!
//! A small hyper server for scrapers and orchestrators:
//!
//! | Path            | Body                              | Status                 |
//! |-----------------|-----------------------------------|------------------------|
//! | `/metrics`      | Prometheus text format            | 200                    |
//! | `/metrics/json` | JSON dump of the registry         | 200                    |
//! | `/health`       | `ServiceHealth`                   | 200, 503 if unhealthy  |
//! | `/health/live`  | `{status: "ok", timestamp}`       | 200                    |
//! | `/health/ready` | `{ready, checks}`                 | 200, 503 if not ready  |

use crate::health::{HealthChecker, HealthStatus};
use crate::metrics::MetricsRegistry;
use anyhow::{Context, Result};
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::Serialize;
use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

/// Content type of the Prometheus text exposition
pub const PROMETHEUS_CONTENT_TYPE: &str = "text/plain; version=0.0.4";

const JSON_CONTENT_TYPE: &str = "application/json";
const TEXT_CONTENT_TYPE: &str = "text/plain; charset=utf-8";

/// Configuration for the monitoring HTTP server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    /// Address to bind to (e.g., "0.0.0.0:9464")
    pub listen_addr: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 9464)),
        }
    }
}

/// HTTP server for metrics and health endpoints
pub struct MonitoringServer {
    config: ServerConfig,
    registry: MetricsRegistry,
    health: Arc<HealthChecker>,
}

impl MonitoringServer {
    pub fn new(config: ServerConfig, registry: MetricsRegistry, health: Arc<HealthChecker>) -> Self {
        Self {
            config,
            registry,
            health,
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Serve until the process ends
    pub async fn serve(self) -> Result<()> {
        self.serve_with_shutdown(std::future::pending()).await
    }

    /// Bind the configured address and serve until `shutdown` completes
    pub async fn serve_with_shutdown<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let listener = TcpListener::bind(&self.config.listen_addr)
            .await
            .with_context(|| format!("Failed to bind monitoring server on {}", self.config.listen_addr))?;
        self.run(listener, shutdown).await
    }

    /// Serve connections from an already bound `listener` until `shutdown`
    /// completes. Connections still open at shutdown finish on their own.
    pub async fn run<F>(self, listener: TcpListener, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let local_addr = listener.local_addr().context("Listener has no local address")?;
        info!("Monitoring server listening on http://{}", local_addr);

        let server = Arc::new(self);
        tokio::pin!(shutdown);

        loop {
            let (stream, remote_addr) = tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok(conn) => conn,
                    Err(e) => {
                        error!("Failed to accept connection: {}", e);
                        continue;
                    }
                },
                _ = &mut shutdown => {
                    info!("Monitoring server shutting down");
                    return Ok(());
                }
            };

            let server = Arc::clone(&server);

            // Spawn a new task for each connection
            tokio::spawn(async move {
                let io = TokioIo::new(stream);

                let service = service_fn(move |req: Request<hyper::body::Incoming>| {
                    let server = Arc::clone(&server);
                    async move {
                        Ok::<_, Infallible>(server.handle(req.method(), req.uri().path()).await)
                    }
                });

                if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                    debug!("Connection error from {}: {}", remote_addr, err);
                }
            });
        }
    }

    /// Route one request
    pub async fn handle(&self, method: &Method, path: &str) -> Response<Full<Bytes>> {
        debug!("Monitoring request: {} {}", method, path);

        if *method != Method::GET {
            return text(StatusCode::METHOD_NOT_ALLOWED, "Method Not Allowed");
        }

        match path {
            "/metrics" => match self.registry.export() {
                Ok(body) => respond(StatusCode::OK, PROMETHEUS_CONTENT_TYPE, body),
                Err(e) => {
                    error!("Failed to encode metrics: {}", e);
                    text(StatusCode::INTERNAL_SERVER_ERROR, format!("Error: {e}"))
                }
            },
            "/metrics/json" => json(StatusCode::OK, &self.registry.to_json()),
            "/health" => {
                let health = self.health.check().await;
                let status = if health.status == HealthStatus::Unhealthy {
                    StatusCode::SERVICE_UNAVAILABLE
                } else {
                    StatusCode::OK
                };
                json(status, &health)
            }
            "/health/live" => json(StatusCode::OK, &self.health.liveness()),
            "/health/ready" => {
                let readiness = self.health.readiness().await;
                let status = if readiness.ready {
                    StatusCode::OK
                } else {
                    StatusCode::SERVICE_UNAVAILABLE
                };
                json(status, &readiness)
            }
            "/" => text(
                StatusCode::OK,
                format!(
                    "{} monitoring\n\nEndpoints:\n  /metrics - Prometheus metrics\n  /metrics/json - Metrics as JSON\n  /health - Full health report\n  /health/live - Liveness\n  /health/ready - Readiness\n",
                    self.health.service()
                ),
            ),
            _ => {
                warn!("Unknown monitoring endpoint requested: {}", path);
                text(StatusCode::NOT_FOUND, "Not Found")
            }
        }
    }
}

fn respond(
    status: StatusCode,
    content_type: &'static str,
    body: impl Into<Bytes>,
) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body.into()));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    response
}

fn text(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    respond(status, TEXT_CONTENT_TYPE, body)
}

fn json<T: Serialize>(status: StatusCode, value: &T) -> Response<Full<Bytes>> {
    match serde_json::to_vec(value) {
        Ok(body) => respond(status, JSON_CONTENT_TYPE, body),
        Err(e) => {
            error!("Failed to serialize response: {}", e);
            text(StatusCode::INTERNAL_SERVER_ERROR, "Serialization error")
        }
    }
}
