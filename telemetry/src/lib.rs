//! Shared observability plumbing: tracing initialisation, the Prometheus
//! metrics recorder, and the per-service `/health` + `/metrics` endpoints.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};

#[derive(thiserror::Error, Debug)]
pub enum TelemetryError {
    #[error("failed to install metrics recorder: {source}")]
    Recorder {
        #[from]
        source: BuildError,
    },
    #[error("failed to bind observability port: {source}")]
    Bind {
        #[from]
        source: std::io::Error,
    },
}

/// Start logging to the console, filtered by `RUST_LOG` (default `info`).
pub fn init_tracing() {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_file(true)
                .with_line_number(true),
        )
        .with(filter)
        .init();
}

/// Install the process-global Prometheus recorder and return the render
/// handle for the `/metrics` endpoint. Call once, before any metric is
/// touched.
pub fn install_metrics_recorder() -> Result<PrometheusHandle, TelemetryError> {
    Ok(PrometheusBuilder::new().install_recorder()?)
}

/// Service liveness for `/health`: healthy once the main loop is running and
/// the upstream handshake has succeeded at least once. The upstream latch is
/// sticky; a later transient outage degrades metrics, not health, because
/// supervisors restart on health failures and a restart would not fix an
/// upstream outage.
#[derive(Clone, Default)]
pub struct HealthState {
    inner: Arc<HealthInner>,
}

#[derive(Default)]
struct HealthInner {
    main_loop_running: AtomicBool,
    upstream_ready: AtomicBool,
}

impl HealthState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_main_loop_running(&self, running: bool) {
        self.inner
            .main_loop_running
            .store(running, Ordering::Relaxed);
    }

    pub fn mark_upstream_ready(&self) {
        self.inner.upstream_ready.store(true, Ordering::Relaxed);
    }

    pub fn is_healthy(&self) -> bool {
        self.inner.main_loop_running.load(Ordering::Relaxed)
            && self.inner.upstream_ready.load(Ordering::Relaxed)
    }
}

/// Serve `/health` and `/metrics` on `0.0.0.0:port` in a background task.
pub async fn serve_observability(
    port: u16,
    health: HealthState,
    prometheus: PrometheusHandle,
) -> Result<tokio::task::JoinHandle<()>, TelemetryError> {
    let app = Router::new()
        .route(
            "/health",
            get(move || {
                let health = health.clone();
                async move {
                    if health.is_healthy() {
                        (StatusCode::OK, "ok")
                    } else {
                        (StatusCode::SERVICE_UNAVAILABLE, "not ready")
                    }
                }
            }),
        )
        .route(
            "/metrics",
            get(move || {
                let prometheus = prometheus.clone();
                async move { prometheus.render() }
            }),
        );
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
    tracing::info!(port, "observability endpoints listening");
    Ok(tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!(error = %e, "observability server exited");
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn health_requires_loop_and_upstream() {
        let health = HealthState::new();
        assert!(!health.is_healthy());
        health.set_main_loop_running(true);
        assert!(!health.is_healthy());
        health.mark_upstream_ready();
        assert!(health.is_healthy());
        // Upstream latch is sticky, loop state is not.
        health.set_main_loop_running(false);
        assert!(!health.is_healthy());
        health.set_main_loop_running(true);
        assert!(health.is_healthy());
    }

    #[tokio::test]
    async fn recorder_renders_counters() {
        let handle = install_metrics_recorder().expect("recorder installs once per process");
        metrics::counter!("frames_ingested", "camera_id" => "cam_01").increment(3);
        let rendered = handle.render();
        assert!(rendered.contains("frames_ingested"));
        assert!(rendered.contains("cam_01"));
    }
}
