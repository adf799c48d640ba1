use axum::{http::StatusCode, response::Json, routing::get, Router};
use metrics_exporter_prometheus::PrometheusBuilder;
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Health check response.
#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
}

/// Readiness check response.
#[derive(Serialize)]
struct ReadyResponse {
    status: &'static str,
    ready: bool,
}

/// Shared readiness state.
#[derive(Clone, Default)]
pub struct HealthState {
    ready: Arc<AtomicBool>,
}

impl HealthState {
    /// Create a health state that starts ready.
    #[must_use]
    pub fn new() -> Self {
        Self {
            ready: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Mark the service as ready or draining.
    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::Relaxed);
    }

    /// Check if the service is ready.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Relaxed)
    }
}

/// Build the metrics/health router around an installed Prometheus handle.
fn app(render: impl Fn() -> String + Clone + Send + Sync + 'static, health: HealthState) -> Router {
    Router::new()
        .route("/metrics", get(move || std::future::ready(render())))
        .route("/health", get(health_handler))
        .route("/ready", get(move || ready_handler(health.clone())))
}

/// # Errors
///
/// Returns an error if the recorder is already installed or binding fails.
pub async fn start_metrics_server(addr: SocketAddr, health_state: HealthState) -> anyhow::Result<()> {
    let handle = PrometheusBuilder::new().install_recorder()?;

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("metrics server listening on {}", addr);
    axum::serve(listener, app(move || handle.render(), health_state)).await?;
    Ok(())
}

/// Health check handler - returns 200 if server is running.
async fn health_handler() -> (StatusCode, Json<HealthResponse>) {
    (StatusCode::OK, Json(HealthResponse { status: "healthy" }))
}

/// Readiness check handler - returns 200 if ready, 503 while draining.
async fn ready_handler(state: HealthState) -> (StatusCode, Json<ReadyResponse>) {
    if state.is_ready() {
        (
            StatusCode::OK,
            Json(ReadyResponse {
                status: "ready",
                ready: true,
            }),
        )
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ReadyResponse {
                status: "draining",
                ready: false,
            }),
        )
    }
}

/// Level gauges.
pub mod gauges {
    /// Increment the open connections gauge.
    pub fn inc_connections_active() {
        metrics::gauge!("sigrelay_connections_active").increment(1.0);
    }

    /// Decrement the open connections gauge.
    pub fn dec_connections_active() {
        metrics::gauge!("sigrelay_connections_active").decrement(1.0);
    }

    /// Set the registered peers gauge.
    pub fn peers_registered(count: usize) {
        metrics::gauge!("sigrelay_peers_registered").set(count as f64);
    }
}

/// Event counters.
pub mod counters {
    /// Record a registration attempt with the given outcome label.
    pub fn registrations_total(outcome: &'static str) {
        metrics::counter!("sigrelay_registrations_total", "outcome" => outcome).increment(1);
    }

    /// Increment the evicted-connections counter.
    pub fn evictions_total() {
        metrics::counter!("sigrelay_evictions_total").increment(1);
    }

    /// Increment the forwarded-messages counter.
    pub fn messages_forwarded_total() {
        metrics::counter!("sigrelay_messages_forwarded_total").increment(1);
    }

    /// Increment the dropped-messages counter with the given reason label.
    pub fn messages_dropped_total(reason: &'static str) {
        metrics::counter!("sigrelay_messages_dropped_total", "reason" => reason).increment(1);
    }

    /// Increment the failed presence deliveries counter.
    pub fn presence_failures_total() {
        metrics::counter!("sigrelay_presence_failures_total").increment(1);
    }
}

/// Latency histograms.
pub mod histograms {
    /// Record how long routing one envelope took, in seconds.
    pub fn route_latency_seconds(value: f64) {
        metrics::histogram!("sigrelay_route_latency_seconds").record(value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    fn test_app(health: HealthState) -> Router {
        app(|| "sigrelay_up 1\n".to_string(), health)
    }

    async fn status_of(app: Router, path: &str) -> StatusCode {
        let request = Request::builder().uri(path).body(Body::empty()).unwrap();
        app.oneshot(request).await.unwrap().status()
    }

    #[tokio::test]
    async fn health_is_ok() {
        assert_eq!(status_of(test_app(HealthState::new()), "/health").await, StatusCode::OK);
    }

    #[tokio::test]
    async fn ready_follows_state() {
        let health = HealthState::new();
        assert_eq!(status_of(test_app(health.clone()), "/ready").await, StatusCode::OK);
        health.set_ready(false);
        assert_eq!(
            status_of(test_app(health), "/ready").await,
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[tokio::test]
    async fn metrics_renders_exporter_output() {
        assert_eq!(status_of(test_app(HealthState::new()), "/metrics").await, StatusCode::OK);
    }
}
