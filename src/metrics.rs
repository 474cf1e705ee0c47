//! Prometheus metrics and the `/metrics` endpoint
//!
//! One [`Metrics`] registry is created by the process entry point and handed
//! to each account as an [`AccountMetrics`] handle; nothing registers into a
//! global registry.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use axum::extract::State;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use prometheus::{
    Encoder, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::errors::{AppError, AppResult};

fn metric_error(e: prometheus::Error) -> AppError {
    AppError::Internal(format!("metrics registry failure: {e}"))
}

/// Process-wide metrics registry
pub struct Metrics {
    registry: Registry,
    moved: IntCounterVec,
    phase: IntGaugeVec,
    cycles: IntCounterVec,
}

impl Metrics {
    /// Create a registry with all account metric families registered
    pub fn new() -> AppResult<Self> {
        let registry = Registry::new();

        let moved = IntCounterVec::new(
            Opts::new(
                "smartmail_messages_moved_total",
                "Total number of messages moved by the account's action.",
            ),
            &["account"],
        )
        .map_err(metric_error)?;
        let phase = IntGaugeVec::new(
            Opts::new(
                "smartmail_account_phase",
                "Lifecycle phase of the account (0=initial .. 5=shutdown).",
            ),
            &["account"],
        )
        .map_err(metric_error)?;
        let cycles = IntCounterVec::new(
            Opts::new(
                "smartmail_handle_cycles_total",
                "Total number of handle cycles by outcome.",
            ),
            &["account", "outcome"],
        )
        .map_err(metric_error)?;

        registry
            .register(Box::new(moved.clone()))
            .map_err(metric_error)?;
        registry
            .register(Box::new(phase.clone()))
            .map_err(metric_error)?;
        registry
            .register(Box::new(cycles.clone()))
            .map_err(metric_error)?;

        Ok(Self {
            registry,
            moved,
            phase,
            cycles,
        })
    }

    /// Handles for one account's series
    pub fn account(&self, account_id: &str) -> AccountMetrics {
        AccountMetrics {
            moved: self.moved.with_label_values(&[account_id]),
            phase: self.phase.with_label_values(&[account_id]),
            cycles_ok: self.cycles.with_label_values(&[account_id, "ok"]),
            cycles_failed: self.cycles.with_label_values(&[account_id, "error"]),
        }
    }

    /// Render all metrics in the text exposition format
    pub fn render(&self) -> AppResult<String> {
        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(metric_error)?;
        String::from_utf8(buffer)
            .map_err(|e| AppError::Internal(format!("metrics output is not utf8: {e}")))
    }

    /// Router exposing `GET /metrics`
    pub fn router(self: Arc<Self>) -> Router {
        Router::new()
            .route("/metrics", get(metrics_handler))
            .with_state(self)
    }

    /// Serve the metrics endpoint until `cancel` fires
    pub async fn serve(
        self: Arc<Self>,
        addr: SocketAddr,
        cancel: CancellationToken,
    ) -> AppResult<()> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| AppError::Internal(format!("cannot bind metrics listener {addr}: {e}")))?;
        info!(%addr, "serving metrics");
        axum::serve(listener, self.router())
            .with_graceful_shutdown(async move { cancel.cancelled().await })
            .await
            .map_err(|e| AppError::Internal(format!("metrics server failed: {e}")))
    }
}

async fn metrics_handler(State(metrics): State<Arc<Metrics>>) -> Response {
    match metrics.render() {
        Ok(body) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        Err(err) => {
            warn!(error = %err, "cannot render metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response()
        }
    }
}

/// Metric handles owned by one account runtime
#[derive(Clone)]
pub struct AccountMetrics {
    moved: IntCounter,
    phase: IntGauge,
    cycles_ok: IntCounter,
    cycles_failed: IntCounter,
}

impl AccountMetrics {
    pub fn message_moved(&self) {
        self.moved.inc();
    }

    pub fn set_phase(&self, code: i64) {
        self.phase.set(code);
    }

    pub fn cycle_finished(&self, ok: bool) {
        if ok {
            self.cycles_ok.inc();
        } else {
            self.cycles_failed.inc();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::body::{Body, to_bytes};
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    use super::Metrics;

    #[test]
    fn account_series_are_labelled() {
        let metrics = Metrics::new().expect("registry");
        let home = metrics.account("home");
        home.message_moved();
        home.message_moved();
        home.set_phase(3);
        home.cycle_finished(true);
        home.cycle_finished(false);

        let text = metrics.render().expect("render");
        assert!(text.contains("smartmail_messages_moved_total{account=\"home\"} 2"));
        assert!(text.contains("smartmail_account_phase{account=\"home\"} 3"));
        assert!(text.contains("smartmail_handle_cycles_total{account=\"home\",outcome=\"ok\"} 1"));
        assert!(
            text.contains("smartmail_handle_cycles_total{account=\"home\",outcome=\"error\"} 1")
        );
    }

    #[test]
    fn registries_are_independent() {
        let first = Metrics::new().expect("registry");
        let second = Metrics::new().expect("registry");
        first.account("a").message_moved();
        let text = second.render().expect("render");
        assert!(!text.contains("account=\"a\""));
    }

    #[tokio::test]
    async fn endpoint_serves_text_exposition() {
        let metrics = Arc::new(Metrics::new().expect("registry"));
        metrics.account("work").message_moved();

        let response = metrics
            .clone()
            .router()
            .oneshot(
                Request::builder()
                    .uri("/metrics")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);

        let body = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body");
        let text = String::from_utf8(body.to_vec()).expect("utf8");
        assert!(text.contains("smartmail_messages_moved_total{account=\"work\"} 1"));
    }

    #[tokio::test]
    async fn unknown_paths_are_not_found() {
        let metrics = Arc::new(Metrics::new().expect("registry"));
        let response = metrics
            .router()
            .oneshot(
                Request::builder()
                    .uri("/")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
