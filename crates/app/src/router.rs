use std::{collections::BTreeMap, sync::Arc};

use axum::{
    body::Body,
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use chrono::{DateTime, Utc};
use metrics_exporter_prometheus::PrometheusHandle;
use payhook_core::{Gateway, GatewaySettings, HandlerRegistry, WebhookProcessor};
use payhook_storage::Database;

use crate::{telemetry, webhook};

#[derive(Clone)]
pub struct AppState {
    metrics: PrometheusHandle,
    storage: Database,
    processor: WebhookProcessor,
    registry: Arc<HandlerRegistry>,
    gateways: Arc<BTreeMap<Gateway, GatewaySettings>>,
    clock: Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>,
}

impl AppState {
    /// Wires the processor to the SQLite dedup table.
    pub fn new(
        metrics: PrometheusHandle,
        storage: Database,
        registry: HandlerRegistry,
        gateways: BTreeMap<Gateway, GatewaySettings>,
    ) -> Self {
        let processor = WebhookProcessor::new(Arc::new(storage.dedup()));
        Self {
            metrics,
            storage,
            processor,
            registry: Arc::new(registry),
            gateways: Arc::new(gateways),
            clock: Arc::new(Utc::now),
        }
    }

    #[cfg(test)]
    pub fn with_clock(mut self, clock: Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>) -> Self {
        self.clock = clock;
        self
    }

    pub fn metrics(&self) -> &PrometheusHandle {
        &self.metrics
    }

    pub fn storage(&self) -> &Database {
        &self.storage
    }

    pub fn processor(&self) -> &WebhookProcessor {
        &self.processor
    }

    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    /// Settings for an enabled gateway. `None` means the endpoint is off.
    pub fn gateway(&self, gateway: Gateway) -> Option<&GatewaySettings> {
        self.gateways.get(&gateway)
    }

    pub fn now(&self) -> DateTime<Utc> {
        (self.clock)()
    }
}

pub fn app_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics))
        .route("/webhooks/:gateway", post(webhook::handle))
        .with_state(state)
}

async fn healthz() -> StatusCode {
    StatusCode::OK
}

async fn metrics(State(state): State<AppState>) -> Response {
    let body = telemetry::render_metrics(state.metrics());
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        Body::from(body),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tempfile::TempDir;
    use tower::ServiceExt;

    async fn setup_state() -> (AppState, TempDir) {
        let metrics = telemetry::init_metrics().expect("metrics init");
        let dir = tempfile::tempdir().expect("tempdir");
        let url = format!("sqlite://{}?mode=rwc", dir.path().join("router.db").display());
        let database = Database::connect(&url).await.expect("connect");
        database.run_migrations().await.expect("migrations");

        let state = AppState::new(metrics, database, HandlerRegistry::new(), BTreeMap::new());
        (state, dir)
    }

    #[tokio::test]
    async fn healthz_returns_ok() {
        let (state, _dir) = setup_state().await;
        let app = app_router(state);

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/healthz")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .expect("handler should respond");

        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn metrics_exports_build_info() {
        let (state, _dir) = setup_state().await;
        let app = app_router(state);

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/metrics")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .expect("handler should respond");

        assert_eq!(response.status(), StatusCode::OK);
        let collected = response
            .into_body()
            .collect()
            .await
            .expect("body should read");
        let body = String::from_utf8(collected.to_bytes().to_vec()).expect("utf-8");
        assert!(body.contains("app_build_info"));
        assert!(body.contains("app_uptime_seconds"));
    }

    #[tokio::test]
    async fn webhooks_only_accept_post() {
        let (state, _dir) = setup_state().await;
        let app = app_router(state);

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/webhooks/stripe")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .expect("handler should respond");

        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
    }
}
