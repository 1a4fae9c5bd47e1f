use crate::metrics::Metrics;
use crate::stats::StatsTracker;
use axum::body::Body;
use axum::extract::State;
use axum::http::{header::CONTENT_TYPE, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::{routing::get, Json, Router};
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Clone)]
pub struct HttpAppState {
    pub metrics: Arc<Metrics>,
    pub stats: Arc<RwLock<StatsTracker>>,
}

pub fn build_router(metrics: Arc<Metrics>, stats: Arc<RwLock<StatsTracker>>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics_handler))
        .route("/api/stats", get(stats_handler))
        .with_state(HttpAppState { metrics, stats })
}

async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

async fn metrics_handler(State(state): State<HttpAppState>) -> Response {
    state.metrics.inc_scrape_count();
    let report = state.stats.read().await.report();
    state.metrics.update_from_report(&report);

    match state.metrics.encode_metrics() {
        Ok(encoded) => {
            let mut response = Response::new(Body::from(encoded));
            response.headers_mut().insert(
                CONTENT_TYPE,
                HeaderValue::from_static("text/plain; version=0.0.4"),
            );
            response
        }
        Err(err) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("ошибка кодирования метрик: {err}"),
        )
            .into_response(),
    }
}

async fn stats_handler(State(state): State<HttpAppState>) -> impl IntoResponse {
    let report = state.stats.read().await.report();
    Json(report)
}
