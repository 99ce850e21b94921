pub(crate) mod health;
pub(crate) mod metrics;
pub(crate) mod reports;

use axum::{
    Router,
    routing::{get, post},
};
use tower_http::trace::TraceLayer;

use crate::app::AppState;

pub(crate) fn router(state: AppState) -> Router {
    Router::new()
        .route("/health/ready", get(health::ready))
        .route("/health/live", get(health::live))
        .route("/metrics", get(metrics::exporter))
        .route(
            "/v1/reports",
            post(reports::request_report).get(reports::list_reports),
        )
        .route(
            "/v1/reports/{id}",
            get(reports::get_report).delete(reports::delete_report),
        )
        .route("/v1/reports/{id}/clusters", get(reports::list_clusters))
        .route(
            "/v1/reports/{id}/clusters/{cluster_id}/questions",
            get(reports::list_cluster_questions),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
