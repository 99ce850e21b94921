use axum::{
    extract::State,
    http::{StatusCode, header},
    response::IntoResponse,
};

use crate::app::AppState;

pub(crate) async fn exporter(State(state): State<AppState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.telemetry().render_prometheus(),
    )
        .into_response()
}
