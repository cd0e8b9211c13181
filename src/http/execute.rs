//! `POST /execute`: the Execution Dispatcher's HTTP face.

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};

use crate::dispatch::{DispatchOutcome, ExecuteRequest, ExecuteResponse};
use crate::state::AppState;

pub fn routes() -> Router<AppState> {
    Router::new().route("/execute", post(execute))
}

async fn execute(
    State(state): State<AppState>,
    Json(request): Json<ExecuteRequest>,
) -> (StatusCode, Json<ExecuteResponse>) {
    match state.dispatcher().execute(request).await {
        DispatchOutcome::BadRequest { request_id, message } => (
            StatusCode::BAD_REQUEST,
            Json(ExecuteResponse {
                request_id,
                success: false,
                error: message,
                ..Default::default()
            }),
        ),
        DispatchOutcome::Saturation { request_id } => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ExecuteResponse {
                request_id,
                success: false,
                error: "No available VMs".to_string(),
                ..Default::default()
            }),
        ),
        DispatchOutcome::Envelope(response) => (StatusCode::OK, Json(response)),
    }
}
