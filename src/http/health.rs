//! `GET /health` and `GET /languages`.

use axum::routing::get;
use axum::{Json, Router};
use chrono::Utc;
use serde::Serialize;

use crate::dispatch::SUPPORTED_LANGUAGES;
use crate::state::AppState;

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    time: i64,
}

#[derive(Debug, Serialize)]
struct LanguagesResponse {
    languages: &'static [&'static str],
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/languages", get(languages))
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        time: Utc::now().timestamp(),
    })
}

async fn languages() -> Json<LanguagesResponse> {
    Json(LanguagesResponse {
        languages: &SUPPORTED_LANGUAGES[..],
    })
}
