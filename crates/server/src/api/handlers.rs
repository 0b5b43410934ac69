use axum::{extract::State, http::header, response::IntoResponse, Json};
use serde::Serialize;
use std::sync::Arc;

use imgpress_core::{Config, ImageEncoder, ObjectStore};

use crate::metrics::{collect_dynamic_metrics, encode_metrics};
use crate::state::AppState;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
}

pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
    })
}

pub async fn get_config<S, E>(State(state): State<Arc<AppState<S, E>>>) -> Json<Config>
where
    S: ObjectStore + 'static,
    E: ImageEncoder + 'static,
{
    Json(state.config().clone())
}

/// Prometheus scrape endpoint.
pub async fn metrics<S, E>(State(state): State<Arc<AppState<S, E>>>) -> impl IntoResponse
where
    S: ObjectStore + 'static,
    E: ImageEncoder + 'static,
{
    collect_dynamic_metrics(&state).await;
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        encode_metrics(),
    )
}
