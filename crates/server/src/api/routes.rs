use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use imgpress_core::{ImageEncoder, ObjectStore};

use super::middleware::metrics_middleware;
use super::{convert, handlers, ws};
use crate::state::AppState;

pub fn create_router<S, E>(state: Arc<AppState<S, E>>) -> Router
where
    S: ObjectStore + 'static,
    E: ImageEncoder + 'static,
{
    // API routes
    let api_routes = Router::new()
        // Health and config
        .route("/health", get(handlers::health))
        .route("/config", get(handlers::get_config::<S, E>))
        // Conversion
        .route("/images/convert", post(convert::start_conversion::<S, E>))
        .route("/images/convert/status", get(convert::get_status::<S, E>))
        .route("/images/convert/progress", get(convert::get_progress::<S, E>))
        // Live progress
        .route("/ws/progress", get(ws::ws_handler::<S, E>))
        .route_layer(middleware::from_fn(metrics_middleware))
        .with_state(Arc::clone(&state));

    Router::new()
        .nest("/api/v1", api_routes)
        .route("/metrics", get(handlers::metrics::<S, E>))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}
