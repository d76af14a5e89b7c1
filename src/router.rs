use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::handlers::conversions::{list_connections, publish_event};
use crate::handlers::health::{health, stats};
use crate::handlers::ws::ws_handler;
use crate::manager::ConnectionManager;

#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<ConnectionManager>,
}

pub fn create_router(manager: Arc<ConnectionManager>) -> Router {
    let app_state = AppState { manager };

    Router::new()
        .route("/ws/:conversion_id", get(ws_handler))
        .route("/v0/conversions/:conversion_id/events", post(publish_event))
        .route("/v0/conversions/:conversion_id/connections", get(list_connections))
        .route("/v0/stats", get(stats))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(app_state)
}
