use axum::{
    extract::{Path, State},
    response::IntoResponse,
    Json,
};
use serde_json::json;
use tracing::{debug, info};

use crate::error::HubError;
use crate::protocol::PublishRequest;
use crate::router::AppState;

// Handler for POST /v0/conversions/:conversion_id/events
pub async fn publish_event(
    State(state): State<AppState>,
    Path(conversion_id): Path<String>,
    Json(request): Json<PublishRequest>,
) -> Result<impl IntoResponse, HubError> {
    if conversion_id.trim().is_empty() {
        return Err(HubError::InvalidId("conversion_id"));
    }

    let message = request.into_server_message(&conversion_id);
    let delivered = state.manager.broadcast_to_conversion(&conversion_id, &message);
    if delivered == 0 {
        debug!("No live sockets for conversion {}; event kept for replay", conversion_id);
    } else {
        info!("Published event for conversion {} to {} sockets", conversion_id, delivered);
    }

    Ok(Json(json!({ "delivered": delivered })))
}

// Handler for GET /v0/conversions/:conversion_id/connections
pub async fn list_connections(
    State(state): State<AppState>,
    Path(conversion_id): Path<String>,
) -> impl IntoResponse {
    debug!("Listing connections for conversion: {}", conversion_id);
    Json(state.manager.conversion_connections(&conversion_id))
}
