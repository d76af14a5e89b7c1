use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use thiserror::Error;
use uuid::Uuid;

/// Errors raised by the connection manager and surfaced by the HTTP layer.
#[derive(Debug, Error)]
pub enum HubError {
    #[error("invalid {0}: must not be empty")]
    InvalidId(&'static str),

    #[error("conversion {conversion_id} already has {limit} connections")]
    ConversionFull { conversion_id: String, limit: usize },

    #[error("unknown connection {0}")]
    UnknownConnection(Uuid),

    #[error("connection {0} is closed")]
    SendFailed(Uuid),

    #[error("client {0} exceeded the message rate limit")]
    RateLimited(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl HubError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            HubError::InvalidId(_) => StatusCode::BAD_REQUEST,
            HubError::ConversionFull { .. } => StatusCode::CONFLICT,
            HubError::UnknownConnection(_) => StatusCode::NOT_FOUND,
            HubError::SendFailed(_) => StatusCode::GONE,
            HubError::RateLimited(_) => StatusCode::TOO_MANY_REQUESTS,
            HubError::Serialization(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for HubError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = Json(serde_json::json!({ "error": self.to_string() }));
        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_errors_to_http_status() {
        assert_eq!(HubError::InvalidId("client_id").status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(
            HubError::ConversionFull { conversion_id: "job".into(), limit: 2 }.status_code(),
            StatusCode::CONFLICT
        );
        assert_eq!(HubError::UnknownConnection(Uuid::nil()).status_code(), StatusCode::NOT_FOUND);
        assert_eq!(HubError::RateLimited("c".into()).status_code(), StatusCode::TOO_MANY_REQUESTS);
    }

    #[test]
    fn message_names_the_conversion() {
        let err = HubError::ConversionFull { conversion_id: "job-7".into(), limit: 3 };
        assert_eq!(err.to_string(), "conversion job-7 already has 3 connections");
    }
}
