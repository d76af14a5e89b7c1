//! JSON frames exchanged with WebSocket clients and conversion workers.
//!
//! Every frame is an object tagged by `type`. Server frames always carry a
//! `timestamp` so clients can order updates that race across reconnects.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::manager::ConnectionInfo;

/// Error codes carried by `error` frames.
pub mod codes {
    pub const INVALID_MESSAGE: &str = "invalid_message";
    pub const RATE_LIMITED: &str = "rate_limited";
    pub const CONNECTION_REJECTED: &str = "connection_rejected";
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    ConnectionEstablished {
        connection_id: Uuid,
        conversion_id: String,
        client_id: String,
        timestamp: DateTime<Utc>,
    },
    ProgressUpdate {
        conversion_id: String,
        progress: u8,
        stage: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
        timestamp: DateTime<Utc>,
    },
    StatusChange {
        conversion_id: String,
        status: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
        timestamp: DateTime<Utc>,
    },
    ConversionComplete {
        conversion_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<serde_json::Value>,
        timestamp: DateTime<Utc>,
    },
    ConversionFailed {
        conversion_id: String,
        error: String,
        timestamp: DateTime<Utc>,
    },
    Heartbeat {
        timestamp: DateTime<Utc>,
    },
    Pong {
        timestamp: DateTime<Utc>,
    },
    Status {
        connection: ConnectionInfo,
        timestamp: DateTime<Utc>,
    },
    Error {
        code: String,
        message: String,
        timestamp: DateTime<Utc>,
    },
}

impl ServerMessage {
    pub fn heartbeat() -> Self {
        ServerMessage::Heartbeat { timestamp: Utc::now() }
    }

    pub fn pong() -> Self {
        ServerMessage::Pong { timestamp: Utc::now() }
    }

    pub fn error(code: &str, message: impl Into<String>) -> Self {
        ServerMessage::Error {
            code: code.to_string(),
            message: message.into(),
            timestamp: Utc::now(),
        }
    }

    /// Job-scoped frames are kept in the per-conversion history and replayed
    /// to late joiners. Connection-level frames are not.
    pub fn is_conversion_event(&self) -> bool {
        matches!(
            self,
            ServerMessage::ProgressUpdate { .. }
                | ServerMessage::StatusChange { .. }
                | ServerMessage::ConversionComplete { .. }
                | ServerMessage::ConversionFailed { .. }
        )
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Ping,
    HeartbeatAck,
    GetStatus,
}

impl ClientMessage {
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

/// Body accepted from conversion workers on the publish endpoint. The
/// conversion id comes from the request path.
#[derive(Deserialize, Debug, Clone)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PublishRequest {
    ProgressUpdate {
        progress: f64,
        stage: String,
        #[serde(default)]
        message: Option<String>,
    },
    StatusChange {
        status: String,
        #[serde(default)]
        message: Option<String>,
    },
    ConversionComplete {
        #[serde(default)]
        result: Option<serde_json::Value>,
    },
    ConversionFailed {
        error: String,
    },
}

impl PublishRequest {
    pub fn into_server_message(self, conversion_id: &str) -> ServerMessage {
        let conversion_id = conversion_id.to_string();
        let timestamp = Utc::now();
        match self {
            PublishRequest::ProgressUpdate {
                progress,
                stage,
                message,
            } => ServerMessage::ProgressUpdate {
                conversion_id,
                progress: clamp_progress(progress),
                stage,
                message,
                timestamp,
            },
            PublishRequest::StatusChange { status, message } => ServerMessage::StatusChange {
                conversion_id,
                status,
                message,
                timestamp,
            },
            PublishRequest::ConversionComplete { result } => ServerMessage::ConversionComplete {
                conversion_id,
                result,
                timestamp,
            },
            PublishRequest::ConversionFailed { error } => ServerMessage::ConversionFailed {
                conversion_id,
                error,
                timestamp,
            },
        }
    }
}

fn clamp_progress(progress: f64) -> u8 {
    if progress.is_nan() {
        return 0;
    }
    progress.round().clamp(0.0, 100.0) as u8
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    #[test]
    fn server_frames_are_tagged_snake_case() {
        let json = ServerMessage::heartbeat().to_json().unwrap();
        let value: Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["type"], "heartbeat");
        assert!(value["timestamp"].is_string());
    }

    #[test]
    fn progress_update_omits_empty_message() {
        let msg = PublishRequest::ProgressUpdate {
            progress: 42.4,
            stage: "analyzing".to_string(),
            message: None,
        }
        .into_server_message("job-1");
        let value: Value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["type"], "progress_update");
        assert_eq!(value["conversion_id"], "job-1");
        assert_eq!(value["progress"], 42);
        assert!(value.get("message").is_none());
    }

    #[test]
    fn progress_is_clamped() {
        assert_eq!(clamp_progress(-5.0), 0);
        assert_eq!(clamp_progress(150.0), 100);
        assert_eq!(clamp_progress(f64::NAN), 0);
        assert_eq!(clamp_progress(99.6), 100);
    }

    #[test]
    fn parses_client_messages() {
        assert_eq!(ClientMessage::parse(r#"{"type":"ping"}"#).unwrap(), ClientMessage::Ping);
        assert_eq!(
            ClientMessage::parse(r#"{"type":"heartbeat_ack"}"#).unwrap(),
            ClientMessage::HeartbeatAck
        );
        assert_eq!(
            ClientMessage::parse(r#"{"type":"get_status"}"#).unwrap(),
            ClientMessage::GetStatus
        );
        assert!(ClientMessage::parse(r#"{"type":"subscribe"}"#).is_err());
        assert!(ClientMessage::parse("not json").is_err());
    }

    #[test]
    fn only_job_frames_are_conversion_events() {
        assert!(!ServerMessage::heartbeat().is_conversion_event());
        assert!(!ServerMessage::error(codes::RATE_LIMITED, "slow down").is_conversion_event());
        let failed =
            PublishRequest::ConversionFailed { error: "boom".into() }.into_server_message("j");
        assert!(failed.is_conversion_event());
    }
}
