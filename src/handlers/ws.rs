use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    response::IntoResponse,
};
use futures::{
    sink::{Sink, SinkExt},
    stream::StreamExt,
};
use serde::Deserialize;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::HubError;
use crate::manager::Outbound;
use crate::protocol::{codes, ServerMessage};
use crate::router::AppState;

#[derive(Deserialize, Debug, Default)]
pub struct ConnectParams {
    pub client_id: Option<String>,
    pub user_id: Option<String>,
}

// Handler for GET /ws/:conversion_id
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Path(conversion_id): Path<String>,
    Query(params): Query<ConnectParams>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    // Anonymous clients get a fresh id, which also gives them their own rate limit bucket
    let client_id = params
        .client_id
        .filter(|c| !c.trim().is_empty())
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    let user_id = params.user_id;

    ws.on_upgrade(move |socket| handle_socket(socket, state, conversion_id, client_id, user_id))
}

async fn handle_socket(
    stream: WebSocket,
    state: AppState,
    conversion_id: String,
    client_id: String,
    user_id: Option<String>,
) {
    let (mut sender_ws, mut receiver_ws) = stream.split();
    let (sender_tx, receiver_tx) = unbounded_channel::<Outbound>();

    let admitted = state
        .manager
        .connect(&conversion_id, &client_id, user_id, sender_tx);
    let connection_id = match admitted {
        Ok(id) => id,
        Err(e) => {
            warn!(
                conversion_id = %conversion_id,
                client_id = %client_id,
                error = %e,
                "WebSocket connection rejected"
            );
            let notice = ServerMessage::error(codes::CONNECTION_REJECTED, e.to_string());
            if let Ok(text) = notice.to_json() {
                let _ = sender_ws.send(Message::Text(text)).await;
            }
            let _ = sender_ws.send(Message::Close(None)).await;
            return;
        }
    };

    // Task: forward messages from the manager's channel to the websocket
    let mut send_task = tokio::spawn(forward_outbound(receiver_tx, sender_ws));

    // Task: feed client frames into the manager
    let manager = state.manager.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver_ws.next().await {
            match msg {
                Message::Text(text) => match manager.handle_client_text(connection_id, &text) {
                    Ok(()) | Err(HubError::RateLimited(_)) => {}
                    Err(e) => {
                        debug!(%connection_id, error = %e, "Stopping reader");
                        break;
                    }
                },
                Message::Binary(_) | Message::Ping(_) | Message::Pong(_) => {
                    manager.touch(connection_id);
                }
                Message::Close(_) => break,
            }
        }
    });

    // Whichever side finishes first tears down the other
    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    state.manager.disconnect(connection_id);
}

async fn forward_outbound<S>(mut receiver_tx: UnboundedReceiver<Outbound>, mut sender_ws: S)
where
    S: Sink<Message> + Unpin,
{
    while let Some(outbound) = receiver_tx.recv().await {
        match outbound {
            Outbound::Text(text) => {
                if sender_ws.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
            Outbound::Close => {
                let _ = sender_ws.send(Message::Close(None)).await;
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::channel::mpsc;

    #[tokio::test]
    async fn forwards_text_until_close() {
        let (tx, rx) = unbounded_channel();
        let (sink, mut frames) = mpsc::unbounded::<Message>();

        tx.send(Outbound::Text("one".to_string())).unwrap();
        tx.send(Outbound::Close).unwrap();
        tx.send(Outbound::Text("never".to_string())).unwrap();

        forward_outbound(rx, sink).await;

        assert!(matches!(frames.next().await, Some(Message::Text(t)) if t == "one"));
        assert!(matches!(frames.next().await, Some(Message::Close(None))));
        assert!(frames.next().await.is_none());
    }

    #[tokio::test]
    async fn stops_when_channel_closes() {
        let (tx, rx) = unbounded_channel();
        let (sink, mut frames) = mpsc::unbounded::<Message>();

        tx.send(Outbound::Text("last".to_string())).unwrap();
        drop(tx);

        forward_outbound(rx, sink).await;
        assert!(matches!(frames.next().await, Some(Message::Text(t)) if t == "last"));
        assert!(frames.next().await.is_none());
    }
}
