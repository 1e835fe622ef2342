//! WebSocket endpoint for the hub.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{
        State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    response::Response,
};
use futures::{SinkExt, StreamExt};
use log::{debug, info, warn};
use parley_protocol::{Channel, ClientMessage, ServerMessage};
use tokio::time::{Instant, interval_at};

use crate::api::{ApiError, AppState};
use crate::auth::{CurrentUser, Principal};

use super::{ConnectionId, Hub};

/// WebSocket upgrade handler.
///
/// GET /api/ws
pub async fn ws_handler(
    State(state): State<AppState>,
    user: CurrentUser,
    ws: WebSocketUpgrade,
) -> Result<Response, ApiError> {
    if !state.hub.is_running() {
        return Err(ApiError::ServiceUnavailable("hub is not running".into()));
    }

    let principal = user.principal();
    info!("WebSocket upgrade request from {}", principal);

    let hub = state.hub.clone();
    let ping_interval = state.sync.ping_interval();
    Ok(ws.on_upgrade(move |socket| handle_connection(socket, hub, principal, ping_interval)))
}

async fn handle_connection(
    socket: WebSocket,
    hub: Arc<Hub>,
    principal: Principal,
    ping_interval: Duration,
) {
    let (conn_id, mut outbound) = match hub.connect(principal) {
        Ok(connected) => connected,
        Err(e) => {
            warn!("Refusing WebSocket connection: {}", e);
            return;
        }
    };

    let (mut sender, mut receiver) = socket.split();

    let mut send_task = tokio::spawn(async move {
        let mut ping = interval_at(Instant::now() + ping_interval, ping_interval);
        loop {
            let message = tokio::select! {
                queued = outbound.recv() => match queued {
                    Some(message) => message,
                    // Evicted or hub stopped.
                    None => break,
                },
                _ = ping.tick() => ServerMessage::Ping,
            };

            let json = match serde_json::to_string(&message) {
                Ok(json) => json,
                Err(e) => {
                    warn!("Failed to serialize hub message: {}", e);
                    continue;
                }
            };
            if sender.send(Message::Text(json.into())).await.is_err() {
                break;
            }
        }
        let _ = sender.close().await;
    });

    loop {
        tokio::select! {
            frame = receiver.next() => match frame {
                Some(Ok(Message::Text(text))) => handle_text(&hub, conn_id, text.as_str()).await,
                Some(Ok(Message::Binary(_))) => {
                    debug!("Connection {} sent a binary frame, ignoring", conn_id);
                }
                Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {}
                Some(Ok(Message::Close(_))) | None => break,
                Some(Err(e)) => {
                    warn!("WebSocket error on connection {}: {}", conn_id, e);
                    break;
                }
            },
            // Send side ended, e.g. the connection was evicted.
            _ = &mut send_task => {
                debug!("Outbound queue of connection {} closed", conn_id);
                break;
            }
        }
    }

    send_task.abort();
    hub.disconnect(conn_id);
}

async fn handle_text(hub: &Hub, conn_id: ConnectionId, text: &str) {
    let command = match serde_json::from_str::<ClientMessage>(text) {
        Ok(command) => command,
        Err(e) => {
            warn!("Connection {} sent an unparseable command: {}", conn_id, e);
            let _ = hub.send(
                conn_id,
                ServerMessage::Error {
                    message: format!("invalid command: {e}"),
                },
            );
            return;
        }
    };

    match command {
        ClientMessage::Pong => {}
        ClientMessage::Subscribe { identifier } => {
            if let Err(e) = hub.subscribe(conn_id, identifier).await {
                debug!("Subscribe on connection {} failed: {}", conn_id, e);
            }
        }
        ClientMessage::Unsubscribe { identifier } => match Channel::try_from(identifier) {
            Ok(channel) => {
                let _ = hub.unsubscribe(conn_id, &channel);
            }
            Err(e) => {
                let _ = hub.send(
                    conn_id,
                    ServerMessage::Error {
                        message: e.to_string(),
                    },
                );
            }
        },
    }
}
