//! WebSocket transport for the sync client.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use log::{debug, info, warn};
use parking_lot::Mutex;
use parley_protocol::{Channel, ClientMessage, MarkerAction, ServerMessage};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::{
    Message,
    client::IntoClientRequest,
    http::{HeaderValue, header::AUTHORIZATION},
};
use tokio_util::sync::CancellationToken;

use crate::config::SyncConfig;

use super::{SubscribeAck, SubscriptionTransport, SyncError, SyncHandle};

/// What the transport observed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// The server welcomed a new connection.
    Connected,
    Disconnected,
    Marker {
        channel: Channel,
        action: MarkerAction,
    },
}

struct ClientInner {
    url: String,
    token: String,
    subscribe_timeout: Duration,
    reconnect_backoff: Duration,
    reconnect_backoff_max: Duration,
    /// Outbound queue of the live connection, if any.
    outbound: Mutex<Option<mpsc::UnboundedSender<ClientMessage>>>,
    /// Subscribe requests waiting for confirm/reject.
    pending: Mutex<HashMap<Channel, Vec<oneshot::Sender<SubscribeAck>>>>,
}

/// Reconnecting WebSocket client for the hub.
#[derive(Clone)]
pub struct WsSyncClient {
    inner: Arc<ClientInner>,
}

impl WsSyncClient {
    /// `base_url` is the server's HTTP(S) origin, e.g. `http://localhost:8480`.
    pub fn new(base_url: &str, token: impl Into<String>, config: &SyncConfig) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                url: ws_url(base_url),
                token: token.into(),
                subscribe_timeout: config.subscribe_timeout(),
                reconnect_backoff: config.reconnect_backoff(),
                reconnect_backoff_max: config.reconnect_backoff_max(),
                outbound: Mutex::new(None),
                pending: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn url(&self) -> &str {
        &self.inner.url
    }

    pub fn is_connected(&self) -> bool {
        self.inner.outbound.lock().is_some()
    }

    /// Keep a connection open until `cancel` fires, reconnecting with
    /// exponential backoff.
    pub fn run(
        &self,
        events: mpsc::UnboundedSender<TransportEvent>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let inner = self.inner.clone();
        tokio::spawn(async move {
            let mut backoff = inner.reconnect_backoff;
            loop {
                if cancel.is_cancelled() {
                    break;
                }

                match connect(&inner).await {
                    Ok(socket) => {
                        info!("Connected to {}", inner.url);
                        backoff = inner.reconnect_backoff;
                        run_session(&inner, socket, &events, &cancel).await;
                        inner.close_session();
                        let _ = events.send(TransportEvent::Disconnected);
                    }
                    Err(e) => warn!("Failed to connect to {}: {:#}", inner.url, e),
                }

                if cancel.is_cancelled() {
                    break;
                }
                debug!("Reconnecting in {:?}", backoff);
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(backoff) => {}
                }
                backoff = (backoff * 2).min(inner.reconnect_backoff_max);
            }
            debug!("Sync transport stopped");
        })
    }
}

impl ClientInner {
    fn close_session(&self) {
        *self.outbound.lock() = None;
        // Dropping the senders fails the waiting subscribers.
        self.pending.lock().clear();
    }

    fn resolve(&self, channel: &Channel, ack: SubscribeAck) {
        if let Some(waiters) = self.pending.lock().remove(channel) {
            for waiter in waiters {
                let _ = waiter.send(ack);
            }
        }
    }

    fn send(&self, message: ClientMessage) -> Result<(), SyncError> {
        let outbound = self.outbound.lock();
        let Some(tx) = outbound.as_ref() else {
            return Err(SyncError::Disconnected);
        };
        tx.send(message).map_err(|_| SyncError::Disconnected)
    }
}

#[async_trait]
impl SubscriptionTransport for WsSyncClient {
    async fn subscribe(&self, channel: &Channel) -> Result<SubscribeAck, SyncError> {
        let (tx, rx) = oneshot::channel();
        self.inner
            .pending
            .lock()
            .entry(channel.clone())
            .or_default()
            .push(tx);

        if let Err(e) = self.inner.send(ClientMessage::Subscribe {
            identifier: channel.identifier(),
        }) {
            self.inner.pending.lock().remove(channel);
            return Err(e);
        }

        match tokio::time::timeout(self.inner.subscribe_timeout, rx).await {
            Ok(Ok(ack)) => Ok(ack),
            Ok(Err(_)) => Err(SyncError::Disconnected),
            Err(_) => {
                self.inner.pending.lock().remove(channel);
                Err(SyncError::Timeout(channel.clone()))
            }
        }
    }

    async fn unsubscribe(&self, channel: &Channel) -> Result<(), SyncError> {
        self.inner.send(ClientMessage::Unsubscribe {
            identifier: channel.identifier(),
        })
    }
}

type Socket =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

async fn connect(inner: &ClientInner) -> Result<Socket> {
    let mut request = inner
        .url
        .as_str()
        .into_client_request()
        .with_context(|| format!("invalid WebSocket URL {}", inner.url))?;
    let bearer = HeaderValue::from_str(&format!("Bearer {}", inner.token))
        .context("token is not a valid header value")?;
    request.headers_mut().insert(AUTHORIZATION, bearer);

    let (socket, _response) = connect_async(request)
        .await
        .context("WebSocket handshake failed")?;
    Ok(socket)
}

async fn run_session(
    inner: &ClientInner,
    socket: Socket,
    events: &mpsc::UnboundedSender<TransportEvent>,
    cancel: &CancellationToken,
) {
    let (mut sink, mut stream) = socket.split();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<ClientMessage>();
    let mut welcomed = false;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = sink.close().await;
                return;
            }
            Some(command) = out_rx.recv() => {
                let json = match serde_json::to_string(&command) {
                    Ok(json) => json,
                    Err(e) => {
                        warn!("Failed to serialize command: {}", e);
                        continue;
                    }
                };
                if let Err(e) = sink.send(Message::Text(json.into())).await {
                    warn!("WebSocket send failed: {}", e);
                    return;
                }
            }
            frame = stream.next() => {
                let text = match frame {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Close(_))) | None => return,
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        warn!("WebSocket error: {}", e);
                        return;
                    }
                };
                let message = match serde_json::from_str::<ServerMessage>(text.as_str()) {
                    Ok(message) => message,
                    Err(e) => {
                        debug!("Ignoring unparseable server message: {}", e);
                        continue;
                    }
                };

                match message {
                    ServerMessage::Welcome { connection_id } => {
                        if !welcomed {
                            welcomed = true;
                            debug!("Welcomed as connection {}", connection_id);
                            // Subscribes go out through this queue from now on.
                            *inner.outbound.lock() = Some(out_tx.clone());
                            let _ = events.send(TransportEvent::Connected);
                        }
                    }
                    ServerMessage::Ping => {
                        let _ = out_tx.send(ClientMessage::Pong);
                    }
                    ServerMessage::ConfirmSubscription { identifier } => {
                        if let Ok(channel) = Channel::try_from(identifier) {
                            inner.resolve(&channel, SubscribeAck::Confirmed);
                        }
                    }
                    ServerMessage::RejectSubscription { identifier } => {
                        if let Ok(channel) = Channel::try_from(identifier) {
                            inner.resolve(&channel, SubscribeAck::Rejected);
                        }
                    }
                    ServerMessage::Message { identifier, message } => {
                        match Channel::try_from(identifier) {
                            Ok(channel) => {
                                let _ = events.send(TransportEvent::Marker {
                                    channel,
                                    action: message.action,
                                });
                            }
                            Err(e) => debug!("Marker for unparseable channel: {}", e),
                        }
                    }
                    ServerMessage::Error { message } => {
                        warn!("Server reported an error: {}", message);
                    }
                }
            }
        }
    }
}

/// Feed transport events into a multiplexer until either side goes away.
pub async fn forward_events(
    handle: SyncHandle,
    mut events: mpsc::UnboundedReceiver<TransportEvent>,
) {
    while let Some(event) = events.recv().await {
        let delivered = match event {
            TransportEvent::Connected => handle.on_connected(),
            TransportEvent::Disconnected => handle.on_disconnected(),
            TransportEvent::Marker { channel, .. } => handle.on_event(channel),
        };
        if delivered.is_err() {
            break;
        }
    }
}

/// Map an HTTP origin to the hub's WebSocket endpoint.
fn ws_url(base_url: &str) -> String {
    let base = base_url.trim().trim_end_matches('/');
    let base = if let Some(rest) = base.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = base.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        base.to_string()
    };
    format!("{base}/api/ws")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ws_url() {
        assert_eq!(ws_url("http://localhost:8480"), "ws://localhost:8480/api/ws");
        assert_eq!(ws_url("https://chat.example.com/"), "wss://chat.example.com/api/ws");
        assert_eq!(ws_url("ws://127.0.0.1:9000"), "ws://127.0.0.1:9000/api/ws");
    }

    #[tokio::test]
    async fn test_subscribe_without_connection_fails_fast() {
        let client = WsSyncClient::new("http://127.0.0.1:1", "t", &SyncConfig::default());
        let channel = Channel::collection(parley_protocol::EntityType::User);
        assert_eq!(
            client.subscribe(&channel).await,
            Err(SyncError::Disconnected)
        );
        assert!(client.inner.pending.lock().is_empty());
        assert!(!client.is_connected());
    }
}
