//! Connection and subscription registry.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use log::{debug, info, warn};
use parking_lot::Mutex;
use parley_protocol::{ChangeEvent, Channel, ChannelIdentifier, ServerMessage};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::auth::Principal;
use crate::authority::ChannelAuthority;
use crate::notify::{PublishError, Publisher};

/// Default per-connection outbound queue depth.
pub const CONNECTION_BUFFER_SIZE: usize = 64;

pub type ConnectionId = u64;

/// Outbound queue of one connection.
pub type HubSender = mpsc::Sender<ServerMessage>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum HubError {
    #[error("hub is not running")]
    Stopped,

    #[error("unknown connection {0}")]
    UnknownConnection(ConnectionId),

    /// The connection could not keep up and was dropped.
    #[error("outbound queue of connection {0} is full")]
    QueueFull(ConnectionId),
}

/// Result of a subscribe request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscribeOutcome {
    Confirmed,
    Rejected,
}

struct Connection {
    principal: Principal,
    tx: HubSender,
    /// Reverse index, for cleanup on disconnect.
    channels: BTreeSet<Channel>,
}

#[derive(Default)]
struct HubState {
    running: bool,
    connections: HashMap<ConnectionId, Connection>,
    subscribers: HashMap<Channel, BTreeSet<ConnectionId>>,
}

impl HubState {
    /// Drop a connection and every subscription it holds.
    fn remove_connection(&mut self, id: ConnectionId) -> Option<Connection> {
        let connection = self.connections.remove(&id)?;
        for channel in &connection.channels {
            self.unindex(channel, id);
        }
        Some(connection)
    }

    fn unindex(&mut self, channel: &Channel, id: ConnectionId) {
        if let Some(ids) = self.subscribers.get_mut(channel) {
            ids.remove(&id);
            if ids.is_empty() {
                self.subscribers.remove(channel);
            }
        }
    }
}

/// Process-wide broker.
///
/// All indices live behind one mutex so that subscribe, publish and disconnect
/// never interleave half-way. Delivery is a non-blocking enqueue onto the
/// connection's queue; the lock is never held across an await.
pub struct Hub {
    state: Mutex<HubState>,
    authority: Arc<dyn ChannelAuthority>,
    buffer_size: usize,
    next_id: AtomicU64,
}

impl Hub {
    /// Create a stopped hub. Call [`Hub::start`] before accepting connections.
    pub fn new(authority: Arc<dyn ChannelAuthority>, buffer_size: usize) -> Self {
        Self {
            state: Mutex::new(HubState::default()),
            authority,
            buffer_size: buffer_size.max(1),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn start(&self) {
        self.state.lock().running = true;
        info!("Hub started");
    }

    /// Stop accepting work and drop every connection. Dropping the queues ends
    /// the per-connection tasks.
    pub fn stop(&self) {
        let mut state = self.state.lock();
        state.running = false;
        let dropped = state.connections.len();
        state.connections.clear();
        state.subscribers.clear();
        info!("Hub stopped, dropped {} connection(s)", dropped);
    }

    pub fn is_running(&self) -> bool {
        self.state.lock().running
    }

    /// Register a connection for an already authenticated principal.
    ///
    /// The first queued message is `welcome`.
    pub fn connect(
        &self,
        principal: Principal,
    ) -> Result<(ConnectionId, mpsc::Receiver<ServerMessage>), HubError> {
        let mut state = self.state.lock();
        if !state.running {
            return Err(HubError::Stopped);
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.buffer_size);
        let welcome = ServerMessage::Welcome {
            connection_id: id.to_string(),
        };
        if tx.try_send(welcome).is_err() {
            return Err(HubError::QueueFull(id));
        }

        info!("Connection {} opened for {}", id, principal);
        state.connections.insert(
            id,
            Connection {
                principal,
                tx,
                channels: BTreeSet::new(),
            },
        );
        Ok((id, rx))
    }

    /// Authorize and record a subscription.
    ///
    /// The confirmation or rejection is queued to the connection before it can
    /// receive any marker for the channel. A rejection also removes an earlier
    /// subscription to the same channel.
    pub async fn subscribe(
        &self,
        id: ConnectionId,
        identifier: ChannelIdentifier,
    ) -> Result<SubscribeOutcome, HubError> {
        let principal = {
            let state = self.state.lock();
            if !state.running {
                return Err(HubError::Stopped);
            }
            state
                .connections
                .get(&id)
                .map(|c| c.principal.clone())
                .ok_or(HubError::UnknownConnection(id))?
        };

        let channel = match Channel::try_from(identifier.clone()) {
            Ok(channel) => Some(channel),
            Err(e) => {
                debug!("Connection {} sent unparseable channel {}: {}", id, identifier, e);
                None
            }
        };

        let allowed = match &channel {
            Some(channel) => self.authority.authorize(channel, &principal).await.is_allowed(),
            None => false,
        };

        let mut state = self.state.lock();
        let Some(connection) = state.connections.get_mut(&id) else {
            // Disconnected while the authority was deciding.
            return Err(HubError::UnknownConnection(id));
        };

        let (reply, outcome) = if allowed {
            (
                ServerMessage::ConfirmSubscription { identifier },
                SubscribeOutcome::Confirmed,
            )
        } else {
            (
                ServerMessage::RejectSubscription { identifier },
                SubscribeOutcome::Rejected,
            )
        };

        if connection.tx.try_send(reply).is_err() {
            warn!("Connection {} queue unavailable, evicting", id);
            state.remove_connection(id);
            return Err(HubError::QueueFull(id));
        }

        match (channel, outcome) {
            (Some(channel), SubscribeOutcome::Confirmed) => {
                connection.channels.insert(channel.clone());
                info!("Connection {} subscribed to {}", id, channel);
                state.subscribers.entry(channel).or_default().insert(id);
            }
            (Some(channel), SubscribeOutcome::Rejected) => {
                info!("Connection {} denied {}", id, channel);
                if connection.channels.remove(&channel) {
                    state.unindex(&channel, id);
                }
            }
            (None, _) => {}
        }

        Ok(outcome)
    }

    /// Drop one subscription. Returns whether it existed.
    pub fn unsubscribe(&self, id: ConnectionId, channel: &Channel) -> Result<bool, HubError> {
        let mut state = self.state.lock();
        let connection = state
            .connections
            .get_mut(&id)
            .ok_or(HubError::UnknownConnection(id))?;

        let existed = connection.channels.remove(channel);
        if existed {
            state.unindex(channel, id);
            debug!("Connection {} unsubscribed from {}", id, channel);
        }
        Ok(existed)
    }

    /// Remove a connection and all of its subscriptions.
    pub fn disconnect(&self, id: ConnectionId) {
        if let Some(connection) = self.state.lock().remove_connection(id) {
            info!(
                "Connection {} closed for {} ({} subscription(s))",
                id,
                connection.principal,
                connection.channels.len()
            );
        }
    }

    /// Queue a marker for every subscriber of the event's channel.
    ///
    /// Returns the number of connections it was queued for. A channel without
    /// subscribers is not an error. Connections whose queue is full or closed
    /// are evicted; their clients reconcile after reconnecting.
    pub fn publish(&self, event: &ChangeEvent) -> Result<usize, HubError> {
        let mut state = self.state.lock();
        if !state.running {
            return Err(HubError::Stopped);
        }

        let Some(ids) = state.subscribers.get(&event.channel) else {
            return Ok(0);
        };

        let message = ServerMessage::marker(event);
        let mut delivered = 0;
        let mut evicted = Vec::new();
        for id in ids {
            let Some(connection) = state.connections.get(id) else {
                continue;
            };
            match connection.tx.try_send(message.clone()) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => {
                    warn!("Connection {} is not keeping up, evicting", id);
                    evicted.push(*id);
                }
                Err(TrySendError::Closed(_)) => evicted.push(*id),
            }
        }

        for id in evicted {
            state.remove_connection(id);
        }

        Ok(delivered)
    }

    /// Queue a message for one connection, evicting it if it cannot take it.
    pub fn send(&self, id: ConnectionId, message: ServerMessage) -> Result<(), HubError> {
        let mut state = self.state.lock();
        let connection = state
            .connections
            .get(&id)
            .ok_or(HubError::UnknownConnection(id))?;
        if connection.tx.try_send(message).is_err() {
            state.remove_connection(id);
            return Err(HubError::QueueFull(id));
        }
        Ok(())
    }

    pub fn connection_count(&self) -> usize {
        self.state.lock().connections.len()
    }

    pub fn subscriber_count(&self, channel: &Channel) -> usize {
        self.state
            .lock()
            .subscribers
            .get(channel)
            .map_or(0, BTreeSet::len)
    }

    /// Channels a connection is subscribed to.
    pub fn subscriptions(&self, id: ConnectionId) -> Vec<Channel> {
        self.state
            .lock()
            .connections
            .get(&id)
            .map(|c| c.channels.iter().cloned().collect())
            .unwrap_or_default()
    }
}

impl Publisher for Hub {
    fn publish(&self, event: &ChangeEvent) -> Result<usize, PublishError> {
        Hub::publish(self, event).map_err(|e| match e {
            HubError::Stopped => PublishError::Stopped,
            other => PublishError::Other(other.to_string()),
        })
    }
}
