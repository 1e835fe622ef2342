//! Change events and the WebSocket message set.
//!
//! Server messages are tagged by `type`, client messages by `command`.

use serde::{Deserialize, Serialize};
use ts_rs::TS;

use crate::channel::{Channel, ChannelIdentifier};

// ============================================================================
// Change events
// ============================================================================

/// What a subscriber should do about a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, TS)]
#[serde(rename_all = "snake_case")]
#[ts(export)]
pub enum MarkerAction {
    /// Something about the channel changed; re-read it.
    Refresh,
    /// The entity behind the channel no longer exists.
    Remove,
}

/// Payload-free marker delivered to subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct Marker {
    pub action: MarkerAction,
}

impl Marker {
    pub fn refresh() -> Self {
        Self {
            action: MarkerAction::Refresh,
        }
    }

    pub fn remove() -> Self {
        Self {
            action: MarkerAction::Remove,
        }
    }
}

/// A marker addressed to one channel. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub channel: Channel,
    pub action: MarkerAction,
}

impl ChangeEvent {
    pub fn refresh(channel: Channel) -> Self {
        Self {
            channel,
            action: MarkerAction::Refresh,
        }
    }

    pub fn remove(channel: Channel) -> Self {
        Self {
            channel,
            action: MarkerAction::Remove,
        }
    }

    pub fn marker(&self) -> Marker {
        Marker {
            action: self.action,
        }
    }
}

// ============================================================================
// Server -> Client
// ============================================================================

/// Messages sent from the hub to a connected client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(tag = "type", rename_all = "snake_case")]
#[ts(export)]
pub enum ServerMessage {
    /// Connection accepted; the principal is fixed for its lifetime.
    Welcome { connection_id: String },

    /// Keepalive.
    Ping,

    /// Subscription created.
    ConfirmSubscription { identifier: ChannelIdentifier },

    /// Subscription refused. No further payload by design.
    RejectSubscription { identifier: ChannelIdentifier },

    /// A marker for a subscribed channel.
    Message {
        identifier: ChannelIdentifier,
        message: Marker,
    },

    /// Protocol-level error (unparseable command and the like).
    Error { message: String },
}

impl ServerMessage {
    pub fn marker(event: &ChangeEvent) -> Self {
        ServerMessage::Message {
            identifier: event.channel.identifier(),
            message: event.marker(),
        }
    }
}

// ============================================================================
// Client -> Server
// ============================================================================

/// Commands sent from a client to the hub.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(tag = "command", rename_all = "snake_case")]
#[ts(export)]
pub enum ClientMessage {
    /// Subscribe to a channel.
    Subscribe { identifier: ChannelIdentifier },

    /// Drop a subscription.
    Unsubscribe { identifier: ChannelIdentifier },

    /// Reply to `ping`.
    Pong,
}

impl ClientMessage {
    pub fn identifier(&self) -> Option<&ChannelIdentifier> {
        match self {
            ClientMessage::Subscribe { identifier } | ClientMessage::Unsubscribe { identifier } => {
                Some(identifier)
            }
            ClientMessage::Pong => None,
        }
    }
}
