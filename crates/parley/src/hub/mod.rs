//! Broker for live change markers.
//!
//! One [`Hub`] per process holds every WebSocket connection, the channels each
//! one subscribed to, and fans published markers out to exactly those
//! connections.

mod handler;
mod hub;

pub use handler::ws_handler;
pub use hub::{CONNECTION_BUFFER_SIZE, ConnectionId, Hub, HubError, HubSender, SubscribeOutcome};
