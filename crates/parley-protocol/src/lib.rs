//! Wire types for Parley live sync.
//!
//! This crate defines the formats exchanged across the live sync boundary:
//!
//! ```text
//! Browser / native client <--[WS: subscribe, markers]--> Hub <--[ChangeEvent]-- ChangeNotifier
//!          |
//!          +--[HTTP: ReconcileRequest / ReconcileResponse]--> reconciliation endpoint
//! ```
//!
//! ## Design Principles
//!
//! 1. **Markers carry no data.** A marker only says that something on a channel
//!    changed. Clients re-read through the authenticated reconciliation endpoint.
//! 2. **Channels are addresses, not resources.** A channel string is a pure
//!    function of an entity type and an entity id (or `all`).
//! 3. **Case-sensitive canonical names.** `User:all` and `user:all` are different
//!    strings and only the former is valid.

pub mod channel;
pub mod events;
pub mod reconcile;

pub use channel::{
    Channel, ChannelError, ChannelIdentifier, ChannelScope, EntityType, check_entity_id,
};
pub use events::{ChangeEvent, ClientMessage, Marker, MarkerAction, ServerMessage};
pub use reconcile::{ReconcileRequest, ReconcileResponse};
