//! Client-side synchronization.
//!
//! The server only tells a client *that* something changed. A client binds
//! each channel it cares about to the state slots that channel affects; the
//! [`SyncMultiplexer`] coalesces markers arriving in a short window and
//! re-reads the union of the affected slots with a single reconciliation
//! fetch.

mod client;
mod fetcher;
mod multiplexer;

use async_trait::async_trait;
use parley_protocol::{Channel, ReconcileRequest, ReconcileResponse};
use thiserror::Error;

pub use client::{TransportEvent, WsSyncClient, forward_events};
pub use fetcher::HttpReconciliationFetcher;
pub use multiplexer::{
    DebounceConfig, EntrySnapshot, FetchReason, ReconfigureReport, SyncHandle, SyncMultiplexer,
    SyncScope, SyncSnapshot, SyncUpdate,
};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError {
    /// No live transport connection.
    #[error("transport is disconnected")]
    Disconnected,

    #[error("no answer to subscribe request for {0}")]
    Timeout(Channel),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("reconciliation fetch failed: {0}")]
    Fetch(String),

    /// The multiplexer has been torn down.
    #[error("sync multiplexer stopped")]
    Stopped,
}

/// Server answer to a subscribe request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscribeAck {
    Confirmed,
    Rejected,
}

/// Subscribe side of the live connection.
#[async_trait]
pub trait SubscriptionTransport: Send + Sync {
    /// Request a subscription and wait for the server's answer.
    async fn subscribe(&self, channel: &Channel) -> Result<SubscribeAck, SyncError>;

    async fn unsubscribe(&self, channel: &Channel) -> Result<(), SyncError>;
}

/// Re-reads state slots from the server.
#[async_trait]
pub trait ReconciliationFetcher: Send + Sync {
    async fn fetch(&self, request: ReconcileRequest) -> Result<ReconcileResponse, SyncError>;
}
