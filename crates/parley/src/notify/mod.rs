//! Post-commit change broadcasting.
//!
//! Persistence calls [`ChangeNotifier::notify`] right after a transaction
//! commits. Each entity type statically declares where its changes are
//! announced (see [`Broadcast`]); the notifier turns a mutation into payload
//! free markers and hands them to a [`Publisher`], one channel at a time.
//!
//! Broadcasting is best effort. A failed publish is logged and never surfaces
//! to the mutation that triggered it.

mod targets;

use std::sync::Arc;

use log::{debug, warn};
use parley_protocol::{ChangeEvent, EntityType};
use thiserror::Error;

pub use targets::{BroadcastTarget, resolve};

/// Kind of committed mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mutation {
    Created,
    Updated,
    Destroyed,
}

/// An entity type whose mutations are broadcast.
pub trait Broadcast: Sized + 'static {
    const ENTITY_TYPE: EntityType;

    /// Where mutations of this type are announced.
    const TARGETS: &'static [BroadcastTarget<Self>];

    fn entity_id(&self) -> &str;
}

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("broker is not running")]
    Stopped,

    #[error("publish failed: {0}")]
    Other(String),
}

/// Something that can deliver a marker to a channel's subscribers.
///
/// Must not block on delivery.
pub trait Publisher: Send + Sync {
    /// Returns how many connections the event was enqueued for.
    fn publish(&self, event: &ChangeEvent) -> Result<usize, PublishError>;
}

/// Outcome of one notification, for logging and tests.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NotifyReport {
    pub events: Vec<ChangeEvent>,
    pub deliveries: usize,
    pub failures: usize,
}

#[derive(Clone)]
pub struct ChangeNotifier {
    publisher: Arc<dyn Publisher>,
}

impl ChangeNotifier {
    pub fn new(publisher: Arc<dyn Publisher>) -> Self {
        Self { publisher }
    }

    /// Announce a committed mutation of `entity`.
    pub fn notify<E: Broadcast>(&self, entity: &E, mutation: Mutation) -> NotifyReport {
        let events = resolve(entity, mutation);
        let mut report = NotifyReport::default();

        for event in &events {
            match self.publisher.publish(event) {
                Ok(n) => report.deliveries += n,
                Err(e) => {
                    report.failures += 1;
                    warn!(
                        "Failed to publish {:?} to {}: {}",
                        event.action, event.channel, e
                    );
                }
            }
        }

        debug!(
            "{:?} {}:{} -> {} channel(s), {} delivery(ies)",
            mutation,
            E::ENTITY_TYPE,
            entity.entity_id(),
            events.len(),
            report.deliveries
        );
        report.events = events;
        report
    }
}
