//! Static broadcast declarations and channel resolution.

use std::collections::HashSet;

use parley_protocol::{Channel, ChangeEvent};

use super::{Broadcast, Mutation};

/// One declared broadcast target of an entity type.
///
/// Relation resolvers are plain functions over the entity as loaded before the
/// mutation, so a destroyed row still resolves through its captured foreign
/// keys.
pub enum BroadcastTarget<E> {
    /// `"{Type}:{id}"`
    Own,
    /// `"{Type}:all"`
    Collection,
    /// Channel of a related entity, if the relation is set.
    ToOne(fn(&E) -> Option<Channel>),
    /// One channel per related entity.
    ToMany(fn(&E) -> Vec<Channel>),
}

/// Resolve the events a mutation of `entity` produces.
///
/// Channels appear once, in declaration order. On destroy the entity's own
/// channel gets `remove` and everything else `refresh`.
pub fn resolve<E: Broadcast>(entity: &E, mutation: Mutation) -> Vec<ChangeEvent> {
    let own = Channel::entity(E::ENTITY_TYPE, entity.entity_id());
    let mut seen = HashSet::new();
    let mut events = Vec::new();

    let mut push = |channel: Channel| {
        if !seen.insert(channel.clone()) {
            return;
        }
        let event = if mutation == Mutation::Destroyed && channel == own {
            ChangeEvent::remove(channel)
        } else {
            ChangeEvent::refresh(channel)
        };
        events.push(event);
    };

    for target in E::TARGETS {
        match target {
            BroadcastTarget::Own => push(own.clone()),
            BroadcastTarget::Collection => push(Channel::collection(E::ENTITY_TYPE)),
            BroadcastTarget::ToOne(related) => {
                if let Some(channel) = related(entity) {
                    push(channel);
                }
            }
            BroadcastTarget::ToMany(related) => related(entity).into_iter().for_each(&mut push),
        }
    }

    events
}
