//! Per-channel subscription authorization.
//!
//! Decisions are made fresh on every subscribe attempt. Tenant membership can
//! change while a connection is open, so nothing here is cached.

use anyhow::Result;
use async_trait::async_trait;
use log::{debug, warn};
use parley_protocol::{Channel, ChannelScope, EntityType};

use crate::auth::Principal;

/// Outcome of an authorization check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allow,
    Deny,
}

impl Decision {
    pub fn is_allowed(self) -> bool {
        self == Decision::Allow
    }

    fn from_bool(allowed: bool) -> Self {
        if allowed { Decision::Allow } else { Decision::Deny }
    }
}

/// Who owns an entity for authorization purposes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Ownership {
    /// Owned by the tenant (account) with this id.
    Tenant(String),
    /// The entity type declares no tenant owner.
    Unowned,
}

/// Lookups the authority needs from persistence.
#[async_trait]
pub trait EntityDirectory: Send + Sync {
    /// Ownership of an entity, or `None` if it does not exist.
    async fn ownership(&self, entity_type: EntityType, id: &str) -> Result<Option<Ownership>>;

    /// Whether the user currently belongs to the account.
    async fn is_member(&self, user_id: &str, account_id: &str) -> Result<bool>;
}

/// Decides whether a principal may subscribe to a channel.
#[async_trait]
pub trait ChannelAuthority: Send + Sync {
    async fn authorize(&self, channel: &Channel, principal: &Principal) -> Decision;
}

/// Tenant-scoped policy over an [`EntityDirectory`].
///
/// - `Type:all` requires elevated privilege.
/// - `Type:id` is denied if the entity does not exist, allowed to tenant
///   members for tenant-owned entities, and to elevated principals otherwise.
///
/// Lookup failures deny.
pub struct TenantAuthority<D> {
    directory: D,
}

impl<D: EntityDirectory> TenantAuthority<D> {
    pub fn new(directory: D) -> Self {
        Self { directory }
    }

    async fn check_entity(
        &self,
        entity_type: EntityType,
        id: &str,
        principal: &Principal,
    ) -> Result<Decision> {
        let Some(ownership) = self.directory.ownership(entity_type, id).await? else {
            return Ok(Decision::Deny);
        };

        match ownership {
            Ownership::Tenant(account_id) => Ok(Decision::from_bool(
                self.directory
                    .is_member(&principal.user_id, &account_id)
                    .await?,
            )),
            Ownership::Unowned => Ok(Decision::from_bool(principal.has_elevated_privilege())),
        }
    }
}

#[async_trait]
impl<D: EntityDirectory> ChannelAuthority for TenantAuthority<D> {
    async fn authorize(&self, channel: &Channel, principal: &Principal) -> Decision {
        let decision = match channel.scope() {
            ChannelScope::All => Decision::from_bool(principal.has_elevated_privilege()),
            ChannelScope::Entity(id) => {
                match self.check_entity(channel.entity_type(), id, principal).await {
                    Ok(decision) => decision,
                    Err(e) => {
                        warn!(
                            "Authorization lookup for {} failed, denying {}: {:#}",
                            channel, principal.user_id, e
                        );
                        Decision::Deny
                    }
                }
            }
        };
        debug!("authorize {} for {}: {:?}", channel, principal, decision);
        decision
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{HashMap, HashSet};
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeDirectory {
        owners: HashMap<(EntityType, String), Ownership>,
        members: Mutex<HashSet<(String, String)>>,
        broken: bool,
    }

    impl FakeDirectory {
        fn own(mut self, entity_type: EntityType, id: &str, ownership: Ownership) -> Self {
            self.owners.insert((entity_type, id.to_string()), ownership);
            self
        }

        fn member(self, user: &str, account: &str) -> Self {
            self.members
                .lock()
                .unwrap()
                .insert((user.to_string(), account.to_string()));
            self
        }
    }

    #[async_trait]
    impl EntityDirectory for FakeDirectory {
        async fn ownership(&self, entity_type: EntityType, id: &str) -> Result<Option<Ownership>> {
            if self.broken {
                anyhow::bail!("database is locked");
            }
            Ok(self.owners.get(&(entity_type, id.to_string())).cloned())
        }

        async fn is_member(&self, user_id: &str, account_id: &str) -> Result<bool> {
            Ok(self
                .members
                .lock()
                .unwrap()
                .contains(&(user_id.to_string(), account_id.to_string())))
        }
    }

    fn directory() -> FakeDirectory {
        FakeDirectory::default()
            .own(
                EntityType::Conversation,
                "conv_a",
                Ownership::Tenant("acct_a".to_string()),
            )
            .own(EntityType::Setting, "theme", Ownership::Unowned)
            .member("usr_alice", "acct_a")
    }

    fn alice() -> Principal {
        Principal::new("usr_alice", false)
    }

    fn mallory() -> Principal {
        Principal::new("usr_mallory", false)
    }

    fn admin() -> Principal {
        Principal::new("usr_root", true)
    }

    #[tokio::test]
    async fn test_collection_requires_elevation() {
        let authority = TenantAuthority::new(directory());
        let users = Channel::collection(EntityType::User);
        assert_eq!(authority.authorize(&users, &alice()).await, Decision::Deny);
        assert_eq!(authority.authorize(&users, &admin()).await, Decision::Allow);
    }

    #[tokio::test]
    async fn test_tenant_boundary() {
        let authority = TenantAuthority::new(directory());
        let conv = Channel::entity(EntityType::Conversation, "conv_a");
        assert_eq!(authority.authorize(&conv, &alice()).await, Decision::Allow);
        assert_eq!(authority.authorize(&conv, &mallory()).await, Decision::Deny);
        // Elevation does not bypass tenant ownership.
        assert_eq!(authority.authorize(&conv, &admin()).await, Decision::Deny);
    }

    #[tokio::test]
    async fn test_missing_entity_denied() {
        let authority = TenantAuthority::new(directory());
        let ghost = Channel::entity(EntityType::Conversation, "conv_missing");
        assert_eq!(authority.authorize(&ghost, &alice()).await, Decision::Deny);
        assert_eq!(authority.authorize(&ghost, &admin()).await, Decision::Deny);
    }

    #[tokio::test]
    async fn test_unowned_entity_requires_elevation() {
        let authority = TenantAuthority::new(directory());
        let setting = Channel::entity(EntityType::Setting, "theme");
        assert_eq!(authority.authorize(&setting, &alice()).await, Decision::Deny);
        assert_eq!(authority.authorize(&setting, &admin()).await, Decision::Allow);
    }

    #[tokio::test]
    async fn test_lookup_failure_denies() {
        let authority = TenantAuthority::new(FakeDirectory {
            broken: true,
            ..directory()
        });
        let conv = Channel::entity(EntityType::Conversation, "conv_a");
        assert_eq!(authority.authorize(&conv, &alice()).await, Decision::Deny);
    }

    #[tokio::test]
    async fn test_membership_is_not_cached() {
        let authority = TenantAuthority::new(directory());
        let conv = Channel::entity(EntityType::Conversation, "conv_a");
        assert!(authority.authorize(&conv, &alice()).await.is_allowed());

        authority
            .directory
            .members
            .lock()
            .unwrap()
            .remove(&("usr_alice".to_string(), "acct_a".to_string()));
        assert_eq!(authority.authorize(&conv, &alice()).await, Decision::Deny);
    }
}
