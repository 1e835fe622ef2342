//! Resolution of reconciliation requests.
//!
//! Markers carry no data and no trust. Clients re-read state through here,
//! and every slot is authorized on its own: a slot the caller may not see, or
//! that does not exist, resolves to `null` without failing the others.

mod slot;

use anyhow::Result;
use log::warn;
use parley_protocol::{ReconcileRequest, ReconcileResponse};
use serde::Serialize;
use serde_json::{Value, json};

use crate::auth::Principal;
use crate::chat::ChatRepository;

pub use slot::Slot;

#[derive(Clone)]
pub struct SlotResolver {
    repo: ChatRepository,
}

impl SlotResolver {
    pub fn new(repo: ChatRepository) -> Self {
        Self { repo }
    }

    /// Resolve exactly the requested slots.
    pub async fn resolve(
        &self,
        principal: &Principal,
        request: &ReconcileRequest,
    ) -> ReconcileResponse {
        let mut response = ReconcileResponse::default();
        for name in request.unique_slots() {
            let value = match name.parse::<Slot>() {
                Ok(slot) => match self.resolve_slot(principal, &slot).await {
                    Ok(value) => value,
                    Err(e) => {
                        warn!("Failed to resolve slot {} for {}: {:#}", name, principal, e);
                        Value::Null
                    }
                },
                Err(_) => Value::Null,
            };
            response.slots.insert(name.to_string(), value);
        }
        response
    }

    async fn resolve_slot(&self, principal: &Principal, slot: &Slot) -> Result<Value> {
        let repo = &self.repo;
        match slot {
            Slot::Me => {
                let user = repo.get_user(&principal.user_id).await?;
                let accounts = repo.list_accounts_for_user(&principal.user_id).await?;
                Ok(json!({
                    "user_id": principal.user_id,
                    "elevated": principal.elevated,
                    "user": user,
                    "accounts": accounts,
                }))
            }
            Slot::Account(id) => {
                if !self.member_of(principal, id).await? {
                    return Ok(Value::Null);
                }
                to_value(repo.get_account(id).await?)
            }
            Slot::Conversations(account_id) => {
                if !self.member_of(principal, account_id).await? {
                    return Ok(Value::Null);
                }
                to_value(repo.list_conversations(account_id).await?)
            }
            Slot::Conversation(id) => {
                let Some(conversation) = repo.get_conversation(id).await? else {
                    return Ok(Value::Null);
                };
                if !self.member_of(principal, &conversation.account_id).await? {
                    return Ok(Value::Null);
                }
                to_value(conversation)
            }
            Slot::Messages(conversation_id) => {
                let Some(conversation) = repo.get_conversation(conversation_id).await? else {
                    return Ok(Value::Null);
                };
                if !self.member_of(principal, &conversation.account_id).await? {
                    return Ok(Value::Null);
                }
                to_value(repo.list_messages(conversation_id).await?)
            }
            Slot::User(id) => {
                let Some(user) = repo.get_user(id).await? else {
                    return Ok(Value::Null);
                };
                let visible = user.id == principal.user_id
                    || principal.elevated
                    || self.member_of(principal, &user.account_id).await?;
                if !visible {
                    return Ok(Value::Null);
                }
                to_value(user)
            }
            Slot::Users if principal.elevated => to_value(repo.list_users().await?),
            Slot::Settings if principal.elevated => to_value(repo.list_settings().await?),
            Slot::Users | Slot::Settings => Ok(Value::Null),
        }
    }

    async fn member_of(&self, principal: &Principal, account_id: &str) -> Result<bool> {
        self.repo.is_member(&principal.user_id, account_id).await
    }
}

fn to_value<T: Serialize>(value: T) -> Result<Value> {
    Ok(serde_json::to_value(value)?)
}
