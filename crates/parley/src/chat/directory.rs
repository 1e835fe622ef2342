//! Ownership and membership lookups for channel authorization.

use anyhow::{Context, Result};
use async_trait::async_trait;
use parley_protocol::EntityType;
use sqlx::SqlitePool;
use tracing::instrument;

use crate::authority::{EntityDirectory, Ownership};

/// Reads ownership straight from the chat tables on every call.
#[derive(Debug, Clone)]
pub struct ChatDirectory {
    pool: SqlitePool,
}

impl ChatDirectory {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl EntityDirectory for ChatDirectory {
    #[instrument(skip(self))]
    async fn ownership(&self, entity_type: EntityType, id: &str) -> Result<Option<Ownership>> {
        let query = match entity_type {
            EntityType::Account => "SELECT id FROM accounts WHERE id = ?",
            EntityType::User => "SELECT account_id FROM users WHERE id = ?",
            EntityType::Conversation => "SELECT account_id FROM conversations WHERE id = ?",
            EntityType::Message => "SELECT account_id FROM messages WHERE id = ?",
            EntityType::Setting => {
                let found: Option<String> =
                    sqlx::query_scalar("SELECT key FROM settings WHERE key = ?")
                        .bind(id)
                        .fetch_optional(&self.pool)
                        .await
                        .context("Failed to look up setting")?;
                return Ok(found.map(|_| Ownership::Unowned));
            }
        };

        let account_id: Option<String> = sqlx::query_scalar(query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .with_context(|| format!("Failed to look up {} {}", entity_type, id))?;
        Ok(account_id.map(Ownership::Tenant))
    }

    #[instrument(skip(self))]
    async fn is_member(&self, user_id: &str, account_id: &str) -> Result<bool> {
        super::repository::is_member(&self.pool, user_id, account_id).await
    }
}
