//! Chat persistence.
//!
//! Every mutation runs in its own transaction and announces itself through
//! the [`ChangeNotifier`] only after the commit succeeded. Entities that are
//! destroyed are loaded first, so their relations can still be announced.

use std::collections::BTreeSet;

use anyhow::{Context, Result};
use parley_protocol::check_entity_id;
use sqlx::{Sqlite, SqlitePool, Transaction};
use tracing::{debug, instrument};

use crate::notify::{ChangeNotifier, Mutation};

use super::models::{
    Account, Conversation, CreateConversationRequest, Message, MessageRole, Setting,
    UpdateConversationRequest, User,
};

const CONVERSATION_COLUMNS: &str = "id, account_id, title, created_at, updated_at";
const MESSAGE_COLUMNS: &str =
    "id, conversation_id, account_id, author_id, role, content, streaming, created_at, updated_at";

fn generate_id(prefix: &str) -> String {
    format!("{}_{}", prefix, nanoid::nanoid!(12))
}

#[derive(Clone)]
pub struct ChatRepository {
    pool: SqlitePool,
    notifier: ChangeNotifier,
}

impl ChatRepository {
    pub fn new(pool: SqlitePool, notifier: ChangeNotifier) -> Self {
        Self { pool, notifier }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn begin(&self) -> Result<Transaction<'static, Sqlite>> {
        self.pool.begin().await.context("Failed to begin transaction")
    }

    // ========================================================================
    // Accounts and users
    // ========================================================================

    #[instrument(skip(self))]
    pub async fn create_account(&self, name: &str) -> Result<Account> {
        let id = generate_id("acct");
        let mut tx = self.begin().await?;
        sqlx::query("INSERT INTO accounts (id, name) VALUES (?, ?)")
            .bind(&id)
            .bind(name)
            .execute(&mut *tx)
            .await
            .context("Failed to insert account")?;
        let account = fetch_account(&mut tx, &id).await?;
        tx.commit().await.context("Failed to commit account")?;

        self.notifier.notify(&account, Mutation::Created);
        Ok(account)
    }

    #[instrument(skip(self))]
    pub async fn get_account(&self, id: &str) -> Result<Option<Account>> {
        sqlx::query_as::<_, Account>(
            "SELECT id, name, created_at, updated_at FROM accounts WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch account")
    }

    /// Accounts the user belongs to, home account included.
    #[instrument(skip(self))]
    pub async fn list_accounts_for_user(&self, user_id: &str) -> Result<Vec<Account>> {
        sqlx::query_as::<_, Account>(
            r#"
            SELECT a.id, a.name, a.created_at, a.updated_at
            FROM accounts a
            WHERE a.id IN (
                SELECT account_id FROM users WHERE id = ?
                UNION
                SELECT account_id FROM memberships WHERE user_id = ?
            )
            ORDER BY a.name
            "#,
        )
        .bind(user_id)
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to list accounts for user")
    }

    #[instrument(skip(self))]
    pub async fn create_user(
        &self,
        account_id: &str,
        display_name: &str,
        is_admin: bool,
    ) -> Result<User> {
        let id = generate_id("usr");
        debug!("Creating user {} in {}", id, account_id);

        let mut tx = self.begin().await?;
        sqlx::query("INSERT INTO users (id, account_id, display_name, is_admin) VALUES (?, ?, ?, ?)")
            .bind(&id)
            .bind(account_id)
            .bind(display_name)
            .bind(is_admin)
            .execute(&mut *tx)
            .await
            .context("Failed to insert user")?;
        let user = fetch_user(&mut tx, &id).await?;
        tx.commit().await.context("Failed to commit user")?;

        self.notifier.notify(&user, Mutation::Created);
        Ok(user)
    }

    /// Create an account and a user with fixed ids unless they exist.
    ///
    /// Used for provisioning from the CLI and for dev users. Returns whether
    /// the user was new.
    #[instrument(skip(self))]
    pub async fn ensure_user(
        &self,
        account_id: &str,
        account_name: &str,
        user_id: &str,
        display_name: &str,
        is_admin: bool,
    ) -> Result<bool> {
        check_entity_id(account_id).map_err(|e| anyhow::anyhow!("invalid account id: {e}"))?;
        check_entity_id(user_id).map_err(|e| anyhow::anyhow!("invalid user id: {e}"))?;

        let mut tx = self.begin().await?;
        let account_created = sqlx::query("INSERT OR IGNORE INTO accounts (id, name) VALUES (?, ?)")
            .bind(account_id)
            .bind(account_name)
            .execute(&mut *tx)
            .await
            .context("Failed to insert account")?
            .rows_affected()
            > 0;
        let user_created = sqlx::query(
            "INSERT OR IGNORE INTO users (id, account_id, display_name, is_admin) VALUES (?, ?, ?, ?)",
        )
        .bind(user_id)
        .bind(account_id)
        .bind(display_name)
        .bind(is_admin)
        .execute(&mut *tx)
        .await
        .context("Failed to insert user")?
        .rows_affected()
            > 0;
        let account = fetch_account(&mut tx, account_id).await?;
        let user = fetch_user(&mut tx, user_id).await?;
        tx.commit().await.context("Failed to commit provisioning")?;

        if account_created {
            self.notifier.notify(&account, Mutation::Created);
        }
        if user_created {
            self.notifier.notify(&user, Mutation::Created);
        }
        Ok(user_created)
    }

    #[instrument(skip(self))]
    pub async fn get_user(&self, id: &str) -> Result<Option<User>> {
        sqlx::query_as::<_, User>(
            "SELECT id, account_id, display_name, is_admin, created_at, updated_at FROM users WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch user")
    }

    #[instrument(skip(self))]
    pub async fn list_users(&self) -> Result<Vec<User>> {
        sqlx::query_as::<_, User>(
            "SELECT id, account_id, display_name, is_admin, created_at, updated_at FROM users ORDER BY created_at, id",
        )
        .fetch_all(&self.pool)
        .await
        .context("Failed to list users")
    }

    /// Add the user to a further account. Returns whether anything changed.
    #[instrument(skip(self))]
    pub async fn add_member(&self, user_id: &str, account_id: &str) -> Result<bool> {
        let mut tx = self.begin().await?;
        let inserted = sqlx::query(
            "INSERT OR IGNORE INTO memberships (user_id, account_id) VALUES (?, ?)",
        )
        .bind(user_id)
        .bind(account_id)
        .execute(&mut *tx)
        .await
        .context("Failed to insert membership")?
        .rows_affected()
            > 0;
        let user = touch_user(&mut tx, user_id).await?;
        tx.commit().await.context("Failed to commit membership")?;

        if inserted {
            self.notifier.notify(&user, Mutation::Updated);
        }
        Ok(inserted)
    }

    /// Remove a membership. The home account cannot be removed this way.
    #[instrument(skip(self))]
    pub async fn remove_member(&self, user_id: &str, account_id: &str) -> Result<bool> {
        let mut tx = self.begin().await?;
        let removed = sqlx::query("DELETE FROM memberships WHERE user_id = ? AND account_id = ?")
            .bind(user_id)
            .bind(account_id)
            .execute(&mut *tx)
            .await
            .context("Failed to delete membership")?
            .rows_affected()
            > 0;
        let user = touch_user(&mut tx, user_id).await?;
        tx.commit().await.context("Failed to commit membership removal")?;

        if removed {
            self.notifier.notify(&user, Mutation::Updated);
        }
        Ok(removed)
    }

    /// Whether the user belongs to the account, by home account or membership.
    #[instrument(skip(self))]
    pub async fn is_member(&self, user_id: &str, account_id: &str) -> Result<bool> {
        is_member(&self.pool, user_id, account_id).await
    }

    // ========================================================================
    // Conversations
    // ========================================================================

    #[instrument(skip(self, request), fields(account_id = %request.account_id))]
    pub async fn create_conversation(
        &self,
        request: CreateConversationRequest,
    ) -> Result<Conversation> {
        let id = generate_id("conv");
        let mut tx = self.begin().await?;
        sqlx::query("INSERT INTO conversations (id, account_id, title) VALUES (?, ?, ?)")
            .bind(&id)
            .bind(&request.account_id)
            .bind(&request.title)
            .execute(&mut *tx)
            .await
            .context("Failed to insert conversation")?;
        replace_participants(&mut tx, &id, &request.participant_ids).await?;
        let conversation = fetch_conversation(&mut tx, &id)
            .await?
            .context("Conversation not found after creation")?;
        tx.commit().await.context("Failed to commit conversation")?;

        self.notifier.notify(&conversation, Mutation::Created);
        Ok(conversation)
    }

    #[instrument(skip(self))]
    pub async fn get_conversation(&self, id: &str) -> Result<Option<Conversation>> {
        let mut conn = self.pool.acquire().await.context("Failed to acquire connection")?;
        fetch_conversation(&mut conn, id).await
    }

    #[instrument(skip(self))]
    pub async fn list_conversations(&self, account_id: &str) -> Result<Vec<Conversation>> {
        let mut conn = self.pool.acquire().await.context("Failed to acquire connection")?;
        let mut conversations = sqlx::query_as::<_, Conversation>(&format!(
            "SELECT {CONVERSATION_COLUMNS} FROM conversations WHERE account_id = ? ORDER BY created_at, id"
        ))
        .bind(account_id)
        .fetch_all(&mut *conn)
        .await
        .context("Failed to list conversations")?;

        for conversation in &mut conversations {
            conversation.participant_ids = fetch_participants(&mut conn, &conversation.id).await?;
        }
        Ok(conversations)
    }

    /// Update title and/or participants.
    ///
    /// Participants dropped by the update are announced alongside the
    /// current ones, since their view of the conversation changed too.
    #[instrument(skip(self, update))]
    pub async fn update_conversation(
        &self,
        id: &str,
        update: UpdateConversationRequest,
    ) -> Result<Option<Conversation>> {
        let mut tx = self.begin().await?;
        let Some(before) = fetch_conversation(&mut tx, id).await? else {
            return Ok(None);
        };

        if let Some(title) = &update.title {
            sqlx::query("UPDATE conversations SET title = ?, updated_at = datetime('now') WHERE id = ?")
                .bind(title)
                .bind(id)
                .execute(&mut *tx)
                .await
                .context("Failed to update conversation")?;
        }
        if let Some(participants) = &update.participant_ids {
            replace_participants(&mut tx, id, participants).await?;
        }

        let after = fetch_conversation(&mut tx, id)
            .await?
            .context("Conversation vanished during update")?;
        tx.commit().await.context("Failed to commit conversation update")?;

        let mut announced = after.clone();
        let affected: BTreeSet<&String> = after
            .participant_ids
            .iter()
            .chain(&before.participant_ids)
            .collect();
        announced.participant_ids = affected.into_iter().cloned().collect();
        self.notifier.notify(&announced, Mutation::Updated);

        Ok(Some(after))
    }

    #[instrument(skip(self))]
    pub async fn delete_conversation(&self, id: &str) -> Result<Option<Conversation>> {
        let mut tx = self.begin().await?;
        let Some(conversation) = fetch_conversation(&mut tx, id).await? else {
            return Ok(None);
        };
        // Rows the cascade below removes.
        let messages = sqlx::query_as::<_, Message>(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages WHERE conversation_id = ? ORDER BY created_at, rowid"
        ))
        .bind(id)
        .fetch_all(&mut *tx)
        .await
        .context("Failed to list messages of conversation")?;
        sqlx::query("DELETE FROM conversations WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await
            .context("Failed to delete conversation")?;
        tx.commit().await.context("Failed to commit conversation delete")?;

        for message in &messages {
            self.notifier.notify(message, Mutation::Destroyed);
        }
        self.notifier.notify(&conversation, Mutation::Destroyed);
        Ok(Some(conversation))
    }

    // ========================================================================
    // Messages
    // ========================================================================

    #[instrument(skip(self, content))]
    pub async fn create_message(
        &self,
        conversation_id: &str,
        author_id: Option<&str>,
        role: MessageRole,
        content: &str,
        streaming: bool,
    ) -> Result<Option<Message>> {
        let id = generate_id("msg");
        let mut tx = self.begin().await?;
        let inserted = sqlx::query(
            r#"
            INSERT INTO messages (id, conversation_id, account_id, author_id, role, content, streaming)
            SELECT ?, c.id, c.account_id, ?, ?, ?, ?
            FROM conversations c
            WHERE c.id = ?
            "#,
        )
        .bind(&id)
        .bind(author_id)
        .bind(role)
        .bind(content)
        .bind(streaming)
        .bind(conversation_id)
        .execute(&mut *tx)
        .await
        .context("Failed to insert message")?
        .rows_affected();
        if inserted == 0 {
            return Ok(None);
        }

        let message = fetch_message(&mut tx, &id)
            .await?
            .context("Message not found after creation")?;
        tx.commit().await.context("Failed to commit message")?;

        self.notifier.notify(&message, Mutation::Created);
        Ok(Some(message))
    }

    #[instrument(skip(self))]
    pub async fn get_message(&self, id: &str) -> Result<Option<Message>> {
        let mut conn = self.pool.acquire().await.context("Failed to acquire connection")?;
        fetch_message(&mut conn, id).await
    }

    #[instrument(skip(self))]
    pub async fn list_messages(&self, conversation_id: &str) -> Result<Vec<Message>> {
        sqlx::query_as::<_, Message>(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages WHERE conversation_id = ? ORDER BY created_at, rowid"
        ))
        .bind(conversation_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to list messages")
    }

    /// Append a streamed segment in one statement, so it is stored whole or
    /// not at all.
    #[instrument(skip(self, segment), fields(len = segment.len()))]
    pub async fn append_message_content(&self, id: &str, segment: &str) -> Result<Message> {
        let mut tx = self.begin().await?;
        let updated = sqlx::query(
            "UPDATE messages SET content = content || ?, updated_at = datetime('now') WHERE id = ?",
        )
        .bind(segment)
        .bind(id)
        .execute(&mut *tx)
        .await
        .context("Failed to append message content")?
        .rows_affected();
        if updated == 0 {
            anyhow::bail!("Message {} not found", id);
        }
        let message = fetch_message(&mut tx, id)
            .await?
            .context("Message vanished during append")?;
        tx.commit().await.context("Failed to commit message append")?;

        self.notifier.notify(&message, Mutation::Updated);
        Ok(message)
    }

    /// Clear the streaming flag.
    #[instrument(skip(self))]
    pub async fn finish_message_stream(&self, id: &str) -> Result<Option<Message>> {
        let mut tx = self.begin().await?;
        sqlx::query("UPDATE messages SET streaming = 0, updated_at = datetime('now') WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await
            .context("Failed to finish message stream")?;
        let message = fetch_message(&mut tx, id).await?;
        tx.commit().await.context("Failed to commit stream finish")?;

        if let Some(message) = &message {
            self.notifier.notify(message, Mutation::Updated);
        }
        Ok(message)
    }

    #[instrument(skip(self))]
    pub async fn delete_message(&self, id: &str) -> Result<Option<Message>> {
        let mut tx = self.begin().await?;
        let Some(message) = fetch_message(&mut tx, id).await? else {
            return Ok(None);
        };
        sqlx::query("DELETE FROM messages WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await
            .context("Failed to delete message")?;
        tx.commit().await.context("Failed to commit message delete")?;

        self.notifier.notify(&message, Mutation::Destroyed);
        Ok(Some(message))
    }

    // ========================================================================
    // Settings
    // ========================================================================

    #[instrument(skip(self, value))]
    pub async fn put_setting(&self, key: &str, value: &str) -> Result<Setting> {
        check_entity_id(key).map_err(|e| anyhow::anyhow!("invalid setting key: {e}"))?;

        let mut tx = self.begin().await?;
        let existed = fetch_setting(&mut tx, key).await?.is_some();
        sqlx::query(
            r#"
            INSERT INTO settings (key, value) VALUES (?, ?)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = datetime('now')
            "#,
        )
        .bind(key)
        .bind(value)
        .execute(&mut *tx)
        .await
        .context("Failed to upsert setting")?;
        let setting = fetch_setting(&mut tx, key)
            .await?
            .context("Setting not found after upsert")?;
        tx.commit().await.context("Failed to commit setting")?;

        let mutation = if existed {
            Mutation::Updated
        } else {
            Mutation::Created
        };
        self.notifier.notify(&setting, mutation);
        Ok(setting)
    }

    #[instrument(skip(self))]
    pub async fn list_settings(&self) -> Result<Vec<Setting>> {
        sqlx::query_as::<_, Setting>("SELECT key, value, updated_at FROM settings ORDER BY key")
            .fetch_all(&self.pool)
            .await
            .context("Failed to list settings")
    }
}

// ============================================================================
// Row helpers, usable inside or outside a transaction
// ============================================================================

pub(super) async fn is_member(pool: &SqlitePool, user_id: &str, account_id: &str) -> Result<bool> {
    let found: Option<i64> = sqlx::query_scalar(
        r#"
        SELECT 1 FROM users WHERE id = ? AND account_id = ?
        UNION
        SELECT 1 FROM memberships WHERE user_id = ? AND account_id = ?
        LIMIT 1
        "#,
    )
    .bind(user_id)
    .bind(account_id)
    .bind(user_id)
    .bind(account_id)
    .fetch_optional(pool)
    .await
    .context("Failed to check membership")?;
    Ok(found.is_some())
}

async fn fetch_account(conn: &mut sqlx::SqliteConnection, id: &str) -> Result<Account> {
    sqlx::query_as::<_, Account>("SELECT id, name, created_at, updated_at FROM accounts WHERE id = ?")
        .bind(id)
        .fetch_one(&mut *conn)
        .await
        .context("Failed to fetch account")
}

async fn fetch_user(conn: &mut sqlx::SqliteConnection, id: &str) -> Result<User> {
    sqlx::query_as::<_, User>(
        "SELECT id, account_id, display_name, is_admin, created_at, updated_at FROM users WHERE id = ?",
    )
    .bind(id)
    .fetch_one(&mut *conn)
    .await
    .context("Failed to fetch user")
}

async fn touch_user(conn: &mut sqlx::SqliteConnection, id: &str) -> Result<User> {
    sqlx::query("UPDATE users SET updated_at = datetime('now') WHERE id = ?")
        .bind(id)
        .execute(&mut *conn)
        .await
        .context("Failed to touch user")?;
    fetch_user(conn, id).await
}

async fn fetch_participants(conn: &mut sqlx::SqliteConnection, conversation_id: &str) -> Result<Vec<String>> {
    sqlx::query_scalar(
        "SELECT user_id FROM conversation_participants WHERE conversation_id = ? ORDER BY user_id",
    )
    .bind(conversation_id)
    .fetch_all(&mut *conn)
    .await
    .context("Failed to fetch participants")
}

async fn fetch_conversation(
    conn: &mut sqlx::SqliteConnection,
    id: &str,
) -> Result<Option<Conversation>> {
    let conversation = sqlx::query_as::<_, Conversation>(&format!(
        "SELECT {CONVERSATION_COLUMNS} FROM conversations WHERE id = ?"
    ))
    .bind(id)
    .fetch_optional(&mut *conn)
    .await
    .context("Failed to fetch conversation")?;

    let Some(mut conversation) = conversation else {
        return Ok(None);
    };
    conversation.participant_ids = fetch_participants(conn, id).await?;
    Ok(Some(conversation))
}

async fn replace_participants(
    conn: &mut sqlx::SqliteConnection,
    conversation_id: &str,
    participant_ids: &[String],
) -> Result<()> {
    sqlx::query("DELETE FROM conversation_participants WHERE conversation_id = ?")
        .bind(conversation_id)
        .execute(&mut *conn)
        .await
        .context("Failed to clear participants")?;
    for user_id in participant_ids {
        sqlx::query(
            "INSERT OR IGNORE INTO conversation_participants (conversation_id, user_id) VALUES (?, ?)",
        )
        .bind(conversation_id)
        .bind(user_id)
        .execute(&mut *conn)
        .await
        .with_context(|| format!("Failed to add participant {}", user_id))?;
    }
    Ok(())
}

async fn fetch_message(conn: &mut sqlx::SqliteConnection, id: &str) -> Result<Option<Message>> {
    sqlx::query_as::<_, Message>(&format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?"))
        .bind(id)
        .fetch_optional(&mut *conn)
        .await
        .context("Failed to fetch message")
}

async fn fetch_setting(conn: &mut sqlx::SqliteConnection, key: &str) -> Result<Option<Setting>> {
    sqlx::query_as::<_, Setting>("SELECT key, value, updated_at FROM settings WHERE key = ?")
        .bind(key)
        .fetch_optional(&mut *conn)
        .await
        .context("Failed to fetch setting")
}
