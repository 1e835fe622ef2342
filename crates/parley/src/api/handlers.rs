//! API request handlers.
//!
//! Mutations go through the repository, which announces them to the hub
//! after commit. Reads go through `/reconcile`.

use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
};
use parley_protocol::{ReconcileRequest, ReconcileResponse, check_entity_id};
use serde::Serialize;
use tracing::{info, instrument, warn};

use crate::auth::{CurrentUser, RequireAdmin};
use crate::chat::{
    Conversation, CreateConversationRequest, Message, MessageRole, MessageStreamSink,
    PostMessageRequest, PostMessageResponse, PutSettingRequest, Setting,
    UpdateConversationRequest,
};
use crate::stream::{RetryPolicy, StreamAccumulator};

use super::error::{ApiError, ApiResult};
use super::state::AppState;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub hub_running: bool,
    pub connections: usize,
    pub active_streams: usize,
}

/// Health check endpoint.
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        hub_running: state.hub.is_running(),
        connections: state.hub.connection_count(),
        active_streams: state.streams.active_count(),
    })
}

/// Re-read the requested state slots.
///
/// Every requested slot is answered; unknown or unauthorized slots are null.
#[instrument(skip(state, user, request), fields(user_id = %user.id(), slots = request.slots.len()))]
pub async fn reconcile(
    State(state): State<AppState>,
    user: CurrentUser,
    Json(request): Json<ReconcileRequest>,
) -> Json<ReconcileResponse> {
    let principal = user.principal();
    Json(state.slots.resolve(&principal, &request).await)
}

// ============================================================================
// Conversations
// ============================================================================

#[instrument(skip(state, user, request), fields(user_id = %user.id(), account_id = %request.account_id))]
pub async fn create_conversation(
    State(state): State<AppState>,
    user: CurrentUser,
    Json(request): Json<CreateConversationRequest>,
) -> ApiResult<(StatusCode, Json<Conversation>)> {
    if request.title.trim().is_empty() {
        return Err(ApiError::bad_request("title must not be empty"));
    }
    require_member(&state, &user, &request.account_id).await?;
    require_participants(&state, &request.account_id, &request.participant_ids).await?;

    let conversation = state.repo.create_conversation(request).await?;
    info!(conversation_id = %conversation.id, "Created conversation");
    Ok((StatusCode::CREATED, Json(conversation)))
}

#[instrument(skip(state, user, update), fields(user_id = %user.id()))]
pub async fn update_conversation(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(conversation_id): Path<String>,
    Json(update): Json<UpdateConversationRequest>,
) -> ApiResult<Json<Conversation>> {
    let existing = load_conversation(&state, &conversation_id).await?;
    require_member(&state, &user, &existing.account_id).await?;
    if let Some(title) = &update.title
        && title.trim().is_empty()
    {
        return Err(ApiError::bad_request("title must not be empty"));
    }
    if let Some(participants) = &update.participant_ids {
        require_participants(&state, &existing.account_id, participants).await?;
    }

    let conversation = state
        .repo
        .update_conversation(&conversation_id, update)
        .await?
        .ok_or_else(|| conversation_not_found(&conversation_id))?;
    Ok(Json(conversation))
}

#[instrument(skip(state, user), fields(user_id = %user.id()))]
pub async fn delete_conversation(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(conversation_id): Path<String>,
) -> ApiResult<StatusCode> {
    let existing = load_conversation(&state, &conversation_id).await?;
    require_member(&state, &user, &existing.account_id).await?;

    // Streams writing into the conversation have nothing left to write to.
    for message in state.repo.list_messages(&conversation_id).await? {
        if message.streaming {
            state.streams.cancel(&message.id);
        }
    }

    state
        .repo
        .delete_conversation(&conversation_id)
        .await?
        .ok_or_else(|| conversation_not_found(&conversation_id))?;
    info!(conversation_id = %conversation_id, "Deleted conversation");
    Ok(StatusCode::NO_CONTENT)
}

// ============================================================================
// Messages
// ============================================================================

/// Post a message, optionally starting a streamed assistant reply.
#[instrument(skip(state, user, request), fields(user_id = %user.id(), reply = request.reply))]
pub async fn post_message(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(conversation_id): Path<String>,
    Json(request): Json<PostMessageRequest>,
) -> ApiResult<(StatusCode, Json<PostMessageResponse>)> {
    let conversation = load_conversation(&state, &conversation_id).await?;
    require_member(&state, &user, &conversation.account_id).await?;

    let message = state
        .repo
        .create_message(
            &conversation_id,
            Some(user.id()),
            MessageRole::User,
            &request.content,
            false,
        )
        .await?
        .ok_or_else(|| conversation_not_found(&conversation_id))?;

    let reply = if request.reply {
        let reply = state
            .repo
            .create_message(&conversation_id, None, MessageRole::Assistant, "", true)
            .await?
            .ok_or_else(|| conversation_not_found(&conversation_id))?;
        start_reply(&state, &message, &reply).await?;
        Some(reply)
    } else {
        None
    };

    Ok((
        StatusCode::CREATED,
        Json(PostMessageResponse { message, reply }),
    ))
}

#[instrument(skip(state, user), fields(user_id = %user.id()))]
pub async fn delete_message(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(message_id): Path<String>,
) -> ApiResult<StatusCode> {
    let message = load_message(&state, &message_id).await?;
    require_member(&state, &user, &message.account_id).await?;

    state.streams.cancel(&message_id);
    state
        .repo
        .delete_message(&message_id)
        .await?
        .ok_or_else(|| message_not_found(&message_id))?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Serialize)]
pub struct StopStreamResponse {
    pub stopped: bool,
}

/// Ask a running reply stream to stop. Content written so far is kept.
#[instrument(skip(state, user), fields(user_id = %user.id()))]
pub async fn stop_message(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(message_id): Path<String>,
) -> ApiResult<(StatusCode, Json<StopStreamResponse>)> {
    let message = load_message(&state, &message_id).await?;
    require_member(&state, &user, &message.account_id).await?;

    let stopped = state.streams.cancel(&message_id);
    Ok((StatusCode::ACCEPTED, Json(StopStreamResponse { stopped })))
}

// ============================================================================
// Settings
// ============================================================================

#[instrument(skip(state, admin, request), fields(user_id = %admin.0.id()))]
pub async fn put_setting(
    State(state): State<AppState>,
    admin: RequireAdmin,
    Path(key): Path<String>,
    Json(request): Json<PutSettingRequest>,
) -> ApiResult<Json<Setting>> {
    if key.trim().is_empty() {
        return Err(ApiError::bad_request("setting key must not be empty"));
    }
    check_entity_id(&key).map_err(|e| ApiError::bad_request(format!("invalid setting key: {e}")))?;
    let setting = state.repo.put_setting(&key, &request.value).await?;
    Ok(Json(setting))
}

// ============================================================================
// Helpers
// ============================================================================

async fn start_reply(state: &AppState, prompt: &Message, reply: &Message) -> ApiResult<()> {
    let sink = MessageStreamSink::new(state.repo.clone(), &reply.id);
    let acc = StreamAccumulator::new(sink, state.sync.stream_flush_interval()).with_retry(
        RetryPolicy {
            attempts: state.sync.flush_retry_attempts,
            backoff: state.sync.flush_retry_backoff(),
        },
    );
    let chunks = state.responder.respond(prompt);

    // Detached; the registry entry is the handle for stopping it.
    if let Err(e) = state.streams.spawn(reply.id.clone(), acc, chunks) {
        warn!(message_id = %reply.id, "Could not start reply stream: {}", e);
        // No writer will ever finalize the row, so close it here.
        state.repo.finish_message_stream(&reply.id).await?;
        return Err(ApiError::conflict(e.to_string()));
    }
    info!(message_id = %reply.id, "Started reply stream");
    Ok(())
}

async fn require_member(state: &AppState, user: &CurrentUser, account_id: &str) -> ApiResult<()> {
    if state.repo.is_member(user.id(), account_id).await? {
        Ok(())
    } else {
        warn!(user_id = %user.id(), account_id = %account_id, "Rejected cross-tenant mutation");
        Err(ApiError::forbidden(format!(
            "not a member of account {account_id}"
        )))
    }
}

async fn require_participants(
    state: &AppState,
    account_id: &str,
    participant_ids: &[String],
) -> ApiResult<()> {
    for participant in participant_ids {
        if !state.repo.is_member(participant, account_id).await? {
            return Err(ApiError::bad_request(format!(
                "participant {participant} is not a member of account {account_id}"
            )));
        }
    }
    Ok(())
}

async fn load_conversation(state: &AppState, id: &str) -> ApiResult<Conversation> {
    state
        .repo
        .get_conversation(id)
        .await?
        .ok_or_else(|| conversation_not_found(id))
}

async fn load_message(state: &AppState, id: &str) -> ApiResult<Message> {
    state
        .repo
        .get_message(id)
        .await?
        .ok_or_else(|| message_not_found(id))
}

fn conversation_not_found(id: &str) -> ApiError {
    ApiError::not_found(format!("Conversation {id} not found"))
}

fn message_not_found(id: &str) -> ApiError {
    ApiError::not_found(format!("Message {id} not found"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{AuthConfig, AuthState};
    use crate::config::SyncConfig;
    use crate::db::Database;
    use futures::stream;

    async fn test_state() -> AppState {
        let db = Database::in_memory().await.unwrap();
        let auth = AuthState::new(AuthConfig {
            jwt_secret: Some("handler-test-secret-with-at-least-32-chars".to_string()),
            ..AuthConfig::default()
        });
        let state = AppState::new(&db, auth, SyncConfig::default());
        state
            .repo
            .ensure_user("acct_a", "Tenant A", "usr_a", "Alice", false)
            .await
            .unwrap();
        state
    }

    #[tokio::test]
    async fn test_reply_that_cannot_start_is_not_left_streaming() {
        let state = test_state().await;
        let conversation = state
            .repo
            .create_conversation(CreateConversationRequest {
                account_id: "acct_a".to_string(),
                title: "Chat".to_string(),
                participant_ids: vec![],
            })
            .await
            .unwrap();
        let prompt = state
            .repo
            .create_message(&conversation.id, Some("usr_a"), MessageRole::User, "hi", false)
            .await
            .unwrap()
            .unwrap();
        let reply = state
            .repo
            .create_message(&conversation.id, None, MessageRole::Assistant, "", true)
            .await
            .unwrap()
            .unwrap();

        // Another writer already owns the reply.
        let other = StreamAccumulator::new(
            MessageStreamSink::new(state.repo.clone(), &reply.id),
            state.sync.stream_flush_interval(),
        );
        state
            .streams
            .spawn(reply.id.clone(), other, stream::pending::<anyhow::Result<String>>())
            .unwrap();

        let err = start_reply(&state, &prompt, &reply).await.unwrap_err();
        assert!(matches!(err, ApiError::Conflict(_)));

        let stored = state.repo.get_message(&reply.id).await.unwrap().unwrap();
        assert!(!stored.streaming);
        state.streams.cancel_all();
    }
}
