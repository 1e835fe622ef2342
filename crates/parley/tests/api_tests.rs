//! API integration tests.

use std::sync::Arc;
use std::time::Duration;

use axum::http::{Method, StatusCode};
use futures::StreamExt;
use futures::stream::{self, BoxStream};
use parley::auth::Principal;
use parley::chat::{Message, Responder};
use parley::hub::SubscribeOutcome;
use parley_protocol::{Channel, ChannelIdentifier, EntityType, Marker, ServerMessage};
use serde_json::{Value, json};
use tokio::sync::mpsc;

mod common;
use common::{ACCOUNT_A, ACCOUNT_B, ADMIN, ALICE, BOB, CAROL, TestApp};

async fn create_conversation(app: &TestApp, as_user: &str, participants: &[&str]) -> Value {
    let (status, body) = app
        .request(
            Method::POST,
            "/api/conversations",
            Some(as_user),
            Some(json!({
                "account_id": ACCOUNT_A,
                "title": "Launch plan",
                "participant_ids": participants,
            })),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED, "{body}");
    body
}

/// Drain everything currently queued for a connection.
fn drain(rx: &mut mpsc::Receiver<ServerMessage>) -> Vec<ServerMessage> {
    let mut messages = Vec::new();
    while let Ok(message) = rx.try_recv() {
        messages.push(message);
    }
    messages
}

fn refresh(channel: Channel) -> ServerMessage {
    ServerMessage::Message {
        identifier: channel.identifier(),
        message: Marker::refresh(),
    }
}

#[tokio::test]
async fn test_health_endpoint() {
    let app = TestApp::new().await;
    let (status, body) = app.request(Method::GET, "/health", None, None).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["hub_running"], true);
    assert!(body["version"].is_string());
}

#[tokio::test]
async fn test_protected_routes_require_auth() {
    let app = TestApp::new().await;
    let (status, body) = app
        .request(
            Method::POST,
            "/api/reconcile",
            None,
            Some(json!({"slots": ["me"]})),
        )
        .await;

    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert!(body["code"].is_string());
}

#[tokio::test]
async fn test_reconcile_answers_exactly_the_requested_slots() {
    let app = TestApp::new().await;
    let (status, body) = app
        .request(
            Method::POST,
            "/api/reconcile",
            Some(ALICE),
            Some(json!({
                "slots": ["me", "account:acct_a", "account:acct_b", "bogus", "users", "me"]
            })),
        )
        .await;

    assert_eq!(status, StatusCode::OK);
    let slots = body["slots"].as_object().unwrap();
    assert_eq!(slots.len(), 5);
    assert_eq!(slots["me"]["user_id"], ALICE);
    assert_eq!(slots["me"]["elevated"], false);
    assert_eq!(slots["me"]["accounts"][0]["id"], ACCOUNT_A);
    assert_eq!(slots["account:acct_a"]["name"], "Tenant A");
    // Other tenants, unknown slots and elevated-only slots read as null.
    assert!(slots["account:acct_b"].is_null());
    assert!(slots["bogus"].is_null());
    assert!(slots["users"].is_null());
}

#[tokio::test]
async fn test_reconcile_elevated_slots_for_admin() {
    let app = TestApp::new().await;
    let (status, body) = app
        .request(
            Method::POST,
            "/api/reconcile",
            Some(ADMIN),
            Some(json!({"slots": ["users", "settings", "user:usr_carol"]})),
        )
        .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["slots"]["users"].as_array().unwrap().len(), 4);
    assert!(body["slots"]["settings"].as_array().unwrap().is_empty());
    assert_eq!(body["slots"]["user:usr_carol"]["id"], CAROL);
}

#[tokio::test]
async fn test_conversation_mutations_are_tenant_scoped() {
    let app = TestApp::new().await;

    let conversation = create_conversation(&app, ALICE, &[ALICE, BOB]).await;
    assert_eq!(conversation["account_id"], ACCOUNT_A);
    assert_eq!(conversation["participant_ids"], json!([ALICE, BOB]));

    let (status, _) = app
        .request(
            Method::POST,
            "/api/conversations",
            Some(CAROL),
            Some(json!({"account_id": ACCOUNT_A, "title": "Intrusion"})),
        )
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let uri = format!("/api/conversations/{}", conversation["id"].as_str().unwrap());
    let (status, _) = app
        .request(Method::PATCH, &uri, Some(CAROL), Some(json!({"title": "x"})))
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, _) = app.request(Method::DELETE, &uri, Some(CAROL), None).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, body) = app
        .request(Method::PATCH, &uri, Some(BOB), Some(json!({"title": "Launch v2"})))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["title"], "Launch v2");
}

#[tokio::test]
async fn test_participants_must_belong_to_the_account() {
    let app = TestApp::new().await;
    let (status, body) = app
        .request(
            Method::POST,
            "/api/conversations",
            Some(ALICE),
            Some(json!({
                "account_id": ACCOUNT_A,
                "title": "Mixed",
                "participant_ids": [ALICE, CAROL],
            })),
        )
        .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "BAD_REQUEST");
}

#[tokio::test]
async fn test_missing_conversation_is_not_found() {
    let app = TestApp::new().await;
    let (status, _) = app
        .request(
            Method::POST,
            "/api/conversations/conv_missing/messages",
            Some(ALICE),
            Some(json!({"content": "hello"})),
        )
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_settings_require_admin() {
    let app = TestApp::new().await;

    let (status, _) = app
        .request(
            Method::PUT,
            "/api/settings/ui.theme",
            Some(ALICE),
            Some(json!({"value": "dark"})),
        )
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, body) = app
        .request(
            Method::PUT,
            "/api/settings/ui.theme",
            Some(ADMIN),
            Some(json!({"value": "dark"})),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["key"], "ui.theme");
    assert_eq!(body["value"], "dark");
}

#[tokio::test]
async fn test_mutation_fans_out_to_subscribed_connections() {
    let app = TestApp::new().await;
    let hub = &app.state.hub;

    let (alice, mut alice_rx) = hub.connect(Principal::new(ALICE, false)).unwrap();
    let (carol, mut carol_rx) = hub.connect(Principal::new(CAROL, false)).unwrap();

    let account_a = Channel::entity(EntityType::Account, ACCOUNT_A);
    let bob = Channel::entity(EntityType::User, BOB);
    assert_eq!(
        hub.subscribe(alice, account_a.identifier()).await.unwrap(),
        SubscribeOutcome::Confirmed
    );
    assert_eq!(
        hub.subscribe(alice, bob.identifier()).await.unwrap(),
        SubscribeOutcome::Confirmed
    );
    // Cross-tenant and collection subscriptions are refused.
    assert_eq!(
        hub.subscribe(carol, account_a.identifier()).await.unwrap(),
        SubscribeOutcome::Rejected
    );
    assert_eq!(
        hub.subscribe(carol, ChannelIdentifier::new("Conversation", "all"))
            .await
            .unwrap(),
        SubscribeOutcome::Rejected
    );
    drain(&mut alice_rx);
    drain(&mut carol_rx);

    create_conversation(&app, ALICE, &[BOB]).await;

    let received = drain(&mut alice_rx);
    assert_eq!(received, vec![refresh(account_a), refresh(bob)]);
    assert!(drain(&mut carol_rx).is_empty());
}

#[tokio::test]
async fn test_admin_sees_collection_refresh_for_user_changes() {
    let app = TestApp::new().await;
    let hub = &app.state.hub;

    let (admin, mut rx) = hub.connect(Principal::new(ADMIN, true)).unwrap();
    let users = ChannelIdentifier::new("User", "all");
    assert_eq!(
        hub.subscribe(admin, users).await.unwrap(),
        SubscribeOutcome::Confirmed
    );
    drain(&mut rx);

    app.state
        .repo
        .ensure_user(ACCOUNT_B, "Tenant B", "usr_dave", "Dave", false)
        .await
        .unwrap();

    assert_eq!(
        drain(&mut rx),
        vec![refresh(Channel::collection(EntityType::User))]
    );
}

#[tokio::test]
async fn test_deleting_conversation_sends_remove_to_its_channel() {
    let app = TestApp::new().await;
    let conversation = create_conversation(&app, ALICE, &[]).await;
    let id = conversation["id"].as_str().unwrap();

    let hub = &app.state.hub;
    let (alice, mut rx) = hub.connect(Principal::new(ALICE, false)).unwrap();
    let channel = Channel::entity(EntityType::Conversation, id);
    hub.subscribe(alice, channel.identifier()).await.unwrap();
    drain(&mut rx);

    let (status, _) = app
        .request(
            Method::DELETE,
            &format!("/api/conversations/{id}"),
            Some(ALICE),
            None,
        )
        .await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    assert_eq!(
        drain(&mut rx),
        vec![ServerMessage::Message {
            identifier: channel.identifier(),
            message: Marker::remove(),
        }]
    );

    let (_, body) = app
        .request(
            Method::POST,
            "/api/reconcile",
            Some(ALICE),
            Some(json!({"slots": [format!("conversation:{id}")]})),
        )
        .await;
    assert!(body["slots"][format!("conversation:{id}")].is_null());
}

#[tokio::test]
async fn test_deleting_conversation_removes_its_messages() {
    let app = TestApp::new().await;
    let conversation = create_conversation(&app, ALICE, &[]).await;
    let id = conversation["id"].as_str().unwrap();

    let mut message_ids = Vec::new();
    for content in ["first", "second"] {
        let (status, body) = app
            .request(
                Method::POST,
                &format!("/api/conversations/{id}/messages"),
                Some(ALICE),
                Some(json!({"content": content})),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED, "{body}");
        message_ids.push(body["message"]["id"].as_str().unwrap().to_string());
    }

    let hub = &app.state.hub;
    let (alice, mut rx) = hub.connect(Principal::new(ALICE, false)).unwrap();
    let first = Channel::entity(EntityType::Message, &message_ids[0]);
    let conversation_channel = Channel::entity(EntityType::Conversation, id);
    for channel in [&first, &conversation_channel] {
        assert_eq!(
            hub.subscribe(alice, channel.identifier()).await.unwrap(),
            SubscribeOutcome::Confirmed
        );
    }
    drain(&mut rx);

    let (status, _) = app
        .request(
            Method::DELETE,
            &format!("/api/conversations/{id}"),
            Some(ALICE),
            None,
        )
        .await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    // Message removals come first; the conversation's own remove is last.
    assert_eq!(
        drain(&mut rx),
        vec![
            ServerMessage::Message {
                identifier: first.identifier(),
                message: Marker::remove(),
            },
            refresh(conversation_channel.clone()),
            refresh(conversation_channel.clone()),
            ServerMessage::Message {
                identifier: conversation_channel.identifier(),
                message: Marker::remove(),
            },
        ]
    );
    assert!(app.state.repo.get_message(&message_ids[0]).await.unwrap().is_none());
}

#[tokio::test]
async fn test_setting_key_cannot_name_the_collection() {
    let app = TestApp::new().await;
    let hub = &app.state.hub;
    let (admin, mut rx) = hub.connect(Principal::new(ADMIN, true)).unwrap();
    hub.subscribe(admin, Channel::collection(EntityType::Setting).identifier())
        .await
        .unwrap();
    drain(&mut rx);

    let (status, body) = app
        .request(
            Method::PUT,
            "/api/settings/all",
            Some(ADMIN),
            Some(json!({"value": "dark"})),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST, "{body}");
    assert!(drain(&mut rx).is_empty());

    let err = app
        .state
        .repo
        .ensure_user(ACCOUNT_A, "Tenant A", "all", "Nobody", false)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("reserved"));
}

#[tokio::test]
async fn test_reply_streams_into_assistant_message() {
    let app = TestApp::new().await;
    let conversation = create_conversation(&app, ALICE, &[ALICE]).await;
    let id = conversation["id"].as_str().unwrap();

    let (status, body) = app
        .request(
            Method::POST,
            &format!("/api/conversations/{id}/messages"),
            Some(ALICE),
            Some(json!({"content": "hello streaming world", "reply": true})),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED, "{body}");
    assert_eq!(body["message"]["role"], "user");
    assert_eq!(body["reply"]["role"], "assistant");
    assert_eq!(body["reply"]["streaming"], true);

    let reply_id = body["reply"]["id"].as_str().unwrap();
    let reply = app.wait_for_stream_end(reply_id).await;
    assert_eq!(reply.content, "hello streaming world");
    assert!(!reply.streaming);
}

/// Emits one chunk, then never finishes.
struct StallingResponder;

impl Responder for StallingResponder {
    fn respond(&self, _prompt: &Message) -> BoxStream<'static, anyhow::Result<String>> {
        stream::iter([Ok("partial".to_string())])
            .chain(stream::pending())
            .boxed()
    }
}

#[tokio::test]
async fn test_stop_keeps_streamed_content() {
    let app = TestApp::with_responder(Arc::new(StallingResponder)).await;
    let conversation = create_conversation(&app, ALICE, &[]).await;
    let id = conversation["id"].as_str().unwrap();

    let (_, body) = app
        .request(
            Method::POST,
            &format!("/api/conversations/{id}/messages"),
            Some(ALICE),
            Some(json!({"content": "go", "reply": true})),
        )
        .await;
    let reply_id = body["reply"]["id"].as_str().unwrap().to_string();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let (status, _) = app
        .request(
            Method::POST,
            &format!("/api/messages/{reply_id}/stop"),
            Some(CAROL),
            None,
        )
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, body) = app
        .request(
            Method::POST,
            &format!("/api/messages/{reply_id}/stop"),
            Some(ALICE),
            None,
        )
        .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["stopped"], true);

    let reply = app.wait_for_stream_end(&reply_id).await;
    assert_eq!(reply.content, "partial");

    let (_, body) = app
        .request(
            Method::POST,
            &format!("/api/messages/{reply_id}/stop"),
            Some(ALICE),
            None,
        )
        .await;
    assert_eq!(body["stopped"], false);
}

#[tokio::test]
async fn test_delete_message_requires_membership() {
    let app = TestApp::new().await;
    let conversation = create_conversation(&app, ALICE, &[]).await;
    let id = conversation["id"].as_str().unwrap();

    let (_, body) = app
        .request(
            Method::POST,
            &format!("/api/conversations/{id}/messages"),
            Some(BOB),
            Some(json!({"content": "typo"})),
        )
        .await;
    assert!(body["reply"].is_null());
    let message_uri = format!("/api/messages/{}", body["message"]["id"].as_str().unwrap());

    let (status, _) = app.request(Method::DELETE, &message_uri, Some(CAROL), None).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, _) = app.request(Method::DELETE, &message_uri, Some(ALICE), None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, _) = app.request(Method::DELETE, &message_uri, Some(ALICE), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}
