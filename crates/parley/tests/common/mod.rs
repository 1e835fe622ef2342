//! Test utilities and common setup.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use axum::{
    Router,
    body::Body,
    http::{Method, Request, StatusCode, header},
};
use serde_json::Value;
use tower::ServiceExt;

use parley::api::{self, AppState};
use parley::auth::{AuthConfig, AuthState, Role};
use parley::chat::{Message, Responder};
use parley::config::SyncConfig;
use parley::db::Database;

pub const ACCOUNT_A: &str = "acct_a";
pub const ACCOUNT_B: &str = "acct_b";
pub const ALICE: &str = "usr_alice";
pub const BOB: &str = "usr_bob";
pub const CAROL: &str = "usr_carol";
pub const ADMIN: &str = "usr_admin";

/// Create a test AuthConfig with a JWT secret for testing.
fn test_auth_config() -> AuthConfig {
    AuthConfig {
        jwt_secret: Some("test-secret-for-integration-tests-minimum-32-chars".to_string()),
        ..AuthConfig::default()
    }
}

fn test_sync_config() -> SyncConfig {
    SyncConfig {
        stream_flush_interval_ms: 20,
        flush_retry_backoff_ms: 5,
        debounce_window_ms: 30,
        debounce_max_wait_ms: Some(200),
        subscribe_timeout_ms: 2000,
        reconnect_backoff_ms: 50,
        reconnect_backoff_max_ms: 200,
        ..SyncConfig::default()
    }
}

/// A running app over an in-memory database with two tenants:
/// alice and bob in `acct_a`, carol in `acct_b`, plus an admin.
pub struct TestApp {
    pub state: AppState,
    pub router: Router,
}

impl TestApp {
    pub async fn new() -> Self {
        Self::build(None).await
    }

    pub async fn with_responder(responder: Arc<dyn Responder>) -> Self {
        Self::build(Some(responder)).await
    }

    async fn build(responder: Option<Arc<dyn Responder>>) -> Self {
        let db = Database::in_memory().await.unwrap();
        let mut state = AppState::new(&db, AuthState::new(test_auth_config()), test_sync_config());
        if let Some(responder) = responder {
            state = state.with_responder(responder);
        }

        let repo = &state.repo;
        repo.ensure_user(ACCOUNT_A, "Tenant A", ALICE, "Alice", false)
            .await
            .unwrap();
        repo.ensure_user(ACCOUNT_A, "Tenant A", BOB, "Bob", false)
            .await
            .unwrap();
        repo.ensure_user(ACCOUNT_B, "Tenant B", CAROL, "Carol", false)
            .await
            .unwrap();
        repo.ensure_user("acct_ops", "Operations", ADMIN, "Admin", true)
            .await
            .unwrap();

        state.hub.start();
        let router = api::create_router(state.clone());
        Self { state, router }
    }

    pub fn token(&self, user_id: &str) -> String {
        let role = if user_id == ADMIN { Role::Admin } else { Role::User };
        self.state
            .auth
            .generate_token(user_id, user_id, role)
            .unwrap()
    }

    /// Send a request as `user_id` (or anonymously) and decode the JSON body.
    pub async fn request(
        &self,
        method: Method,
        uri: &str,
        user_id: Option<&str>,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let mut builder = Request::builder().uri(uri).method(method);
        if let Some(user_id) = user_id {
            builder = builder.header(
                header::AUTHORIZATION,
                format!("Bearer {}", self.token(user_id)),
            );
        }
        let body = match body {
            Some(json) => {
                builder = builder.header(header::CONTENT_TYPE, "application/json");
                Body::from(serde_json::to_vec(&json).unwrap())
            }
            None => Body::empty(),
        };

        let response = self
            .router
            .clone()
            .oneshot(builder.body(body).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), 1024 * 1024)
            .await
            .unwrap();
        let json = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, json)
    }

    /// Poll a message until its stream has finished.
    pub async fn wait_for_stream_end(&self, message_id: &str) -> Message {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let message = self
                .state
                .repo
                .get_message(message_id)
                .await
                .unwrap()
                .unwrap();
            if !message.streaming && !self.state.streams.is_active(message_id) {
                return message;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "stream for {message_id} did not finish"
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}
