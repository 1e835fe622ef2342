//! End-to-end tests of the sync client against a live server.

use std::sync::Arc;
use std::time::Duration;

use axum::http::Method;
use parley::sync::{
    DebounceConfig, FetchReason, HttpReconciliationFetcher, SubscribeAck, SyncError, SyncHandle,
    SyncMultiplexer, SyncUpdate, WsSyncClient, forward_events,
};
use parley_protocol::{Channel, EntityType};
use futures::StreamExt;
use parley_protocol::ServerMessage;
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};
use tokio_util::sync::CancellationToken;

mod common;
use common::{ACCOUNT_A, ACCOUNT_B, ALICE, TestApp};

/// Serve `app` on an ephemeral port and return its base URL.
async fn serve(app: &TestApp) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let router = app.router.clone();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    format!("http://{addr}")
}

struct LiveClient {
    client: WsSyncClient,
    handle: SyncHandle,
    updates: mpsc::UnboundedReceiver<SyncUpdate>,
    cancel: CancellationToken,
}

impl LiveClient {
    /// Start a server for `app` and a multiplexer acting as `user_id`.
    ///
    /// The transport is not started yet, so registrations made before
    /// `connect` are subscribed by the first connection.
    async fn start(app: &TestApp, user_id: &str) -> Self {
        let base = serve(app).await;
        let token = app.token(user_id);
        let sync = &app.state.sync;
        let client = WsSyncClient::new(&base, token.clone(), sync);
        let fetcher = HttpReconciliationFetcher::new(&base, token);
        let (handle, updates, _task) = SyncMultiplexer::spawn(
            Arc::new(client.clone()),
            Arc::new(fetcher),
            DebounceConfig::from(sync),
        );

        Self {
            client,
            handle,
            updates,
            cancel: CancellationToken::new(),
        }
    }

    fn connect(&self) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        self.client.run(events_tx, self.cancel.clone());
        tokio::spawn(forward_events(self.handle.clone(), events_rx));
    }

    async fn next_update(&mut self) -> SyncUpdate {
        timeout(Duration::from_secs(5), self.updates.recv())
            .await
            .expect("timed out waiting for a sync update")
            .expect("multiplexer stopped")
    }
}

impl Drop for LiveClient {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn reconciled(update: SyncUpdate) -> (FetchReason, serde_json::Map<String, serde_json::Value>) {
    match update {
        SyncUpdate::Reconciled { reason, response } => {
            (reason, response.slots.into_iter().collect())
        }
        other => panic!("expected a reconciliation, got {other:?}"),
    }
}

#[tokio::test]
async fn test_marker_triggers_debounced_reconciliation() {
    let app = TestApp::new().await;
    let mut live = LiveClient::start(&app, ALICE).await;
    let account = Channel::entity(EntityType::Account, ACCOUNT_A);

    let registered = live
        .handle
        .register(account.clone(), [format!("conversations:{ACCOUNT_A}")])
        .await;
    assert_eq!(registered, Err(SyncError::Disconnected));

    live.connect();
    let (reason, slots) = reconciled(live.next_update().await);
    assert_eq!(reason, FetchReason::Reconnected);
    assert_eq!(slots["conversations:acct_a"], json!([]));

    for title in ["One", "Two"] {
        app.request(
            Method::POST,
            "/api/conversations",
            Some(ALICE),
            Some(json!({"account_id": ACCOUNT_A, "title": title})),
        )
        .await;
    }

    // Both markers may land in one window or in two; the last fetch sees both.
    let mut titles = Vec::new();
    while titles.len() < 2 {
        let (reason, slots) = reconciled(live.next_update().await);
        assert_eq!(reason, FetchReason::Debounced);
        assert_eq!(slots.len(), 1);
        titles = slots["conversations:acct_a"]
            .as_array()
            .unwrap()
            .iter()
            .map(|c| c["title"].as_str().unwrap().to_string())
            .collect();
    }
    titles.sort();
    assert_eq!(titles, vec!["One", "Two"]);
}

#[tokio::test]
async fn test_unauthorized_channels_are_rejected_and_dropped() {
    let app = TestApp::new().await;
    let live = LiveClient::start(&app, ALICE).await;
    live.connect();

    // Nothing is registered yet, so the first connect fetches nothing.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !live.client.is_connected() {
        assert!(tokio::time::Instant::now() < deadline, "never connected");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let other_tenant = Channel::entity(EntityType::Account, ACCOUNT_B);
    let all_users = Channel::collection(EntityType::User);
    assert_eq!(
        live.handle.register(other_tenant, ["account:acct_b"]).await,
        Ok(SubscribeAck::Rejected)
    );
    assert_eq!(
        live.handle.register(all_users, ["users"]).await,
        Ok(SubscribeAck::Rejected)
    );
    assert_eq!(
        live.handle
            .register(Channel::entity(EntityType::Account, ACCOUNT_A), ["me"])
            .await,
        Ok(SubscribeAck::Confirmed)
    );

    let snapshot = live.handle.snapshot().await.unwrap();
    assert_eq!(snapshot.entries.len(), 1);
    assert!(snapshot.entries[0].subscribed);
}

#[tokio::test]
async fn test_reconnect_resubscribes_and_refetches() {
    let app = TestApp::new().await;
    let mut live = LiveClient::start(&app, ALICE).await;
    let account = Channel::entity(EntityType::Account, ACCOUNT_A);
    let _ = live.handle.register(account.clone(), ["me"]).await;

    live.connect();
    let (reason, _) = reconciled(live.next_update().await);
    assert_eq!(reason, FetchReason::Reconnected);
    assert_eq!(app.state.hub.subscriber_count(&account), 1);

    // Restarting the hub drops every connection.
    app.state.hub.stop();
    app.state.hub.start();

    let (reason, slots) = reconciled(live.next_update().await);
    assert_eq!(reason, FetchReason::Reconnected);
    assert_eq!(slots["me"]["user_id"], ALICE);
    assert_eq!(app.state.hub.subscriber_count(&account), 1);

    live.handle.teardown().await.unwrap();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while app.state.hub.subscriber_count(&account) > 0 {
        assert!(tokio::time::Instant::now() < deadline, "unsubscribe never arrived");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn test_evicted_connection_is_closed_by_the_server() {
    let app = TestApp::new().await;
    let base = serve(&app).await;
    let url = format!(
        "{}/api/ws?token={}",
        base.replace("http://", "ws://"),
        app.token(ALICE)
    );
    let (mut socket, _) = connect_async(url).await.unwrap();

    let welcome = timeout(Duration::from_secs(5), socket.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    let text = match welcome {
        WsMessage::Text(text) => text,
        other => panic!("expected a text frame, got {other:?}"),
    };
    let ServerMessage::Welcome { connection_id } =
        serde_json::from_str::<ServerMessage>(text.as_str()).unwrap()
    else {
        panic!("expected welcome, got {text}");
    };
    assert_eq!(app.state.hub.connection_count(), 1);

    app.state.hub.disconnect(connection_id.parse().unwrap());

    // The server closes without waiting for anything from the client.
    let closed = timeout(Duration::from_secs(5), async {
        while let Some(frame) = socket.next().await {
            match frame {
                Ok(WsMessage::Close(_)) | Err(_) => return,
                Ok(_) => {}
            }
        }
    })
    .await;
    assert!(closed.is_ok(), "server kept the evicted socket open");
    assert_eq!(app.state.hub.connection_count(), 0);
}
