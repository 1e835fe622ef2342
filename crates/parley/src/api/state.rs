//! Application state shared across handlers.

use std::sync::Arc;

use crate::auth::AuthState;
use crate::authority::TenantAuthority;
use crate::chat::{ChatDirectory, ChatRepository, EchoResponder, Responder};
use crate::config::SyncConfig;
use crate::db::Database;
use crate::hub::Hub;
use crate::notify::ChangeNotifier;
use crate::reconcile::SlotResolver;
use crate::stream::StreamRegistry;

#[derive(Clone)]
pub struct AppState {
    pub repo: ChatRepository,
    pub hub: Arc<Hub>,
    pub auth: AuthState,
    pub streams: Arc<StreamRegistry>,
    pub slots: SlotResolver,
    pub responder: Arc<dyn Responder>,
    pub sync: SyncConfig,
}

impl AppState {
    /// Wire the broadcast path: directory -> authority -> hub -> notifier ->
    /// repository. The hub is returned stopped; call `hub.start()` before
    /// serving.
    pub fn new(db: &Database, auth: AuthState, sync: SyncConfig) -> Self {
        let pool = db.pool().clone();
        let authority = Arc::new(TenantAuthority::new(ChatDirectory::new(pool.clone())));
        let hub = Arc::new(Hub::new(authority, sync.connection_buffer));
        let notifier = ChangeNotifier::new(hub.clone());
        let repo = ChatRepository::new(pool, notifier);

        Self {
            slots: SlotResolver::new(repo.clone()),
            repo,
            hub,
            auth,
            streams: Arc::new(StreamRegistry::new()),
            responder: Arc::new(EchoResponder::default()),
            sync,
        }
    }

    pub fn with_responder(mut self, responder: Arc<dyn Responder>) -> Self {
        self.responder = responder;
        self
    }
}
