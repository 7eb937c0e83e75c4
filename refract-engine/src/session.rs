//! Session: one logical interception context bound to a browser endpoint.

use crate::adapter::DebugClient;
use crate::error::{EngineError, EngineResult};
use crate::executor::ActionExecutor;
use crate::handler::{EventHandler, EventSink};
use crate::manager::InterceptionManager;
use crate::pause::PauseCoordinator;
use dashmap::DashMap;
use refract_common::{NetworkEvent, PendingItem, SessionConfig, SessionId};
use refract_rules::RuleEngine;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Capacity of the per-session events channel; producers drop on full.
const EVENTS_CAPACITY: usize = 1024;

/// All mutable state of one interception session. The session context is
/// the root of the cancellation tree: target bindings, watchers, pool
/// workers and per-event tasks are all descendants.
pub struct Session {
    id: SessionId,
    config: SessionConfig,
    engine: Arc<RuleEngine>,
    pause: Arc<PauseCoordinator>,
    manager: Arc<InterceptionManager>,
    cancel: CancellationToken,
    events_rx: Mutex<Option<mpsc::Receiver<NetworkEvent>>>,
    pending_rx: Mutex<Option<mpsc::Receiver<PendingItem>>>,
}

impl Session {
    pub fn new(id: SessionId, config: SessionConfig, client: Arc<dyn DebugClient>) -> Arc<Self> {
        let cancel = CancellationToken::new();
        let (events_tx, events_rx) = mpsc::channel(EVENTS_CAPACITY);
        let engine = Arc::new(RuleEngine::new());
        let (pause, pending_rx) = PauseCoordinator::new(config.effective_pending_capacity());
        let pause = Arc::new(pause);

        let handler = Arc::new(EventHandler::new(
            engine.clone(),
            ActionExecutor::new(config.effective_body_threshold()),
            pause.clone(),
            EventSink::new(id.clone(), events_tx),
        ));
        let manager = InterceptionManager::new(
            id.clone(),
            config.clone(),
            client,
            handler,
            cancel.clone(),
        );

        Arc::new(Self {
            id,
            config,
            engine,
            pause,
            manager,
            cancel,
            events_rx: Mutex::new(Some(events_rx)),
            pending_rx: Mutex::new(Some(pending_rx)),
        })
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn engine(&self) -> &Arc<RuleEngine> {
        &self.engine
    }

    pub fn pause(&self) -> &Arc<PauseCoordinator> {
        &self.pause
    }

    pub fn manager(&self) -> &Arc<InterceptionManager> {
        &self.manager
    }

    /// Hand out the events stream. Single consumer; a second subscription
    /// is an error.
    pub async fn take_events(&self) -> EngineResult<mpsc::Receiver<NetworkEvent>> {
        self.events_rx
            .lock()
            .await
            .take()
            .ok_or(EngineError::AlreadySubscribed)
    }

    /// Hand out the pending stream. Single consumer.
    pub async fn take_pending(&self) -> EngineResult<mpsc::Receiver<PendingItem>> {
        self.pending_rx
            .lock()
            .await
            .take()
            .ok_or(EngineError::AlreadySubscribed)
    }

    /// Cancel the whole session tree and release the browser connection.
    pub async fn stop(&self) {
        self.cancel.cancel();
        self.manager.shutdown().await;
        info!(session = %self.id, "session stopped");
    }
}

/// Maps session ids to live sessions.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: DashMap<SessionId, Arc<Session>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, session: Arc<Session>) {
        self.sessions.insert(session.id().clone(), session);
    }

    pub fn get(&self, id: &SessionId) -> Option<Arc<Session>> {
        self.sessions.get(id).map(|entry| entry.value().clone())
    }

    pub fn remove(&self, id: &SessionId) -> Option<Arc<Session>> {
        self.sessions.remove(id).map(|(_, session)| session)
    }

    pub fn list(&self) -> Vec<Arc<Session>> {
        self.sessions
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
