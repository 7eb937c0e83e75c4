//! Service control surface.
//!
//! In-process facade consumed by the front-end: one method per control
//! message. Setup failures surface synchronously from these calls;
//! per-event failures never do.

use crate::adapter::DebugClient;
use crate::cdp::CdpClient;
use crate::error::{EngineError, EngineResult};
use crate::session::{Session, SessionRegistry};
use refract_common::{
    EngineStats, NetworkEvent, PendingItem, PoolStats, SessionConfig, SessionId, TargetId,
    TargetInfo,
};
use refract_rules::{Rewrite, RuleSet};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

/// The engine's public API.
#[derive(Default)]
pub struct InterceptService {
    registry: SessionRegistry,
}

impl InterceptService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a session against the configured DevTools endpoint.
    pub fn start_session(&self, config: SessionConfig) -> SessionId {
        let client = Arc::new(CdpClient::new(config.dev_tools_url.clone()));
        self.start_session_with_client(config, client)
    }

    /// Create a session against a caller-supplied debug client. This is
    /// the seam integration tests use to drive the engine without a
    /// browser.
    pub fn start_session_with_client(
        &self,
        config: SessionConfig,
        client: Arc<dyn DebugClient>,
    ) -> SessionId {
        let id = SessionId::new(Uuid::new_v4().to_string());
        let session = Session::new(id.clone(), config, client);
        self.registry.insert(session);
        info!(session = %id, "session started");
        id
    }

    /// Stop and remove a session; cancels all of its tasks.
    pub async fn stop_session(&self, id: &SessionId) -> EngineResult<()> {
        let session = self
            .registry
            .remove(id)
            .ok_or_else(|| EngineError::SessionNotFound(id.clone()))?;
        session.stop().await;
        Ok(())
    }

    fn session(&self, id: &SessionId) -> EngineResult<Arc<Session>> {
        self.registry
            .get(id)
            .ok_or_else(|| EngineError::SessionNotFound(id.clone()))
    }

    pub async fn list_targets(&self, id: &SessionId) -> EngineResult<Vec<TargetInfo>> {
        self.session(id)?.manager().list_targets().await
    }

    /// Attach to a target; an empty/absent id selects auto-follow.
    pub async fn attach_target(
        &self,
        id: &SessionId,
        target: Option<TargetId>,
    ) -> EngineResult<()> {
        self.session(id)?.manager().attach(target).await
    }

    pub async fn detach_target(
        &self,
        id: &SessionId,
        target: Option<TargetId>,
    ) -> EngineResult<()> {
        let session = self.session(id)?;
        if let (Some(requested), Some(current)) =
            (&target, session.manager().current_target().await)
        {
            if *requested != current {
                warn!(requested = %requested, current = %current, "detach target mismatch, detaching current binding");
            }
        }
        session.manager().detach().await;
        Ok(())
    }

    pub async fn enable_interception(&self, id: &SessionId) -> EngineResult<()> {
        self.session(id)?.manager().enable().await
    }

    pub async fn disable_interception(&self, id: &SessionId) -> EngineResult<()> {
        self.session(id)?.manager().disable().await
    }

    /// Validate and atomically activate a rule set. On validation failure
    /// the session's current rules stay in effect.
    pub async fn load_rules(&self, id: &SessionId, rules: RuleSet) -> EngineResult<()> {
        self.session(id)?.engine().load(rules)?;
        Ok(())
    }

    pub async fn rule_stats(&self, id: &SessionId) -> EngineResult<EngineStats> {
        Ok(self.session(id)?.engine().stats())
    }

    pub async fn pool_stats(&self, id: &SessionId) -> EngineResult<PoolStats> {
        Ok(self.session(id)?.manager().pool().stats())
    }

    /// Subscribe to the session's observability stream (single consumer).
    pub async fn subscribe_events(
        &self,
        id: &SessionId,
    ) -> EngineResult<mpsc::Receiver<NetworkEvent>> {
        self.session(id)?.take_events().await
    }

    /// Subscribe to the session's pending-review stream (single consumer).
    pub async fn subscribe_pending(
        &self,
        id: &SessionId,
    ) -> EngineResult<mpsc::Receiver<PendingItem>> {
        self.session(id)?.take_pending().await
    }

    /// Approve a pending transaction, optionally rewriting it. Approval
    /// is stage-agnostic: the queued item's stage decides the terminating
    /// call. Unknown item ids are dropped silently.
    pub async fn approve(
        &self,
        id: &SessionId,
        item_id: &str,
        rewrite: Rewrite,
    ) -> EngineResult<bool> {
        Ok(self.session(id)?.pause().approve(item_id, rewrite))
    }

    /// Reject a pending transaction; its default action applies.
    pub async fn reject(&self, id: &SessionId, item_id: &str) -> EngineResult<bool> {
        Ok(self.session(id)?.pause().reject(item_id))
    }
}
