//! Per-session interception manager.
//!
//! Owns one adapter connection bound to a single target, consumes its
//! paused-event stream on a dedicated task and dispatches every event
//! through the worker pool. In auto-follow mode a workspace watcher polls
//! the target list and follows page visibility.

use crate::adapter::{DebugClient, TargetConn, PATTERN_ALL};
use crate::error::{EngineError, EngineResult};
use crate::handler::{EventHandler, Termination};
use crate::pool::WorkerPool;
use futures::FutureExt;
use refract_common::{
    PausedEvent, SessionConfig, SessionId, Stage, TargetDescriptor, TargetId, TargetInfo,
};
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Cadence of the auto-follow target poll.
const WORKSPACE_POLL_INTERVAL: Duration = Duration::from_secs(2);
/// Budget for a degrade continue.
const DEGRADE_TIMEOUT: Duration = Duration::from_secs(1);

/// How the manager chooses its target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttachMode {
    /// Follow whichever HTTP(S) page target most recently became visible.
    AutoFollow,
    /// Stay on the given target, never switch.
    Fixed(TargetId),
}

struct TargetBinding {
    target: TargetDescriptor,
    conn: Arc<dyn TargetConn>,
    cancel: CancellationToken,
}

struct ManagerState {
    mode: AttachMode,
    binding: Option<TargetBinding>,
    enabled: bool,
    watcher_cancel: Option<CancellationToken>,
}

pub struct InterceptionManager {
    session: SessionId,
    config: SessionConfig,
    client: Arc<dyn DebugClient>,
    handler: Arc<EventHandler>,
    pool: Arc<WorkerPool>,
    session_cancel: CancellationToken,
    state: Mutex<ManagerState>,
}

impl InterceptionManager {
    pub fn new(
        session: SessionId,
        config: SessionConfig,
        client: Arc<dyn DebugClient>,
        handler: Arc<EventHandler>,
        session_cancel: CancellationToken,
    ) -> Arc<Self> {
        let pool = WorkerPool::new(config.concurrency, &session_cancel);
        Arc::new(Self {
            session,
            config,
            client,
            handler,
            pool,
            session_cancel,
            state: Mutex::new(ManagerState {
                mode: AttachMode::AutoFollow,
                binding: None,
                enabled: false,
                watcher_cancel: None,
            }),
        })
    }

    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }

    /// Attach to a target. An empty/absent id selects auto-follow mode.
    pub async fn attach(self: &Arc<Self>, target: Option<TargetId>) -> EngineResult<()> {
        let mode = match target {
            Some(id) if !id.is_empty() => AttachMode::Fixed(id),
            _ => AttachMode::AutoFollow,
        };
        info!(session = %self.session, mode = ?mode, "attaching browser target");

        {
            let mut state = self.state.lock().await;
            state.mode = mode.clone();
        }

        let descriptor = self.resolve_target(&mode).await?;
        self.bind(descriptor).await?;

        match mode {
            AttachMode::AutoFollow => self.start_workspace_watcher().await,
            AttachMode::Fixed(_) => self.stop_workspace_watcher().await,
        }
        Ok(())
    }

    /// Tear down the current binding and watchers. Terminal until the
    /// next `attach`.
    pub async fn detach(&self) {
        self.stop_workspace_watcher().await;
        let mut state = self.state.lock().await;
        state.enabled = false;
        if let Some(binding) = state.binding.take() {
            binding.cancel.cancel();
            binding.conn.close().await;
            info!(session = %self.session, target = %binding.target.id, "detached from target");
        }
    }

    /// Enable interception on the current binding and start consuming.
    pub async fn enable(self: &Arc<Self>) -> EngineResult<()> {
        let (conn, cancel, target) = {
            let state = self.state.lock().await;
            let binding = state.binding.as_ref().ok_or(EngineError::NotAttached)?;
            (
                binding.conn.clone(),
                binding.cancel.clone(),
                binding.target.id.clone(),
            )
        };

        conn.enable_network().await?;
        conn.enable_fetch(PATTERN_ALL, &[Stage::Request, Stage::Response])
            .await?;
        self.state.lock().await.enabled = true;
        self.spawn_consume(conn, cancel, target);
        info!(session = %self.session, "interception enabled");
        Ok(())
    }

    /// Stop pausing traffic but keep the connection.
    pub async fn disable(&self) -> EngineResult<()> {
        let conn = {
            let mut state = self.state.lock().await;
            let conn = state
                .binding
                .as_ref()
                .ok_or(EngineError::NotAttached)?
                .conn
                .clone();
            state.enabled = false;
            conn
        };
        conn.disable_fetch().await?;
        info!(session = %self.session, "interception disabled");
        Ok(())
    }

    /// Current target id, if attached.
    pub async fn current_target(&self) -> Option<TargetId> {
        self.state
            .lock()
            .await
            .binding
            .as_ref()
            .map(|b| b.target.id.clone())
    }

    /// List browser targets with current/user flags.
    pub async fn list_targets(&self) -> EngineResult<Vec<TargetInfo>> {
        let current = self.current_target().await;
        let targets = self.client.list_targets().await?;
        Ok(targets
            .into_iter()
            .map(|t| TargetInfo {
                is_current: current.as_ref() == Some(&t.id),
                is_user: t.is_user_page(),
                id: t.id,
                kind: t.kind,
                url: t.url,
                title: t.title,
            })
            .collect())
    }

    /// Full teardown: binding, watchers and worker pool.
    pub async fn shutdown(&self) {
        self.detach().await;
        self.pool.shutdown();
    }

    async fn resolve_target(&self, mode: &AttachMode) -> EngineResult<TargetDescriptor> {
        let targets = self.client.list_targets().await?;
        match mode {
            AttachMode::Fixed(id) => targets
                .into_iter()
                .find(|t| t.id == *id)
                .ok_or_else(|| EngineError::NoTarget),
            AttachMode::AutoFollow => {
                select_auto_target(&targets).ok_or(EngineError::NoTarget)
            }
        }
    }

    /// Replace the current binding with a connection to `descriptor`.
    async fn bind(self: &Arc<Self>, descriptor: TargetDescriptor) -> EngineResult<()> {
        let cancel = self.session_cancel.child_token();
        let conn = self.client.dial(&descriptor, cancel.clone()).await?;

        let mut state = self.state.lock().await;
        if let Some(old) = state.binding.take() {
            old.cancel.cancel();
            old.conn.close().await;
        }
        info!(session = %self.session, target = %descriptor.id, url = %descriptor.url, "bound to target");
        state.binding = Some(TargetBinding {
            target: descriptor,
            conn,
            cancel,
        });
        Ok(())
    }

    fn spawn_consume(
        self: &Arc<Self>,
        conn: Arc<dyn TargetConn>,
        cancel: CancellationToken,
        target: TargetId,
    ) {
        let manager = self.clone();
        tokio::spawn(async move {
            let mut rx = match conn.paused_events().await {
                Ok(rx) => rx,
                Err(err) => {
                    error!(error = %err, "paused event stream subscription failed");
                    manager.handle_stream_closed(&cancel).await;
                    return;
                }
            };
            info!(target = %target, "consuming paused event stream");
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!(target = %target, "paused event consumer cancelled");
                        return;
                    }
                    event = rx.recv() => match event {
                        Some(event) => manager.dispatch(conn.clone(), target.clone(), event),
                        None => {
                            manager.handle_stream_closed(&cancel).await;
                            return;
                        }
                    },
                }
            }
        });
    }

    /// Hand one event to the pool; degrade on overflow. The job itself is
    /// guarded by the per-event budget and panic isolation, so a handler
    /// that dies without answering still resolves its transaction.
    fn dispatch(self: &Arc<Self>, conn: Arc<dyn TargetConn>, target: TargetId, ev: PausedEvent) {
        let handler = self.handler.clone();
        let budget = Duration::from_millis(self.config.effective_process_timeout_ms());
        let termination = Termination::new();

        let job = {
            let handler = handler.clone();
            let conn = conn.clone();
            let target = target.clone();
            let ev = ev.clone();
            let termination = termination.clone();
            Box::pin(async move {
                let work = handler.handle(conn.clone(), target.clone(), ev.clone(), termination.clone());
                match AssertUnwindSafe(tokio::time::timeout(budget, work))
                    .catch_unwind()
                    .await
                {
                    Ok(Ok(())) => {}
                    Ok(Err(_)) => {
                        if !termination.is_marked() {
                            let _ = tokio::time::timeout(
                                DEGRADE_TIMEOUT,
                                handler.degrade(conn.as_ref(), &target, &ev, "per-event budget exceeded"),
                            )
                            .await;
                        }
                    }
                    Err(_) => {
                        if !termination.is_marked() {
                            let _ = tokio::time::timeout(
                                DEGRADE_TIMEOUT,
                                handler.degrade(conn.as_ref(), &target, &ev, "handler panicked"),
                            )
                            .await;
                        }
                    }
                }
            })
        };

        if !self.pool.submit(job) {
            tokio::spawn(async move {
                let _ = tokio::time::timeout(
                    DEGRADE_TIMEOUT,
                    handler.degrade(conn.as_ref(), &target, &ev, "worker pool queue full"),
                )
                .await;
            });
        }
    }

    /// The paused stream closed. Re-attach in the current mode unless the
    /// binding or session was terminally cancelled or interception was
    /// turned off.
    async fn handle_stream_closed(self: &Arc<Self>, binding_cancel: &CancellationToken) {
        if binding_cancel.is_cancelled() || self.session_cancel.is_cancelled() {
            return;
        }
        let mode = {
            let state = self.state.lock().await;
            if !state.enabled {
                info!(session = %self.session, "interception disabled, consumer stopped");
                return;
            }
            state.mode.clone()
        };

        warn!(session = %self.session, "paused event stream interrupted, re-attaching");
        let target = match mode {
            AttachMode::Fixed(id) => Some(id),
            AttachMode::AutoFollow => None,
        };
        if let Err(err) = self.reattach_and_enable(target).await {
            error!(error = %err, "automatic re-attach failed");
        }
    }

    async fn reattach_and_enable(self: &Arc<Self>, target: Option<TargetId>) -> EngineResult<()> {
        let mode = match &target {
            Some(id) => AttachMode::Fixed(id.clone()),
            None => AttachMode::AutoFollow,
        };
        let descriptor = self.resolve_target(&mode).await?;
        self.bind(descriptor).await?;
        self.enable().await
    }

    async fn start_workspace_watcher(self: &Arc<Self>) {
        let mut state = self.state.lock().await;
        if state.watcher_cancel.is_some() {
            return;
        }
        let cancel = self.session_cancel.child_token();
        state.watcher_cancel = Some(cancel.clone());
        drop(state);

        let manager = self.clone();
        tokio::spawn(async move {
            manager.workspace_loop(cancel).await;
        });
        debug!(session = %self.session, "workspace watcher started");
    }

    async fn stop_workspace_watcher(&self) {
        let mut state = self.state.lock().await;
        if let Some(cancel) = state.watcher_cancel.take() {
            cancel.cancel();
        }
    }

    /// Poll the target list and keep one lifecycle watcher per HTTP(S)
    /// page target; a `visible` event switches the binding.
    async fn workspace_loop(self: Arc<Self>, cancel: CancellationToken) {
        let mut watchers: HashMap<TargetId, CancellationToken> = HashMap::new();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(WORKSPACE_POLL_INTERVAL) => {}
            }

            let targets = match self.client.list_targets().await {
                Ok(targets) => targets,
                Err(err) => {
                    debug!(error = %err, "workspace poll failed");
                    continue;
                }
            };

            self.refresh_lifecycle_watchers(&targets, &mut watchers, &cancel)
                .await;

            let Some(candidate) = select_auto_target(&targets) else {
                continue;
            };
            let current = self.current_target().await;
            if current.as_ref() == Some(&candidate.id) {
                continue;
            }
            if let Err(err) = self.switch_target(candidate).await {
                error!(error = %err, "automatic target switch failed");
            }
        }

        for (_, watcher_cancel) in watchers.drain() {
            watcher_cancel.cancel();
        }
        debug!(session = %self.session, "workspace watcher stopped");
    }

    async fn refresh_lifecycle_watchers(
        self: &Arc<Self>,
        targets: &[TargetDescriptor],
        watchers: &mut HashMap<TargetId, CancellationToken>,
        parent: &CancellationToken,
    ) {
        let live: HashMap<&TargetId, &TargetDescriptor> = targets
            .iter()
            .filter(|t| t.kind == "page" && t.is_user_page())
            .map(|t| (&t.id, t))
            .collect();

        watchers.retain(|id, watcher_cancel| {
            if live.contains_key(id) {
                true
            } else {
                watcher_cancel.cancel();
                false
            }
        });

        for (id, descriptor) in live {
            if watchers.contains_key(id) {
                continue;
            }
            let watcher_cancel = parent.child_token();
            match self.spawn_lifecycle_watcher(descriptor, watcher_cancel.clone()).await {
                Ok(()) => {
                    watchers.insert(id.clone(), watcher_cancel);
                }
                Err(err) => {
                    debug!(target = %id, error = %err, "lifecycle watcher setup failed");
                }
            }
        }
    }

    async fn spawn_lifecycle_watcher(
        self: &Arc<Self>,
        descriptor: &TargetDescriptor,
        cancel: CancellationToken,
    ) -> EngineResult<()> {
        let conn = self.client.dial(descriptor, cancel.clone()).await?;
        let mut rx = conn.lifecycle_events().await?;
        let manager = self.clone();
        let id = descriptor.id.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = rx.recv() => match event {
                        Some(event) if event.is_visible() => {
                            manager.on_target_visible(&id).await;
                        }
                        Some(_) => {}
                        None => break,
                    },
                }
            }
            conn.close().await;
        });
        Ok(())
    }

    async fn on_target_visible(self: &Arc<Self>, id: &TargetId) {
        {
            let state = self.state.lock().await;
            if state.mode != AttachMode::AutoFollow {
                return;
            }
            if let Some(binding) = &state.binding {
                if binding.target.id == *id {
                    return;
                }
            }
        }
        debug!(target = %id, "target became visible");
        let descriptor = match self.client.list_targets().await {
            Ok(targets) => targets.into_iter().find(|t| t.id == *id),
            Err(err) => {
                debug!(error = %err, "target lookup after visibility failed");
                return;
            }
        };
        let Some(descriptor) = descriptor else { return };
        if let Err(err) = self.switch_target(descriptor).await {
            error!(target = %id, error = %err, "visibility-driven target switch failed");
        }
    }

    async fn switch_target(self: &Arc<Self>, descriptor: TargetDescriptor) -> EngineResult<()> {
        let enabled = self.state.lock().await.enabled;
        info!(target = %descriptor.id, url = %descriptor.url, "auto-following target");
        self.bind(descriptor).await?;
        if enabled {
            self.enable().await?;
        }
        Ok(())
    }
}

/// Prefer the most recently listed HTTP(S) page; fall back to the first
/// listed target.
fn select_auto_target(targets: &[TargetDescriptor]) -> Option<TargetDescriptor> {
    targets
        .iter()
        .rev()
        .find(|t| t.kind == "page" && t.is_user_page())
        .or_else(|| targets.first())
        .cloned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target(id: &str, kind: &str, url: &str) -> TargetDescriptor {
        TargetDescriptor {
            id: TargetId::new(id),
            kind: kind.to_string(),
            url: url.to_string(),
            title: String::new(),
            websocket_url: String::new(),
        }
    }

    #[test]
    fn test_select_auto_target_prefers_latest_user_page() {
        let targets = vec![
            target("a", "page", "https://a.test/"),
            target("b", "iframe", "https://b.test/"),
            target("c", "page", "https://c.test/"),
            target("d", "page", "devtools://inspector"),
        ];
        let selected = select_auto_target(&targets).unwrap();
        assert_eq!(selected.id.as_str(), "c");
    }

    #[test]
    fn test_select_auto_target_falls_back_to_first() {
        let targets = vec![target("only", "service_worker", "chrome://x")];
        assert_eq!(select_auto_target(&targets).unwrap().id.as_str(), "only");
        assert!(select_auto_target(&[]).is_none());
    }
}
