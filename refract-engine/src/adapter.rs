//! Debug-protocol capability interface.
//!
//! The engine only ever talks to the browser through these traits; the
//! concrete DevTools implementation lives in [`crate::cdp`] and tests
//! drive the engine with an in-memory mock. Streams are finite: they
//! close on connection error or cancellation.

use async_trait::async_trait;
use refract_common::{LifecycleEvent, PausedEvent, Stage, TargetDescriptor};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use std::sync::Arc;

/// URL pattern requesting interception of all traffic.
pub const PATTERN_ALL: &str = "*";

/// Errors raised at the adapter boundary.
#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("browser endpoint unreachable: {0}")]
    Endpoint(String),

    #[error("target not found: {0}")]
    TargetNotFound(String),

    #[error("connection closed")]
    Closed,

    #[error("protocol error: {0}")]
    Protocol(String),
}

/// Overrides for `continueRequest`. Header entries replace the request's
/// full header list when present.
#[derive(Debug, Clone, Default)]
pub struct ContinueRequestOverrides {
    pub url: Option<String>,
    pub method: Option<String>,
    pub headers: Option<Vec<(String, String)>>,
    pub post_data: Option<Vec<u8>>,
}

impl ContinueRequestOverrides {
    pub fn is_empty(&self) -> bool {
        self.url.is_none()
            && self.method.is_none()
            && self.headers.is_none()
            && self.post_data.is_none()
    }
}

/// Overrides for `continueResponse`.
#[derive(Debug, Clone, Default)]
pub struct ContinueResponseOverrides {
    pub status: Option<u16>,
    pub headers: Option<Vec<(String, String)>>,
}

impl ContinueResponseOverrides {
    pub fn is_empty(&self) -> bool {
        self.status.is_none() && self.headers.is_none()
    }
}

/// Complete synthetic response for `fulfillRequest`.
#[derive(Debug, Clone)]
pub struct FulfillResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

/// Error reason reported to the browser by `failRequest`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureReason {
    Failed,
    Aborted,
    TimedOut,
    AccessDenied,
    BlockedByClient,
}

impl FailureReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureReason::Failed => "Failed",
            FailureReason::Aborted => "Aborted",
            FailureReason::TimedOut => "TimedOut",
            FailureReason::AccessDenied => "AccessDenied",
            FailureReason::BlockedByClient => "BlockedByClient",
        }
    }
}

/// Entry point to a browser debugging endpoint: target discovery plus
/// per-target attachment.
#[async_trait]
pub trait DebugClient: Send + Sync {
    /// Enumerate the browser's current targets.
    async fn list_targets(&self) -> Result<Vec<TargetDescriptor>, AdapterError>;

    /// Open a cancellation-aware connection to one target.
    async fn dial(
        &self,
        target: &TargetDescriptor,
        cancel: CancellationToken,
    ) -> Result<Arc<dyn TargetConn>, AdapterError>;
}

/// One attached target. Every method honours the cancellation token the
/// connection was dialed with.
#[async_trait]
pub trait TargetConn: Send + Sync {
    async fn enable_network(&self) -> Result<(), AdapterError>;

    /// Request pausing for `url_pattern` at the given stages.
    async fn enable_fetch(&self, url_pattern: &str, stages: &[Stage]) -> Result<(), AdapterError>;

    async fn disable_fetch(&self) -> Result<(), AdapterError>;

    /// Stream of paused transactions. Finite; closes on error or cancel.
    /// The engine subscribes exactly one reader per connection.
    async fn paused_events(&self) -> Result<mpsc::Receiver<PausedEvent>, AdapterError>;

    /// Stream of page lifecycle notifications (at least `visible`).
    async fn lifecycle_events(&self) -> Result<mpsc::Receiver<LifecycleEvent>, AdapterError>;

    async fn continue_request(
        &self,
        request_id: &str,
        overrides: ContinueRequestOverrides,
    ) -> Result<(), AdapterError>;

    async fn continue_response(
        &self,
        request_id: &str,
        overrides: ContinueResponseOverrides,
    ) -> Result<(), AdapterError>;

    async fn fulfill_request(
        &self,
        request_id: &str,
        response: FulfillResponse,
    ) -> Result<(), AdapterError>;

    async fn fail_request(
        &self,
        request_id: &str,
        reason: FailureReason,
    ) -> Result<(), AdapterError>;

    /// Fetch the paused response body (response stage only).
    async fn get_response_body(&self, request_id: &str) -> Result<Vec<u8>, AdapterError>;

    /// Tear the connection down; idempotent.
    async fn close(&self);
}
