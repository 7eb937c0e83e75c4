//! Refract Engine - Browser-Attached Traffic Interception
//!
//! Attaches to a running Chromium-family browser through its debugging
//! endpoint, pauses requests and responses of the bound page, evaluates
//! them against the active rule set, applies mutations or terminating
//! actions, and emits a structured event for every transaction.
//!
//! ## Core Concepts
//!
//! - **Session**: one interception context owning a debug connection, a
//!   rule engine, a pause coordinator and a worker pool.
//! - **Capability adapter**: the engine depends only on the
//!   [`adapter::DebugClient`]/[`adapter::TargetConn`] traits; the
//!   DevTools implementation lives in [`cdp`].
//! - **Termination guarantee**: every paused transaction receives exactly
//!   one terminating call (`continueRequest`, `continueResponse`,
//!   `fulfillRequest` or `failRequest`) on every code path, including
//!   overload, timeout and handler panic.
//!
//! ## Example
//!
//! ```rust,ignore
//! use refract_engine::InterceptService;
//! use refract_common::SessionConfig;
//!
//! let service = InterceptService::new();
//! let session = service.start_session(SessionConfig::default());
//! service.attach_target(&session, None).await?;   // auto-follow
//! service.enable_interception(&session).await?;
//! ```

pub mod adapter;
pub mod cdp;
pub mod error;
pub mod executor;
pub mod handler;
pub mod logging;
pub mod manager;
pub mod pause;
pub mod pool;
pub mod service;
pub mod session;

// Re-exports
pub use adapter::{DebugClient, TargetConn};
pub use error::{EngineError, EngineResult};
pub use executor::{ActionExecutor, RequestMutation, ResponseMutation, Sentinel};
pub use handler::{EventHandler, EventSink, Termination};
pub use logging::{init_logging, LoggingConfig};
pub use manager::{AttachMode, InterceptionManager};
pub use pause::{PauseCoordinator, PauseDecision};
pub use pool::WorkerPool;
pub use service::InterceptService;
pub use session::{Session, SessionRegistry};
