//! Refract Common - Shared Domain Types
//!
//! Protocol-independent types shared by every Refract crate: typed
//! identifiers, the neutral request/response model, session configuration
//! and the observability event model. Nothing in here knows about the
//! DevTools protocol; the adapter layer in `refract-engine` converts wire
//! events into these types at the boundary.

pub mod config;
pub mod events;
pub mod ids;
pub mod traffic;

// Re-exports
pub use config::SessionConfig;
pub use events::{
    EngineStats, EventKind, FinalResult, NetworkEvent, PendingItem, PoolStats, RuleMatchSummary,
};
pub use ids::{RuleId, SessionId, TargetId};
pub use traffic::{
    Header, LifecycleEvent, PausedEvent, Request, Response, Stage, TargetDescriptor, TargetInfo,
};
