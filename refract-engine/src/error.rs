//! Engine error types.

use refract_common::SessionId;
use thiserror::Error;

/// Main error type for engine operations. Setup failures surface
/// synchronously from the service calls that caused them; per-event
/// failures never surface here, they degrade to a neutral continue.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("session not found: {0}")]
    SessionNotFound(SessionId),

    #[error("no attachable browser target")]
    NoTarget,

    #[error("session is not attached to a target")]
    NotAttached,

    #[error("stream already subscribed")]
    AlreadySubscribed,

    #[error(transparent)]
    Adapter(#[from] crate::adapter::AdapterError),

    #[error(transparent)]
    Rules(#[from] refract_rules::RuleError),
}

/// Result type alias for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;
