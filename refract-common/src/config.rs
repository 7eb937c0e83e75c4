//! Session configuration.

use serde::{Deserialize, Serialize};

/// Default browser debugging endpoint.
pub const DEFAULT_DEVTOOLS_URL: &str = "http://127.0.0.1:9222";
/// Largest response body fetched for matching or rewriting, in bytes.
pub const DEFAULT_BODY_SIZE_THRESHOLD: u64 = 4 * 1024 * 1024;
/// Default capacity of the human-review pending queue.
pub const DEFAULT_PENDING_CAPACITY: usize = 64;
/// Default per-event processing budget in milliseconds.
pub const DEFAULT_PROCESS_TIMEOUT_MS: u64 = 3000;

/// Per-session tuning knobs. All fields have serde defaults so partial
/// JSON from the control plane deserializes into a usable configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SessionConfig {
    /// Browser debugging endpoint (HTTP, not the websocket URL).
    #[serde(rename = "devToolsURL")]
    pub dev_tools_url: String,
    /// Handler worker count; 0 means one task per event, unbounded.
    pub concurrency: usize,
    /// Max body size fetched for matching/rewrite.
    pub body_size_threshold: u64,
    /// Pause queue size before new pauses degrade to their default action.
    pub pending_capacity: usize,
    /// Per-event budget; exceeding it degrades to a plain continue.
    #[serde(rename = "processTimeoutMS")]
    pub process_timeout_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            dev_tools_url: DEFAULT_DEVTOOLS_URL.to_string(),
            concurrency: 0,
            body_size_threshold: DEFAULT_BODY_SIZE_THRESHOLD,
            pending_capacity: DEFAULT_PENDING_CAPACITY,
            process_timeout_ms: DEFAULT_PROCESS_TIMEOUT_MS,
        }
    }
}

impl SessionConfig {
    /// Effective body threshold; zero falls back to the default.
    pub fn effective_body_threshold(&self) -> u64 {
        if self.body_size_threshold == 0 {
            DEFAULT_BODY_SIZE_THRESHOLD
        } else {
            self.body_size_threshold
        }
    }

    /// Effective per-event budget; zero falls back to the default.
    pub fn effective_process_timeout_ms(&self) -> u64 {
        if self.process_timeout_ms == 0 {
            DEFAULT_PROCESS_TIMEOUT_MS
        } else {
            self.process_timeout_ms
        }
    }

    /// Effective pending queue capacity; zero falls back to the default.
    pub fn effective_pending_capacity(&self) -> usize {
        if self.pending_capacity == 0 {
            DEFAULT_PENDING_CAPACITY
        } else {
            self.pending_capacity
        }
    }
}
