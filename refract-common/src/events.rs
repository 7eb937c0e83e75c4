//! Observability event model.
//!
//! Every intercepted transaction emits one or more `NetworkEvent`s to a
//! drop-on-full channel drained by the front-end. Emission must never
//! back-pressure interception.

use crate::ids::{RuleId, SessionId, TargetId};
use crate::traffic::{Request, Response, Stage};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Event type tag carried on every `NetworkEvent`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Intercepted,
    Mutated,
    Fulfilled,
    Failed,
    Blocked,
    Degraded,
    Pending,
    Approved,
    Rejected,
    Timeout,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Intercepted => "intercepted",
            EventKind::Mutated => "mutated",
            EventKind::Fulfilled => "fulfilled",
            EventKind::Failed => "failed",
            EventKind::Blocked => "blocked",
            EventKind::Degraded => "degraded",
            EventKind::Pending => "pending",
            EventKind::Approved => "approved",
            EventKind::Rejected => "rejected",
            EventKind::Timeout => "timeout",
        }
    }
}

/// How a paused transaction was ultimately answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FinalResult {
    Passed,
    Modified,
    Blocked,
    Fulfilled,
    Failed,
    Paused,
}

impl FinalResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            FinalResult::Passed => "passed",
            FinalResult::Modified => "modified",
            FinalResult::Blocked => "blocked",
            FinalResult::Fulfilled => "fulfilled",
            FinalResult::Failed => "failed",
            FinalResult::Paused => "paused",
        }
    }
}

/// Per-rule summary attached to matched events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleMatchSummary {
    pub rule_id: RuleId,
    #[serde(default)]
    pub rule_name: String,
    #[serde(default)]
    pub action_types: Vec<String>,
}

/// One observability record. Lightweight progress events (`intercepted`,
/// `degraded`, `pending`, ...) carry only the transaction coordinates;
/// terminal records additionally carry original and modified snapshots.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkEvent {
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub timestamp_ms: i64,
    #[serde(default)]
    pub session: SessionId,
    #[serde(default)]
    pub target: TargetId,
    #[serde(default)]
    pub stage: Option<Stage>,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub method: String,
    #[serde(default)]
    pub status: Option<u16>,
    #[serde(default)]
    pub rule: Option<RuleId>,
    #[serde(default)]
    pub is_matched: bool,
    #[serde(default)]
    pub final_result: Option<FinalResult>,
    #[serde(default)]
    pub request: Option<Request>,
    #[serde(default)]
    pub modified_request: Option<Request>,
    #[serde(default)]
    pub response: Option<Response>,
    #[serde(default)]
    pub modified_response: Option<Response>,
    #[serde(default)]
    pub matched_rules: Vec<RuleMatchSummary>,
}

impl NetworkEvent {
    /// A bare event of the given kind, stamped with the current time.
    pub fn new(kind: EventKind) -> Self {
        Self {
            kind,
            timestamp_ms: chrono::Utc::now().timestamp_millis(),
            session: SessionId::default(),
            target: TargetId::default(),
            stage: None,
            url: String::new(),
            method: String::new(),
            status: None,
            rule: None,
            is_matched: false,
            final_result: None,
            request: None,
            modified_request: None,
            response: None,
            modified_response: None,
            matched_rules: Vec::new(),
        }
    }
}

/// A transaction parked for human review.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingItem {
    pub id: String,
    pub stage: Stage,
    pub url: String,
    pub method: String,
    #[serde(default)]
    pub target: TargetId,
    #[serde(default)]
    pub rule: Option<RuleId>,
}

/// Rule-engine hit counters.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineStats {
    /// Evaluations performed.
    pub total: u64,
    /// Evaluations that matched at least one rule.
    pub matched: u64,
    /// Per-rule hit counts.
    #[serde(default)]
    pub by_rule: HashMap<RuleId, u64>,
}

/// Worker-pool counters as reported by the periodic monitor.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct PoolStats {
    pub queue_len: usize,
    pub queue_cap: usize,
    pub submitted: u64,
    pub dropped: u64,
}

impl PoolStats {
    pub fn drop_rate(&self) -> f64 {
        if self.submitted == 0 {
            0.0
        } else {
            self.dropped as f64 / self.submitted as f64
        }
    }

    pub fn usage(&self) -> f64 {
        if self.queue_cap == 0 {
            0.0
        } else {
            self.queue_len as f64 / self.queue_cap as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_kind_serde() {
        let json = serde_json::to_string(&EventKind::Degraded).unwrap();
        assert_eq!(json, "\"degraded\"");
    }

    #[test]
    fn test_network_event_tag_field() {
        let ev = NetworkEvent::new(EventKind::Intercepted);
        let value = serde_json::to_value(&ev).unwrap();
        assert_eq!(value["type"], "intercepted");
        assert!(value["timestamp_ms"].as_i64().unwrap() > 0);
    }

    #[test]
    fn test_pool_stats_rates() {
        let stats = PoolStats {
            queue_len: 1,
            queue_cap: 4,
            submitted: 10,
            dropped: 2,
        };
        assert!((stats.drop_rate() - 0.2).abs() < f64::EPSILON);
        assert!((stats.usage() - 0.25).abs() < f64::EPSILON);
        assert_eq!(PoolStats::default().drop_rate(), 0.0);
    }
}
