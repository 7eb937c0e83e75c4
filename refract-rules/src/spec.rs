//! Rule-set data model (rule JSON format v1.0).
//!
//! Deserialized straight from the control plane; validation and
//! normalisation happen in [`crate::engine`] at compile time.

use refract_common::{RuleId, Stage};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A versioned, ordered list of rules.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuleSet {
    pub version: String,
    #[serde(default)]
    pub rules: Vec<Rule>,
}

/// Enumeration behaviour when a rule matches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleMode {
    /// Stop enumerating further rules on match.
    ShortCircuit,
    /// Keep enumerating; mutations merge in declaration order.
    #[default]
    Aggregate,
}

/// A single rule: predicate tree plus an ordered action list.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Rule {
    pub id: RuleId,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub mode: RuleMode,
    /// When set, the rule only applies to this stage.
    #[serde(default)]
    pub stage: Option<Stage>,
    #[serde(default, rename = "match")]
    pub matcher: Match,
    #[serde(default)]
    pub actions: Vec<Action>,
}

/// Predicate composition: `allOf ∧ anyOf ∧ ¬anyOf(noneOf)`.
/// An empty group is true.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Match {
    #[serde(default)]
    pub all_of: Vec<Condition>,
    #[serde(default)]
    pub any_of: Vec<Condition>,
    #[serde(default)]
    pub none_of: Vec<Condition>,
}

impl Match {
    pub fn is_empty(&self) -> bool {
        self.all_of.is_empty() && self.any_of.is_empty() && self.none_of.is_empty()
    }
}

/// URL matching mode for the `url` condition.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UrlMatchMode {
    Prefix,
    Regex,
    Exact,
    #[default]
    Glob,
}

/// Comparison operator for string-valued conditions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueOp {
    #[default]
    Equals,
    Contains,
    Regex,
}

/// Comparison operator for the body-size condition.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SizeOp {
    #[default]
    Eq,
    Lt,
    Le,
    Gt,
    Ge,
}

/// Leaf predicate. Header/query/cookie keys are lowercased at compile
/// time; a missing key is false under every operator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Condition {
    Url {
        #[serde(default)]
        mode: UrlMatchMode,
        pattern: String,
    },
    Method {
        values: Vec<String>,
    },
    ResourceType {
        values: Vec<String>,
    },
    Header {
        key: String,
        #[serde(default)]
        op: ValueOp,
        #[serde(default)]
        value: String,
    },
    Query {
        key: String,
        #[serde(default)]
        op: ValueOp,
        #[serde(default)]
        value: String,
    },
    Cookie {
        key: String,
        #[serde(default)]
        op: ValueOp,
        #[serde(default)]
        value: String,
    },
    Text {
        #[serde(default)]
        op: ValueOp,
        #[serde(default)]
        value: String,
    },
    JsonPointer {
        pointer: String,
        #[serde(default)]
        op: ValueOp,
        #[serde(default)]
        value: String,
    },
    Mime {
        prefix: String,
    },
    Size {
        #[serde(default)]
        op: SizeOp,
        value: u64,
    },
    Stage {
        value: Stage,
    },
    /// Bernoulli sample: true with probability `rate`.
    Probability {
        rate: f64,
    },
    /// Local wall-clock window `start..end` (HH:MM); `end < start` wraps
    /// past midnight.
    TimeWindow {
        start: String,
        end: String,
    },
}

/// Executable effect of a matched rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Action {
    Rewrite(RewriteAction),
    Respond(RespondAction),
    Fail(FailAction),
    Block(BlockAction),
    Pause(PauseAction),
}

impl Action {
    pub fn type_name(&self) -> &'static str {
        match self {
            Action::Rewrite(_) => "rewrite",
            Action::Respond(_) => "respond",
            Action::Fail(_) => "fail",
            Action::Block(_) => "block",
            Action::Pause(_) => "pause",
        }
    }

    /// Sleep applied before the terminating call, bounded by the
    /// per-event budget.
    pub fn delay_ms(&self) -> u64 {
        match self {
            Action::Rewrite(a) => a.delay_ms,
            Action::Respond(a) => a.delay_ms,
            Action::Fail(a) => a.delay_ms,
            Action::Block(a) => a.delay_ms,
            Action::Pause(a) => a.delay_ms,
        }
    }

    /// Probability of skipping this action's effect entirely.
    pub fn drop_rate(&self) -> f64 {
        match self {
            Action::Rewrite(a) => a.drop_rate,
            Action::Respond(a) => a.drop_rate,
            Action::Fail(a) => a.drop_rate,
            Action::Block(a) => a.drop_rate,
            Action::Pause(a) => a.drop_rate,
        }
    }
}

/// Mutation delta contributed by a `rewrite` action. `None` map values
/// remove the key. Also the payload of an external approval.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Rewrite {
    pub url: Option<String>,
    pub method: Option<String>,
    pub headers: BTreeMap<String, Option<String>>,
    pub query: BTreeMap<String, Option<String>>,
    pub cookies: BTreeMap<String, Option<String>>,
    pub body: Option<BodyPatch>,
}

impl Rewrite {
    /// True when the rewrite carries no effective change.
    pub fn is_empty(&self) -> bool {
        self.url.is_none()
            && self.method.is_none()
            && self.headers.is_empty()
            && self.query.is_empty()
            && self.cookies.is_empty()
            && self.body.is_none()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RewriteAction {
    #[serde(flatten)]
    pub rewrite: Rewrite,
    #[serde(rename = "delayMS")]
    pub delay_ms: u64,
    pub drop_rate: f64,
}

/// Terminating synthetic response. On the response stage without a body
/// this degrades to a `continueResponse` with status/header overrides.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RespondAction {
    pub status: u16,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default, rename = "delayMS")]
    pub delay_ms: u64,
    #[serde(default)]
    pub drop_rate: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct FailAction {
    pub reason: String,
    #[serde(rename = "delayMS")]
    pub delay_ms: u64,
    pub drop_rate: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct BlockAction {
    #[serde(rename = "delayMS")]
    pub delay_ms: u64,
    pub drop_rate: f64,
}

/// Hand the transaction to the pause coordinator for human review.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PauseAction {
    #[serde(default = "default_pause_timeout", rename = "timeoutMS")]
    pub timeout_ms: u64,
    #[serde(default)]
    pub default_action: PauseFallback,
    #[serde(default, rename = "delayMS")]
    pub delay_ms: u64,
    #[serde(default)]
    pub drop_rate: f64,
}

fn default_pause_timeout() -> u64 {
    3000
}

impl Default for PauseAction {
    fn default() -> Self {
        Self {
            timeout_ms: default_pause_timeout(),
            default_action: PauseFallback::default(),
            delay_ms: 0,
            drop_rate: 0.0,
        }
    }
}

/// What to do when a pause times out, is rejected, or overflows the
/// pending queue.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PauseFallback {
    #[serde(rename = "type")]
    pub kind: PauseFallbackKind,
    /// Status for `fulfill`.
    pub status: u16,
    /// Reason for `fail`.
    pub reason: String,
}

/// Unknown kinds fall back to continuing the original transaction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PauseFallbackKind {
    #[default]
    ContinueOriginal,
    ContinueMutated,
    Fulfill,
    Fail,
    #[serde(other)]
    Unknown,
}

/// Body mutation carrier: `{"json_patch": [...]}`,
/// `{"text_regex": {"pattern", "replace"}}` or `{"base64": {"value"}}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BodyPatch {
    JsonPatch(Vec<PatchOp>),
    TextRegex { pattern: String, replace: String },
    Base64 { value: String },
}

/// A single RFC-6902 operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatchOp {
    pub op: PatchOpKind,
    pub path: String,
    #[serde(default)]
    pub from: String,
    #[serde(default)]
    pub value: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PatchOpKind {
    Add,
    Remove,
    Replace,
    Copy,
    Move,
    Test,
}
