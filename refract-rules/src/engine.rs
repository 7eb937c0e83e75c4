//! Compiled rule engine.
//!
//! [`RuleEngine::load`] validates and normalises a [`RuleSet`] and swaps
//! it in atomically; evaluation runs lock-light against an immutable
//! snapshot, so concurrent evaluations always observe one consistent
//! rule-set version.

use crate::error::{RuleError, RuleResult};
use crate::matcher;
use crate::spec::{
    Action, BodyPatch, Condition, PatchOpKind, PauseFallbackKind, Rule, RuleMode, RuleSet,
};
use dashmap::DashMap;
use parking_lot::RwLock;
use refract_common::{EngineStats, RuleId, Stage};
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::info;

/// Evaluation input built by the handler from a paused event. Header,
/// query and cookie maps are lower-keyed.
#[derive(Debug, Clone, Default)]
pub struct EvalContext {
    pub url: String,
    pub method: String,
    pub resource_type: String,
    pub stage: Stage,
    pub headers: BTreeMap<String, String>,
    pub query: BTreeMap<String, String>,
    pub cookies: BTreeMap<String, String>,
    pub body: String,
    pub content_type: String,
}

/// A validated, normalised rule set. Rules are stably ordered by
/// descending priority; ties keep declaration order, so with the default
/// priority evaluation is pure declaration order.
#[derive(Debug, Default)]
pub struct CompiledRuleSet {
    pub version: String,
    pub rules: Vec<Arc<Rule>>,
}

/// Concurrent-read rule engine with hit statistics.
pub struct RuleEngine {
    active: RwLock<Arc<CompiledRuleSet>>,
    total: AtomicU64,
    matched: AtomicU64,
    by_rule: DashMap<RuleId, u64>,
}

impl Default for RuleEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl RuleEngine {
    /// An engine with an empty rule set; nothing matches until `load`.
    pub fn new() -> Self {
        Self {
            active: RwLock::new(Arc::new(CompiledRuleSet::default())),
            total: AtomicU64::new(0),
            matched: AtomicU64::new(0),
            by_rule: DashMap::new(),
        }
    }

    /// Validate, normalise and atomically activate a rule set. On any
    /// validation failure the previously active set stays in place.
    pub fn load(&self, rs: RuleSet) -> RuleResult<()> {
        let compiled = compile(rs)?;
        let count = compiled.rules.len();
        let version = compiled.version.clone();
        *self.active.write() = Arc::new(compiled);
        info!(rules = count, version = %version, "rule set activated");
        Ok(())
    }

    /// Current rule-set snapshot.
    pub fn snapshot(&self) -> Arc<CompiledRuleSet> {
        self.active.read().clone()
    }

    /// Evaluate all rules for one stage. Returns matches in evaluation
    /// order; a matching `short_circuit` rule terminates enumeration.
    pub fn eval_for_stage(&self, ctx: &EvalContext, stage: Stage) -> Vec<Arc<Rule>> {
        let snapshot = self.snapshot();
        self.total.fetch_add(1, Ordering::Relaxed);

        let mut matches = Vec::new();
        for rule in &snapshot.rules {
            if rule.stage.is_some_and(|s| s != stage) {
                continue;
            }
            if !matcher::match_rule(ctx, &rule.matcher) {
                continue;
            }
            *self.by_rule.entry(rule.id.clone()).or_insert(0) += 1;
            let short_circuit = rule.mode == RuleMode::ShortCircuit;
            matches.push(rule.clone());
            if short_circuit {
                break;
            }
        }

        if !matches.is_empty() {
            self.matched.fetch_add(1, Ordering::Relaxed);
        }
        matches
    }

    /// Hit counters since engine creation.
    pub fn stats(&self) -> EngineStats {
        EngineStats {
            total: self.total.load(Ordering::Relaxed),
            matched: self.matched.load(Ordering::Relaxed),
            by_rule: self
                .by_rule
                .iter()
                .map(|entry| (entry.key().clone(), *entry.value()))
                .collect(),
        }
    }
}

/// Validate and normalise a rule set.
fn compile(rs: RuleSet) -> RuleResult<CompiledRuleSet> {
    if !rs.version.starts_with("1.") {
        return Err(RuleError::UnsupportedVersion(rs.version));
    }

    let mut seen = HashSet::new();
    let mut rules = Vec::with_capacity(rs.rules.len());
    for mut rule in rs.rules {
        if rule.id.is_empty() {
            return Err(RuleError::InvalidCondition {
                rule: "<unnamed>".into(),
                reason: "rule id must not be empty".into(),
            });
        }
        if !seen.insert(rule.id.clone()) {
            return Err(RuleError::DuplicateRuleId(rule.id.to_string()));
        }
        normalize_rule(&mut rule)?;
        validate_actions(&rule)?;
        rules.push(Arc::new(rule));
    }

    // Stable by-priority sort keeps declaration order among equals.
    rules.sort_by_key(|r| std::cmp::Reverse(r.priority));

    Ok(CompiledRuleSet {
        version: rs.version,
        rules,
    })
}

fn normalize_rule(rule: &mut Rule) -> RuleResult<()> {
    let id = rule.id.to_string();
    for cond in rule
        .matcher
        .all_of
        .iter_mut()
        .chain(rule.matcher.any_of.iter_mut())
        .chain(rule.matcher.none_of.iter_mut())
    {
        normalize_condition(&id, cond)?;
    }
    Ok(())
}

fn normalize_condition(rule: &str, cond: &mut Condition) -> RuleResult<()> {
    let check_regex = |pattern: &str| -> RuleResult<()> {
        matcher::compile_regex(pattern).map_err(|err| RuleError::InvalidRegex {
            rule: rule.to_string(),
            pattern: pattern.to_string(),
            source: Box::new(err),
        })
    };

    match cond {
        Condition::Url { mode, pattern } => {
            if *mode == crate::spec::UrlMatchMode::Regex {
                check_regex(pattern)?;
            }
        }
        Condition::Header { key, op, value }
        | Condition::Query { key, op, value }
        | Condition::Cookie { key, op, value } => {
            *key = key.to_ascii_lowercase();
            if *op == crate::spec::ValueOp::Regex {
                check_regex(value)?;
            }
        }
        Condition::Text { op, value } | Condition::JsonPointer { op, value, .. } => {
            if *op == crate::spec::ValueOp::Regex {
                check_regex(value)?;
            }
        }
        Condition::Probability { rate } => {
            if !(0.0..=1.0).contains(rate) {
                return Err(RuleError::InvalidCondition {
                    rule: rule.to_string(),
                    reason: format!("probability rate {} outside [0, 1]", rate),
                });
            }
        }
        Condition::TimeWindow { start, end } => {
            if matcher::parse_hhmm(start).is_none() || matcher::parse_hhmm(end).is_none() {
                return Err(RuleError::InvalidCondition {
                    rule: rule.to_string(),
                    reason: format!("time window {}..{} is not HH:MM", start, end),
                });
            }
        }
        _ => {}
    }

    if let Condition::JsonPointer { pointer, .. } = cond {
        if !pointer.starts_with('/') {
            return Err(RuleError::InvalidCondition {
                rule: rule.to_string(),
                reason: format!("json pointer `{}` must start with '/'", pointer),
            });
        }
    }
    Ok(())
}

fn validate_actions(rule: &Rule) -> RuleResult<()> {
    let id = rule.id.to_string();
    let invalid = |reason: String| RuleError::InvalidAction {
        rule: id.clone(),
        reason,
    };

    for action in &rule.actions {
        if !(0.0..=1.0).contains(&action.drop_rate()) {
            return Err(invalid(format!(
                "drop rate {} outside [0, 1]",
                action.drop_rate()
            )));
        }
        match action {
            Action::Rewrite(a) => {
                if let Some(BodyPatch::TextRegex { pattern, .. }) = &a.rewrite.body {
                    matcher::compile_regex(pattern).map_err(|err| RuleError::InvalidRegex {
                        rule: id.clone(),
                        pattern: pattern.clone(),
                        source: Box::new(err),
                    })?;
                }
                if let Some(BodyPatch::JsonPatch(ops)) = &a.rewrite.body {
                    for op in ops {
                        if crate::jsonptr::parse_pointer(&op.path).is_none() {
                            return Err(invalid(format!("invalid patch path `{}`", op.path)));
                        }
                        let needs_from =
                            matches!(op.op, PatchOpKind::Copy | PatchOpKind::Move);
                        if needs_from && crate::jsonptr::parse_pointer(&op.from).is_none() {
                            return Err(invalid(format!("invalid patch from `{}`", op.from)));
                        }
                    }
                }
            }
            Action::Respond(a) => {
                if !(100..=599).contains(&a.status) {
                    return Err(invalid(format!("respond status {} out of range", a.status)));
                }
            }
            Action::Pause(a) => {
                if a.default_action.kind == PauseFallbackKind::Fulfill
                    && a.default_action.status == 0
                {
                    return Err(invalid("fulfill default action requires a status".into()));
                }
            }
            Action::Fail(_) | Action::Block(_) => {}
        }
    }
    Ok(())
}
