//! Refract Rules - Matching & Mutation Model
//!
//! The rule-set data model (serde, rule JSON v1.0), the compiled rule
//! engine with atomic hot-swap and hit statistics, the predicate matcher,
//! and the body mutation operators (RFC-6902 JSON Patch, regex text
//! replace, base64 replace).
//!
//! ## Core Concepts
//!
//! - **RuleSet**: an ordered, versioned list of rules, replaced atomically
//!   via [`RuleEngine::load`].
//! - **Rule**: predicate tree + action list, evaluated per stage in
//!   declaration order; `short_circuit` rules terminate enumeration.
//! - **BodyPatch**: one of `json_patch`, `text_regex` or `base64`, applied
//!   textually so aggregated rules see each other's output.

pub mod body;
pub mod engine;
pub mod error;
pub mod jsonptr;
pub mod matcher;
pub mod spec;

// Re-exports
pub use body::apply_body_patch;
pub use engine::{EvalContext, RuleEngine};
pub use error::{RuleError, RuleResult};
pub use spec::{
    Action, BlockAction, BodyPatch, Condition, FailAction, Match, PatchOp, PatchOpKind,
    PauseAction, PauseFallback, PauseFallbackKind, RespondAction, Rewrite, RewriteAction, Rule,
    RuleMode, RuleSet, SizeOp, UrlMatchMode, ValueOp,
};
