//! Rule validation errors.

use thiserror::Error;

/// Raised while compiling a rule set. Any failure leaves the previously
/// active set untouched.
#[derive(Debug, Error)]
pub enum RuleError {
    #[error("unsupported rule set version: {0}")]
    UnsupportedVersion(String),

    #[error("rule {rule}: invalid regex `{pattern}`: {source}")]
    InvalidRegex {
        rule: String,
        pattern: String,
        #[source]
        source: Box<regex::Error>,
    },

    #[error("rule {rule}: invalid condition: {reason}")]
    InvalidCondition { rule: String, reason: String },

    #[error("rule {rule}: invalid action: {reason}")]
    InvalidAction { rule: String, reason: String },

    #[error("duplicate rule id: {0}")]
    DuplicateRuleId(String),
}

/// Result type alias for rule operations.
pub type RuleResult<T> = Result<T, RuleError>;
