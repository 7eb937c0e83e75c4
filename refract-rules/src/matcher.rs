//! Predicate matcher: condition evaluation over an [`EvalContext`].

use crate::engine::EvalContext;
use crate::spec::{Condition, Match, SizeOp, UrlMatchMode, ValueOp};
use chrono::Timelike;
use dashmap::DashMap;
use once_cell::sync::Lazy;
use rand::Rng;
use regex::Regex;
use std::sync::Arc;
use wildmatch::WildMatch;

/// Process-wide compiled-regex cache. The only global state in the crate;
/// compilation warms it so evaluation never pays compile cost.
static REGEX_CACHE: Lazy<DashMap<String, Arc<Regex>>> = Lazy::new(DashMap::new);

/// Fetch (or compile and cache) a regex. Returns `None` for an invalid
/// pattern; compile-time validation reports these before evaluation ever
/// sees them.
pub(crate) fn cached_regex(pattern: &str) -> Option<Arc<Regex>> {
    if let Some(re) = REGEX_CACHE.get(pattern) {
        return Some(re.clone());
    }
    let re = Arc::new(Regex::new(pattern).ok()?);
    REGEX_CACHE.insert(pattern.to_string(), re.clone());
    Some(re)
}

/// Validate and warm a pattern at compile time.
pub(crate) fn compile_regex(pattern: &str) -> Result<(), regex::Error> {
    if REGEX_CACHE.contains_key(pattern) {
        return Ok(());
    }
    let re = Regex::new(pattern)?;
    REGEX_CACHE.insert(pattern.to_string(), Arc::new(re));
    Ok(())
}

/// Parse an `HH:MM` wall-clock string into minutes since midnight.
pub(crate) fn parse_hhmm(s: &str) -> Option<u32> {
    let (h, m) = s.split_once(':')?;
    let h: u32 = h.parse().ok()?;
    let m: u32 = m.parse().ok()?;
    if h > 23 || m > 59 {
        return None;
    }
    Some(h * 60 + m)
}

/// Evaluate a predicate tree. An empty group is true.
pub(crate) fn match_rule(ctx: &EvalContext, m: &Match) -> bool {
    if !m.all_of.iter().all(|c| eval_condition(ctx, c)) {
        return false;
    }
    if !m.any_of.is_empty() && !m.any_of.iter().any(|c| eval_condition(ctx, c)) {
        return false;
    }
    if m.none_of.iter().any(|c| eval_condition(ctx, c)) {
        return false;
    }
    true
}

fn compare(value: &str, op: ValueOp, expected: &str) -> bool {
    match op {
        ValueOp::Equals => value == expected,
        ValueOp::Contains => value.contains(expected),
        ValueOp::Regex => cached_regex(expected).is_some_and(|re| re.is_match(value)),
    }
}

pub(crate) fn eval_condition(ctx: &EvalContext, cond: &Condition) -> bool {
    match cond {
        Condition::Url { mode, pattern } => match mode {
            UrlMatchMode::Prefix => ctx.url.starts_with(pattern),
            UrlMatchMode::Exact => ctx.url == *pattern,
            UrlMatchMode::Regex => cached_regex(pattern).is_some_and(|re| re.is_match(&ctx.url)),
            UrlMatchMode::Glob => WildMatch::new(pattern).matches(&ctx.url),
        },
        Condition::Method { values } => values
            .iter()
            .any(|v| v.eq_ignore_ascii_case(&ctx.method)),
        Condition::ResourceType { values } => values
            .iter()
            .any(|v| v.eq_ignore_ascii_case(&ctx.resource_type)),
        Condition::Header { key, op, value } => ctx
            .headers
            .get(key)
            .is_some_and(|v| compare(v, *op, value)),
        Condition::Query { key, op, value } => ctx
            .query
            .get(key)
            .is_some_and(|v| compare(v, *op, value)),
        Condition::Cookie { key, op, value } => ctx
            .cookies
            .get(key)
            .is_some_and(|v| compare(v, *op, value)),
        Condition::Text { op, value } => {
            !ctx.body.is_empty() && compare(&ctx.body, *op, value)
        }
        Condition::JsonPointer { pointer, op, value } => {
            if ctx.body.is_empty() {
                return false;
            }
            crate::jsonptr::resolve_scalar(&ctx.body, pointer)
                .is_some_and(|v| compare(&v, *op, value))
        }
        Condition::Mime { prefix } => ctx
            .content_type
            .to_ascii_lowercase()
            .starts_with(&prefix.to_ascii_lowercase()),
        Condition::Size { op, value } => {
            let len = ctx.body.len() as u64;
            match op {
                SizeOp::Eq => len == *value,
                SizeOp::Lt => len < *value,
                SizeOp::Le => len <= *value,
                SizeOp::Gt => len > *value,
                SizeOp::Ge => len >= *value,
            }
        }
        Condition::Stage { value } => ctx.stage == *value,
        Condition::Probability { rate } => rand::thread_rng().gen::<f64>() < *rate,
        Condition::TimeWindow { start, end } => {
            let (Some(start), Some(end)) = (parse_hhmm(start), parse_hhmm(end)) else {
                return false;
            };
            let now = chrono::Local::now().time();
            let minutes = now.hour() * 60 + now.minute();
            if start < end {
                minutes >= start && minutes < end
            } else if start > end {
                minutes >= start || minutes < end
            } else {
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use refract_common::Stage;
    use std::collections::BTreeMap;

    fn ctx() -> EvalContext {
        let mut headers = BTreeMap::new();
        headers.insert("content-type".to_string(), "application/json".to_string());
        headers.insert("x-token".to_string(), "abc123".to_string());
        let mut query = BTreeMap::new();
        query.insert("page".to_string(), "2".to_string());
        let mut cookies = BTreeMap::new();
        cookies.insert("sid".to_string(), "deadbeef".to_string());
        EvalContext {
            url: "https://a.test/api/items?page=2".to_string(),
            method: "POST".to_string(),
            resource_type: "XHR".to_string(),
            stage: Stage::Request,
            headers,
            query,
            cookies,
            body: r#"{"user":{"id":7}}"#.to_string(),
            content_type: "application/json".to_string(),
        }
    }

    #[test]
    fn test_url_modes() {
        let c = ctx();
        assert!(eval_condition(
            &c,
            &Condition::Url {
                mode: UrlMatchMode::Prefix,
                pattern: "https://a.test".into()
            }
        ));
        assert!(eval_condition(
            &c,
            &Condition::Url {
                mode: UrlMatchMode::Glob,
                pattern: "https://*.test/api/*".into()
            }
        ));
        assert!(eval_condition(
            &c,
            &Condition::Url {
                mode: UrlMatchMode::Regex,
                pattern: r"/api/items\?page=\d+$".into()
            }
        ));
        assert!(!eval_condition(
            &c,
            &Condition::Url {
                mode: UrlMatchMode::Exact,
                pattern: "https://a.test/api/items".into()
            }
        ));
    }

    #[test]
    fn test_method_membership_case_insensitive() {
        let c = ctx();
        assert!(eval_condition(
            &c,
            &Condition::Method {
                values: vec!["get".into(), "post".into()]
            }
        ));
        assert!(!eval_condition(
            &c,
            &Condition::Method {
                values: vec!["DELETE".into()]
            }
        ));
    }

    #[test]
    fn test_header_ops_and_missing_key() {
        let c = ctx();
        assert!(eval_condition(
            &c,
            &Condition::Header {
                key: "content-type".into(),
                op: ValueOp::Contains,
                value: "json".into()
            }
        ));
        assert!(eval_condition(
            &c,
            &Condition::Header {
                key: "x-token".into(),
                op: ValueOp::Regex,
                value: r"^abc\d+$".into()
            }
        ));
        // Missing key is false under every operator.
        assert!(!eval_condition(
            &c,
            &Condition::Header {
                key: "x-missing".into(),
                op: ValueOp::Contains,
                value: "".into()
            }
        ));
    }

    #[test]
    fn test_json_pointer_condition() {
        let c = ctx();
        assert!(eval_condition(
            &c,
            &Condition::JsonPointer {
                pointer: "/user/id".into(),
                op: ValueOp::Equals,
                value: "7".into()
            }
        ));
        assert!(!eval_condition(
            &c,
            &Condition::JsonPointer {
                pointer: "/user/name".into(),
                op: ValueOp::Equals,
                value: "7".into()
            }
        ));
    }

    #[test]
    fn test_text_requires_body() {
        let mut c = ctx();
        assert!(eval_condition(
            &c,
            &Condition::Text {
                op: ValueOp::Contains,
                value: "user".into()
            }
        ));
        c.body.clear();
        assert!(!eval_condition(
            &c,
            &Condition::Text {
                op: ValueOp::Contains,
                value: "".into()
            }
        ));
    }

    #[test]
    fn test_mime_and_size_and_stage() {
        let c = ctx();
        assert!(eval_condition(
            &c,
            &Condition::Mime {
                prefix: "Application/JSON".into()
            }
        ));
        assert!(eval_condition(
            &c,
            &Condition::Size {
                op: SizeOp::Gt,
                value: 4
            }
        ));
        assert!(eval_condition(
            &c,
            &Condition::Stage {
                value: Stage::Request
            }
        ));
        assert!(!eval_condition(
            &c,
            &Condition::Stage {
                value: Stage::Response
            }
        ));
    }

    #[test]
    fn test_probability_extremes() {
        let c = ctx();
        assert!(!eval_condition(&c, &Condition::Probability { rate: 0.0 }));
        assert!(eval_condition(&c, &Condition::Probability { rate: 1.1 }));
    }

    #[test]
    fn test_empty_groups_are_true() {
        let c = ctx();
        assert!(match_rule(&c, &Match::default()));
    }

    #[test]
    fn test_none_of_negates() {
        let c = ctx();
        let m = Match {
            all_of: vec![],
            any_of: vec![],
            none_of: vec![Condition::Method {
                values: vec!["POST".into()],
            }],
        };
        assert!(!match_rule(&c, &m));
    }

    #[test]
    fn test_parse_hhmm() {
        assert_eq!(parse_hhmm("00:00"), Some(0));
        assert_eq!(parse_hhmm("23:59"), Some(23 * 60 + 59));
        assert_eq!(parse_hhmm("24:00"), None);
        assert_eq!(parse_hhmm("aa:bb"), None);
        assert_eq!(parse_hhmm("1200"), None);
    }
}
