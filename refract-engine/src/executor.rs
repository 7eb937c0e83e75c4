//! Action executor.
//!
//! Translates the actions of matched rules into one merged mutation per
//! stage (plus at most one terminating sentinel), and applies the result
//! through the adapter. Apply paths always terminate the transaction:
//! adapter failures fall back to a neutral continue.

use crate::adapter::{
    ContinueRequestOverrides, ContinueResponseOverrides, FailureReason, FulfillResponse,
    TargetConn,
};
use rand::Rng;
use refract_common::{PausedEvent, RuleId, Stage};
use refract_rules::{apply_body_patch, Action, PauseAction, RespondAction, Rewrite, Rule};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Budget for fetching a paused response body.
const BODY_FETCH_TIMEOUT: Duration = Duration::from_millis(500);

/// A header write carrying the capitalization the rule author supplied.
/// Mutations key these by lowercase name for case-insensitive merging.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderOverride {
    pub name: String,
    pub value: String,
}

/// Merged request-stage delta. Scalars are last-writer-wins, maps union
/// per key, remove lists concatenate, a later body overwrites.
#[derive(Debug, Clone, Default)]
pub struct RequestMutation {
    pub url: Option<String>,
    pub method: Option<String>,
    pub headers: BTreeMap<String, HeaderOverride>,
    pub remove_headers: Vec<String>,
    pub query: BTreeMap<String, String>,
    pub remove_query: Vec<String>,
    pub cookies: BTreeMap<String, String>,
    pub remove_cookies: Vec<String>,
    pub body: Option<Vec<u8>>,
}

impl RequestMutation {
    pub fn is_empty(&self) -> bool {
        self.url.is_none()
            && self.method.is_none()
            && self.headers.is_empty()
            && self.remove_headers.is_empty()
            && self.query.is_empty()
            && self.remove_query.is_empty()
            && self.cookies.is_empty()
            && self.remove_cookies.is_empty()
            && self.body.is_none()
    }

    fn set_header(&mut self, name: &str, value: &str) {
        let key = name.to_ascii_lowercase();
        self.remove_headers.retain(|k| *k != key);
        self.headers.insert(
            key,
            HeaderOverride {
                name: name.to_string(),
                value: value.to_string(),
            },
        );
    }

    fn remove_header(&mut self, name: &str) {
        let key = name.to_ascii_lowercase();
        self.headers.remove(&key);
        self.remove_headers.push(key);
    }
}

/// Merged response-stage delta.
#[derive(Debug, Clone, Default)]
pub struct ResponseMutation {
    pub status: Option<u16>,
    pub headers: BTreeMap<String, HeaderOverride>,
    pub remove_headers: Vec<String>,
    pub body: Option<Vec<u8>>,
}

impl ResponseMutation {
    pub fn is_empty(&self) -> bool {
        self.status.is_none()
            && self.headers.is_empty()
            && self.remove_headers.is_empty()
            && self.body.is_none()
    }

    fn set_header(&mut self, name: &str, value: &str) {
        let key = name.to_ascii_lowercase();
        self.remove_headers.retain(|k| *k != key);
        self.headers.insert(
            key,
            HeaderOverride {
                name: name.to_string(),
                value: value.to_string(),
            },
        );
    }

    fn remove_header(&mut self, name: &str) {
        let key = name.to_ascii_lowercase();
        self.headers.remove(&key);
        self.remove_headers.push(key);
    }
}

/// Terminating action; the first one reached by declaration order wins
/// and stops rule processing.
#[derive(Debug, Clone)]
pub enum Sentinel {
    Block { rule: RuleId },
    Fail { rule: RuleId, reason: String },
    Respond { rule: RuleId, respond: RespondAction },
    Pause { rule: RuleId, pause: PauseAction },
}

impl Sentinel {
    pub fn rule(&self) -> &RuleId {
        match self {
            Sentinel::Block { rule }
            | Sentinel::Fail { rule, .. }
            | Sentinel::Respond { rule, .. }
            | Sentinel::Pause { rule, .. } => rule,
        }
    }
}

/// Planning output for one paused event and stage.
#[derive(Debug, Clone, Default)]
pub struct RequestPlan {
    pub mutation: RequestMutation,
    pub sentinel: Option<Sentinel>,
    pub delay_ms: u64,
    pub dropped_actions: u32,
}

#[derive(Debug, Clone, Default)]
pub struct ResponsePlan {
    pub mutation: ResponseMutation,
    pub sentinel: Option<Sentinel>,
    pub delay_ms: u64,
    pub dropped_actions: u32,
}

fn bernoulli_drop(rate: f64) -> bool {
    rate > 0.0 && rand::thread_rng().gen::<f64>() < rate
}

/// Translates matched rules into mutations and issues the terminating
/// adapter calls.
pub struct ActionExecutor {
    body_size_threshold: u64,
}

impl ActionExecutor {
    pub fn new(body_size_threshold: u64) -> Self {
        Self {
            body_size_threshold,
        }
    }

    /// Compute the merged request-stage mutation. Body patches propagate
    /// textually: each rule sees the previous rule's output.
    pub fn plan_request(&self, matched: &[Arc<Rule>], ev: &PausedEvent) -> RequestPlan {
        let mut plan = RequestPlan::default();
        let mut current_body = ev.post_data.clone().unwrap_or_default();

        'rules: for rule in matched {
            for action in &rule.actions {
                if bernoulli_drop(action.drop_rate()) {
                    plan.dropped_actions += 1;
                    continue;
                }
                plan.delay_ms += action.delay_ms();
                match action {
                    Action::Rewrite(a) => {
                        fold_request_rewrite(&mut plan.mutation, &a.rewrite, &mut current_body);
                    }
                    Action::Respond(a) => {
                        plan.sentinel = Some(Sentinel::Respond {
                            rule: rule.id.clone(),
                            respond: a.clone(),
                        });
                        break 'rules;
                    }
                    Action::Fail(a) => {
                        plan.sentinel = Some(Sentinel::Fail {
                            rule: rule.id.clone(),
                            reason: a.reason.clone(),
                        });
                        break 'rules;
                    }
                    Action::Block(_) => {
                        plan.sentinel = Some(Sentinel::Block {
                            rule: rule.id.clone(),
                        });
                        break 'rules;
                    }
                    Action::Pause(a) => {
                        plan.sentinel = Some(Sentinel::Pause {
                            rule: rule.id.clone(),
                            pause: a.clone(),
                        });
                        break 'rules;
                    }
                }
            }
        }
        plan
    }

    /// Compute the merged response-stage mutation against the (possibly
    /// empty) fetched body text.
    pub fn plan_response(
        &self,
        matched: &[Arc<Rule>],
        original_body: &str,
    ) -> ResponsePlan {
        let mut plan = ResponsePlan::default();
        let mut current_body = original_body.to_string();

        'rules: for rule in matched {
            for action in &rule.actions {
                if bernoulli_drop(action.drop_rate()) {
                    plan.dropped_actions += 1;
                    continue;
                }
                plan.delay_ms += action.delay_ms();
                match action {
                    Action::Rewrite(a) => {
                        fold_response_rewrite(&mut plan.mutation, &a.rewrite, &mut current_body);
                    }
                    Action::Respond(a) => {
                        plan.sentinel = Some(Sentinel::Respond {
                            rule: rule.id.clone(),
                            respond: a.clone(),
                        });
                        break 'rules;
                    }
                    Action::Fail(a) => {
                        plan.sentinel = Some(Sentinel::Fail {
                            rule: rule.id.clone(),
                            reason: a.reason.clone(),
                        });
                        break 'rules;
                    }
                    Action::Block(_) => {
                        plan.sentinel = Some(Sentinel::Block {
                            rule: rule.id.clone(),
                        });
                        break 'rules;
                    }
                    Action::Pause(a) => {
                        plan.sentinel = Some(Sentinel::Pause {
                            rule: rule.id.clone(),
                            pause: a.clone(),
                        });
                        break 'rules;
                    }
                }
            }
        }
        plan
    }

    /// Continue the transaction unchanged.
    pub async fn continue_plain(&self, conn: &dyn TargetConn, ev: &PausedEvent) {
        let result = match ev.stage {
            Stage::Request => {
                conn.continue_request(&ev.request_id, ContinueRequestOverrides::default())
                    .await
            }
            Stage::Response => {
                conn.continue_response(&ev.request_id, ContinueResponseOverrides::default())
                    .await
            }
        };
        if let Err(err) = result {
            warn!(request_id = %ev.request_id, error = %err, "plain continue failed");
        }
    }

    /// Apply a request mutation via `continueRequest`. Falls back to a
    /// plain continue when the adapter rejects the overrides.
    pub async fn apply_request_mutation(
        &self,
        conn: &dyn TargetConn,
        ev: &PausedEvent,
        mutation: &RequestMutation,
    ) {
        let mut overrides = ContinueRequestOverrides {
            url: mutation.url.clone(),
            method: mutation.method.clone(),
            headers: None,
            post_data: mutation.body.clone(),
        };

        if overrides.url.is_none()
            && (!mutation.query.is_empty() || !mutation.remove_query.is_empty())
        {
            overrides.url = rewrite_query(&ev.url, &mutation.query, &mutation.remove_query);
        }

        let cookie_touch = !mutation.cookies.is_empty() || !mutation.remove_cookies.is_empty();
        if !mutation.headers.is_empty() || !mutation.remove_headers.is_empty() || cookie_touch {
            let mut merged =
                merge_wire_headers(&ev.headers, &mutation.headers, &mutation.remove_headers);
            if cookie_touch {
                apply_cookie_patch(
                    &mut merged,
                    ev.request_header("cookie"),
                    &mutation.cookies,
                    &mutation.remove_cookies,
                );
            }
            overrides.headers = Some(merged);
        }

        if let Err(err) = conn.continue_request(&ev.request_id, overrides).await {
            warn!(request_id = %ev.request_id, error = %err, "request mutation rejected, continuing unmodified");
            self.continue_plain(conn, ev).await;
        }
    }

    /// Apply a response mutation: fulfill when a (fetchable) body
    /// override exists, otherwise continue with status/header overrides.
    pub async fn apply_response_mutation(
        &self,
        conn: &dyn TargetConn,
        ev: &PausedEvent,
        mutation: &ResponseMutation,
        body_available: bool,
    ) {
        if let (Some(body), true) = (&mutation.body, body_available) {
            let status = mutation
                .status
                .or(ev.response_status)
                .unwrap_or(200);
            let headers = merge_wire_headers(
                &ev.response_headers,
                &mutation.headers,
                &mutation.remove_headers,
            );
            let fulfill = FulfillResponse {
                status,
                headers,
                body: body.clone(),
            };
            if let Err(err) = conn.fulfill_request(&ev.request_id, fulfill).await {
                warn!(request_id = %ev.request_id, error = %err, "fulfill failed, continuing unmodified");
                self.continue_plain(conn, ev).await;
            }
            return;
        }

        if mutation.status.is_none()
            && mutation.headers.is_empty()
            && mutation.remove_headers.is_empty()
        {
            self.continue_plain(conn, ev).await;
            return;
        }

        let headers = if mutation.headers.is_empty() && mutation.remove_headers.is_empty() {
            None
        } else {
            Some(merge_wire_headers(
                &ev.response_headers,
                &mutation.headers,
                &mutation.remove_headers,
            ))
        };
        let overrides = ContinueResponseOverrides {
            status: mutation.status,
            headers,
        };
        if let Err(err) = conn.continue_response(&ev.request_id, overrides).await {
            warn!(request_id = %ev.request_id, error = %err, "response overrides rejected, continuing unmodified");
            self.continue_plain(conn, ev).await;
        }
    }

    /// Apply a terminating `respond` action. On the response stage with
    /// no body this becomes a `continueResponse` with overrides.
    pub async fn apply_respond(
        &self,
        conn: &dyn TargetConn,
        ev: &PausedEvent,
        respond: &RespondAction,
    ) {
        if ev.stage == Stage::Response && respond.body.is_none() {
            let headers = if respond.headers.is_empty() {
                None
            } else {
                Some(
                    respond
                        .headers
                        .iter()
                        .map(|(k, v)| (k.clone(), v.clone()))
                        .collect(),
                )
            };
            let overrides = ContinueResponseOverrides {
                status: Some(respond.status),
                headers,
            };
            if let Err(err) = conn.continue_response(&ev.request_id, overrides).await {
                warn!(request_id = %ev.request_id, error = %err, "respond overrides rejected, continuing unmodified");
                self.continue_plain(conn, ev).await;
            }
            return;
        }

        let fulfill = FulfillResponse {
            status: respond.status,
            headers: respond
                .headers
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            body: respond
                .body
                .as_ref()
                .map(|b| b.clone().into_bytes())
                .unwrap_or_default(),
        };
        if let Err(err) = conn.fulfill_request(&ev.request_id, fulfill).await {
            warn!(request_id = %ev.request_id, error = %err, "fulfill failed, continuing unmodified");
            self.continue_plain(conn, ev).await;
        }
    }

    /// Apply a terminating `fail`/`block` action.
    pub async fn apply_fail(&self, conn: &dyn TargetConn, ev: &PausedEvent) {
        if let Err(err) = conn
            .fail_request(&ev.request_id, FailureReason::Failed)
            .await
        {
            warn!(request_id = %ev.request_id, error = %err, "fail request rejected, continuing unmodified");
            self.continue_plain(conn, ev).await;
        }
    }

    /// Fetch the paused response body when the gate allows it. Returns
    /// the body text and whether a body is actually available for
    /// rewriting.
    pub async fn fetch_body_gated(
        &self,
        conn: &dyn TargetConn,
        ev: &PausedEvent,
    ) -> (String, bool) {
        let content_type = ev.response_header("content-type").unwrap_or_default();
        let content_length = ev
            .response_header("content-length")
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(0);
        if !should_fetch_body(content_type, content_length, self.body_size_threshold) {
            return (String::new(), false);
        }

        match tokio::time::timeout(
            BODY_FETCH_TIMEOUT,
            conn.get_response_body(&ev.request_id),
        )
        .await
        {
            Ok(Ok(bytes)) => (String::from_utf8_lossy(&bytes).into_owned(), true),
            Ok(Err(err)) => {
                debug!(request_id = %ev.request_id, error = %err, "response body fetch failed");
                (String::new(), false)
            }
            Err(_) => {
                debug!(request_id = %ev.request_id, "response body fetch timed out");
                (String::new(), false)
            }
        }
    }
}

/// Build the mutation a standalone rewrite (an approval) contributes.
pub fn request_mutation_from_rewrite(rw: &Rewrite, ev: &PausedEvent) -> RequestMutation {
    let mut mutation = RequestMutation::default();
    let mut current_body = ev.post_data.clone().unwrap_or_default();
    fold_request_rewrite(&mut mutation, rw, &mut current_body);
    mutation
}

/// Response-stage counterpart of [`request_mutation_from_rewrite`].
pub fn response_mutation_from_rewrite(rw: &Rewrite, original_body: &str) -> ResponseMutation {
    let mut mutation = ResponseMutation::default();
    let mut current_body = original_body.to_string();
    fold_response_rewrite(&mut mutation, rw, &mut current_body);
    mutation
}

fn fold_request_rewrite(mutation: &mut RequestMutation, rw: &Rewrite, current_body: &mut String) {
    if let Some(url) = &rw.url {
        mutation.url = Some(url.clone());
    }
    if let Some(method) = &rw.method {
        mutation.method = Some(method.clone());
    }
    for (name, value) in &rw.headers {
        match value {
            Some(value) => mutation.set_header(name, value),
            None => mutation.remove_header(name),
        }
    }
    for (key, value) in &rw.query {
        match value {
            Some(value) => {
                mutation.remove_query.retain(|k| k != key);
                mutation.query.insert(key.clone(), value.clone());
            }
            None => {
                mutation.query.remove(key);
                mutation.remove_query.push(key.clone());
            }
        }
    }
    for (name, value) in &rw.cookies {
        match value {
            Some(value) => {
                mutation.remove_cookies.retain(|k| k != name);
                mutation.cookies.insert(name.clone(), value.clone());
            }
            None => {
                mutation.cookies.remove(name);
                mutation.remove_cookies.push(name.clone());
            }
        }
    }
    if let Some(patch) = &rw.body {
        if let Some(bytes) = apply_body_patch(current_body, patch) {
            *current_body = String::from_utf8_lossy(&bytes).into_owned();
            mutation.body = Some(bytes);
        }
    }
}

fn fold_response_rewrite(
    mutation: &mut ResponseMutation,
    rw: &Rewrite,
    current_body: &mut String,
) {
    for (name, value) in &rw.headers {
        match value {
            Some(value) => mutation.set_header(name, value),
            None => mutation.remove_header(name),
        }
    }
    // Cookie writes surface as Set-Cookie on the response stage.
    for (name, value) in &rw.cookies {
        match value {
            Some(value) => mutation.set_header("Set-Cookie", &format!("{}={}", name, value)),
            None => mutation.remove_header("set-cookie"),
        }
    }
    if let Some(patch) = &rw.body {
        if let Some(bytes) = apply_body_patch(current_body, patch) {
            *current_body = String::from_utf8_lossy(&bytes).into_owned();
            mutation.body = Some(bytes);
        }
    }
}

/// Merge set/remove patches into a wire header list. Untouched entries
/// keep their position and capitalization; replaced entries adopt the
/// patch's capitalization in place; new entries append.
pub(crate) fn merge_wire_headers(
    original: &[(String, String)],
    set: &BTreeMap<String, HeaderOverride>,
    remove: &[String],
) -> Vec<(String, String)> {
    let mut out = Vec::with_capacity(original.len() + set.len());
    let mut applied: HashSet<String> = HashSet::new();

    for (name, value) in original {
        let key = name.to_ascii_lowercase();
        if remove.iter().any(|r| *r == key) {
            continue;
        }
        if let Some(over) = set.get(&key) {
            out.push((over.name.clone(), over.value.clone()));
            applied.insert(key);
            continue;
        }
        out.push((name.clone(), value.clone()));
    }

    for (key, over) in set {
        if !applied.contains(key) {
            out.push((over.name.clone(), over.value.clone()));
        }
    }
    out
}

/// Re-encode the URL's query string with set/remove patches applied.
fn rewrite_query(
    raw: &str,
    set: &BTreeMap<String, String>,
    remove: &[String],
) -> Option<String> {
    let mut parsed = url::Url::parse(raw).ok()?;
    let mut pairs: Vec<(String, String)> = parsed
        .query_pairs()
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();

    pairs.retain(|(k, _)| !remove.iter().any(|r| r == k));
    for (key, value) in set {
        match pairs.iter_mut().find(|(k, _)| k == key) {
            Some(pair) => pair.1 = value.clone(),
            None => pairs.push((key.clone(), value.clone())),
        }
    }

    if pairs.is_empty() {
        parsed.set_query(None);
    } else {
        parsed
            .query_pairs_mut()
            .clear()
            .extend_pairs(pairs.iter().map(|(k, v)| (k.as_str(), v.as_str())));
    }
    Some(parsed.to_string())
}

/// Merge a cookie patch into the `Cookie` header of a wire header list.
fn apply_cookie_patch(
    headers: &mut Vec<(String, String)>,
    original_cookie: Option<&str>,
    set: &BTreeMap<String, String>,
    remove: &[String],
) {
    let mut jar: BTreeMap<String, String> = original_cookie
        .map(parse_cookie_header)
        .unwrap_or_default();
    for name in remove {
        jar.remove(name);
    }
    for (name, value) in set {
        jar.insert(name.clone(), value.clone());
    }

    headers.retain(|(name, _)| !name.eq_ignore_ascii_case("cookie"));
    if !jar.is_empty() {
        let value = jar
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join("; ");
        headers.push(("Cookie".to_string(), value));
    }
}

/// Parse a `Cookie` header into name/value pairs.
pub(crate) fn parse_cookie_header(value: &str) -> BTreeMap<String, String> {
    let mut out = BTreeMap::new();
    for part in value.split(';') {
        if let Some((name, val)) = part.trim().split_once('=') {
            out.insert(name.to_string(), val.to_string());
        }
    }
    out
}

/// Parse the first name/value pair of a `Set-Cookie` header.
pub(crate) fn parse_set_cookie(value: &str) -> Option<(String, String)> {
    let first = value.split(';').next()?.trim();
    let (name, val) = first.split_once('=')?;
    if name.is_empty() {
        return None;
    }
    Some((name.to_string(), val.to_string()))
}

/// Body acquisition gate: text-like content under the size threshold.
pub(crate) fn should_fetch_body(content_type: &str, content_length: u64, threshold: u64) -> bool {
    let threshold = if threshold == 0 {
        refract_common::config::DEFAULT_BODY_SIZE_THRESHOLD
    } else {
        threshold
    };
    if content_length > 0 && content_length > threshold {
        return false;
    }
    let lc = content_type.to_ascii_lowercase();
    lc.starts_with("text/") || lc.starts_with("application/json")
}

#[cfg(test)]
mod tests {
    use super::*;
    use refract_common::RuleId;
    use refract_rules::{
        BlockAction, BodyPatch, Match, RewriteAction, RuleMode,
    };

    fn paused(url: &str) -> PausedEvent {
        PausedEvent {
            request_id: "req-1".into(),
            stage: Stage::Request,
            url: url.into(),
            method: "GET".into(),
            headers: vec![
                ("Host".into(), "a.test".into()),
                ("Content-Type".into(), "text/plain".into()),
            ],
            post_data: None,
            resource_type: "Document".into(),
            response_status: None,
            response_headers: Vec::new(),
        }
    }

    fn rewrite_rule(id: &str, rewrite: Rewrite) -> Arc<Rule> {
        Arc::new(Rule {
            id: RuleId::new(id),
            name: id.to_string(),
            priority: 0,
            mode: RuleMode::Aggregate,
            stage: None,
            matcher: Match::default(),
            actions: vec![Action::Rewrite(RewriteAction {
                rewrite,
                delay_ms: 0,
                drop_rate: 0.0,
            })],
        })
    }

    #[test]
    fn test_scalar_last_writer_wins() {
        let executor = ActionExecutor::new(0);
        let rules = vec![
            rewrite_rule(
                "a",
                Rewrite {
                    url: Some("https://first.test/".into()),
                    ..Rewrite::default()
                },
            ),
            rewrite_rule(
                "b",
                Rewrite {
                    url: Some("https://second.test/".into()),
                    method: Some("PUT".into()),
                    ..Rewrite::default()
                },
            ),
        ];
        let plan = executor.plan_request(&rules, &paused("https://a.test/"));
        assert_eq!(plan.mutation.url.as_deref(), Some("https://second.test/"));
        assert_eq!(plan.mutation.method.as_deref(), Some("PUT"));
        assert!(plan.sentinel.is_none());
    }

    #[test]
    fn test_remove_lists_concatenate() {
        let executor = ActionExecutor::new(0);
        let mut first = Rewrite::default();
        first.headers.insert("X-Gone".into(), None);
        let mut second = Rewrite::default();
        second.headers.insert("X-Also-Gone".into(), None);
        let rules = vec![rewrite_rule("a", first), rewrite_rule("b", second)];
        let plan = executor.plan_request(&rules, &paused("https://a.test/"));
        assert_eq!(
            plan.mutation.remove_headers,
            vec!["x-gone".to_string(), "x-also-gone".to_string()]
        );
    }

    #[test]
    fn test_set_after_remove_wins() {
        let executor = ActionExecutor::new(0);
        let mut first = Rewrite::default();
        first.headers.insert("X-A".into(), None);
        let mut second = Rewrite::default();
        second.headers.insert("X-A".into(), Some("1".into()));
        let rules = vec![rewrite_rule("a", first), rewrite_rule("b", second)];
        let plan = executor.plan_request(&rules, &paused("https://a.test/"));
        assert!(plan.mutation.remove_headers.is_empty());
        assert_eq!(plan.mutation.headers["x-a"].value, "1");
    }

    #[test]
    fn test_first_sentinel_wins_and_stops() {
        let executor = ActionExecutor::new(0);
        let block = Arc::new(Rule {
            id: RuleId::new("blocker"),
            name: String::new(),
            priority: 0,
            mode: RuleMode::Aggregate,
            stage: None,
            matcher: Match::default(),
            actions: vec![Action::Block(BlockAction::default())],
        });
        let mut late = Rewrite::default();
        late.url = Some("https://late.test/".into());
        let rules = vec![block, rewrite_rule("late", late)];
        let plan = executor.plan_request(&rules, &paused("https://a.test/"));
        assert!(matches!(plan.sentinel, Some(Sentinel::Block { ref rule }) if rule.as_str() == "blocker"));
        // Rule processing stopped at the sentinel.
        assert!(plan.mutation.url.is_none());
    }

    #[test]
    fn test_body_patch_propagates_across_rules() {
        let executor = ActionExecutor::new(0);
        let first = Rewrite {
            body: Some(BodyPatch::TextRegex {
                pattern: "a".into(),
                replace: "b".into(),
            }),
            ..Rewrite::default()
        };
        let second = Rewrite {
            body: Some(BodyPatch::TextRegex {
                pattern: "b+".into(),
                replace: "c".into(),
            }),
            ..Rewrite::default()
        };
        let mut ev = paused("https://a.test/");
        ev.post_data = Some("aab".into());
        let rules = vec![rewrite_rule("r1", first), rewrite_rule("r2", second)];
        let plan = executor.plan_request(&rules, &ev);
        assert_eq!(plan.mutation.body.as_deref(), Some(b"c".as_slice()));
    }

    #[test]
    fn test_failed_json_patch_keeps_other_fields() {
        let executor = ActionExecutor::new(0);
        let mut rw = Rewrite {
            body: Some(BodyPatch::JsonPatch(vec![refract_rules::PatchOp {
                op: refract_rules::PatchOpKind::Test,
                path: "/missing".into(),
                from: String::new(),
                value: serde_json::json!(1),
            }])),
            ..Rewrite::default()
        };
        rw.headers.insert("X-Keep".into(), Some("yes".into()));
        let mut ev = paused("https://a.test/");
        ev.post_data = Some(r#"{"a":1}"#.into());
        let plan = executor.plan_request(&[rewrite_rule("r", rw)], &ev);
        assert!(plan.mutation.body.is_none());
        assert_eq!(plan.mutation.headers["x-keep"].value, "yes");
    }

    #[test]
    fn test_merge_wire_headers_replaces_case_insensitively() {
        let original = vec![
            ("Host".to_string(), "a.test".to_string()),
            ("Content-Type".to_string(), "text/plain".to_string()),
        ];
        let mut set = BTreeMap::new();
        set.insert(
            "content-type".to_string(),
            HeaderOverride {
                name: "content-type".to_string(),
                value: "application/json".to_string(),
            },
        );
        set.insert(
            "x-a".to_string(),
            HeaderOverride {
                name: "X-A".to_string(),
                value: "1".to_string(),
            },
        );
        let remove = vec!["host".to_string()];
        let merged = merge_wire_headers(&original, &set, &remove);
        assert_eq!(
            merged,
            vec![
                ("content-type".to_string(), "application/json".to_string()),
                ("X-A".to_string(), "1".to_string()),
            ]
        );
    }

    #[test]
    fn test_rewrite_query_sets_and_removes() {
        let mut set = BTreeMap::new();
        set.insert("page".to_string(), "9".to_string());
        set.insert("new".to_string(), "x".to_string());
        let remove = vec!["old".to_string()];
        let out = rewrite_query("https://a.test/p?page=1&old=z", &set, &remove).unwrap();
        let parsed = url::Url::parse(&out).unwrap();
        let pairs: Vec<(String, String)> = parsed
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        assert!(pairs.contains(&("page".to_string(), "9".to_string())));
        assert!(pairs.contains(&("new".to_string(), "x".to_string())));
        assert!(!pairs.iter().any(|(k, _)| k == "old"));
    }

    #[test]
    fn test_cookie_patch_rebuilds_header() {
        let mut headers = vec![
            ("Cookie".to_string(), "sid=1; theme=dark".to_string()),
            ("Host".to_string(), "a.test".to_string()),
        ];
        let mut set = BTreeMap::new();
        set.insert("sid".to_string(), "2".to_string());
        let remove = vec!["theme".to_string()];
        apply_cookie_patch(&mut headers, Some("sid=1; theme=dark"), &set, &remove);
        let cookie = headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case("cookie"))
            .map(|(_, v)| v.clone())
            .unwrap();
        assert_eq!(cookie, "sid=2");
    }

    #[test]
    fn test_should_fetch_body_gate() {
        assert!(should_fetch_body("text/html", 0, 1024));
        assert!(should_fetch_body("application/json; charset=utf-8", 512, 1024));
        assert!(!should_fetch_body("application/json", 2048, 1024));
        assert!(!should_fetch_body("image/png", 10, 1024));
        // Zero threshold falls back to the 4 MiB default.
        assert!(should_fetch_body("text/plain", 1024 * 1024, 0));
    }

    #[test]
    fn test_parse_set_cookie() {
        assert_eq!(
            parse_set_cookie("sid=abc; Path=/; HttpOnly"),
            Some(("sid".to_string(), "abc".to_string()))
        );
        assert_eq!(parse_set_cookie("garbage"), None);
    }
}
