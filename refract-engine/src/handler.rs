//! Per-event handler.
//!
//! Pipeline for one paused transaction: build the evaluation context,
//! evaluate rules, compute and apply the mutation or sentinel, and emit
//! observability records. Every code path issues exactly one terminating
//! adapter call and marks the [`Termination`] guard right before doing
//! so, which lets the dispatcher degrade an event whose handler died
//! without answering.

use crate::adapter::TargetConn;
use crate::executor::{
    request_mutation_from_rewrite, response_mutation_from_rewrite, ActionExecutor, RequestMutation,
    ResponseMutation, Sentinel,
};
use crate::pause::{PauseCoordinator, PauseDecision, PauseWait};
use refract_common::{
    EventKind, FinalResult, Header, NetworkEvent, PausedEvent, PendingItem, Request, Response,
    RuleId, RuleMatchSummary, SessionId, Stage, TargetId,
};
use refract_rules::{EvalContext, PauseAction, PauseFallbackKind, RespondAction, Rule, RuleEngine};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

/// Marks that a paused transaction has been answered. Shared between the
/// handler future and the dispatcher's degrade guard.
#[derive(Clone, Default)]
pub struct Termination(Arc<AtomicBool>);

impl Termination {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_marked(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Non-blocking event emitter; a saturated channel drops the event so
/// observability never back-pressures interception.
#[derive(Clone)]
pub struct EventSink {
    session: SessionId,
    tx: mpsc::Sender<NetworkEvent>,
}

impl EventSink {
    pub fn new(session: SessionId, tx: mpsc::Sender<NetworkEvent>) -> Self {
        Self { session, tx }
    }

    pub fn emit(&self, mut event: NetworkEvent) {
        event.session = self.session.clone();
        if self.tx.try_send(event).is_err() {
            trace!("events channel saturated, record dropped");
        }
    }
}

/// Orchestrates evaluation, execution and event emission for one event.
pub struct EventHandler {
    engine: Arc<RuleEngine>,
    executor: ActionExecutor,
    pause: Arc<PauseCoordinator>,
    events: EventSink,
}

impl EventHandler {
    pub fn new(
        engine: Arc<RuleEngine>,
        executor: ActionExecutor,
        pause: Arc<PauseCoordinator>,
        events: EventSink,
    ) -> Self {
        Self {
            engine,
            executor,
            pause,
            events,
        }
    }

    /// Handle one paused event to completion.
    pub async fn handle(
        &self,
        conn: Arc<dyn TargetConn>,
        target: TargetId,
        ev: PausedEvent,
        termination: Termination,
    ) {
        let start = Instant::now();
        self.events
            .emit(progress_event(EventKind::Intercepted, &target, &ev, None));
        debug!(stage = %ev.stage, url = %ev.url, method = %ev.method, "handling paused event");

        let (body_text, body_available) = match ev.stage {
            Stage::Request => (ev.post_data.clone().unwrap_or_default(), true),
            Stage::Response => self.executor.fetch_body_gated(conn.as_ref(), &ev).await,
        };

        let eval_ctx = build_eval_context(&ev, &body_text);
        let matched = self.engine.eval_for_stage(&eval_ctx, ev.stage);

        if matched.is_empty() {
            termination.mark();
            self.executor.continue_plain(conn.as_ref(), &ev).await;
            self.emit_record(
                &target,
                &ev,
                &body_text,
                EventKind::Intercepted,
                FinalResult::Passed,
                false,
                None,
                Vec::new(),
                None,
                None,
            );
            debug!(duration = ?start.elapsed(), "no rules matched");
            return;
        }

        let summaries = rule_summaries(&matched);
        match ev.stage {
            Stage::Request => {
                self.handle_request_stage(conn, target, ev, &matched, summaries, termination)
                    .await;
            }
            Stage::Response => {
                self.handle_response_stage(
                    conn,
                    target,
                    ev,
                    &matched,
                    summaries,
                    body_text,
                    body_available,
                    termination,
                )
                .await;
            }
        }
        debug!(duration = ?start.elapsed(), "paused event handled");
    }

    /// Degrade an unanswered event with an unconditional continue. Called
    /// by the dispatcher on pool overflow, per-event timeout or handler
    /// panic.
    pub async fn degrade(
        &self,
        conn: &dyn TargetConn,
        target: &TargetId,
        ev: &PausedEvent,
        reason: &str,
    ) {
        warn!(request_id = %ev.request_id, reason, "degrading paused event");
        self.executor.continue_plain(conn, ev).await;
        self.events
            .emit(progress_event(EventKind::Degraded, target, ev, None));
    }

    /// Emit a `degraded` progress event without touching the transaction.
    pub fn emit_degraded(&self, target: &TargetId, ev: &PausedEvent) {
        self.events
            .emit(progress_event(EventKind::Degraded, target, ev, None));
    }

    async fn handle_request_stage(
        &self,
        conn: Arc<dyn TargetConn>,
        target: TargetId,
        ev: PausedEvent,
        matched: &[Arc<Rule>],
        summaries: Vec<RuleMatchSummary>,
        termination: Termination,
    ) {
        let plan = self.executor.plan_request(matched, &ev);
        for _ in 0..plan.dropped_actions {
            self.emit_degraded(&target, &ev);
        }
        if plan.delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(plan.delay_ms)).await;
        }

        match plan.sentinel {
            Some(Sentinel::Block { rule }) => {
                termination.mark();
                self.executor.apply_fail(conn.as_ref(), &ev).await;
                self.emit_record(
                    &target,
                    &ev,
                    "",
                    EventKind::Blocked,
                    FinalResult::Blocked,
                    true,
                    Some(rule),
                    summaries,
                    None,
                    None,
                );
            }
            Some(Sentinel::Fail { rule, .. }) => {
                termination.mark();
                self.executor.apply_fail(conn.as_ref(), &ev).await;
                self.emit_record(
                    &target,
                    &ev,
                    "",
                    EventKind::Failed,
                    FinalResult::Failed,
                    true,
                    Some(rule),
                    summaries,
                    None,
                    None,
                );
            }
            Some(Sentinel::Respond { rule, respond }) => {
                termination.mark();
                self.executor.apply_respond(conn.as_ref(), &ev, &respond).await;
                self.emit_record(
                    &target,
                    &ev,
                    "",
                    EventKind::Fulfilled,
                    FinalResult::Fulfilled,
                    true,
                    Some(rule),
                    summaries,
                    None,
                    None,
                );
            }
            Some(Sentinel::Pause { rule, pause }) => {
                self.run_pause(
                    conn,
                    target,
                    ev,
                    pause,
                    rule,
                    summaries,
                    String::new(),
                    true,
                    termination,
                )
                .await;
            }
            None => {
                if plan.mutation.is_empty() {
                    termination.mark();
                    self.executor.continue_plain(conn.as_ref(), &ev).await;
                    self.emit_record(
                        &target,
                        &ev,
                        "",
                        EventKind::Intercepted,
                        FinalResult::Passed,
                        true,
                        None,
                        summaries,
                        None,
                        None,
                    );
                } else {
                    let original = request_snapshot(&ev);
                    let modified = modified_request_snapshot(&original, &plan.mutation);
                    termination.mark();
                    self.executor
                        .apply_request_mutation(conn.as_ref(), &ev, &plan.mutation)
                        .await;
                    self.emit_record(
                        &target,
                        &ev,
                        "",
                        EventKind::Mutated,
                        FinalResult::Modified,
                        true,
                        None,
                        summaries,
                        Some(modified),
                        None,
                    );
                }
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn handle_response_stage(
        &self,
        conn: Arc<dyn TargetConn>,
        target: TargetId,
        ev: PausedEvent,
        matched: &[Arc<Rule>],
        summaries: Vec<RuleMatchSummary>,
        body_text: String,
        body_available: bool,
        termination: Termination,
    ) {
        let plan = self.executor.plan_response(matched, &body_text);
        for _ in 0..plan.dropped_actions {
            self.emit_degraded(&target, &ev);
        }
        if plan.delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(plan.delay_ms)).await;
        }

        match plan.sentinel {
            Some(Sentinel::Block { rule }) => {
                termination.mark();
                self.executor.apply_fail(conn.as_ref(), &ev).await;
                self.emit_record(
                    &target,
                    &ev,
                    &body_text,
                    EventKind::Blocked,
                    FinalResult::Blocked,
                    true,
                    Some(rule),
                    summaries,
                    None,
                    None,
                );
            }
            Some(Sentinel::Fail { rule, .. }) => {
                termination.mark();
                self.executor.apply_fail(conn.as_ref(), &ev).await;
                self.emit_record(
                    &target,
                    &ev,
                    &body_text,
                    EventKind::Failed,
                    FinalResult::Failed,
                    true,
                    Some(rule),
                    summaries,
                    None,
                    None,
                );
            }
            Some(Sentinel::Respond { rule, respond }) => {
                termination.mark();
                self.executor.apply_respond(conn.as_ref(), &ev, &respond).await;
                self.emit_record(
                    &target,
                    &ev,
                    &body_text,
                    EventKind::Fulfilled,
                    FinalResult::Fulfilled,
                    true,
                    Some(rule),
                    summaries,
                    None,
                    None,
                );
            }
            Some(Sentinel::Pause { rule, pause }) => {
                self.run_pause(
                    conn,
                    target,
                    ev,
                    pause,
                    rule,
                    summaries,
                    body_text,
                    body_available,
                    termination,
                )
                .await;
            }
            None => {
                let mut effective = plan.mutation.clone();
                if !body_available {
                    // The gate refused the body; dependent patches do not
                    // apply.
                    effective.body = None;
                }
                if effective.is_empty() {
                    termination.mark();
                    self.executor.continue_plain(conn.as_ref(), &ev).await;
                    self.emit_record(
                        &target,
                        &ev,
                        &body_text,
                        EventKind::Intercepted,
                        FinalResult::Passed,
                        true,
                        None,
                        summaries,
                        None,
                        None,
                    );
                } else {
                    let original = response_snapshot(&ev, &body_text);
                    let modified = modified_response_snapshot(&original, &effective);
                    termination.mark();
                    self.executor
                        .apply_response_mutation(conn.as_ref(), &ev, &effective, body_available)
                        .await;
                    self.emit_record(
                        &target,
                        &ev,
                        &body_text,
                        EventKind::Mutated,
                        FinalResult::Modified,
                        true,
                        None,
                        summaries,
                        None,
                        Some(modified),
                    );
                }
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_pause(
        &self,
        conn: Arc<dyn TargetConn>,
        target: TargetId,
        ev: PausedEvent,
        pause: PauseAction,
        rule: RuleId,
        summaries: Vec<RuleMatchSummary>,
        body_text: String,
        body_available: bool,
        termination: Termination,
    ) {
        let registration = self.pause.register(&ev.request_id);
        let item = PendingItem {
            id: ev.request_id.clone(),
            stage: ev.stage,
            url: ev.url.clone(),
            method: ev.method.clone(),
            target: target.clone(),
            rule: Some(rule.clone()),
        };

        if !self.pause.try_enqueue(item) {
            warn!(request_id = %ev.request_id, "pending queue full, applying default action");
            termination.mark();
            self.apply_pause_default(conn.as_ref(), &ev, &pause).await;
            self.emit_degraded(&target, &ev);
            return;
        }

        self.events.emit(progress_event(
            EventKind::Pending,
            &target,
            &ev,
            Some(rule.clone()),
        ));

        match self.pause.wait(registration, pause.timeout_ms).await {
            PauseWait::Decision(PauseDecision::Approve(rewrite)) => {
                termination.mark();
                if rewrite.is_empty() {
                    self.executor.continue_plain(conn.as_ref(), &ev).await;
                    self.emit_record(
                        &target,
                        &ev,
                        &body_text,
                        EventKind::Approved,
                        FinalResult::Passed,
                        true,
                        Some(rule),
                        summaries,
                        None,
                        None,
                    );
                    return;
                }
                match ev.stage {
                    Stage::Request => {
                        let mutation = request_mutation_from_rewrite(&rewrite, &ev);
                        let original = request_snapshot(&ev);
                        let modified = modified_request_snapshot(&original, &mutation);
                        self.executor
                            .apply_request_mutation(conn.as_ref(), &ev, &mutation)
                            .await;
                        self.emit_record(
                            &target,
                            &ev,
                            &body_text,
                            EventKind::Approved,
                            FinalResult::Modified,
                            true,
                            Some(rule),
                            summaries,
                            Some(modified),
                            None,
                        );
                    }
                    Stage::Response => {
                        let mut mutation = response_mutation_from_rewrite(&rewrite, &body_text);
                        if !body_available {
                            mutation.body = None;
                        }
                        let original = response_snapshot(&ev, &body_text);
                        let modified = modified_response_snapshot(&original, &mutation);
                        self.executor
                            .apply_response_mutation(conn.as_ref(), &ev, &mutation, body_available)
                            .await;
                        self.emit_record(
                            &target,
                            &ev,
                            &body_text,
                            EventKind::Approved,
                            FinalResult::Modified,
                            true,
                            Some(rule),
                            summaries,
                            None,
                            Some(modified),
                        );
                    }
                }
            }
            PauseWait::Decision(PauseDecision::Reject) => {
                termination.mark();
                let outcome = self.apply_pause_default(conn.as_ref(), &ev, &pause).await;
                self.emit_record(
                    &target,
                    &ev,
                    &body_text,
                    EventKind::Rejected,
                    outcome,
                    true,
                    Some(rule),
                    summaries,
                    None,
                    None,
                );
            }
            PauseWait::TimedOut => {
                termination.mark();
                let outcome = self.apply_pause_default(conn.as_ref(), &ev, &pause).await;
                self.emit_record(
                    &target,
                    &ev,
                    &body_text,
                    EventKind::Timeout,
                    outcome,
                    true,
                    Some(rule),
                    summaries,
                    None,
                    None,
                );
            }
        }
    }

    async fn apply_pause_default(
        &self,
        conn: &dyn TargetConn,
        ev: &PausedEvent,
        pause: &PauseAction,
    ) -> FinalResult {
        match pause.default_action.kind {
            PauseFallbackKind::Fulfill => {
                let status = if pause.default_action.status == 0 {
                    200
                } else {
                    pause.default_action.status
                };
                let respond = RespondAction {
                    status,
                    headers: BTreeMap::new(),
                    body: None,
                    delay_ms: 0,
                    drop_rate: 0.0,
                };
                self.executor.apply_respond(conn, ev, &respond).await;
                FinalResult::Fulfilled
            }
            PauseFallbackKind::Fail => {
                self.executor.apply_fail(conn, ev).await;
                FinalResult::Failed
            }
            PauseFallbackKind::ContinueOriginal
            | PauseFallbackKind::ContinueMutated
            | PauseFallbackKind::Unknown => {
                self.executor.continue_plain(conn, ev).await;
                FinalResult::Passed
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn emit_record(
        &self,
        target: &TargetId,
        ev: &PausedEvent,
        body_text: &str,
        kind: EventKind,
        final_result: FinalResult,
        is_matched: bool,
        rule: Option<RuleId>,
        matched_rules: Vec<RuleMatchSummary>,
        modified_request: Option<Request>,
        modified_response: Option<Response>,
    ) {
        let mut record = progress_event(kind, target, ev, rule);
        record.is_matched = is_matched;
        record.final_result = Some(final_result);
        record.matched_rules = matched_rules;
        record.request = Some(request_snapshot(ev));
        if ev.stage == Stage::Response {
            record.response = Some(response_snapshot(ev, body_text));
        }
        record.modified_request = modified_request;
        record.modified_response = modified_response;
        self.events.emit(record);
    }
}

/// Lightweight progress event carrying only the transaction coordinates.
fn progress_event(
    kind: EventKind,
    target: &TargetId,
    ev: &PausedEvent,
    rule: Option<RuleId>,
) -> NetworkEvent {
    let mut event = NetworkEvent::new(kind);
    event.target = target.clone();
    event.stage = Some(ev.stage);
    event.url = ev.url.clone();
    event.method = ev.method.clone();
    event.status = ev.response_status;
    event.rule = rule;
    event
}

/// Build the rule-evaluation input from a paused event.
pub(crate) fn build_eval_context(ev: &PausedEvent, body_text: &str) -> EvalContext {
    let mut headers = BTreeMap::new();
    let mut cookies = BTreeMap::new();
    let mut query = BTreeMap::new();
    let mut content_type = String::new();

    match ev.stage {
        Stage::Request => {
            for (name, value) in &ev.headers {
                headers.insert(name.to_ascii_lowercase(), value.clone());
            }
            if let Some(cookie) = headers.get("cookie") {
                for (name, value) in crate::executor::parse_cookie_header(cookie) {
                    cookies.insert(name.to_ascii_lowercase(), value);
                }
            }
            if let Ok(parsed) = url::Url::parse(&ev.url) {
                for (key, value) in parsed.query_pairs() {
                    query
                        .entry(key.to_ascii_lowercase())
                        .or_insert_with(|| value.into_owned());
                }
            }
        }
        Stage::Response => {
            for (name, value) in &ev.response_headers {
                headers.insert(name.to_ascii_lowercase(), value.clone());
                if name.eq_ignore_ascii_case("set-cookie") {
                    if let Some((cookie_name, cookie_value)) =
                        crate::executor::parse_set_cookie(value)
                    {
                        cookies.insert(cookie_name.to_ascii_lowercase(), cookie_value);
                    }
                }
            }
        }
    }

    if let Some(ct) = headers.get("content-type") {
        content_type = ct.clone();
    }

    EvalContext {
        url: ev.url.clone(),
        method: ev.method.clone(),
        resource_type: ev.resource_type.clone(),
        stage: ev.stage,
        headers,
        query,
        cookies,
        body: body_text.to_string(),
        content_type,
    }
}

fn rule_summaries(matched: &[Arc<Rule>]) -> Vec<RuleMatchSummary> {
    matched
        .iter()
        .map(|rule| RuleMatchSummary {
            rule_id: rule.id.clone(),
            rule_name: rule.name.clone(),
            action_types: rule
                .actions
                .iter()
                .map(|a| a.type_name().to_string())
                .collect(),
        })
        .collect()
}

/// Capture the original request for observability.
pub(crate) fn request_snapshot(ev: &PausedEvent) -> Request {
    let ctx = build_eval_context(ev, ev.post_data.as_deref().unwrap_or_default());
    Request {
        url: ev.url.clone(),
        method: ev.method.clone(),
        resource_type: ev.resource_type.clone(),
        headers: Header::from_entries(ev.headers.iter().map(|(k, v)| (k.as_str(), v.as_str()))),
        query: ctx.query,
        cookies: ctx.cookies,
        body: ev.post_data.clone().unwrap_or_default(),
    }
}

/// Capture the original response for observability.
pub(crate) fn response_snapshot(ev: &PausedEvent, body_text: &str) -> Response {
    Response {
        status: ev.response_status.unwrap_or(0),
        headers: Header::from_entries(
            ev.response_headers.iter().map(|(k, v)| (k.as_str(), v.as_str())),
        ),
        body: body_text.to_string(),
    }
}

fn modified_request_snapshot(original: &Request, mutation: &RequestMutation) -> Request {
    let mut modified = original.clone();
    if let Some(url) = &mutation.url {
        modified.url = url.clone();
    }
    if let Some(method) = &mutation.method {
        modified.method = method.clone();
    }
    for key in &mutation.remove_headers {
        modified.headers.remove(key);
    }
    for (key, over) in &mutation.headers {
        modified.headers.set(key, over.value.clone());
    }
    for key in &mutation.remove_query {
        modified.query.remove(key);
    }
    for (key, value) in &mutation.query {
        modified.query.insert(key.clone(), value.clone());
    }
    for key in &mutation.remove_cookies {
        modified.cookies.remove(key);
    }
    for (key, value) in &mutation.cookies {
        modified.cookies.insert(key.clone(), value.clone());
    }
    if let Some(body) = &mutation.body {
        modified.body = String::from_utf8_lossy(body).into_owned();
    }
    modified
}

fn modified_response_snapshot(original: &Response, mutation: &ResponseMutation) -> Response {
    let mut modified = original.clone();
    if let Some(status) = mutation.status {
        modified.status = status;
    }
    for key in &mutation.remove_headers {
        modified.headers.remove(key);
    }
    for (key, over) in &mutation.headers {
        modified.headers.set(key, over.value.clone());
    }
    if let Some(body) = &mutation.body {
        modified.body = String::from_utf8_lossy(body).into_owned();
    }
    modified
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request_event() -> PausedEvent {
        PausedEvent {
            request_id: "r1".into(),
            stage: Stage::Request,
            url: "https://a.test/search?Q=Rust&lang=en".into(),
            method: "POST".into(),
            headers: vec![
                ("Content-Type".into(), "application/json".into()),
                ("Cookie".into(), "SID=abc; theme=dark".into()),
            ],
            post_data: Some(r#"{"q":"rust"}"#.into()),
            resource_type: "XHR".into(),
            response_status: None,
            response_headers: Vec::new(),
        }
    }

    fn response_event() -> PausedEvent {
        PausedEvent {
            request_id: "r1".into(),
            stage: Stage::Response,
            url: "https://a.test/search".into(),
            method: "GET".into(),
            headers: Vec::new(),
            post_data: None,
            resource_type: "Document".into(),
            response_status: Some(200),
            response_headers: vec![
                ("Content-Type".into(), "text/html".into()),
                ("Set-Cookie".into(), "SID=xyz; Path=/".into()),
            ],
        }
    }

    #[test]
    fn test_request_eval_context() {
        let ctx = build_eval_context(&request_event(), r#"{"q":"rust"}"#);
        assert_eq!(ctx.headers.get("content-type").unwrap(), "application/json");
        assert_eq!(ctx.cookies.get("sid").unwrap(), "abc");
        assert_eq!(ctx.query.get("q").unwrap(), "Rust");
        assert_eq!(ctx.query.get("lang").unwrap(), "en");
        assert_eq!(ctx.content_type, "application/json");
        assert_eq!(ctx.stage, Stage::Request);
    }

    #[test]
    fn test_response_eval_context() {
        let ctx = build_eval_context(&response_event(), "<html>");
        assert_eq!(ctx.headers.get("content-type").unwrap(), "text/html");
        assert_eq!(ctx.cookies.get("sid").unwrap(), "xyz");
        assert_eq!(ctx.content_type, "text/html");
        assert_eq!(ctx.body, "<html>");
    }

    #[test]
    fn test_modified_request_snapshot() {
        let original = request_snapshot(&request_event());
        let mut mutation = RequestMutation::default();
        mutation.url = Some("https://b.test/".into());
        mutation.remove_headers.push("cookie".into());
        mutation.headers.insert(
            "x-a".into(),
            crate::executor::HeaderOverride {
                name: "X-A".into(),
                value: "1".into(),
            },
        );
        mutation.body = Some(b"patched".to_vec());
        let modified = modified_request_snapshot(&original, &mutation);
        assert_eq!(modified.url, "https://b.test/");
        assert!(modified.headers.get("cookie").is_none());
        assert_eq!(modified.headers.get("x-a"), Some("1"));
        assert_eq!(modified.body, "patched");
        // Original stays untouched.
        assert!(original.headers.get("cookie").is_some());
    }

    #[test]
    fn test_modified_response_snapshot() {
        let original = response_snapshot(&response_event(), "old");
        let mut mutation = ResponseMutation::default();
        mutation.status = Some(404);
        mutation.body = Some(b"new".to_vec());
        let modified = modified_response_snapshot(&original, &mutation);
        assert_eq!(modified.status, 404);
        assert_eq!(modified.body, "new");
        assert_eq!(original.status, 200);
    }

    #[test]
    fn test_termination_guard() {
        let t = Termination::new();
        assert!(!t.is_marked());
        let clone = t.clone();
        clone.mark();
        assert!(t.is_marked());
    }
}
