//! Shared test support: an in-memory debug client that records every
//! terminating call the engine issues.
#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use refract_common::{
    LifecycleEvent, PausedEvent, SessionConfig, SessionId, Stage, TargetDescriptor, TargetId,
};
use refract_engine::adapter::{
    AdapterError, ContinueRequestOverrides, ContinueResponseOverrides, DebugClient, FailureReason,
    FulfillResponse, TargetConn,
};
use refract_engine::InterceptService;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// One terminating adapter call as observed by the mock.
#[derive(Debug, Clone, PartialEq)]
pub enum TermCall {
    ContinueRequest {
        request_id: String,
        url: Option<String>,
        method: Option<String>,
        headers: Option<Vec<(String, String)>>,
        post_data: Option<Vec<u8>>,
    },
    ContinueResponse {
        request_id: String,
        status: Option<u16>,
        headers: Option<Vec<(String, String)>>,
    },
    Fulfill {
        request_id: String,
        status: u16,
        headers: Vec<(String, String)>,
        body: Vec<u8>,
    },
    Fail {
        request_id: String,
        reason: String,
    },
}

impl TermCall {
    pub fn request_id(&self) -> &str {
        match self {
            TermCall::ContinueRequest { request_id, .. }
            | TermCall::ContinueResponse { request_id, .. }
            | TermCall::Fulfill { request_id, .. }
            | TermCall::Fail { request_id, .. } => request_id,
        }
    }
}

pub struct MockConn {
    calls: Mutex<Vec<TermCall>>,
    paused_tx: Mutex<Option<mpsc::Sender<PausedEvent>>>,
    lifecycle_tx: Mutex<Option<mpsc::Sender<LifecycleEvent>>>,
    response_body: Mutex<Vec<u8>>,
    body_fetches: AtomicUsize,
    panic_on_body: std::sync::atomic::AtomicBool,
}

impl MockConn {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
            paused_tx: Mutex::new(None),
            lifecycle_tx: Mutex::new(None),
            response_body: Mutex::new(Vec::new()),
            body_fetches: AtomicUsize::new(0),
            panic_on_body: std::sync::atomic::AtomicBool::new(false),
        })
    }

    /// Make the next body fetch panic inside the handler.
    pub fn panic_on_body_fetch(&self) {
        self.panic_on_body.store(true, Ordering::SeqCst);
    }

    pub fn set_response_body(&self, body: &[u8]) {
        *self.response_body.lock() = body.to_vec();
    }

    pub fn body_fetches(&self) -> usize {
        self.body_fetches.load(Ordering::SeqCst)
    }

    pub fn calls(&self) -> Vec<TermCall> {
        self.calls.lock().clone()
    }

    /// Push a paused event into the engine's consumer.
    pub async fn push(&self, ev: PausedEvent) {
        let tx = self
            .paused_tx
            .lock()
            .clone()
            .expect("paused stream not subscribed");
        tx.send(ev).await.expect("paused stream closed");
    }

    /// Push a lifecycle event (auto-follow tests).
    pub async fn push_lifecycle(&self, name: &str) {
        let tx = self
            .lifecycle_tx
            .lock()
            .clone()
            .expect("lifecycle stream not subscribed");
        tx.send(LifecycleEvent {
            name: name.to_string(),
        })
        .await
        .expect("lifecycle stream closed");
    }

    fn record(&self, call: TermCall) {
        self.calls.lock().push(call);
    }
}

#[async_trait]
impl TargetConn for MockConn {
    async fn enable_network(&self) -> Result<(), AdapterError> {
        Ok(())
    }

    async fn enable_fetch(&self, _url_pattern: &str, _stages: &[Stage]) -> Result<(), AdapterError> {
        Ok(())
    }

    async fn disable_fetch(&self) -> Result<(), AdapterError> {
        Ok(())
    }

    async fn paused_events(&self) -> Result<mpsc::Receiver<PausedEvent>, AdapterError> {
        let (tx, rx) = mpsc::channel(64);
        *self.paused_tx.lock() = Some(tx);
        Ok(rx)
    }

    async fn lifecycle_events(&self) -> Result<mpsc::Receiver<LifecycleEvent>, AdapterError> {
        let (tx, rx) = mpsc::channel(16);
        *self.lifecycle_tx.lock() = Some(tx);
        Ok(rx)
    }

    async fn continue_request(
        &self,
        request_id: &str,
        overrides: ContinueRequestOverrides,
    ) -> Result<(), AdapterError> {
        self.record(TermCall::ContinueRequest {
            request_id: request_id.to_string(),
            url: overrides.url,
            method: overrides.method,
            headers: overrides.headers,
            post_data: overrides.post_data,
        });
        Ok(())
    }

    async fn continue_response(
        &self,
        request_id: &str,
        overrides: ContinueResponseOverrides,
    ) -> Result<(), AdapterError> {
        self.record(TermCall::ContinueResponse {
            request_id: request_id.to_string(),
            status: overrides.status,
            headers: overrides.headers,
        });
        Ok(())
    }

    async fn fulfill_request(
        &self,
        request_id: &str,
        response: FulfillResponse,
    ) -> Result<(), AdapterError> {
        self.record(TermCall::Fulfill {
            request_id: request_id.to_string(),
            status: response.status,
            headers: response.headers,
            body: response.body,
        });
        Ok(())
    }

    async fn fail_request(
        &self,
        request_id: &str,
        reason: FailureReason,
    ) -> Result<(), AdapterError> {
        self.record(TermCall::Fail {
            request_id: request_id.to_string(),
            reason: reason.as_str().to_string(),
        });
        Ok(())
    }

    async fn get_response_body(&self, _request_id: &str) -> Result<Vec<u8>, AdapterError> {
        if self.panic_on_body.load(Ordering::SeqCst) {
            panic!("injected body fetch panic");
        }
        self.body_fetches.fetch_add(1, Ordering::SeqCst);
        Ok(self.response_body.lock().clone())
    }

    async fn close(&self) {}
}

pub struct MockClient {
    pub targets: Mutex<Vec<TargetDescriptor>>,
    conn: Arc<MockConn>,
    pub dials: AtomicUsize,
}

impl MockClient {
    pub fn with_conn(conn: Arc<MockConn>) -> Arc<Self> {
        Arc::new(Self {
            targets: Mutex::new(vec![page_target("t1", "https://a.test/")]),
            conn,
            dials: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl DebugClient for MockClient {
    async fn list_targets(&self) -> Result<Vec<TargetDescriptor>, AdapterError> {
        Ok(self.targets.lock().clone())
    }

    async fn dial(
        &self,
        _target: &TargetDescriptor,
        _cancel: CancellationToken,
    ) -> Result<Arc<dyn TargetConn>, AdapterError> {
        self.dials.fetch_add(1, Ordering::SeqCst);
        Ok(self.conn.clone())
    }
}

pub fn page_target(id: &str, url: &str) -> TargetDescriptor {
    TargetDescriptor {
        id: TargetId::new(id),
        kind: "page".to_string(),
        url: url.to_string(),
        title: String::new(),
        websocket_url: format!("ws://mock/{}", id),
    }
}

/// A fully wired engine over the mock adapter, attached and enabled.
pub struct Harness {
    pub service: InterceptService,
    pub session: SessionId,
    pub client: Arc<MockClient>,
    pub conn: Arc<MockConn>,
}

pub async fn start_harness(config: SessionConfig) -> Harness {
    let conn = MockConn::new();
    let client = MockClient::with_conn(conn.clone());
    let service = InterceptService::new();
    let session = service.start_session_with_client(config, client.clone());
    service
        .attach_target(&session, Some(TargetId::new("t1")))
        .await
        .expect("attach");
    service
        .enable_interception(&session)
        .await
        .expect("enable");
    Harness {
        service,
        session,
        client,
        conn,
    }
}

pub fn request_event(request_id: &str, url: &str) -> PausedEvent {
    PausedEvent {
        request_id: request_id.to_string(),
        stage: Stage::Request,
        url: url.to_string(),
        method: "GET".to_string(),
        headers: vec![
            ("Host".to_string(), "a.test".to_string()),
            ("Accept".to_string(), "*/*".to_string()),
        ],
        post_data: None,
        resource_type: "Document".to_string(),
        response_status: None,
        response_headers: Vec::new(),
    }
}

pub fn response_event(request_id: &str, url: &str, headers: &[(&str, &str)]) -> PausedEvent {
    PausedEvent {
        request_id: request_id.to_string(),
        stage: Stage::Response,
        url: url.to_string(),
        method: "GET".to_string(),
        headers: vec![("Host".to_string(), "a.test".to_string())],
        post_data: None,
        resource_type: "Document".to_string(),
        response_status: Some(200),
        response_headers: headers
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect(),
    }
}

/// Wait until the mock has recorded at least `count` terminating calls.
pub async fn wait_for_calls(conn: &MockConn, count: usize) -> Vec<TermCall> {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let calls = conn.calls();
        if calls.len() >= count {
            return calls;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!(
                "timed out waiting for {} terminating calls, saw {:?}",
                count, calls
            );
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Parse a rule set from its JSON wire format.
pub fn rules_from_json(raw: &str) -> refract_rules::RuleSet {
    serde_json::from_str(raw).expect("rule set json")
}

/// Wait for the first event matching the predicate, discarding others.
pub async fn wait_for_event<F>(
    rx: &mut mpsc::Receiver<refract_common::NetworkEvent>,
    what: &str,
    predicate: F,
) -> refract_common::NetworkEvent
where
    F: Fn(&refract_common::NetworkEvent) -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        match tokio::time::timeout_at(deadline, rx.recv()).await {
            Ok(Some(event)) => {
                if predicate(&event) {
                    return event;
                }
            }
            Ok(None) => panic!("event stream closed waiting for {}", what),
            Err(_) => panic!("timed out waiting for {}", what),
        }
    }
}
