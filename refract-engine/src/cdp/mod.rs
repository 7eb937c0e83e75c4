//! Chromium DevTools Protocol adapter.
//!
//! Implements the capability interface over chromiumoxide. Target
//! discovery goes through the endpoint's HTTP `/json` listing (which is
//! what carries per-target websocket URLs); attached connections ride the
//! browser websocket with one driver task per connection.

mod convert;

use crate::adapter::{
    AdapterError, ContinueRequestOverrides, ContinueResponseOverrides, DebugClient, FailureReason,
    FulfillResponse, TargetConn,
};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use chromiumoxide::cdp::browser_protocol::fetch::{
    ContinueRequestParams, ContinueResponseParams, DisableParams, EnableParams as FetchEnableParams,
    EventRequestPaused, FailRequestParams, FulfillRequestParams, GetResponseBodyParams,
    RequestPattern, RequestStage,
};
use chromiumoxide::cdp::browser_protocol::network::{
    EnableParams as NetworkEnableParams, ErrorReason,
};
use chromiumoxide::cdp::browser_protocol::page::{
    EventLifecycleEvent, SetLifecycleEventsEnabledParams,
};
use chromiumoxide::{Browser, Page};
use futures::StreamExt;
use refract_common::{LifecycleEvent, PausedEvent, Stage, TargetDescriptor, TargetId};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const DISCOVERY_TIMEOUT: Duration = Duration::from_secs(2);

/// Client for one browser debugging endpoint.
pub struct CdpClient {
    devtools_url: String,
    http: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct JsonTarget {
    id: String,
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    url: String,
    #[serde(default)]
    title: String,
    #[serde(default, rename = "webSocketDebuggerUrl")]
    web_socket_debugger_url: String,
}

#[derive(Debug, Deserialize)]
struct JsonVersion {
    #[serde(rename = "webSocketDebuggerUrl")]
    web_socket_debugger_url: String,
}

impl CdpClient {
    pub fn new(devtools_url: impl Into<String>) -> Self {
        let devtools_url = devtools_url.into().trim_end_matches('/').to_string();
        Self {
            devtools_url,
            http: reqwest::Client::new(),
        }
    }

    async fn browser_ws_url(&self) -> Result<String, AdapterError> {
        let url = format!("{}/json/version", self.devtools_url);
        let version: JsonVersion = self
            .http
            .get(&url)
            .timeout(DISCOVERY_TIMEOUT)
            .send()
            .await
            .map_err(|err| AdapterError::Endpoint(err.to_string()))?
            .json()
            .await
            .map_err(|err| AdapterError::Endpoint(err.to_string()))?;
        Ok(version.web_socket_debugger_url)
    }
}

#[async_trait]
impl DebugClient for CdpClient {
    async fn list_targets(&self) -> Result<Vec<TargetDescriptor>, AdapterError> {
        let url = format!("{}/json/list", self.devtools_url);
        let targets: Vec<JsonTarget> = self
            .http
            .get(&url)
            .timeout(DISCOVERY_TIMEOUT)
            .send()
            .await
            .map_err(|err| AdapterError::Endpoint(err.to_string()))?
            .json()
            .await
            .map_err(|err| AdapterError::Endpoint(err.to_string()))?;

        Ok(targets
            .into_iter()
            .map(|t| TargetDescriptor {
                id: TargetId::new(t.id),
                kind: t.kind,
                url: t.url,
                title: t.title,
                websocket_url: t.web_socket_debugger_url,
            })
            .collect())
    }

    async fn dial(
        &self,
        target: &TargetDescriptor,
        cancel: CancellationToken,
    ) -> Result<Arc<dyn TargetConn>, AdapterError> {
        let ws_url = self.browser_ws_url().await?;
        let (browser, mut handler) = Browser::connect(ws_url)
            .await
            .map_err(|err| AdapterError::Endpoint(err.to_string()))?;

        // Drive the websocket until the connection is cancelled.
        let pump_cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = pump_cancel.cancelled() => break,
                    event = handler.next() => match event {
                        Some(event) => {
                            if let Err(err) = event {
                                warn!(error = %err, "browser connection event error");
                            }
                        }
                        None => break,
                    },
                }
            }
            debug!("browser connection driver stopped");
        });

        let page = browser
            .get_page(target.id.as_str().to_string().into())
            .await
            .map_err(|_| AdapterError::TargetNotFound(target.id.to_string()))?;

        debug!(target = %target.id, url = %target.url, "attached to browser target");
        Ok(Arc::new(CdpConn {
            _browser: browser,
            page,
            cancel,
        }))
    }
}

/// One attached page target.
struct CdpConn {
    /// Keeps the underlying websocket alive for the page handle.
    _browser: Browser,
    page: Page,
    cancel: CancellationToken,
}

fn protocol_err(err: impl std::fmt::Display) -> AdapterError {
    AdapterError::Protocol(err.to_string())
}

#[async_trait]
impl TargetConn for CdpConn {
    async fn enable_network(&self) -> Result<(), AdapterError> {
        self.page
            .execute(NetworkEnableParams::default())
            .await
            .map_err(protocol_err)?;
        Ok(())
    }

    async fn enable_fetch(&self, url_pattern: &str, stages: &[Stage]) -> Result<(), AdapterError> {
        let mut builder = FetchEnableParams::builder();
        for stage in stages {
            let request_stage = match stage {
                Stage::Request => RequestStage::Request,
                Stage::Response => RequestStage::Response,
            };
            builder = builder.pattern(
                RequestPattern::builder()
                    .url_pattern(url_pattern)
                    .request_stage(request_stage)
                    .build(),
            );
        }
        self.page
            .execute(builder.build())
            .await
            .map_err(protocol_err)?;
        Ok(())
    }

    async fn disable_fetch(&self) -> Result<(), AdapterError> {
        self.page
            .execute(DisableParams::default())
            .await
            .map_err(protocol_err)?;
        Ok(())
    }

    async fn paused_events(&self) -> Result<mpsc::Receiver<PausedEvent>, AdapterError> {
        let mut stream = self
            .page
            .event_listener::<EventRequestPaused>()
            .await
            .map_err(protocol_err)?;
        let (tx, rx) = mpsc::channel(256);
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = stream.next() => match event {
                        Some(event) => {
                            if tx.send(convert::to_paused_event(event.as_ref())).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    },
                }
            }
        });
        Ok(rx)
    }

    async fn lifecycle_events(&self) -> Result<mpsc::Receiver<LifecycleEvent>, AdapterError> {
        self.page
            .execute(SetLifecycleEventsEnabledParams::new(true))
            .await
            .map_err(protocol_err)?;
        let mut stream = self
            .page
            .event_listener::<EventLifecycleEvent>()
            .await
            .map_err(protocol_err)?;
        let (tx, rx) = mpsc::channel(64);
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = stream.next() => match event {
                        Some(event) => {
                            let lifecycle = LifecycleEvent {
                                name: event.name.clone(),
                            };
                            if tx.send(lifecycle).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    },
                }
            }
        });
        Ok(rx)
    }

    async fn continue_request(
        &self,
        request_id: &str,
        overrides: ContinueRequestOverrides,
    ) -> Result<(), AdapterError> {
        let mut params = ContinueRequestParams::new(request_id.to_string());
        params.url = overrides.url;
        params.method = overrides.method;
        params.headers = overrides.headers.map(convert::to_header_entries);
        params.post_data = overrides
            .post_data
            .map(|bytes| BASE64.encode(bytes).into());
        self.page.execute(params).await.map_err(protocol_err)?;
        Ok(())
    }

    async fn continue_response(
        &self,
        request_id: &str,
        overrides: ContinueResponseOverrides,
    ) -> Result<(), AdapterError> {
        let mut params = ContinueResponseParams::new(request_id.to_string());
        params.response_code = overrides.status.map(|code| code as i64);
        params.response_headers = overrides.headers.map(convert::to_header_entries);
        self.page.execute(params).await.map_err(protocol_err)?;
        Ok(())
    }

    async fn fulfill_request(
        &self,
        request_id: &str,
        response: FulfillResponse,
    ) -> Result<(), AdapterError> {
        let mut params =
            FulfillRequestParams::new(request_id.to_string(), response.status as i64);
        if !response.headers.is_empty() {
            params.response_headers = Some(convert::to_header_entries(response.headers));
        }
        if !response.body.is_empty() {
            params.body = Some(BASE64.encode(&response.body).into());
        }
        self.page.execute(params).await.map_err(protocol_err)?;
        Ok(())
    }

    async fn fail_request(
        &self,
        request_id: &str,
        reason: FailureReason,
    ) -> Result<(), AdapterError> {
        let error_reason = match reason {
            FailureReason::Failed => ErrorReason::Failed,
            FailureReason::Aborted => ErrorReason::Aborted,
            FailureReason::TimedOut => ErrorReason::TimedOut,
            FailureReason::AccessDenied => ErrorReason::AccessDenied,
            FailureReason::BlockedByClient => ErrorReason::BlockedByClient,
        };
        self.page
            .execute(FailRequestParams::new(request_id.to_string(), error_reason))
            .await
            .map_err(protocol_err)?;
        Ok(())
    }

    async fn get_response_body(&self, request_id: &str) -> Result<Vec<u8>, AdapterError> {
        let response = self
            .page
            .execute(GetResponseBodyParams::new(request_id.to_string()))
            .await
            .map_err(protocol_err)?;
        let returns = &response.result;
        if returns.base64_encoded {
            BASE64
                .decode(&returns.body)
                .map_err(|err| AdapterError::Protocol(format!("body decode: {}", err)))
        } else {
            Ok(returns.body.clone().into_bytes())
        }
    }

    async fn close(&self) {
        self.cancel.cancel();
    }
}
