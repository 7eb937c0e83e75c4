//! Conversions between DevTools wire types and the neutral model.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use chromiumoxide::cdp::browser_protocol::fetch::{EventRequestPaused, HeaderEntry};
use refract_common::{PausedEvent, Stage};

/// Convert a `Fetch.requestPaused` event into the neutral paused event.
/// A populated response status marks the response stage, matching the
/// protocol's contract for response-stage pauses.
pub(crate) fn to_paused_event(ev: &EventRequestPaused) -> PausedEvent {
    let mut headers = Vec::new();
    if let Some(object) = ev.request.headers.inner().as_object() {
        for (name, value) in object {
            let value = match value {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            headers.push((name.clone(), value));
        }
    }

    let response_headers = ev
        .response_headers
        .as_ref()
        .map(|entries| {
            entries
                .iter()
                .map(|h| (h.name.clone(), h.value.clone()))
                .collect()
        })
        .unwrap_or_default();

    let stage = if ev.response_status_code.is_some() {
        Stage::Response
    } else {
        Stage::Request
    };

    PausedEvent {
        request_id: ev.request_id.as_ref().to_string(),
        stage,
        url: ev.request.url.clone(),
        method: ev.request.method.clone(),
        headers,
        post_data: ev.request.post_data_entries.as_ref().map(|entries| {
            entries
                .iter()
                .filter_map(|entry| entry.bytes.as_ref())
                .filter_map(|bytes| BASE64.decode(bytes.as_ref() as &str).ok())
                .map(|decoded| String::from_utf8_lossy(&decoded).into_owned())
                .collect::<String>()
        }),
        resource_type: ev.resource_type.as_ref().to_string(),
        response_status: ev.response_status_code.map(|code| code as u16),
        response_headers,
    }
}

/// Render `(name, value)` pairs as wire header entries, preserving the
/// supplied capitalization.
pub(crate) fn to_header_entries(pairs: Vec<(String, String)>) -> Vec<HeaderEntry> {
    pairs
        .into_iter()
        .map(|(name, value)| HeaderEntry { name, value })
        .collect()
}
