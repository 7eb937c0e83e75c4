//! Neutral traffic model.
//!
//! Protocol-independent request/response shapes plus the paused-event type
//! the interception engine consumes. Header storage is lowercase-keyed;
//! lookups are case-insensitive.

use crate::ids::TargetId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Case-insensitive header map. Keys are canonicalised to lowercase on
/// insert; wire-format capitalization is reconstructed at the adapter
/// boundary where the protocol requires it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Header(BTreeMap<String, String>);

impl Header {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get a header value, ignoring the capitalization of `key`.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(&key.to_ascii_lowercase()).map(String::as_str)
    }

    /// Insert a header value under the lowercased key.
    pub fn set(&mut self, key: &str, value: impl Into<String>) {
        self.0.insert(key.to_ascii_lowercase(), value.into());
    }

    /// Remove a header, ignoring capitalization.
    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.0.remove(&key.to_ascii_lowercase())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(&key.to_ascii_lowercase())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Build a map from wire entries, last entry winning per key.
    pub fn from_entries<'a>(entries: impl IntoIterator<Item = (&'a str, &'a str)>) -> Self {
        let mut h = Self::new();
        for (k, v) in entries {
            h.set(k, v);
        }
        h
    }

    pub fn into_inner(self) -> BTreeMap<String, String> {
        self.0
    }
}

impl<'a> IntoIterator for &'a Header {
    type Item = (&'a String, &'a String);
    type IntoIter = std::collections::btree_map::Iter<'a, String, String>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

/// Which side of the transaction the browser paused.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    #[default]
    Request,
    Response,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Request => "request",
            Stage::Response => "response",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Neutral request model used for observability snapshots.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Request {
    pub url: String,
    pub method: String,
    #[serde(default)]
    pub resource_type: String,
    #[serde(default)]
    pub headers: Header,
    #[serde(default)]
    pub query: BTreeMap<String, String>,
    #[serde(default)]
    pub cookies: BTreeMap<String, String>,
    #[serde(default)]
    pub body: String,
}

/// Neutral response model used for observability snapshots.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Response {
    pub status: u16,
    #[serde(default)]
    pub headers: Header,
    #[serde(default)]
    pub body: String,
}

/// One intercepted transaction as delivered by the adapter. Created per
/// paused callback and consumed exactly once.
#[derive(Debug, Clone)]
pub struct PausedEvent {
    pub request_id: String,
    pub stage: Stage,
    pub url: String,
    pub method: String,
    /// Request headers as delivered on the wire (capitalization preserved).
    pub headers: Vec<(String, String)>,
    pub post_data: Option<String>,
    pub resource_type: String,
    pub response_status: Option<u16>,
    /// Response headers in wire order (response stage only).
    pub response_headers: Vec<(String, String)>,
}

impl PausedEvent {
    /// Case-insensitive lookup over the request header entries.
    pub fn request_header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Case-insensitive lookup over the response header entries.
    pub fn response_header(&self, name: &str) -> Option<&str> {
        self.response_headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// A browser target as reported by the debugging endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetDescriptor {
    pub id: TargetId,
    /// Target kind as reported by the browser ("page", "iframe", ...).
    pub kind: String,
    pub url: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub websocket_url: String,
}

impl TargetDescriptor {
    /// True for HTTP(S) page content, the only targets auto-follow considers.
    pub fn is_user_page(&self) -> bool {
        let url = self.url.to_ascii_lowercase();
        url.starts_with("http://") || url.starts_with("https://")
    }
}

/// Service-facing target listing entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetInfo {
    pub id: TargetId,
    pub kind: String,
    pub url: String,
    pub title: String,
    pub is_current: bool,
    pub is_user: bool,
}

/// Page lifecycle notification from a per-target watcher stream.
#[derive(Debug, Clone)]
pub struct LifecycleEvent {
    pub name: String,
}

impl LifecycleEvent {
    pub fn is_visible(&self) -> bool {
        self.name == "visible"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_case_insensitive() {
        let mut h = Header::new();
        h.set("Content-Type", "text/html");
        assert_eq!(h.get("content-type"), Some("text/html"));
        assert_eq!(h.get("CONTENT-TYPE"), Some("text/html"));

        h.set("content-type", "application/json");
        assert_eq!(h.len(), 1);
        assert_eq!(h.get("Content-Type"), Some("application/json"));

        assert_eq!(h.remove("CoNtEnT-tYpE"), Some("application/json".into()));
        assert!(h.is_empty());
    }

    #[test]
    fn test_header_from_entries_last_wins() {
        let h = Header::from_entries([("X-A", "1"), ("x-a", "2")]);
        assert_eq!(h.len(), 1);
        assert_eq!(h.get("X-A"), Some("2"));
    }

    #[test]
    fn test_paused_event_header_lookup() {
        let ev = PausedEvent {
            request_id: "r1".into(),
            stage: Stage::Request,
            url: "https://a.test/".into(),
            method: "GET".into(),
            headers: vec![("Host".into(), "a.test".into())],
            post_data: None,
            resource_type: "Document".into(),
            response_status: None,
            response_headers: Vec::new(),
        };
        assert_eq!(ev.request_header("host"), Some("a.test"));
        assert_eq!(ev.request_header("HOST"), Some("a.test"));
        assert_eq!(ev.request_header("cookie"), None);
    }

    #[test]
    fn test_user_page_detection() {
        let mut t = TargetDescriptor {
            id: TargetId::new("t1"),
            kind: "page".into(),
            url: "https://example.com".into(),
            title: String::new(),
            websocket_url: String::new(),
        };
        assert!(t.is_user_page());
        t.url = "devtools://devtools/bundled/inspector.html".into();
        assert!(!t.is_user_page());
        t.url = String::new();
        assert!(!t.is_user_page());
    }
}
