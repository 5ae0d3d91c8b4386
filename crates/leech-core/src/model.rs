//! Request records tracked by the correlation engine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Opaque, source-assigned identifier of an in-flight network request.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(pub String);

impl RequestId {
    /// Creates a request id.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RequestId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// A request header as reported by the network layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    pub name: String,
    #[serde(default)]
    pub value: String,
}

impl Header {
    /// Creates a header.
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// Resource type reported by the network layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceType {
    /// Top-level navigation.
    MainFrame,
    /// fetch or XMLHttpRequest.
    Xmlhttprequest,
    #[default]
    #[serde(other)]
    Other,
}

/// Display classification of a finalized request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestType {
    Document,
    #[default]
    Fetch,
}

impl RequestType {
    /// Classifies a resource type.
    pub fn from_resource(resource: ResourceType) -> Self {
        match resource {
            ResourceType::MainFrame => Self::Document,
            _ => Self::Fetch,
        }
    }

    /// Returns the wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Document => "document",
            Self::Fetch => "fetch",
        }
    }
}

/// A request seen by the network layer that has not been finalized yet.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingRequest {
    pub request_id: RequestId,
    pub url: String,
    pub method: String,
    pub tab_id: i64,
    pub resource_type: ResourceType,
    /// Request start time.
    pub timestamp: DateTime<Utc>,
    pub headers: Vec<Header>,
    pub body: Option<String>,
    pub response_body: Option<String>,
    pub initiator: String,
    /// Creation order, used to prefer the most recent request on ambiguous matches.
    pub(crate) seq: u64,
}

impl PendingRequest {
    /// Returns true if `url` and `method` identify this request.
    pub fn matches(&self, url: &str, method: &str) -> bool {
        self.method == method && self.url == url
    }

    /// Returns true if the method normally carries a request body.
    pub fn expects_body(&self) -> bool {
        method_carries_body(&self.method)
    }
}

/// Returns true for POST, PUT and PATCH.
pub fn method_carries_body(method: &str) -> bool {
    matches!(method, "POST" | "PUT" | "PATCH")
}

/// A finalized request held by the request store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CapturedRequest {
    /// Locally generated id: epoch milliseconds plus a random fraction.
    pub id: f64,
    pub url: String,
    pub method: String,
    pub headers: Vec<Header>,
    pub body: Option<String>,
    pub response_body: Option<String>,
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "type")]
    pub request_type: RequestType,
    pub tab_id: i64,
    pub initiator: String,
}

impl CapturedRequest {
    /// Generates a new record id for the given instant.
    pub fn generate_id(now: DateTime<Utc>) -> f64 {
        now.timestamp_millis() as f64 + rand::random::<f64>()
    }

    /// Returns the host of the request URL, if it parses.
    pub fn host(&self) -> Option<String> {
        host_of(&self.url)
    }

    /// Returns the host of the initiator, if it parses.
    pub fn initiator_host(&self) -> Option<String> {
        host_of(&self.initiator)
    }
}

/// Extracts the host name of a URL.
pub fn host_of(url: &str) -> Option<String> {
    if url.is_empty() {
        return None;
    }
    url::Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(str::to_string))
}
