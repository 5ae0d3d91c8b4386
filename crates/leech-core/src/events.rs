//! Inbound events and commands consumed by the correlation engine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::model::{CapturedRequest, Header, RequestId, ResourceType};
use crate::payload::RawRequestBody;

/// Initiator prefixes of extension pages. Their traffic is never captured.
pub const EXTENSION_SCHEMES: &[&str] = &[
    "chrome-extension://",
    "moz-extension://",
    "safari-web-extension://",
];

/// Returns true if the initiator is an extension origin.
pub fn is_extension_initiator(initiator: Option<&str>) -> bool {
    initiator.is_some_and(|i| EXTENSION_SCHEMES.iter().any(|s| i.starts_with(s)))
}

/// A request observed starting at the network layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestStart {
    pub request_id: RequestId,
    pub url: String,
    pub method: String,
    #[serde(default = "unknown_tab")]
    pub tab_id: i64,
    #[serde(default)]
    pub resource_type: ResourceType,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub initiator: Option<String>,
    #[serde(default)]
    pub request_body: Option<RawRequestBody>,
}

fn unknown_tab() -> i64 {
    -1
}

/// Network lifecycle and tab events from the host platform.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum NetworkEvent {
    RequestStarted(RequestStart),
    #[serde(rename_all = "camelCase")]
    HeadersSent {
        request_id: RequestId,
        #[serde(default)]
        headers: Vec<Header>,
    },
    #[serde(rename_all = "camelCase")]
    RequestCompleted { request_id: RequestId },
    #[serde(rename_all = "camelCase")]
    RequestErrored { request_id: RequestId },
    #[serde(rename_all = "camelCase")]
    TabActivated {
        tab_id: i64,
        #[serde(default)]
        url: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    TabUpdated {
        tab_id: i64,
        #[serde(default)]
        url: Option<String>,
    },
}

/// Relayed request body capture.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BodyCapture {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub body: Option<Value>,
}

/// Relayed response capture.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseCapture {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub response_body: Option<Value>,
}

/// Relayed top-level document content.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentCapture {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub response_body: Option<String>,
}

/// Commands from the relay bridge and the presentation layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "camelCase")]
pub enum Command {
    CaptureBody {
        #[serde(default)]
        data: Option<BodyCapture>,
    },
    CaptureResponse {
        #[serde(default)]
        data: Option<ResponseCapture>,
    },
    CaptureDocumentContent {
        #[serde(default)]
        data: Option<DocumentCapture>,
    },
    GetRequests,
    GetRequestsForExport,
    ClearRequests,
    ImportHistory {
        #[serde(default)]
        requests: Option<Value>,
    },
}

impl Command {
    /// Returns the wire name of the command.
    pub fn action(&self) -> &'static str {
        match self {
            Self::CaptureBody { .. } => "captureBody",
            Self::CaptureResponse { .. } => "captureResponse",
            Self::CaptureDocumentContent { .. } => "captureDocumentContent",
            Self::GetRequests => "getRequests",
            Self::GetRequestsForExport => "getRequestsForExport",
            Self::ClearRequests => "clearRequests",
            Self::ImportHistory { .. } => "importHistory",
        }
    }
}

/// Reply to a [`Command`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CommandResponse {
    Imported { success: bool, count: usize },
    Requests { requests: Vec<CapturedRequest> },
    Ack { success: bool },
}

impl CommandResponse {
    /// Plain acknowledgement.
    pub fn ok() -> Self {
        Self::Ack { success: true }
    }
}
