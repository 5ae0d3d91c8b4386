//! In-page instrumentation.
//!
//! Models the wrappers installed around `fetch` and `XMLHttpRequest` in the
//! page. Each call produces a body message before the request goes out and a
//! response message once the response text is available. Messages go to a
//! [`PageMessageSink`], normally the relay bridge.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::payload::{serialize_body, PagePayload};

/// Page message type carrying a request body.
pub const BODY_MESSAGE: &str = "API_LEECH_BODY";
/// Page message type carrying a response body.
pub const RESPONSE_MESSAGE: &str = "API_LEECH_RESPONSE";

/// Request body seen in the page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BodyMessage {
    pub url: String,
    pub method: String,
    #[serde(default)]
    pub body: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Response text seen in the page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseMessage {
    pub url: String,
    pub method: String,
    #[serde(default)]
    pub response_body: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// A message posted from the page to the relay bridge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum PageMessage {
    #[serde(rename = "API_LEECH_BODY")]
    Body { data: BodyMessage },
    #[serde(rename = "API_LEECH_RESPONSE")]
    Response { data: ResponseMessage },
}

/// Receives messages posted by the instrumentation.
pub trait PageMessageSink {
    fn post(&self, message: PageMessage);
}

/// First argument of a `fetch` call.
#[derive(Debug, Clone, PartialEq)]
pub enum FetchInput {
    /// A URL string, possibly relative.
    Url(String),
    /// A `Request` object. Its URL is already absolute.
    Request { url: String, method: Option<String> },
}

/// The options argument of a `fetch` call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FetchInit {
    pub method: Option<String>,
    pub body: Option<PagePayload>,
}

/// Identity of an instrumented request, kept until its response arrives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackedCall {
    pub url: String,
    pub method: String,
    pub started_at: DateTime<Utc>,
}

/// Instrumentation for one page.
#[derive(Debug)]
pub struct PageInstrumentation<S> {
    page_url: Option<url::Url>,
    sink: S,
}

impl<S: PageMessageSink> PageInstrumentation<S> {
    /// Instruments a page loaded from `page_url`.
    pub fn new(page_url: &str, sink: S) -> Self {
        Self {
            page_url: url::Url::parse(page_url).ok(),
            sink,
        }
    }

    /// The sink messages are posted to.
    pub fn sink(&self) -> &S {
        &self.sink
    }

    /// Resolves a URL against the page, falling back to the raw string.
    pub fn resolve_url(&self, raw: &str) -> String {
        let resolved = match &self.page_url {
            Some(base) => base.join(raw),
            None => url::Url::parse(raw),
        };
        resolved.map(String::from).unwrap_or_else(|_| raw.to_string())
    }

    /// A `fetch` call is about to be issued. Posts its body message.
    pub fn fetch(
        &self,
        input: &FetchInput,
        init: Option<&FetchInit>,
        now: DateTime<Utc>,
    ) -> TrackedCall {
        let init_method = init.and_then(|i| i.method.as_deref());
        let (url, method) = match input {
            FetchInput::Url(raw) => (self.resolve_url(raw), init_method),
            FetchInput::Request { url, method } => (url.clone(), method.as_deref()),
        };
        let call = TrackedCall {
            url,
            method: normalize_method(method),
            started_at: now,
        };

        self.sink.post(PageMessage::Body {
            data: BodyMessage {
                url: call.url.clone(),
                method: call.method.clone(),
                body: serialize_body(init.and_then(|i| i.body.as_ref())),
                timestamp: now,
            },
        });
        call
    }

    /// A `fetch` response body was read. `None` means reading failed, in which
    /// case nothing is posted.
    pub fn fetch_response(&self, call: &TrackedCall, text: Option<&str>, now: DateTime<Utc>) {
        if let Some(text) = text {
            self.post_response(call, text, now);
        }
    }

    /// `XMLHttpRequest.open`.
    pub fn xhr_open(&self, method: Option<&str>, url: &str, now: DateTime<Utc>) -> TrackedCall {
        TrackedCall {
            url: self.resolve_url(url),
            method: normalize_method(method),
            started_at: now,
        }
    }

    /// `XMLHttpRequest.send`. Posts the body message stamped with the open time.
    pub fn xhr_send(&self, call: &TrackedCall, body: Option<&PagePayload>) {
        self.sink.post(PageMessage::Body {
            data: BodyMessage {
                url: call.url.clone(),
                method: call.method.clone(),
                body: serialize_body(body),
                timestamp: call.started_at,
            },
        });
    }

    /// `XMLHttpRequest` load. Only text responses are reported.
    pub fn xhr_load(
        &self,
        call: &TrackedCall,
        response_type: &str,
        response_text: Option<&str>,
        now: DateTime<Utc>,
    ) {
        if !matches!(response_type, "" | "text") {
            return;
        }
        if let Some(text) = response_text {
            self.post_response(call, text, now);
        }
    }

    fn post_response(&self, call: &TrackedCall, text: &str, now: DateTime<Utc>) {
        self.sink.post(PageMessage::Response {
            data: ResponseMessage {
                url: call.url.clone(),
                method: call.method.clone(),
                response_body: Some(text.to_string()),
                timestamp: now,
            },
        });
    }
}

fn normalize_method(method: Option<&str>) -> String {
    method
        .filter(|m| !m.is_empty())
        .unwrap_or("GET")
        .to_uppercase()
}
