//! Payload serialization.
//!
//! Turns the different shapes a request body can take (in the page, and as
//! reported by the network layer) into the text form that is stored and sent to
//! the presentation layer.

use std::collections::BTreeMap;

use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use url::form_urlencoded;

/// Placeholder stored for binary buffers.
pub const BINARY_PLACEHOLDER: &str = "[Binary Data]";
/// Placeholder stored for blobs.
pub const BLOB_PLACEHOLDER: &str = "[Blob]";
/// Placeholder stored for streams.
pub const STREAM_PLACEHOLDER: &str = "[Stream]";
/// Start of the marker appended to truncated text.
pub const TRUNCATION_MARKER: &str = "\n\n/* truncated ";

/// Characters left as-is by `encodeURIComponent`.
const URI_COMPONENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'!')
    .remove(b'~')
    .remove(b'*')
    .remove(b'\'')
    .remove(b'(')
    .remove(b')');

/// A request payload as handed to fetch or XMLHttpRequest in the page.
#[derive(Debug, Clone, PartialEq)]
pub enum PagePayload {
    Text(String),
    /// URLSearchParams.
    Params(Vec<(String, String)>),
    /// FormData text entries.
    Form(Vec<(String, String)>),
    /// ArrayBuffer or typed array. The bytes are never captured.
    Binary(usize),
    Blob,
    Stream,
    /// Any other structured value.
    Json(Value),
}

/// Serializes a page payload into its captured text form.
pub fn serialize_body(payload: Option<&PagePayload>) -> Option<String> {
    let payload = payload?;
    let text = match payload {
        PagePayload::Text(s) => s.clone(),
        PagePayload::Params(pairs) => encode_pairs(pairs),
        PagePayload::Form(pairs) => encode_form_entries(pairs),
        PagePayload::Binary(_) => BINARY_PLACEHOLDER.to_string(),
        PagePayload::Blob => BLOB_PLACEHOLDER.to_string(),
        PagePayload::Stream => STREAM_PLACEHOLDER.to_string(),
        PagePayload::Json(value) => stringify_value(value),
    };
    Some(text)
}

fn encode_pairs(pairs: &[(String, String)]) -> String {
    form_urlencoded::Serializer::new(String::new())
        .extend_pairs(pairs.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .finish()
}

/// FormData entries are joined as `key=value` pairs, each side encoded the way
/// `encodeURIComponent` does it (space as `%20`).
fn encode_form_entries(pairs: &[(String, String)]) -> String {
    pairs
        .iter()
        .map(|(k, v)| format!("{}={}", encode_uri_component(k), encode_uri_component(v)))
        .collect::<Vec<_>>()
        .join("&")
}

/// Percent-encodes text the way `encodeURIComponent` does.
pub fn encode_uri_component(text: &str) -> String {
    utf8_percent_encode(text, URI_COMPONENT).to_string()
}

/// Returns the JSON text of a value, or its string content for JSON strings.
pub fn stringify_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => serde_json::to_string(other).unwrap_or_else(|_| other.to_string()),
    }
}

/// One raw part of a request body reported by the network layer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawBodyPart {
    #[serde(default)]
    pub bytes: Option<Vec<u8>>,
}

/// Request body structure reported by the network layer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawRequestBody {
    #[serde(default)]
    pub raw: Option<Vec<RawBodyPart>>,
    #[serde(default)]
    pub form_data: Option<BTreeMap<String, Vec<String>>>,
}

/// Decodes the network layer's request body into text.
///
/// Raw parts take precedence over form data. Parts without bytes are skipped.
pub fn decode_request_body(body: Option<&RawRequestBody>) -> Option<String> {
    let body = body?;

    if let Some(parts) = body.raw.as_ref().filter(|p| !p.is_empty()) {
        let text: String = parts
            .iter()
            .filter_map(|p| p.bytes.as_deref())
            .map(String::from_utf8_lossy)
            .collect();
        return Some(text);
    }

    if let Some(form) = &body.form_data {
        let mut serializer = form_urlencoded::Serializer::new(String::new());
        for (key, values) in form {
            for value in values {
                serializer.append_pair(key, value);
            }
        }
        return Some(serializer.finish());
    }

    None
}

/// Normalizes captured text, truncating it to `max_chars` characters.
///
/// Empty input maps to `None`. Truncated text ends with a marker that records
/// how many characters were dropped.
pub fn normalize_payload_text(value: Option<&str>, max_chars: usize) -> Option<String> {
    let value = value.filter(|v| !v.is_empty())?;

    let cut = match value.char_indices().nth(max_chars) {
        Some((idx, _)) => idx,
        None => return Some(value.to_string()),
    };
    let omitted = value[cut..].chars().count();
    Some(format!("{}{TRUNCATION_MARKER}{} chars */", &value[..cut], omitted))
}

/// Text form of a relayed JSON value. Null maps to `None`.
pub fn value_text(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        other => Some(stringify_value(other)),
    }
}

/// Normalizes an arbitrary JSON value into captured text.
///
/// Strings are kept as-is, other values are stringified. Null maps to `None`.
pub fn normalize_value(value: &Value, max_chars: usize) -> Option<String> {
    normalize_payload_text(value_text(value).as_deref(), max_chars)
}
