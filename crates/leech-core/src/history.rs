//! Request history files.
//!
//! An exported history is a JSON document:
//!
//! ```json
//! { "version": 1, "exportedAt": "2024-01-01T00:00:00Z", "requests": [ ... ] }
//! ```
//!
//! Reading also accepts a bare array of requests. Records are handed to the
//! engine untyped so a malformed entry is dropped rather than failing the file.

use std::fs;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{CoreError, Result};
use crate::model::CapturedRequest;

/// Current history file version.
pub const HISTORY_VERSION: u32 = 1;

/// A history document as written on export.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryFile {
    pub version: u32,
    pub exported_at: DateTime<Utc>,
    pub requests: Vec<CapturedRequest>,
}

impl HistoryFile {
    /// Wraps exported records.
    pub fn new(requests: Vec<CapturedRequest>, exported_at: DateTime<Utc>) -> Self {
        Self {
            version: HISTORY_VERSION,
            exported_at,
            requests,
        }
    }

    /// Writes the document as pretty-printed JSON.
    pub fn write_to(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;
        tracing::info!(path = %path.display(), count = self.requests.len(), "Exported request history");
        Ok(())
    }
}

/// Extracts the untyped request list from a parsed history document.
pub fn parse_history(value: Value) -> Result<Vec<Value>> {
    match value {
        Value::Array(records) => Ok(records),
        Value::Object(mut obj) => {
            if let Some(version) = obj.get("version").and_then(Value::as_u64) {
                if version != u64::from(HISTORY_VERSION) {
                    tracing::warn!(version, "Unknown history version, importing anyway");
                }
            }
            match obj.remove("requests") {
                Some(Value::Array(records)) => Ok(records),
                Some(_) => Err(CoreError::InvalidHistory(
                    "\"requests\" is not a list".to_string(),
                )),
                None => Err(CoreError::InvalidHistory(
                    "missing \"requests\"".to_string(),
                )),
            }
        }
        _ => Err(CoreError::InvalidHistory(
            "expected an object or a list".to_string(),
        )),
    }
}

/// Reads a history file from disk.
pub fn read_history(path: &Path) -> Result<Vec<Value>> {
    let content = fs::read_to_string(path)?;
    let value: Value = serde_json::from_str(&content)?;
    parse_history(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Header, RequestType};
    use serde_json::json;
    use tempfile::TempDir;

    fn record() -> CapturedRequest {
        CapturedRequest {
            id: 1700000000000.25,
            url: "https://a.test/api".into(),
            method: "POST".into(),
            headers: vec![Header::new("Content-Type", "application/json")],
            body: Some("{}".into()),
            response_body: Some("[]".into()),
            timestamp: DateTime::from_timestamp_millis(1_700_000_000_000).unwrap(),
            request_type: RequestType::Fetch,
            tab_id: 7,
            initiator: "https://a.test".into(),
        }
    }

    #[test]
    fn write_then_read() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("history.json");
        let file = HistoryFile::new(vec![record()], Utc::now());
        file.write_to(&path).unwrap();

        let raw: Value = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(raw["version"], 1);
        assert!(raw["exportedAt"].is_string());
        assert_eq!(raw["requests"][0]["tabId"], 7);

        let records = read_history(&path).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0]["responseBody"], "[]");
    }

    #[test]
    fn accepts_bare_array() {
        let records = parse_history(json!([{"url": "u"}, 3])).unwrap();
        assert_eq!(records.len(), 2);
    }

    #[test]
    fn accepts_unknown_version() {
        let records = parse_history(json!({"version": 9, "requests": []})).unwrap();
        assert!(records.is_empty());
    }

    #[test]
    fn rejects_other_shapes() {
        assert!(matches!(
            parse_history(json!({"version": 1})),
            Err(CoreError::InvalidHistory(_))
        ));
        assert!(matches!(
            parse_history(json!({"requests": "nope"})),
            Err(CoreError::InvalidHistory(_))
        ));
        assert!(matches!(
            parse_history(json!("text")),
            Err(CoreError::InvalidHistory(_))
        ));
    }

    #[test]
    fn missing_file_is_io_error() {
        let dir = TempDir::new().unwrap();
        assert!(matches!(
            read_history(&dir.path().join("absent.json")),
            Err(CoreError::Io(_))
        ));
    }
}
