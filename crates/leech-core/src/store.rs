//! In-memory request store.
//!
//! Holds finalized requests newest-first, capped, and never persisted. Only the
//! correlation engine mutates it.

use std::collections::VecDeque;

use chrono::{DateTime, TimeDelta, Utc};
use serde_json::Value;

use crate::model::{CapturedRequest, Header, RequestType};
use crate::payload::normalize_value;

/// Result of inserting a record.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum InsertOutcome {
    /// Stored under the given id.
    Inserted(f64),
    /// Dropped as a duplicate of a recent record.
    Duplicate,
}

/// Capped, newest-first list of captured requests.
#[derive(Debug, Clone)]
pub struct RequestStore {
    records: VecDeque<CapturedRequest>,
    capacity: usize,
    dedup_window: TimeDelta,
}

impl RequestStore {
    /// Creates an empty store.
    pub fn new(capacity: usize, dedup_window: TimeDelta) -> Self {
        Self {
            records: VecDeque::new(),
            capacity,
            dedup_window,
        }
    }

    /// Inserts a record at the front unless it duplicates a recent one.
    ///
    /// A duplicate has the same url, method and body and a timestamp closer
    /// than the dedup window. The tail is truncated to capacity.
    pub fn insert(&mut self, record: CapturedRequest) -> InsertOutcome {
        if self.is_duplicate(&record) {
            return InsertOutcome::Duplicate;
        }
        let id = record.id;
        self.records.push_front(record);
        self.records.truncate(self.capacity);
        InsertOutcome::Inserted(id)
    }

    fn is_duplicate(&self, candidate: &CapturedRequest) -> bool {
        self.records.iter().any(|r| {
            r.url == candidate.url
                && r.method == candidate.method
                && r.body == candidate.body
                && (r.timestamp - candidate.timestamp).abs() < self.dedup_window
        })
    }

    /// Attaches a response to the newest matching record finalized within
    /// `window` of `now` that has no response yet.
    ///
    /// Returns true if a record took the response.
    pub fn attach_recent_response(
        &mut self,
        url: &str,
        method: &str,
        response: Option<String>,
        now: DateTime<Utc>,
        window: TimeDelta,
    ) -> bool {
        let found = self.records.iter_mut().find(|r| {
            r.response_body.is_none()
                && r.method == method
                && r.url == url
                && now - r.timestamp < window
        });
        match found {
            Some(record) => {
                record.response_body = response;
                true
            }
            None => false,
        }
    }

    /// Attaches page content to the newest document record for `url` that has
    /// no response yet.
    pub fn attach_document(&mut self, url: &str, content: Option<String>) -> bool {
        let found = self.records.iter_mut().find(|r| {
            r.request_type == RequestType::Document && r.url == url && r.response_body.is_none()
        });
        match found {
            Some(record) => {
                record.response_body = content;
                true
            }
            None => false,
        }
    }

    /// Removes every record.
    pub fn clear(&mut self) {
        self.records.clear();
    }

    /// Replaces the contents with sanitized copies of externally supplied
    /// records. Entries that are not objects are dropped.
    ///
    /// Returns the number of records kept.
    pub fn import_batch(
        &mut self,
        raw: &[Value],
        now: DateTime<Utc>,
        max_body_chars: usize,
        max_response_chars: usize,
    ) -> usize {
        self.records = raw
            .iter()
            .filter_map(|r| sanitize_record(r, now, max_body_chars, max_response_chars))
            .take(self.capacity)
            .collect();
        self.records.len()
    }

    /// Returns all records, newest first.
    pub fn get_all(&self) -> Vec<CapturedRequest> {
        self.records.iter().cloned().collect()
    }

    /// Iterates records, newest first.
    pub fn iter(&self) -> impl Iterator<Item = &CapturedRequest> {
        self.records.iter()
    }

    /// Number of stored records.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Returns true if the store is empty.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Counts records whose url or initiator belongs to `host`.
    pub fn count_for_host(&self, host: &str) -> usize {
        if host.is_empty() {
            return 0;
        }
        self.records
            .iter()
            .filter(|r| {
                r.initiator_host().as_deref() == Some(host) || r.host().as_deref() == Some(host)
            })
            .count()
    }
}

/// Builds a well-formed record from an untyped one, defaulting missing fields.
pub fn sanitize_record(
    raw: &Value,
    now: DateTime<Utc>,
    max_body_chars: usize,
    max_response_chars: usize,
) -> Option<CapturedRequest> {
    let obj = raw.as_object()?;

    let text = |key: &str| obj.get(key).and_then(Value::as_str).filter(|s| !s.is_empty());

    let id = obj
        .get("id")
        .and_then(Value::as_f64)
        .unwrap_or_else(|| CapturedRequest::generate_id(now));

    let headers = obj
        .get("headers")
        .and_then(Value::as_array)
        .map(|list| {
            list.iter()
                .filter_map(|h| serde_json::from_value::<Header>(h.clone()).ok())
                .collect()
        })
        .unwrap_or_default();

    let timestamp = text("timestamp")
        .and_then(|t| DateTime::parse_from_rfc3339(t).ok())
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or(now);

    let request_type = match text("type") {
        Some("document") => RequestType::Document,
        _ => RequestType::Fetch,
    };

    Some(CapturedRequest {
        id,
        url: text("url").unwrap_or_default().to_string(),
        method: text("method").unwrap_or("GET").to_string(),
        headers,
        body: obj
            .get("body")
            .and_then(|v| normalize_value(v, max_body_chars)),
        response_body: obj
            .get("responseBody")
            .and_then(|v| normalize_value(v, max_response_chars)),
        timestamp,
        request_type,
        tab_id: obj.get("tabId").and_then(Value::as_i64).unwrap_or(-1),
        initiator: text("initiator").unwrap_or_default().to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn at(ms: i64) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(ms).unwrap()
    }

    fn record(url: &str, method: &str, body: Option<&str>, ms: i64) -> CapturedRequest {
        CapturedRequest {
            id: ms as f64,
            url: url.into(),
            method: method.into(),
            headers: vec![],
            body: body.map(str::to_string),
            response_body: None,
            timestamp: at(ms),
            request_type: RequestType::Fetch,
            tab_id: 1,
            initiator: String::new(),
        }
    }

    fn store() -> RequestStore {
        RequestStore::new(2000, TimeDelta::seconds(1))
    }

    #[test]
    fn insert_is_newest_first() {
        let mut s = store();
        s.insert(record("https://a.test/1", "GET", None, 0));
        s.insert(record("https://a.test/2", "GET", None, 5000));
        let urls: Vec<_> = s.iter().map(|r| r.url.as_str()).collect();
        assert_eq!(urls, vec!["https://a.test/2", "https://a.test/1"]);
    }

    #[test]
    fn duplicate_within_a_second_is_dropped() {
        let mut s = store();
        assert!(matches!(
            s.insert(record("u", "POST", Some("a=1"), 1000)),
            InsertOutcome::Inserted(_)
        ));
        assert_eq!(
            s.insert(record("u", "POST", Some("a=1"), 1999)),
            InsertOutcome::Duplicate
        );
        assert_eq!(s.len(), 1);
    }

    #[test]
    fn different_body_or_time_is_not_duplicate() {
        let mut s = store();
        s.insert(record("u", "POST", Some("a=1"), 1000));
        s.insert(record("u", "POST", Some("a=2"), 1000));
        s.insert(record("u", "POST", Some("a=1"), 2000));
        s.insert(record("u", "POST", None, 1000));
        assert_eq!(s.len(), 4);
    }

    #[test]
    fn cap_truncates_oldest() {
        let mut s = RequestStore::new(3, TimeDelta::seconds(1));
        for i in 0..5 {
            s.insert(record(&format!("u{i}"), "GET", None, i * 2000));
        }
        let urls: Vec<_> = s.iter().map(|r| r.url.as_str()).collect();
        assert_eq!(urls, vec!["u4", "u3", "u2"]);
    }

    #[test]
    fn recent_response_attaches_within_window() {
        let mut s = store();
        s.insert(record("u", "GET", None, 1000));
        let window = TimeDelta::seconds(5);

        assert!(!s.attach_recent_response("u", "GET", Some("late".into()), at(6000), window));
        assert!(s.attach_recent_response("u", "GET", Some("ok".into()), at(5999), window));
        assert_eq!(s.iter().next().unwrap().response_body.as_deref(), Some("ok"));
        // Already filled.
        assert!(!s.attach_recent_response("u", "GET", Some("again".into()), at(2000), window));
    }

    #[test]
    fn document_content_attaches_to_document_only() {
        let mut s = store();
        s.insert(record("https://a.test/", "GET", None, 0));
        assert!(!s.attach_document("https://a.test/", Some("<html>".into())));

        let mut doc = record("https://a.test/", "GET", None, 5000);
        doc.request_type = RequestType::Document;
        s.insert(doc);
        assert!(s.attach_document("https://a.test/", Some("<html>".into())));
        assert!(!s.attach_document("https://a.test/", Some("<html2>".into())));
    }

    #[test]
    fn import_sanitizes_and_caps() {
        let mut s = RequestStore::new(2, TimeDelta::seconds(1));
        let raw = vec![
            json!({"url": "https://a.test", "method": "POST", "body": {"k": 1}, "tabId": 4, "type": "document", "id": 7.5}),
            json!("garbage"),
            json!({}),
            json!({"url": "https://c.test"}),
        ];
        let count = s.import_batch(&raw, at(42), 100, 100);
        assert_eq!(count, 2);

        let all = s.get_all();
        assert_eq!(all[0].url, "https://a.test");
        assert_eq!(all[0].body.as_deref(), Some("{\"k\":1}"));
        assert_eq!(all[0].request_type, RequestType::Document);
        assert_eq!(all[0].tab_id, 4);
        assert_eq!(all[0].id, 7.5);

        assert_eq!(all[1].url, "");
        assert_eq!(all[1].method, "GET");
        assert_eq!(all[1].tab_id, -1);
        assert_eq!(all[1].timestamp, at(42));
    }

    #[test]
    fn sanitize_parses_timestamp_and_headers() {
        let raw = json!({
            "url": "u",
            "timestamp": "2024-01-02T03:04:05.000Z",
            "headers": [{"name": "A", "value": "1"}, 5, {"value": "no name"}],
            "responseBody": "",
        });
        let r = sanitize_record(&raw, at(0), 10, 10).unwrap();
        assert_eq!(r.timestamp.to_rfc3339(), "2024-01-02T03:04:05+00:00");
        assert_eq!(r.headers, vec![Header::new("A", "1")]);
        assert_eq!(r.response_body, None);
    }

    #[test]
    fn count_for_host_matches_url_or_initiator() {
        let mut s = store();
        s.insert(record("https://a.test/x", "GET", None, 0));
        let mut other = record("https://cdn.test/y", "GET", None, 5000);
        other.initiator = "https://a.test".into();
        s.insert(other);
        s.insert(record("https://b.test/z", "GET", None, 10_000));

        assert_eq!(s.count_for_host("a.test"), 2);
        assert_eq!(s.count_for_host("b.test"), 1);
        assert_eq!(s.count_for_host(""), 0);
    }
}
