//! Time-windowed buffers for captures that arrived before their request.
//!
//! The in-page channel and the network layer race each other. A body or
//! response that cannot be matched when it arrives is parked here and consumed
//! by the first request that asks for the same `(url, method)`.

use std::collections::VecDeque;

use chrono::{DateTime, TimeDelta, Utc};

/// A capture waiting for its request.
#[derive(Debug, Clone, PartialEq)]
pub struct BufferedCaptureEntry {
    pub url: String,
    pub method: String,
    pub data: Option<String>,
    pub inserted_at: DateTime<Utc>,
}

/// Bounded FIFO of unmatched captures.
#[derive(Debug, Clone)]
pub struct CaptureBuffer {
    entries: VecDeque<BufferedCaptureEntry>,
    capacity: usize,
    relevance: TimeDelta,
}

impl CaptureBuffer {
    /// Creates a buffer holding at most `capacity` entries, matching only
    /// entries younger than `relevance`.
    pub fn new(capacity: usize, relevance: TimeDelta) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity.min(256)),
            capacity,
            relevance,
        }
    }

    /// Appends an entry, evicting the oldest one when full.
    pub fn push(&mut self, entry: BufferedCaptureEntry) {
        self.entries.push_back(entry);
        while self.entries.len() > self.capacity {
            self.entries.pop_front();
        }
    }

    /// Removes the newest relevant entry for `(url, method)` and returns its
    /// data.
    ///
    /// An entry that matched but carried no data is still consumed.
    pub fn take(&mut self, url: &str, method: &str, now: DateTime<Utc>) -> Option<String> {
        let idx = self.entries.iter().rposition(|e| {
            now - e.inserted_at <= self.relevance && e.method == method && e.url == url
        })?;
        self.entries.remove(idx).and_then(|e| e.data)
    }

    /// Drops entries older than `max_age`, oldest first.
    ///
    /// Returns the number of entries removed.
    pub fn sweep(&mut self, now: DateTime<Utc>, max_age: TimeDelta) -> usize {
        let before = self.entries.len();
        while self
            .entries
            .front()
            .is_some_and(|e| now - e.inserted_at > max_age)
        {
            self.entries.pop_front();
        }
        before - self.entries.len()
    }

    /// Number of buffered entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if nothing is buffered.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterates entries oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &BufferedCaptureEntry> {
        self.entries.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(ms: i64) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(ms).unwrap()
    }

    fn entry(url: &str, method: &str, data: &str, ms: i64) -> BufferedCaptureEntry {
        BufferedCaptureEntry {
            url: url.into(),
            method: method.into(),
            data: Some(data.into()),
            inserted_at: at(ms),
        }
    }

    fn buffer() -> CaptureBuffer {
        CaptureBuffer::new(3, TimeDelta::seconds(15))
    }

    #[test]
    fn take_consumes_once() {
        let mut buf = buffer();
        buf.push(entry("https://a.test/x", "POST", "a=1", 0));

        assert_eq!(
            buf.take("https://a.test/x", "POST", at(100)),
            Some("a=1".to_string())
        );
        assert_eq!(buf.take("https://a.test/x", "POST", at(100)), None);
        assert!(buf.is_empty());
    }

    #[test]
    fn take_prefers_newest() {
        let mut buf = buffer();
        buf.push(entry("u", "GET", "old", 0));
        buf.push(entry("u", "GET", "new", 10));

        assert_eq!(buf.take("u", "GET", at(20)), Some("new".to_string()));
        assert_eq!(buf.take("u", "GET", at(20)), Some("old".to_string()));
    }

    #[test]
    fn take_requires_method_and_url() {
        let mut buf = buffer();
        buf.push(entry("u", "GET", "x", 0));
        assert_eq!(buf.take("u", "POST", at(1)), None);
        assert_eq!(buf.take("v", "GET", at(1)), None);
        assert_eq!(buf.len(), 1);
    }

    #[test]
    fn take_ignores_entries_past_relevance() {
        let mut buf = buffer();
        buf.push(entry("u", "GET", "x", 0));
        assert_eq!(buf.take("u", "GET", at(15_001)), None);
        // Still present until swept.
        assert_eq!(buf.len(), 1);
        assert_eq!(buf.take("u", "GET", at(15_000)), Some("x".to_string()));
    }

    #[test]
    fn capacity_evicts_oldest() {
        let mut buf = buffer();
        for i in 0..4 {
            buf.push(entry(&format!("u{i}"), "GET", "x", i));
        }
        assert_eq!(buf.len(), 3);
        assert_eq!(buf.iter().next().unwrap().url, "u1");
    }

    #[test]
    fn sweep_drops_old_entries() {
        let mut buf = buffer();
        buf.push(entry("a", "GET", "x", 0));
        buf.push(entry("b", "GET", "x", 20_000));

        let removed = buf.sweep(at(30_001), TimeDelta::seconds(30));
        assert_eq!(removed, 1);
        assert_eq!(buf.iter().next().unwrap().url, "b");
    }
}
