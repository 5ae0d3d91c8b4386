//! Engine configuration.
//!
//! Every limit the correlation engine and request store enforce lives here.
//! The defaults are the production values; tests and embedders may tighten them.

use std::time::Duration;

use chrono::TimeDelta;

/// Maximum number of finalized requests kept in the store.
pub const MAX_REQUESTS: usize = 2000;

/// Capacity of each capture buffer (bodies, responses).
pub const MAX_BUFFERED_CAPTURES: usize = 200;

/// How long after completion a POST/PUT/PATCH waits for its body.
pub const FINALIZE_GRACE: Duration = Duration::from_millis(1500);

/// Interval of the staleness sweep.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// Maximum characters kept for a captured request body.
pub const MAX_CAPTURED_BODY_CHARS: usize = 120_000;

/// Maximum characters kept for a captured response body.
pub const MAX_CAPTURED_RESPONSE_CHARS: usize = 1_200_000;

/// Message size ceiling of the presentation transport.
pub const MAX_TRANSPORT_BYTES: usize = 56 * 1024 * 1024;

/// Configuration for the correlation engine and its store.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    /// Store capacity.
    pub max_requests: usize,
    /// Capacity of each capture buffer.
    pub buffer_capacity: usize,
    /// Buffered captures older than this are ignored at lookup.
    pub buffer_relevance: TimeDelta,
    /// Pending requests and buffered captures older than this are swept.
    pub stale_after: TimeDelta,
    /// Sweep period.
    pub sweep_interval: Duration,
    /// Body wait after completion for body-carrying methods.
    pub finalize_grace: Duration,
    /// Window in which a response may attach to an already finalized record.
    pub late_response_window: TimeDelta,
    /// Records with equal url/method/body closer than this are duplicates.
    pub dedup_window: TimeDelta,
    /// Body character cap.
    pub max_body_chars: usize,
    /// Response character cap.
    pub max_response_chars: usize,
    /// Default byte budget for the bounded request view.
    pub max_transport_bytes: usize,
    /// Number of newest records whose responses survive the first reduction step.
    pub privileged_prefix: usize,
    /// Header cap applied by the last lossy reduction step.
    pub header_cap: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_requests: MAX_REQUESTS,
            buffer_capacity: MAX_BUFFERED_CAPTURES,
            buffer_relevance: TimeDelta::seconds(15),
            stale_after: TimeDelta::seconds(30),
            sweep_interval: SWEEP_INTERVAL,
            finalize_grace: FINALIZE_GRACE,
            late_response_window: TimeDelta::seconds(5),
            dedup_window: TimeDelta::seconds(1),
            max_body_chars: MAX_CAPTURED_BODY_CHARS,
            max_response_chars: MAX_CAPTURED_RESPONSE_CHARS,
            max_transport_bytes: MAX_TRANSPORT_BYTES,
            privileged_prefix: 20,
            header_cap: 30,
        }
    }
}

impl EngineConfig {
    /// Sets the store capacity.
    pub fn with_max_requests(mut self, max: usize) -> Self {
        self.max_requests = max;
        self
    }

    /// Sets the default transport budget.
    pub fn with_max_transport_bytes(mut self, bytes: usize) -> Self {
        self.max_transport_bytes = bytes;
        self
    }

    /// Sets the finalize grace period.
    pub fn with_finalize_grace(mut self, grace: Duration) -> Self {
        self.finalize_grace = grace;
        self
    }
}
