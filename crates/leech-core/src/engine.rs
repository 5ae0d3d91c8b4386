//! Request correlation engine.
//!
//! Joins three unordered sources into finalized request records:
//!
//! - network lifecycle events (start, headers, completion, error),
//! - request bodies captured in the page and relayed to us,
//! - response bodies captured in the page and relayed to us.
//!
//! ## Finalize-or-wait
//!
//! ```text
//! request-completed ──► take buffered response
//!                              │
//!             body needed? ────┴──── no ──────────────► finalize
//!                  │ yes
//!       body present / buffered? ─── yes ─────────────► finalize
//!                  │ no
//!            wait grace period ──► last buffer check ──► finalize
//! ```
//!
//! The engine is a plain state machine. Every method takes the current time
//! explicitly; scheduling the grace timer and the periodic sweep is left to the
//! caller (see [`crate::runtime`]).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::badge::{ActiveTab, BadgeCounter, BadgeSink};
use crate::buffer::{BufferedCaptureEntry, CaptureBuffer};
use crate::config::EngineConfig;
use crate::events::{is_extension_initiator, Command, CommandResponse, NetworkEvent, RequestStart};
use crate::model::{CapturedRequest, Header, PendingRequest, RequestId, RequestType};
use crate::payload::{decode_request_body, normalize_payload_text, value_text};
use crate::store::{InsertOutcome, RequestStore};
use crate::transport::{bounded_view, BoundedViewLimits};

/// What happened when a request completed.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Completion {
    /// The request was finalized immediately.
    Finalized(InsertOutcome),
    /// The request waits for its body; call
    /// [`CorrelationEngine::grace_expired`] after the given delay.
    Deferred(Duration),
    /// No pending request with that id.
    Untracked,
}

/// Where a relayed capture ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureOutcome {
    /// Filled a pending request.
    Pending,
    /// Attached to an already finalized record.
    Stored,
    /// Parked in a buffer for a later request.
    Buffered,
    /// Dropped (no url).
    Ignored,
}

/// Counts of entries removed by a sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepStats {
    pub pending: usize,
    pub bodies: usize,
    pub responses: usize,
}

/// Correlates network events and relayed captures into request records.
pub struct CorrelationEngine {
    config: EngineConfig,
    pending: HashMap<RequestId, PendingRequest>,
    next_seq: u64,
    bodies: CaptureBuffer,
    responses: CaptureBuffer,
    store: RequestStore,
    active_tab: ActiveTab,
    badge: Arc<dyn BadgeSink>,
}

impl std::fmt::Debug for CorrelationEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CorrelationEngine")
            .field("pending", &self.pending.len())
            .field("bodies", &self.bodies.len())
            .field("responses", &self.responses.len())
            .field("stored", &self.store.len())
            .field("active_tab", &self.active_tab)
            .finish()
    }
}

impl Default for CorrelationEngine {
    fn default() -> Self {
        Self::new(EngineConfig::default())
    }
}

impl CorrelationEngine {
    /// Creates an engine with a private badge counter.
    pub fn new(config: EngineConfig) -> Self {
        Self::with_badge(config, Arc::new(BadgeCounter::new()))
    }

    /// Creates an engine reporting badge counts to `badge`.
    pub fn with_badge(config: EngineConfig, badge: Arc<dyn BadgeSink>) -> Self {
        Self {
            bodies: CaptureBuffer::new(config.buffer_capacity, config.buffer_relevance),
            responses: CaptureBuffer::new(config.buffer_capacity, config.buffer_relevance),
            store: RequestStore::new(config.max_requests, config.dedup_window),
            pending: HashMap::new(),
            next_seq: 0,
            active_tab: ActiveTab::default(),
            badge,
            config,
        }
    }

    /// The engine configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// The request store.
    pub fn store(&self) -> &RequestStore {
        &self.store
    }

    /// Looks up a pending request.
    pub fn pending(&self, id: &RequestId) -> Option<&PendingRequest> {
        self.pending.get(id)
    }

    /// Number of pending requests.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Number of buffered bodies and responses.
    pub fn buffered_len(&self) -> (usize, usize) {
        (self.bodies.len(), self.responses.len())
    }

    // ==================== Network events ====================

    /// Dispatches a network or tab event.
    ///
    /// Returns the completion outcome for `RequestCompleted`, `None` otherwise.
    pub fn handle_event(&mut self, event: NetworkEvent, now: DateTime<Utc>) -> Option<Completion> {
        match event {
            NetworkEvent::RequestStarted(start) => {
                self.request_started(start);
                None
            }
            NetworkEvent::HeadersSent {
                request_id,
                headers,
            } => {
                self.headers_sent(&request_id, headers);
                None
            }
            NetworkEvent::RequestCompleted { request_id } => {
                Some(self.request_completed(&request_id, now))
            }
            NetworkEvent::RequestErrored { request_id } => {
                self.request_errored(&request_id);
                None
            }
            NetworkEvent::TabActivated { tab_id, url } => {
                self.tab_activated(tab_id, url.as_deref());
                None
            }
            NetworkEvent::TabUpdated { tab_id, url } => {
                self.tab_updated(tab_id, url.as_deref());
                None
            }
        }
    }

    /// Starts tracking a request.
    ///
    /// Returns false if the request was discarded: extension traffic, or an id
    /// that is already pending.
    pub fn request_started(&mut self, start: RequestStart) -> bool {
        if is_extension_initiator(start.initiator.as_deref()) {
            tracing::trace!(url = %start.url, "Ignoring extension request");
            return false;
        }
        if self.pending.contains_key(&start.request_id) {
            tracing::debug!(request_id = %start.request_id, "Request already pending");
            return false;
        }

        let body = normalize_payload_text(
            decode_request_body(start.request_body.as_ref()).as_deref(),
            self.config.max_body_chars,
        );
        let seq = self.next_seq;
        self.next_seq += 1;

        self.pending.insert(
            start.request_id.clone(),
            PendingRequest {
                request_id: start.request_id,
                url: start.url,
                method: start.method,
                tab_id: start.tab_id,
                resource_type: start.resource_type,
                timestamp: start.timestamp,
                headers: Vec::new(),
                body,
                response_body: None,
                initiator: start.initiator.unwrap_or_default(),
                seq,
            },
        );
        true
    }

    /// Attaches request headers. Unknown ids are ignored.
    pub fn headers_sent(&mut self, id: &RequestId, headers: Vec<Header>) -> bool {
        match self.pending.get_mut(id) {
            Some(pending) => {
                pending.headers = headers;
                true
            }
            None => false,
        }
    }

    /// Drops a request that failed at the network layer.
    pub fn request_errored(&mut self, id: &RequestId) -> bool {
        self.pending.remove(id).is_some()
    }

    /// Runs finalize-or-wait for a completed request.
    pub fn request_completed(&mut self, id: &RequestId, now: DateTime<Utc>) -> Completion {
        let Some(pending) = self.pending.get_mut(id) else {
            return Completion::Untracked;
        };

        if let Some(response) = self.responses.take(&pending.url, &pending.method, now) {
            tracing::debug!(url = %pending.url, "Matched buffered response on completion");
            pending.response_body = Some(response);
        }

        if !pending.expects_body() || pending.body.is_some() {
            let outcome = self.finalize(id, now).unwrap_or(InsertOutcome::Duplicate);
            return Completion::Finalized(outcome);
        }

        if let Some(body) = self.bodies.take(&pending.url, &pending.method, now) {
            tracing::debug!(url = %pending.url, "Matched buffered body on completion");
            pending.body = Some(body);
            let outcome = self.finalize(id, now).unwrap_or(InsertOutcome::Duplicate);
            return Completion::Finalized(outcome);
        }

        tracing::trace!(request_id = %id, "Waiting for relayed body");
        Completion::Deferred(self.config.finalize_grace)
    }

    /// Finalizes a request whose grace period ran out.
    ///
    /// The body buffer is checked one last time. Returns `None` if the request
    /// is no longer pending.
    pub fn grace_expired(&mut self, id: &RequestId, now: DateTime<Utc>) -> Option<InsertOutcome> {
        let pending = self.pending.get_mut(id)?;
        if pending.body.is_none() {
            if let Some(body) = self.bodies.take(&pending.url, &pending.method, now) {
                tracing::debug!(url = %pending.url, "Matched buffered body after grace period");
                pending.body = Some(body);
            }
        }
        self.finalize(id, now)
    }

    fn finalize(&mut self, id: &RequestId, now: DateTime<Utc>) -> Option<InsertOutcome> {
        let pending = self.pending.remove(id)?;
        let record = CapturedRequest {
            id: CapturedRequest::generate_id(now),
            url: pending.url,
            method: pending.method,
            headers: pending.headers,
            body: pending.body,
            response_body: pending.response_body,
            timestamp: pending.timestamp,
            request_type: RequestType::from_resource(pending.resource_type),
            tab_id: pending.tab_id,
            initiator: pending.initiator,
        };

        let outcome = self.store.insert(record);
        match outcome {
            InsertOutcome::Inserted(_) => self.update_badge(),
            InsertOutcome::Duplicate => {
                tracing::debug!(request_id = %id, "Dropped duplicate request");
            }
        }
        Some(outcome)
    }

    // ==================== Relayed captures ====================

    /// Handles a request body relayed from the page.
    pub fn capture_body(
        &mut self,
        url: &str,
        method: &str,
        body: Option<&str>,
        now: DateTime<Utc>,
    ) -> CaptureOutcome {
        if url.is_empty() {
            return CaptureOutcome::Ignored;
        }
        let method = method.to_uppercase();
        let body = normalize_payload_text(body, self.config.max_body_chars);

        if let Some(pending) = newest_pending(&mut self.pending, |r| {
            r.body.is_none() && r.matches(url, &method)
        }) {
            tracing::debug!(url, method = %method, "Relayed body filled pending request");
            pending.body = body;
            return CaptureOutcome::Pending;
        }

        self.bodies.push(BufferedCaptureEntry {
            url: url.to_string(),
            method,
            data: body,
            inserted_at: now,
        });
        CaptureOutcome::Buffered
    }

    /// Handles a response body relayed from the page.
    pub fn capture_response(
        &mut self,
        url: &str,
        method: &str,
        response: Option<&str>,
        now: DateTime<Utc>,
    ) -> CaptureOutcome {
        if url.is_empty() {
            return CaptureOutcome::Ignored;
        }
        let method = method.to_uppercase();
        let response = normalize_payload_text(response, self.config.max_response_chars);

        if let Some(pending) = newest_pending(&mut self.pending, |r| {
            r.response_body.is_none() && r.matches(url, &method)
        }) {
            tracing::debug!(url, method = %method, "Relayed response filled pending request");
            pending.response_body = response;
            return CaptureOutcome::Pending;
        }

        if self.store.attach_recent_response(
            url,
            &method,
            response.clone(),
            now,
            self.config.late_response_window,
        ) {
            tracing::debug!(url, method = %method, "Relayed response attached to stored request");
            return CaptureOutcome::Stored;
        }

        self.responses.push(BufferedCaptureEntry {
            url: url.to_string(),
            method,
            data: response,
            inserted_at: now,
        });
        CaptureOutcome::Buffered
    }

    /// Attaches top-level document content to its stored document request.
    pub fn capture_document(&mut self, url: &str, content: &str) -> bool {
        if url.is_empty() {
            return false;
        }
        let content = normalize_payload_text(Some(content), self.config.max_response_chars);
        let attached = self.store.attach_document(url, content);
        if attached {
            tracing::debug!(url, "Document content attached");
        }
        attached
    }

    // ==================== Maintenance ====================

    /// Drops pending requests and buffered captures older than the staleness
    /// threshold.
    pub fn sweep(&mut self, now: DateTime<Utc>) -> SweepStats {
        let stale_after = self.config.stale_after;
        let before = self.pending.len();
        self.pending.retain(|_, r| now - r.timestamp <= stale_after);

        let stats = SweepStats {
            pending: before - self.pending.len(),
            bodies: self.bodies.sweep(now, stale_after),
            responses: self.responses.sweep(now, stale_after),
        };
        if stats != SweepStats::default() {
            tracing::debug!(
                pending = stats.pending,
                bodies = stats.bodies,
                responses = stats.responses,
                "Swept stale captures"
            );
        }
        stats
    }

    // ==================== Tabs and badge ====================

    /// Records the newly active tab.
    pub fn tab_activated(&mut self, tab_id: i64, url: Option<&str>) {
        self.active_tab.activate(tab_id, url);
        self.update_badge();
    }

    /// Records a URL change of a tab.
    pub fn tab_updated(&mut self, tab_id: i64, url: Option<&str>) {
        if self.active_tab.update(tab_id, url) {
            self.update_badge();
        }
    }

    /// Number of stored requests belonging to the active site.
    pub fn active_site_count(&self) -> usize {
        self.active_tab
            .hostname()
            .map(|host| self.store.count_for_host(host))
            .unwrap_or(0)
    }

    fn update_badge(&self) {
        self.badge.set_count(self.active_site_count());
    }

    // ==================== Store queries ====================

    /// Every stored record, newest first.
    pub fn get_all(&self) -> Vec<CapturedRequest> {
        self.store.get_all()
    }

    /// Every stored record, for writing a history file.
    pub fn export(&self) -> Vec<CapturedRequest> {
        self.store.get_all()
    }

    /// Stored records reduced until their serialized form fits `max_bytes`.
    pub fn get_bounded(&self, max_bytes: usize) -> Vec<CapturedRequest> {
        let records = self.store.get_all();
        bounded_view(
            &records,
            BoundedViewLimits {
                max_bytes,
                privileged_prefix: self.config.privileged_prefix,
                header_cap: self.config.header_cap,
            },
        )
    }

    /// Empties the store.
    pub fn clear(&mut self) {
        self.store.clear();
        self.update_badge();
    }

    /// Replaces the store with sanitized external records.
    pub fn import_batch(&mut self, raw: &[Value], now: DateTime<Utc>) -> usize {
        let count = self.store.import_batch(
            raw,
            now,
            self.config.max_body_chars,
            self.config.max_response_chars,
        );
        self.update_badge();
        count
    }

    // ==================== Commands ====================

    /// Handles a command from the relay bridge or the presentation layer.
    pub fn handle_command(&mut self, command: Command, now: DateTime<Utc>) -> CommandResponse {
        match command {
            Command::CaptureBody { data } => {
                if let Some(data) = data {
                    let body = data.body.as_ref().and_then(value_text);
                    self.capture_body(
                        data.url.as_deref().unwrap_or_default(),
                        data.method.as_deref().unwrap_or_default(),
                        body.as_deref(),
                        now,
                    );
                }
                CommandResponse::ok()
            }
            Command::CaptureResponse { data } => {
                if let Some(data) = data {
                    let response = data.response_body.as_ref().and_then(value_text);
                    self.capture_response(
                        data.url.as_deref().unwrap_or_default(),
                        data.method.as_deref().unwrap_or_default(),
                        response.as_deref(),
                        now,
                    );
                }
                CommandResponse::ok()
            }
            Command::CaptureDocumentContent { data } => {
                if let Some(data) = data {
                    if let (Some(url), Some(content)) = (data.url, data.response_body) {
                        self.capture_document(&url, &content);
                    }
                }
                CommandResponse::ok()
            }
            Command::GetRequests => CommandResponse::Requests {
                requests: self.get_bounded(self.config.max_transport_bytes),
            },
            Command::GetRequestsForExport => CommandResponse::Requests {
                requests: self.export(),
            },
            Command::ClearRequests => {
                self.clear();
                tracing::info!("Request history cleared");
                CommandResponse::ok()
            }
            Command::ImportHistory { requests } => {
                let count = match requests {
                    Some(Value::Array(list)) if !list.is_empty() => self.import_batch(&list, now),
                    _ => {
                        self.clear();
                        0
                    }
                };
                tracing::info!(count, "Imported request history");
                CommandResponse::Imported {
                    success: true,
                    count,
                }
            }
        }
    }
}

/// Returns the most recently created pending request satisfying `pred`.
fn newest_pending<'a>(
    pending: &'a mut HashMap<RequestId, PendingRequest>,
    pred: impl Fn(&PendingRequest) -> bool,
) -> Option<&'a mut PendingRequest> {
    pending
        .values_mut()
        .filter(|r| pred(r))
        .max_by_key(|r| r.seq)
}
