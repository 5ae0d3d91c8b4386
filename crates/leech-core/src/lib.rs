//! Leech Core - passive request capture and correlation.
//!
//! This crate joins what a web page sends and receives, seen from two sides,
//! into one deduplicated request history:
//!
//! - the network layer reports request lifecycles (start, headers, completion)
//!   and, sometimes, the raw request body;
//! - instrumentation inside the page sees request and response bodies and
//!   relays them over a separate channel.
//!
//! Neither side is ordered relative to the other. The [`engine`] matches them
//! by `(url, method)`, parks early arrivals in short-lived buffers, and gives
//! body-carrying requests a grace period before finalizing them.
//!
//! ## Architecture
//!
//! ```text
//! page ─► shim ─► relay ─┐
//!                        ├─► engine task ─► store ─► bounded view / export
//! network events ────────┘        │
//!                                 └─► badge
//! ```

pub mod badge;
pub mod buffer;
pub mod config;
pub mod engine;
mod error;
pub mod events;
pub mod history;
pub mod model;
pub mod payload;
pub mod relay;
pub mod runtime;
pub mod shim;
pub mod store;
pub mod transport;

pub use badge::{badge_text, ActiveTab, BadgeCounter, BadgeSink, BADGE_COLOR};
pub use config::EngineConfig;
pub use engine::{CaptureOutcome, Completion, CorrelationEngine, SweepStats};
pub use error::{CoreError, RelayError, Result, RuntimeError};
pub use events::{Command, CommandResponse, NetworkEvent, RequestStart};
pub use history::{parse_history, read_history, HistoryFile, HISTORY_VERSION};
pub use model::{CapturedRequest, Header, PendingRequest, RequestId, RequestType, ResourceType};
pub use relay::{MessageSource, RelayBridge, RelayTransport};
pub use runtime::{spawn, spawn_with_clock, Clock, EngineHandle, SystemClock, TokioClock};
pub use shim::{PageInstrumentation, PageMessage, PageMessageSink};
pub use store::{InsertOutcome, RequestStore};
