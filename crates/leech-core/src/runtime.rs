//! Engine task.
//!
//! The correlation engine runs inside a single tokio task that owns it
//! outright. Everything else talks to it through an [`EngineHandle`]:
//!
//! ```text
//!  HTTP handlers ─┐
//!  relay bridge ──┼──► mpsc ──► engine task ──► store / badge
//!  grace timers ──┘               ▲
//!                   sweep tick ───┘
//! ```
//!
//! Messages are processed one at a time, so engine state needs no locking.
//! Grace periods are separate sleeping tasks that post a message back when
//! they expire, which keeps the loop free to handle other traffic meanwhile.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::engine::{Completion, CorrelationEngine};
use crate::error::{RelayError, RuntimeError};
use crate::events::{Command, CommandResponse, NetworkEvent};
use crate::model::RequestId;
use crate::relay::RelayTransport;

/// Source of wall-clock time for the engine.
pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> DateTime<Utc>;
}

/// The system clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Wall-clock time derived from tokio's clock, anchored at a fixed instant.
///
/// Follows paused and advanced time in tests.
#[derive(Debug, Clone, Copy)]
pub struct TokioClock {
    anchor: DateTime<Utc>,
    origin: Instant,
}

impl TokioClock {
    /// Starts the clock at `anchor`.
    pub fn starting_at(anchor: DateTime<Utc>) -> Self {
        Self {
            anchor,
            origin: Instant::now(),
        }
    }
}

impl Clock for TokioClock {
    fn now(&self) -> DateTime<Utc> {
        let elapsed = Instant::now().duration_since(self.origin);
        chrono::TimeDelta::from_std(elapsed)
            .map(|d| self.anchor + d)
            .unwrap_or(self.anchor)
    }
}

enum EngineMessage {
    Event(NetworkEvent),
    Command {
        command: Command,
        reply: Option<oneshot::Sender<CommandResponse>>,
    },
    GraceExpired(RequestId),
}

/// Cloneable handle to the engine task.
#[derive(Debug, Clone)]
pub struct EngineHandle {
    tx: mpsc::UnboundedSender<EngineMessage>,
}

impl EngineHandle {
    /// Delivers a network or tab event.
    pub fn send_event(&self, event: NetworkEvent) -> Result<(), RuntimeError> {
        self.tx
            .send(EngineMessage::Event(event))
            .map_err(|_| RuntimeError::Stopped)
    }

    /// Sends a command and waits for the reply.
    pub async fn command(&self, command: Command) -> Result<CommandResponse, RuntimeError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(EngineMessage::Command {
                command,
                reply: Some(reply),
            })
            .map_err(|_| RuntimeError::Stopped)?;
        rx.await.map_err(|_| RuntimeError::NoReply)
    }

    /// Sends a command without waiting for the reply.
    pub fn post_command(&self, command: Command) -> Result<(), RuntimeError> {
        self.tx
            .send(EngineMessage::Command {
                command,
                reply: None,
            })
            .map_err(|_| RuntimeError::Stopped)
    }

    /// Returns true once the engine task has stopped.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

impl RelayTransport for EngineHandle {
    fn is_available(&self) -> bool {
        !self.is_closed()
    }

    fn send(&self, command: Command) -> Result<(), RelayError> {
        self.post_command(command)
            .map_err(|_| RelayError::ContextInvalidated)
    }
}

/// Spawns the engine task on the system clock.
pub fn spawn(engine: CorrelationEngine) -> (EngineHandle, JoinHandle<()>) {
    spawn_with_clock(engine, Arc::new(SystemClock))
}

/// Spawns the engine task with an explicit clock.
///
/// The task stops once every [`EngineHandle`] has been dropped.
pub fn spawn_with_clock(
    engine: CorrelationEngine,
    clock: Arc<dyn Clock>,
) -> (EngineHandle, JoinHandle<()>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let timers = tx.downgrade();
    let task = tokio::spawn(run(engine, clock, timers, rx));
    (EngineHandle { tx }, task)
}

async fn run(
    mut engine: CorrelationEngine,
    clock: Arc<dyn Clock>,
    timers: mpsc::WeakUnboundedSender<EngineMessage>,
    mut rx: mpsc::UnboundedReceiver<EngineMessage>,
) {
    let period = engine.config().sweep_interval;
    let mut sweep = tokio::time::interval_at(Instant::now() + period, period);
    sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

    tracing::info!("Correlation engine started");

    loop {
        tokio::select! {
            message = rx.recv() => {
                let Some(message) = message else { break };
                handle_message(&mut engine, clock.as_ref(), &timers, message);
            }
            _ = sweep.tick() => {
                engine.sweep(clock.now());
            }
        }
    }

    tracing::info!(stored = engine.store().len(), "Correlation engine stopped");
}

fn handle_message(
    engine: &mut CorrelationEngine,
    clock: &dyn Clock,
    timers: &mpsc::WeakUnboundedSender<EngineMessage>,
    message: EngineMessage,
) {
    match message {
        EngineMessage::Event(event) => {
            let id = match &event {
                NetworkEvent::RequestCompleted { request_id } => Some(request_id.clone()),
                _ => None,
            };
            if let (Some(Completion::Deferred(delay)), Some(id)) =
                (engine.handle_event(event, clock.now()), id)
            {
                schedule_grace(timers.clone(), id, delay);
            }
        }
        EngineMessage::Command { command, reply } => {
            let response = engine.handle_command(command, clock.now());
            if let Some(reply) = reply {
                // The caller may have given up waiting.
                let _ = reply.send(response);
            }
        }
        EngineMessage::GraceExpired(id) => {
            engine.grace_expired(&id, clock.now());
        }
    }
}

fn schedule_grace(
    timers: mpsc::WeakUnboundedSender<EngineMessage>,
    id: RequestId,
    delay: std::time::Duration,
) {
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        if let Some(tx) = timers.upgrade() {
            let _ = tx.send(EngineMessage::GraceExpired(id));
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::events::{BodyCapture, RequestStart};
    use crate::model::ResourceType;
    use std::time::Duration;

    fn anchor() -> DateTime<Utc> {
        DateTime::from_timestamp_millis(1_700_000_000_000).unwrap()
    }

    fn started(id: &str, url: &str, method: &str, clock: &TokioClock) -> NetworkEvent {
        NetworkEvent::RequestStarted(RequestStart {
            request_id: RequestId::new(id),
            url: url.into(),
            method: method.into(),
            tab_id: 1,
            resource_type: ResourceType::Xmlhttprequest,
            timestamp: clock.now(),
            initiator: None,
            request_body: None,
        })
    }

    fn completed(id: &str) -> NetworkEvent {
        NetworkEvent::RequestCompleted {
            request_id: RequestId::new(id),
        }
    }

    async fn stored(handle: &EngineHandle) -> Vec<String> {
        match handle.command(Command::GetRequestsForExport).await.unwrap() {
            CommandResponse::Requests { requests } => {
                requests.into_iter().map(|r| r.url).collect()
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    fn start_engine() -> (EngineHandle, TokioClock) {
        let clock = TokioClock::starting_at(anchor());
        let (handle, _task) = spawn_with_clock(
            CorrelationEngine::new(EngineConfig::default()),
            Arc::new(clock),
        );
        (handle, clock)
    }

    #[tokio::test(start_paused = true)]
    async fn grace_period_does_not_block_other_events() {
        let (handle, clock) = start_engine();

        handle.send_event(started("1", "https://a.test/post", "POST", &clock)).unwrap();
        handle.send_event(completed("1")).unwrap();

        handle.send_event(started("2", "https://a.test/get", "GET", &clock)).unwrap();
        handle.send_event(completed("2")).unwrap();
        assert_eq!(stored(&handle).await, vec!["https://a.test/get"]);

        tokio::time::sleep(Duration::from_millis(1400)).await;
        assert_eq!(stored(&handle).await, vec!["https://a.test/get"]);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(
            stored(&handle).await,
            vec!["https://a.test/post", "https://a.test/get"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn body_relayed_during_grace_is_kept() {
        let (handle, clock) = start_engine();

        handle.send_event(started("1", "https://a.test/post", "POST", &clock)).unwrap();
        handle.send_event(completed("1")).unwrap();

        tokio::time::sleep(Duration::from_millis(500)).await;
        handle
            .post_command(Command::CaptureBody {
                data: Some(BodyCapture {
                    url: Some("https://a.test/post".into()),
                    method: Some("POST".into()),
                    body: Some(serde_json::json!("a=1")),
                }),
            })
            .unwrap();

        tokio::time::sleep(Duration::from_millis(1100)).await;
        match handle.command(Command::GetRequestsForExport).await.unwrap() {
            CommandResponse::Requests { requests } => {
                assert_eq!(requests.len(), 1);
                assert_eq!(requests[0].body.as_deref(), Some("a=1"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn periodic_sweep_drops_stale_pending() {
        let (handle, clock) = start_engine();

        handle.send_event(started("1", "https://a.test/slow", "GET", &clock)).unwrap();
        tokio::time::sleep(Duration::from_secs(61)).await;

        // Completion after the sweep finds nothing to finalize.
        handle.send_event(completed("1")).unwrap();
        assert!(stored(&handle).await.is_empty());
    }

    #[tokio::test]
    async fn handle_reports_stopped_engine() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        let handle = EngineHandle { tx };

        assert!(handle.is_closed());
        assert_eq!(
            handle.send_event(completed("1")),
            Err(RuntimeError::Stopped)
        );
        assert_eq!(
            handle.command(Command::GetRequests).await,
            Err(RuntimeError::Stopped)
        );
        assert!(!RelayTransport::is_available(&handle));
        assert_eq!(
            RelayTransport::send(&handle, Command::ClearRequests),
            Err(RelayError::ContextInvalidated)
        );
    }

    #[test]
    fn engine_runs_on_current_thread_runtime() {
        tokio_test::block_on(async {
            let (handle, _task) = spawn(CorrelationEngine::new(EngineConfig::default()));
            tokio_test::assert_ok!(handle.post_command(Command::ClearRequests));
            let reply = tokio_test::assert_ok!(handle.command(Command::GetRequests).await);
            assert_eq!(reply, CommandResponse::Requests { requests: vec![] });
        });
    }

    #[tokio::test(start_paused = true)]
    async fn tokio_clock_tracks_paused_time() {
        let clock = TokioClock::starting_at(anchor());
        tokio::time::advance(Duration::from_millis(250)).await;
        assert_eq!(clock.now() - anchor(), chrono::TimeDelta::milliseconds(250));
    }
}
