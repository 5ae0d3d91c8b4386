//! Relay bridge between the page and the correlation engine.
//!
//! Forwards capture messages posted by the instrumentation, plus the top-level
//! document once it has loaded, as engine commands. The bridge is stateless
//! except for a sticky "context dead" flag: once the receiving side is known to
//! be gone, every later send is a no-op.

use std::sync::atomic::{AtomicBool, Ordering};

use serde_json::Value;

use crate::error::RelayError;
use crate::events::{BodyCapture, Command, DocumentCapture, ResponseCapture};
use crate::shim::{PageMessage, PageMessageSink};

/// Origin of a page message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageSource {
    /// Posted by the page window itself.
    Page,
    /// Posted by another window or frame.
    Foreign,
}

/// Delivers commands to the engine.
pub trait RelayTransport {
    /// Returns false when the receiving runtime cannot be reached right now.
    fn is_available(&self) -> bool;

    /// Sends a command without waiting for a reply.
    fn send(&self, command: Command) -> Result<(), RelayError>;
}

/// Relay bridge for one frame.
#[derive(Debug)]
pub struct RelayBridge<T> {
    transport: T,
    top_frame: bool,
    /// Sticky once set. Atomic so a bridge over [`EngineHandle`](crate::EngineHandle) stays `Sync`.
    context_dead: AtomicBool,
}

impl<T: RelayTransport> RelayBridge<T> {
    /// Creates a bridge. `top_frame` enables document capture.
    pub fn new(transport: T, top_frame: bool) -> Self {
        Self {
            transport,
            top_frame,
            context_dead: AtomicBool::new(false),
        }
    }

    /// Returns true once the context has been invalidated.
    pub fn is_context_dead(&self) -> bool {
        self.context_dead.load(Ordering::Relaxed)
    }

    /// The underlying transport.
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Handles a raw message from the page's message channel.
    ///
    /// Returns true if a command was sent.
    pub fn on_page_message(&self, source: MessageSource, message: &Value) -> bool {
        if source != MessageSource::Page {
            return false;
        }
        match serde_json::from_value::<PageMessage>(message.clone()) {
            Ok(message) => self.forward(message),
            Err(_) => false,
        }
    }

    /// Handles the top-level document finishing its load.
    ///
    /// Returns true if a command was sent.
    pub fn on_document_loaded(&self, url: &str, html: &str) -> bool {
        if !self.top_frame || html.is_empty() {
            return false;
        }
        self.send(Command::CaptureDocumentContent {
            data: Some(DocumentCapture {
                url: Some(url.to_string()),
                response_body: Some(html.to_string()),
            }),
        })
    }

    /// Forwards a typed page message.
    pub fn forward(&self, message: PageMessage) -> bool {
        self.send(command_for(message))
    }

    fn send(&self, command: Command) -> bool {
        if self.is_context_dead() || !self.transport.is_available() {
            return false;
        }
        match self.transport.send(command) {
            Ok(()) => true,
            Err(RelayError::ContextInvalidated) => {
                tracing::warn!("Relay context invalidated; further captures are dropped");
                self.context_dead.store(true, Ordering::Relaxed);
                false
            }
            Err(RelayError::Delivery(reason)) => {
                tracing::trace!(%reason, "Relay delivery failed");
                false
            }
        }
    }
}

impl<T: RelayTransport> PageMessageSink for RelayBridge<T> {
    fn post(&self, message: PageMessage) {
        self.forward(message);
    }
}

/// Translates a page message into the engine command it stands for.
pub fn command_for(message: PageMessage) -> Command {
    match message {
        PageMessage::Body { data } => Command::CaptureBody {
            data: Some(BodyCapture {
                url: Some(data.url),
                method: Some(data.method),
                body: data.body.map(Value::String),
            }),
        },
        PageMessage::Response { data } => Command::CaptureResponse {
            data: Some(ResponseCapture {
                url: Some(data.url),
                method: Some(data.method),
                response_body: data.response_body.map(Value::String),
            }),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::cell::{Cell, RefCell};

    #[derive(Default)]
    struct FakeTransport {
        unavailable: Cell<bool>,
        fail_with: RefCell<Option<RelayError>>,
        sent: RefCell<Vec<Command>>,
    }

    impl RelayTransport for FakeTransport {
        fn is_available(&self) -> bool {
            !self.unavailable.get()
        }

        fn send(&self, command: Command) -> Result<(), RelayError> {
            if let Some(err) = self.fail_with.borrow().clone() {
                return Err(err);
            }
            self.sent.borrow_mut().push(command);
            Ok(())
        }
    }

    fn body_message() -> Value {
        json!({
            "type": "API_LEECH_BODY",
            "data": {"url": "https://a.test/x", "method": "POST", "body": "a=1", "timestamp": "2024-01-01T00:00:00Z"}
        })
    }

    #[test]
    fn forwards_page_captures() {
        let bridge = RelayBridge::new(FakeTransport::default(), true);
        assert!(bridge.on_page_message(MessageSource::Page, &body_message()));

        let sent = bridge.transport().sent.borrow();
        match &sent[0] {
            Command::CaptureBody { data: Some(data) } => {
                assert_eq!(data.url.as_deref(), Some("https://a.test/x"));
                assert_eq!(data.body, Some(json!("a=1")));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn ignores_foreign_and_unknown_messages() {
        let bridge = RelayBridge::new(FakeTransport::default(), true);
        assert!(!bridge.on_page_message(MessageSource::Foreign, &body_message()));
        assert!(!bridge.on_page_message(MessageSource::Page, &json!({"type": "OTHER"})));
        assert!(!bridge.on_page_message(MessageSource::Page, &json!("hello")));
        assert!(bridge.transport().sent.borrow().is_empty());
    }

    #[test]
    fn document_capture_only_in_top_frame() {
        let frame = RelayBridge::new(FakeTransport::default(), false);
        assert!(!frame.on_document_loaded("https://a.test/", "<html></html>"));

        let top = RelayBridge::new(FakeTransport::default(), true);
        assert!(!top.on_document_loaded("https://a.test/", ""));
        assert!(top.on_document_loaded("https://a.test/", "<html></html>"));
        assert_eq!(
            top.transport().sent.borrow()[0].action(),
            "captureDocumentContent"
        );
    }

    #[test]
    fn unavailable_runtime_skips_without_killing_context() {
        let bridge = RelayBridge::new(FakeTransport::default(), true);
        bridge.transport().unavailable.set(true);
        assert!(!bridge.on_page_message(MessageSource::Page, &body_message()));
        assert!(!bridge.is_context_dead());

        bridge.transport().unavailable.set(false);
        assert!(bridge.on_page_message(MessageSource::Page, &body_message()));
    }

    #[test]
    fn delivery_errors_are_swallowed() {
        let bridge = RelayBridge::new(FakeTransport::default(), true);
        *bridge.transport().fail_with.borrow_mut() = Some(RelayError::Delivery("busy".into()));
        assert!(!bridge.on_page_message(MessageSource::Page, &body_message()));
        assert!(!bridge.is_context_dead());
    }

    #[test]
    fn invalidation_is_sticky() {
        let bridge = RelayBridge::new(FakeTransport::default(), true);
        *bridge.transport().fail_with.borrow_mut() = Some(RelayError::ContextInvalidated);
        assert!(!bridge.on_page_message(MessageSource::Page, &body_message()));
        assert!(bridge.is_context_dead());

        *bridge.transport().fail_with.borrow_mut() = None;
        assert!(!bridge.on_page_message(MessageSource::Page, &body_message()));
        assert!(!bridge.on_document_loaded("https://a.test/", "<html></html>"));
        assert!(bridge.transport().sent.borrow().is_empty());
    }

    #[test]
    fn bridge_over_engine_handle_is_shareable() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<RelayBridge<crate::runtime::EngineHandle>>();
    }

    #[test]
    fn response_messages_become_capture_response() {
        let command = command_for(PageMessage::Response {
            data: crate::shim::ResponseMessage {
                url: "u".into(),
                method: "GET".into(),
                response_body: None,
                timestamp: chrono::DateTime::from_timestamp_millis(0).unwrap(),
            },
        });
        assert_eq!(
            command,
            Command::CaptureResponse {
                data: Some(ResponseCapture {
                    url: Some("u".into()),
                    method: Some("GET".into()),
                    response_body: None,
                })
            }
        );
    }
}
