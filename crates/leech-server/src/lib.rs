//! Leech Server - local HTTP API.
//!
//! Exposes the correlation engine to the browser-side relay and to the
//! presentation layer over loopback HTTP.
//!
//! ## Endpoints
//!
//! - `POST /api/message` - Engine commands (`{"action": ...}`)
//! - `POST /api/events` - Network lifecycle and tab events (`{"type": ...}`)
//! - `GET /api/badge` - Request count for the active tab's site
//! - `GET /api/history` - Export the store as a history document
//! - `POST /api/history` - Replace the store from a history document
//! - `GET /api/sites` - Registered site extractors
//! - `GET /api/sites/{name}` - Entities of one site
//!
//! ## Example
//!
//! ```no_run
//! use leech_core::EngineConfig;
//! use leech_server::{AppState, Server, ServerConfig};
//!
//! #[tokio::main]
//! async fn main() {
//!     let state = AppState::spawn(EngineConfig::default());
//!     let server = Server::with_state(ServerConfig::default(), state).unwrap();
//!     server.run().await.unwrap();
//! }
//! ```

pub mod error;
mod handlers;
pub mod models;
pub mod state;

use std::future::Future;
use std::net::SocketAddr;

use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use axum::Router;
use socket2::{Domain, Protocol, Socket, Type};
use thiserror::Error;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

pub use error::{ApiError, Result};
pub use state::AppState;

/// Default server port.
pub const DEFAULT_PORT: u16 = 48766;

/// Default server host (localhost only).
pub const DEFAULT_HOST: &str = "127.0.0.1";

/// Default request body limit. History imports can be large.
pub const DEFAULT_MAX_PAYLOAD_BYTES: usize = 64 * 1024 * 1024;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Host to bind to (default: 127.0.0.1).
    pub host: String,
    /// Port to bind to (default: 48766).
    pub port: u16,
    /// Largest accepted request body in bytes.
    pub max_payload_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            max_payload_bytes: DEFAULT_MAX_PAYLOAD_BYTES,
        }
    }
}

impl ServerConfig {
    /// Sets the host.
    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    /// Sets the port.
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Sets the request body limit.
    pub fn with_max_payload_bytes(mut self, bytes: usize) -> Self {
        self.max_payload_bytes = bytes;
        self
    }
}

/// Server error types.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Failed to bind to address.
    #[error("failed to bind to {0}: {1}")]
    BindError(SocketAddr, std::io::Error),

    /// Server runtime error.
    #[error("server error: {0}")]
    Runtime(String),
}

/// The HTTP API server.
pub struct Server {
    router: Router,
    addr: SocketAddr,
}

impl Server {
    /// Creates a server around existing application state.
    pub fn with_state(
        config: ServerConfig,
        state: AppState,
    ) -> std::result::Result<Self, ServerError> {
        // The caller is a browser extension with its own origin
        let cors = CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any);

        let router = Router::new()
            .route("/api/message", post(handlers::post_message))
            .route("/api/events", post(handlers::post_event))
            .route("/api/badge", get(handlers::get_badge))
            .route(
                "/api/history",
                get(handlers::get_history).post(handlers::post_history),
            )
            .route("/api/sites", get(handlers::list_sites))
            .route("/api/sites/{name}", get(handlers::get_site))
            .layer(DefaultBodyLimit::max(config.max_payload_bytes))
            .layer(cors)
            .with_state(state);

        let addr = format!("{}:{}", config.host, config.port)
            .parse()
            .map_err(|e| ServerError::Runtime(format!("invalid address: {}", e)))?;

        Ok(Self { router, addr })
    }

    /// Returns the server address.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Runs the server until the process exits.
    pub async fn run(self) -> std::result::Result<(), ServerError> {
        self.run_until(std::future::pending()).await
    }

    /// Runs the server until `shutdown` resolves, then drains open connections.
    pub async fn run_until<F>(self, shutdown: F) -> std::result::Result<(), ServerError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        info!("Starting Leech API server on {}", self.addr);

        let listener = self.bind()?;

        axum::serve(listener, self.router)
            .with_graceful_shutdown(shutdown)
            .await
            .map_err(|e| ServerError::Runtime(e.to_string()))?;

        info!("Leech API server stopped");
        Ok(())
    }

    /// Returns the router for testing.
    pub fn router(&self) -> Router {
        self.router.clone()
    }

    fn bind(&self) -> std::result::Result<tokio::net::TcpListener, ServerError> {
        let bind_err = |e| ServerError::BindError(self.addr, e);

        // SO_REUSEADDR lets a restart bind while old sockets linger in TIME_WAIT
        let socket = Socket::new(Domain::for_address(self.addr), Type::STREAM, Some(Protocol::TCP))
            .map_err(bind_err)?;
        socket.set_reuse_address(true).map_err(bind_err)?;
        socket.bind(&self.addr.into()).map_err(bind_err)?;
        socket.listen(128).map_err(bind_err)?;
        socket.set_nonblocking(true).map_err(bind_err)?;

        let std_listener: std::net::TcpListener = socket.into();
        tokio::net::TcpListener::from_std(std_listener).map_err(bind_err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use leech_core::EngineConfig;
    use serde_json::{json, Value};
    use tower::ServiceExt;

    fn create_test_app() -> Router {
        let state = AppState::spawn(EngineConfig::default());
        tokio_test::assert_ok!(Server::with_state(ServerConfig::default(), state)).router()
    }

    async fn send(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let builder = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };

        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, json)
    }

    async fn capture_get(app: &Router, id: &str, url: &str, response: Option<&str>) {
        let (status, _) = send(
            app,
            "POST",
            "/api/events",
            Some(json!({
                "type": "requestStarted",
                "requestId": id,
                "url": url,
                "method": "GET",
                "tabId": 1,
                "resourceType": "xmlhttprequest",
                "timestamp": chrono::Utc::now().to_rfc3339(),
                "initiator": "https://github.com"
            })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        if let Some(response) = response {
            let (status, json) = send(
                app,
                "POST",
                "/api/message",
                Some(json!({
                    "action": "captureResponse",
                    "data": {"url": url, "method": "GET", "responseBody": response}
                })),
            )
            .await;
            assert_eq!(status, StatusCode::OK);
            assert_eq!(json["success"], true);
        }

        let (status, _) = send(
            app,
            "POST",
            "/api/events",
            Some(json!({"type": "requestCompleted", "requestId": id})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_events_then_get_requests() {
        let app = create_test_app();
        capture_get(&app, "1", "https://a.test/api/items", None).await;

        let (status, json) = send(
            &app,
            "POST",
            "/api/message",
            Some(json!({"action": "getRequests"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let requests = json["requests"].as_array().unwrap();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0]["url"], "https://a.test/api/items");
        assert_eq!(requests[0]["method"], "GET");
    }

    #[tokio::test]
    async fn test_unknown_action_is_bad_request() {
        let app = create_test_app();
        let (status, json) = send(
            &app,
            "POST",
            "/api/message",
            Some(json!({"action": "launchRockets"})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["code"], "bad_request");
    }

    #[tokio::test]
    async fn test_malformed_event_is_bad_request() {
        let app = create_test_app();
        let (status, _) = send(&app, "POST", "/api/events", Some(json!({"type": "nope"}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_badge_follows_active_tab() {
        let app = create_test_app();

        let (_, json) = send(&app, "GET", "/api/badge", None).await;
        assert_eq!(json["count"], 0);
        assert_eq!(json["text"], "");

        send(
            &app,
            "POST",
            "/api/events",
            Some(json!({"type": "tabActivated", "tabId": 1, "url": "https://a.test/home"})),
        )
        .await;
        capture_get(&app, "1", "https://a.test/api/one", None).await;
        capture_get(&app, "2", "https://b.test/api/two", None).await;

        // Round trip through the engine so the events above are processed
        send(&app, "POST", "/api/message", Some(json!({"action": "getRequests"}))).await;

        let (status, json) = send(&app, "GET", "/api/badge", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["count"], 1);
        assert_eq!(json["text"], "1");
        assert_eq!(json["color"], leech_core::BADGE_COLOR);
    }

    #[tokio::test]
    async fn test_history_export_and_import() {
        let app = create_test_app();
        capture_get(&app, "1", "https://a.test/one", Some("first")).await;
        capture_get(&app, "2", "https://a.test/two", Some("second")).await;

        let (status, history) = send(&app, "GET", "/api/history", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(history["version"], 1);
        assert!(history["exportedAt"].is_string());
        assert_eq!(history["requests"].as_array().unwrap().len(), 2);

        let (_, json) = send(&app, "POST", "/api/message", Some(json!({"action": "clearRequests"}))).await;
        assert_eq!(json["success"], true);

        let (status, json) = send(&app, "POST", "/api/history", Some(history)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["count"], 2);

        let (_, json) = send(&app, "POST", "/api/message", Some(json!({"action": "getRequests"}))).await;
        let requests = json["requests"].as_array().unwrap();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0]["url"], "https://a.test/two");
    }

    #[tokio::test]
    async fn test_invalid_history_is_rejected() {
        let app = create_test_app();
        let (status, json) = send(&app, "POST", "/api/history", Some(json!({"version": 1}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["code"], "invalid_history");
    }

    #[tokio::test]
    async fn test_sites() {
        let app = create_test_app();

        let (status, json) = send(&app, "GET", "/api/sites", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            json["sites"],
            json!(["github", "discord", "soundcloud", "twitter", "instagram", "tiktok", "pinterest", "facebook"])
        );

        let user = json!({"login": "octocat", "id": 583231, "followers": 9000}).to_string();
        capture_get(&app, "7", "https://api.github.com/users/octocat", Some(&user)).await;

        let (status, json) = send(&app, "GET", "/api/sites/github", None).await;
        assert_eq!(status, StatusCode::OK);
        let profiles = json["profiles"].as_array().unwrap();
        assert_eq!(profiles.len(), 1);
        assert_eq!(profiles[0]["login"], "octocat");
        assert_eq!(profiles[0]["followers"], 9000);

        let (status, _) = send(&app, "GET", "/api/sites/myspace", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.port, DEFAULT_PORT);
        assert_eq!(config.max_payload_bytes, DEFAULT_MAX_PAYLOAD_BYTES);
    }

    #[tokio::test]
    async fn test_server_config_builders() {
        let config = ServerConfig::default()
            .with_host("0.0.0.0")
            .with_port(9000)
            .with_max_payload_bytes(1024);
        assert_eq!(config.port, 9000);
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.max_payload_bytes, 1024);
    }

    #[tokio::test]
    async fn test_invalid_host_is_rejected() {
        let state = AppState::spawn(EngineConfig::default());
        let result = Server::with_state(ServerConfig::default().with_host("not a host"), state);
        assert!(matches!(result, Err(ServerError::Runtime(_))));
    }
}
