//! Leech - captures and correlates a browser's HTTP traffic.
//!
//! This binary runs the correlation engine behind the local HTTP API the
//! browser extension talks to. Optionally it seeds the store from a history
//! file on startup.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use directories::ProjectDirs;
use leech_core::{
    read_history, BadgeCounter, Command, CommandResponse, CorrelationEngine, EngineConfig,
    EngineHandle,
};
use leech_server::{
    AppState, Server, ServerConfig, DEFAULT_HOST, DEFAULT_MAX_PAYLOAD_BYTES, DEFAULT_PORT,
};
use serde_json::Value;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Leech - capture and correlate browser HTTP traffic
#[derive(Parser, Debug)]
#[command(name = "leech", version, about)]
struct Args {
    /// Host to bind the API server to
    #[arg(long, default_value = DEFAULT_HOST)]
    host: String,

    /// Port to bind the API server to
    #[arg(long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// History file to import on startup
    #[arg(long)]
    import: Option<PathBuf>,

    /// Enable debug logging (also logs to console)
    #[arg(long)]
    debug: bool,

    /// Set log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Largest accepted API request body in bytes
    #[arg(long, default_value_t = DEFAULT_MAX_PAYLOAD_BYTES)]
    max_payload_bytes: usize,
}

/// Get the logs directory path.
fn logs_dir() -> Option<PathBuf> {
    ProjectDirs::from("", "leech", "Leech").map(|dirs| dirs.data_dir().join("logs"))
}

/// Initialize logging with file rotation.
fn init_logging(args: &Args) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let log_level = if args.debug { "debug" } else { &args.log_level };

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("leech={},warn", log_level)));

    if let Some(log_dir) = logs_dir() {
        if std::fs::create_dir_all(&log_dir).is_ok() {
            let file_appender = RollingFileAppender::builder()
                .rotation(Rotation::DAILY)
                .max_log_files(5)
                .filename_prefix("leech")
                .filename_suffix("log")
                .build(&log_dir)
                .ok();

            if let Some(appender) = file_appender {
                let (non_blocking, guard) = tracing_appender::non_blocking(appender);

                if args.debug {
                    tracing_subscriber::registry()
                        .with(env_filter)
                        .with(fmt::layer().with_writer(std::io::stdout))
                        .with(fmt::layer().with_writer(non_blocking).with_ansi(false))
                        .init();
                } else {
                    tracing_subscriber::registry()
                        .with(env_filter)
                        .with(fmt::layer().with_writer(non_blocking).with_ansi(false))
                        .init();
                }

                tracing::info!("Logging to {:?}", log_dir);
                return Some(guard);
            }
        }
    }

    // Fallback: console logging only
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    tracing::warn!("File logging unavailable, using console only");
    None
}

/// Replaces the store with the records of a history file.
async fn import_history(engine: &EngineHandle, path: &Path) -> anyhow::Result<usize> {
    let records = read_history(path)
        .with_context(|| format!("failed to read history file {}", path.display()))?;

    let reply = engine
        .command(Command::ImportHistory {
            requests: Some(Value::Array(records)),
        })
        .await?;

    match reply {
        CommandResponse::Imported { count, .. } => Ok(count),
        other => anyhow::bail!("unexpected import reply: {other:?}"),
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown requested");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Keep the guard alive for the duration of the program
    let _log_guard = init_logging(&args);

    tracing::info!("Starting Leech...");
    tracing::debug!("Args: {:?}", args);

    let badge = BadgeCounter::new();
    let engine = CorrelationEngine::with_badge(EngineConfig::default(), Arc::new(badge.clone()));
    let (handle, engine_task) = leech_core::spawn(engine);

    if let Some(ref path) = args.import {
        let count = import_history(&handle, path).await?;
        tracing::info!("Imported {} requests from {:?}", count, path);
    }

    let config = ServerConfig::default()
        .with_host(args.host.clone())
        .with_port(args.port)
        .with_max_payload_bytes(args.max_payload_bytes);
    let server = Server::with_state(config, AppState::new(handle, badge))?;

    server.run_until(shutdown_signal()).await?;

    // The server owned the last engine handle; the engine task ends with it
    if let Err(e) = engine_task.await {
        tracing::warn!("Engine task ended abnormally: {}", e);
    }

    tracing::info!("Leech shutting down");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Utc};
    use leech_core::{CapturedRequest, HistoryFile, RequestType};
    use tempfile::TempDir;

    fn record(id: f64, url: &str) -> CapturedRequest {
        CapturedRequest {
            id,
            url: url.into(),
            method: "GET".into(),
            headers: vec![],
            body: None,
            response_body: Some("ok".into()),
            timestamp: chrono_millis(id as i64),
            request_type: RequestType::Fetch,
            tab_id: 1,
            initiator: String::new(),
        }
    }

    fn chrono_millis(ms: i64) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(ms).unwrap()
    }

    #[test]
    fn test_args_defaults() {
        let args = Args::try_parse_from(["leech"]).unwrap();
        assert_eq!(args.host, DEFAULT_HOST);
        assert_eq!(args.port, DEFAULT_PORT);
        assert_eq!(args.log_level, "info");
        assert_eq!(args.max_payload_bytes, DEFAULT_MAX_PAYLOAD_BYTES);
        assert!(args.import.is_none());
        assert!(!args.debug);
    }

    #[test]
    fn test_args_overrides() {
        let args = Args::try_parse_from([
            "leech",
            "--port",
            "9100",
            "--import",
            "history.json",
            "--debug",
        ])
        .unwrap();
        assert_eq!(args.port, 9100);
        assert_eq!(args.import, Some(PathBuf::from("history.json")));
        assert!(args.debug);
    }

    #[tokio::test]
    async fn test_import_history_seeds_store() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("history.json");
        HistoryFile::new(
            vec![
                record(1_700_000_002_000.0, "https://a.test/b"),
                record(1_700_000_001_000.0, "https://a.test/a"),
            ],
            chrono_millis(1_700_000_003_000),
        )
        .write_to(&path)
        .unwrap();

        let (handle, _task) = leech_core::spawn(CorrelationEngine::new(EngineConfig::default()));
        let count = import_history(&handle, &path).await.unwrap();
        assert_eq!(count, 2);

        match handle.command(Command::GetRequests).await.unwrap() {
            CommandResponse::Requests { requests } => {
                assert_eq!(requests.len(), 2);
                assert_eq!(requests[0].url, "https://a.test/b");
            }
            other => panic!("unexpected reply {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_import_missing_file_fails() {
        let dir = TempDir::new().unwrap();
        let (handle, _task) = leech_core::spawn(CorrelationEngine::new(EngineConfig::default()));
        let result = import_history(&handle, &dir.path().join("missing.json")).await;
        assert!(result.is_err());
    }
}
