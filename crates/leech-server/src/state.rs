//! Application state for the API server.

use std::sync::Arc;

use leech_core::{BadgeCounter, CorrelationEngine, EngineConfig, EngineHandle};
use leech_extractors::ExtractorRegistry;

/// Shared application state.
#[derive(Debug, Clone)]
pub struct AppState {
    /// Handle to the running engine task.
    pub engine: EngineHandle,
    /// Latest badge count, fed by the engine.
    pub badge: BadgeCounter,
    /// Site extractors served under `/api/sites`.
    pub extractors: Arc<ExtractorRegistry>,
}

impl AppState {
    /// Creates state around a running engine, with the built-in extractors.
    pub fn new(engine: EngineHandle, badge: BadgeCounter) -> Self {
        Self::with_extractors(engine, badge, ExtractorRegistry::with_defaults())
    }

    /// Creates state with a custom extractor registry.
    pub fn with_extractors(
        engine: EngineHandle,
        badge: BadgeCounter,
        extractors: ExtractorRegistry,
    ) -> Self {
        Self {
            engine,
            badge,
            extractors: Arc::new(extractors),
        }
    }

    /// Spawns an engine with the given config and wires its badge.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(config: EngineConfig) -> Self {
        let badge = BadgeCounter::new();
        let engine = CorrelationEngine::with_badge(config, Arc::new(badge.clone()));
        let (handle, _task) = leech_core::spawn(engine);
        Self::new(handle, badge)
    }
}
