pub mod config;
pub mod error;
pub mod gateway;
pub mod routes;

use std::sync::Arc;

use config::Config;
use gateway::registry::PresenceRegistry;

/// Shared application state available to all route handlers.
///
/// The presence registry is created once at startup and injected here rather
/// than living as a process global, so tests can run multiple independent
/// instances in one process.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<PresenceRegistry>,
    pub config: Arc<Config>,
}

impl AppState {
    pub fn new(config: Config) -> Self {
        Self {
            registry: Arc::new(PresenceRegistry::new()),
            config: Arc::new(config),
        }
    }
}
