//! Shared application state for the gateway.

use std::sync::Arc;

use hive::orchestrator::Orchestrator;

/// Shared state accessible from all request handlers.
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
}

impl AppState {
    pub fn new(orchestrator: Orchestrator) -> Self {
        Self {
            orchestrator: Arc::new(orchestrator),
        }
    }
}
