//! Shared application state.

use std::sync::Arc;

use crate::config::Settings;
use crate::manager::SessionManager;
use crate::metrics::EvaluationMetrics;

/// Handles shared by every request handler.
#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<SessionManager>,
    pub metrics: Arc<EvaluationMetrics>,
}

impl AppState {
    pub fn new(settings: Settings) -> Self {
        Self {
            manager: Arc::new(SessionManager::new(settings)),
            metrics: Arc::new(EvaluationMetrics::new()),
        }
    }
}

impl Default for AppState {
    fn default() -> Self {
        Self::new(Settings::default())
    }
}
