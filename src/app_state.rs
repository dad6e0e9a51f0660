use std::sync::Arc;

use crate::services::{gateway::Submitter, queue::TaskQueue, results::ResultStore};

/// Shared application state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub submitter: Arc<Submitter>,
    pub queue: Arc<dyn TaskQueue>,
    pub results: Arc<dyn ResultStore>,
    pub queue_names: Arc<Vec<String>>,
}

impl AppState {
    pub fn new(
        submitter: Submitter,
        queue: Arc<dyn TaskQueue>,
        results: Arc<dyn ResultStore>,
        queue_names: Vec<String>,
    ) -> Self {
        Self {
            submitter: Arc::new(submitter),
            queue,
            results,
            queue_names: Arc::new(queue_names),
        }
    }
}
