//! Shared state handed to every request handler.

use std::sync::Arc;

use pocketping_core::ChatService;

pub struct AppState {
    pub service: Arc<ChatService>,
    pub run_id: String,
}

impl AppState {
    pub fn new(service: Arc<ChatService>, run_id: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            service,
            run_id: run_id.into(),
        })
    }
}
