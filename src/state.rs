//! Application state shared across request handlers.

use std::sync::Arc;

use crate::dispatch::Dispatcher;

/// Shared application state, cloned into every handler via axum's state
/// extractor.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<Dispatcher>,
}

impl AppState {
    pub fn new(dispatcher: Dispatcher) -> Self {
        Self {
            inner: Arc::new(dispatcher),
        }
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.inner
    }
}
