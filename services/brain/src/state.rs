//! Application state shared across request handlers.

use std::sync::Arc;

use crate::config::Config;
use crate::dispatch::Dispatcher;
use crate::registry::Registry;

/// Shared application state.
///
/// This is passed to all request handlers via Axum's state extractor.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    registry: Registry,
    dispatcher: Dispatcher,
    config: Config,
}

impl AppState {
    /// Create a new application state.
    pub fn new(registry: Registry, dispatcher: Dispatcher, config: Config) -> Self {
        Self {
            inner: Arc::new(AppStateInner {
                registry,
                dispatcher,
                config,
            }),
        }
    }

    /// Get a reference to the entity registry.
    pub fn registry(&self) -> &Registry {
        &self.inner.registry
    }

    /// Get a reference to the command dispatcher.
    pub fn dispatcher(&self) -> &Dispatcher {
        &self.inner.dispatcher
    }

    /// Get a reference to the configuration.
    pub fn config(&self) -> &Config {
        &self.inner.config
    }
}
