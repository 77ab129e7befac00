//! Application state shared across request handlers.

use std::sync::Arc;

use warren_id::NodeId;

use crate::instance::InstanceManager;
use crate::template::CacheManager;

/// Shared application state.
///
/// This is passed to all request handlers via Axum's state extractor.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    instances: InstanceManager,
    cache_manager: CacheManager,
    node_id: NodeId,
}

impl AppState {
    /// Create a new application state.
    pub fn new(instances: InstanceManager, cache_manager: CacheManager, node_id: NodeId) -> Self {
        Self {
            inner: Arc::new(AppStateInner {
                instances,
                cache_manager,
                node_id,
            }),
        }
    }

    /// Get a reference to the instance command executor.
    pub fn instances(&self) -> &InstanceManager {
        &self.inner.instances
    }

    /// Get a reference to the cache purge manager.
    pub fn cache_manager(&self) -> &CacheManager {
        &self.inner.cache_manager
    }

    /// The node id the brain assigned at registration.
    pub fn node_id(&self) -> NodeId {
        self.inner.node_id
    }
}
