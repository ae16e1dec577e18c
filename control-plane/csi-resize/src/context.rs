use crate::{
    backend::StorageBackend,
    capacity::CapacityUpdater,
    config::ResizeConfig,
    expander::ControllerExpander,
    limiter::VolumeOpLimiter,
    node::{FilesystemResizer, NodeResizer},
    reconciler::ResizeReconciler,
    store::ClaimStore,
    wait::Waiter,
};
use std::sync::Arc;

/// Everything a resize component needs, handed over explicitly.
/// Cloning is cheap and clones share the same limiter.
#[derive(Clone)]
pub struct ResizeContext {
    store: Arc<dyn ClaimStore>,
    backend: Arc<dyn StorageBackend>,
    limiter: VolumeOpLimiter,
    config: ResizeConfig,
}

impl ResizeContext {
    /// Return a new `Self` with a fresh limiter.
    pub fn new(
        store: Arc<dyn ClaimStore>,
        backend: Arc<dyn StorageBackend>,
        config: ResizeConfig,
    ) -> Self {
        Self {
            store,
            backend,
            limiter: VolumeOpLimiter::new(),
            config,
        }
    }

    /// Get the object store.
    pub fn store(&self) -> &Arc<dyn ClaimStore> {
        &self.store
    }
    /// Get the storage backend.
    pub fn backend(&self) -> &Arc<dyn StorageBackend> {
        &self.backend
    }
    /// Get the volume limiter.
    pub fn limiter(&self) -> &VolumeOpLimiter {
        &self.limiter
    }
    /// Get the configuration.
    pub fn config(&self) -> &ResizeConfig {
        &self.config
    }

    /// Controller expander sharing this context's limiter.
    pub fn expander(&self) -> ControllerExpander {
        ControllerExpander::new(
            self.backend.clone(),
            self.limiter.clone(),
            self.config.online_expansion(),
        )
    }
    /// Controller side reconciler.
    pub fn reconciler(&self) -> ResizeReconciler {
        ResizeReconciler::new(self.clone())
    }
    /// Capacity updater.
    pub fn capacity_updater(&self) -> CapacityUpdater {
        CapacityUpdater::new(
            self.store.clone(),
            self.config.poll_interval(),
            self.config.update_timeout(),
        )
    }
    /// Bounded waits using the configured poll interval and resize budget.
    pub fn waiter(&self) -> Waiter {
        Waiter::new(
            self.store.clone(),
            self.config.poll_interval(),
            self.config.resize_timeout(),
        )
    }
    /// Node side resizer growing filesystems through `filesystem`.
    pub fn node_resizer(&self, filesystem: Arc<dyn FilesystemResizer>) -> NodeResizer {
        NodeResizer::new(self.store.clone(), filesystem)
    }
}
