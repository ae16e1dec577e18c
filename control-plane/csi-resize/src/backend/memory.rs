use super::{BackendVolume, BackingDetails, StorageBackend};
use crate::{error::Error, types::Attachment};
use async_trait::async_trait;
use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

#[derive(Debug, Default)]
struct Inner {
    volumes: HashMap<String, BackendVolume>,
    /// Number of upcoming expansions which fail.
    failures: u32,
    /// Expansions are accepted but the capacity never moves.
    stalled: bool,
    expand_calls: u64,
    expand_delay: Option<Duration>,
}

/// A backend which keeps its volumes in memory.
/// Used by the tests and for trying out the controller without a real backend.
#[derive(Debug, Clone, Default)]
pub struct MemoryBackend {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryBackend {
    /// Return a new, empty, backend.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Add or replace a volume.
    pub fn insert(&self, volume_id: &str, backing: BackingDetails) {
        self.lock().volumes.insert(
            volume_id.to_string(),
            BackendVolume {
                volume_id: volume_id.to_string(),
                backing,
                attachment: Attachment::Detached,
            },
        );
    }

    /// Add a block volume of the given capacity.
    pub fn insert_block(&self, volume_id: &str, capacity_mb: u64) {
        self.insert(
            volume_id,
            BackingDetails::Block {
                capacity_in_mb: capacity_mb,
            },
        );
    }

    /// Remove a volume.
    pub fn remove(&self, volume_id: &str) -> Option<BackendVolume> {
        self.lock().volumes.remove(volume_id)
    }

    /// Attach a volume to a node.
    pub fn attach(&self, volume_id: &str, node: &str) {
        if let Some(volume) = self.lock().volumes.get_mut(volume_id) {
            volume.attachment = Attachment::Attached {
                node: node.to_string(),
            };
        }
    }

    /// Detach a volume.
    pub fn detach(&self, volume_id: &str) {
        if let Some(volume) = self.lock().volumes.get_mut(volume_id) {
            volume.attachment = Attachment::Detached;
        }
    }

    /// Fail the next `count` expansions with a backend error.
    pub fn fail_next_expansions(&self, count: u32) {
        self.lock().failures = count;
    }

    /// Accept expansions without ever growing the volume.
    pub fn set_stalled(&self, stalled: bool) {
        self.lock().stalled = stalled;
    }

    /// Delay every expansion by the given duration.
    pub fn set_expand_delay(&self, delay: Option<Duration>) {
        self.lock().expand_delay = delay;
    }

    /// Number of expansion calls received so far.
    pub fn expand_calls(&self) -> u64 {
        self.lock().expand_calls
    }

    /// Current capacity of a volume.
    pub fn capacity_mb(&self, volume_id: &str) -> Option<u64> {
        self.lock()
            .volumes
            .get(volume_id)
            .map(BackendVolume::capacity_mb)
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    async fn query_volume(&self, volume_id: &str) -> Result<BackendVolume, Error> {
        self.lock()
            .volumes
            .get(volume_id)
            .cloned()
            .ok_or_else(|| Error::VolumeNotFound {
                volume: volume_id.to_string(),
            })
    }

    async fn expand_volume(&self, volume_id: &str, target_mb: u64) -> Result<(), Error> {
        let delay = {
            let mut inner = self.lock();
            inner.expand_calls += 1;
            inner.expand_delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut inner = self.lock();
        if inner.failures > 0 {
            inner.failures -= 1;
            return Err(Error::Backend {
                volume: volume_id.to_string(),
                message: "injected expansion failure".to_string(),
            });
        }
        let stalled = inner.stalled;
        let volume = inner
            .volumes
            .get_mut(volume_id)
            .ok_or_else(|| Error::VolumeNotFound {
                volume: volume_id.to_string(),
            })?;
        match &mut volume.backing {
            BackingDetails::Block { capacity_in_mb } => {
                if !stalled && target_mb > *capacity_in_mb {
                    *capacity_in_mb = target_mb;
                }
                Ok(())
            }
            BackingDetails::File { .. } => Err(Error::UnsupportedVolumeKind {
                volume: volume_id.to_string(),
            }),
        }
    }
}
