//! Volume Concurrency Limiter Module
//!
//! The orchestrator is level-triggered and may observe the same claim from several
//! reconcile passes at once, eg: after a restart or a resync. Only one backend
//! expansion may be in flight for a given volume; any other caller is turned away
//! with `OperationInProgress` and simply retries on its next pass.
use snafu::Snafu;
use std::{
    collections::HashSet,
    sync::{Arc, Mutex},
};
use tracing::trace;

/// Volume concurrency limiter error variants.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)), context(suffix(false)))]
pub enum Error {
    #[snafu(display("Existing resize operation is in progress for volume: {}", id))]
    OperationInProgress { id: String },
    #[snafu(display("Volume id {} not valid", id))]
    InvalidVolumeId { id: String },
}

/// Inventory of the volumes which have operations in-flight.
#[derive(Debug, Clone, Default)]
pub struct VolumeOpLimiter {
    inventory: Arc<Mutex<HashSet<String>>>,
}

impl VolumeOpLimiter {
    /// Return a new, empty, limiter.
    pub fn new() -> Self {
        Self::default()
    }

    /// Tries to take a new volume reservation and returns error if an existing
    /// operation is already in progress.
    pub fn reserve(&self, volume_id: &str) -> Result<VolumeOpGuard, Error> {
        if volume_id.trim().is_empty() {
            return Err(Error::InvalidVolumeId {
                id: volume_id.to_string(),
            });
        }
        let mut inventory = self.lock();
        match inventory.contains(volume_id) {
            true => {
                trace!(volume.id = volume_id, "Operation already exists for volume");
                Err(Error::OperationInProgress {
                    id: volume_id.to_string(),
                })
            }
            false => {
                inventory.insert(volume_id.to_string());
                trace!(volume.id = volume_id, "New reservation");
                Ok(VolumeOpGuard {
                    id: volume_id.to_string(),
                    inventory: self.inventory.clone(),
                })
            }
        }
    }

    /// Check if the volume currently has an operation in-flight.
    pub fn is_reserved(&self, volume_id: &str) -> bool {
        self.lock().contains(volume_id)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashSet<String>> {
        // the set stays consistent even if a holder panicked
        self.inventory
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// This Operation guard is used to ensure there is no more than 1 in-flight operation
/// for a given volume by taking a reservation for the volume's id.
/// When this is dropped the reservation is returned and a new operation can be accepted.
#[derive(Debug)]
pub struct VolumeOpGuard {
    id: String,
    inventory: Arc<Mutex<HashSet<String>>>,
}

impl VolumeOpGuard {
    /// The reserved volume id.
    pub fn id(&self) -> &str {
        &self.id
    }
}

impl Drop for VolumeOpGuard {
    fn drop(&mut self) {
        let mut inventory = self
            .inventory
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        inventory.remove(&self.id);
        trace!(volume.id = self.id, "Reservation released");
    }
}
