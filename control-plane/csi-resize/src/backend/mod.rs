//! Storage backend access.
//!
//! The backend is the authority on a volume's allocated capacity, its kind and its
//! attachment state. Capacities are exchanged in whole MiB allocation units.

/// CNS REST client.
pub mod cns;
/// In-memory backend.
pub mod memory;
/// Guest cluster backend which expands the supervisor cluster claim.
pub mod supervisor;

use crate::{error::Error, types::Attachment};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Backing object details of a backend volume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum BackingDetails {
    /// A virtual disk.
    #[serde(rename_all = "camelCase")]
    Block { capacity_in_mb: u64 },
    /// A file share.
    #[serde(rename_all = "camelCase")]
    File {
        capacity_in_mb: u64,
        #[serde(default)]
        access_points: Vec<String>,
    },
}

impl BackingDetails {
    /// Allocated capacity in MiB.
    pub fn capacity_mb(&self) -> u64 {
        match self {
            Self::Block { capacity_in_mb } => *capacity_in_mb,
            Self::File { capacity_in_mb, .. } => *capacity_in_mb,
        }
    }
    /// Check if this is a file share.
    pub fn is_file(&self) -> bool {
        matches!(self, Self::File { .. })
    }
}

/// A volume as reported by the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendVolume {
    pub volume_id: String,
    pub backing: BackingDetails,
    pub attachment: Attachment,
}

impl BackendVolume {
    /// Allocated capacity in MiB.
    pub fn capacity_mb(&self) -> u64 {
        self.backing.capacity_mb()
    }
}

/// Operations consumed from the storage backend.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Query a volume by its backend identifier.
    async fn query_volume(&self, volume_id: &str) -> Result<BackendVolume, Error>;
    /// Grow the volume to the target capacity.
    /// A target at or below the current capacity must be accepted as a no-op.
    async fn expand_volume(&self, volume_id: &str, target_mb: u64) -> Result<(), Error>;
}
