use crate::{
    backend::{BackingDetails, StorageBackend},
    error::Error,
    limiter::VolumeOpLimiter,
    units,
};
use std::sync::Arc;
use tracing::{debug, info, instrument};

/// Result of a controller side expansion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExpandOutcome {
    /// Backend capacity after the expansion.
    pub capacity_mb: u64,
    /// The volume is attached and its filesystem must be grown by the node.
    pub fs_resize_required: bool,
}

/// Grows backend volumes.
/// Expansions are idempotent: a target at or below the backend capacity succeeds
/// without touching the backend. At most one expansion is in flight per volume.
#[derive(Clone)]
pub struct ControllerExpander {
    backend: Arc<dyn StorageBackend>,
    limiter: VolumeOpLimiter,
    online_expansion: bool,
}

impl ControllerExpander {
    /// Return a new `Self`.
    pub fn new(
        backend: Arc<dyn StorageBackend>,
        limiter: VolumeOpLimiter,
        online_expansion: bool,
    ) -> Self {
        Self {
            backend,
            limiter,
            online_expansion,
        }
    }

    /// Expand the backend volume to at least `target_bytes`, rounded up to whole MiB.
    #[instrument(level = "info", skip(self), err)]
    pub async fn expand(&self, volume_id: &str, target_bytes: u64) -> Result<ExpandOutcome, Error> {
        if target_bytes == 0 {
            return Err(Error::InvalidCapacity {
                value: target_bytes.to_string(),
                reason: "target capacity must be greater than zero".to_string(),
            });
        }
        let target_mb = units::bytes_to_mib(target_bytes);

        let _guard = self.limiter.reserve(volume_id)?;

        let volume = self.backend.query_volume(volume_id).await?;
        let capacity_mb = match &volume.backing {
            BackingDetails::Block { capacity_in_mb } => *capacity_in_mb,
            BackingDetails::File { .. } => {
                return Err(Error::UnsupportedVolumeKind {
                    volume: volume_id.to_string(),
                })
            }
        };
        if target_mb <= capacity_mb {
            debug!(
                volume.id = volume_id,
                capacity_mb, target_mb, "Backend volume already has the target capacity"
            );
            return Ok(ExpandOutcome {
                capacity_mb,
                fs_resize_required: volume.attachment.is_attached(),
            });
        }
        if volume.attachment.is_attached() && !self.online_expansion {
            return Err(Error::OnlineExpansionUnsupported {
                volume: volume_id.to_string(),
            });
        }

        self.backend.expand_volume(volume_id, target_mb).await?;

        let volume = self.backend.query_volume(volume_id).await?;
        if volume.capacity_mb() < target_mb {
            return Err(Error::CapacityNotHonored {
                volume: volume_id.to_string(),
                expected_mb: target_mb,
                actual_mb: volume.capacity_mb(),
            });
        }
        info!(
            volume.id = volume_id,
            from_mb = capacity_mb,
            to_mb = volume.capacity_mb(),
            "Expanded backend volume"
        );
        Ok(ExpandOutcome {
            capacity_mb: volume.capacity_mb(),
            fs_resize_required: volume.attachment.is_attached(),
        })
    }
}
