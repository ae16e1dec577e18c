//! Node side filesystem resize.
//!
//! Once the controller grew the backend volume of an attached claim it marks the
//! claim with `FileSystemResizePending`. The node the volume is attached to grows
//! the mounted filesystem, and only then clears the condition and publishes the new
//! capacity. The condition stays in place on failure so the next pass retries.
//! Volumes expanded while unattached carry no condition, their filesystems are grown
//! when the node first sees them mounted.

/// Filesystem specific grow utilities.
mod filesystem_ops;
/// In-memory filesystems.
pub mod memory;
/// Mount table helpers.
pub mod mount;

use crate::{
    error::Error,
    store::{update_claim_status, ClaimEvent, ClaimStore, EventReason},
    types::{ClaimCondition, ClaimKey, ConditionType, VolumeClaim},
    units,
};
use async_trait::async_trait;
use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex, MutexGuard},
};
use tracing::{debug, error, info, instrument};

/// Access to the filesystems mounted on this node.
#[async_trait]
pub trait FilesystemResizer: Send + Sync {
    /// Size of the filesystem mounted at `mount_path`, in MiB.
    async fn size_mb(&self, mount_path: &str) -> Result<u64, Error>;
    /// Grow the filesystem mounted at `mount_path` to fill its device.
    async fn grow(&self, mount_path: &str) -> Result<(), Error>;
    /// Where the given persistent volume is mounted on this node, if anywhere.
    async fn volume_mount(&self, volume_name: &str) -> Result<Option<String>, Error>;
}

/// The filesystems of the host, found through the mount table.
#[derive(Debug, Clone)]
pub struct HostFilesystem {
    mount_table: String,
}

impl Default for HostFilesystem {
    fn default() -> Self {
        Self::new(mount::MOUNT_TABLE)
    }
}

impl HostFilesystem {
    /// Return a new `Self` reading mounts from `mount_table`.
    pub fn new(mount_table: impl Into<String>) -> Self {
        Self {
            mount_table: mount_table.into(),
        }
    }
}

#[async_trait]
impl FilesystemResizer for HostFilesystem {
    async fn size_mb(&self, mount_path: &str) -> Result<u64, Error> {
        let path = mount_path.to_string();
        tokio::task::spawn_blocking(move || mount::filesystem_size_mb(&path))
            .await
            .map_err(|error| Error::FilesystemResize {
                mount: mount_path.to_string(),
                message: error.to_string(),
            })?
    }

    #[instrument(level = "debug", skip(self), err)]
    async fn grow(&self, mount_path: &str) -> Result<(), Error> {
        let mounts = mount::read_mount_table(&self.mount_table).await?;
        let mount = mount::find_mount(&mounts, mount_path).ok_or_else(|| Error::MountNotFound {
            path: mount_path.to_string(),
        })?;
        let ops = filesystem_ops::fs_ops(&mount.fs_type).map_err(|_| {
            Error::UnsupportedFilesystem {
                fs_type: mount.fs_type.to_string(),
            }
        })?;
        ops.expand(&mount.source, &mount.dest)
            .await
            .map_err(|message| Error::FilesystemResize {
                mount: mount_path.to_string(),
                message,
            })
    }

    async fn volume_mount(&self, volume_name: &str) -> Result<Option<String>, Error> {
        let mounts = mount::read_mount_table(&self.mount_table).await?;
        Ok(mount::find_volume_mount(&mounts, volume_name).map(|mount| mount.dest.clone()))
    }
}

/// Outcome of a node resize pass over one claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeResize {
    /// The claim has no pending filesystem resize.
    NotPending,
    /// The filesystem was grown and the condition cleared.
    Resized { before_mb: u64, after_mb: u64 },
}

/// Grows filesystems of claims with a pending filesystem resize, and the filesystems
/// of volumes which were expanded while unattached once they are mounted.
#[derive(Clone)]
pub struct NodeResizer {
    store: Arc<dyn ClaimStore>,
    filesystem: Arc<dyn FilesystemResizer>,
    /// Volume capacity each mount was last grown to.
    grown: Arc<Mutex<HashMap<String, u64>>>,
}

impl NodeResizer {
    /// Return a new `Self`.
    pub fn new(store: Arc<dyn ClaimStore>, filesystem: Arc<dyn FilesystemResizer>) -> Self {
        Self {
            store,
            filesystem,
            grown: Default::default(),
        }
    }

    fn grown(&self) -> MutexGuard<'_, HashMap<String, u64>> {
        self.grown
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Grow the filesystem at `mount_path` if the claim is waiting for it, then clear
    /// the pending condition and publish the volume capacity as achieved.
    #[instrument(level = "info", skip(self), fields(claim = %key), err)]
    pub async fn resize_pending(
        &self,
        key: &ClaimKey,
        mount_path: &str,
    ) -> Result<NodeResize, Error> {
        let claim = self.store.get_claim(key).await?;
        if !claim.has_condition(ConditionType::FileSystemResizePending) {
            return Ok(NodeResize::NotPending);
        }
        let volume_name = claim.volume_name.clone().ok_or_else(|| Error::ClaimNotBound {
            claim: key.to_string(),
        })?;

        let (before_mb, after_mb) = match self.expand_on_mount(mount_path).await {
            Ok(sizes) => sizes,
            Err(error) => {
                self.record_failure(key, &error).await?;
                return Err(error);
            }
        };

        let volume = self.store.get_volume(&volume_name).await?;
        let capacity = volume.capacity_bytes;
        let published = update_claim_status(self.store.as_ref(), key, |claim| {
            if !claim.clear_condition(ConditionType::FileSystemResizePending) {
                return false;
            }
            let status = claim.status_capacity_bytes.unwrap_or_default();
            claim.status_capacity_bytes = Some(status.max(capacity));
            true
        })
        .await?;
        self.grown().insert(mount_path.to_string(), capacity);

        if published.is_some() {
            info!(claim = %key, before_mb, after_mb, "Filesystem resize completed");
            self.notify(
                key,
                ClaimEvent::normal(
                    EventReason::FileSystemResizeSuccessful,
                    format!(
                        "MountVolume.NodeExpandVolume succeeded for volume {volume_name}, capacity {}",
                        units::bytes_to_quantity(capacity).0
                    ),
                ),
            )
            .await;
        }
        Ok(NodeResize::Resized {
            before_mb,
            after_mb,
        })
    }

    /// Grow the filesystem at `mount_path` to fill its device.
    /// Used for volumes expanded offline and found grown at mount time. Returns the
    /// filesystem size before and after, the size never shrinks.
    pub async fn expand_on_mount(&self, mount_path: &str) -> Result<(u64, u64), Error> {
        let before_mb = self.filesystem.size_mb(mount_path).await?;
        self.filesystem.grow(mount_path).await?;
        let after_mb = self.filesystem.size_mb(mount_path).await?;
        if after_mb < before_mb {
            return Err(Error::FilesystemShrunk {
                mount: mount_path.to_string(),
                before_mb,
                after_mb,
            });
        }
        debug!(mount_path, before_mb, after_mb, "Filesystem grown");
        Ok((before_mb, after_mb))
    }

    /// Resize the filesystems of the claims whose volumes are attached to `node`.
    /// Pending claims are resized and published. Any other mounted volume is grown
    /// once per mount and volume capacity, which covers volumes expanded while
    /// unattached. Failures are logged, recorded on pending claims and retried on the
    /// next pass. Returns the number of filesystems grown.
    pub async fn reconcile_node(&self, node: &str) -> Result<usize, Error> {
        let attached = self.store.attached_volumes(node).await?;
        let mut mounts = HashSet::new();
        let mut resized = 0;

        for claim in self.store.list_claims().await? {
            let Some(volume_name) = claim.volume_name.as_deref() else {
                continue;
            };
            if !attached.contains(volume_name) {
                continue;
            }
            let mount_path = match self.filesystem.volume_mount(volume_name).await {
                Ok(Some(mount_path)) => mount_path,
                Ok(None) => {
                    debug!(claim = %claim.key, volume_name, "Volume is not mounted yet");
                    continue;
                }
                Err(error) => {
                    error!(claim = %claim.key, %error, "Failed to find the volume mount");
                    continue;
                }
            };
            mounts.insert(mount_path.clone());

            if claim.has_condition(ConditionType::FileSystemResizePending) {
                match self.resize_pending(&claim.key, &mount_path).await {
                    Ok(NodeResize::Resized { .. }) => resized += 1,
                    Ok(NodeResize::NotPending) => {}
                    Err(error) => error!(claim = %claim.key, %error, "Filesystem resize failed"),
                }
                continue;
            }

            match self.grow_mounted(&claim, volume_name, &mount_path).await {
                Ok(true) => resized += 1,
                Ok(false) => {}
                Err(error) => error!(claim = %claim.key, %error, "Filesystem resize failed"),
            }
        }

        self.grown().retain(|mount_path, _| mounts.contains(mount_path));
        Ok(resized)
    }

    /// Grow a mounted filesystem which was not grown for its volume's capacity yet.
    async fn grow_mounted(
        &self,
        claim: &VolumeClaim,
        volume_name: &str,
        mount_path: &str,
    ) -> Result<bool, Error> {
        let capacity = self.store.get_volume(volume_name).await?.capacity_bytes;
        if self.grown().get(mount_path) == Some(&capacity) {
            return Ok(false);
        }
        let (before_mb, after_mb) = self.expand_on_mount(mount_path).await?;
        self.grown().insert(mount_path.to_string(), capacity);
        if after_mb == before_mb {
            return Ok(false);
        }

        info!(claim = %claim.key, before_mb, after_mb, "Filesystem grown on mount");
        self.notify(
            &claim.key,
            ClaimEvent::normal(
                EventReason::FileSystemResizeSuccessful,
                format!(
                    "MountVolume.NodeExpandVolume succeeded for volume {volume_name}, capacity {}",
                    units::bytes_to_quantity(capacity).0
                ),
            ),
        )
        .await;
        Ok(true)
    }

    async fn record_failure(&self, key: &ClaimKey, error: &Error) -> Result<(), Error> {
        let message = error.to_string();
        let recorded = update_claim_status(self.store.as_ref(), key, |claim| {
            if !claim.has_condition(ConditionType::FileSystemResizePending) {
                return false;
            }
            claim.set_condition(
                ClaimCondition::new(ConditionType::FileSystemResizePending)
                    .with_message(message.clone()),
            );
            true
        })
        .await?;
        if recorded.is_some() {
            self.notify(
                key,
                ClaimEvent::warning(EventReason::VolumeResizeFailed, message),
            )
            .await;
        }
        Ok(())
    }

    async fn notify(&self, claim: &ClaimKey, event: ClaimEvent) {
        if let Err(error) = self.store.record_event(claim, event).await {
            debug!(%claim, %error, "Failed to record event");
        }
    }
}
