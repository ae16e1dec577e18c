use super::FilesystemResizer;
use crate::{backend::memory::MemoryBackend, error::Error};
use async_trait::async_trait;
use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard},
};

#[derive(Debug, Default)]
struct Mounted {
    volume_name: String,
    volume_id: String,
    size_mb: u64,
}

#[derive(Debug, Default)]
struct Inner {
    mounts: HashMap<String, Mounted>,
    failures: u32,
    shrink_by_mb: u64,
    grows: u64,
}

/// Filesystems kept in memory on top of the volumes of a `MemoryBackend`.
/// Growing a filesystem makes it as large as its backend volume.
#[derive(Debug, Clone)]
pub struct MemoryFilesystem {
    backend: MemoryBackend,
    inner: Arc<Mutex<Inner>>,
}

impl MemoryFilesystem {
    /// Return a new `Self` with no mounts.
    pub fn new(backend: MemoryBackend) -> Self {
        Self {
            backend,
            inner: Default::default(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Mount the filesystem of a backend volume at `mount_path`.
    pub fn mount(&self, mount_path: &str, volume_name: &str, volume_id: &str, size_mb: u64) {
        self.lock().mounts.insert(
            mount_path.to_string(),
            Mounted {
                volume_name: volume_name.to_string(),
                volume_id: volume_id.to_string(),
                size_mb,
            },
        );
    }

    /// Unmount the filesystem at `mount_path`.
    pub fn unmount(&self, mount_path: &str) {
        self.lock().mounts.remove(mount_path);
    }

    /// Fail the next `count` grows.
    pub fn fail_next_grows(&self, count: u32) {
        self.lock().failures = count;
    }

    /// Make grows lose `mb` MiB instead of growing.
    pub fn shrink_on_grow(&self, mb: u64) {
        self.lock().shrink_by_mb = mb;
    }

    /// Number of successful grows.
    pub fn grows(&self) -> u64 {
        self.lock().grows
    }

    /// Current size of the filesystem at `mount_path`.
    pub fn mounted_size_mb(&self, mount_path: &str) -> Option<u64> {
        self.lock().mounts.get(mount_path).map(|m| m.size_mb)
    }
}

#[async_trait]
impl FilesystemResizer for MemoryFilesystem {
    async fn size_mb(&self, mount_path: &str) -> Result<u64, Error> {
        self.mounted_size_mb(mount_path)
            .ok_or_else(|| Error::MountNotFound {
                path: mount_path.to_string(),
            })
    }

    async fn grow(&self, mount_path: &str) -> Result<(), Error> {
        let volume_id = self
            .lock()
            .mounts
            .get(mount_path)
            .map(|m| m.volume_id.clone())
            .ok_or_else(|| Error::MountNotFound {
                path: mount_path.to_string(),
            })?;
        let device_mb = self.backend.capacity_mb(&volume_id).unwrap_or_default();

        let mut inner = self.lock();
        if inner.failures > 0 {
            inner.failures -= 1;
            return Err(Error::FilesystemResize {
                mount: mount_path.to_string(),
                message: "injected grow failure".to_string(),
            });
        }
        let shrink_by_mb = inner.shrink_by_mb;
        inner.grows += 1;
        if let Some(mounted) = inner.mounts.get_mut(mount_path) {
            mounted.size_mb = match shrink_by_mb {
                0 => mounted.size_mb.max(device_mb),
                shrink => mounted.size_mb.saturating_sub(shrink),
            };
        }
        Ok(())
    }

    async fn volume_mount(&self, volume_name: &str) -> Result<Option<String>, Error> {
        Ok(self
            .lock()
            .mounts
            .iter()
            .find(|(_, mounted)| mounted.volume_name == volume_name)
            .map(|(path, _)| path.clone()))
    }
}
