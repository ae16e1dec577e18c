//! This module consists of the filesystem specific grow operations, each of them
//! invoking the filesystem's own utility.

use crate::filesystem::FileSystem;
use async_trait::async_trait;
use std::process::Output;
use tokio::process::Command;
use tracing::trace;

/// Error type filesystem operations.
type Error = String;

/// Ext4 filesystem type.
pub(crate) struct Ext4Fs;
/// XFS filesystem type.
pub(crate) struct XFs;
/// BTRFS filesystem type.
pub(crate) struct BtrFs;

/// Convert the filesystem enumeration to specific filesystem types to access the
/// supported operations by them.
pub(crate) fn fs_ops(fs: &FileSystem) -> Result<&'static dyn FileSystemOps, Error> {
    static EXT4FS: Ext4Fs = Ext4Fs {};
    static XFS: XFs = XFs {};
    static BRTFS: BtrFs = BtrFs {};
    match fs {
        FileSystem::Ext4 => Ok(&EXT4FS),
        FileSystem::Xfs => Ok(&XFS),
        FileSystem::Btrfs => Ok(&BRTFS),
        FileSystem::Unsupported(_) => Err(format!("Unsupported filesystem {fs}")),
    }
}

#[async_trait]
pub(crate) trait FileSystemOps: Send + Sync {
    /// The utility used to grow the filesystem.
    fn binary(&self) -> &'static str;
    /// Grow the filesystem on `device`, mounted at `mount_path`, to fill the device.
    async fn expand(&self, device: &str, mount_path: &str) -> Result<(), Error>;
}

#[async_trait]
impl FileSystemOps for Ext4Fs {
    fn binary(&self) -> &'static str {
        "resize2fs"
    }

    async fn expand(&self, device: &str, _mount_path: &str) -> Result<(), Error> {
        let binary = self.binary();
        let output = Command::new(locate(binary)?)
            .arg(device)
            .output()
            .await
            .map_err(|error| format!("failed to execute {binary}: {error}"))?;
        ack_command_output(output, binary)
    }
}

#[async_trait]
impl FileSystemOps for XFs {
    fn binary(&self) -> &'static str {
        "xfs_growfs"
    }

    /// Xfs can only be grown while mounted.
    async fn expand(&self, _device: &str, mount_path: &str) -> Result<(), Error> {
        let binary = self.binary();
        let output = Command::new(locate(binary)?)
            .arg(mount_path)
            .output()
            .await
            .map_err(|error| format!("failed to execute {binary}: {error}"))?;
        ack_command_output(output, binary)
    }
}

#[async_trait]
impl FileSystemOps for BtrFs {
    fn binary(&self) -> &'static str {
        "btrfs"
    }

    async fn expand(&self, _device: &str, mount_path: &str) -> Result<(), Error> {
        let binary = self.binary();
        let output = Command::new(locate(binary)?)
            .arg("filesystem")
            .arg("resize")
            .arg("max")
            .arg(mount_path)
            .output()
            .await
            .map_err(|error| format!("failed to execute {binary}: {error}"))?;
        ack_command_output(output, binary)
    }
}

/// Find the utility in the `PATH`, a missing tool is reported rather than attempted.
fn locate(binary: &str) -> Result<std::path::PathBuf, Error> {
    which::which(binary).map_err(|error| format!("{binary} utility is not available: {error}"))
}

// Acknowledge the output from Command.
fn ack_command_output(output: Output, binary: &str) -> Result<(), Error> {
    trace!(
        "Output from {} command: {}, status code: {:?}",
        binary,
        String::from_utf8_lossy(&output.stdout),
        output.status.code()
    );

    if output.status.success() {
        return Ok(());
    }

    Err(format!(
        "{} command failed: {}",
        binary,
        String::from_utf8_lossy(&output.stderr)
    ))
}
