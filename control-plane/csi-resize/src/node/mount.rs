//! Utility functions for mounted filesystems.
use crate::{error::Error, filesystem::FileSystem, units};
use nix::sys::statvfs::statvfs;
use std::str::FromStr;

/// The mount table of the calling process.
pub const MOUNT_TABLE: &str = "/proc/self/mounts";

/// An entry of the mount table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountInfo {
    /// The mounted device.
    pub source: String,
    /// Where the device is mounted.
    pub dest: String,
    pub fs_type: FileSystem,
    pub options: Vec<String>,
}

// Mount table fields escape space, tab, newline and backslash as octal.
fn unescape(field: &str) -> String {
    let mut result = String::with_capacity(field.len());
    let mut rest = field;
    while let Some(index) = rest.find('\\') {
        result.push_str(&rest[.. index]);
        let octal = rest.get(index + 1 .. index + 4);
        match octal.and_then(|octal| u8::from_str_radix(octal, 8).ok()) {
            Some(byte) => {
                result.push(byte as char);
                rest = &rest[index + 4 ..];
            }
            None => {
                result.push('\\');
                rest = &rest[index + 1 ..];
            }
        }
    }
    result.push_str(rest);
    result
}

/// Parse the contents of a mount table, skipping malformed lines.
pub fn parse_mount_table(contents: &str) -> Vec<MountInfo> {
    contents
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let source = fields.next()?;
            let dest = fields.next()?;
            let fs_type = fields.next()?;
            let options = fields.next().unwrap_or_default();
            Some(MountInfo {
                source: unescape(source),
                dest: unescape(dest),
                fs_type: FileSystem::from_str(fs_type)
                    .unwrap_or_else(|_| FileSystem::Unsupported(fs_type.to_string())),
                options: options.split(',').map(str::to_string).collect(),
            })
        })
        .collect()
}

/// Read and parse the mount table at `path`.
pub async fn read_mount_table(path: &str) -> Result<Vec<MountInfo>, Error> {
    let contents = tokio::fs::read_to_string(path)
        .await
        .map_err(|source| Error::MountTable {
            path: path.to_string(),
            source,
        })?;
    Ok(parse_mount_table(&contents))
}

/// Find the mount at `path`. The most recent mount wins when mounts are stacked.
pub fn find_mount<'a>(mounts: &'a [MountInfo], path: &str) -> Option<&'a MountInfo> {
    let path = path.trim_end_matches('/');
    mounts.iter().rev().find(|mount| mount.dest == path)
}

/// Find the kubelet mount of a CSI persistent volume.
pub fn find_volume_mount<'a>(mounts: &'a [MountInfo], volume_name: &str) -> Option<&'a MountInfo> {
    let suffix = format!("/volumes/kubernetes.io~csi/{volume_name}/mount");
    mounts
        .iter()
        .rev()
        .find(|mount| mount.dest.starts_with(utils::KUBELET_DIR) && mount.dest.ends_with(&suffix))
}

/// Total size of the filesystem mounted at `path`, in MiB rounded down.
pub fn filesystem_size_mb(path: &str) -> Result<u64, Error> {
    let stat = statvfs(path).map_err(|source| Error::Statfs {
        path: path.to_string(),
        source,
    })?;
    let bytes = (stat.blocks() as u64).saturating_mul(stat.fragment_size() as u64);
    Ok(bytes / units::MIB)
}

#[cfg(test)]
mod test {
    use super::*;

    const TABLE: &str = "\
proc /proc proc rw,nosuid,nodev,noexec,relatime 0 0
/dev/sdb /var/lib/kubelet/pods/0f2c/volumes/kubernetes.io~csi/pvc-7d3e/mount ext4 rw,relatime 0 0
/dev/sdc /var/lib/kubelet/pods/9a41/volumes/kubernetes.io~csi/pvc-a1b2/mount xfs rw,relatime 0 0
/dev/sdd /mnt/with\\040space btrfs rw 0 0
";

    #[test]
    fn parse_table() {
        let mounts = parse_mount_table(TABLE);
        assert_eq!(mounts.len(), 4);
        assert_eq!(mounts[0].fs_type, FileSystem::Unsupported("proc".into()));
        assert_eq!(mounts[1].fs_type, FileSystem::Ext4);
        assert_eq!(mounts[3].dest, "/mnt/with space");
        assert_eq!(mounts[3].options, vec!["rw".to_string()]);
    }

    #[test]
    fn find_mounts() {
        let mounts = parse_mount_table(TABLE);
        let mount = find_volume_mount(&mounts, "pvc-a1b2").unwrap();
        assert_eq!(mount.source, "/dev/sdc");
        assert_eq!(mount.fs_type, FileSystem::Xfs);
        assert!(find_volume_mount(&mounts, "pvc-0000").is_none());

        let mount = find_mount(&mounts, "/mnt/with space/").unwrap();
        assert_eq!(mount.source, "/dev/sdd");
    }

    #[test]
    fn unescape_fields() {
        assert_eq!(unescape("a\\011b"), "a\tb");
        assert_eq!(unescape("trailing\\"), "trailing\\");
    }
}
