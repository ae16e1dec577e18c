//! This module consists of the filesystem type definition shared between the
//! controller and the node agent.
use strum_macros::EnumString;

/// A type to enumerate the filesystems found on resized volumes.
#[derive(EnumString, Clone, Debug, Eq, PartialEq)]
#[strum(serialize_all = "lowercase")]
pub enum FileSystem {
    Ext4,
    Xfs,
    Btrfs,
    #[strum(default)]
    Unsupported(String),
}

impl FileSystem {
    /// Check if the filesystem can be grown online.
    pub fn is_supported(&self) -> bool {
        !matches!(self, Self::Unsupported(_))
    }
}

// Implement as ref for the FileSystem.
impl AsRef<str> for FileSystem {
    fn as_ref(&self) -> &str {
        match self {
            FileSystem::Ext4 => "ext4",
            FileSystem::Xfs => "xfs",
            FileSystem::Btrfs => "btrfs",
            FileSystem::Unsupported(inner) => inner,
        }
    }
}

// Implement Display for the filesystem
impl std::fmt::Display for FileSystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_ref())
    }
}
