use snafu::Snafu;
use std::time::Duration;

/// Errors raised along the resize lifecycle.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)), context(suffix(false)))]
pub enum Error {
    #[snafu(display(
        "Claim '{}' cannot shrink from {} to {} bytes: volume shrinking is not supported",
        claim,
        current,
        requested
    ))]
    ShrinkNotSupported {
        claim: String,
        current: u64,
        requested: u64,
    },
    #[snafu(display(
        "Claim '{}' cannot be expanded: storage class '{}' does not allow volume expansion",
        claim,
        storage_class
    ))]
    ExpansionDisabled { claim: String, storage_class: String },
    #[snafu(display("Volume '{}' is a file volume, expansion is not supported", volume))]
    UnsupportedVolumeKind { volume: String },
    #[snafu(display(
        "Volume '{}' was statically provisioned, expansion is not supported",
        volume
    ))]
    StaticProvisioningUnsupported { volume: String },
    #[snafu(display("Online expansion of attached volume '{}' is not supported", volume))]
    OnlineExpansionUnsupported { volume: String },
    #[snafu(display("Invalid capacity '{}': {}", value, reason))]
    InvalidCapacity { value: String, reason: String },
    #[snafu(display("Invalid quantity '{}'", quantity))]
    InvalidQuantity { quantity: String },
    #[snafu(display("Invalid argument: {}", message))]
    InvalidArgument { message: String },
    #[snafu(display("Existing resize operation is in progress for volume: {}", id))]
    OperationInProgress { id: String },
    #[snafu(display("Volume '{}' not found", volume))]
    VolumeNotFound { volume: String },
    #[snafu(display("Claim '{}' not found", claim))]
    ClaimNotFound { claim: String },
    #[snafu(display("Claim '{}' is not bound to a volume", claim))]
    ClaimNotBound { claim: String },
    #[snafu(display("Storage backend failed for volume '{}': {}", volume, message))]
    Backend { volume: String, message: String },
    #[snafu(display(
        "Backend capacity of volume '{}' is {}MiB, expected at least {}MiB",
        volume,
        actual_mb,
        expected_mb
    ))]
    CapacityNotHonored {
        volume: String,
        expected_mb: u64,
        actual_mb: u64,
    },
    #[snafu(display("Update of '{}' conflicted with a newer revision", object))]
    Conflict { object: String },
    #[snafu(display("Kubernetes client error: {}", source))]
    Kube { source: kube::Error },
    #[snafu(display("HTTP request to '{}' failed: {}", url, source))]
    Http { url: String, source: reqwest::Error },
    #[snafu(display("Invalid response from '{}': {}", url, message))]
    InvalidResponse { url: String, message: String },
    #[snafu(display("Timed out after {:?} waiting for {}", timeout, operation))]
    Timeout {
        operation: String,
        timeout: Duration,
    },
    #[snafu(display("Failed to resize filesystem at '{}': {}", mount, message))]
    FilesystemResize { mount: String, message: String },
    #[snafu(display(
        "Filesystem at '{}' shrunk from {}MiB to {}MiB during resize",
        mount,
        before_mb,
        after_mb
    ))]
    FilesystemShrunk {
        mount: String,
        before_mb: u64,
        after_mb: u64,
    },
    #[snafu(display("Filesystem '{}' is not supported for resize", fs_type))]
    UnsupportedFilesystem { fs_type: String },
    #[snafu(display("No mount found at '{}'", path))]
    MountNotFound { path: String },
    #[snafu(display("Failed to read the mount table '{}': {}", path, source))]
    MountTable {
        path: String,
        source: std::io::Error,
    },
    #[snafu(display("Failed to stat filesystem at '{}': {}", path, source))]
    Statfs {
        path: String,
        source: nix::errno::Errno,
    },
}

impl Error {
    /// Intake rejections and malformed requests: surfaced immediately, never retried.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::ShrinkNotSupported { .. }
                | Self::ExpansionDisabled { .. }
                | Self::UnsupportedVolumeKind { .. }
                | Self::StaticProvisioningUnsupported { .. }
                | Self::InvalidCapacity { .. }
                | Self::InvalidQuantity { .. }
                | Self::InvalidArgument { .. }
        )
    }

    /// Errors which are expected to clear on their own and are simply retried.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Backend { .. }
            | Self::OperationInProgress { .. }
            | Self::Conflict { .. }
            | Self::Http { .. }
            | Self::CapacityNotHonored { .. }
            | Self::FilesystemResize { .. }
            | Self::ClaimNotBound { .. }
            | Self::MountNotFound { .. } => true,
            Self::Kube { source } => !matches!(
                source,
                kube::Error::Api(response) if response.code == 400 || response.code == 403
            ),
            _ => false,
        }
    }

    /// Controller expansion failures which will not succeed by retrying the same request.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::UnsupportedVolumeKind { .. }
                | Self::StaticProvisioningUnsupported { .. }
                | Self::OnlineExpansionUnsupported { .. }
                | Self::VolumeNotFound { .. }
                | Self::InvalidCapacity { .. }
                | Self::InvalidArgument { .. }
        )
    }

    /// A bounded wait ran out of budget.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

impl From<crate::limiter::Error> for Error {
    fn from(error: crate::limiter::Error) -> Self {
        match error {
            crate::limiter::Error::OperationInProgress { id } => Self::OperationInProgress { id },
            crate::limiter::Error::InvalidVolumeId { id } => Self::InvalidArgument {
                message: format!("volume id '{id}' is not valid"),
            },
        }
    }
}

impl From<kube::Error> for Error {
    fn from(source: kube::Error) -> Self {
        Self::Kube { source }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn classification() {
        let shrink = Error::ShrinkNotSupported {
            claim: "ns/pvc".into(),
            current: 2,
            requested: 1,
        };
        assert!(shrink.is_validation());
        assert!(!shrink.is_transient());
        assert!(!shrink.is_timeout());

        let busy = Error::OperationInProgress { id: "vol".into() };
        assert!(busy.is_transient());
        assert!(!busy.is_terminal());

        let timeout = Error::Timeout {
            operation: "controller resize".into(),
            timeout: Duration::from_secs(1),
        };
        assert!(timeout.is_timeout());
        assert!(!timeout.is_validation());
        assert!(!timeout.is_transient());

        let online = Error::OnlineExpansionUnsupported { volume: "vol".into() };
        assert!(online.is_terminal());
    }

    #[test]
    fn display() {
        let error = Error::CapacityNotHonored {
            volume: "vol-1".into(),
            expected_mb: 3072,
            actual_mb: 2048,
        };
        assert_eq!(
            error.to_string(),
            "Backend capacity of volume 'vol-1' is 2048MiB, expected at least 3072MiB"
        );
    }
}
