//! Admission of capacity requests.
//!
//! Every request to change a claim's capacity passes through here before it is
//! written. Rejections are returned to the caller of the capacity update, the
//! stored request is never modified by a rejected request.

use crate::{
    error::Error,
    types::{AccessMode, ClaimKey, Provisioning, Volume, VolumeClaim},
};

/// A claim asking for a new capacity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResizeRequest {
    pub claim: ClaimKey,
    /// Currently requested capacity.
    pub current_bytes: u64,
    /// Newly requested capacity.
    pub requested_bytes: u64,
    /// The storage class, if any.
    pub storage_class: Option<String>,
    /// Expansion flag inherited from the storage class.
    pub expansion_allowed: bool,
    pub access_mode: AccessMode,
    pub provisioning: Provisioning,
}

impl ResizeRequest {
    /// Build a request for `claim`, bound to `volume`, to grow to `requested_bytes`.
    pub fn new(
        claim: &VolumeClaim,
        volume: &Volume,
        expansion_allowed: bool,
        requested_bytes: u64,
    ) -> Self {
        Self {
            claim: claim.key.clone(),
            current_bytes: claim.requested_bytes,
            requested_bytes,
            storage_class: claim.storage_class.clone(),
            expansion_allowed,
            access_mode: claim.access_mode,
            provisioning: volume.provisioning,
        }
    }
}

/// Outcome of a successful admission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// The request equals the current capacity, nothing to do.
    Unchanged,
    /// The request is a valid increase.
    Accepted { from: u64, to: u64 },
}

/// Validates capacity requests.
#[derive(Debug, Default, Clone, Copy)]
pub struct ResizeIntake {}

impl ResizeIntake {
    /// Admit or reject the request.
    /// A shrink is always rejected first, whatever the state of the class or the volume.
    pub fn admit(&self, request: &ResizeRequest) -> Result<Admission, Error> {
        let claim = request.claim.to_string();
        if request.requested_bytes < request.current_bytes {
            return Err(Error::ShrinkNotSupported {
                claim,
                current: request.current_bytes,
                requested: request.requested_bytes,
            });
        }
        if request.requested_bytes == request.current_bytes {
            return Ok(Admission::Unchanged);
        }
        if !request.expansion_allowed {
            return Err(Error::ExpansionDisabled {
                claim,
                storage_class: request.storage_class.clone().unwrap_or_default(),
            });
        }
        match (request.access_mode, request.provisioning) {
            (AccessMode::Shared, _) => Err(Error::UnsupportedVolumeKind { volume: claim }),
            (_, Provisioning::Static) => {
                Err(Error::StaticProvisioningUnsupported { volume: claim })
            }
            (AccessMode::Block, Provisioning::Dynamic) => Ok(Admission::Accepted {
                from: request.current_bytes,
                to: request.requested_bytes,
            }),
        }
    }
}
