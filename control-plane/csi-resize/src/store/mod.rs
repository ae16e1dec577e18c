//! Orchestrator object store.
//!
//! Claims and volumes live in the orchestrator. Requests are written through the
//! spec path and resize progress through the status path, both with an optimistic
//! concurrency precondition on the claim's resource version.

/// Kubernetes api-server store.
pub mod k8s;
/// In-memory store.
pub mod memory;

use crate::{
    error::Error,
    types::{Attachment, ClaimKey, Volume, VolumeClaim},
};
use async_trait::async_trait;
use std::collections::HashSet;
use strum_macros::{AsRefStr, Display};
use tracing::trace;

/// Attempts of a status read-modify-write before the conflict is returned.
const STATUS_UPDATE_ATTEMPTS: usize = 5;

/// Severity of a claim event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, AsRefStr, Display)]
pub enum EventType {
    Normal,
    Warning,
}

/// Why a claim event was recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, AsRefStr, Display)]
pub enum EventReason {
    /// The controller started expanding the backend volume.
    Resizing,
    /// The backend volume grew but the filesystem has to be grown by the node.
    FileSystemResizeRequired,
    /// The node grew the filesystem.
    FileSystemResizeSuccessful,
    /// The expansion completed.
    VolumeResizeSuccessful,
    /// The expansion failed, it may be retried.
    VolumeResizeFailed,
}

/// An event attached to a claim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimEvent {
    pub type_: EventType,
    pub reason: EventReason,
    pub message: String,
}

impl ClaimEvent {
    /// A normal event.
    pub fn normal(reason: EventReason, message: impl Into<String>) -> Self {
        Self {
            type_: EventType::Normal,
            reason,
            message: message.into(),
        }
    }
    /// A warning event.
    pub fn warning(reason: EventReason, message: impl Into<String>) -> Self {
        Self {
            type_: EventType::Warning,
            reason,
            message: message.into(),
        }
    }
}

/// Claim and volume access consumed from the orchestrator.
#[async_trait]
pub trait ClaimStore: Send + Sync {
    /// Get a claim, `Error::ClaimNotFound` if it does not exist.
    async fn get_claim(&self, key: &ClaimKey) -> Result<VolumeClaim, Error>;
    /// List all claims.
    async fn list_claims(&self) -> Result<Vec<VolumeClaim>, Error>;
    /// Write a new storage request into the claim.
    /// Fails with `Error::Conflict` if `claim` is not the latest revision.
    async fn update_claim_request(
        &self,
        claim: &VolumeClaim,
        requested_bytes: u64,
    ) -> Result<VolumeClaim, Error>;
    /// Write the status capacity and conditions of `claim` through the status path.
    /// Fails with `Error::Conflict` if `claim` is not the latest revision.
    async fn patch_claim_status(&self, claim: &VolumeClaim) -> Result<VolumeClaim, Error>;
    /// Get a volume, `Error::VolumeNotFound` if it does not exist.
    async fn get_volume(&self, name: &str) -> Result<Volume, Error>;
    /// Set the capacity of a volume.
    async fn patch_volume_capacity(&self, name: &str, capacity_bytes: u64)
        -> Result<Volume, Error>;
    /// Check if the storage class allows volume expansion.
    /// A missing class does not allow expansion.
    async fn get_storage_class_expansion(&self, storage_class: &str) -> Result<bool, Error>;
    /// Attachment of the volume, as seen by the orchestrator.
    async fn volume_attachment(&self, volume: &Volume) -> Result<Attachment, Error>;
    /// Names of the volumes attached to `node`.
    async fn attached_volumes(&self, node: &str) -> Result<HashSet<String>, Error>;
    /// Record an event against a claim.
    async fn record_event(&self, claim: &ClaimKey, event: ClaimEvent) -> Result<(), Error>;
}

/// Apply `mutate` to the latest revision of a claim and write its status back.
/// `mutate` returns false when the claim needs no change, in which case nothing is
/// written and `None` is returned. Lost races are retried against a fresh read.
pub async fn update_claim_status<F>(
    store: &dyn ClaimStore,
    key: &ClaimKey,
    mut mutate: F,
) -> Result<Option<VolumeClaim>, Error>
where
    F: FnMut(&mut VolumeClaim) -> bool + Send,
{
    let mut attempt = 1;
    loop {
        let mut claim = store.get_claim(key).await?;
        if !mutate(&mut claim) {
            return Ok(None);
        }
        match store.patch_claim_status(&claim).await {
            Ok(claim) => return Ok(Some(claim)),
            Err(Error::Conflict { .. }) if attempt < STATUS_UPDATE_ATTEMPTS => {
                trace!(claim = %key, attempt, "Claim status update conflicted, retrying");
                attempt += 1;
            }
            Err(error) => return Err(error),
        }
    }
}
