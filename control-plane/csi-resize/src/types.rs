use std::fmt::{Display, Formatter};
use strum_macros::{AsRefStr, Display as StrumDisplay, EnumString};

/// Namespaced identity of a claim.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClaimKey {
    pub namespace: String,
    pub name: String,
}

impl ClaimKey {
    /// Return a new `Self` from the namespace and name.
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl Display for ClaimKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Binding phase of a claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, AsRefStr, EnumString)]
pub enum ClaimPhase {
    #[default]
    Pending,
    Bound,
    Lost,
}

/// How the claim shares its volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AccessMode {
    /// Single node read-write, backed by a block volume.
    #[default]
    Block,
    /// Multi node access, backed by a file share.
    Shared,
}

impl AccessMode {
    /// Derive the access mode from kubernetes access mode strings.
    pub fn from_access_modes<'a>(modes: impl IntoIterator<Item = &'a String>) -> Self {
        match modes
            .into_iter()
            .any(|mode| mode == "ReadWriteMany" || mode == "ReadOnlyMany")
        {
            true => Self::Shared,
            false => Self::Block,
        }
    }
}

/// Pending-operation markers carried by the claim status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, AsRefStr, EnumString, StrumDisplay)]
pub enum ConditionType {
    /// The controller is expanding the backing volume.
    Resizing,
    /// Backend capacity grew, the filesystem has not caught up yet.
    FileSystemResizePending,
}

/// A claim status condition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimCondition {
    pub type_: ConditionType,
    pub message: Option<String>,
}

impl ClaimCondition {
    /// Return a new condition without a message.
    pub fn new(type_: ConditionType) -> Self {
        Self {
            type_,
            message: None,
        }
    }
    /// Attach a human readable message.
    pub fn with_message(self, message: impl Into<String>) -> Self {
        Self {
            message: Some(message.into()),
            ..self
        }
    }
}

/// Progress of a claim through the resize state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResizeState {
    /// Requested and achieved capacity agree.
    Bound,
    /// The backend volume must grow to the requested capacity.
    Expanding,
    /// Backend grew, waiting for the node to grow the filesystem.
    FileSystemResizePending,
}

/// A user's request for storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeClaim {
    pub key: ClaimKey,
    /// Optimistic concurrency token of the stored object.
    pub resource_version: Option<String>,
    pub storage_class: Option<String>,
    pub access_mode: AccessMode,
    /// Requested capacity.
    pub requested_bytes: u64,
    /// Bound volume name.
    pub volume_name: Option<String>,
    pub phase: ClaimPhase,
    /// Last capacity actually achieved.
    pub status_capacity_bytes: Option<u64>,
    pub conditions: Vec<ClaimCondition>,
}

impl VolumeClaim {
    /// Return a new pending claim requesting `requested_bytes`.
    pub fn new(key: ClaimKey, requested_bytes: u64) -> Self {
        Self {
            key,
            resource_version: None,
            storage_class: None,
            access_mode: AccessMode::Block,
            requested_bytes,
            volume_name: None,
            phase: ClaimPhase::Pending,
            status_capacity_bytes: None,
            conditions: vec![],
        }
    }
    /// Check if the claim carries the given condition.
    pub fn has_condition(&self, type_: ConditionType) -> bool {
        self.condition(type_).is_some()
    }
    /// Get the condition of the given type, if any.
    pub fn condition(&self, type_: ConditionType) -> Option<&ClaimCondition> {
        self.conditions.iter().find(|c| c.type_ == type_)
    }
    /// Set or replace a condition, keeping the order of the others.
    pub fn set_condition(&mut self, condition: ClaimCondition) {
        match self.conditions.iter_mut().find(|c| c.type_ == condition.type_) {
            Some(existing) => *existing = condition,
            None => self.conditions.push(condition),
        }
    }
    /// Remove a condition, returning whether it was present.
    pub fn clear_condition(&mut self, type_: ConditionType) -> bool {
        let before = self.conditions.len();
        self.conditions.retain(|c| c.type_ != type_);
        before != self.conditions.len()
    }
    /// The achieved capacity, zero if unknown.
    pub fn achieved_bytes(&self) -> u64 {
        self.status_capacity_bytes.unwrap_or_default()
    }
    /// Where the claim stands in the resize state machine.
    pub fn resize_state(&self) -> ResizeState {
        if self.has_condition(ConditionType::FileSystemResizePending) {
            ResizeState::FileSystemResizePending
        } else if self.phase == ClaimPhase::Bound && self.requested_bytes > self.achieved_bytes()
        {
            ResizeState::Expanding
        } else {
            ResizeState::Bound
        }
    }
}

/// How a volume came into existence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Provisioning {
    /// Created by the CSI provisioner for a claim.
    #[default]
    Dynamic,
    /// Pre-provisioned outside of kubernetes, eg: an FCD.
    Static,
}

/// The orchestrator's view of a backend volume.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Volume {
    pub name: String,
    pub resource_version: Option<String>,
    /// Backend volume identifier.
    pub volume_handle: String,
    pub capacity_bytes: u64,
    pub provisioning: Provisioning,
    pub claim_ref: Option<ClaimKey>,
}

/// Attachment state of a backend volume.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Attachment {
    #[default]
    Detached,
    Attached { node: String },
}

impl Attachment {
    /// Check if the volume is attached to any node.
    pub fn is_attached(&self) -> bool {
        matches!(self, Self::Attached { .. })
    }
}
