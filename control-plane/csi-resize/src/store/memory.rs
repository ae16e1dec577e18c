use super::{ClaimEvent, ClaimStore};
use crate::{
    error::Error,
    types::{Attachment, ClaimKey, Volume, VolumeClaim},
};
use async_trait::async_trait;
use std::{
    collections::{BTreeMap, HashMap, HashSet},
    sync::{Arc, Mutex, MutexGuard},
};

#[derive(Debug, Default)]
struct Inner {
    claims: BTreeMap<ClaimKey, VolumeClaim>,
    volumes: BTreeMap<String, Volume>,
    classes: HashMap<String, bool>,
    attachments: HashMap<String, Attachment>,
    events: Vec<(ClaimKey, ClaimEvent)>,
    revision: u64,
}

impl Inner {
    fn next_revision(&mut self) -> Option<String> {
        self.revision += 1;
        Some(self.revision.to_string())
    }
}

/// A store which keeps claims and volumes in memory.
/// Every write bumps the object's resource version like the api-server does.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryStore {
    /// Return a new, empty, store.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Add or replace a storage class.
    pub fn insert_class(&self, name: &str, allow_expansion: bool) {
        self.lock().classes.insert(name.to_string(), allow_expansion);
    }

    /// Add or replace a claim.
    pub fn insert_claim(&self, mut claim: VolumeClaim) -> VolumeClaim {
        let mut inner = self.lock();
        claim.resource_version = inner.next_revision();
        inner.claims.insert(claim.key.clone(), claim.clone());
        claim
    }

    /// Add or replace a volume.
    pub fn insert_volume(&self, mut volume: Volume) -> Volume {
        let mut inner = self.lock();
        volume.resource_version = inner.next_revision();
        inner.volumes.insert(volume.name.clone(), volume.clone());
        volume
    }

    /// Remove a claim.
    pub fn remove_claim(&self, key: &ClaimKey) -> Option<VolumeClaim> {
        self.lock().claims.remove(key)
    }

    /// Remove a volume.
    pub fn remove_volume(&self, name: &str) -> Option<Volume> {
        let mut inner = self.lock();
        inner.attachments.remove(name);
        inner.volumes.remove(name)
    }

    /// Set the orchestrator's view of a volume attachment.
    pub fn set_attachment(&self, volume: &str, attachment: Attachment) {
        self.lock()
            .attachments
            .insert(volume.to_string(), attachment);
    }

    /// Events recorded against a claim, oldest first.
    pub fn events(&self, key: &ClaimKey) -> Vec<ClaimEvent> {
        self.lock()
            .events
            .iter()
            .filter(|(claim, _)| claim == key)
            .map(|(_, event)| event.clone())
            .collect()
    }
}

#[async_trait]
impl ClaimStore for MemoryStore {
    async fn get_claim(&self, key: &ClaimKey) -> Result<VolumeClaim, Error> {
        self.lock()
            .claims
            .get(key)
            .cloned()
            .ok_or_else(|| Error::ClaimNotFound {
                claim: key.to_string(),
            })
    }

    async fn list_claims(&self) -> Result<Vec<VolumeClaim>, Error> {
        Ok(self.lock().claims.values().cloned().collect())
    }

    async fn update_claim_request(
        &self,
        claim: &VolumeClaim,
        requested_bytes: u64,
    ) -> Result<VolumeClaim, Error> {
        let mut inner = self.lock();
        let revision = inner.next_revision();
        let stored = inner
            .claims
            .get_mut(&claim.key)
            .ok_or_else(|| Error::ClaimNotFound {
                claim: claim.key.to_string(),
            })?;
        if stored.resource_version != claim.resource_version {
            return Err(Error::Conflict {
                object: claim.key.to_string(),
            });
        }
        stored.requested_bytes = requested_bytes;
        stored.resource_version = revision;
        Ok(stored.clone())
    }

    async fn patch_claim_status(&self, claim: &VolumeClaim) -> Result<VolumeClaim, Error> {
        let mut inner = self.lock();
        let revision = inner.next_revision();
        let stored = inner
            .claims
            .get_mut(&claim.key)
            .ok_or_else(|| Error::ClaimNotFound {
                claim: claim.key.to_string(),
            })?;
        if stored.resource_version != claim.resource_version {
            return Err(Error::Conflict {
                object: claim.key.to_string(),
            });
        }
        stored.status_capacity_bytes = claim.status_capacity_bytes;
        stored.conditions = claim.conditions.clone();
        stored.resource_version = revision;
        Ok(stored.clone())
    }

    async fn get_volume(&self, name: &str) -> Result<Volume, Error> {
        self.lock()
            .volumes
            .get(name)
            .cloned()
            .ok_or_else(|| Error::VolumeNotFound {
                volume: name.to_string(),
            })
    }

    async fn patch_volume_capacity(
        &self,
        name: &str,
        capacity_bytes: u64,
    ) -> Result<Volume, Error> {
        let mut inner = self.lock();
        let revision = inner.next_revision();
        let volume = inner
            .volumes
            .get_mut(name)
            .ok_or_else(|| Error::VolumeNotFound {
                volume: name.to_string(),
            })?;
        volume.capacity_bytes = capacity_bytes;
        volume.resource_version = revision;
        Ok(volume.clone())
    }

    async fn get_storage_class_expansion(&self, storage_class: &str) -> Result<bool, Error> {
        Ok(self
            .lock()
            .classes
            .get(storage_class)
            .copied()
            .unwrap_or_default())
    }

    async fn volume_attachment(&self, volume: &Volume) -> Result<Attachment, Error> {
        Ok(self
            .lock()
            .attachments
            .get(&volume.name)
            .cloned()
            .unwrap_or_default())
    }

    async fn attached_volumes(&self, node: &str) -> Result<HashSet<String>, Error> {
        Ok(self
            .lock()
            .attachments
            .iter()
            .filter(|(_, attachment)| {
                matches!(attachment, Attachment::Attached { node: attached } if attached == node)
            })
            .map(|(volume, _)| volume.clone())
            .collect())
    }

    async fn record_event(&self, claim: &ClaimKey, event: ClaimEvent) -> Result<(), Error> {
        self.lock().events.push((claim.clone(), event));
        Ok(())
    }
}
