//! In guest cluster mode the volume handle of a guest volume names a claim in the
//! supervisor cluster. Expanding the guest volume means growing that claim and
//! letting the supervisor's own CSI driver grow the disk.

use super::{BackendVolume, BackingDetails, StorageBackend};
use crate::{
    error::Error,
    types::{AccessMode, Attachment},
    units,
};

use async_trait::async_trait;
use k8s_openapi::{
    api::{core::v1::PersistentVolumeClaim, storage::v1::VolumeAttachment},
    apimachinery::pkg::api::resource::Quantity,
};
use kube::{
    api::{ListParams, Patch, PatchParams},
    Api, Client,
};
use serde_json::json;
use std::{collections::BTreeMap, sync::Arc};
use tracing::{debug, instrument};

/// Field manager used when patching supervisor claims.
const WHO_AM_I: &str = "csi-resize-guest";

/// The supervisor cluster objects a guest volume is backed by.
#[async_trait]
pub trait SupervisorClaims: Send + Sync {
    /// Get the supervisor claim called `name`.
    async fn get_claim(&self, name: &str) -> Result<PersistentVolumeClaim, Error>;
    /// Set the storage request of the supervisor claim called `name`.
    async fn patch_claim_request(&self, name: &str, request: Quantity) -> Result<(), Error>;
    /// Where the supervisor volume `volume_name` is attached.
    async fn attachment(&self, volume_name: &str) -> Result<Attachment, Error>;
}

/// Supervisor claims of a namespace, read and patched through the api-server.
pub struct KubeSupervisorClaims {
    client: Client,
    namespace: String,
}

impl KubeSupervisorClaims {
    pub fn new(client: Client, namespace: impl Into<String>) -> Self {
        Self {
            client,
            namespace: namespace.into(),
        }
    }

    fn claims(&self) -> Api<PersistentVolumeClaim> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }
}

#[async_trait]
impl SupervisorClaims for KubeSupervisorClaims {
    async fn get_claim(&self, name: &str) -> Result<PersistentVolumeClaim, Error> {
        self.claims()
            .get_opt(name)
            .await?
            .ok_or_else(|| Error::VolumeNotFound {
                volume: name.to_string(),
            })
    }

    async fn patch_claim_request(&self, name: &str, request: Quantity) -> Result<(), Error> {
        let patch = json!({
            "spec": { "resources": { "requests": { "storage": request } } }
        });
        self.claims()
            .patch(name, &PatchParams::apply(WHO_AM_I), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn attachment(&self, volume_name: &str) -> Result<Attachment, Error> {
        let attachments: Api<VolumeAttachment> = Api::all(self.client.clone());
        let list = attachments.list(&ListParams::default()).await?;
        Ok(list
            .items
            .into_iter()
            .find(|va| {
                va.spec.source.persistent_volume_name.as_deref() == Some(volume_name)
                    && va.status.as_ref().map(|s| s.attached).unwrap_or(false)
            })
            .map(|va| Attachment::Attached {
                node: va.spec.node_name,
            })
            .unwrap_or_default())
    }
}

/// Backend which expands claims in the supervisor cluster.
#[derive(Clone)]
pub struct SupervisorBackend {
    claims: Arc<dyn SupervisorClaims>,
}

impl SupervisorBackend {
    /// Return a new `Self` for the supervisor namespace which holds the guest volumes.
    pub fn new(client: Client, namespace: impl Into<String>) -> Self {
        Self::with_claims(Arc::new(KubeSupervisorClaims::new(client, namespace)))
    }

    /// Return a new `Self` which reaches the supervisor claims through `claims`.
    pub fn with_claims(claims: Arc<dyn SupervisorClaims>) -> Self {
        Self { claims }
    }

    async fn attachment(&self, volume_name: Option<&str>) -> Result<Attachment, Error> {
        match volume_name {
            Some(volume_name) => self.claims.attachment(volume_name).await,
            None => Ok(Attachment::Detached),
        }
    }

    /// Check whether the supervisor claim finished resizing: no pending resize
    /// conditions and an achieved capacity at least as large as the request.
    pub async fn resize_completed(&self, name: &str) -> Result<bool, Error> {
        let claim = self.claims.get_claim(name).await?;
        claim_resize_completed(&claim)
    }
}

fn storage_of(resources: Option<&BTreeMap<String, Quantity>>) -> Result<u64, Error> {
    resources
        .and_then(|map| map.get("storage"))
        .map(units::quantity_bytes)
        .transpose()
        .map(Option::unwrap_or_default)
}

fn requested_bytes(claim: &PersistentVolumeClaim) -> Result<u64, Error> {
    storage_of(
        claim
            .spec
            .as_ref()
            .and_then(|spec| spec.resources.as_ref())
            .and_then(|resources| resources.requests.as_ref()),
    )
}

fn status_bytes(claim: &PersistentVolumeClaim) -> Result<u64, Error> {
    storage_of(
        claim
            .status
            .as_ref()
            .and_then(|status| status.capacity.as_ref()),
    )
}

fn claim_resize_completed(claim: &PersistentVolumeClaim) -> Result<bool, Error> {
    let pending = claim
        .status
        .as_ref()
        .and_then(|status| status.conditions.as_ref())
        .map(|conditions| {
            conditions
                .iter()
                .any(|c| c.type_ == "Resizing" || c.type_ == "FileSystemResizePending")
        })
        .unwrap_or(false);
    Ok(!pending && status_bytes(claim)? >= requested_bytes(claim)?)
}

fn backing_of(claim: &PersistentVolumeClaim) -> Result<BackingDetails, Error> {
    let capacity_in_mb = units::bytes_to_mib(status_bytes(claim)?);
    let modes = claim
        .spec
        .as_ref()
        .and_then(|spec| spec.access_modes.as_ref());
    Ok(
        match AccessMode::from_access_modes(modes.into_iter().flatten()) {
            AccessMode::Block => BackingDetails::Block { capacity_in_mb },
            AccessMode::Shared => BackingDetails::File {
                capacity_in_mb,
                access_points: vec![],
            },
        },
    )
}

#[async_trait]
impl StorageBackend for SupervisorBackend {
    #[instrument(level = "debug", skip(self))]
    async fn query_volume(&self, volume_id: &str) -> Result<BackendVolume, Error> {
        let claim = self.claims.get_claim(volume_id).await?;
        let volume_name = claim.spec.as_ref().and_then(|s| s.volume_name.as_deref());
        Ok(BackendVolume {
            volume_id: volume_id.to_string(),
            backing: backing_of(&claim)?,
            attachment: self.attachment(volume_name).await?,
        })
    }

    #[instrument(level = "debug", skip(self))]
    async fn expand_volume(&self, volume_id: &str, target_mb: u64) -> Result<(), Error> {
        let claim = self.claims.get_claim(volume_id).await?;
        let target_bytes = units::mib_to_bytes(target_mb);
        if requested_bytes(&claim)? >= target_bytes {
            debug!(volume.id = volume_id, "Supervisor claim already requests the target");
            return Ok(());
        }
        self.claims
            .patch_claim_request(volume_id, units::bytes_to_quantity(target_bytes))
            .await
    }
}

#[cfg(test)]
pub(crate) mod memory {
    use super::*;
    use k8s_openapi::api::core::v1::{
        PersistentVolumeClaimCondition, PersistentVolumeClaimSpec, PersistentVolumeClaimStatus,
        ResourceRequirements,
    };
    use std::{
        collections::HashMap,
        sync::{Mutex, MutexGuard},
    };

    /// A supervisor claim requesting `request`, with `capacity` achieved and the given
    /// conditions set.
    pub(crate) fn claim(
        request: &str,
        capacity: &str,
        conditions: &[&str],
    ) -> PersistentVolumeClaim {
        PersistentVolumeClaim {
            spec: Some(PersistentVolumeClaimSpec {
                access_modes: Some(vec!["ReadWriteOnce".into()]),
                resources: Some(ResourceRequirements {
                    requests: Some(BTreeMap::from([(
                        "storage".to_string(),
                        Quantity(request.into()),
                    )])),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            status: Some(PersistentVolumeClaimStatus {
                capacity: Some(BTreeMap::from([(
                    "storage".to_string(),
                    Quantity(capacity.into()),
                )])),
                conditions: Some(
                    conditions
                        .iter()
                        .map(|c| PersistentVolumeClaimCondition {
                            type_: c.to_string(),
                            status: "True".into(),
                            ..Default::default()
                        })
                        .collect(),
                ),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[derive(Default)]
    struct Inner {
        claims: HashMap<String, PersistentVolumeClaim>,
        attachments: HashMap<String, Attachment>,
        patches: u32,
    }

    /// Supervisor claims kept in memory.
    #[derive(Clone, Default)]
    pub(crate) struct MemorySupervisorClaims {
        inner: Arc<Mutex<Inner>>,
    }

    impl MemorySupervisorClaims {
        fn inner(&self) -> MutexGuard<'_, Inner> {
            self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
        }
        pub(crate) fn insert(&self, name: &str, claim: PersistentVolumeClaim) {
            self.inner().claims.insert(name.to_string(), claim);
        }
        pub(crate) fn get(&self, name: &str) -> Option<PersistentVolumeClaim> {
            self.inner().claims.get(name).cloned()
        }
        pub(crate) fn attach(&self, volume_name: &str, node: &str) {
            self.inner().attachments.insert(
                volume_name.to_string(),
                Attachment::Attached {
                    node: node.to_string(),
                },
            );
        }
        /// Complete a resize the way the supervisor's driver does, by raising the
        /// achieved capacity to the request.
        pub(crate) fn complete_resize(&self, name: &str) {
            let mut inner = self.inner();
            let Some(claim) = inner.claims.get_mut(name) else {
                return;
            };
            let request = claim
                .spec
                .as_ref()
                .and_then(|spec| spec.resources.as_ref())
                .and_then(|resources| resources.requests.as_ref())
                .and_then(|requests| requests.get("storage"))
                .cloned();
            if let (Some(request), Some(status)) = (request, claim.status.as_mut()) {
                status.capacity = Some(BTreeMap::from([("storage".to_string(), request)]));
                status.conditions = None;
            }
        }
        pub(crate) fn patches(&self) -> u32 {
            self.inner().patches
        }
    }

    #[async_trait]
    impl SupervisorClaims for MemorySupervisorClaims {
        async fn get_claim(&self, name: &str) -> Result<PersistentVolumeClaim, Error> {
            self.get(name).ok_or_else(|| Error::VolumeNotFound {
                volume: name.to_string(),
            })
        }

        async fn patch_claim_request(&self, name: &str, request: Quantity) -> Result<(), Error> {
            let mut inner = self.inner();
            let claim = inner
                .claims
                .get_mut(name)
                .ok_or_else(|| Error::VolumeNotFound {
                    volume: name.to_string(),
                })?;
            claim
                .spec
                .get_or_insert_with(Default::default)
                .resources
                .get_or_insert_with(Default::default)
                .requests
                .get_or_insert_with(Default::default)
                .insert("storage".to_string(), request);
            inner.patches += 1;
            Ok(())
        }

        async fn attachment(&self, volume_name: &str) -> Result<Attachment, Error> {
            Ok(self
                .inner()
                .attachments
                .get(volume_name)
                .cloned()
                .unwrap_or_default())
        }
    }
}

#[cfg(test)]
mod test {
    use super::{
        memory::{claim, MemorySupervisorClaims},
        *,
    };

    fn backend() -> (MemorySupervisorClaims, SupervisorBackend) {
        let claims = MemorySupervisorClaims::default();
        let backend = SupervisorBackend::with_claims(Arc::new(claims.clone()));
        (claims, backend)
    }

    #[test]
    fn resize_completion() {
        assert!(claim_resize_completed(&claim("3Gi", "3Gi", &[])).unwrap());
        assert!(!claim_resize_completed(&claim("3Gi", "2Gi", &[])).unwrap());
        assert!(
            !claim_resize_completed(&claim("3Gi", "3Gi", &["FileSystemResizePending"])).unwrap()
        );
    }

    #[test]
    fn backing_from_claim() {
        let backing = backing_of(&claim("3Gi", "2Gi", &[])).unwrap();
        assert_eq!(backing, BackingDetails::Block { capacity_in_mb: 2048 });
    }

    #[tokio::test]
    async fn query_reads_the_supervisor_claim() {
        let (claims, backend) = backend();
        let mut bound = claim("2Gi", "2Gi", &[]);
        if let Some(spec) = bound.spec.as_mut() {
            spec.volume_name = Some("pv-supervisor-1".into());
        }
        claims.insert("guest-vol-1", bound);
        claims.attach("pv-supervisor-1", "esx-1");

        let volume = backend.query_volume("guest-vol-1").await.unwrap();
        assert_eq!(volume.volume_id, "guest-vol-1");
        assert_eq!(volume.backing, BackingDetails::Block { capacity_in_mb: 2048 });
        assert_eq!(
            volume.attachment,
            Attachment::Attached {
                node: "esx-1".into()
            }
        );

        let error = backend.query_volume("guest-vol-2").await.unwrap_err();
        assert!(matches!(error, Error::VolumeNotFound { .. }));
    }

    #[tokio::test]
    async fn expansion_grows_the_request() {
        let (claims, backend) = backend();
        claims.insert("guest-vol-1", claim("2Gi", "2Gi", &[]));

        backend.expand_volume("guest-vol-1", 3072).await.unwrap();
        assert_eq!(claims.patches(), 1);
        let patched = claims.get("guest-vol-1").unwrap();
        assert_eq!(requested_bytes(&patched).unwrap(), 3 * units::GIB);
        assert!(!backend.resize_completed("guest-vol-1").await.unwrap());

        claims.complete_resize("guest-vol-1");
        assert!(backend.resize_completed("guest-vol-1").await.unwrap());
    }

    #[tokio::test]
    async fn expansion_already_requested_is_skipped() {
        let (claims, backend) = backend();
        claims.insert("guest-vol-1", claim("3Gi", "2Gi", &["Resizing"]));

        backend.expand_volume("guest-vol-1", 3072).await.unwrap();
        backend.expand_volume("guest-vol-1", 2048).await.unwrap();
        assert_eq!(claims.patches(), 0);
        assert_eq!(
            requested_bytes(&claims.get("guest-vol-1").unwrap()).unwrap(),
            3 * units::GIB
        );
    }
}
