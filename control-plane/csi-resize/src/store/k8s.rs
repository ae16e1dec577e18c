use super::{ClaimEvent, ClaimStore};
use crate::{
    error::Error,
    types::{
        AccessMode, Attachment, ClaimCondition, ClaimKey, ClaimPhase, ConditionType,
        Provisioning, Volume, VolumeClaim,
    },
    units,
};

use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::{
    api::{
        core::v1::{
            Event, ObjectReference, PersistentVolume, PersistentVolumeClaim,
            PersistentVolumeClaimCondition,
        },
        storage::v1::{StorageClass, VolumeAttachment},
    },
    apimachinery::pkg::{
        api::resource::Quantity,
        apis::meta::v1::{MicroTime, ObjectMeta, Time},
    },
};
use kube::{
    api::{ListParams, Patch, PatchParams, PostParams},
    Api, Client, ResourceExt,
};
use serde_json::json;
use std::{
    collections::{BTreeMap, HashSet},
    str::FromStr,
};
use tracing::{error, warn};

/// Field manager and event reporter of the resize controller.
const WHO_AM_I: &str = "csi-resize";
const STORAGE: &str = "storage";

/// A store backed by the kubernetes api-server.
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
}

impl KubeStore {
    /// Return a new `Self` using the given client.
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn claims(&self, namespace: &str) -> Api<PersistentVolumeClaim> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn volumes(&self) -> Api<PersistentVolume> {
        Api::all(self.client.clone())
    }

    /// Volumes attached by our driver, with the node each one is attached to.
    async fn attachments(&self) -> Result<Vec<(String, String)>, Error> {
        let attachments: Api<VolumeAttachment> = Api::all(self.client.clone());
        let list = attachments.list(&ListParams::default()).await?;
        Ok(list
            .items
            .into_iter()
            .filter(|va| {
                va.spec.attacher == crate::CSI_PLUGIN_NAME
                    && va.status.as_ref().map(|s| s.attached).unwrap_or(false)
            })
            .filter_map(|va| {
                let volume_name = va.spec.source.persistent_volume_name?;
                Some((volume_name, va.spec.node_name))
            })
            .collect())
    }
}

// A 409 from the api-server means our revision of the object is stale.
fn conflict(object: &str) -> impl FnOnce(kube::Error) -> Error + '_ {
    move |error| match error {
        kube::Error::Api(response) if response.code == 409 => Error::Conflict {
            object: object.to_string(),
        },
        error => Error::Kube { source: error },
    }
}

fn storage_bytes(resources: Option<&BTreeMap<String, Quantity>>) -> Result<Option<u64>, Error> {
    resources
        .and_then(|map| map.get(STORAGE))
        .map(units::quantity_bytes)
        .transpose()
}

/// Convert a kubernetes claim into the resize view of a claim.
pub fn claim_from_pvc(pvc: &PersistentVolumeClaim) -> Result<VolumeClaim, Error> {
    let key = ClaimKey::new(pvc.namespace().unwrap_or_default(), pvc.name_any());
    let spec = pvc.spec.as_ref();
    let status = pvc.status.as_ref();

    let requested_bytes = storage_bytes(
        spec.and_then(|spec| spec.resources.as_ref())
            .and_then(|resources| resources.requests.as_ref()),
    )?
    .unwrap_or_default();

    let conditions = status
        .and_then(|status| status.conditions.as_ref())
        .into_iter()
        .flatten()
        .filter(|condition| condition.status == "True")
        .filter_map(|condition| {
            ConditionType::from_str(&condition.type_)
                .ok()
                .map(|type_| ClaimCondition {
                    type_,
                    message: condition.message.clone(),
                })
        })
        .collect();

    Ok(VolumeClaim {
        resource_version: pvc.resource_version(),
        storage_class: spec.and_then(|spec| spec.storage_class_name.clone()),
        access_mode: AccessMode::from_access_modes(
            spec.and_then(|spec| spec.access_modes.as_ref())
                .into_iter()
                .flatten(),
        ),
        requested_bytes,
        volume_name: spec.and_then(|spec| spec.volume_name.clone()),
        phase: status
            .and_then(|status| status.phase.as_deref())
            .and_then(|phase| ClaimPhase::from_str(phase).ok())
            .unwrap_or_default(),
        status_capacity_bytes: storage_bytes(status.and_then(|status| status.capacity.as_ref()))?,
        conditions,
        key,
    })
}

/// Convert a kubernetes persistent volume into the resize view of a volume.
pub fn volume_from_pv(pv: &PersistentVolume) -> Result<Volume, Error> {
    let name = pv.name_any();
    let spec = pv.spec.as_ref();
    let volume_handle = spec
        .and_then(|spec| spec.csi.as_ref())
        .map(|csi| csi.volume_handle.clone())
        .ok_or_else(|| Error::InvalidArgument {
            message: format!("volume '{name}' is not a CSI volume"),
        })?;
    let provisioning = match pv.annotations().contains_key(utils::PROVISIONED_BY_ANNOTATION) {
        true => Provisioning::Dynamic,
        false => Provisioning::Static,
    };
    Ok(Volume {
        resource_version: pv.resource_version(),
        volume_handle,
        capacity_bytes: storage_bytes(spec.and_then(|spec| spec.capacity.as_ref()))?
            .unwrap_or_default(),
        provisioning,
        claim_ref: spec
            .and_then(|spec| spec.claim_ref.as_ref())
            .and_then(|claim| {
                Some(ClaimKey::new(
                    claim.namespace.clone()?,
                    claim.name.clone()?,
                ))
            }),
        name,
    })
}

/// The conditions to write for `claim` over the `existing` ones of the live object.
/// Conditions of other controllers are kept untouched, ours keep their transition
/// time for as long as they stay set.
fn merge_conditions(
    existing: &[PersistentVolumeClaimCondition],
    claim: &VolumeClaim,
    now: &Time,
) -> Vec<PersistentVolumeClaimCondition> {
    let mut conditions = existing
        .iter()
        .filter(|condition| ConditionType::from_str(&condition.type_).is_err())
        .cloned()
        .collect::<Vec<_>>();
    conditions.extend(claim.conditions.iter().map(|condition| {
        let type_ = condition.type_.to_string();
        let since = existing
            .iter()
            .find(|c| c.type_ == type_ && c.status == "True")
            .and_then(|c| c.last_transition_time.clone())
            .unwrap_or_else(|| now.clone());
        PersistentVolumeClaimCondition {
            type_,
            status: "True".to_string(),
            message: condition.message.clone(),
            last_transition_time: Some(since),
            ..Default::default()
        }
    }));
    conditions
}

#[async_trait]
impl ClaimStore for KubeStore {
    async fn get_claim(&self, key: &ClaimKey) -> Result<VolumeClaim, Error> {
        let pvc = self
            .claims(&key.namespace)
            .get_opt(&key.name)
            .await?
            .ok_or_else(|| Error::ClaimNotFound {
                claim: key.to_string(),
            })?;
        claim_from_pvc(&pvc)
    }

    async fn list_claims(&self) -> Result<Vec<VolumeClaim>, Error> {
        let claims: Api<PersistentVolumeClaim> = Api::all(self.client.clone());
        let list = claims.list(&ListParams::default()).await?;
        Ok(list
            .items
            .iter()
            .filter_map(|pvc| match claim_from_pvc(pvc) {
                Ok(claim) => Some(claim),
                Err(error) => {
                    warn!(claim.name = pvc.name_any(), %error, "Skipping claim");
                    None
                }
            })
            .collect())
    }

    async fn update_claim_request(
        &self,
        claim: &VolumeClaim,
        requested_bytes: u64,
    ) -> Result<VolumeClaim, Error> {
        let object = claim.key.to_string();
        // the resource version in a patch acts as a precondition
        let patch = json!({
            "metadata": { "resourceVersion": claim.resource_version },
            "spec": { "resources": { "requests": { STORAGE: units::bytes_to_quantity(requested_bytes) } } }
        });
        let pvc = self
            .claims(&claim.key.namespace)
            .patch(&claim.key.name, &PatchParams::apply(WHO_AM_I), &Patch::Merge(&patch))
            .await
            .map_err(conflict(&object))?;
        claim_from_pvc(&pvc)
    }

    async fn patch_claim_status(&self, claim: &VolumeClaim) -> Result<VolumeClaim, Error> {
        let object = claim.key.to_string();
        let claims = self.claims(&claim.key.namespace);
        let live = claims
            .get_opt(&claim.key.name)
            .await?
            .ok_or_else(|| Error::ClaimNotFound {
                claim: object.clone(),
            })?;
        if live.resource_version() != claim.resource_version {
            return Err(Error::Conflict { object });
        }
        let existing = live
            .status
            .as_ref()
            .and_then(|status| status.conditions.as_deref())
            .unwrap_or_default();

        let mut status = json!({
            "conditions": merge_conditions(existing, claim, &Time(Utc::now()))
        });
        if let Some(capacity) = claim.status_capacity_bytes {
            status["capacity"] = json!({ STORAGE: units::bytes_to_quantity(capacity) });
        }
        // the resource version in a patch acts as a precondition
        let patch = json!({
            "metadata": { "resourceVersion": claim.resource_version },
            "status": status
        });
        let pvc = claims
            .patch_status(
                &claim.key.name,
                &PatchParams::apply(WHO_AM_I),
                &Patch::Merge(&patch),
            )
            .await
            .map_err(conflict(&object))?;
        claim_from_pvc(&pvc)
    }

    async fn get_volume(&self, name: &str) -> Result<Volume, Error> {
        let pv = self
            .volumes()
            .get_opt(name)
            .await?
            .ok_or_else(|| Error::VolumeNotFound {
                volume: name.to_string(),
            })?;
        volume_from_pv(&pv)
    }

    async fn patch_volume_capacity(
        &self,
        name: &str,
        capacity_bytes: u64,
    ) -> Result<Volume, Error> {
        let patch = json!({
            "spec": { "capacity": { STORAGE: units::bytes_to_quantity(capacity_bytes) } }
        });
        let pv = self
            .volumes()
            .patch(name, &PatchParams::apply(WHO_AM_I), &Patch::Merge(&patch))
            .await
            .map_err(conflict(name))?;
        volume_from_pv(&pv)
    }

    async fn get_storage_class_expansion(&self, storage_class: &str) -> Result<bool, Error> {
        let classes: Api<StorageClass> = Api::all(self.client.clone());
        Ok(classes
            .get_opt(storage_class)
            .await?
            .and_then(|class| class.allow_volume_expansion)
            .unwrap_or_default())
    }

    async fn volume_attachment(&self, volume: &Volume) -> Result<Attachment, Error> {
        Ok(self
            .attachments()
            .await?
            .into_iter()
            .find(|(volume_name, _)| volume_name == &volume.name)
            .map(|(_, node)| Attachment::Attached { node })
            .unwrap_or_default())
    }

    async fn attached_volumes(&self, node: &str) -> Result<HashSet<String>, Error> {
        Ok(self
            .attachments()
            .await?
            .into_iter()
            .filter(|(_, attached)| attached == node)
            .map(|(volume_name, _)| volume_name)
            .collect())
    }

    async fn record_event(&self, claim: &ClaimKey, event: ClaimEvent) -> Result<(), Error> {
        let events: Api<Event> = Api::namespaced(self.client.clone(), &claim.namespace);
        let time = Utc::now();
        let metadata = ObjectMeta {
            // the name must be unique for all events we post
            generate_name: Some(format!("{}.{:x}", claim.name, time.timestamp())),
            namespace: Some(claim.namespace.clone()),
            ..Default::default()
        };
        let _ = events
            .create(
                &PostParams::default(),
                &Event {
                    event_time: Some(MicroTime(time)),
                    involved_object: ObjectReference {
                        api_version: Some("v1".into()),
                        kind: Some("PersistentVolumeClaim".into()),
                        name: Some(claim.name.clone()),
                        namespace: Some(claim.namespace.clone()),
                        ..Default::default()
                    },
                    action: Some("Resize".into()),
                    reason: Some(event.reason.to_string()),
                    type_: Some(event.type_.to_string()),
                    metadata,
                    reporting_component: Some(WHO_AM_I.into()),
                    reporting_instance: Some(
                        std::env::var("MY_POD_NAME")
                            .ok()
                            .unwrap_or_else(|| WHO_AM_I.into()),
                    ),
                    message: Some(event.message),
                    ..Default::default()
                },
            )
            .await
            .map_err(|error| error!(?error, "Failed to record claim event"));
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::units::GIB;
    use k8s_openapi::api::core::v1::{
        CSIPersistentVolumeSource, PersistentVolumeClaimSpec, PersistentVolumeClaimStatus,
        PersistentVolumeSpec, ResourceRequirements,
    };

    fn storage(quantity: &str) -> Option<BTreeMap<String, Quantity>> {
        Some(BTreeMap::from([(STORAGE.to_string(), Quantity(quantity.into()))]))
    }

    #[test]
    fn pvc_conversion() {
        let pvc = PersistentVolumeClaim {
            metadata: ObjectMeta {
                name: Some("pvc-1".into()),
                namespace: Some("default".into()),
                resource_version: Some("42".into()),
                ..Default::default()
            },
            spec: Some(PersistentVolumeClaimSpec {
                access_modes: Some(vec!["ReadWriteOnce".into()]),
                storage_class_name: Some("vsan-default".into()),
                volume_name: Some("pv-1".into()),
                resources: Some(ResourceRequirements {
                    requests: storage("3Gi"),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            status: Some(PersistentVolumeClaimStatus {
                phase: Some("Bound".into()),
                capacity: storage("2Gi"),
                conditions: Some(vec![
                    PersistentVolumeClaimCondition {
                        type_: "FileSystemResizePending".into(),
                        status: "True".into(),
                        ..Default::default()
                    },
                    PersistentVolumeClaimCondition {
                        type_: "ModifyingVolume".into(),
                        status: "True".into(),
                        ..Default::default()
                    },
                ]),
                ..Default::default()
            }),
        };
        let claim = claim_from_pvc(&pvc).unwrap();
        assert_eq!(claim.key, ClaimKey::new("default", "pvc-1"));
        assert_eq!(claim.resource_version.as_deref(), Some("42"));
        assert_eq!(claim.requested_bytes, 3 * GIB);
        assert_eq!(claim.status_capacity_bytes, Some(2 * GIB));
        assert_eq!(claim.phase, ClaimPhase::Bound);
        assert_eq!(
            claim.conditions,
            vec![ClaimCondition::new(ConditionType::FileSystemResizePending)]
        );
    }

    fn condition(type_: &str, since: Option<Time>) -> PersistentVolumeClaimCondition {
        PersistentVolumeClaimCondition {
            type_: type_.into(),
            status: "True".into(),
            last_transition_time: since,
            ..Default::default()
        }
    }

    #[test]
    fn foreign_conditions_are_kept() {
        let earlier = Time(Utc::now() - chrono::Duration::minutes(5));
        let now = Time(Utc::now());
        let existing = vec![
            condition("ModifyingVolume", Some(earlier.clone())),
            condition("Resizing", Some(earlier.clone())),
        ];
        let mut claim = VolumeClaim::new(ClaimKey::new("default", "pvc-1"), 3 * GIB);
        claim.set_condition(
            ClaimCondition::new(ConditionType::Resizing).with_message("backend is busy"),
        );
        claim.set_condition(ClaimCondition::new(ConditionType::FileSystemResizePending));

        let merged = merge_conditions(&existing, &claim, &now);
        assert_eq!(merged.len(), 3);
        assert_eq!(merged[0], existing[0]);
        assert_eq!(merged[1].type_, "Resizing");
        assert_eq!(merged[1].message.as_deref(), Some("backend is busy"));
        assert_eq!(merged[1].last_transition_time, Some(earlier));
        assert_eq!(merged[2].type_, "FileSystemResizePending");
        assert_eq!(merged[2].last_transition_time, Some(now));

        // clearing ours leaves theirs alone
        claim.conditions.clear();
        let merged = merge_conditions(&existing, &claim, &Time(Utc::now()));
        assert_eq!(merged, vec![existing[0].clone()]);
    }

    #[test]
    fn pv_conversion() {
        let mut pv = PersistentVolume {
            metadata: ObjectMeta {
                name: Some("pv-1".into()),
                annotations: Some(BTreeMap::from([(
                    utils::PROVISIONED_BY_ANNOTATION.to_string(),
                    crate::CSI_PLUGIN_NAME.to_string(),
                )])),
                ..Default::default()
            },
            spec: Some(PersistentVolumeSpec {
                capacity: storage("2Gi"),
                csi: Some(CSIPersistentVolumeSource {
                    driver: crate::CSI_PLUGIN_NAME.into(),
                    volume_handle: "5e1a3c2f".into(),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            status: None,
        };
        let volume = volume_from_pv(&pv).unwrap();
        assert_eq!(volume.volume_handle, "5e1a3c2f");
        assert_eq!(volume.capacity_bytes, 2 * GIB);
        assert_eq!(volume.provisioning, Provisioning::Dynamic);

        pv.metadata.annotations = None;
        assert_eq!(
            volume_from_pv(&pv).unwrap().provisioning,
            Provisioning::Static
        );

        pv.spec = Some(PersistentVolumeSpec::default());
        assert!(matches!(
            volume_from_pv(&pv),
            Err(Error::InvalidArgument { .. })
        ));
    }
}
