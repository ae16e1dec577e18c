#![allow(dead_code)]

use async_trait::async_trait;
use csi_resize::{
    backend::{memory::MemoryBackend, BackingDetails},
    config::ResizeConfig,
    context::ResizeContext,
    node::{memory::MemoryFilesystem, NodeResizer},
    store::{memory::MemoryStore, ClaimEvent, ClaimStore},
    types::{
        AccessMode, Attachment, ClaimKey, ClaimPhase, ConditionType, Provisioning, ResizeState,
        Volume, VolumeClaim,
    },
    units, Error,
};
use std::{
    collections::HashSet,
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

pub const NAMESPACE: &str = "e2e-resize";
pub const NODE: &str = "k8s-node-1";
/// Storage class which allows expansion.
pub const CLASS: &str = "vsan-default-storage-policy";
/// Storage class which does not allow expansion.
pub const FIXED_CLASS: &str = "vsan-no-expansion";

/// How a test volume is provisioned.
#[derive(Debug, Clone)]
pub struct VolumeSpec {
    pub name: String,
    pub capacity_bytes: u64,
    pub class: String,
    pub access_mode: AccessMode,
    pub provisioning: Provisioning,
    pub attached: bool,
}

impl VolumeSpec {
    /// A dynamically provisioned, detached, block volume.
    pub fn block(name: &str, capacity_bytes: u64) -> Self {
        Self {
            name: name.to_string(),
            capacity_bytes,
            class: CLASS.to_string(),
            access_mode: AccessMode::Block,
            provisioning: Provisioning::Dynamic,
            attached: false,
        }
    }
    pub fn attached(self) -> Self {
        Self {
            attached: true,
            ..self
        }
    }
    pub fn shared(self) -> Self {
        Self {
            access_mode: AccessMode::Shared,
            ..self
        }
    }
    pub fn statically_provisioned(self) -> Self {
        Self {
            provisioning: Provisioning::Static,
            ..self
        }
    }
    pub fn class(self, class: &str) -> Self {
        Self {
            class: class.to_string(),
            ..self
        }
    }
    pub fn pv_name(&self) -> String {
        format!("pvc-{}-pv", self.name)
    }
    pub fn volume_id(&self) -> String {
        format!("vol-{}", self.name)
    }
    pub fn mount_path(&self) -> String {
        format!(
            "{}/pods/{}/volumes/kubernetes.io~csi/{}/mount",
            utils::KUBELET_DIR,
            self.name,
            self.pv_name()
        )
    }
}

/// An orchestrator, a backend and a node, all in memory.
pub struct Cluster {
    pub store: MemoryStore,
    pub backend: MemoryBackend,
    pub filesystem: MemoryFilesystem,
    pub ctx: ResizeContext,
}

impl Cluster {
    pub fn new() -> Self {
        Self::with_config(ResizeConfig::default())
    }

    pub fn with_config(config: ResizeConfig) -> Self {
        Self::with_store(|store| store, config)
    }

    /// Build a cluster whose components see the memory store through `wrap`.
    pub fn with_store<S, F>(wrap: F, config: ResizeConfig) -> Self
    where
        S: ClaimStore + 'static,
        F: FnOnce(MemoryStore) -> S,
    {
        let store = MemoryStore::new();
        store.insert_class(CLASS, true);
        store.insert_class(FIXED_CLASS, false);
        let backend = MemoryBackend::new();
        let filesystem = MemoryFilesystem::new(backend.clone());
        let ctx = ResizeContext::new(
            Arc::new(wrap(store.clone())),
            Arc::new(backend.clone()),
            config,
        );
        Self {
            store,
            backend,
            filesystem,
            ctx,
        }
    }

    /// Provision a bound claim and its volume, returning a guard which tears them
    /// down again.
    pub fn provision(&self, spec: VolumeSpec) -> Provisioned {
        let capacity_mb = units::bytes_to_mib(spec.capacity_bytes);
        let volume_id = spec.volume_id();
        let pv_name = spec.pv_name();
        let key = ClaimKey::new(NAMESPACE, spec.name.clone());
        let mut deferred = Deferred::default();

        match spec.access_mode {
            AccessMode::Block => self.backend.insert_block(&volume_id, capacity_mb),
            AccessMode::Shared => self.backend.insert(
                &volume_id,
                BackingDetails::File {
                    capacity_in_mb: capacity_mb,
                    access_points: vec!["NFSv4.1=10.0.0.1:/share".into()],
                },
            ),
        }
        deferred.defer("backend volume", {
            let backend = self.backend.clone();
            let volume_id = volume_id.clone();
            move || {
                backend.remove(&volume_id);
            }
        });

        self.store.insert_volume(Volume {
            name: pv_name.clone(),
            resource_version: None,
            volume_handle: volume_id.clone(),
            capacity_bytes: spec.capacity_bytes,
            provisioning: spec.provisioning,
            claim_ref: Some(key.clone()),
        });
        deferred.defer("volume", {
            let store = self.store.clone();
            let pv_name = pv_name.clone();
            move || {
                store.remove_volume(&pv_name);
            }
        });

        let mut claim = VolumeClaim::new(key.clone(), spec.capacity_bytes);
        claim.storage_class = Some(spec.class.clone());
        claim.access_mode = spec.access_mode;
        claim.phase = ClaimPhase::Bound;
        claim.volume_name = Some(pv_name);
        claim.status_capacity_bytes = Some(spec.capacity_bytes);
        self.store.insert_claim(claim);
        deferred.defer("claim", {
            let store = self.store.clone();
            let key = key.clone();
            move || {
                store.remove_claim(&key);
            }
        });

        if spec.attached {
            let pod = self.start_pod(&spec, capacity_mb);
            deferred.defer("pod", move || drop(pod));
        }

        Provisioned {
            key,
            spec,
            _deferred: deferred,
        }
    }

    /// Attach the volume to `NODE` and mount a filesystem of `size_mb` on it, as a pod
    /// using the claim would. The returned guard unmounts and detaches it again.
    pub fn start_pod(&self, spec: &VolumeSpec, size_mb: u64) -> Deferred {
        let volume_id = spec.volume_id();
        let pv_name = spec.pv_name();
        let mount_path = spec.mount_path();

        self.backend.attach(&volume_id, NODE);
        self.store.set_attachment(
            &pv_name,
            Attachment::Attached {
                node: NODE.to_string(),
            },
        );
        self.filesystem
            .mount(&mount_path, &pv_name, &volume_id, size_mb);

        let mut deferred = Deferred::default();
        deferred.defer("pod", {
            let backend = self.backend.clone();
            let store = self.store.clone();
            let filesystem = self.filesystem.clone();
            move || {
                filesystem.unmount(&mount_path);
                store.set_attachment(&pv_name, Attachment::Detached);
                backend.detach(&volume_id);
            }
        });
        deferred
    }

    pub fn node_resizer(&self) -> NodeResizer {
        self.ctx.node_resizer(Arc::new(self.filesystem.clone()))
    }

    pub async fn claim(&self, key: &ClaimKey) -> VolumeClaim {
        self.store.get_claim(key).await.unwrap()
    }

    /// Run controller and node passes until the claim settles.
    pub async fn converge(&self, key: &ClaimKey) -> Result<VolumeClaim, Error> {
        let reconciler = self.ctx.reconciler();
        let node = self.node_resizer();
        for _ in 0 .. 10 {
            reconciler.reconcile(key).await?;
            node.reconcile_node(NODE).await?;
            let claim = self.store.get_claim(key).await?;
            if claim.resize_state() == ResizeState::Bound
                && !claim.has_condition(ConditionType::Resizing)
            {
                return Ok(claim);
            }
        }
        Err(Error::Timeout {
            operation: format!("claim {key} to settle"),
            timeout: Duration::ZERO,
        })
    }
}

/// A provisioned claim, torn down when dropped.
pub struct Provisioned {
    pub key: ClaimKey,
    pub spec: VolumeSpec,
    _deferred: Deferred,
}

type Action = Box<dyn FnOnce() + Send>;

/// Cleanup actions, run in strict reverse order of registration when dropped.
#[derive(Default)]
pub struct Deferred {
    actions: Vec<(&'static str, Action)>,
    log: Option<Arc<Mutex<Vec<&'static str>>>>,
}

impl Deferred {
    /// Record the names of the actions as they run.
    pub fn with_log(log: Arc<Mutex<Vec<&'static str>>>) -> Self {
        Self {
            actions: vec![],
            log: Some(log),
        }
    }
    pub fn defer(&mut self, name: &'static str, action: impl FnOnce() + Send + 'static) {
        self.actions.push((name, Box::new(action)));
    }
}

impl Drop for Deferred {
    fn drop(&mut self) {
        while let Some((name, action)) = self.actions.pop() {
            action();
            if let Some(log) = &self.log {
                log.lock().unwrap().push(name);
            }
        }
    }
}

/// A store whose spec updates lose the optimistic concurrency race a number of times.
pub struct ConflictingStore {
    inner: MemoryStore,
    conflicts: AtomicU32,
}

impl ConflictingStore {
    pub fn new(inner: MemoryStore, conflicts: u32) -> Self {
        Self {
            inner,
            conflicts: AtomicU32::new(conflicts),
        }
    }
}

#[async_trait]
impl ClaimStore for ConflictingStore {
    async fn get_claim(&self, key: &ClaimKey) -> Result<VolumeClaim, Error> {
        self.inner.get_claim(key).await
    }
    async fn list_claims(&self) -> Result<Vec<VolumeClaim>, Error> {
        self.inner.list_claims().await
    }
    async fn update_claim_request(
        &self,
        claim: &VolumeClaim,
        requested_bytes: u64,
    ) -> Result<VolumeClaim, Error> {
        let lost = self
            .conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if lost {
            return Err(Error::Conflict {
                object: claim.key.to_string(),
            });
        }
        self.inner.update_claim_request(claim, requested_bytes).await
    }
    async fn patch_claim_status(&self, claim: &VolumeClaim) -> Result<VolumeClaim, Error> {
        self.inner.patch_claim_status(claim).await
    }
    async fn get_volume(&self, name: &str) -> Result<Volume, Error> {
        self.inner.get_volume(name).await
    }
    async fn patch_volume_capacity(
        &self,
        name: &str,
        capacity_bytes: u64,
    ) -> Result<Volume, Error> {
        self.inner.patch_volume_capacity(name, capacity_bytes).await
    }
    async fn get_storage_class_expansion(&self, storage_class: &str) -> Result<bool, Error> {
        self.inner.get_storage_class_expansion(storage_class).await
    }
    async fn volume_attachment(&self, volume: &Volume) -> Result<Attachment, Error> {
        self.inner.volume_attachment(volume).await
    }
    async fn attached_volumes(&self, node: &str) -> Result<HashSet<String>, Error> {
        self.inner.attached_volumes(node).await
    }
    async fn record_event(&self, claim: &ClaimKey, event: ClaimEvent) -> Result<(), Error> {
        self.inner.record_event(claim, event).await
    }
}

/// A store whose failure writes, a `Resizing` condition carrying a message, reach the
/// api-server only after `delay`.
pub struct SlowFailureStore {
    inner: MemoryStore,
    delay: Duration,
}

impl SlowFailureStore {
    pub fn new(inner: MemoryStore, delay: Duration) -> Self {
        Self { inner, delay }
    }
}

#[async_trait]
impl ClaimStore for SlowFailureStore {
    async fn get_claim(&self, key: &ClaimKey) -> Result<VolumeClaim, Error> {
        self.inner.get_claim(key).await
    }
    async fn list_claims(&self) -> Result<Vec<VolumeClaim>, Error> {
        self.inner.list_claims().await
    }
    async fn update_claim_request(
        &self,
        claim: &VolumeClaim,
        requested_bytes: u64,
    ) -> Result<VolumeClaim, Error> {
        self.inner.update_claim_request(claim, requested_bytes).await
    }
    async fn patch_claim_status(&self, claim: &VolumeClaim) -> Result<VolumeClaim, Error> {
        let failure = claim
            .condition(ConditionType::Resizing)
            .is_some_and(|condition| condition.message.is_some());
        if failure {
            tokio::time::sleep(self.delay).await;
        }
        self.inner.patch_claim_status(claim).await
    }
    async fn get_volume(&self, name: &str) -> Result<Volume, Error> {
        self.inner.get_volume(name).await
    }
    async fn patch_volume_capacity(
        &self,
        name: &str,
        capacity_bytes: u64,
    ) -> Result<Volume, Error> {
        self.inner.patch_volume_capacity(name, capacity_bytes).await
    }
    async fn get_storage_class_expansion(&self, storage_class: &str) -> Result<bool, Error> {
        self.inner.get_storage_class_expansion(storage_class).await
    }
    async fn volume_attachment(&self, volume: &Volume) -> Result<Attachment, Error> {
        self.inner.volume_attachment(volume).await
    }
    async fn attached_volumes(&self, node: &str) -> Result<HashSet<String>, Error> {
        self.inner.attached_volumes(node).await
    }
    async fn record_event(&self, claim: &ClaimKey, event: ClaimEvent) -> Result<(), Error> {
        self.inner.record_event(claim, event).await
    }
}
