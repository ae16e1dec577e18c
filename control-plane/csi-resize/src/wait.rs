//! Bounded polling.
//!
//! Every wait in the resize lifecycle has a budget. Transient errors seen while
//! polling are retried until the budget runs out, anything else aborts the wait.

use crate::{
    backend::supervisor::SupervisorBackend,
    error::Error,
    store::ClaimStore,
    types::{ClaimKey, ClaimPhase, ConditionType, Volume, VolumeClaim},
};
use std::{future::Future, sync::Arc, time::Duration};
use tracing::{debug, trace};

/// Poll `check` every `interval`, starting immediately, until it yields a value.
/// Fails with `Error::Timeout` once `timeout` elapsed.
pub async fn poll_immediate<T, F, Fut>(
    operation: &str,
    interval: Duration,
    timeout: Duration,
    mut check: F,
) -> Result<T, Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>, Error>>,
{
    let poll = async {
        loop {
            match check().await {
                Ok(Some(value)) => return Ok(value),
                Ok(None) => trace!(operation, "Condition not met yet"),
                Err(error) if error.is_transient() => {
                    debug!(operation, %error, "Transient error while polling")
                }
                Err(error) => return Err(error),
            }
            tokio::time::sleep(interval).await;
        }
    };
    tokio::time::timeout(timeout, poll)
        .await
        .map_err(|_| Error::Timeout {
            operation: operation.to_string(),
            timeout,
        })?
}

/// Waits on claims and volumes to reach a resize milestone.
#[derive(Clone)]
pub struct Waiter {
    store: Arc<dyn ClaimStore>,
    interval: Duration,
    timeout: Duration,
}

impl Waiter {
    /// Return a new `Self` polling every `interval` for at most `timeout`.
    pub fn new(store: Arc<dyn ClaimStore>, interval: Duration, timeout: Duration) -> Self {
        Self {
            store,
            interval,
            timeout,
        }
    }
    /// Use a different budget.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn claim_when<P>(
        &self,
        operation: &str,
        key: &ClaimKey,
        predicate: P,
    ) -> Result<VolumeClaim, Error>
    where
        P: Fn(&VolumeClaim) -> bool,
    {
        let predicate = &predicate;
        poll_immediate(operation, self.interval, self.timeout, move || async move {
            let claim = self.store.get_claim(key).await?;
            Ok(predicate(&claim).then_some(claim))
        })
        .await
    }

    /// Wait for the claim to be bound to a volume.
    pub async fn wait_for_claim_bound(&self, key: &ClaimKey) -> Result<VolumeClaim, Error> {
        self.claim_when("claim to be bound", key, |claim| {
            claim.phase == ClaimPhase::Bound && claim.volume_name.is_some()
        })
        .await
    }

    /// Wait for the bound volume's capacity to reach the claim's request.
    pub async fn wait_for_controller_resize(&self, key: &ClaimKey) -> Result<Volume, Error> {
        poll_immediate(
            "controller volume resize",
            self.interval,
            self.timeout,
            move || async move {
                let claim = self.store.get_claim(key).await?;
                let volume_name = claim.volume_name.as_deref().ok_or_else(|| {
                    Error::ClaimNotBound {
                        claim: key.to_string(),
                    }
                })?;
                let volume = self.store.get_volume(volume_name).await?;
                Ok((volume.capacity_bytes >= claim.requested_bytes).then_some(volume))
            },
        )
        .await
    }

    /// Wait for the claim to be marked as waiting on a filesystem resize.
    pub async fn wait_for_fs_resize_pending(&self, key: &ClaimKey) -> Result<VolumeClaim, Error> {
        self.claim_when("filesystem resize pending condition", key, |claim| {
            claim.has_condition(ConditionType::FileSystemResizePending)
        })
        .await
    }

    /// Wait for the claim's achieved capacity to reach its request with no filesystem
    /// resize pending.
    pub async fn wait_for_fs_resize(&self, key: &ClaimKey) -> Result<VolumeClaim, Error> {
        self.claim_when("filesystem resize", key, |claim| {
            !claim.has_condition(ConditionType::FileSystemResizePending)
                && claim.achieved_bytes() >= claim.requested_bytes
        })
        .await
    }

    /// Wait for the supervisor claim backing a guest volume to finish resizing.
    pub async fn wait_for_supervisor_resize(
        &self,
        supervisor: &SupervisorBackend,
        claim_name: &str,
    ) -> Result<(), Error> {
        poll_immediate(
            "supervisor claim resize",
            self.interval,
            self.timeout,
            move || async move {
                Ok(supervisor
                    .resize_completed(claim_name)
                    .await?
                    .then_some(()))
            },
        )
        .await
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        backend::{
            supervisor::memory::{claim, MemorySupervisorClaims},
            StorageBackend,
        },
        store::memory::MemoryStore,
        types::ClaimCondition,
        units::GIB,
    };

    fn waiter(store: &MemoryStore) -> Waiter {
        Waiter::new(
            Arc::new(store.clone()),
            Duration::from_secs(2),
            Duration::from_secs(60),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_is_reported() {
        let store = MemoryStore::new();
        let claim = store.insert_claim(VolumeClaim::new(ClaimKey::new("default", "pvc-1"), GIB));

        let error = waiter(&store)
            .wait_for_claim_bound(&claim.key)
            .await
            .unwrap_err();
        assert!(error.is_timeout());
        assert_eq!(
            error.to_string(),
            "Timed out after 60s waiting for claim to be bound"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn waits_for_the_condition() {
        let store = MemoryStore::new();
        let mut claim =
            store.insert_claim(VolumeClaim::new(ClaimKey::new("default", "pvc-1"), GIB));

        let wait = tokio::spawn({
            let waiter = waiter(&store);
            let key = claim.key.clone();
            async move { waiter.wait_for_fs_resize_pending(&key).await }
        });
        tokio::time::sleep(Duration::from_secs(10)).await;
        claim.set_condition(ClaimCondition::new(ConditionType::FileSystemResizePending));
        store.patch_claim_status(&claim).await.unwrap();

        let claim = wait.await.unwrap().unwrap();
        assert!(claim.has_condition(ConditionType::FileSystemResizePending));
    }

    #[tokio::test(start_paused = true)]
    async fn non_transient_errors_abort() {
        let store = MemoryStore::new();
        let error = waiter(&store)
            .wait_for_fs_resize(&ClaimKey::new("default", "missing"))
            .await
            .unwrap_err();
        assert!(matches!(error, Error::ClaimNotFound { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn transient_errors_keep_polling() {
        let store = MemoryStore::new();
        let claim = store.insert_claim(VolumeClaim::new(ClaimKey::new("default", "pvc-1"), GIB));

        // an unbound claim is transient, the wait runs out of budget instead
        let error = waiter(&store)
            .with_timeout(Duration::from_secs(10))
            .wait_for_controller_resize(&claim.key)
            .await
            .unwrap_err();
        assert!(error.is_timeout());
    }

    #[tokio::test(start_paused = true)]
    async fn waits_for_the_supervisor_resize() {
        let store = MemoryStore::new();
        let claims = MemorySupervisorClaims::default();
        claims.insert("guest-vol-1", claim("2Gi", "2Gi", &[]));
        let supervisor = SupervisorBackend::with_claims(Arc::new(claims.clone()));
        supervisor.expand_volume("guest-vol-1", 3072).await.unwrap();

        let wait = tokio::spawn({
            let waiter = waiter(&store);
            let supervisor = supervisor.clone();
            async move {
                waiter
                    .wait_for_supervisor_resize(&supervisor, "guest-vol-1")
                    .await
            }
        });
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(!wait.is_finished());
        claims.complete_resize("guest-vol-1");

        wait.await.unwrap().unwrap();
        assert_eq!(claims.patches(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn supervisor_resize_times_out() {
        let store = MemoryStore::new();
        let claims = MemorySupervisorClaims::default();
        claims.insert("guest-vol-1", claim("3Gi", "2Gi", &["Resizing"]));
        let supervisor = SupervisorBackend::with_claims(Arc::new(claims));

        let error = waiter(&store)
            .wait_for_supervisor_resize(&supervisor, "guest-vol-1")
            .await
            .unwrap_err();
        assert!(error.is_timeout());

        // a vanished claim is not worth waiting for
        let error = waiter(&store)
            .wait_for_supervisor_resize(&supervisor, "guest-vol-2")
            .await
            .unwrap_err();
        assert!(matches!(error, Error::VolumeNotFound { .. }));
    }
}
