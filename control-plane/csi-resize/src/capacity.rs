use crate::{
    error::Error,
    intake::{Admission, ResizeIntake, ResizeRequest},
    store::ClaimStore,
    types::{ClaimKey, VolumeClaim},
    units,
    wait::poll_immediate,
};
use std::{sync::Arc, time::Duration};
use tracing::{info, instrument};

/// Writes new capacity requests on claims.
/// The update is synchronous: rejected requests are returned as errors and never
/// written, a write which lost an optimistic concurrency race is retried against the
/// latest revision of the claim until the budget runs out.
#[derive(Clone)]
pub struct CapacityUpdater {
    store: Arc<dyn ClaimStore>,
    intake: ResizeIntake,
    poll_interval: Duration,
    timeout: Duration,
}

impl CapacityUpdater {
    /// Return a new `Self`.
    pub fn new(store: Arc<dyn ClaimStore>, poll_interval: Duration, timeout: Duration) -> Self {
        Self {
            store,
            intake: ResizeIntake::default(),
            poll_interval,
            timeout,
        }
    }

    /// Request the capacity given as a quantity, eg: `3Gi`.
    pub async fn request_capacity(
        &self,
        key: &ClaimKey,
        quantity: &str,
    ) -> Result<VolumeClaim, Error> {
        let bytes = units::parse_quantity(quantity)?;
        self.request_bytes(key, bytes).await
    }

    /// Request `bytes` of capacity.
    #[instrument(level = "info", skip(self), fields(claim = %key), err)]
    pub async fn request_bytes(&self, key: &ClaimKey, bytes: u64) -> Result<VolumeClaim, Error> {
        poll_immediate(
            "claim capacity update",
            self.poll_interval,
            self.timeout,
            move || async move { self.try_update(key, bytes).await.map(Some) },
        )
        .await
    }

    async fn try_update(&self, key: &ClaimKey, bytes: u64) -> Result<VolumeClaim, Error> {
        let claim = self.store.get_claim(key).await?;
        let volume_name = claim
            .volume_name
            .as_deref()
            .ok_or_else(|| Error::ClaimNotBound {
                claim: key.to_string(),
            })?;
        let volume = self.store.get_volume(volume_name).await?;
        let expansion_allowed = match claim.storage_class.as_deref() {
            Some(class) => self.store.get_storage_class_expansion(class).await?,
            None => false,
        };

        let request = ResizeRequest::new(&claim, &volume, expansion_allowed, bytes);
        match self.intake.admit(&request)? {
            Admission::Unchanged => Ok(claim),
            Admission::Accepted { from, to } => {
                let claim = self.store.update_claim_request(&claim, to).await?;
                info!(claim = %key, from, to, "Capacity request accepted");
                Ok(claim)
            }
        }
    }
}
