//! Controller side resize state machine.
//!
//! The reconciler is level-triggered: each pass reads the latest claim and volume
//! and moves the claim one step closer to its request. Passes may be repeated or
//! overlap freely, the backend expansion is idempotent and serialized per volume.
//!
//! ```text
//! Bound --(increase accepted)--> Expanding
//! Expanding --(backend done, attached)--> FileSystemResizePending
//! Expanding --(backend done, unattached)--> Bound
//! FileSystemResizePending --(node resize done)--> Bound
//! Expanding --(terminal backend failure)--> Bound [per TerminalFailurePolicy]
//! ```

use crate::{
    config::TerminalFailurePolicy,
    context::ResizeContext,
    error::Error,
    store::{update_claim_status, ClaimEvent, EventReason},
    types::{ClaimCondition, ClaimKey, ClaimPhase, ConditionType, Provisioning, Volume, VolumeClaim},
    units,
};
use kube::runtime::controller::Action;
use tracing::{debug, info, instrument, warn};

/// Drives claims from a larger request to an expanded backend volume.
#[derive(Clone)]
pub struct ResizeReconciler {
    ctx: ResizeContext,
}

impl ResizeReconciler {
    /// Return a new `Self` using the given context.
    pub fn new(ctx: ResizeContext) -> Self {
        Self { ctx }
    }

    /// Reconcile a single claim.
    #[instrument(level = "debug", skip(self), fields(claim = %key), err)]
    pub async fn reconcile(&self, key: &ClaimKey) -> Result<Action, Error> {
        let store = self.ctx.store();
        let claim = match store.get_claim(key).await {
            Ok(claim) => claim,
            Err(Error::ClaimNotFound { .. }) => return Ok(Action::await_change()),
            Err(error) => return Err(error),
        };
        let volume_name = match (&claim.phase, &claim.volume_name) {
            (ClaimPhase::Bound, Some(volume_name)) => volume_name.clone(),
            _ => return Ok(Action::await_change()),
        };
        if claim.has_condition(ConditionType::FileSystemResizePending) {
            // the node owns the claim until it clears the condition
            return Ok(Action::await_change());
        }

        let volume = store.get_volume(&volume_name).await?;
        let achieved = claim.status_capacity_bytes.unwrap_or(volume.capacity_bytes);
        if claim.requested_bytes <= achieved {
            update_claim_status(store.as_ref(), key, |claim| {
                claim.clear_condition(ConditionType::Resizing)
            })
            .await?;
            return Ok(Action::await_change());
        }

        self.expand(claim, volume, achieved).await
    }

    async fn expand(
        &self,
        claim: VolumeClaim,
        volume: Volume,
        achieved: u64,
    ) -> Result<Action, Error> {
        let store = self.ctx.store();
        let key = &claim.key;
        let target = claim.requested_bytes;

        let started = update_claim_status(store.as_ref(), key, |claim| {
            if !still_expanding(claim, achieved) || claim.has_condition(ConditionType::Resizing) {
                return false;
            }
            claim.set_condition(ClaimCondition::new(ConditionType::Resizing));
            true
        })
        .await?;
        if started.is_some() {
            self.notify(
                key,
                ClaimEvent::normal(
                    EventReason::Resizing,
                    format!("External resizer is resizing volume {}", volume.name),
                ),
            )
            .await;
        }

        let result = match volume.provisioning {
            Provisioning::Static => Err(Error::StaticProvisioningUnsupported {
                volume: volume.name.clone(),
            }),
            Provisioning::Dynamic => {
                self.ctx
                    .expander()
                    .expand(&volume.volume_handle, target)
                    .await
            }
        };

        match result {
            Ok(outcome) => {
                store.patch_volume_capacity(&volume.name, target).await?;
                let fs_resize_required = outcome.fs_resize_required;
                update_claim_status(store.as_ref(), key, |claim| {
                    claim.clear_condition(ConditionType::Resizing);
                    let published = claim.status_capacity_bytes.unwrap_or(achieved);
                    if published >= target {
                        // published by an overlapping pass or by the node
                    } else if fs_resize_required {
                        claim.set_condition(ClaimCondition::new(
                            ConditionType::FileSystemResizePending,
                        ));
                    } else {
                        claim.status_capacity_bytes = Some(target);
                    }
                    true
                })
                .await?;

                if fs_resize_required {
                    info!(
                        claim = %key,
                        capacity_mb = outcome.capacity_mb,
                        "Waiting for the node to resize the filesystem"
                    );
                    self.notify(
                        key,
                        ClaimEvent::normal(
                            EventReason::FileSystemResizeRequired,
                            format!(
                                "Require file system resize of volume on node for {}",
                                volume.name
                            ),
                        ),
                    )
                    .await;
                } else {
                    info!(
                        claim = %key,
                        capacity_mb = outcome.capacity_mb,
                        "Volume resize completed"
                    );
                    self.notify(
                        key,
                        ClaimEvent::normal(
                            EventReason::VolumeResizeSuccessful,
                            format!(
                                "Resize volume succeeded to {}",
                                units::bytes_to_quantity(target).0
                            ),
                        ),
                    )
                    .await;
                }
                Ok(Action::await_change())
            }
            Err(error) if error.is_terminal() => self.terminal_failure(key, achieved, error).await,
            Err(error) if error.is_transient() => {
                warn!(claim = %key, %error, "Volume resize failed, retrying");
                self.record_failure(key, achieved, &error).await?;
                Ok(Action::requeue(self.ctx.config().retry_interval()))
            }
            Err(error) => Err(error),
        }
    }

    async fn terminal_failure(
        &self,
        key: &ClaimKey,
        achieved: u64,
        error: Error,
    ) -> Result<Action, Error> {
        let store = self.ctx.store();
        let policy = self.ctx.config().failure_policy();
        warn!(claim = %key, %error, %policy, "Volume resize failed terminally");

        match policy {
            TerminalFailurePolicy::LeavePending => {
                self.record_failure(key, achieved, &error).await?;
                Ok(Action::requeue(self.ctx.config().terminal_retry_interval()))
            }
            TerminalFailurePolicy::Revert => {
                let reverted = update_claim_status(store.as_ref(), key, |claim| {
                    if !still_expanding(claim, achieved) {
                        return false;
                    }
                    claim.clear_condition(ConditionType::Resizing);
                    true
                })
                .await?;
                let Some(claim) = reverted else {
                    return Ok(Action::await_change());
                };
                store.update_claim_request(&claim, achieved).await?;
                self.notify(
                    key,
                    ClaimEvent::warning(
                        EventReason::VolumeResizeFailed,
                        format!(
                            "{error}, request reverted to {}",
                            units::bytes_to_quantity(achieved).0
                        ),
                    ),
                )
                .await;
                Ok(Action::await_change())
            }
        }
    }

    /// Record a failed expansion on the `Resizing` condition, unless the claim moved on
    /// since this pass read it.
    async fn record_failure(
        &self,
        key: &ClaimKey,
        achieved: u64,
        error: &Error,
    ) -> Result<(), Error> {
        let message = error.to_string();
        let recorded = update_claim_status(self.ctx.store().as_ref(), key, |claim| {
            if !still_expanding(claim, achieved) {
                return false;
            }
            claim.set_condition(
                ClaimCondition::new(ConditionType::Resizing).with_message(message.clone()),
            );
            true
        })
        .await?;
        match recorded {
            Some(_) => {
                self.notify(
                    key,
                    ClaimEvent::warning(EventReason::VolumeResizeFailed, message),
                )
                .await
            }
            None => debug!(claim = %key, %error, "Claim moved on, failure not recorded"),
        }
        Ok(())
    }

    async fn notify(&self, claim: &ClaimKey, event: ClaimEvent) {
        if let Err(error) = self.ctx.store().record_event(claim, event).await {
            debug!(%claim, %error, "Failed to record event");
        }
    }
}

/// Whether the latest revision of a claim still waits on the controller.
fn still_expanding(claim: &VolumeClaim, achieved: u64) -> bool {
    !claim.has_condition(ConditionType::FileSystemResizePending)
        && claim.requested_bytes > claim.status_capacity_bytes.unwrap_or(achieved)
}
