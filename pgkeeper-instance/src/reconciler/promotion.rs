//! Promoting the local replica and claiming the primary role.
//!
//! The coordinator only promotes once replication has fully drained:
//! the WAL receiver must be gone (no more WAL can arrive) and everything
//! received must have been replayed. Promoting earlier would discard
//! transactions the old primary already acknowledged.

use crate::context::InstanceContext;
use crate::crd::Cluster;
use crate::error::{InstanceError, InstanceResult};
use crate::retry::{CasOutcome, PollStep, compare_and_swap, poll_until};
use std::fmt;

/// Step the promotion state machine is in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromotionState {
    /// Checking whether the instance already runs as primary.
    CheckRole,
    /// Waiting for the WAL receiver to stop.
    WaitWalReceiverDown,
    /// Waiting for received WAL to be fully replayed.
    WaitApplyZero,
    /// Promoting the instance.
    Promote,
    /// Recording this instance as current primary.
    ClaimPrimary,
}

impl fmt::Display for PromotionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PromotionState::CheckRole => "CheckRole",
            PromotionState::WaitWalReceiverDown => "WaitWalReceiverDown",
            PromotionState::WaitApplyZero => "WaitApplyZero",
            PromotionState::Promote => "Promote",
            PromotionState::ClaimPrimary => "ClaimPrimary",
        };
        f.write_str(name)
    }
}

/// How a promotion finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromotionOutcome {
    /// The instance was already primary; nothing was done.
    AlreadyPrimary,
    /// The instance was promoted and the claim was recorded.
    Promoted {
        /// Status writes needed to record the claim.
        claim_attempts: u32,
    },
}

/// Drives one promotion attempt.
pub struct PromotionCoordinator<'a> {
    ctx: &'a InstanceContext,
    state: PromotionState,
}

impl<'a> PromotionCoordinator<'a> {
    /// Create a coordinator in the [`PromotionState::CheckRole`] state.
    pub fn new(ctx: &'a InstanceContext) -> Self {
        Self {
            ctx,
            state: PromotionState::CheckRole,
        }
    }

    /// The last state entered.
    pub fn state(&self) -> PromotionState {
        self.state
    }

    fn enter(&mut self, next: PromotionState) {
        tracing::info!(
            pod = %self.ctx.pod_name(),
            from = %self.state,
            to = %next,
            "Promotion state transition"
        );
        self.state = next;
    }

    /// Run the state machine against `cluster`, the record that made this
    /// instance the target primary.
    pub async fn run(&mut self, cluster: Cluster) -> InstanceResult<PromotionOutcome> {
        let ctx = self.ctx;

        let is_primary = ctx
            .instance
            .is_primary()
            .await
            .map_err(|e| InstanceError::engine("checking instance role", e))?;
        if is_primary {
            tracing::debug!(pod = %ctx.pod_name(), "Already primary, nothing to promote");
            return Ok(PromotionOutcome::AlreadyPrimary);
        }

        let wait_policy = ctx.config.promotion_wait_policy();

        self.enter(PromotionState::WaitWalReceiverDown);
        poll_until(
            &wait_policy,
            &ctx.cancel,
            "WAL receiver to stop",
            |attempt| async move {
                let active = ctx
                    .instance
                    .is_wal_receiver_active()
                    .await
                    .map_err(|e| InstanceError::engine("checking WAL receiver", e))?;
                if active {
                    tracing::info!(attempt, "WAL receiver is still active, waiting");
                    Ok(PollStep::Pending)
                } else {
                    Ok(PollStep::Ready(()))
                }
            },
        )
        .await?;

        self.enter(PromotionState::WaitApplyZero);
        poll_until(
            &wait_policy,
            &ctx.cancel,
            "WAL replay to finish",
            |attempt| async move {
                let lag = ctx
                    .instance
                    .wal_apply_lag()
                    .await
                    .map_err(|e| InstanceError::engine("checking WAL apply lag", e))?;
                if lag > 0 {
                    tracing::info!(attempt, lag, "WAL not fully applied, waiting");
                    Ok(PollStep::Pending)
                } else {
                    Ok(PollStep::Ready(()))
                }
            },
        )
        .await?;

        self.enter(PromotionState::Promote);
        ctx.instance
            .promote_and_wait()
            .await
            .map_err(|e| InstanceError::engine("promoting instance", e))?;
        tracing::info!(pod = %ctx.pod_name(), "Instance promoted");

        self.enter(PromotionState::ClaimPrimary);
        let claim_attempts = self.claim_primary(cluster).await?;

        tracing::info!(
            pod = %ctx.pod_name(),
            attempts = claim_attempts,
            "Recorded this instance as current primary"
        );
        Ok(PromotionOutcome::Promoted { claim_attempts })
    }

    async fn claim_primary(&self, cluster: Cluster) -> InstanceResult<u32> {
        let store = &self.ctx.status_store;
        let pod_name = self.ctx.pod_name();

        let outcome = compare_and_swap(
            &self.ctx.config.claim_policy(),
            cluster,
            InstanceError::is_conflict,
            |mut record: Cluster| {
                record.set_current_primary(pod_name);
                async move { store.update_status(&record).await }
            },
            || store.get(),
        )
        .await;

        match outcome {
            CasOutcome::Applied { attempts, .. } => Ok(attempts),
            CasOutcome::Exhausted {
                attempts,
                last_error,
            } => Err(InstanceError::RetriesExhausted {
                operation: "claiming primary role",
                attempts,
                source: Box::new(last_error),
            }),
            CasOutcome::Failed(err) => Err(err),
        }
    }
}
