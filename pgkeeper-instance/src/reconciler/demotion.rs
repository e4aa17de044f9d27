//! Shutting down a primary that is no longer the designated one.

use crate::context::InstanceContext;
use crate::error::{InstanceError, InstanceResult};

/// What the demotion handler did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DemotionOutcome {
    /// The local instance is a replica; nothing to do.
    AlreadyReplica,
    /// The local instance was a primary and has been stopped.
    ShutDown,
}

/// Stop the local instance if it is running as primary.
///
/// The supervisor restarts the process, which brings the instance back up
/// as a replica following the new primary.
pub async fn demote_if_primary(ctx: &InstanceContext) -> InstanceResult<DemotionOutcome> {
    let is_primary = ctx
        .instance
        .is_primary()
        .await
        .map_err(|e| InstanceError::engine("checking instance role", e))?;

    if !is_primary {
        tracing::debug!(pod = %ctx.pod_name(), "Not primary, nothing to demote");
        return Ok(DemotionOutcome::AlreadyReplica);
    }

    tracing::info!(
        pod = %ctx.pod_name(),
        "This is an old primary node. Shutting it down to get it demoted to a replica"
    );
    ctx.instance
        .shutdown()
        .await
        .map_err(|e| InstanceError::engine("shutting down old primary", e))?;

    Ok(DemotionOutcome::ShutDown)
}
