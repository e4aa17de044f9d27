//! Reacting to changes of the `Cluster` resource.

use super::demotion::{DemotionOutcome, demote_if_primary};
use super::permissions::{PrivilegeProvisioner, ProvisionReport};
use super::promotion::{PromotionCoordinator, PromotionOutcome};
use crate::context::InstanceContext;
use crate::crd::Cluster;
use crate::error::{InstanceError, InstanceResult};
use crate::event::{ChangeType, ResourceEvent};

/// What a cluster event led to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClusterAction {
    /// This instance is the target primary and is running as one.
    Promoted {
        /// How the promotion went.
        outcome: PromotionOutcome,
        /// Provisioning result, for the first sighting of the cluster.
        provisioning: Option<ProvisionReport>,
    },
    /// Promotion failed on the first sighting of the cluster; the failure
    /// was logged and privileges were not provisioned.
    PromotionAbandoned,
    /// This instance is not the target primary.
    Demotion(DemotionOutcome),
}

/// Converge the local instance's role towards the cluster's target primary.
pub async fn reconcile_cluster(
    ctx: &InstanceContext,
    event: &ResourceEvent,
) -> InstanceResult<ClusterAction> {
    let cluster: Cluster = event.decode("cluster")?;
    let target_primary = cluster
        .target_primary()
        .ok_or(InstanceError::MissingField {
            kind: "Cluster",
            field: "status.targetPrimary",
        })?
        .to_string();

    if target_primary != ctx.pod_name() {
        tracing::debug!(target_primary = %target_primary, "Not the target primary");
        return demote_if_primary(ctx).await.map(ClusterAction::Demotion);
    }

    let mut coordinator = PromotionCoordinator::new(ctx);
    let result = coordinator.run(cluster).await;
    let outcome = match result {
        Ok(outcome) => outcome,
        Err(err) if err.is_fatal() => return Err(err),
        Err(err) if event.change == ChangeType::Added => {
            tracing::warn!(
                error = %err,
                state = %coordinator.state(),
                "Error while promoting instance, permissions cannot be configured"
            );
            return Ok(ClusterAction::PromotionAbandoned);
        }
        Err(err) => return Err(err),
    };

    let provisioning = if event.change == ChangeType::Added {
        Some(PrivilegeProvisioner::new(ctx).run().await?)
    } else {
        None
    };

    Ok(ClusterAction::Promoted {
        outcome,
        provisioning,
    })
}
