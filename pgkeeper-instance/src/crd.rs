//! Cluster Custom Resource Definition.
//!
//! The instance manager only reads a small part of the resource: the
//! number of instances and the primary the cluster-level controller
//! designated. The one field it writes is `status.currentPrimary`.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Cluster is the Schema for the clusters API.
///
/// A Cluster is a replicated PostgreSQL deployment. Every member pod runs
/// an instance manager that watches this resource and converges the local
/// instance's role towards `status.targetPrimary`.
#[derive(CustomResource, Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "postgresql.pgkeeper.io",
    version = "v1",
    kind = "Cluster",
    plural = "clusters",
    shortname = "pgc",
    namespaced,
    status = "ClusterStatus",
    derive = "PartialEq",
    printcolumn = r#"{"name":"Instances", "type":"integer", "jsonPath":".spec.instances"}"#,
    printcolumn = r#"{"name":"Primary", "type":"string", "jsonPath":".status.currentPrimary"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSpec {
    /// Number of PostgreSQL instances in the cluster.
    #[serde(default = "default_instances")]
    pub instances: i32,
}

fn default_instances() -> i32 {
    1
}

/// Status of a Cluster.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClusterStatus {
    /// Pod that should be running as primary.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_primary: Option<String>,

    /// Pod that last claimed the primary role after promoting itself.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_primary: Option<String>,

    /// Whether a configuration change is waiting for a restart.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pending_restart: Option<bool>,
}

impl Cluster {
    /// The designated primary, if the cluster controller has chosen one.
    pub fn target_primary(&self) -> Option<&str> {
        self.status.as_ref()?.target_primary.as_deref()
    }

    /// The instance that currently claims the primary role.
    pub fn current_primary(&self) -> Option<&str> {
        self.status.as_ref()?.current_primary.as_deref()
    }

    /// Number of instances requested by the spec.
    pub fn instances(&self) -> i32 {
        self.spec.instances
    }

    /// Set `status.currentPrimary`, creating the status block if needed.
    pub fn set_current_primary(&mut self, pod_name: &str) {
        self.status
            .get_or_insert_with(ClusterStatus::default)
            .current_primary = Some(pod_name.to_string());
    }
}
