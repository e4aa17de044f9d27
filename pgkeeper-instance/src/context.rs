//! Shared context passed to every reconciler component.

use crate::config::ManagerConfig;
use crate::status::ClusterStatusStore;
use pgkeeper_engine::{FileWriter, LocalInstance};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Who this instance manager is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceIdentity {
    /// Pod name; compared against the cluster's target primary.
    pub pod_name: String,
    /// Namespace of the cluster.
    pub namespace: String,
    /// Name of the `Cluster` resource.
    pub cluster_name: String,
}

impl InstanceIdentity {
    /// Identity described by `config`.
    pub fn from_config(config: &ManagerConfig) -> Self {
        Self {
            pod_name: config.pod_name.clone(),
            namespace: config.namespace.clone(),
            cluster_name: config.cluster_name.clone(),
        }
    }
}

/// Everything a component needs to act on the local instance.
#[derive(Clone)]
pub struct InstanceContext {
    /// Identity of this instance.
    pub identity: InstanceIdentity,
    /// Handle to the local database engine.
    pub instance: Arc<dyn LocalInstance>,
    /// Shared cluster status record.
    pub status_store: Arc<dyn ClusterStatusStore>,
    /// Writer for certificates and configuration files.
    pub files: Arc<dyn FileWriter>,
    /// Process configuration.
    pub config: Arc<ManagerConfig>,
    /// Fires when the process is shutting down.
    pub cancel: CancellationToken,
}

impl InstanceContext {
    /// Create a new context.
    pub fn new(
        config: ManagerConfig,
        instance: Arc<dyn LocalInstance>,
        status_store: Arc<dyn ClusterStatusStore>,
        files: Arc<dyn FileWriter>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            identity: InstanceIdentity::from_config(&config),
            instance,
            status_store,
            files,
            config: Arc::new(config),
            cancel,
        }
    }

    /// Pod name of this instance.
    pub fn pod_name(&self) -> &str {
        &self.identity.pod_name
    }
}
