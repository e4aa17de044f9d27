//! Access to the shared cluster status record.
//!
//! The record is written by every instance that promotes itself, so writes
//! carry the version token they were read at and are rejected when it is
//! stale.

use crate::crd::Cluster;
use crate::error::{InstanceError, InstanceResult};
use async_trait::async_trait;
use kube::api::{Patch, PatchParams};
use kube::{Api, ResourceExt};
use parking_lot::Mutex;
use serde_json::json;

/// Provider trait for the cluster status record.
#[async_trait]
pub trait ClusterStatusStore: Send + Sync {
    /// Read the current record, including its version token.
    async fn get(&self) -> InstanceResult<Cluster>;

    /// Write `cluster.status`, conditional on `cluster`'s version token.
    ///
    /// Returns the stored record with its new version token, or an error
    /// for which [`InstanceError::is_conflict`] holds when the token is
    /// stale.
    async fn update_status(&self, cluster: &Cluster) -> InstanceResult<Cluster>;
}

/// Status store backed by the Kubernetes API.
#[derive(Clone)]
pub struct KubeStatusStore {
    api: Api<Cluster>,
    name: String,
}

impl KubeStatusStore {
    /// Store for the cluster `name` in `namespace`.
    pub fn new(client: kube::Client, namespace: &str, name: impl Into<String>) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
            name: name.into(),
        }
    }
}

#[async_trait]
impl ClusterStatusStore for KubeStatusStore {
    async fn get(&self) -> InstanceResult<Cluster> {
        Ok(self.api.get_status(&self.name).await?)
    }

    async fn update_status(&self, cluster: &Cluster) -> InstanceResult<Cluster> {
        let resource_version =
            cluster
                .resource_version()
                .ok_or(InstanceError::MissingField {
                    kind: "Cluster",
                    field: "metadata.resourceVersion",
                })?;

        // A resourceVersion in a merge patch makes the API server reject
        // the write with 409 when the object moved on.
        let patch = json!({
            "metadata": { "resourceVersion": resource_version },
            "status": cluster.status,
        });

        match self
            .api
            .patch_status(&self.name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
        {
            Ok(updated) => Ok(updated),
            Err(kube::Error::Api(err)) if err.code == 409 => {
                Err(InstanceError::Conflict { resource_version })
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[derive(Debug)]
struct MemoryState {
    cluster: Cluster,
    version: u64,
    concurrent_writes: u32,
    gets: usize,
    accepted: usize,
    conflicts: usize,
}

/// In-memory status store with real version-token semantics.
///
/// # Example
///
/// ```
/// use pgkeeper_instance::crd::{Cluster, ClusterSpec};
/// use pgkeeper_instance::status::MemoryStatusStore;
///
/// let store = MemoryStatusStore::new(Cluster::new("db", ClusterSpec { instances: 3 }))
///     .with_target_primary("db-2")
///     .with_concurrent_writes(1);
/// assert_eq!(store.snapshot().target_primary(), Some("db-2"));
/// ```
#[derive(Debug)]
pub struct MemoryStatusStore {
    state: Mutex<MemoryState>,
}

impl MemoryStatusStore {
    /// Store holding `cluster` at version 1.
    pub fn new(cluster: Cluster) -> Self {
        let mut store = MemoryState {
            cluster,
            version: 1,
            concurrent_writes: 0,
            gets: 0,
            accepted: 0,
            conflicts: 0,
        };
        store.cluster.metadata.resource_version = Some("1".to_string());
        Self {
            state: Mutex::new(store),
        }
    }

    /// Set `status.targetPrimary`.
    pub fn with_target_primary(self, pod_name: &str) -> Self {
        self.state
            .lock()
            .cluster
            .status
            .get_or_insert_with(Default::default)
            .target_primary = Some(pod_name.to_string());
        self
    }

    /// Simulate another writer landing just before each of the next
    /// `count` updates, making their version tokens stale.
    pub fn with_concurrent_writes(self, count: u32) -> Self {
        self.state.lock().concurrent_writes = count;
        self
    }

    /// The stored record.
    pub fn snapshot(&self) -> Cluster {
        self.state.lock().cluster.clone()
    }

    /// Number of reads served.
    pub fn gets(&self) -> usize {
        self.state.lock().gets
    }

    /// Number of writes accepted.
    pub fn accepted_writes(&self) -> usize {
        self.state.lock().accepted
    }

    /// Number of writes rejected as stale.
    pub fn conflicts(&self) -> usize {
        self.state.lock().conflicts
    }

    fn bump(state: &mut MemoryState) {
        state.version += 1;
        state.cluster.metadata.resource_version = Some(state.version.to_string());
    }
}

#[async_trait]
impl ClusterStatusStore for MemoryStatusStore {
    async fn get(&self) -> InstanceResult<Cluster> {
        let mut state = self.state.lock();
        state.gets += 1;
        Ok(state.cluster.clone())
    }

    async fn update_status(&self, cluster: &Cluster) -> InstanceResult<Cluster> {
        let mut state = self.state.lock();
        if state.concurrent_writes > 0 {
            state.concurrent_writes -= 1;
            Self::bump(&mut state);
        }

        let presented = cluster.resource_version().unwrap_or_default();
        if presented != state.version.to_string() {
            state.conflicts += 1;
            return Err(InstanceError::Conflict {
                resource_version: presented,
            });
        }

        state.cluster.status = cluster.status.clone();
        state.accepted += 1;
        Self::bump(&mut state);
        Ok(state.cluster.clone())
    }
}
