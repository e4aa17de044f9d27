//! Test harness wiring the in-memory providers into an [`InstanceContext`].
//!
//! # Example
//!
//! ```
//! use pgkeeper_engine::testing::MockInstance;
//! use pgkeeper_instance::testing::TestHarness;
//!
//! let harness = TestHarness::new(MockInstance::replica())
//!     .with_cluster(3, Some("db-1"));
//! let ctx = harness.context();
//! assert_eq!(ctx.pod_name(), "db-1");
//! ```

use crate::config::ManagerConfig;
use crate::context::InstanceContext;
use crate::crd::{Cluster, ClusterSpec};
use crate::status::MemoryStatusStore;
use pgkeeper_engine::MemoryFiles;
use pgkeeper_engine::testing::{MockAdminDatabase, MockInstance};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Pod name the harness runs as.
pub const POD_NAME: &str = "db-1";

/// Cluster the harness belongs to.
pub const CLUSTER_NAME: &str = "db";

/// Namespace the harness runs in.
pub const NAMESPACE: &str = "default";

/// Directory the harness materializes certificates into.
pub const CERTIFICATES_DIR: &str = "/certs";

/// Mocks plus the context built from them.
///
/// Every provider is shared with the contexts the harness hands out, so
/// tests can act through a context and then inspect the mocks.
pub struct TestHarness {
    /// Local instance double.
    pub instance: Arc<MockInstance>,
    /// Status record double.
    pub store: Arc<MemoryStatusStore>,
    /// File writer double.
    pub files: Arc<MemoryFiles>,
    /// Configuration handed to components.
    pub config: ManagerConfig,
    /// Cancellation token shared with every context.
    pub cancel: CancellationToken,
}

impl TestHarness {
    /// Harness for a single-instance cluster with no target primary.
    pub fn new(instance: MockInstance) -> Self {
        Self {
            instance: Arc::new(instance),
            store: Arc::new(MemoryStatusStore::new(cluster(1, None))),
            files: Arc::new(MemoryFiles::new()),
            config: default_config(),
            cancel: CancellationToken::new(),
        }
    }

    /// Replace the stored cluster record.
    pub fn with_cluster(self, instances: i32, target_primary: Option<&str>) -> Self {
        self.with_store(MemoryStatusStore::new(cluster(instances, target_primary)))
    }

    /// Replace the status store.
    pub fn with_store(mut self, store: MemoryStatusStore) -> Self {
        self.store = Arc::new(store);
        self
    }

    /// Replace the file writer.
    pub fn with_files(mut self, files: MemoryFiles) -> Self {
        self.files = Arc::new(files);
        self
    }

    /// Adjust the configuration.
    pub fn with_config(mut self, adjust: impl FnOnce(&mut ManagerConfig)) -> Self {
        adjust(&mut self.config);
        self
    }

    /// Administrative database behind the mock instance.
    pub fn admin(&self) -> &MockAdminDatabase {
        self.instance.admin()
    }

    /// A context sharing the harness's providers.
    pub fn context(&self) -> InstanceContext {
        InstanceContext::new(
            self.config.clone(),
            self.instance.clone(),
            self.store.clone(),
            self.files.clone(),
            self.cancel.clone(),
        )
    }
}

/// Configuration the harness uses by default.
pub fn default_config() -> ManagerConfig {
    let mut config = ManagerConfig {
        pod_name: POD_NAME.to_string(),
        namespace: NAMESPACE.to_string(),
        cluster_name: CLUSTER_NAME.to_string(),
        ..ManagerConfig::default()
    };
    config.certificates = crate::config::CertificateLocations::in_dir(CERTIFICATES_DIR);
    config
}

/// A cluster record with `instances` members and an optional target.
pub fn cluster(instances: i32, target_primary: Option<&str>) -> Cluster {
    let mut cluster = Cluster::new(CLUSTER_NAME, ClusterSpec { instances });
    cluster.metadata.namespace = Some(NAMESPACE.to_string());
    if let Some(target) = target_primary {
        cluster
            .status
            .get_or_insert_with(Default::default)
            .target_primary = Some(target.to_string());
    }
    cluster
}
