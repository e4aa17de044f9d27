//! pgkeeper instance manager
//!
//! Runs next to every PostgreSQL instance of a replicated cluster on
//! Kubernetes and turns watch events into local role transitions:
//!
//! - promoting the instance when the cluster designates it as primary,
//!   after replication has fully drained, and recording the claim on the
//!   shared cluster status under optimistic concurrency
//! - shutting down a primary that lost its designation so it comes back
//!   as a replica
//! - provisioning the streaming replication role on first activation
//! - writing rotated TLS material and configuration changes, then
//!   reloading (or restarting) the server
//!
//! # Custom Resource Definitions
//!
//! - **Cluster**: the replicated PostgreSQL deployment; its status carries
//!   the target and current primary
//!
//! # Example
//!
//! ```yaml
//! apiVersion: postgresql.pgkeeper.io/v1
//! kind: Cluster
//! metadata:
//!   name: db
//! spec:
//!   instances: 3
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod context;
pub mod crd;
pub mod error;
pub mod event;
pub mod observability;
pub mod reconciler;
pub mod retry;
pub mod status;
pub mod testing;
pub mod watch;

pub use config::ManagerConfig;
pub use context::{InstanceContext, InstanceIdentity};
pub use crd::{Cluster, ClusterSpec, ClusterStatus};
pub use error::{InstanceError, InstanceResult};
pub use event::{ChangeType, ResourceEvent, ResourceKind};
pub use reconciler::Dispatcher;
