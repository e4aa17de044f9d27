//! The local instance handle used by the reconciler.

use crate::admin::AdminDatabase;
use crate::error::EngineResult;
use async_trait::async_trait;
use std::path::Path;

/// Status read back from the engine after a reload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct InstanceStatus {
    /// At least one setting changed that only takes effect after a restart.
    pub pending_restart: bool,
    /// The instance is not in recovery.
    pub is_primary: bool,
}

/// Administrative interface of the PostgreSQL instance running next to
/// this process.
///
/// Every method talks to the live server or to `pg_ctl`; none of them
/// caches state between calls.
#[async_trait]
pub trait LocalInstance: Send + Sync {
    /// Data directory of the instance.
    fn pgdata(&self) -> &Path;

    /// Whether the instance is running as a primary.
    async fn is_primary(&self) -> EngineResult<bool>;

    /// Whether a WAL receiver is currently streaming from an upstream node.
    async fn is_wal_receiver_active(&self) -> EngineResult<bool>;

    /// Bytes of WAL received but not yet replayed.
    async fn wal_apply_lag(&self) -> EngineResult<i64>;

    /// Promote the instance and wait until promotion completes.
    async fn promote_and_wait(&self) -> EngineResult<()>;

    /// Fast shutdown. The process supervisor is expected to restart it.
    async fn shutdown(&self) -> EngineResult<()>;

    /// Signal the postmaster to reload configuration and TLS material.
    ///
    /// Returns once the signal is sent; there is no acknowledgement that
    /// the new files were picked up.
    async fn reload(&self) -> EngineResult<()>;

    /// Pending-restart flag and role.
    async fn status(&self) -> EngineResult<InstanceStatus>;

    /// Major version of the data directory.
    async fn major_version(&self) -> EngineResult<u32>;

    /// Open a superuser connection handle private to the caller.
    ///
    /// The handle connects lazily: obtaining it succeeds even while the
    /// server is still starting.
    async fn admin_database(&self) -> EngineResult<Box<dyn AdminDatabase>>;
}
