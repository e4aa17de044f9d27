//! Scriptable [`LocalInstance`] double.

use super::admin::MockAdminDatabase;
use crate::admin::AdminDatabase;
use crate::error::{EngineError, EngineResult};
use crate::instance::{InstanceStatus, LocalInstance};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};

/// A call observed by [`MockInstance`], with the value it returned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstanceCall {
    /// `is_primary` returned the value.
    IsPrimary(bool),
    /// `is_wal_receiver_active` returned the value.
    WalReceiverActive(bool),
    /// `wal_apply_lag` returned the value.
    ApplyLag(i64),
    /// `promote_and_wait` was invoked.
    Promote,
    /// `shutdown` was invoked.
    Shutdown,
    /// `reload` was invoked.
    Reload,
    /// `status` returned the value.
    Status(InstanceStatus),
    /// `major_version` returned the value.
    MajorVersion(u32),
    /// `admin_database` handed out a connection.
    AdminDatabase,
}

#[derive(Debug)]
struct State {
    primary: bool,
    wal_receiver: VecDeque<bool>,
    apply_lag: VecDeque<i64>,
    pending_restart: bool,
    major_version: u32,
    promote_error: Option<String>,
    shutdown_error: Option<String>,
    reload_error: Option<String>,
    calls: Vec<InstanceCall>,
}

/// Scriptable local instance.
///
/// Sequences passed to `with_wal_receiver` and `with_apply_lag` are
/// consumed one value per poll; the last value sticks once the sequence
/// is exhausted.
///
/// # Example
///
/// ```
/// use pgkeeper_engine::testing::MockInstance;
///
/// let instance = MockInstance::replica()
///     .with_wal_receiver([true, true, false])
///     .with_apply_lag([500, 0]);
/// assert_eq!(instance.promotions(), 0);
/// ```
#[derive(Debug)]
pub struct MockInstance {
    pgdata: PathBuf,
    admin: MockAdminDatabase,
    state: Mutex<State>,
}

impl MockInstance {
    fn new(primary: bool) -> Self {
        Self {
            pgdata: PathBuf::from("/var/lib/postgresql/data/pgdata"),
            admin: MockAdminDatabase::new(),
            state: Mutex::new(State {
                primary,
                wal_receiver: VecDeque::from([false]),
                apply_lag: VecDeque::from([0]),
                pending_restart: false,
                major_version: 16,
                promote_error: None,
                shutdown_error: None,
                reload_error: None,
                calls: Vec::new(),
            }),
        }
    }

    /// An instance running in recovery.
    pub fn replica() -> Self {
        Self::new(false)
    }

    /// An instance running as primary.
    pub fn primary() -> Self {
        Self::new(true)
    }

    /// Values returned by successive `is_wal_receiver_active` calls.
    pub fn with_wal_receiver(self, values: impl IntoIterator<Item = bool>) -> Self {
        self.state.lock().wal_receiver = values.into_iter().collect();
        self
    }

    /// Values returned by successive `wal_apply_lag` calls.
    pub fn with_apply_lag(self, values: impl IntoIterator<Item = i64>) -> Self {
        self.state.lock().apply_lag = values.into_iter().collect();
        self
    }

    /// Value reported as `pending_restart`.
    pub fn with_pending_restart(self, pending: bool) -> Self {
        self.state.lock().pending_restart = pending;
        self
    }

    /// Major version of the data directory.
    pub fn with_major_version(self, version: u32) -> Self {
        self.state.lock().major_version = version;
        self
    }

    /// Administrative database handed out by `admin_database`.
    pub fn with_admin(mut self, admin: MockAdminDatabase) -> Self {
        self.admin = admin;
        self
    }

    /// Make `promote_and_wait` fail.
    pub fn failing_promote(self, message: impl Into<String>) -> Self {
        self.state.lock().promote_error = Some(message.into());
        self
    }

    /// Make `shutdown` fail.
    pub fn failing_shutdown(self, message: impl Into<String>) -> Self {
        self.state.lock().shutdown_error = Some(message.into());
        self
    }

    /// Make `reload` fail.
    pub fn failing_reload(self, message: impl Into<String>) -> Self {
        self.state.lock().reload_error = Some(message.into());
        self
    }

    /// The administrative database shared with this instance.
    pub fn admin(&self) -> &MockAdminDatabase {
        &self.admin
    }

    /// Every call received so far, in order.
    pub fn calls(&self) -> Vec<InstanceCall> {
        self.state.lock().calls.clone()
    }

    /// Number of promotions performed.
    pub fn promotions(&self) -> usize {
        self.count(|c| matches!(c, InstanceCall::Promote))
    }

    /// Number of shutdowns performed.
    pub fn shutdowns(&self) -> usize {
        self.count(|c| matches!(c, InstanceCall::Shutdown))
    }

    /// Number of reloads requested.
    pub fn reloads(&self) -> usize {
        self.count(|c| matches!(c, InstanceCall::Reload))
    }

    fn count(&self, predicate: impl Fn(&InstanceCall) -> bool) -> usize {
        self.state.lock().calls.iter().filter(|c| predicate(c)).count()
    }

    fn next<T: Copy + Default>(queue: &mut VecDeque<T>) -> T {
        if queue.len() > 1 {
            queue.pop_front().unwrap_or_default()
        } else {
            queue.front().copied().unwrap_or_default()
        }
    }

    fn failure(operation: &'static str, message: &Option<String>) -> EngineResult<()> {
        match message {
            Some(stderr) => Err(EngineError::Command {
                operation,
                status: "exit status: 1".to_string(),
                stderr: stderr.clone(),
            }),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl LocalInstance for MockInstance {
    fn pgdata(&self) -> &Path {
        &self.pgdata
    }

    async fn is_primary(&self) -> EngineResult<bool> {
        let mut state = self.state.lock();
        let primary = state.primary;
        state.calls.push(InstanceCall::IsPrimary(primary));
        Ok(primary)
    }

    async fn is_wal_receiver_active(&self) -> EngineResult<bool> {
        let mut state = self.state.lock();
        let active = Self::next(&mut state.wal_receiver);
        state.calls.push(InstanceCall::WalReceiverActive(active));
        Ok(active)
    }

    async fn wal_apply_lag(&self) -> EngineResult<i64> {
        let mut state = self.state.lock();
        let lag = Self::next(&mut state.apply_lag);
        state.calls.push(InstanceCall::ApplyLag(lag));
        Ok(lag)
    }

    async fn promote_and_wait(&self) -> EngineResult<()> {
        let mut state = self.state.lock();
        state.calls.push(InstanceCall::Promote);
        Self::failure("promote", &state.promote_error)?;
        state.primary = true;
        Ok(())
    }

    async fn shutdown(&self) -> EngineResult<()> {
        let mut state = self.state.lock();
        state.calls.push(InstanceCall::Shutdown);
        Self::failure("stop", &state.shutdown_error)
    }

    async fn reload(&self) -> EngineResult<()> {
        let mut state = self.state.lock();
        state.calls.push(InstanceCall::Reload);
        Self::failure("reload", &state.reload_error)
    }

    async fn status(&self) -> EngineResult<InstanceStatus> {
        let mut state = self.state.lock();
        let status = InstanceStatus {
            pending_restart: state.pending_restart,
            is_primary: state.primary,
        };
        state.calls.push(InstanceCall::Status(status));
        Ok(status)
    }

    async fn major_version(&self) -> EngineResult<u32> {
        let mut state = self.state.lock();
        let version = state.major_version;
        state.calls.push(InstanceCall::MajorVersion(version));
        Ok(version)
    }

    async fn admin_database(&self) -> EngineResult<Box<dyn AdminDatabase>> {
        self.state.lock().calls.push(InstanceCall::AdminDatabase);
        Ok(Box::new(self.admin.clone()))
    }
}
