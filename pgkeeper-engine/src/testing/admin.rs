//! Stateful [`AdminDatabase`] double.

use crate::admin::{AdminDatabase, REWIND_FUNCTIONS, RoleAttributes};
use crate::error::{EngineError, EngineResult};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

#[derive(Debug, Default)]
struct State {
    role: Option<RoleAttributes>,
    granted_functions: HashSet<String>,
    ping_results: VecDeque<Option<EngineError>>,
    pings: usize,
    rewind_checks: usize,
    statements: Vec<String>,
}

/// In-memory administrative database.
///
/// Statements passed to `execute` are applied to a tiny model of the
/// replication role, so running the provisioner twice behaves the way it
/// would against a real server: the second pass finds nothing to do.
/// Clones share state.
#[derive(Debug, Clone, Default)]
pub struct MockAdminDatabase {
    state: Arc<Mutex<State>>,
}

impl MockAdminDatabase {
    /// A server without the replication role.
    pub fn new() -> Self {
        Self::default()
    }

    /// Start with the replication role present with `attributes`.
    pub fn with_role(self, attributes: RoleAttributes) -> Self {
        self.state.lock().role = Some(attributes);
        self
    }

    /// Start with every `pg_rewind` function already granted.
    pub fn with_rewind_grants(self) -> Self {
        self.state
            .lock()
            .granted_functions
            .extend(REWIND_FUNCTIONS.iter().map(|f| f.to_string()));
        self
    }

    /// Fail the next `count` pings with a "still starting" error.
    pub fn starting_for(self, count: usize) -> Self {
        {
            let mut state = self.state.lock();
            for _ in 0..count {
                state
                    .ping_results
                    .push_back(Some(EngineError::Unavailable("the database system is starting up".into())));
            }
        }
        self
    }

    /// Fail the next ping with a non-retryable error.
    pub fn failing_ping(self, message: impl Into<String>) -> Self {
        self.state
            .lock()
            .ping_results
            .push_back(Some(EngineError::Query(message.into())));
        self
    }

    /// Current model of the replication role.
    pub fn role(&self) -> Option<RoleAttributes> {
        self.state.lock().role
    }

    /// Statements executed so far, in order.
    pub fn statements(&self) -> Vec<String> {
        self.state.lock().statements.clone()
    }

    /// Number of pings received.
    pub fn pings(&self) -> usize {
        self.state.lock().pings
    }

    /// Number of combined rewind privilege checks performed.
    pub fn rewind_checks(&self) -> usize {
        self.state.lock().rewind_checks
    }

    fn apply(state: &mut State, statement: &str) {
        let upper = statement.to_uppercase();
        if upper.starts_with("CREATE USER") {
            state.role = Some(RoleAttributes {
                can_login: true,
                replication: upper.contains(" REPLICATION"),
                superuser: false,
            });
        } else if upper.starts_with("ALTER USER") {
            let role = state.role.get_or_insert_with(RoleAttributes::default);
            if upper.contains(" LOGIN") {
                role.can_login = true;
            }
            if upper.contains(" REPLICATION") {
                role.replication = true;
            }
            if upper.contains(" SUPERUSER") {
                role.superuser = true;
            }
        } else if upper.starts_with("GRANT EXECUTE") {
            if let Some(function) = REWIND_FUNCTIONS
                .iter()
                .find(|f| statement.contains(&format!("pg_catalog.{f} ")))
            {
                state.granted_functions.insert(function.to_string());
            }
        }
    }
}

#[async_trait]
impl AdminDatabase for MockAdminDatabase {
    async fn ping(&self) -> EngineResult<()> {
        let mut state = self.state.lock();
        state.pings += 1;
        match state.ping_results.pop_front().flatten() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn role_attributes(&self, _role: &str) -> EngineResult<Option<RoleAttributes>> {
        Ok(self.state.lock().role)
    }

    async fn has_rewind_privileges(&self, _role: &str) -> EngineResult<bool> {
        let mut state = self.state.lock();
        state.rewind_checks += 1;
        Ok(REWIND_FUNCTIONS
            .iter()
            .all(|f| state.granted_functions.contains(*f)))
    }

    async fn execute(&self, statement: &str) -> EngineResult<()> {
        let mut state = self.state.lock();
        state.statements.push(statement.to_string());
        Self::apply(&mut state, statement);
        Ok(())
    }
}
