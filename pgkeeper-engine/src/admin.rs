//! Superuser connection used to provision roles and privileges.

use crate::error::EngineResult;
use async_trait::async_trait;

/// Functions the replication role must be able to execute for `pg_rewind`
/// to work without superuser rights (PostgreSQL 11 and later).
pub const REWIND_FUNCTIONS: [&str; 4] = [
    "pg_ls_dir(text, boolean, boolean)",
    "pg_stat_file(text, boolean)",
    "pg_read_binary_file(text)",
    "pg_read_binary_file(text, bigint, bigint, boolean)",
];

/// Checks every entry of [`REWIND_FUNCTIONS`] for the role bound to `$1`
/// in a single round trip.
pub const REWIND_PRIVILEGES_QUERY: &str = "\
SELECT has_function_privilege($1, 'pg_ls_dir(text, boolean, boolean)', 'execute') AND \
has_function_privilege($1, 'pg_stat_file(text, boolean)', 'execute') AND \
has_function_privilege($1, 'pg_read_binary_file(text)', 'execute') AND \
has_function_privilege($1, 'pg_read_binary_file(text, bigint, bigint, boolean)', 'execute')";

/// Attributes of a role as stored in `pg_roles`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RoleAttributes {
    /// `rolcanlogin`
    pub can_login: bool,
    /// `rolreplication`
    pub replication: bool,
    /// `rolsuper`
    pub superuser: bool,
}

/// Administrative connection to the local instance.
#[async_trait]
pub trait AdminDatabase: Send + Sync {
    /// Round trip to the server, connecting first if needed.
    async fn ping(&self) -> EngineResult<()>;

    /// Attributes of `role`, or `None` when the role does not exist.
    async fn role_attributes(&self, role: &str) -> EngineResult<Option<RoleAttributes>>;

    /// Whether `role` may execute all of [`REWIND_FUNCTIONS`].
    async fn has_rewind_privileges(&self, role: &str) -> EngineResult<bool>;

    /// Run a statement that returns no rows.
    async fn execute(&self, statement: &str) -> EngineResult<()>;
}

/// Quote an SQL identifier so it can be interpolated into statement text.
pub fn quote_identifier(name: &str) -> String {
    let mut quoted = String::with_capacity(name.len() + 2);
    quoted.push('"');
    for ch in name.chars() {
        // A NUL byte terminates the identifier on the server side
        if ch == '\0' {
            break;
        }
        if ch == '"' {
            quoted.push('"');
        }
        quoted.push(ch);
    }
    quoted.push('"');
    quoted
}
