//! Provisioning the streaming replication role.
//!
//! Runs once, when a freshly added cluster makes this instance primary.
//! The replication role must be able to log in and replicate. It also needs
//! enough rights for `pg_rewind` to resynchronize a demoted primary:
//! superuser up to PostgreSQL 10, and execute grants on a handful of file
//! access functions from 11 on. Every step checks before it changes
//! anything, so running it again is a no-op.

use crate::context::InstanceContext;
use crate::error::{InstanceError, InstanceResult};
use crate::retry::{PollStep, poll_until};
use pgkeeper_engine::{AdminDatabase, REWIND_FUNCTIONS, quote_identifier};

/// Last major version where `pg_rewind` needs a superuser.
pub const LAST_SUPERUSER_REWIND_VERSION: u32 = 10;

/// Statements a provisioning run executed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProvisionReport {
    /// Major version of the data directory.
    pub major_version: u32,
    /// Statements executed, in order.
    pub statements: Vec<String>,
}

impl ProvisionReport {
    /// Whether the role already had everything it needs.
    pub fn is_noop(&self) -> bool {
        self.statements.is_empty()
    }
}

/// Ensures the replication role has exactly the privileges it needs.
pub struct PrivilegeProvisioner<'a> {
    ctx: &'a InstanceContext,
}

impl<'a> PrivilegeProvisioner<'a> {
    /// Create a provisioner bound to `ctx`.
    pub fn new(ctx: &'a InstanceContext) -> Self {
        Self { ctx }
    }

    /// Wait for the server and provision the role.
    ///
    /// Failing to reach the server, other than while it is still starting,
    /// is returned as a fatal error.
    pub async fn run(&self) -> InstanceResult<ProvisionReport> {
        let ctx = self.ctx;
        let role = ctx.config.replication_user.as_str();

        let major_version = ctx
            .instance
            .major_version()
            .await
            .map_err(|e| InstanceError::engine("reading PostgreSQL version", e))?;

        let admin = ctx
            .instance
            .admin_database()
            .await
            .map_err(|e| InstanceError::engine("opening administrative connection", e))?;
        let db = admin.as_ref();

        self.wait_for_server(db).await?;

        let mut report = ProvisionReport {
            major_version,
            statements: Vec::new(),
        };
        let quoted = quote_identifier(role);

        let attributes = db
            .role_attributes(role)
            .await
            .map_err(|e| InstanceError::engine("reading replication role", e))?;
        match attributes {
            None => {
                execute(db, &mut report, format!("CREATE USER {quoted} REPLICATION")).await?;
            }
            Some(attrs) if !attrs.can_login || !attrs.replication => {
                execute(db, &mut report, format!("ALTER USER {quoted} LOGIN REPLICATION")).await?;
            }
            Some(_) => {}
        }

        if major_version <= LAST_SUPERUSER_REWIND_VERSION {
            let superuser = attributes.is_some_and(|attrs| attrs.superuser);
            if !superuser {
                execute(db, &mut report, format!("ALTER USER {quoted} SUPERUSER")).await?;
            }
        } else {
            let granted = db
                .has_rewind_privileges(role)
                .await
                .map_err(|e| InstanceError::engine("checking pg_rewind privileges", e))?;
            if !granted {
                for function in REWIND_FUNCTIONS {
                    execute(
                        db,
                        &mut report,
                        format!("GRANT EXECUTE ON FUNCTION pg_catalog.{function} TO {quoted}"),
                    )
                    .await?;
                }
            }
        }

        if report.is_noop() {
            tracing::debug!(role, major_version, "Replication role already provisioned");
        } else {
            tracing::info!(
                role,
                major_version,
                statements = report.statements.len(),
                "Provisioned replication role"
            );
        }
        Ok(report)
    }

    async fn wait_for_server(&self, db: &dyn AdminDatabase) -> InstanceResult<()> {
        let ctx = self.ctx;
        let result = poll_until(
            &ctx.config.startup_probe_policy(),
            &ctx.cancel,
            "database server to accept connections",
            |attempt| async move {
                match db.ping().await {
                    Ok(()) => Ok(PollStep::Ready(())),
                    Err(e) if e.is_transient() => {
                        tracing::debug!(attempt, error = %e, "Database server not ready yet");
                        Ok(PollStep::Pending)
                    }
                    Err(e) => Err(InstanceError::engine("connecting to local database", e)),
                }
            },
        )
        .await;

        match result {
            Ok(()) => Ok(()),
            Err(err @ InstanceError::Cancelled { .. }) => Err(err),
            Err(err) => Err(InstanceError::fatal(
                "database server did not become reachable",
                err,
            )),
        }
    }
}

async fn execute(
    db: &dyn AdminDatabase,
    report: &mut ProvisionReport,
    statement: String,
) -> InstanceResult<()> {
    tracing::info!(statement = %statement, "Provisioning replication role");
    db.execute(&statement)
        .await
        .map_err(|e| InstanceError::engine("provisioning replication role", e))?;
    report.statements.push(statement);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TestHarness;
    use pgkeeper_engine::RoleAttributes;
    use pgkeeper_engine::testing::{MockAdminDatabase, MockInstance};

    fn harness(version: u32, admin: MockAdminDatabase) -> TestHarness {
        TestHarness::new(
            MockInstance::primary()
                .with_major_version(version)
                .with_admin(admin),
        )
    }

    #[tokio::test]
    async fn fresh_server_on_recent_version() {
        let harness = harness(16, MockAdminDatabase::new());
        let ctx = harness.context();

        let report = PrivilegeProvisioner::new(&ctx).run().await.unwrap();

        assert_eq!(
            report.statements,
            vec![
                "CREATE USER \"streaming_replica\" REPLICATION".to_string(),
                "GRANT EXECUTE ON FUNCTION pg_catalog.pg_ls_dir(text, boolean, boolean) TO \"streaming_replica\"".to_string(),
                "GRANT EXECUTE ON FUNCTION pg_catalog.pg_stat_file(text, boolean) TO \"streaming_replica\"".to_string(),
                "GRANT EXECUTE ON FUNCTION pg_catalog.pg_read_binary_file(text) TO \"streaming_replica\"".to_string(),
                "GRANT EXECUTE ON FUNCTION pg_catalog.pg_read_binary_file(text, bigint, bigint, boolean) TO \"streaming_replica\"".to_string(),
            ]
        );
        assert_eq!(harness.admin().rewind_checks(), 1);
    }

    #[tokio::test]
    async fn old_version_gets_superuser() {
        let harness = harness(10, MockAdminDatabase::new());
        let ctx = harness.context();

        let report = PrivilegeProvisioner::new(&ctx).run().await.unwrap();

        assert_eq!(
            report.statements,
            vec![
                "CREATE USER \"streaming_replica\" REPLICATION".to_string(),
                "ALTER USER \"streaming_replica\" SUPERUSER".to_string(),
            ]
        );
        assert_eq!(harness.admin().rewind_checks(), 0);
    }

    #[tokio::test]
    async fn missing_login_is_repaired() {
        let admin = MockAdminDatabase::new()
            .with_role(RoleAttributes {
                can_login: false,
                replication: true,
                superuser: false,
            })
            .with_rewind_grants();
        let harness = harness(13, admin);
        let ctx = harness.context();

        let report = PrivilegeProvisioner::new(&ctx).run().await.unwrap();

        assert_eq!(
            report.statements,
            vec!["ALTER USER \"streaming_replica\" LOGIN REPLICATION".to_string()]
        );
    }

    #[tokio::test]
    async fn second_run_is_a_no_op() {
        for version in [9, 16] {
            let harness = harness(version, MockAdminDatabase::new());
            let ctx = harness.context();
            let provisioner = PrivilegeProvisioner::new(&ctx);

            assert!(!provisioner.run().await.unwrap().is_noop());
            let statements = harness.admin().statements().len();

            assert!(provisioner.run().await.unwrap().is_noop());
            assert_eq!(harness.admin().statements().len(), statements);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn waits_while_server_starts() {
        let harness = harness(16, MockAdminDatabase::new().with_rewind_grants().starting_for(3));
        let ctx = harness.context();

        PrivilegeProvisioner::new(&ctx).run().await.unwrap();

        assert_eq!(harness.admin().pings(), 4);
    }

    #[tokio::test]
    async fn unexpected_ping_error_is_fatal() {
        let harness = harness(16, MockAdminDatabase::new().failing_ping("password authentication failed"));
        let ctx = harness.context();

        let err = PrivilegeProvisioner::new(&ctx).run().await.unwrap_err();

        assert!(err.is_fatal());
        assert!(harness.admin().statements().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_probe_budget_is_fatal() {
        let harness = harness(16, MockAdminDatabase::new().starting_for(10))
            .with_config(|c| c.timing.startup_probe_attempts = 3);
        let ctx = harness.context();

        let err = PrivilegeProvisioner::new(&ctx).run().await.unwrap_err();

        assert!(err.is_fatal());
        assert_eq!(harness.admin().pings(), 3);
    }

    #[tokio::test]
    async fn role_names_are_quoted() {
        let harness = harness(16, MockAdminDatabase::new().with_rewind_grants())
            .with_config(|c| c.replication_user = "weird\"role".to_string());
        let ctx = harness.context();

        let report = PrivilegeProvisioner::new(&ctx).run().await.unwrap();

        assert_eq!(
            report.statements,
            vec!["CREATE USER \"weird\"\"role\" REPLICATION".to_string()]
        );
    }
}
