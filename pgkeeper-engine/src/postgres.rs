//! PostgreSQL-backed implementation of [`LocalInstance`].
//!
//! Status queries go over the local Unix socket with `sqlx`; lifecycle
//! operations (promote, stop, reload) shell out to `pg_ctl`.

use crate::admin::{AdminDatabase, REWIND_PRIVILEGES_QUERY, RoleAttributes};
use crate::error::{EngineError, EngineResult};
use crate::instance::{InstanceStatus, LocalInstance};
use crate::version;
use async_trait::async_trait;
use once_cell::sync::OnceCell;
use sqlx::postgres::{PgConnectOptions, PgConnection};
use sqlx::{ConnectOptions, Connection};
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tokio::sync::Mutex;

/// Connection and binary locations for the local instance.
#[derive(Debug, Clone)]
pub struct PostgresSettings {
    /// Data directory.
    pub pgdata: PathBuf,
    /// Directory holding the server's Unix socket.
    pub socket_dir: PathBuf,
    /// Server port (selects the socket file name).
    pub port: u16,
    /// Superuser to connect as.
    pub superuser: String,
    /// Database to connect to.
    pub database: String,
    /// Path to the `pg_ctl` binary.
    pub pg_ctl: PathBuf,
}

impl Default for PostgresSettings {
    fn default() -> Self {
        Self {
            pgdata: PathBuf::from("/var/lib/postgresql/data/pgdata"),
            socket_dir: PathBuf::from("/controller/run"),
            port: 5432,
            superuser: "postgres".to_string(),
            database: "postgres".to_string(),
            pg_ctl: PathBuf::from("pg_ctl"),
        }
    }
}

impl PostgresSettings {
    fn connect_options(&self) -> PgConnectOptions {
        PgConnectOptions::new()
            .socket(&self.socket_dir)
            .port(self.port)
            .username(&self.superuser)
            .database(&self.database)
            .application_name("pgkeeper-instance-manager")
            .disable_statement_logging()
    }
}

/// A single lazily established connection.
///
/// The connection is dropped after an IO failure so the next call
/// reconnects; this is what lets `ping` be retried while the server starts.
pub struct PostgresAdmin {
    options: PgConnectOptions,
    conn: Mutex<Option<PgConnection>>,
}

impl PostgresAdmin {
    /// Create a handle; no connection is made until first use.
    pub fn new(settings: &PostgresSettings) -> Self {
        Self {
            options: settings.connect_options(),
            conn: Mutex::new(None),
        }
    }

    async fn connected<'a>(
        &self,
        guard: &'a mut Option<PgConnection>,
    ) -> EngineResult<&'a mut PgConnection> {
        if guard.is_none() {
            *guard = Some(self.options.connect().await?);
        }
        guard
            .as_mut()
            .ok_or_else(|| EngineError::Unavailable("connection not established".to_string()))
    }

    async fn fetch_bool(&self, sql: &str) -> EngineResult<bool> {
        let mut guard = self.conn.lock().await;
        let conn = self.connected(&mut guard).await?;
        let result = sqlx::query_scalar::<_, bool>(sql).fetch_one(&mut *conn).await;
        Self::settle(&mut guard, result)
    }

    async fn fetch_i64(&self, sql: &str) -> EngineResult<i64> {
        let mut guard = self.conn.lock().await;
        let conn = self.connected(&mut guard).await?;
        let result = sqlx::query_scalar::<_, i64>(sql).fetch_one(&mut *conn).await;
        Self::settle(&mut guard, result)
    }

    /// Forget a broken connection before handing the error back.
    fn settle<T>(guard: &mut Option<PgConnection>, result: Result<T, sqlx::Error>) -> EngineResult<T> {
        if let Err(sqlx::Error::Io(_)) = &result {
            *guard = None;
        }
        result.map_err(EngineError::from)
    }
}

#[async_trait]
impl AdminDatabase for PostgresAdmin {
    async fn ping(&self) -> EngineResult<()> {
        let mut guard = self.conn.lock().await;
        let conn = self.connected(&mut guard).await?;
        let result = conn.ping().await;
        Self::settle(&mut guard, result)
    }

    async fn role_attributes(&self, role: &str) -> EngineResult<Option<RoleAttributes>> {
        let mut guard = self.conn.lock().await;
        let conn = self.connected(&mut guard).await?;
        let result = sqlx::query_as::<_, (bool, bool, bool)>(
            "SELECT rolcanlogin, rolreplication, rolsuper FROM pg_roles WHERE rolname = $1",
        )
        .bind(role)
        .fetch_optional(&mut *conn)
        .await;

        Self::settle(&mut guard, result).map(|row| {
            row.map(|(can_login, replication, superuser)| RoleAttributes {
                can_login,
                replication,
                superuser,
            })
        })
    }

    async fn has_rewind_privileges(&self, role: &str) -> EngineResult<bool> {
        let mut guard = self.conn.lock().await;
        let conn = self.connected(&mut guard).await?;
        let result = sqlx::query_scalar::<_, bool>(REWIND_PRIVILEGES_QUERY)
            .bind(role)
            .fetch_one(&mut *conn)
            .await;
        Self::settle(&mut guard, result)
    }

    async fn execute(&self, statement: &str) -> EngineResult<()> {
        let mut guard = self.conn.lock().await;
        let conn = self.connected(&mut guard).await?;
        let result = sqlx::query(statement).execute(&mut *conn).await;
        Self::settle(&mut guard, result).map(|_| ())
    }
}

/// The PostgreSQL instance managed by this process.
pub struct PostgresInstance {
    settings: PostgresSettings,
    status_db: PostgresAdmin,
    /// Read from `PG_VERSION` once; a failed read is retried on the next call.
    major: OnceCell<u32>,
}

impl PostgresInstance {
    /// Create a handle for the instance described by `settings`.
    pub fn new(settings: PostgresSettings) -> Self {
        let status_db = PostgresAdmin::new(&settings);
        Self {
            settings,
            status_db,
            major: OnceCell::new(),
        }
    }

    async fn pg_ctl(&self, operation: &'static str, extra: &[&str]) -> EngineResult<()> {
        let program = self.settings.pg_ctl.display().to_string();
        tracing::debug!(program = %program, operation, "running pg_ctl");

        let output = Command::new(&self.settings.pg_ctl)
            .arg("-D")
            .arg(&self.settings.pgdata)
            .args(extra)
            .arg(operation)
            .output()
            .await
            .map_err(|source| EngineError::Spawn {
                program,
                operation,
                source,
            })?;

        if !output.status.success() {
            return Err(EngineError::Command {
                operation,
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(())
    }
}

#[async_trait]
impl LocalInstance for PostgresInstance {
    fn pgdata(&self) -> &Path {
        &self.settings.pgdata
    }

    async fn is_primary(&self) -> EngineResult<bool> {
        self.status_db.fetch_bool("SELECT NOT pg_is_in_recovery()").await
    }

    async fn is_wal_receiver_active(&self) -> EngineResult<bool> {
        self.status_db
            .fetch_bool("SELECT EXISTS (SELECT 1 FROM pg_stat_wal_receiver)")
            .await
    }

    async fn wal_apply_lag(&self) -> EngineResult<i64> {
        // The xlog -> wal function renames happened in 10
        let sql = if self.major_version().await? < 10 {
            "SELECT COALESCE(pg_xlog_location_diff(pg_last_xlog_receive_location(), \
             pg_last_xlog_replay_location()), 0)::bigint"
        } else {
            "SELECT COALESCE(pg_wal_lsn_diff(pg_last_wal_receive_lsn(), \
             pg_last_wal_replay_lsn()), 0)::bigint"
        };
        self.status_db.fetch_i64(sql).await
    }

    async fn promote_and_wait(&self) -> EngineResult<()> {
        self.pg_ctl("promote", &["-w"]).await
    }

    async fn shutdown(&self) -> EngineResult<()> {
        self.pg_ctl("stop", &["-m", "fast", "-w"]).await
    }

    async fn reload(&self) -> EngineResult<()> {
        self.pg_ctl("reload", &[]).await
    }

    async fn status(&self) -> EngineResult<InstanceStatus> {
        let pending_restart = self
            .status_db
            .fetch_bool("SELECT EXISTS (SELECT 1 FROM pg_settings WHERE pending_restart)")
            .await?;
        let is_primary = self.is_primary().await?;

        Ok(InstanceStatus {
            pending_restart,
            is_primary,
        })
    }

    async fn major_version(&self) -> EngineResult<u32> {
        self.major
            .get_or_try_init(|| version::major_version(&self.settings.pgdata))
            .copied()
    }

    async fn admin_database(&self) -> EngineResult<Box<dyn AdminDatabase>> {
        Ok(Box::new(PostgresAdmin::new(&self.settings)))
    }
}
