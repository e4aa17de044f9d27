//! Error types for local engine operations.

use std::path::PathBuf;
use thiserror::Error;

/// SQLSTATE raised while the server is starting up, shutting down or in
/// crash recovery (`cannot_connect_now`).
const CANNOT_CONNECT_NOW: &str = "57P03";

/// Errors that can occur while talking to the local PostgreSQL instance.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Database protocol error.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// The server cannot be reached yet.
    #[error("server unavailable: {0}")]
    Unavailable(String),

    /// A `pg_ctl` invocation could not be started.
    #[error("failed to run {program} {operation}: {source}")]
    Spawn {
        /// Program that was executed.
        program: String,
        /// Operation passed to the program.
        operation: &'static str,
        /// Underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// A `pg_ctl` invocation exited unsuccessfully.
    #[error("{operation} exited with {status}: {stderr}")]
    Command {
        /// Operation passed to the program.
        operation: &'static str,
        /// Exit status description.
        status: String,
        /// Captured standard error.
        stderr: String,
    },

    /// The data directory version marker could not be read or parsed.
    #[error("invalid PG_VERSION in {path}: {reason}")]
    Version {
        /// Path of the version file.
        path: PathBuf,
        /// What went wrong.
        reason: String,
    },

    /// A query returned something other than what was expected.
    #[error("unexpected query result: {0}")]
    Query(String),
}

/// Result type for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

impl EngineError {
    /// Whether the error means the server is not accepting connections yet.
    ///
    /// Only these errors are retried while waiting for a freshly started
    /// instance; everything else is reported immediately.
    pub fn is_transient(&self) -> bool {
        match self {
            EngineError::Unavailable(_) => true,
            EngineError::Database(sqlx::Error::Io(_)) => true,
            EngineError::Database(sqlx::Error::PoolTimedOut) => true,
            EngineError::Database(sqlx::Error::Database(db)) => {
                db.code().as_deref() == Some(CANNOT_CONNECT_NOW)
            }
            _ => false,
        }
    }
}
