//! Local PostgreSQL engine access for pgkeeper.
//!
//! This crate hides everything the reconciler needs from the database
//! running next to it behind two traits:
//!
//! - [`LocalInstance`]: role, WAL receiver and replay lag, promote, stop,
//!   reload, pending-restart status
//! - [`AdminDatabase`]: a superuser connection for role and privilege
//!   provisioning
//!
//! [`PostgresInstance`] implements them with `sqlx` over the local socket
//! and `pg_ctl`. The [`testing`] module provides scriptable doubles.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod admin;
pub mod error;
pub mod files;
pub mod instance;
pub mod postgres;
pub mod testing;
pub mod version;

pub use admin::{AdminDatabase, REWIND_FUNCTIONS, RoleAttributes, quote_identifier};
pub use error::{EngineError, EngineResult};
pub use files::{DiskFiles, FileWriter, MemoryFiles, OWNER_ONLY};
pub use instance::{InstanceStatus, LocalInstance};
pub use postgres::{PostgresAdmin, PostgresInstance, PostgresSettings};
