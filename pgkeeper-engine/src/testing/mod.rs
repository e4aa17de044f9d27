//! In-memory doubles for the engine traits.
//!
//! Each mock records every call it receives so tests can assert on
//! ordering (for example: promotion only after the WAL receiver stopped)
//! and on the exact SQL text issued during provisioning.

mod admin;
mod instance;

pub use admin::MockAdminDatabase;
pub use instance::{InstanceCall, MockInstance};
