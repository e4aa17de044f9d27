//! Structured logging for the instance manager.
//!
//! Logging format is controlled via `PGKEEPER_LOG_FORMAT`:
//! - `json` - one JSON object per line (default when stdout is not a TTY)
//! - `pretty` - multi-line, human-readable (default on a TTY)
//! - `compact` - single-line, human-readable
//!
//! Every dispatched event runs inside a `dispatch` span carrying the
//! resource kind, change type and name, so JSON output can be grouped
//! per event.
//!
//! # Example
//!
//! ```ignore
//! use pgkeeper_instance::observability::{TracingConfig, init_tracing};
//!
//! let _guard = init_tracing(TracingConfig::from_env())?;
//! ```

mod config;
mod tracing_setup;

pub use config::{LogFormat, TracingConfig, TracingConfigBuilder};
pub use tracing_setup::{TracingGuard, init_tracing};
