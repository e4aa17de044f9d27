//! Tracing subscriber setup with format selection.

use anyhow::{Context, Result};
use tracing_subscriber::{
    EnvFilter,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

use super::config::{LogFormat, TracingConfig};

/// Keeps logging alive; flushes stdout when dropped.
pub struct TracingGuard {
    _private: (),
}

impl Drop for TracingGuard {
    fn drop(&mut self) {
        let _ = std::io::Write::flush(&mut std::io::stdout());
    }
}

/// Install the global subscriber described by `config`.
///
/// An invalid filter falls back to `info` rather than failing startup.
pub fn init_tracing(config: TracingConfig) -> Result<TracingGuard> {
    let filter = EnvFilter::try_new(config.log_filter()).unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);

    match config.log_format() {
        LogFormat::Json => registry
            .with(
                fmt::layer()
                    .json()
                    .with_file(config.include_location())
                    .with_line_number(config.include_location())
                    .with_target(config.include_target())
                    .with_current_span(true)
                    .with_span_events(FmtSpan::CLOSE)
                    .flatten_event(true),
            )
            .try_init(),
        LogFormat::Pretty => registry
            .with(
                fmt::layer()
                    .pretty()
                    .with_file(config.include_location())
                    .with_line_number(config.include_location())
                    .with_target(config.include_target()),
            )
            .try_init(),
        LogFormat::Compact => registry
            .with(
                fmt::layer()
                    .compact()
                    .with_file(config.include_location())
                    .with_line_number(config.include_location())
                    .with_target(config.include_target()),
            )
            .try_init(),
    }
    .context("Failed to initialize tracing subscriber")?;

    Ok(TracingGuard { _private: () })
}
