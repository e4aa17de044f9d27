//! Logging configuration.

use std::str::FromStr;

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// One JSON object per line, for log collectors.
    Json,
    /// Multi-line human-readable output.
    Pretty,
    /// Single-line human-readable output.
    #[default]
    Compact,
}

impl FromStr for LogFormat {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.to_lowercase().as_str() {
            "json" => Self::Json,
            "pretty" => Self::Pretty,
            _ => Self::Compact,
        })
    }
}

/// Configuration for the tracing subscriber.
#[derive(Debug, Clone)]
pub struct TracingConfig {
    log_format: LogFormat,
    log_filter: String,
    include_location: bool,
    include_target: bool,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            log_format: LogFormat::default(),
            log_filter: "info".to_string(),
            include_location: false,
            include_target: true,
        }
    }
}

impl TracingConfig {
    /// Create a new builder.
    pub fn builder() -> TracingConfigBuilder {
        TracingConfigBuilder::default()
    }

    /// Create configuration from environment variables.
    ///
    /// - `PGKEEPER_LOG_FORMAT`: "json", "pretty", or "compact"; JSON when
    ///   stdout is not a terminal
    /// - `PGKEEPER_LOG_LEVEL` or `RUST_LOG`: filter directives
    /// - `PGKEEPER_LOG_LOCATION`: "true" to include file and line
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok(), stdout_is_terminal())
    }

    /// Create configuration through an arbitrary variable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>, terminal: bool) -> Self {
        let log_format = lookup("PGKEEPER_LOG_FORMAT")
            .and_then(|s| s.parse::<LogFormat>().ok())
            .unwrap_or(if terminal {
                LogFormat::Pretty
            } else {
                LogFormat::Json
            });

        let log_filter = lookup("PGKEEPER_LOG_LEVEL")
            .or_else(|| lookup("RUST_LOG"))
            .unwrap_or_else(|| "info".to_string());

        Self {
            log_format,
            log_filter,
            include_location: lookup("PGKEEPER_LOG_LOCATION")
                .map(|s| s == "true" || s == "1")
                .unwrap_or(false),
            include_target: true,
        }
    }

    /// Get the log format.
    pub fn log_format(&self) -> LogFormat {
        self.log_format
    }

    /// Get the log filter.
    pub fn log_filter(&self) -> &str {
        &self.log_filter
    }

    /// Check if source location should be included.
    pub fn include_location(&self) -> bool {
        self.include_location
    }

    /// Check if target should be included.
    pub fn include_target(&self) -> bool {
        self.include_target
    }
}

/// Builder for TracingConfig.
#[derive(Debug, Clone, Default)]
pub struct TracingConfigBuilder {
    log_format: Option<LogFormat>,
    log_filter: Option<String>,
    include_location: Option<bool>,
    include_target: Option<bool>,
}

impl TracingConfigBuilder {
    /// Set the log format.
    pub fn log_format(mut self, format: LogFormat) -> Self {
        self.log_format = Some(format);
        self
    }

    /// Set the log filter.
    pub fn log_filter(mut self, filter: impl Into<String>) -> Self {
        self.log_filter = Some(filter.into());
        self
    }

    /// Include source location in logs.
    pub fn include_location(mut self, include: bool) -> Self {
        self.include_location = Some(include);
        self
    }

    /// Include target in logs.
    pub fn include_target(mut self, include: bool) -> Self {
        self.include_target = Some(include);
        self
    }

    /// Build the configuration.
    pub fn build(self) -> TracingConfig {
        let defaults = TracingConfig::default();
        TracingConfig {
            log_format: self.log_format.unwrap_or(defaults.log_format),
            log_filter: self.log_filter.unwrap_or(defaults.log_filter),
            include_location: self.include_location.unwrap_or(defaults.include_location),
            include_target: self.include_target.unwrap_or(defaults.include_target),
        }
    }
}

fn stdout_is_terminal() -> bool {
    std::io::IsTerminal::is_terminal(&std::io::stdout())
}
