//! Error types for the instance reconciler.

use pgkeeper_engine::EngineError;
use thiserror::Error;

/// Errors that can occur while reconciling the local instance.
#[derive(Debug, Error)]
pub enum InstanceError {
    /// Kubernetes API error.
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    /// The event payload could not be decoded into the expected resource.
    #[error("decoding {kind} data from watch: {source}")]
    Decode {
        /// Resource kind being decoded.
        kind: &'static str,
        /// Underlying serde error.
        #[source]
        source: serde_json::Error,
    },

    /// A field the reconciler depends on is absent.
    #[error("{kind} is missing required field {field}")]
    MissingField {
        /// Resource kind.
        kind: &'static str,
        /// Dotted path of the missing field.
        field: &'static str,
    },

    /// A secret entry is not valid base64.
    #[error("while reading {field} from secret {secret}: {source}")]
    Base64 {
        /// Human readable name of the entry ("certificate", "private key", ...).
        field: &'static str,
        /// Secret name.
        secret: String,
        /// Underlying decode error.
        #[source]
        source: base64::DecodeError,
    },

    /// A configuration entry cannot be rendered safely.
    #[error("invalid configuration entry {key}: {reason}")]
    InvalidConfiguration {
        /// Offending key.
        key: String,
        /// Why it was rejected.
        reason: String,
    },

    /// Writing a file failed.
    #[error("while writing {what} to {path}: {source}")]
    Io {
        /// What was being written.
        what: &'static str,
        /// Destination path.
        path: String,
        /// Underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// The status record changed since it was read.
    #[error("conflict updating cluster status: resource version {resource_version} is stale")]
    Conflict {
        /// Version token that was presented.
        resource_version: String,
    },

    /// An operation on the local engine failed.
    #[error("while {operation}: {source}")]
    Engine {
        /// What the reconciler was doing.
        operation: &'static str,
        /// Underlying engine error.
        #[source]
        source: EngineError,
    },

    /// A bounded retry loop ran out of attempts.
    #[error("{operation} failed after {attempts} attempts: {source}")]
    RetriesExhausted {
        /// Operation that was retried.
        operation: &'static str,
        /// Attempts made.
        attempts: u32,
        /// Last error observed.
        #[source]
        source: Box<InstanceError>,
    },

    /// A polling wait hit its attempt or time limit.
    #[error("gave up waiting for {condition} after {attempts} attempts")]
    WaitExhausted {
        /// Condition being waited for.
        condition: &'static str,
        /// Polls made.
        attempts: u32,
    },

    /// A polling wait was cancelled by the supervisor.
    #[error("cancelled while waiting for {condition}")]
    Cancelled {
        /// Condition being waited for.
        condition: &'static str,
    },

    /// The process cannot continue; the supervisor should exit.
    #[error("fatal: {reason}: {source}")]
    Fatal {
        /// What made the error unrecoverable.
        reason: &'static str,
        /// Underlying error.
        #[source]
        source: Box<InstanceError>,
    },

    /// Configuration error.
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Result type for reconciler operations.
pub type InstanceResult<T> = Result<T, InstanceError>;

impl InstanceError {
    /// Wrap an engine error with what the reconciler was doing.
    pub fn engine(operation: &'static str, source: EngineError) -> Self {
        InstanceError::Engine { operation, source }
    }

    /// Mark an error as unrecoverable for the process.
    pub fn fatal(reason: &'static str, source: InstanceError) -> Self {
        InstanceError::Fatal {
            reason,
            source: Box::new(source),
        }
    }

    /// Whether the error is an optimistic-concurrency conflict.
    pub fn is_conflict(&self) -> bool {
        match self {
            InstanceError::Conflict { .. } => true,
            InstanceError::Kube(kube::Error::Api(response)) => response.code == 409,
            _ => false,
        }
    }

    /// Whether the supervisor should terminate the process.
    pub fn is_fatal(&self) -> bool {
        matches!(self, InstanceError::Fatal { .. })
    }
}

impl From<serde_json::Error> for InstanceError {
    fn from(err: serde_json::Error) -> Self {
        InstanceError::Serialization(err.to_string())
    }
}
