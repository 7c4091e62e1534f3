// ABOUTME: Typed error taxonomy for the sync engine
// ABOUTME: Separates transient I/O failures (retryable) from fatal config, query, and load errors

use std::fmt;

/// Which side of the pipeline produced an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endpoint {
    Source,
    Destination,
    StateStore,
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Source => f.write_str("source"),
            Endpoint::Destination => f.write_str("destination"),
            Endpoint::StateStore => f.write_str("state store"),
        }
    }
}

/// Errors produced below the orchestrator boundary.
///
/// The orchestrator converts any of these into a failure entry on the
/// mapping's report; they never abort a multi-mapping run.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// Connection reset, timeout, lock wait and similar. Retried by [`crate::retry::RetryPolicy`].
    #[error("transient {endpoint} error: {message}")]
    Transient { endpoint: Endpoint, message: String },

    /// Retries were exhausted; `last` is the final underlying error.
    #[error("{endpoint} unavailable after {attempts} attempts: {last}")]
    Unavailable {
        endpoint: Endpoint,
        attempts: u32,
        #[source]
        last: Box<SyncError>,
    },

    /// Non-transient source failure (bad query, access denied, unknown table).
    #[error("source query failed: {0}")]
    Source(String),

    /// Invalid configuration. Fatal immediately, never retried.
    #[error("configuration error: {0}")]
    Config(String),

    /// Destination job, DDL, or merge failure.
    #[error("destination error: {0}")]
    Destination(String),

    #[error("state store error: {0}")]
    State(String),

    /// The watermark document changed between read and conditional write.
    #[error("watermark document was modified concurrently")]
    StateConflict,

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl SyncError {
    pub fn transient(endpoint: Endpoint, message: impl Into<String>) -> Self {
        SyncError::Transient {
            endpoint,
            message: message.into(),
        }
    }

    /// Whether a retry of the same call may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, SyncError::Transient { .. })
    }

    /// True when the source could not be reached after exhausting retries.
    pub fn is_source_unavailable(&self) -> bool {
        matches!(
            self,
            SyncError::Unavailable {
                endpoint: Endpoint::Source,
                ..
            }
        )
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;
