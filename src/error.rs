//! Error types for the shard cache and query pipeline

use thiserror::Error;

pub type Result<T> = std::result::Result<T, GraphError>;

#[derive(Error, Debug, Clone)]
pub enum GraphError {
    /// Shard substrate read or write failed and the cache could not be
    /// populated. Never reported as "no shard", which would misroute writes.
    #[error("Shard cache unavailable: {0}")]
    CacheUnavailable(String),

    /// Concurrent shard creation raced and the substrate could not converge
    /// on a single winner. Retried internally before escalating.
    #[error("Shard allocation conflict at start version {start_version}")]
    AllocationConflict { start_version: u64 },

    /// Index or substrate query failed mid-stream.
    #[error("Query failure: {0}")]
    QueryFailure(String),

    /// Query exceeded the caller-configured timeout.
    #[error("Query timed out after {elapsed_ms}ms")]
    QueryTimeout { elapsed_ms: u64 },

    /// Malformed cursor, or a cursor minted by a different pipeline stage.
    #[error("Invalid cursor: {0}")]
    InvalidCursor(String),

    /// Negative or otherwise out-of-range version supplied by the caller.
    #[error("Illegal version: {0}")]
    IllegalVersion(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<std::io::Error> for GraphError {
    fn from(e: std::io::Error) -> Self {
        GraphError::Io(e.to_string())
    }
}

impl From<serde_json::Error> for GraphError {
    fn from(e: serde_json::Error) -> Self {
        GraphError::Serialization(e.to_string())
    }
}

impl From<bincode::Error> for GraphError {
    fn from(e: bincode::Error) -> Self {
        GraphError::Serialization(e.to_string())
    }
}

impl GraphError {
    /// Get error code for wire protocol
    pub fn code(&self) -> &'static str {
        match self {
            GraphError::CacheUnavailable(_) => "CACHE_UNAVAILABLE",
            GraphError::AllocationConflict { .. } => "ALLOCATION_CONFLICT",
            GraphError::QueryFailure(_) => "QUERY_FAILURE",
            GraphError::QueryTimeout { .. } => "QUERY_TIMEOUT",
            GraphError::InvalidCursor(_) => "INVALID_CURSOR",
            GraphError::IllegalVersion(_) => "ILLEGAL_VERSION",
            _ => "INTERNAL_ERROR",
        }
    }

    /// True for errors caused by the caller's input (rejected before any
    /// query is issued), as opposed to stream-terminal runtime failures.
    pub fn is_caller_error(&self) -> bool {
        matches!(
            self,
            GraphError::InvalidCursor(_) | GraphError::IllegalVersion(_)
        )
    }
}
