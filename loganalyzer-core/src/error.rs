//! Error types for the log analyzer
//!
//! Taxonomy covering chunk planning, coordination, protocol/transport,
//! chunk processing and runtime errors.

use thiserror::Error;

/// Primary error type for all analyzer operations
#[derive(Debug, Error)]
pub enum AnalyzerError {
    // ========== Planning Errors ==========

    /// Bad planning or request parameters
    #[error("Invalid input: {reason}")]
    InvalidInput { reason: String },

    /// Configuration could not be loaded or is inconsistent
    #[error("Invalid configuration for {key}: {reason}")]
    Config { key: String, reason: String },

    // ========== Coordination Errors ==========

    /// Worker never registered, or was declared dead and must re-register
    #[error("Worker {worker_id} is not registered")]
    UnknownWorker { worker_id: String },

    /// Report for an assignment that no longer belongs to the reporting worker
    #[error("Stale assignment: chunk {chunk_id} is not assigned to worker {worker_id}")]
    StaleAssignment { chunk_id: u64, worker_id: String },

    /// Chunk metrics were already merged into the aggregate
    #[error("Chunk {chunk_id} was already aggregated")]
    DuplicateChunk { chunk_id: u64 },

    /// Chunk id outside the planned range
    #[error("Chunk {chunk_id} not found")]
    ChunkNotFound { chunk_id: u64 },

    // ========== Protocol Errors ==========

    /// Coordinator could not be reached
    #[error("Connection to {endpoint} failed: {reason}")]
    ConnectionFailed { endpoint: String, reason: String },

    /// Coordinator answered with a status the protocol does not define
    #[error("Unexpected response from {endpoint}: status {status}")]
    UnexpectedResponse { endpoint: String, status: u16 },

    /// Invalid message format
    #[error("Invalid message: {reason}")]
    InvalidMessage { reason: String },

    // ========== Processing Errors ==========

    /// Chunk processor could not produce metrics
    #[error("Failed to process {filepath} at offset {offset}: {reason}")]
    Processing {
        filepath: String,
        offset: u64,
        reason: String,
    },

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // ========== Runtime Errors ==========

    /// Shutdown in progress
    #[error("Shutdown in progress")]
    ShutdownInProgress,

    /// Internal error
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl AnalyzerError {
    /// Returns true if the operation may succeed when retried
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AnalyzerError::ConnectionFailed { .. } | AnalyzerError::UnexpectedResponse { .. }
        )
    }

    /// Returns true for races the protocol expects and tolerates
    pub fn is_expected(&self) -> bool {
        matches!(
            self,
            AnalyzerError::StaleAssignment { .. } | AnalyzerError::DuplicateChunk { .. }
        )
    }
}

/// Result type alias for analyzer operations
pub type Result<T> = std::result::Result<T, AnalyzerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        let stale = AnalyzerError::StaleAssignment {
            chunk_id: 3,
            worker_id: "w1".into(),
        };
        assert!(stale.is_expected());
        assert!(!stale.is_retryable());

        let conn = AnalyzerError::ConnectionFailed {
            endpoint: "http://localhost:8080".into(),
            reason: "refused".into(),
        };
        assert!(conn.is_retryable());
        assert!(!conn.is_expected());
    }
}
