//! Chunk planning
//!
//! Splits a log file into contiguous byte ranges, the unit of work handed
//! to workers.

use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::debug;

use crate::error::{AnalyzerError, Result};

/// Chunk identifier, a monotonic sequence number assigned at planning time
pub type ChunkId = u64;

/// Lifecycle of a chunk inside the dispatcher
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkStatus {
    /// Waiting for a worker
    Pending,
    /// Bound to a worker by a live assignment
    Assigned,
    /// Metrics merged into the aggregate
    Completed,
    /// Retry limit exhausted
    Failed,
}

/// A contiguous byte range of the target log file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    /// Sequence number
    pub id: ChunkId,
    /// File the range belongs to
    pub filepath: String,
    /// Byte offset within the file
    pub offset: u64,
    /// Byte length of the range
    pub length: u64,
    /// Current status
    pub status: ChunkStatus,
    /// Number of times the chunk was taken back from a worker
    pub retries: u32,
    /// Reason for the most recent requeue or failure
    pub last_error: Option<String>,
}

impl Chunk {
    /// Create a pending chunk
    pub fn new(id: ChunkId, filepath: impl Into<String>, offset: u64, length: u64) -> Self {
        Self {
            id,
            filepath: filepath.into(),
            offset,
            length,
            status: ChunkStatus::Pending,
            retries: 0,
            last_error: None,
        }
    }

    /// Exclusive end of the byte range
    pub fn end(&self) -> u64 {
        self.offset + self.length
    }

    /// Completed or Failed
    pub fn is_terminal(&self) -> bool {
        matches!(self.status, ChunkStatus::Completed | ChunkStatus::Failed)
    }
}

/// Stateless chunk planner
pub struct ChunkPlanner;

impl ChunkPlanner {
    /// Split `[0, file_len)` into chunks of `chunk_size` bytes.
    ///
    /// The last chunk holds the remainder and may be shorter.
    pub fn plan(filepath: &str, file_len: u64, chunk_size: u64) -> Result<Vec<Chunk>> {
        if file_len == 0 {
            return Err(AnalyzerError::InvalidInput {
                reason: format!("file {} is empty", filepath),
            });
        }
        if chunk_size == 0 {
            return Err(AnalyzerError::InvalidInput {
                reason: "chunk size must be greater than zero".into(),
            });
        }

        let count = file_len.div_ceil(chunk_size);
        let chunks: Vec<Chunk> = (0..count)
            .map(|id| {
                let offset = id * chunk_size;
                let length = chunk_size.min(file_len - offset);
                Chunk::new(id, filepath, offset, length)
            })
            .collect();

        debug!(
            "Planned {} chunks of {} bytes over {} ({} bytes)",
            chunks.len(),
            chunk_size,
            filepath,
            file_len
        );

        Ok(chunks)
    }

    /// Plan chunks for a file on disk, using its current length
    pub fn plan_file(path: &Path, chunk_size: u64) -> Result<Vec<Chunk>> {
        let file_len = std::fs::metadata(path)?.len();
        Self::plan(&path.to_string_lossy(), file_len, chunk_size)
    }
}
