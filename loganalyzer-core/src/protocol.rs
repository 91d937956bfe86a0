//! Wire types for the coordinator HTTP protocol
//!
//! Worker-facing requests (register, health, work, complete, failed) and
//! operator-facing views (status, workers, failed chunks).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::coordinator::aggregator::MetricsPartial;
use crate::coordinator::planner::{Chunk, ChunkId};
use crate::coordinator::registry::{WorkerRecord, WorkerStatus};

/// `POST /register`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub worker_id: String,
    /// Address the worker serves its own status on
    pub url: String,
}

/// `POST /health`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    pub worker_id: String,
    pub healthy: bool,
}

/// Query string of `GET /work`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkQuery {
    pub worker_id: String,
}

/// Body of a `200` answer to `GET /work`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkAssignment {
    pub chunk_id: ChunkId,
    pub filepath: String,
    pub offset: u64,
    pub size: u64,
}

/// `POST /complete`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompleteRequest {
    pub chunk_id: ChunkId,
    pub worker_id: String,
    pub metrics: MetricsPartial,
}

/// `POST /failed`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedRequest {
    pub chunk_id: ChunkId,
    pub worker_id: String,
    pub reason: String,
}

/// Generic acknowledgement body
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ack {
    pub acknowledged: bool,
}

impl Ack {
    pub fn ok() -> Self {
        Self { acknowledged: true }
    }
}

/// Error body returned with every non-2xx status
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}

/// `GET /status`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusResponse {
    pub total_chunks: u64,
    pub completed_chunks: u64,
    pub failed_chunks: u64,
    pub pending_chunks: u64,
    pub assigned_chunks: u64,
    pub avg_response_time: f64,
    pub error_rate: f64,
    pub total_requests: u64,
    pub healthy_workers: u64,
    /// Every chunk is Completed or Failed
    pub finished: bool,
    pub timestamp: DateTime<Utc>,
}

/// One entry of `GET /workers`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerView {
    pub worker_id: String,
    pub url: String,
    pub status: WorkerStatus,
    pub seconds_since_heartbeat: f64,
    pub assigned_chunks: Vec<ChunkId>,
}

impl WorkerView {
    pub fn from_record(record: &WorkerRecord, now: tokio::time::Instant) -> Self {
        Self {
            worker_id: record.worker_id.clone(),
            url: record.url.clone(),
            status: record.status,
            seconds_since_heartbeat: record.staleness(now).as_secs_f64(),
            assigned_chunks: record.assigned_chunks.iter().copied().collect(),
        }
    }
}

/// One entry of `GET /chunks/failed`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedChunkView {
    pub chunk_id: ChunkId,
    pub filepath: String,
    pub offset: u64,
    pub size: u64,
    pub retries: u32,
    pub last_error: Option<String>,
}

impl From<Chunk> for FailedChunkView {
    fn from(chunk: Chunk) -> Self {
        Self {
            chunk_id: chunk.id,
            filepath: chunk.filepath,
            offset: chunk.offset,
            size: chunk.length,
            retries: chunk.retries,
            last_error: chunk.last_error,
        }
    }
}

/// Worker-side `GET /status`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerStatusResponse {
    pub worker_id: String,
    pub phase: String,
    pub current_chunk: Option<ChunkId>,
    pub chunks_processed: u64,
    pub chunks_failed: u64,
}
