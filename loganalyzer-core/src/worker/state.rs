//! Worker state machine
//!
//! Tracks the local phase and counters reported on the worker's own
//! `GET /status`.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::RwLock;

use crate::coordinator::planner::ChunkId;
use crate::protocol::WorkerStatusResponse;

/// Worker phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerPhase {
    /// Not yet accepted by the coordinator
    Registering,
    /// Polling for work
    Idle,
    /// Processing a chunk
    Busy,
    /// Leaving the pool
    ShuttingDown,
}

impl WorkerPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerPhase::Registering => "registering",
            WorkerPhase::Idle => "idle",
            WorkerPhase::Busy => "busy",
            WorkerPhase::ShuttingDown => "shutting_down",
        }
    }
}

/// Local worker state
pub struct WorkerState {
    worker_id: String,
    phase: RwLock<WorkerPhase>,
    current_chunk: RwLock<Option<ChunkId>>,
    chunks_processed: AtomicU64,
    chunks_failed: AtomicU64,
}

impl WorkerState {
    pub fn new(worker_id: impl Into<String>) -> Self {
        Self {
            worker_id: worker_id.into(),
            phase: RwLock::new(WorkerPhase::Registering),
            current_chunk: RwLock::new(None),
            chunks_processed: AtomicU64::new(0),
            chunks_failed: AtomicU64::new(0),
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub async fn phase(&self) -> WorkerPhase {
        *self.phase.read().await
    }

    pub async fn set_phase(&self, phase: WorkerPhase) {
        *self.phase.write().await = phase;
    }

    /// Enter `Busy` on `chunk_id`
    pub async fn begin_chunk(&self, chunk_id: ChunkId) {
        *self.current_chunk.write().await = Some(chunk_id);
        self.set_phase(WorkerPhase::Busy).await;
    }

    /// Leave `Busy`, counting the chunk as processed or failed
    pub async fn finish_chunk(&self, succeeded: bool) {
        if succeeded {
            self.chunks_processed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.chunks_failed.fetch_add(1, Ordering::Relaxed);
        }
        *self.current_chunk.write().await = None;

        let mut phase = self.phase.write().await;
        if *phase == WorkerPhase::Busy {
            *phase = WorkerPhase::Idle;
        }
    }

    pub async fn current_chunk(&self) -> Option<ChunkId> {
        *self.current_chunk.read().await
    }

    pub fn chunks_processed(&self) -> u64 {
        self.chunks_processed.load(Ordering::Relaxed)
    }

    pub fn chunks_failed(&self) -> u64 {
        self.chunks_failed.load(Ordering::Relaxed)
    }

    pub async fn snapshot(&self) -> WorkerStatusResponse {
        WorkerStatusResponse {
            worker_id: self.worker_id.clone(),
            phase: self.phase().await.as_str().to_string(),
            current_chunk: self.current_chunk().await,
            chunks_processed: self.chunks_processed(),
            chunks_failed: self.chunks_failed(),
        }
    }
}
