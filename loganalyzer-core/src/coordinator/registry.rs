//! Worker registry
//!
//! Tracks worker registration, heartbeats, liveness status and the set of
//! chunks each worker currently holds.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use tokio::sync::RwLock;
use tokio::time::{Duration, Instant};
use tracing::{debug, info, warn};

use super::planner::ChunkId;
use crate::error::{AnalyzerError, Result};

/// Worker liveness status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    /// Known to the registry, liveness not yet confirmed
    Registered,
    /// Heartbeating on time
    Healthy,
    /// Missed heartbeats or reported itself unhealthy
    Suspected,
    /// Declared failed; must re-register to receive work
    Dead,
}

/// Information about a registered worker
#[derive(Debug, Clone)]
pub struct WorkerRecord {
    /// Unique worker identifier
    pub worker_id: String,
    /// Address advertised by the worker
    pub url: String,
    /// Current status
    pub status: WorkerStatus,
    /// Registration order, used for deterministic tie-breaks
    pub registration_seq: u64,
    /// Last heartbeat time
    pub last_heartbeat: Instant,
    /// Chunks currently assigned to this worker
    pub assigned_chunks: BTreeSet<ChunkId>,
}

impl WorkerRecord {
    /// Number of chunks in flight on this worker
    pub fn load(&self) -> usize {
        self.assigned_chunks.len()
    }

    /// Time since the last heartbeat
    pub fn staleness(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_heartbeat)
    }
}

/// Workers that were declared dead during a health check
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadWorker {
    pub worker_id: String,
    /// Chunks the worker held when it died
    pub orphaned_chunks: Vec<ChunkId>,
}

struct RegistryInner {
    workers: HashMap<String, WorkerRecord>,
    next_seq: u64,
}

/// Registry of workers and their liveness
pub struct WorkerRegistry {
    inner: RwLock<RegistryInner>,
}

impl WorkerRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(RegistryInner {
                workers: HashMap::new(),
                next_seq: 0,
            }),
        }
    }

    /// Register a worker, or refresh an existing registration.
    ///
    /// Re-registering keeps the original registration order and updates the
    /// address. A dead worker comes back as healthy with no assignments.
    pub async fn register(&self, worker_id: &str, url: &str) -> Result<()> {
        if worker_id.is_empty() {
            return Err(AnalyzerError::InvalidInput {
                reason: "worker_id must not be empty".into(),
            });
        }

        let mut inner = self.inner.write().await;
        let now = Instant::now();

        if let Some(worker) = inner.workers.get_mut(worker_id) {
            if worker.status == WorkerStatus::Dead {
                info!("Dead worker {} re-registered at {}", worker_id, url);
            } else {
                debug!("Worker {} refreshed registration at {}", worker_id, url);
            }
            worker.url = url.to_string();
            worker.status = WorkerStatus::Healthy;
            worker.last_heartbeat = now;
            return Ok(());
        }

        let registration_seq = inner.next_seq;
        inner.next_seq += 1;
        inner.workers.insert(
            worker_id.to_string(),
            WorkerRecord {
                worker_id: worker_id.to_string(),
                url: url.to_string(),
                status: WorkerStatus::Healthy,
                registration_seq,
                last_heartbeat: now,
                assigned_chunks: BTreeSet::new(),
            },
        );

        info!("Registered worker {} at {}", worker_id, url);
        Ok(())
    }

    /// Process a heartbeat from a worker
    pub async fn heartbeat(&self, worker_id: &str) -> Result<()> {
        let mut inner = self.inner.write().await;
        let worker = live_worker_mut(&mut inner.workers, worker_id)?;

        worker.last_heartbeat = Instant::now();

        if matches!(worker.status, WorkerStatus::Suspected | WorkerStatus::Registered) {
            worker.status = WorkerStatus::Healthy;
            info!("Worker {} recovered to healthy", worker_id);
        }

        debug!("Heartbeat from worker {}", worker_id);
        Ok(())
    }

    /// Voluntary unhealthy report: suspect the worker right away.
    ///
    /// The heartbeat clock is not refreshed, so a worker that stays
    /// unhealthy is declared dead once the dead threshold passes.
    pub async fn report_unhealthy(&self, worker_id: &str) -> Result<()> {
        let mut inner = self.inner.write().await;
        let worker = live_worker_mut(&mut inner.workers, worker_id)?;

        if worker.status != WorkerStatus::Suspected {
            warn!("Worker {} reported itself unhealthy, marked as suspect", worker_id);
            worker.status = WorkerStatus::Suspected;
        }
        Ok(())
    }

    /// Healthy workers in registration order
    pub async fn list_healthy(&self) -> Vec<WorkerRecord> {
        let inner = self.inner.read().await;
        let mut healthy: Vec<WorkerRecord> = inner
            .workers
            .values()
            .filter(|w| w.status == WorkerStatus::Healthy)
            .cloned()
            .collect();
        healthy.sort_by_key(|w| w.registration_seq);
        healthy
    }

    /// Every known worker in registration order
    pub async fn workers(&self) -> Vec<WorkerRecord> {
        let inner = self.inner.read().await;
        let mut all: Vec<WorkerRecord> = inner.workers.values().cloned().collect();
        all.sort_by_key(|w| w.registration_seq);
        all
    }

    /// Get worker info
    pub async fn get_worker(&self, worker_id: &str) -> Option<WorkerRecord> {
        self.inner.read().await.workers.get(worker_id).cloned()
    }

    /// Get healthy worker count
    pub async fn healthy_count(&self) -> usize {
        self.inner
            .read()
            .await
            .workers
            .values()
            .filter(|w| w.status == WorkerStatus::Healthy)
            .count()
    }

    /// Fails with `UnknownWorker` unless the worker is registered and not dead
    pub async fn ensure_live(&self, worker_id: &str) -> Result<()> {
        let inner = self.inner.read().await;
        match inner.workers.get(worker_id) {
            Some(w) if w.status != WorkerStatus::Dead => Ok(()),
            _ => Err(AnalyzerError::UnknownWorker {
                worker_id: worker_id.to_string(),
            }),
        }
    }

    /// Declare a worker dead and hand back the chunks it was holding
    pub async fn mark_dead(&self, worker_id: &str) -> Result<Vec<ChunkId>> {
        let mut inner = self.inner.write().await;
        let worker = inner.workers.get_mut(worker_id).ok_or_else(|| {
            AnalyzerError::UnknownWorker {
                worker_id: worker_id.to_string(),
            }
        })?;
        Ok(kill(worker))
    }

    /// Sweep liveness: suspect stale healthy workers, kill stale suspects.
    pub async fn check_health(&self, suspect_after: Duration, dead_after: Duration) -> Vec<DeadWorker> {
        let now = Instant::now();
        let mut dead = Vec::new();

        let mut inner = self.inner.write().await;
        for worker in inner.workers.values_mut() {
            let elapsed = worker.staleness(now);

            match worker.status {
                WorkerStatus::Healthy | WorkerStatus::Registered if elapsed > suspect_after => {
                    warn!(
                        "Worker {} marked as suspect ({:.1}s since last heartbeat)",
                        worker.worker_id,
                        elapsed.as_secs_f64()
                    );
                    worker.status = WorkerStatus::Suspected;
                }
                WorkerStatus::Suspected if elapsed > dead_after => {
                    let orphaned_chunks = kill(worker);
                    dead.push(DeadWorker {
                        worker_id: worker.worker_id.clone(),
                        orphaned_chunks,
                    });
                }
                _ => {}
            }
        }

        dead
    }

    /// Bind a chunk to the least-loaded healthy worker.
    ///
    /// Ties go to the earliest registration. With `requester` set, only that
    /// worker is a candidate. Returns the chosen worker id.
    pub async fn assign_least_loaded(&self, chunk_id: ChunkId, requester: Option<&str>) -> Option<String> {
        let mut inner = self.inner.write().await;

        let worker = inner
            .workers
            .values_mut()
            .filter(|w| w.status == WorkerStatus::Healthy)
            .filter(|w| requester.map_or(true, |id| w.worker_id == id))
            .min_by_key(|w| (w.load(), w.registration_seq))?;

        worker.assigned_chunks.insert(chunk_id);
        Some(worker.worker_id.clone())
    }

    /// Drop a chunk from a worker's assignment set
    pub async fn release(&self, worker_id: &str, chunk_id: ChunkId) {
        if let Some(worker) = self.inner.write().await.workers.get_mut(worker_id) {
            worker.assigned_chunks.remove(&chunk_id);
        }
    }
}

impl Default for WorkerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn live_worker_mut<'a>(
    workers: &'a mut HashMap<String, WorkerRecord>,
    worker_id: &str,
) -> Result<&'a mut WorkerRecord> {
    match workers.get_mut(worker_id) {
        Some(worker) if worker.status != WorkerStatus::Dead => Ok(worker),
        _ => Err(AnalyzerError::UnknownWorker {
            worker_id: worker_id.to_string(),
        }),
    }
}

fn kill(worker: &mut WorkerRecord) -> Vec<ChunkId> {
    if worker.status != WorkerStatus::Dead {
        warn!("Worker {} marked as dead", worker.worker_id);
    }
    worker.status = WorkerStatus::Dead;
    std::mem::take(&mut worker.assigned_chunks).into_iter().collect()
}
