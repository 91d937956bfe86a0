//! Chunk dispatcher
//!
//! Owns every chunk and drives its state machine:
//!
//! ```text
//! Pending --assign--> Assigned --complete--> Completed
//!    ^                   |
//!    +---- requeue ------+ (timeout, worker death, reported failure)
//!                        |
//!                        +--- retry limit reached ---> Failed
//! ```
//!
//! All chunk state sits behind one lock. The registry lock is only ever
//! taken while holding it, never the other way round.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tokio::time::{Duration, Instant};
use tracing::{debug, info, warn};

use super::aggregator::{MetricsPartial, ResultAggregator};
use super::planner::{Chunk, ChunkId, ChunkStatus};
use super::registry::WorkerRegistry;
use crate::error::{AnalyzerError, Result};
use crate::metrics::standard;
use crate::protocol::WorkAssignment;

/// Requeue reason recorded when an assignment outlives the processing timeout
pub const REASON_TIMED_OUT: &str = "assignment timed out";

/// Requeue reason recorded when the owning worker is declared dead
pub const REASON_WORKER_DEAD: &str = "worker declared dead";

/// Configuration for the dispatcher
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Requeues allowed before a chunk is marked failed
    pub retry_limit: u32,
    /// Maximum age of an assignment before it is reclaimed
    pub processing_timeout: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            retry_limit: crate::DEFAULT_RETRY_LIMIT,
            processing_timeout: Duration::from_secs(60),
        }
    }
}

/// Live binding of a chunk to the worker attempting it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assignment {
    pub chunk_id: ChunkId,
    pub worker_id: String,
    pub assigned_at: Instant,
}

/// Chunk counts by status
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchProgress {
    pub total: u64,
    pub pending: u64,
    pub assigned: u64,
    pub completed: u64,
    pub failed: u64,
}

impl DispatchProgress {
    /// Every chunk is Completed or Failed
    pub fn is_finished(&self) -> bool {
        self.completed + self.failed == self.total
    }
}

struct DispatchState {
    chunks: BTreeMap<ChunkId, Chunk>,
    pending: BTreeSet<ChunkId>,
    assignments: HashMap<ChunkId, Assignment>,
    completed: u64,
    failed: u64,
}

impl DispatchState {
    fn chunk_mut(&mut self, chunk_id: ChunkId) -> Result<&mut Chunk> {
        self.chunks
            .get_mut(&chunk_id)
            .ok_or(AnalyzerError::ChunkNotFound { chunk_id })
    }

    /// Fail unless `worker_id` holds the live assignment of `chunk_id`
    fn check_owner(&self, chunk_id: ChunkId, worker_id: &str) -> Result<()> {
        if !self.chunks.contains_key(&chunk_id) {
            return Err(AnalyzerError::ChunkNotFound { chunk_id });
        }
        match self.assignments.get(&chunk_id) {
            Some(a) if a.worker_id == worker_id => Ok(()),
            _ => Err(AnalyzerError::StaleAssignment {
                chunk_id,
                worker_id: worker_id.to_string(),
            }),
        }
    }

    /// Remove the assignment if it belongs to `worker_id`
    fn take_assignment(&mut self, chunk_id: ChunkId, worker_id: &str) -> Result<Assignment> {
        self.check_owner(chunk_id, worker_id)?;
        self.assignments
            .remove(&chunk_id)
            .ok_or(AnalyzerError::Internal {
                message: format!("assignment for chunk {} vanished", chunk_id),
            })
    }

    fn progress(&self) -> DispatchProgress {
        DispatchProgress {
            total: self.chunks.len() as u64,
            pending: self.pending.len() as u64,
            assigned: self.assignments.len() as u64,
            completed: self.completed,
            failed: self.failed,
        }
    }
}

/// Assigns chunks to workers and tracks them to completion
pub struct Dispatcher {
    config: DispatcherConfig,
    state: Mutex<DispatchState>,
    registry: Arc<WorkerRegistry>,
    aggregator: Arc<ResultAggregator>,
    finished: watch::Sender<bool>,
}

impl Dispatcher {
    /// Take ownership of planned chunks; all start out pending
    pub fn new(
        chunks: Vec<Chunk>,
        config: DispatcherConfig,
        registry: Arc<WorkerRegistry>,
        aggregator: Arc<ResultAggregator>,
    ) -> Self {
        let planned = chunks.len();
        let chunks: BTreeMap<ChunkId, Chunk> = chunks.into_iter().map(|c| (c.id, c)).collect();
        if chunks.len() != planned {
            warn!(
                "Chunk plan repeats ids, keeping {} of {} chunks",
                chunks.len(),
                planned
            );
        }
        let pending = chunks.keys().copied().collect();
        let (finished, _) = watch::channel(chunks.is_empty());

        Self {
            config,
            state: Mutex::new(DispatchState {
                chunks,
                pending,
                assignments: HashMap::new(),
                completed: 0,
                failed: 0,
            }),
            registry,
            aggregator,
            finished,
        }
    }

    /// Hand the lowest pending chunk to the least-loaded healthy worker.
    ///
    /// With `requester` set (pull protocol) only that worker is considered.
    /// `None` means no work is available right now: either nothing is
    /// pending or no eligible worker is healthy. Callers back off.
    pub async fn next_assignment(&self, requester: Option<&str>) -> Option<WorkAssignment> {
        let mut state = self.state.lock().await;

        let chunk_id = *state.pending.first()?;
        let chunk = state.chunks.get(&chunk_id)?;
        let work = WorkAssignment {
            chunk_id,
            filepath: chunk.filepath.clone(),
            offset: chunk.offset,
            size: chunk.length,
        };
        let worker_id = self.registry.assign_least_loaded(chunk_id, requester).await?;

        state.pending.remove(&chunk_id);
        state.assignments.insert(
            chunk_id,
            Assignment {
                chunk_id,
                worker_id: worker_id.clone(),
                assigned_at: Instant::now(),
            },
        );
        if let Some(chunk) = state.chunks.get_mut(&chunk_id) {
            chunk.status = ChunkStatus::Assigned;
        }
        standard::CHUNKS_ASSIGNED.inc();

        debug!(
            "Assigned chunk {} [{}, +{}) to worker {}",
            chunk_id, work.offset, work.size, worker_id
        );
        Some(work)
    }

    /// Record a successful chunk and merge its metrics.
    ///
    /// Fails with `StaleAssignment` unless `worker_id` holds the live
    /// assignment, so a straggler never double-counts. Metrics the
    /// aggregator rejects leave the assignment in place for the owner to
    /// report a failure instead.
    pub async fn complete_chunk(
        &self,
        chunk_id: ChunkId,
        worker_id: &str,
        metrics: &MetricsPartial,
    ) -> Result<()> {
        let mut state = self.state.lock().await;
        if let Err(e) = state.check_owner(chunk_id, worker_id) {
            if e.is_expected() {
                standard::STALE_REPORTS.inc();
                debug!("Discarding completion of chunk {} from {}: {}", chunk_id, worker_id, e);
            }
            return Err(e);
        }

        match self.aggregator.add(chunk_id, metrics) {
            // Already counted; settle the chunk anyway
            Ok(()) | Err(AnalyzerError::DuplicateChunk { .. }) => {}
            Err(e) => {
                warn!("Rejected metrics for chunk {} from {}: {}", chunk_id, worker_id, e);
                return Err(e);
            }
        }

        state.take_assignment(chunk_id, worker_id)?;
        self.registry.release(worker_id, chunk_id).await;
        state.chunk_mut(chunk_id)?.status = ChunkStatus::Completed;
        state.completed += 1;
        standard::CHUNKS_COMPLETED.inc();
        debug!("Chunk {} completed by worker {}", chunk_id, worker_id);

        self.publish_progress(&state);
        Ok(())
    }

    /// Worker-reported processing failure: retry or give up on the chunk
    pub async fn report_failure(&self, chunk_id: ChunkId, worker_id: &str, reason: &str) -> Result<ChunkStatus> {
        let mut state = self.state.lock().await;
        if let Err(e) = state.take_assignment(chunk_id, worker_id) {
            if e.is_expected() {
                standard::STALE_REPORTS.inc();
                debug!("Discarding failure of chunk {} from {}: {}", chunk_id, worker_id, e);
            }
            return Err(e);
        }
        self.registry.release(worker_id, chunk_id).await;

        warn!("Worker {} failed chunk {}: {}", worker_id, chunk_id, reason);
        let status = self.retry_or_fail(&mut state, chunk_id, reason)?;

        self.publish_progress(&state);
        Ok(status)
    }

    /// Return assigned chunks to the queue.
    ///
    /// Chunks that are no longer assigned are skipped. Returns the chunks
    /// that were taken back.
    pub async fn requeue_chunks(&self, chunk_ids: &[ChunkId], reason: &str) -> Vec<ChunkId> {
        self.requeue_matching(chunk_ids, None, reason).await
    }

    /// Like [`Dispatcher::requeue_chunks`], limited to chunks still held by `worker_id`
    pub async fn requeue_from_worker(&self, worker_id: &str, chunk_ids: &[ChunkId], reason: &str) -> Vec<ChunkId> {
        self.requeue_matching(chunk_ids, Some(worker_id), reason).await
    }

    /// Reclaim assignments older than the processing timeout
    pub async fn reclaim_expired(&self) -> Vec<ChunkId> {
        let mut state = self.state.lock().await;
        let now = Instant::now();
        let expired: Vec<ChunkId> = state
            .assignments
            .values()
            .filter(|a| now.saturating_duration_since(a.assigned_at) > self.config.processing_timeout)
            .map(|a| {
                warn!(
                    "Chunk {} exceeded processing timeout on worker {}, reclaiming",
                    a.chunk_id, a.worker_id
                );
                a.chunk_id
            })
            .collect();

        self.requeue_locked(&mut state, &expired, None, REASON_TIMED_OUT)
            .await
    }

    async fn requeue_matching(&self, chunk_ids: &[ChunkId], owner: Option<&str>, reason: &str) -> Vec<ChunkId> {
        let mut state = self.state.lock().await;
        self.requeue_locked(&mut state, chunk_ids, owner, reason).await
    }

    async fn requeue_locked(
        &self,
        state: &mut DispatchState,
        chunk_ids: &[ChunkId],
        owner: Option<&str>,
        reason: &str,
    ) -> Vec<ChunkId> {
        let mut requeued = Vec::new();

        for &chunk_id in chunk_ids {
            let worker_id = match state.assignments.get(&chunk_id) {
                Some(a) if owner.map_or(true, |o| a.worker_id == o) => a.worker_id.clone(),
                _ => continue,
            };
            state.assignments.remove(&chunk_id);
            self.registry.release(&worker_id, chunk_id).await;

            if self.retry_or_fail(state, chunk_id, reason).is_ok() {
                requeued.push(chunk_id);
            }
        }

        if !requeued.is_empty() {
            info!("Requeued {} chunk(s): {}", requeued.len(), reason);
            self.publish_progress(state);
        }
        requeued
    }

    fn retry_or_fail(&self, state: &mut DispatchState, chunk_id: ChunkId, reason: &str) -> Result<ChunkStatus> {
        let retry_limit = self.config.retry_limit;
        let chunk = state.chunk_mut(chunk_id)?;
        chunk.retries += 1;
        chunk.last_error = Some(reason.to_string());

        if chunk.retries >= retry_limit {
            chunk.status = ChunkStatus::Failed;
            warn!(
                "Chunk {} failed permanently after {} attempt(s): {}",
                chunk_id, chunk.retries, reason
            );
            state.failed += 1;
            standard::CHUNKS_FAILED.inc();
            Ok(ChunkStatus::Failed)
        } else {
            chunk.status = ChunkStatus::Pending;
            state.pending.insert(chunk_id);
            standard::CHUNKS_REQUEUED.inc();
            Ok(ChunkStatus::Pending)
        }
    }

    fn publish_progress(&self, state: &DispatchState) {
        let progress = state.progress();
        if progress.is_finished() && !*self.finished.borrow() {
            info!(
                "All {} chunks settled ({} completed, {} failed)",
                progress.total, progress.completed, progress.failed
            );
            self.finished.send_replace(true);
        }
    }

    /// Chunk counts by status
    pub async fn progress(&self) -> DispatchProgress {
        self.state.lock().await.progress()
    }

    /// Snapshot of a single chunk
    pub async fn chunk(&self, chunk_id: ChunkId) -> Option<Chunk> {
        self.state.lock().await.chunks.get(&chunk_id).cloned()
    }

    /// Live assignment of a chunk, if any
    pub async fn assignment(&self, chunk_id: ChunkId) -> Option<Assignment> {
        self.state.lock().await.assignments.get(&chunk_id).cloned()
    }

    /// Chunks that exhausted their retries
    pub async fn failed_chunks(&self) -> Vec<Chunk> {
        self.state
            .lock()
            .await
            .chunks
            .values()
            .filter(|c| c.status == ChunkStatus::Failed)
            .cloned()
            .collect()
    }

    /// Watch that flips to `true` once every chunk is Completed or Failed
    pub fn subscribe_finished(&self) -> watch::Receiver<bool> {
        self.finished.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::planner::ChunkPlanner;

    fn metrics(total: u64) -> MetricsPartial {
        MetricsPartial {
            total_requests: total,
            error_count: 0,
            sum_response_time: total as f64 * 10.0,
        }
    }

    async fn setup(chunks: u64, workers: &[&str]) -> (Dispatcher, Arc<WorkerRegistry>, Arc<ResultAggregator>) {
        let planned = ChunkPlanner::plan("access.log", chunks * 100, 100).unwrap();
        let registry = Arc::new(WorkerRegistry::new());
        for id in workers {
            registry.register(id, "http://worker").await.unwrap();
        }
        let aggregator = Arc::new(ResultAggregator::new(chunks));
        let dispatcher = Dispatcher::new(
            planned,
            DispatcherConfig::default(),
            registry.clone(),
            aggregator.clone(),
        );
        (dispatcher, registry, aggregator)
    }

    #[tokio::test]
    async fn test_assigns_lowest_pending_to_least_loaded() {
        let (dispatcher, registry, _) = setup(3, &["w1", "w2"]).await;

        let a = dispatcher.next_assignment(None).await.unwrap();
        let b = dispatcher.next_assignment(None).await.unwrap();
        let c = dispatcher.next_assignment(None).await.unwrap();
        assert_eq!((a.chunk_id, b.chunk_id, c.chunk_id), (0, 1, 2));
        assert_eq!((a.offset, a.size), (0, 100));

        assert_eq!(dispatcher.assignment(0).await.unwrap().worker_id, "w1");
        assert_eq!(dispatcher.assignment(1).await.unwrap().worker_id, "w2");
        assert_eq!(dispatcher.assignment(2).await.unwrap().worker_id, "w1");
        assert_eq!(registry.get_worker("w1").await.unwrap().load(), 2);

        assert!(dispatcher.next_assignment(None).await.is_none());
        let progress = dispatcher.progress().await;
        assert_eq!((progress.pending, progress.assigned), (0, 3));
    }

    #[tokio::test]
    async fn test_no_work_without_healthy_workers() {
        let (dispatcher, registry, _) = setup(2, &["w1"]).await;
        registry.report_unhealthy("w1").await.unwrap();

        assert!(dispatcher.next_assignment(None).await.is_none());
        assert!(dispatcher.next_assignment(Some("w1")).await.is_none());
        assert_eq!(dispatcher.progress().await.pending, 2);
    }

    #[tokio::test]
    async fn test_complete_chunk_once() {
        let (dispatcher, registry, aggregator) = setup(2, &["w1"]).await;
        let work = dispatcher.next_assignment(Some("w1")).await.unwrap();

        dispatcher.complete_chunk(work.chunk_id, "w1", &metrics(4)).await.unwrap();
        assert_eq!(dispatcher.chunk(0).await.unwrap().status, ChunkStatus::Completed);
        assert_eq!(registry.get_worker("w1").await.unwrap().load(), 0);

        let err = dispatcher
            .complete_chunk(work.chunk_id, "w1", &metrics(4))
            .await
            .unwrap_err();
        assert!(matches!(err, AnalyzerError::StaleAssignment { .. }));
        assert_eq!(aggregator.snapshot().total_requests, 4);
    }

    #[tokio::test]
    async fn test_straggler_completion_is_discarded() {
        let (dispatcher, _, aggregator) = setup(1, &["w1", "w2"]).await;

        dispatcher.next_assignment(Some("w1")).await.unwrap();
        dispatcher.requeue_chunks(&[0], REASON_TIMED_OUT).await;
        dispatcher.next_assignment(Some("w2")).await.unwrap();
        dispatcher.complete_chunk(0, "w2", &metrics(5)).await.unwrap();

        let err = dispatcher.complete_chunk(0, "w1", &metrics(7)).await.unwrap_err();
        assert!(matches!(err, AnalyzerError::StaleAssignment { .. }));
        let snapshot = aggregator.snapshot();
        assert_eq!(snapshot.total_requests, 5);
        assert_eq!(snapshot.completed_chunks, 1);
    }

    #[tokio::test]
    async fn test_unknown_chunk() {
        let (dispatcher, _, _) = setup(1, &["w1"]).await;
        let err = dispatcher.complete_chunk(42, "w1", &metrics(1)).await.unwrap_err();
        assert!(matches!(err, AnalyzerError::ChunkNotFound { chunk_id: 42 }));
    }

    #[tokio::test]
    async fn test_retry_limit_marks_failed() {
        let (dispatcher, _, _) = setup(1, &["w1"]).await;

        for attempt in 1..=3 {
            let work = dispatcher.next_assignment(Some("w1")).await.unwrap();
            let status = dispatcher
                .report_failure(work.chunk_id, "w1", "corrupt gzip member")
                .await
                .unwrap();
            if attempt < 3 {
                assert_eq!(status, ChunkStatus::Pending);
            } else {
                assert_eq!(status, ChunkStatus::Failed);
            }
        }

        assert!(dispatcher.next_assignment(Some("w1")).await.is_none());
        let failed = dispatcher.failed_chunks().await;
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].retries, 3);
        assert_eq!(failed[0].last_error.as_deref(), Some("corrupt gzip member"));
        assert!(dispatcher.progress().await.is_finished());
        assert!(*dispatcher.subscribe_finished().borrow());
    }

    #[tokio::test]
    async fn test_requeue_skips_unassigned() {
        let (dispatcher, _, _) = setup(3, &["w1"]).await;
        dispatcher.next_assignment(None).await.unwrap();

        let requeued = dispatcher.requeue_chunks(&[0, 1, 2], REASON_WORKER_DEAD).await;
        assert_eq!(requeued, vec![0]);
        let chunk = dispatcher.chunk(0).await.unwrap();
        assert_eq!(chunk.status, ChunkStatus::Pending);
        assert_eq!(chunk.retries, 1);
        assert!(dispatcher.assignment(0).await.is_none());
    }

    #[tokio::test]
    async fn test_requeue_from_worker_checks_owner() {
        let (dispatcher, _, _) = setup(1, &["w1", "w2"]).await;
        dispatcher.next_assignment(Some("w2")).await.unwrap();

        assert!(dispatcher.requeue_from_worker("w1", &[0], REASON_WORKER_DEAD).await.is_empty());
        assert_eq!(dispatcher.requeue_from_worker("w2", &[0], REASON_WORKER_DEAD).await, vec![0]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reclaim_expired_from_healthy_worker() {
        let (dispatcher, registry, _) = setup(2, &["w1"]).await;
        dispatcher.next_assignment(None).await.unwrap();
        tokio::time::advance(Duration::from_secs(30)).await;
        dispatcher.next_assignment(None).await.unwrap();

        tokio::time::advance(Duration::from_secs(31)).await;
        registry.heartbeat("w1").await.unwrap();

        assert_eq!(dispatcher.reclaim_expired().await, vec![0]);
        let chunk = dispatcher.chunk(0).await.unwrap();
        assert_eq!(chunk.status, ChunkStatus::Pending);
        assert_eq!(chunk.last_error.as_deref(), Some(REASON_TIMED_OUT));
        assert_eq!(dispatcher.assignment(1).await.unwrap().worker_id, "w1");
        assert_eq!(registry.get_worker("w1").await.unwrap().load(), 1);
    }

    #[tokio::test]
    async fn test_rejected_metrics_keep_assignment() {
        let (dispatcher, registry, aggregator) = setup(2, &["w1", "w2"]).await;
        dispatcher.next_assignment(Some("w1")).await.unwrap();
        dispatcher.next_assignment(Some("w2")).await.unwrap();

        let huge = MetricsPartial {
            total_requests: u64::MAX,
            error_count: 0,
            sum_response_time: 1.0,
        };
        dispatcher.complete_chunk(0, "w1", &huge).await.unwrap();

        let err = dispatcher.complete_chunk(1, "w2", &metrics(1)).await.unwrap_err();
        assert!(matches!(err, AnalyzerError::InvalidInput { .. }));
        assert_eq!(dispatcher.chunk(1).await.unwrap().status, ChunkStatus::Assigned);
        assert_eq!(dispatcher.assignment(1).await.unwrap().worker_id, "w2");
        assert_eq!(registry.get_worker("w2").await.unwrap().load(), 1);
        assert_eq!(aggregator.snapshot().completed_chunks, 1);

        // The owner can still hand the chunk back
        let status = dispatcher.report_failure(1, "w2", "metrics rejected").await.unwrap();
        assert_eq!(status, ChunkStatus::Pending);
        assert_eq!(dispatcher.progress().await.pending, 1);
    }

    #[tokio::test]
    async fn test_ownership_checked_before_metrics() {
        let (dispatcher, _, _) = setup(1, &["w1", "w2"]).await;
        dispatcher.next_assignment(Some("w1")).await.unwrap();

        let invalid = MetricsPartial {
            total_requests: 1,
            error_count: 2,
            sum_response_time: 0.0,
        };
        let err = dispatcher.complete_chunk(0, "w2", &invalid).await.unwrap_err();
        assert!(matches!(err, AnalyzerError::StaleAssignment { .. }));

        let err = dispatcher.complete_chunk(0, "w1", &invalid).await.unwrap_err();
        assert!(matches!(err, AnalyzerError::InvalidInput { .. }));
        assert_eq!(dispatcher.assignment(0).await.unwrap().worker_id, "w1");
    }

    #[tokio::test(start_paused = true)]
    async fn test_reclaim_spares_fresh_reassignment() {
        let (dispatcher, registry, _) = setup(1, &["w1"]).await;
        dispatcher.next_assignment(Some("w1")).await.unwrap();
        tokio::time::advance(Duration::from_secs(61)).await;
        registry.heartbeat("w1").await.unwrap();

        // Taken back for another reason and handed to the same worker again
        assert_eq!(dispatcher.requeue_chunks(&[0], REASON_WORKER_DEAD).await, vec![0]);
        dispatcher.next_assignment(Some("w1")).await.unwrap();

        assert!(dispatcher.reclaim_expired().await.is_empty());
        assert_eq!(dispatcher.chunk(0).await.unwrap().retries, 1);
        assert_eq!(dispatcher.assignment(0).await.unwrap().worker_id, "w1");
    }

    #[tokio::test]
    async fn test_chunk_ids_need_not_match_positions() {
        let registry = Arc::new(WorkerRegistry::new());
        registry.register("w1", "http://worker").await.unwrap();
        let aggregator = Arc::new(ResultAggregator::new(2));
        let dispatcher = Dispatcher::new(
            vec![Chunk::new(20, "b.log", 0, 50), Chunk::new(10, "a.log", 0, 100)],
            DispatcherConfig::default(),
            registry,
            aggregator.clone(),
        );

        let work = dispatcher.next_assignment(Some("w1")).await.unwrap();
        assert_eq!((work.chunk_id, work.filepath.as_str(), work.size), (10, "a.log", 100));
        dispatcher.complete_chunk(10, "w1", &metrics(2)).await.unwrap();

        let work = dispatcher.next_assignment(Some("w1")).await.unwrap();
        assert_eq!((work.chunk_id, work.filepath.as_str()), (20, "b.log"));
        dispatcher.complete_chunk(20, "w1", &metrics(3)).await.unwrap();

        assert!(dispatcher.progress().await.is_finished());
        assert_eq!(aggregator.snapshot().total_requests, 5);
        assert!(dispatcher.chunk(1).await.is_none());
    }
}
