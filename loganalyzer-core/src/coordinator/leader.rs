//! Coordinator leader logic
//!
//! Wires planner, registry, dispatcher, aggregator and health monitor
//! together and exposes the operations behind the HTTP protocol.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration, Instant, MissedTickBehavior};
use tracing::{debug, info};

use super::aggregator::ResultAggregator;
use super::dispatcher::{Dispatcher, DispatcherConfig};
use super::health::{HealthConfig, HealthMonitor};
use super::planner::{Chunk, ChunkId, ChunkPlanner, ChunkStatus};
use super::registry::WorkerRegistry;
use crate::error::Result;
use crate::protocol::{
    CompleteRequest, FailedChunkView, FailedRequest, HealthReport, RegisterRequest,
    StatusResponse, WorkAssignment, WorkerView,
};
use crate::runtime::ShutdownSignal;

/// Configuration for the coordinator
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Log file to analyze
    pub log_file: PathBuf,
    /// Target chunk size in bytes
    pub chunk_size: u64,
    /// Address the HTTP server binds to
    pub bind_addr: String,
    /// Liveness thresholds
    pub health: HealthConfig,
    /// Retry and timeout policy
    pub dispatcher: DispatcherConfig,
    /// Time between assignment-timeout sweeps
    pub reclaim_interval: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            log_file: PathBuf::from("access.log"),
            chunk_size: crate::DEFAULT_CHUNK_SIZE_BYTES,
            bind_addr: "0.0.0.0:8080".into(),
            health: HealthConfig::default(),
            dispatcher: DispatcherConfig::default(),
            reclaim_interval: Duration::from_secs(5),
        }
    }
}

/// Main coordinator
pub struct Coordinator {
    config: CoordinatorConfig,
    registry: Arc<WorkerRegistry>,
    dispatcher: Arc<Dispatcher>,
    aggregator: Arc<ResultAggregator>,
    health: Arc<HealthMonitor>,
}

impl Coordinator {
    /// Plan the configured log file and build a coordinator for it
    pub fn new(config: CoordinatorConfig) -> Result<Self> {
        let chunks = ChunkPlanner::plan_file(&config.log_file, config.chunk_size)?;
        info!(
            "Planned {} chunks for {}",
            chunks.len(),
            config.log_file.display()
        );
        Ok(Self::with_chunks(chunks, config))
    }

    /// Build a coordinator over an existing chunk plan
    pub fn with_chunks(chunks: Vec<Chunk>, config: CoordinatorConfig) -> Self {
        let registry = Arc::new(WorkerRegistry::new());
        let distinct: BTreeSet<ChunkId> = chunks.iter().map(|c| c.id).collect();
        let aggregator = Arc::new(ResultAggregator::new(distinct.len() as u64));
        let dispatcher = Arc::new(Dispatcher::new(
            chunks,
            config.dispatcher.clone(),
            registry.clone(),
            aggregator.clone(),
        ));
        let health = Arc::new(HealthMonitor::new(
            config.health.clone(),
            registry.clone(),
            dispatcher.clone(),
        ));

        Self {
            config,
            registry,
            dispatcher,
            aggregator,
            health,
        }
    }

    /// Start the health monitor and the assignment-timeout sweep
    pub fn start(&self, shutdown: ShutdownSignal) -> Vec<JoinHandle<()>> {
        info!(
            "Coordinator starting: suspect after {:?}, dead after {:?}, processing timeout {:?}, retry limit {}",
            self.config.health.suspect_after,
            self.config.health.dead_after,
            self.config.dispatcher.processing_timeout,
            self.config.dispatcher.retry_limit
        );

        let health_handle = self.health.clone().spawn(shutdown.clone());

        let dispatcher = self.dispatcher.clone();
        let reclaim_interval = self.config.reclaim_interval;
        let mut stop = shutdown.subscribe();
        let reclaim_handle = tokio::spawn(async move {
            let mut ticker = interval(reclaim_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        dispatcher.reclaim_expired().await;
                    }
                    _ = stop.recv() => {
                        debug!("Assignment timeout sweep stopping");
                        break;
                    }
                }
            }
        });

        vec![health_handle, reclaim_handle]
    }

    /// Register a worker
    pub async fn register_worker(&self, req: RegisterRequest) -> Result<()> {
        self.registry.register(&req.worker_id, &req.url).await
    }

    /// Process a health report
    pub async fn report_health(&self, report: HealthReport) -> Result<()> {
        if report.healthy {
            self.registry.heartbeat(&report.worker_id).await
        } else {
            self.registry.report_unhealthy(&report.worker_id).await
        }
    }

    /// Next chunk for a polling worker, `None` when it should back off
    pub async fn request_work(&self, worker_id: &str) -> Result<Option<WorkAssignment>> {
        self.registry.ensure_live(worker_id).await?;
        Ok(self.dispatcher.next_assignment(Some(worker_id)).await)
    }

    /// Record a completed chunk
    pub async fn complete_chunk(&self, req: CompleteRequest) -> Result<()> {
        self.dispatcher
            .complete_chunk(req.chunk_id, &req.worker_id, &req.metrics)
            .await
    }

    /// Record a processing failure
    pub async fn fail_chunk(&self, req: FailedRequest) -> Result<ChunkStatus> {
        self.dispatcher
            .report_failure(req.chunk_id, &req.worker_id, &req.reason)
            .await
    }

    /// Overall progress and the aggregate so far
    pub async fn status(&self) -> StatusResponse {
        let progress = self.dispatcher.progress().await;
        let aggregate = self.aggregator.snapshot();

        StatusResponse {
            total_chunks: progress.total,
            completed_chunks: progress.completed,
            failed_chunks: progress.failed,
            pending_chunks: progress.pending,
            assigned_chunks: progress.assigned,
            avg_response_time: aggregate.avg_response_time,
            error_rate: aggregate.error_rate,
            total_requests: aggregate.total_requests,
            healthy_workers: self.registry.healthy_count().await as u64,
            finished: progress.is_finished(),
            timestamp: chrono::Utc::now(),
        }
    }

    /// Every known worker
    pub async fn workers(&self) -> Vec<WorkerView> {
        let now = Instant::now();
        self.registry
            .workers()
            .await
            .iter()
            .map(|w| WorkerView::from_record(w, now))
            .collect()
    }

    /// Chunks that exhausted their retries
    pub async fn failed_chunks(&self) -> Vec<FailedChunkView> {
        self.dispatcher
            .failed_chunks()
            .await
            .into_iter()
            .map(FailedChunkView::from)
            .collect()
    }

    /// Resolve once every chunk is Completed or Failed
    pub async fn wait_finished(&self) {
        let mut finished = self.dispatcher.subscribe_finished();
        // Sender lives in the dispatcher we hold, so the channel cannot close
        let _ = finished.wait_for(|done| *done).await;
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<WorkerRegistry> {
        &self.registry
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn health_monitor(&self) -> &Arc<HealthMonitor> {
        &self.health
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::aggregator::MetricsPartial;

    fn coordinator(file_len: u64, chunk_size: u64) -> Coordinator {
        let chunks = ChunkPlanner::plan("access.log", file_len, chunk_size).unwrap();
        Coordinator::with_chunks(chunks, CoordinatorConfig::default())
    }

    #[tokio::test]
    async fn test_new_rejects_empty_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.log");
        std::fs::write(&path, b"").unwrap();

        let config = CoordinatorConfig {
            log_file: path,
            ..Default::default()
        };
        assert!(matches!(
            Coordinator::new(config),
            Err(crate::error::AnalyzerError::InvalidInput { .. })
        ));
    }

    #[tokio::test]
    async fn test_request_work_requires_registration() {
        let coordinator = coordinator(1000, 300);
        assert!(coordinator.request_work("ghost").await.is_err());

        coordinator
            .register_worker(RegisterRequest {
                worker_id: "w1".into(),
                url: "http://localhost:9001".into(),
            })
            .await
            .unwrap();
        let work = coordinator.request_work("w1").await.unwrap().unwrap();
        assert_eq!((work.offset, work.size), (0, 300));
    }

    #[tokio::test]
    async fn test_status_reflects_progress() {
        let coordinator = coordinator(1000, 300);
        coordinator
            .register_worker(RegisterRequest {
                worker_id: "w1".into(),
                url: "http://localhost:9001".into(),
            })
            .await
            .unwrap();

        while let Some(work) = coordinator.request_work("w1").await.unwrap() {
            coordinator
                .complete_chunk(CompleteRequest {
                    chunk_id: work.chunk_id,
                    worker_id: "w1".into(),
                    metrics: MetricsPartial {
                        total_requests: 10,
                        error_count: work.chunk_id,
                        sum_response_time: 100.0,
                    },
                })
                .await
                .unwrap();
        }

        let status = coordinator.status().await;
        assert_eq!(status.total_chunks, 4);
        assert_eq!(status.completed_chunks, 4);
        assert_eq!(status.failed_chunks, 0);
        assert_eq!(status.total_requests, 40);
        assert!((status.avg_response_time - 10.0).abs() < 1e-9);
        assert!((status.error_rate - 6.0 / 40.0).abs() < 1e-9);
        assert!(status.finished);

        coordinator.wait_finished().await;
    }

    #[tokio::test]
    async fn test_unhealthy_report_stops_assignment() {
        let coordinator = coordinator(100, 50);
        coordinator
            .register_worker(RegisterRequest {
                worker_id: "w1".into(),
                url: "http://localhost:9001".into(),
            })
            .await
            .unwrap();
        coordinator
            .report_health(HealthReport {
                worker_id: "w1".into(),
                healthy: false,
            })
            .await
            .unwrap();

        assert_eq!(coordinator.request_work("w1").await.unwrap(), None);
        assert_eq!(coordinator.workers().await[0].status, crate::coordinator::registry::WorkerStatus::Suspected);
    }
}
