//! Worker run loop
//!
//! Two cooperating tasks share the coordinator client: a heartbeat loop and
//! a poll/process/report loop. Chunk processing runs on the compute runtime
//! so a slow read never delays a heartbeat.

use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, Duration, Instant, MissedTickBehavior};
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use super::client::{ClientConfig, CoordinatorClient};
use super::processor::ChunkProcessor;
use super::state::{WorkerPhase, WorkerState};
use crate::coordinator::{ChunkId, MetricsPartial};
use crate::error::{AnalyzerError, Result};
use crate::metrics::standard;
use crate::protocol::WorkAssignment;
use crate::runtime::ShutdownSignal;
use crate::server;

/// Worker configuration
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub worker_id: String,
    pub coordinator_url: String,
    /// Address of the worker's own status endpoint
    pub bind_addr: String,
    /// URL sent on registration, defaults to `http://<bound address>`
    pub advertise_url: Option<String>,
    pub heartbeat_interval: Duration,
    /// Back-off after a 204 or a transport error
    pub poll_interval: Duration,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    pub register_retries: u32,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        let id = uuid::Uuid::new_v4().simple().to_string();
        Self {
            worker_id: format!("worker-{}", &id[..8]),
            coordinator_url: "http://127.0.0.1:8080".into(),
            bind_addr: "127.0.0.1:0".into(),
            advertise_url: None,
            heartbeat_interval: Duration::from_secs(crate::DEFAULT_HEARTBEAT_INTERVAL_SECS),
            poll_interval: Duration::from_millis(500),
            connect_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(10),
            register_retries: 10,
        }
    }
}

impl WorkerConfig {
    fn client_config(&self) -> ClientConfig {
        ClientConfig {
            coordinator_url: self.coordinator_url.clone(),
            connect_timeout: self.connect_timeout,
            request_timeout: self.request_timeout,
        }
    }
}

/// Log-analysis worker
pub struct Worker<P> {
    config: WorkerConfig,
    client: Arc<CoordinatorClient>,
    state: Arc<WorkerState>,
    processor: Arc<P>,
    compute: Handle,
}

impl<P: ChunkProcessor> Worker<P> {
    /// Build a worker that runs `processor` on `compute`
    pub fn new(config: WorkerConfig, processor: P, compute: Handle) -> Result<Self> {
        let client = CoordinatorClient::new(config.client_config(), config.worker_id.clone())?;
        let state = Arc::new(WorkerState::new(config.worker_id.clone()));

        Ok(Self {
            config,
            client: Arc::new(client),
            state,
            processor: Arc::new(processor),
            compute,
        })
    }

    pub fn state(&self) -> &Arc<WorkerState> {
        &self.state
    }

    /// Serve status, register, then work until `shutdown` fires
    pub async fn run(&self, shutdown: ShutdownSignal) -> Result<()> {
        let listener = server::bind(&self.config.bind_addr).await?;
        let url = match &self.config.advertise_url {
            Some(url) => url.clone(),
            None => format!("http://{}", listener.local_addr()?),
        };
        let status_server = tokio::spawn(server::serve(
            listener,
            status_router(self.state.clone()),
            shutdown.clone(),
        ));

        info!(
            "Worker {} registering with {}",
            self.config.worker_id, self.config.coordinator_url
        );
        tokio::select! {
            registered = self.client.register_with_retry(&url, self.config.register_retries) => registered?,
            _ = shutdown.wait() => {
                let _ = status_server.await;
                return Ok(());
            }
        }
        self.state.set_phase(WorkerPhase::Idle).await;
        info!("Worker {} registered as {}", self.config.worker_id, url);

        let heartbeat = self.spawn_heartbeat(url.clone(), shutdown.clone());
        self.work_loop(&url, &shutdown).await;

        self.state.set_phase(WorkerPhase::ShuttingDown).await;
        let _ = heartbeat.await;
        match self.client.heartbeat(false).await {
            Ok(()) => info!("Worker {} left the pool", self.config.worker_id),
            Err(e) => debug!("Leave notice not delivered: {}", e),
        }

        let _ = status_server.await;
        Ok(())
    }

    fn spawn_heartbeat(&self, url: String, shutdown: ShutdownSignal) -> JoinHandle<()> {
        let client = self.client.clone();
        let period = self.config.heartbeat_interval;
        let mut stop = shutdown.subscribe();

        tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match client.heartbeat(true).await {
                            Ok(()) => {}
                            Err(AnalyzerError::UnknownWorker { .. }) => {
                                warn!("Coordinator forgot worker {}, re-registering", client.worker_id());
                                if let Err(e) = client.register(&url).await {
                                    warn!("Re-registration failed: {}", e);
                                }
                            }
                            Err(e) => warn!("Heartbeat failed: {}", e),
                        }
                    }
                    _ = stop.recv() => {
                        debug!("Heartbeat loop stopping");
                        break;
                    }
                }
            }
        })
    }

    async fn work_loop(&self, url: &str, shutdown: &ShutdownSignal) {
        let mut stop = shutdown.subscribe();

        while !shutdown.is_triggered() {
            let backoff = match self.client.poll_work().await {
                Ok(Some(assignment)) => {
                    self.handle(assignment).await;
                    false
                }
                Ok(None) => true,
                Err(AnalyzerError::UnknownWorker { .. }) => {
                    warn!("Work poll rejected, re-registering {}", self.config.worker_id);
                    if let Err(e) = self.client.register(url).await {
                        warn!("Re-registration failed: {}", e);
                    }
                    true
                }
                Err(e) => {
                    warn!("Work poll failed: {}", e);
                    true
                }
            };

            if backoff {
                tokio::select! {
                    _ = sleep(self.config.poll_interval) => {}
                    _ = stop.recv() => break,
                }
            }
        }
    }

    async fn handle(&self, assignment: WorkAssignment) {
        let chunk_id = assignment.chunk_id;
        self.state.begin_chunk(chunk_id).await;
        debug!(
            "Processing chunk {} of {} [{}, +{})",
            chunk_id, assignment.filepath, assignment.offset, assignment.size
        );

        let started = Instant::now();
        let outcome = self.process(&assignment).await;
        standard::CHUNK_PROCESSING_DURATION.observe_duration(started.elapsed());

        let succeeded = match outcome {
            Ok(metrics) => match self.client.complete(chunk_id, &metrics).await {
                Ok(()) => true,
                Err(e) if e.is_expected() => {
                    debug!("Chunk {} was reassigned, result discarded", chunk_id);
                    true
                }
                Err(AnalyzerError::InvalidMessage { reason }) => {
                    warn!("Coordinator rejected metrics of chunk {}: {}", chunk_id, reason);
                    self.report_failure(chunk_id, &format!("metrics rejected: {}", reason))
                        .await;
                    false
                }
                Err(e) => {
                    // Coordinator reclaims the chunk once the assignment times out
                    warn!("Could not report chunk {}: {}", chunk_id, e);
                    false
                }
            },
            Err(e) => {
                warn!("Chunk {} failed: {}", chunk_id, e);
                self.report_failure(chunk_id, &e.to_string()).await;
                false
            }
        };

        self.state.finish_chunk(succeeded).await;
    }

    async fn report_failure(&self, chunk_id: ChunkId, reason: &str) {
        if let Err(e) = self.client.fail(chunk_id, reason).await {
            debug!("Failure report for chunk {} not accepted: {}", chunk_id, e);
        }
    }

    async fn process(&self, assignment: &WorkAssignment) -> Result<MetricsPartial> {
        let processor = self.processor.clone();
        let path = PathBuf::from(&assignment.filepath);
        let (offset, size) = (assignment.offset, assignment.size);

        self.compute
            .spawn_blocking(move || processor.process(&path, offset, size))
            .await
            .map_err(|e| AnalyzerError::Internal {
                message: format!("Processor task aborted: {}", e),
            })?
    }
}

/// Router for the worker's own `GET /status`
pub fn status_router(state: Arc<WorkerState>) -> Router {
    Router::new()
        .route("/status", get(worker_status))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn worker_status(State(state): State<Arc<WorkerState>>) -> impl IntoResponse {
    Json(state.snapshot().await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::WorkerStatusResponse;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    #[test]
    fn test_default_worker_ids_differ() {
        let a = WorkerConfig::default();
        let b = WorkerConfig::default();
        assert!(a.worker_id.starts_with("worker-"));
        assert_ne!(a.worker_id, b.worker_id);
    }

    #[tokio::test]
    async fn test_status_endpoint() {
        let state = Arc::new(WorkerState::new("w1"));
        state.begin_chunk(3).await;

        let response = status_router(state)
            .oneshot(Request::builder().uri("/status").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let status: WorkerStatusResponse = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(status.worker_id, "w1");
        assert_eq!(status.phase, "busy");
        assert_eq!(status.current_chunk, Some(3));
    }
}
