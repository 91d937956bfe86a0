//! End-to-end tests over loopback HTTP
//!
//! A real coordinator server, protocol clients standing in for workers, and
//! full worker processes running the access-log processor.

use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use loganalyzer_core::coordinator::{
    ChunkPlanner, Coordinator, CoordinatorConfig, DispatcherConfig, HealthConfig, MetricsPartial,
    WorkerStatus,
};
use loganalyzer_core::error::AnalyzerError;
use loganalyzer_core::protocol::StatusResponse;
use loganalyzer_core::server;
use loganalyzer_core::worker::{
    AccessLogProcessor, ChunkProcessor, ClientConfig, CoordinatorClient, Worker, WorkerConfig,
};
use loganalyzer_core::ShutdownSignal;

struct Harness {
    url: String,
    coordinator: Arc<Coordinator>,
    shutdown: ShutdownSignal,
}

impl Harness {
    async fn start(coordinator: Coordinator) -> Self {
        let coordinator = Arc::new(coordinator);
        let shutdown = ShutdownSignal::new();
        coordinator.start(shutdown.clone());

        let listener = server::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());
        tokio::spawn(server::serve(
            listener,
            server::build_router(coordinator.clone()),
            shutdown.clone(),
        ));

        Self {
            url,
            coordinator,
            shutdown,
        }
    }

    fn client(&self, worker_id: &str) -> CoordinatorClient {
        CoordinatorClient::new(
            ClientConfig {
                coordinator_url: self.url.clone(),
                ..Default::default()
            },
            worker_id,
        )
        .unwrap()
    }

    async fn status(&self) -> StatusResponse {
        reqwest::get(format!("{}/status", self.url))
            .await
            .unwrap()
            .json()
            .await
            .unwrap()
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.shutdown.shutdown();
    }
}

fn fast_config() -> CoordinatorConfig {
    CoordinatorConfig {
        health: HealthConfig {
            check_interval: Duration::from_millis(100),
            suspect_after: Duration::from_millis(500),
            dead_after: Duration::from_millis(1000),
        },
        dispatcher: DispatcherConfig {
            processing_timeout: Duration::from_secs(60),
            ..Default::default()
        },
        reclaim_interval: Duration::from_millis(100),
        ..Default::default()
    }
}

/// Blocks its thread for `delay` before reporting a fixed result
struct SlowProcessor {
    delay: Duration,
}

impl ChunkProcessor for SlowProcessor {
    fn process(&self, _: &Path, _: u64, _: u64) -> loganalyzer_core::Result<MetricsPartial> {
        std::thread::sleep(self.delay);
        Ok(metrics(8, 1, 80.0))
    }
}

/// Reports more errors than requests
struct InconsistentProcessor;

impl ChunkProcessor for InconsistentProcessor {
    fn process(&self, _: &Path, _: u64, _: u64) -> loganalyzer_core::Result<MetricsPartial> {
        Ok(metrics(1, 2, 1.0))
    }
}

fn spawn_worker<P: ChunkProcessor>(
    harness: &Harness,
    worker_id: &str,
    processor: P,
) -> tokio::task::JoinHandle<loganalyzer_core::Result<()>> {
    let worker = Worker::new(
        WorkerConfig {
            worker_id: worker_id.into(),
            coordinator_url: harness.url.clone(),
            heartbeat_interval: Duration::from_millis(100),
            poll_interval: Duration::from_millis(20),
            ..Default::default()
        },
        processor,
        tokio::runtime::Handle::current(),
    )
    .unwrap();
    let shutdown = harness.shutdown.clone();
    tokio::spawn(async move { worker.run(shutdown).await })
}

fn metrics(total: u64, errors: u64, sum: f64) -> MetricsPartial {
    MetricsPartial {
        total_requests: total,
        error_count: errors,
        sum_response_time: sum,
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_dead_worker_chunk_moves_to_survivor() {
    let chunks = ChunkPlanner::plan("access.log", 200, 100).unwrap();
    let harness = Harness::start(Coordinator::with_chunks(chunks, fast_config())).await;

    let w1 = harness.client("w1");
    let w2 = harness.client("w2");
    w1.register("http://127.0.0.1:9001").await.unwrap();
    w2.register("http://127.0.0.1:9002").await.unwrap();

    let lost = w1.poll_work().await.unwrap().unwrap();
    let kept = w2.poll_work().await.unwrap().unwrap();
    assert_eq!((lost.chunk_id, kept.chunk_id), (0, 1));
    w2.complete(kept.chunk_id, &metrics(10, 1, 100.0)).await.unwrap();

    // w1 goes silent; w2 keeps heartbeating until it inherits chunk 0
    let mut inherited = None;
    for _ in 0..50 {
        w2.heartbeat(true).await.unwrap();
        if let Some(work) = w2.poll_work().await.unwrap() {
            inherited = Some(work);
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    let inherited = inherited.expect("chunk of dead worker should be reassigned");
    assert_eq!(inherited.chunk_id, lost.chunk_id);
    w2.complete(inherited.chunk_id, &metrics(10, 0, 200.0)).await.unwrap();

    let status = harness.status().await;
    assert_eq!(status.completed_chunks, status.total_chunks);
    assert_eq!(status.failed_chunks, 0);
    assert!((status.avg_response_time - 15.0).abs() < 1e-9);
    assert!((status.error_rate - 0.05).abs() < 1e-9);

    // The dead worker is told to re-register and its late report is stale
    assert!(matches!(
        w1.heartbeat(true).await,
        Err(AnalyzerError::UnknownWorker { .. })
    ));
    assert!(matches!(
        w1.complete(lost.chunk_id, &metrics(99, 0, 0.0)).await,
        Err(AnalyzerError::StaleAssignment { .. })
    ));
    assert_eq!(harness.status().await.total_requests, 20);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_straggler_gets_conflict() {
    let config = CoordinatorConfig {
        dispatcher: DispatcherConfig {
            processing_timeout: Duration::from_millis(200),
            ..Default::default()
        },
        reclaim_interval: Duration::from_millis(50),
        ..Default::default()
    };
    let chunks = ChunkPlanner::plan("access.log", 100, 100).unwrap();
    let harness = Harness::start(Coordinator::with_chunks(chunks, config)).await;

    let slow = harness.client("slow");
    let fast = harness.client("fast");
    slow.register("http://127.0.0.1:9001").await.unwrap();
    fast.register("http://127.0.0.1:9002").await.unwrap();

    let work = slow.poll_work().await.unwrap().unwrap();

    // The timeout sweep reclaims the chunk while `slow` is still healthy
    let mut reassigned = None;
    for _ in 0..50 {
        if let Some(w) = fast.poll_work().await.unwrap() {
            reassigned = Some(w);
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    let reassigned = reassigned.expect("timed out chunk should be reassigned");
    assert_eq!(reassigned.chunk_id, work.chunk_id);

    fast.complete(reassigned.chunk_id, &metrics(5, 0, 50.0)).await.unwrap();
    assert!(matches!(
        slow.complete(work.chunk_id, &metrics(5, 5, 50.0)).await,
        Err(AnalyzerError::StaleAssignment { .. })
    ));

    let status = harness.status().await;
    assert_eq!(status.completed_chunks, 1);
    assert_eq!(status.total_requests, 5);
    assert_eq!(status.error_rate, 0.0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_retry_limit_surfaces_failed_chunk() {
    let chunks = ChunkPlanner::plan("access.log", 200, 100).unwrap();
    let harness = Harness::start(Coordinator::with_chunks(chunks, CoordinatorConfig::default())).await;

    let w1 = harness.client("w1");
    w1.register("http://127.0.0.1:9001").await.unwrap();

    for _ in 0..3 {
        let work = w1.poll_work().await.unwrap().unwrap();
        assert_eq!(work.chunk_id, 0);
        w1.fail(work.chunk_id, "corrupt gzip member").await.unwrap();
    }

    let next = w1.poll_work().await.unwrap().unwrap();
    assert_eq!(next.chunk_id, 1);
    w1.complete(1, &metrics(4, 0, 8.0)).await.unwrap();

    let status = harness.status().await;
    assert_eq!(status.failed_chunks, 1);
    assert_eq!(status.completed_chunks, 1);
    assert!(status.finished);

    let failed: Vec<serde_json::Value> = reqwest::get(format!("{}/chunks/failed", harness.url))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0]["chunk_id"], 0);
    assert_eq!(failed[0]["retries"], 3);
    assert_eq!(failed[0]["last_error"], "corrupt gzip member");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_workers_analyze_log_file() {
    let mut log = tempfile::NamedTempFile::new().unwrap();
    for i in 0..400u64 {
        let status = if i % 10 == 0 { 500 } else { 200 };
        writeln!(
            log,
            "10.0.0.{} - - [16/Oct/2026:10:00:{:02}] \"GET /item/{} HTTP/1.1\" {} {} {}ms",
            i % 255,
            i % 60,
            i,
            status,
            100 + i,
            i % 50
        )
        .unwrap();
    }
    let len = log.as_file().metadata().unwrap().len();
    let expected = AccessLogProcessor.process(log.path(), 0, len).unwrap();
    assert_eq!(expected.total_requests, 400);
    assert_eq!(expected.error_count, 40);

    let config = CoordinatorConfig {
        log_file: log.path().to_path_buf(),
        chunk_size: 1500,
        ..Default::default()
    };
    let harness = Harness::start(Coordinator::new(config).unwrap()).await;

    let mut workers = Vec::new();
    for id in ["worker-a", "worker-b", "worker-c"] {
        let worker = Arc::new(
            Worker::new(
                WorkerConfig {
                    worker_id: id.into(),
                    coordinator_url: harness.url.clone(),
                    heartbeat_interval: Duration::from_millis(200),
                    poll_interval: Duration::from_millis(20),
                    ..Default::default()
                },
                AccessLogProcessor,
                tokio::runtime::Handle::current(),
            )
            .unwrap(),
        );
        let shutdown = harness.shutdown.clone();
        let runner = worker.clone();
        workers.push((worker, tokio::spawn(async move { runner.run(shutdown).await })));
    }

    tokio::time::timeout(Duration::from_secs(30), harness.coordinator.wait_finished())
        .await
        .expect("analysis should finish");

    let status = harness.status().await;
    assert_eq!(status.completed_chunks, status.total_chunks);
    assert_eq!(status.total_requests, expected.total_requests);
    assert!((status.error_rate - 0.1).abs() < 1e-9);
    assert!(
        (status.avg_response_time - expected.sum_response_time / 400.0).abs() < 1e-9
    );

    harness.shutdown.shutdown();
    let mut processed = 0;
    for (worker, handle) in workers {
        handle.await.unwrap().unwrap();
        processed += worker.state().chunks_processed();
    }
    assert!(processed >= status.total_chunks);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_heartbeats_continue_during_slow_chunk() {
    let chunks = ChunkPlanner::plan("access.log", 100, 100).unwrap();
    let harness = Harness::start(Coordinator::with_chunks(chunks, fast_config())).await;
    let suspect_after = harness.coordinator.config().health.suspect_after;

    let handle = spawn_worker(
        &harness,
        "slow",
        SlowProcessor {
            delay: suspect_after * 4,
        },
    );

    // Sample the worker's status for as long as it holds the chunk
    let mut samples = 0;
    let finished = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            if harness.coordinator.status().await.finished {
                break;
            }
            for view in harness.coordinator.workers().await {
                if !view.assigned_chunks.is_empty() {
                    assert!(
                        !matches!(view.status, WorkerStatus::Suspected | WorkerStatus::Dead),
                        "worker went {:?} mid-chunk",
                        view.status
                    );
                    samples += 1;
                }
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await;
    assert!(finished.is_ok(), "slow chunk should complete");
    assert!(samples >= 10, "only {} samples while processing", samples);

    let status = harness.status().await;
    assert_eq!(status.completed_chunks, 1);
    assert_eq!(status.total_requests, 8);
    assert_eq!(harness.coordinator.dispatcher().chunk(0).await.unwrap().retries, 0);

    harness.shutdown.shutdown();
    handle.await.unwrap().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_rejected_metrics_reported_as_failure() {
    let chunks = ChunkPlanner::plan("access.log", 100, 100).unwrap();
    let harness = Harness::start(Coordinator::with_chunks(chunks, fast_config())).await;

    let handle = spawn_worker(&harness, "w1", InconsistentProcessor);

    tokio::time::timeout(Duration::from_secs(10), harness.coordinator.wait_finished())
        .await
        .expect("rejected chunk should fail well before the processing timeout");

    let status = harness.status().await;
    assert_eq!(status.failed_chunks, 1);
    assert_eq!(status.total_requests, 0);

    let failed = harness.coordinator.failed_chunks().await;
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].retries, 3);

    harness.shutdown.shutdown();
    handle.await.unwrap().unwrap();
}
