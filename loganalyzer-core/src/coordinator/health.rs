//! Worker health monitoring
//!
//! Periodically sweeps the registry for stale heartbeats and hands the
//! chunks of dead workers back to the dispatcher.

use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{debug, info};

use super::dispatcher::{Dispatcher, REASON_WORKER_DEAD};
use super::planner::ChunkId;
use super::registry::WorkerRegistry;
use crate::metrics::standard;
use crate::runtime::ShutdownSignal;

/// Liveness thresholds
#[derive(Debug, Clone)]
pub struct HealthConfig {
    /// Time between sweeps
    pub check_interval: Duration,
    /// Staleness after which a healthy worker becomes suspect
    pub suspect_after: Duration,
    /// Staleness after which a suspect worker is declared dead
    pub dead_after: Duration,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(5),
            suspect_after: Duration::from_secs(15),
            dead_after: Duration::from_secs(45),
        }
    }
}

/// Outcome of one sweep
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Workers declared dead in this sweep
    pub dead_workers: Vec<String>,
    /// Chunks returned to the queue (or failed) because their worker died
    pub reclaimed_chunks: Vec<ChunkId>,
}

/// Supervises worker liveness
pub struct HealthMonitor {
    config: HealthConfig,
    registry: Arc<WorkerRegistry>,
    dispatcher: Arc<Dispatcher>,
}

impl HealthMonitor {
    pub fn new(config: HealthConfig, registry: Arc<WorkerRegistry>, dispatcher: Arc<Dispatcher>) -> Self {
        Self {
            config,
            registry,
            dispatcher,
        }
    }

    /// Run a single sweep
    pub async fn sweep(&self) -> SweepReport {
        let dead = self
            .registry
            .check_health(self.config.suspect_after, self.config.dead_after)
            .await;

        let mut report = SweepReport::default();
        for worker in dead {
            let reclaimed = self
                .dispatcher
                .requeue_from_worker(&worker.worker_id, &worker.orphaned_chunks, REASON_WORKER_DEAD)
                .await;
            if !reclaimed.is_empty() {
                info!(
                    "Reclaimed {} chunk(s) from dead worker {}",
                    reclaimed.len(),
                    worker.worker_id
                );
            }
            report.reclaimed_chunks.extend(reclaimed);
            report.dead_workers.push(worker.worker_id);
        }

        standard::HEALTHY_WORKERS.set(self.registry.healthy_count().await as i64);
        report
    }

    /// Sweep on every tick until shutdown
    pub fn spawn(self: Arc<Self>, shutdown: ShutdownSignal) -> JoinHandle<()> {
        let mut stop = shutdown.subscribe();
        tokio::spawn(async move {
            let mut ticker = interval(self.config.check_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        self.sweep().await;
                    }
                    _ = stop.recv() => {
                        debug!("Health monitor stopping");
                        break;
                    }
                }
            }
        })
    }
}
