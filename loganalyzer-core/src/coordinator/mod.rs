//! Coordinator for chunked log analysis
//!
//! Plans chunks, tracks workers, dispatches work, supervises liveness and
//! aggregates results.

pub mod aggregator;
pub mod dispatcher;
pub mod health;
pub mod leader;
pub mod planner;
pub mod registry;

pub use aggregator::{AggregateResult, MetricsPartial, ResultAggregator};
pub use dispatcher::{Assignment, DispatchProgress, Dispatcher, DispatcherConfig};
pub use health::{HealthConfig, HealthMonitor, SweepReport};
pub use leader::{Coordinator, CoordinatorConfig};
pub use planner::{Chunk, ChunkId, ChunkPlanner, ChunkStatus};
pub use registry::{WorkerRecord, WorkerRegistry, WorkerStatus};
