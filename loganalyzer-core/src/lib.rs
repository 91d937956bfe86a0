//! Loganalyzer Core - Distributed chunked log analysis
//!
//! This crate provides:
//! - Chunk planning over a single large log file
//! - Worker registration, heartbeats and failure detection
//! - Pull-based chunk dispatch with timeouts and retries
//! - Exactly-once aggregation of per-chunk metrics
//! - The worker run loop and a default access-log processor

pub mod config;
pub mod coordinator;
pub mod error;
pub mod metrics;
pub mod protocol;
pub mod runtime;
pub mod server;
pub mod worker;

pub use coordinator::{Coordinator, CoordinatorConfig};
pub use error::{AnalyzerError, Result};
pub use runtime::{AnalyzerRuntime, ShutdownSignal};
pub use worker::{AccessLogProcessor, ChunkProcessor, Worker, WorkerConfig};

/// Default target chunk size in bytes
pub const DEFAULT_CHUNK_SIZE_BYTES: u64 = 8 * 1024 * 1024;

/// Default heartbeat interval in seconds
pub const DEFAULT_HEARTBEAT_INTERVAL_SECS: u64 = 5;

/// Default retry limit per chunk
pub const DEFAULT_RETRY_LIMIT: u32 = 3;
