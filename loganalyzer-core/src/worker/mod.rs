//! Worker-side logic
//!
//! Coordinator client, local state, chunk processors and the run loop.

pub mod client;
pub mod processor;
pub mod runner;
pub mod state;

pub use client::{ClientConfig, CoordinatorClient};
pub use processor::{AccessLogProcessor, ChunkProcessor};
pub use runner::{Worker, WorkerConfig};
pub use state::{WorkerPhase, WorkerState};
