//! Tokio runtime executor configuration
//!
//! Keeps blocking chunk reads off the runtime that drives heartbeats, so a
//! slow disk never delays a liveness report.

use std::future::Future;
use std::time::Duration;
use tokio::runtime::{Builder, Handle, Runtime};
use tokio::task::JoinHandle;

use crate::error::{AnalyzerError, Result};

/// Thread counts for the two runtimes
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Threads driving HTTP, heartbeats and polling
    pub io_threads: usize,
    /// Threads running chunk processors
    pub compute_threads: usize,
    /// How long in-flight reports may take to drain on shutdown
    pub shutdown_timeout: Duration,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        let cpus = num_cpus::get();
        Self {
            io_threads: (cpus / 2).clamp(2, 8),
            compute_threads: cpus.max(2),
            shutdown_timeout: Duration::from_secs(10),
        }
    }
}

/// Dual-runtime executor
pub struct AnalyzerRuntime {
    io_runtime: Runtime,
    compute_runtime: Runtime,
    config: RuntimeConfig,
}

impl AnalyzerRuntime {
    pub fn new(config: RuntimeConfig) -> Result<Self> {
        let io_runtime = build_runtime("loganalyzer-io", config.io_threads)?;
        let compute_runtime = build_runtime("loganalyzer-compute", config.compute_threads)?;

        Ok(Self {
            io_runtime,
            compute_runtime,
            config,
        })
    }

    /// Spawn an I/O-bound task
    pub fn spawn_io<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.io_runtime.spawn(future)
    }

    /// Run blocking work on the compute runtime's blocking pool
    pub fn spawn_compute<F, R>(&self, work: F) -> JoinHandle<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        self.compute_runtime.spawn_blocking(work)
    }

    /// Drive a future to completion on the I/O runtime
    pub fn block_on_io<F: Future>(&self, future: F) -> F::Output {
        self.io_runtime.block_on(future)
    }

    pub fn io_handle(&self) -> Handle {
        self.io_runtime.handle().clone()
    }

    pub fn compute_handle(&self) -> Handle {
        self.compute_runtime.handle().clone()
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Stop both runtimes, compute first
    pub fn shutdown(self) {
        self.compute_runtime.shutdown_background();
        self.io_runtime.shutdown_timeout(self.config.shutdown_timeout);
    }
}

fn build_runtime(name: &str, threads: usize) -> Result<Runtime> {
    Builder::new_multi_thread()
        .worker_threads(threads.max(1))
        .thread_name(name)
        .enable_all()
        .build()
        .map_err(|e| AnalyzerError::Internal {
            message: format!("Failed to create {} runtime: {}", name, e),
        })
}
