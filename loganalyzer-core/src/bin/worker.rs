//! Worker service binary

use loganalyzer_core::runtime::RuntimeConfig;
use loganalyzer_core::{AccessLogProcessor, AnalyzerRuntime, ShutdownSignal, Worker, WorkerConfig};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("loganalyzer_core=info,worker=info")),
        )
        .init();

    let config = WorkerConfig::from_env()?;
    info!("Starting worker {}", config.worker_id);

    let runtime = AnalyzerRuntime::new(RuntimeConfig::default())?;
    let worker = Worker::new(config, AccessLogProcessor, runtime.compute_handle())?;
    let shutdown = ShutdownSignal::new();

    let result = runtime.block_on_io(async {
        shutdown.trigger_on_ctrl_c();
        worker.run(shutdown.clone()).await
    });
    runtime.shutdown();

    if let Err(e) = result {
        error!("Worker exited with error: {}", e);
        return Err(e.into());
    }
    Ok(())
}
