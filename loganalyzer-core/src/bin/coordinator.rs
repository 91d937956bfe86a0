//! Coordinator service binary

use loganalyzer_core::server;
use loganalyzer_core::{Coordinator, CoordinatorConfig, ShutdownSignal};
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("loganalyzer_core=info,coordinator=info")),
        )
        .init();

    info!("Starting log analysis coordinator");

    let config = CoordinatorConfig::from_env()?;
    let coordinator = match Coordinator::new(config) {
        Ok(c) => Arc::new(c),
        Err(e) => {
            error!("Failed to plan analysis: {}", e);
            return Err(e.into());
        }
    };

    let shutdown = ShutdownSignal::new();
    shutdown.trigger_on_ctrl_c();
    let background = coordinator.start(shutdown.clone());

    // Keep serving after completion so operators can still read /status
    let watcher = {
        let coordinator = coordinator.clone();
        tokio::spawn(async move {
            coordinator.wait_finished().await;
            let status = coordinator.status().await;
            info!(
                "Analysis finished: {}/{} chunks completed, {} failed, {} requests, avg response time {:.3}, error rate {:.4}",
                status.completed_chunks,
                status.total_chunks,
                status.failed_chunks,
                status.total_requests,
                status.avg_response_time,
                status.error_rate
            );
        })
    };

    let listener = server::bind(&coordinator.config().bind_addr).await?;
    server::serve(listener, server::build_router(coordinator.clone()), shutdown.clone()).await?;

    watcher.abort();
    for handle in background {
        let _ = handle.await;
    }
    info!("Coordinator stopped");
    Ok(())
}
