pub mod maintenance;
pub mod memory;
pub mod stats;

use anyhow::Result;
use std::sync::Arc;

use strata::config::StrataConfig;
use strata::MemoryEngine;

/// Open the engine and run the background scheduler until ctrl-c.
pub async fn serve(config: StrataConfig) -> Result<()> {
    let enabled = config.maintenance.enabled;
    let engine = Arc::new(MemoryEngine::open(config)?);
    let handle = enabled.then(|| engine.start_maintenance());
    if handle.is_none() {
        tracing::warn!("maintenance disabled in config, running without background jobs");
    }
    tracing::info!("strata running, ctrl-c to stop");

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");
    if let Some(handle) = handle {
        handle.shutdown().await;
    }
    Ok(())
}
