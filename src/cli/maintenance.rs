//! One-shot maintenance from the command line.

use anyhow::Result;

use strata::config::StrataConfig;
use strata::MemoryEngine;

/// Run decay, prune, co-activation flush, reflection and profile refresh once.
pub async fn maintain(config: StrataConfig, json: bool) -> Result<()> {
    let engine = MemoryEngine::open(config)?;
    let report = engine.maintain_once().await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!(
        "Decay: {} memories checked, {} changed.",
        report.decay.processed, report.decay.changed
    );
    println!("Pruned {} weak waypoints.", report.pruned);
    println!("Applied {} co-activations.", report.coactivated);
    match &report.reflection.skipped {
        Some(reason) => println!("Reflection skipped: {reason}."),
        None => println!(
            "Reflection: {} clusters, {} reflections created.",
            report.reflection.clusters, report.reflection.created
        ),
    }
    println!("Refreshed {} owner profiles.", report.profiles);
    Ok(())
}
