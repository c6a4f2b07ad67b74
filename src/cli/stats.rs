use anyhow::Result;

use strata::config::StrataConfig;
use strata::memory::types::Sector;
use strata::MemoryEngine;

/// Display store statistics in the terminal, or as JSON.
pub async fn stats(config: StrataConfig, json: bool) -> Result<()> {
    let engine = MemoryEngine::open(config)?;
    let response = engine.stats().await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&response)?);
        return Ok(());
    }

    println!("Memory Statistics");
    println!("{}", "=".repeat(40));
    println!("  Total memories:      {}", response.total_memories);
    println!("  Owners:              {}", response.owners);
    println!("  Segments:            {}", response.segments);
    println!("  Average salience:    {:.3}", response.avg_salience);
    println!();

    println!("By Sector:");
    for s in Sector::ALL {
        let count = response.by_sector.get(s.as_str()).copied().unwrap_or(0);
        println!("  {:<12} {}", s.as_str(), count);
    }
    println!();

    println!("Waypoints:             {}", response.waypoints);
    println!("Vector backend:        {}", response.vector_backend);
    println!("Database size:         {} bytes", response.db_size_bytes);

    if !response.last_maintenance.is_empty() {
        println!();
        println!("Last maintenance:");
        for (op, at) in &response.last_maintenance {
            println!("  {:<12} {}", op, at);
        }
    }

    Ok(())
}
