//! Direct memory operations: remember, recall, reinforce, forget.

use anyhow::{Context, Result};

use strata::config::StrataConfig;
use strata::memory::types::{NewMemory, QueryFilter, Sector};
use strata::MemoryEngine;

pub async fn remember(
    config: StrataConfig,
    content: String,
    tags: Vec<String>,
    owner: Option<String>,
    metadata: Option<String>,
) -> Result<()> {
    let engine = MemoryEngine::open(config)?;
    let mut input = NewMemory::new(content).with_tags(tags);
    if let Some(owner) = owner {
        input = input.with_owner(owner);
    }
    if let Some(raw) = metadata {
        let value: serde_json::Value = serde_json::from_str(&raw).context("metadata must be a JSON object")?;
        input = input.with_metadata(value);
    }
    let result = engine.add_memory(input).await?;
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}

pub async fn recall(
    config: StrataConfig,
    query: String,
    k: Option<usize>,
    sectors: Vec<String>,
    owner: Option<String>,
    min_salience: Option<f64>,
) -> Result<()> {
    let k = k.unwrap_or(config.retrieval.default_k);
    let engine = MemoryEngine::open(config)?;
    let filter = QueryFilter {
        sectors: sectors
            .iter()
            .map(|s| s.parse::<Sector>())
            .collect::<std::result::Result<_, _>>()
            .map_err(|e| anyhow::anyhow!("{e}"))?,
        min_salience,
        owner_id: owner,
        ..Default::default()
    };

    let results = engine.query(&query, k, filter).await?;
    if results.is_empty() {
        println!("No memories matched.");
        return Ok(());
    }
    for (i, r) in results.iter().enumerate() {
        println!(
            "{:>2}. [{:.3}] ({}, salience {:.2}) {}",
            i + 1,
            r.score,
            r.primary_sector,
            r.salience,
            r.content
        );
        println!("    id: {}", r.id);
    }
    Ok(())
}

pub async fn reinforce(config: StrataConfig, id: String, boost: Option<f64>) -> Result<()> {
    let engine = MemoryEngine::open(config)?;
    let salience = engine.reinforce(&id, boost).await?;
    println!("{id}: salience {salience:.3}");
    Ok(())
}

pub async fn forget(config: StrataConfig, id: String) -> Result<()> {
    let engine = MemoryEngine::open(config)?;
    engine.delete_memory(&id).await?;
    println!("Deleted {id}.");
    Ok(())
}
