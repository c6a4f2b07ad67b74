//! Sector-aware long-term memory for AI agents.
//!
//! Strata stores short natural-language memories, sorts each one into
//! cognitive sectors, embeds it once per sector, links related memories in a
//! weighted waypoint graph, and answers recall queries with a hybrid score
//! over similarity, token overlap, graph weight, recency and keywords.
//! Salience rises with use and decays with time.
//!
//! | Sector | Holds | Decay rate (per day) |
//! |--------|-------|----------------------|
//! | **Episodic** | Events and experiences | 0.015 |
//! | **Semantic** | Facts and knowledge | 0.005 |
//! | **Procedural** | How-to and steps | 0.008 |
//! | **Emotional** | Feelings and reactions | 0.020 |
//! | **Reflective** | Insights and generated summaries | 0.001 |
//!
//! # Architecture
//!
//! - **Storage**: SQLite (WAL) for memories, waypoints, owner profiles and the
//!   maintenance log; vectors in a pluggable [`memory::vector_store::VectorStore`]
//!   backed by a plain table or [sqlite-vec](https://github.com/asg017/sqlite-vec)
//! - **Embeddings**: any [`embedding::Embedder`]; a deterministic synthetic
//!   provider ships for local use and tests
//! - **Recall**: per-sector vector search, waypoint expansion on weak
//!   matches, hybrid scoring, admission control and an LRU+TTL result cache
//!
//! # Modules
//!
//! - [`config`]: TOML configuration with environment overrides
//! - [`db`]: connection setup, sqlite-vec registration, schema
//! - [`embedding`]: embedder trait and providers
//! - [`engine`]: [`engine::MemoryEngine`], the entry point for every operation
//! - [`memory`]: classification, dedup, storage, graph, scoring, dynamics, maintenance

pub mod chunking;
pub mod clock;
pub mod config;
pub mod db;
pub mod embedding;
pub mod engine;
pub mod error;
pub mod memory;
pub mod text;

pub use engine::MemoryEngine;
pub use error::{MemoryError, Result};
