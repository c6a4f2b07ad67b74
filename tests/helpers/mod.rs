#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;

use strata::clock::{Clock, ManualClock};
use strata::config::StrataConfig;
use strata::embedding::synthetic::SyntheticEmbedder;
use strata::embedding::Embedder;
use strata::engine::EngineBuilder;
use strata::memory::types::{Sector, SectorVector};
use strata::memory::vector_store::{VectorHit, VectorStore};
use strata::{MemoryEngine, MemoryError, Result};

pub fn start_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 1, 1, 12, 0, 0).unwrap()
}

pub fn test_config() -> StrataConfig {
    StrataConfig::default()
}

/// Engine over an in-memory database, the synthetic embedder, and a clock
/// that only moves when the test advances it.
pub struct TestEngine {
    pub engine: Arc<MemoryEngine>,
    pub clock: Arc<ManualClock>,
}

impl TestEngine {
    pub fn clock_millis(&self) -> i64 {
        self.clock.now_millis()
    }
}

pub fn test_engine() -> TestEngine {
    test_engine_with(test_config(), |b| b)
}

pub fn test_engine_with(config: StrataConfig, customize: impl FnOnce(EngineBuilder) -> EngineBuilder) -> TestEngine {
    let clock = Arc::new(ManualClock::new(start_time()));
    let builder = MemoryEngine::builder(config).clock(clock.clone());
    let engine = customize(builder).build().unwrap();
    TestEngine {
        engine: Arc::new(engine),
        clock,
    }
}

pub fn synthetic(config: &StrataConfig) -> SyntheticEmbedder {
    SyntheticEmbedder::new(config.embedding.dimensions, &config.sectors)
}

/// Number of rows in the vector table for `id`.
pub fn vector_rows(engine: &MemoryEngine, id: &str) -> i64 {
    engine
        .database()
        .lock()
        .unwrap()
        .query_row("SELECT COUNT(*) FROM vectors WHERE id = ?1", [id], |r| r.get(0))
        .unwrap()
}

pub fn total_rows(engine: &MemoryEngine, table: &str) -> i64 {
    engine
        .database()
        .lock()
        .unwrap()
        .query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |r| r.get(0))
        .unwrap()
}

// ── Embedders ────────────────────────────────────────────────────────────────

/// Synthetic embedder that parks every call until the gate opens.
pub struct GatedEmbedder {
    inner: SyntheticEmbedder,
    gate: Arc<Semaphore>,
    pub calls: AtomicUsize,
}

impl GatedEmbedder {
    pub fn new(inner: SyntheticEmbedder) -> Self {
        Self {
            inner,
            gate: Arc::new(Semaphore::new(0)),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn open(&self) {
        self.gate.add_permits(Semaphore::MAX_PERMITS / 2);
    }
}

#[async_trait]
impl Embedder for GatedEmbedder {
    async fn embed(&self, text: &str, sector: Sector) -> Result<Vec<f32>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let _permit = self
            .gate
            .acquire()
            .await
            .map_err(|e| MemoryError::Embedding(e.to_string()))?;
        self.inner.embed(text, sector).await
    }

    fn dimensions(&self) -> usize {
        self.inner.dimensions()
    }
}

/// Synthetic embedder that counts calls.
pub struct CountingEmbedder {
    inner: SyntheticEmbedder,
    pub calls: AtomicUsize,
}

impl CountingEmbedder {
    pub fn new(inner: SyntheticEmbedder) -> Self {
        Self {
            inner,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Embedder for CountingEmbedder {
    async fn embed(&self, text: &str, sector: Sector) -> Result<Vec<f32>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.embed(text, sector).await
    }

    fn dimensions(&self) -> usize {
        self.inner.dimensions()
    }
}

// ── Vector stores ────────────────────────────────────────────────────────────

/// Delegates to a real store but fails every upsert after the first
/// `allowed` succeed, or only the upsert right after them when built with
/// [`FlakyVectorStore::failing_once`].
pub struct FlakyVectorStore {
    inner: Arc<dyn VectorStore>,
    allowed: usize,
    once: bool,
    upserts: AtomicUsize,
}

impl FlakyVectorStore {
    pub fn new(inner: Arc<dyn VectorStore>, allowed: usize) -> Self {
        Self {
            inner,
            allowed,
            once: false,
            upserts: AtomicUsize::new(0),
        }
    }

    pub fn failing_once(inner: Arc<dyn VectorStore>, allowed: usize) -> Self {
        Self {
            once: true,
            ..Self::new(inner, allowed)
        }
    }
}

#[async_trait]
impl VectorStore for FlakyVectorStore {
    async fn upsert(&self, id: &str, sector: Sector, vector: &[f32], owner_id: &str) -> Result<()> {
        let n = self.upserts.fetch_add(1, Ordering::SeqCst);
        if n == self.allowed || (!self.once && n > self.allowed) {
            return Err(MemoryError::VectorStore("disk full".into()));
        }
        self.inner.upsert(id, sector, vector, owner_id).await
    }

    async fn delete(&self, id: &str, sector: Sector) -> Result<()> {
        self.inner.delete(id, sector).await
    }

    async fn delete_all(&self, id: &str) -> Result<()> {
        self.inner.delete_all(id).await
    }

    async fn search(&self, sector: Sector, query: &[f32], k: usize, owner_id: Option<&str>) -> Result<Vec<VectorHit>> {
        self.inner.search(sector, query, k, owner_id).await
    }

    async fn get(&self, id: &str, sector: Sector) -> Result<Option<SectorVector>> {
        self.inner.get(id, sector).await
    }

    async fn get_all(&self, id: &str) -> Result<Vec<SectorVector>> {
        self.inner.get_all(id).await
    }

    async fn get_by_sector(&self, sector: Sector) -> Result<Vec<SectorVector>> {
        self.inner.get_by_sector(sector).await
    }

    fn name(&self) -> &'static str {
        "flaky"
    }
}
