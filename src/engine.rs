//! The memory engine: ingestion, recall, and maintenance entry points.
//!
//! [`MemoryEngine`] owns every piece of long-lived state (database handle,
//! vector store, embedder, caches, the co-activation buffer, the admission
//! counter) and an injected [`Clock`]. Synchronous SQL runs on the blocking
//! pool through [`Database::call`]; embedder and vector-store calls are async
//! and each runs under the configured call timeout.

use lru::LruCache;
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::chunking::{average_vectors, Chunker, SentenceChunker};
use crate::clock::{days_between, Clock, SystemClock};
use crate::config::StrataConfig;
use crate::db::{self, Database};
use crate::embedding::{self, Embedder};
use crate::error::{MemoryError, Result};
use crate::memory::classify::Classifier;
use crate::memory::dynamics::SalienceDynamics;
use crate::memory::keyword::KeywordQuery;
use crate::memory::maintenance::{self, DecayReport, MaintenanceHandle, MaintenanceReport, ReflectionReport};
use crate::memory::profile::{self, OwnerProfile};
use crate::memory::query::{self, Candidate, CandidateScorer, PreparedQuery};
use crate::memory::scoring::HybridScorer;
use crate::memory::simhash;
use crate::memory::stats::{self, StatsResponse};
use crate::memory::store::{self, MaintenanceOp, Summarizer, COMPRESSED_DIM};
use crate::memory::types::{
    IngestResult, Memory, MemoryUpdate, NewMemory, QueryFilter, QueryResult, RetrievalTier, Sector,
    SectorVector, UpdateResult,
};
use crate::memory::vector_store::{self, VectorStore};
use crate::memory::waypoints::{self, CoactivationBuffer, Expansion};
use crate::text::{CanonicalNormalizer, Normalizer};

/// Holds one admission slot. The slot is released on drop, so every exit
/// path of a query (success, error, timeout, cancellation) gives it back.
struct AdmissionGuard {
    active: Arc<AtomicUsize>,
}

impl Drop for AdmissionGuard {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}

struct CachedQuery {
    stored_at: i64,
    results: Vec<QueryResult>,
}

async fn with_timeout<T, F>(operation: &'static str, after_ms: u64, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(Duration::from_millis(after_ms), fut).await {
        Ok(result) => result,
        Err(_) => Err(MemoryError::Timeout { operation, after_ms }),
    }
}

/// Assembles a [`MemoryEngine`]. Anything not supplied is built from config.
pub struct EngineBuilder {
    config: StrataConfig,
    database: Option<Database>,
    db_path: Option<PathBuf>,
    embedder: Option<Arc<dyn Embedder>>,
    vector_store: Option<Arc<dyn VectorStore>>,
    normalizer: Option<Arc<dyn Normalizer>>,
    chunker: Option<Arc<dyn Chunker>>,
    summarizer: Option<Arc<dyn Summarizer>>,
    clock: Option<Arc<dyn Clock>>,
}

impl EngineBuilder {
    pub fn database(mut self, database: Database) -> Self {
        self.database = Some(database);
        self
    }

    pub fn embedder(mut self, embedder: Arc<dyn Embedder>) -> Self {
        self.embedder = Some(embedder);
        self
    }

    pub fn vector_store(mut self, store: Arc<dyn VectorStore>) -> Self {
        self.vector_store = Some(store);
        self
    }

    pub fn normalizer(mut self, normalizer: Arc<dyn Normalizer>) -> Self {
        self.normalizer = Some(normalizer);
        self
    }

    pub fn chunker(mut self, chunker: Arc<dyn Chunker>) -> Self {
        self.chunker = Some(chunker);
        self
    }

    pub fn summarizer(mut self, summarizer: Arc<dyn Summarizer>) -> Self {
        self.summarizer = Some(summarizer);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn build(self) -> anyhow::Result<MemoryEngine> {
        let config = self.config;
        let database = match self.database {
            Some(d) => d,
            None => Database::new(db::open_memory_database()?),
        };
        let embedder = match self.embedder {
            Some(e) => e,
            None => embedding::create_provider(&config.embedding, &config.sectors)?,
        };
        db::check_embedding_dim(&*database.lock()?, embedder.dimensions())?;
        let vectors = match self.vector_store {
            Some(v) => v,
            None => vector_store::create_vector_store(&config.storage, database.clone(), embedder.dimensions())?,
        };
        let capacity = NonZeroUsize::new(config.retrieval.cache_capacity).unwrap_or(NonZeroUsize::MIN);

        tracing::info!(
            backend = vectors.name(),
            dimensions = embedder.dimensions(),
            tier = ?config.retrieval.tier,
            max_active = config.retrieval.max_active,
            "memory engine ready"
        );

        Ok(MemoryEngine {
            classifier: Classifier::new(&config.sectors)?,
            scorer: HybridScorer::new(&config.scoring),
            dynamics: SalienceDynamics::new(&config.sectors, &config.dynamics, &config.ingestion),
            db: database,
            db_path: self.db_path,
            vectors,
            embedder,
            normalizer: self.normalizer.unwrap_or_else(|| Arc::new(CanonicalNormalizer)),
            chunker: self.chunker.unwrap_or_else(|| Arc::new(SentenceChunker)),
            summarizer: self.summarizer,
            clock: self.clock.unwrap_or_else(|| Arc::new(SystemClock)),
            cache: Mutex::new(LruCache::new(capacity)),
            active: Arc::new(AtomicUsize::new(0)),
            coactivations: Arc::new(CoactivationBuffer::with_capacity(
                config.waypoints.coactivation_batch * config.retrieval.max_active,
            )),
            ingest_lock: tokio::sync::Mutex::new(()),
            config,
        })
    }
}

pub struct MemoryEngine {
    db: Database,
    db_path: Option<PathBuf>,
    vectors: Arc<dyn VectorStore>,
    embedder: Arc<dyn Embedder>,
    classifier: Classifier,
    normalizer: Arc<dyn Normalizer>,
    chunker: Arc<dyn Chunker>,
    summarizer: Option<Arc<dyn Summarizer>>,
    scorer: HybridScorer,
    dynamics: SalienceDynamics,
    config: StrataConfig,
    clock: Arc<dyn Clock>,
    cache: Mutex<LruCache<String, CachedQuery>>,
    active: Arc<AtomicUsize>,
    coactivations: Arc<CoactivationBuffer>,
    ingest_lock: tokio::sync::Mutex<()>,
}

impl MemoryEngine {
    pub fn builder(config: StrataConfig) -> EngineBuilder {
        EngineBuilder {
            config,
            database: None,
            db_path: None,
            embedder: None,
            vector_store: None,
            normalizer: None,
            chunker: None,
            summarizer: None,
            clock: None,
        }
    }

    /// Open the on-disk store named by `storage.db_path`.
    pub fn open(config: StrataConfig) -> anyhow::Result<Self> {
        let path = config.resolved_db_path();
        let conn = db::open_database(&path, config.storage.busy_timeout_ms)?;
        let mut builder = Self::builder(config).database(Database::new(conn));
        builder.db_path = Some(path);
        builder.build()
    }

    pub fn config(&self) -> &StrataConfig {
        &self.config
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub fn vector_store(&self) -> &Arc<dyn VectorStore> {
        &self.vectors
    }

    pub fn classifier(&self) -> &Classifier {
        &self.classifier
    }

    /// Queries currently holding an admission slot.
    pub fn active_queries(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Co-activation pairs waiting for the next flush.
    pub fn pending_coactivations(&self) -> usize {
        self.coactivations.len()
    }

    fn call_timeout(&self) -> u64 {
        self.config.embedding.call_timeout_ms
    }

    // ── Ingestion ────────────────────────────────────────────────────────────

    /// If `owner_id` already holds a near-duplicate of `signature`, reinforce
    /// it and return it.
    async fn merge_duplicate(&self, signature: u64, owner_id: &str, now: i64) -> Result<Option<Memory>> {
        let owner = owner_id.to_string();
        let dynamics = self.dynamics.clone();
        let max_distance = self.config.ingestion.dedup_max_distance;
        self.db
            .call(move |conn| {
                let Some(existing) = store::find_by_simhash(conn, signature, &owner)? else {
                    return Ok(None);
                };
                if !simhash::is_near_duplicate(existing.simhash, signature, max_distance) {
                    return Ok(None);
                }
                store::mark_seen(conn, &existing.id, dynamics.dedup_reinforce(existing.salience), now)?;
                Ok(Some(existing))
            })
            .await
    }

    /// One vector per sector. Multi-chunk content is embedded chunk by chunk
    /// and averaged.
    async fn embed_sectors(&self, content: &str, sectors: &[Sector]) -> Result<(Vec<(Sector, Vec<f32>)>, usize)> {
        let cfg = &self.config.ingestion;
        let chunks = self.chunker.chunk(content, cfg.chunk_target_tokens, cfg.chunk_overlap);
        let mut out = Vec::with_capacity(sectors.len());
        for &sector in sectors {
            let vector = if chunks.len() <= 1 {
                with_timeout("embedding", self.call_timeout(), self.embedder.embed(content, sector)).await?
            } else {
                let mut per_chunk = Vec::with_capacity(chunks.len());
                for chunk in &chunks {
                    per_chunk.push(
                        with_timeout("embedding", self.call_timeout(), self.embedder.embed(&chunk.text, sector))
                            .await?,
                    );
                }
                average_vectors(&per_chunk)
            };
            out.push((sector, vector));
        }
        Ok((out, chunks.len().max(1)))
    }

    fn mean_and_compressed(&self, vectors: &[(Sector, Vec<f32>)]) -> (Vec<f32>, Option<Vec<f32>>) {
        let mean = store::mean_vector(vectors, &self.config.sectors, self.config.ingestion.softmax_beta);
        let compressed = (self.config.retrieval.tier == RetrievalTier::Smart && mean.len() > COMPRESSED_DIM)
            .then(|| store::compress_vector(&mean, COMPRESSED_DIM));
        (mean, compressed)
    }

    async fn write_vectors(&self, id: &str, owner_id: &str, vectors: &[(Sector, Vec<f32>)]) -> Result<()> {
        for (sector, v) in vectors {
            with_timeout("vector upsert", self.call_timeout(), self.vectors.upsert(id, *sector, v, owner_id)).await?;
        }
        Ok(())
    }

    /// Remove whatever vectors a failed write left for `id`.
    async fn compensate(&self, id: &str) {
        if let Err(e) = self.vectors.delete_all(id).await {
            tracing::error!(id = %id, error = %e, "failed to remove vectors after aborted write");
        }
    }

    /// Classify, embed and store a new memory, or merge it into a
    /// near-duplicate of the same owner.
    pub async fn add_memory(&self, input: NewMemory) -> Result<IngestResult> {
        if input.content.trim().is_empty() {
            return Err(MemoryError::Validation("content must not be empty".into()));
        }
        let owner_id = input
            .owner_id
            .clone()
            .unwrap_or_else(|| self.config.storage.default_owner.clone());
        let signature = simhash::simhash_tokens(&self.normalizer.token_set(&input.content));

        if let Some(existing) = self.merge_duplicate(signature, &owner_id, self.clock.now_millis()).await? {
            tracing::debug!(id = %existing.id, "near-duplicate merged");
            return Ok(IngestResult {
                id: existing.id,
                primary_sector: existing.primary_sector,
                sectors: vec![existing.primary_sector],
                chunks: 0,
                deduplicated: true,
            });
        }

        let metadata = input
            .metadata
            .clone()
            .unwrap_or_else(|| serde_json::Value::Object(Default::default()));
        let class = self.classifier.classify(&input.content, Some(&metadata));
        let sectors = class.sectors();
        let (vectors, chunks) = self.embed_sectors(&input.content, &sectors).await?;
        let (mean, compressed) = self.mean_and_compressed(&vectors);

        let _ingest = self.ingest_lock.lock().await;
        let now = self.clock.now_millis();

        // A concurrent ingest of the same content may have committed while we embedded
        if let Some(existing) = self.merge_duplicate(signature, &owner_id, now).await? {
            return Ok(IngestResult {
                id: existing.id,
                primary_sector: existing.primary_sector,
                sectors: vec![existing.primary_sector],
                chunks: 0,
                deduplicated: true,
            });
        }

        let id = uuid::Uuid::now_v7().to_string();
        let memory = Memory {
            id: id.clone(),
            owner_id: owner_id.clone(),
            segment: 0,
            content: input.content,
            simhash: signature,
            primary_sector: class.primary,
            tags: input.tags,
            metadata,
            created_at: now,
            updated_at: now,
            last_seen_at: now,
            salience: SalienceDynamics::initial_salience(&self.config.ingestion, class.additional.len()),
            decay_lambda: self.config.sectors.get(class.primary).decay_lambda,
            version: 1,
            mean_dim: mean.len(),
            mean_vector: mean,
            compressed_vector: compressed,
            feedback_score: 0.0,
        };

        let written = async {
            self.write_vectors(&id, &owner_id, &vectors).await?;
            let summarizer = self.summarizer.clone();
            let cfg = self.config.ingestion.clone();
            self.db
                .call(move |conn| store::commit_new_memory(conn, memory, summarizer.as_deref(), &cfg))
                .await
        }
        .await;

        match written {
            Ok((stored, seed)) => {
                tracing::info!(
                    id = %stored.id,
                    sector = %stored.primary_sector,
                    segment = stored.segment,
                    chunks,
                    seed = %seed.dst_id,
                    "memory stored"
                );
                Ok(IngestResult {
                    id,
                    primary_sector: class.primary,
                    sectors,
                    chunks,
                    deduplicated: false,
                })
            }
            Err(e) => {
                self.compensate(&id).await;
                tracing::warn!(id = %id, error = %e, "ingest rolled back");
                Err(MemoryError::Transaction(e.to_string()))
            }
        }
    }

    /// Edit a memory. Vectors are rewritten only when the content changes.
    pub async fn update_memory(&self, id: &str, update: MemoryUpdate) -> Result<UpdateResult> {
        if update.content.as_deref().is_some_and(|c| c.trim().is_empty()) {
            return Err(MemoryError::Validation("content must not be empty".into()));
        }
        let _ingest = self.ingest_lock.lock().await;

        let lookup = id.to_string();
        let mut memory = self.db.call(move |conn| store::require_memory(conn, &lookup)).await?;

        let content_changed = update.content.as_ref().is_some_and(|c| *c != memory.content);
        if let Some(tags) = update.tags {
            memory.tags = tags;
        }
        if let Some(metadata) = update.metadata {
            memory.metadata = metadata;
        }
        let now = self.clock.now_millis();
        memory.updated_at = now;

        let mut previous: Vec<SectorVector> = Vec::new();
        if let (true, Some(content)) = (content_changed, update.content) {
            let class = self.classifier.classify(&content, Some(&memory.metadata));
            let (vectors, _) = self.embed_sectors(&content, &class.sectors()).await?;
            let (mean, compressed) = self.mean_and_compressed(&vectors);

            previous = with_timeout("vector fetch", self.call_timeout(), self.vectors.get_all(id)).await?;
            let rewritten = async {
                with_timeout("vector delete", self.call_timeout(), self.vectors.delete_all(id)).await?;
                self.write_vectors(id, &memory.owner_id, &vectors).await
            }
            .await;
            if let Err(e) = rewritten {
                self.restore_vectors(id, &previous).await;
                return Err(MemoryError::Transaction(e.to_string()));
            }

            memory.simhash = simhash::simhash_tokens(&self.normalizer.token_set(&content));
            memory.content = content;
            memory.primary_sector = class.primary;
            memory.decay_lambda = self.config.sectors.get(class.primary).decay_lambda;
            memory.mean_dim = mean.len();
            memory.mean_vector = mean;
            memory.compressed_vector = compressed;
            memory.version += 1;
        }

        let version = memory.version;
        let cfg = self.config.ingestion.clone();
        let committed = self
            .db
            .call(move |conn| store::commit_update(conn, &memory, content_changed, &cfg))
            .await;
        if let Err(e) = committed {
            if content_changed {
                self.restore_vectors(id, &previous).await;
            }
            return Err(MemoryError::Transaction(e.to_string()));
        }

        tracing::info!(id = %id, version, reembedded = content_changed, "memory updated");
        Ok(UpdateResult {
            id: id.to_string(),
            version,
            reembedded: content_changed,
        })
    }

    async fn restore_vectors(&self, id: &str, previous: &[SectorVector]) {
        self.compensate(id).await;
        for v in previous {
            if let Err(e) = self.vectors.upsert(&v.id, v.sector, &v.vector, &v.owner_id).await {
                tracing::error!(id = %id, sector = %v.sector, error = %e, "failed to restore vector");
            }
        }
    }

    /// Add `boost` (default 0.1) to a memory's salience. Crossing the
    /// consolidation threshold is logged and recorded.
    pub async fn reinforce(&self, id: &str, boost: Option<f64>) -> Result<f64> {
        let boost = boost.unwrap_or(self.dynamics.default_boost);
        if !(boost > 0.0 && boost <= 1.0) {
            return Err(MemoryError::Validation(format!("boost must be in (0, 1], got {boost}")));
        }
        let id = id.to_string();
        let dynamics = self.dynamics.clone();
        let now = self.clock.now_millis();
        self.db
            .call(move |conn| {
                let m = store::require_memory(conn, &id)?;
                let next = dynamics.reinforce(m.salience, boost);
                store::set_salience(conn, &id, next, now)?;
                let threshold = dynamics.consolidation_threshold;
                if m.salience < threshold && next >= threshold {
                    tracing::info!(id = %id, salience = next, "memory consolidated");
                    store::log_maintenance_op(
                        conn,
                        MaintenanceOp::Consolidate,
                        1,
                        Some(&serde_json::json!({ "id": id, "salience": next })),
                        now,
                    )?;
                }
                Ok(next)
            })
            .await
    }

    pub async fn get_memory(&self, id: &str) -> Result<Memory> {
        let id = id.to_string();
        self.db.call(move |conn| store::require_memory(conn, &id)).await
    }

    /// Remove a memory, its vectors, and every waypoint touching it.
    pub async fn delete_memory(&self, id: &str) -> Result<()> {
        let _ingest = self.ingest_lock.lock().await;
        let lookup = id.to_string();
        self.db.call(move |conn| store::require_memory(conn, &lookup).map(|_| ())).await?;

        with_timeout("vector delete", self.call_timeout(), self.vectors.delete_all(id)).await?;
        let target = id.to_string();
        self.db.call(move |conn| store::delete_memory(conn, &target)).await?;
        tracing::info!(id = %id, "memory deleted");
        Ok(())
    }

    // ── Explicit linking ─────────────────────────────────────────────────────

    /// Link a memory both ways to every same-sector vector at or above the
    /// similarity threshold. Returns the number of neighbors linked.
    pub async fn link_similar(&self, id: &str) -> Result<usize> {
        let memory = self.get_memory(id).await?;
        let own = with_timeout("vector fetch", self.call_timeout(), self.vectors.get_all(id)).await?;
        let mut linked = 0;
        for v in own {
            let existing = with_timeout(
                "vector fetch",
                self.call_timeout(),
                self.vectors.get_by_sector(v.sector),
            )
            .await?;
            let owner = memory.owner_id.clone();
            let cfg = self.config.waypoints.clone();
            let now = self.clock.now_millis();
            let mem_id = id.to_string();
            linked += self
                .db
                .call(move |conn| waypoints::link_same_sector(conn, &mem_id, &owner, &v.vector, &existing, &cfg, now))
                .await?;
        }
        Ok(linked)
    }

    /// Link a memory to a node for each of its sectors, both directions.
    pub async fn link_sectors(&self, id: &str) -> Result<usize> {
        let memory = self.get_memory(id).await?;
        let sectors: Vec<Sector> = with_timeout("vector fetch", self.call_timeout(), self.vectors.get_all(id))
            .await?
            .into_iter()
            .map(|v| v.sector)
            .collect();
        let cfg = self.config.waypoints.clone();
        let now = self.clock.now_millis();
        let mem_id = id.to_string();
        self.db
            .call(move |conn| waypoints::link_cross_sector(conn, &mem_id, &sectors, &memory.owner_id, &cfg, now))
            .await
    }

    /// Strengthen or create `id → related` edges. `base_weight` defaults to
    /// the configured contextual base.
    pub async fn link_contextual(&self, id: &str, related: &[String], base_weight: Option<f64>) -> Result<usize> {
        let memory = self.get_memory(id).await?;
        let base = base_weight.unwrap_or(self.config.waypoints.contextual_base);
        if !(0.0..=1.0).contains(&base) {
            return Err(MemoryError::Validation(format!("base weight must be in [0, 1], got {base}")));
        }
        let cfg = self.config.waypoints.clone();
        let now = self.clock.now_millis();
        let related = related.to_vec();
        let mem_id = id.to_string();
        self.db
            .call(move |conn| waypoints::link_contextual(conn, &mem_id, &related, &memory.owner_id, base, &cfg, now))
            .await
    }

    // ── Recall ───────────────────────────────────────────────────────────────

    fn admit(&self) -> Result<AdmissionGuard> {
        let max = self.config.retrieval.max_active;
        match self
            .active
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| (n < max).then_some(n + 1))
        {
            Ok(_) => Ok(AdmissionGuard {
                active: Arc::clone(&self.active),
            }),
            Err(active) => Err(MemoryError::AdmissionRejected { active, max }),
        }
    }

    fn cache_get(&self, key: &str) -> Option<Vec<QueryResult>> {
        let ttl_ms = self.config.retrieval.cache_ttl_secs as i64 * 1000;
        let now = self.clock.now_millis();
        let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        match cache.get(key) {
            Some(entry) if now - entry.stored_at < ttl_ms => Some(entry.results.clone()),
            Some(_) => {
                cache.pop(key);
                None
            }
            None => None,
        }
    }

    fn cache_put(&self, key: String, results: Vec<QueryResult>) {
        let stored_at = self.clock.now_millis();
        let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        cache.put(key, CachedQuery { stored_at, results });
    }

    /// Ranked recall of up to `k` memories.
    ///
    /// Fails fast with [`MemoryError::AdmissionRejected`] when `max_active`
    /// queries are already running. Results are cached for `cache_ttl_secs`;
    /// a cache hit has no side effects.
    pub async fn query(&self, text: &str, k: usize, filter: QueryFilter) -> Result<Vec<QueryResult>> {
        let _slot = self.admit()?;
        if k == 0 {
            return Err(MemoryError::Validation("k must be at least 1".into()));
        }

        let key = format!("{text}\u{1f}{k}\u{1f}{}", serde_json::to_string(&filter)?);
        if let Some(hit) = self.cache_get(&key) {
            tracing::debug!(k, results = hit.len(), "query cache hit");
            return Ok(hit);
        }

        let after_ms = self.config.retrieval.query_timeout_ms;
        let results = with_timeout("query", after_ms, self.run_query(text, k, &filter)).await?;
        self.cache_put(key, results.clone());
        Ok(results)
    }

    async fn run_query(&self, text: &str, k: usize, filter: &QueryFilter) -> Result<Vec<QueryResult>> {
        let retrieval = &self.config.retrieval;
        let prepared = PreparedQuery::new(text, k, filter, &self.classifier, self.normalizer.as_ref());
        tracing::debug!(
            primary = %prepared.class.primary,
            confidence = prepared.class.confidence,
            temporal = prepared.temporal,
            "query classified"
        );

        let query_vectors = with_timeout(
            "embedding",
            self.call_timeout(),
            self.embedder.embed_all(text, &prepared.sectors),
        )
        .await?;

        let mut hits = BTreeMap::new();
        for sector in &prepared.sectors {
            let Some(v) = query_vectors.get(sector) else {
                continue;
            };
            let found = with_timeout(
                "vector search",
                self.call_timeout(),
                self.vectors
                    .search(*sector, v, k * retrieval.candidate_multiplier, filter.owner_id.as_deref()),
            )
            .await?;
            hits.insert(*sector, found);
        }
        let avg_top = query::avg_top_similarity(&hits);

        let expansions: Vec<Expansion> = if avg_top < retrieval.expansion_threshold {
            let seeds = query::union_ids(&hits, &[]);
            let cfg = self.config.waypoints.clone();
            let budget = k * 2;
            self.db
                .call(move |conn| waypoints::expand_via_waypoints(conn, &seeds, budget, &cfg))
                .await?
        } else {
            Vec::new()
        };

        let ids = query::union_ids(&hits, &expansions);
        let memories: Vec<Memory> = self
            .db
            .call(move |conn| {
                let mut out = Vec::with_capacity(ids.len());
                for id in &ids {
                    if let Some(m) = store::get_memory(conn, id)? {
                        out.push(m);
                    }
                }
                Ok(out)
            })
            .await?;

        let keyword_scores: HashMap<String, f64> = if retrieval.tier == RetrievalTier::Hybrid {
            KeywordQuery::new(self.normalizer.as_ref(), text, self.config.scoring.keyword_min_length).score_all(
                self.normalizer.as_ref(),
                memories.iter().map(|m| (m.id.as_str(), m.content.as_str())),
            )
        } else {
            HashMap::new()
        };

        let mut expansion_by_id: HashMap<String, Expansion> =
            expansions.into_iter().map(|e| (e.id.clone(), e)).collect();
        let mut candidates = Vec::with_capacity(memories.len());
        for memory in memories {
            if !query::passes_filter(filter, &memory) {
                continue;
            }
            let vectors = with_timeout("vector fetch", self.call_timeout(), self.vectors.get_all(&memory.id)).await?;
            candidates.push(Candidate {
                keyword: keyword_scores.get(&memory.id).copied().unwrap_or(0.0),
                expansion: expansion_by_id.remove(&memory.id),
                vectors,
                memory,
            });
        }

        let now = self.clock.now_millis();
        let scorer = CandidateScorer {
            scorer: &self.scorer,
            dynamics: &self.dynamics,
            normalizer: self.normalizer.as_ref(),
            query: &prepared,
            query_vectors: &query_vectors,
            hits: &hits,
            now,
        };
        let scored: Vec<QueryResult> = candidates.iter().map(|c| scorer.score(c)).collect();
        let top = query::rank(scored, k, avg_top);

        let stale: Vec<(String, String, Sector, String)> = top
            .iter()
            .filter_map(|r| {
                let c = candidates.iter().find(|c| c.memory.id == r.id)?;
                let dim = self.embedder.dimensions();
                let fresh = c
                    .vectors
                    .iter()
                    .any(|v| v.sector == c.memory.primary_sector && v.dim() == dim);
                (!fresh).then(|| {
                    (
                        c.memory.id.clone(),
                        c.memory.content.clone(),
                        c.memory.primary_sector,
                        c.memory.owner_id.clone(),
                    )
                })
            })
            .collect();

        self.apply_recall_effects(&top, now).await?;
        for (id, content, sector, owner) in stale {
            self.spawn_refresh(id, content, sector, owner);
        }

        tracing::debug!(
            candidates = candidates.len(),
            returned = top.len(),
            avg_top,
            "query complete"
        );
        Ok(top)
    }

    /// Feedback, co-activation, trace reinforcement and neighbor propagation
    /// for the returned memories only.
    async fn apply_recall_effects(&self, top: &[QueryResult], now: i64) -> Result<()> {
        if top.is_empty() {
            return Ok(());
        }
        let ids: Vec<String> = top.iter().map(|r| r.id.clone()).collect();
        self.coactivations.push_all(query::coactivation_pairs(&ids));

        let top = top.to_vec();
        let dynamics = self.dynamics.clone();
        let cfg = self.config.waypoints.clone();
        self.db
            .call(move |conn| {
                let tx = conn.transaction()?;
                for r in &top {
                    let Some(m) = store::get_memory(&tx, &r.id)? else {
                        continue;
                    };
                    store::set_feedback(&tx, &r.id, dynamics.feedback_ema(m.feedback_score, r.score))?;
                    let reinforced = dynamics.trace_reinforce(r.salience);
                    store::mark_seen(&tx, &r.id, reinforced, now)?;

                    if r.path.len() > 1 {
                        waypoints::reinforce_path(&tx, &r.path, &cfg, now)?;
                        for edge in waypoints::outgoing(&tx, &r.id)? {
                            let Some(neighbor) = store::get_memory(&tx, &edge.dst_id)? else {
                                continue;
                            };
                            let idle = days_between(neighbor.last_seen_at, now);
                            let boosted = dynamics.propagate_to_neighbor(reinforced, neighbor.salience, idle);
                            if boosted != neighbor.salience {
                                store::set_salience(&tx, &neighbor.id, boosted, now)?;
                            }
                        }
                    }
                }
                tx.commit()?;
                Ok(())
            })
            .await
    }

    /// Re-embed a memory's primary sector in the background. Failures are
    /// logged and dropped.
    fn spawn_refresh(&self, id: String, content: String, sector: Sector, owner_id: String) {
        let embedder = Arc::clone(&self.embedder);
        let vectors = Arc::clone(&self.vectors);
        let after_ms = self.call_timeout();
        tokio::spawn(async move {
            let refreshed = async {
                let v = with_timeout("embedding", after_ms, embedder.embed(&content, sector)).await?;
                with_timeout("vector upsert", after_ms, vectors.upsert(&id, sector, &v, &owner_id)).await
            }
            .await;
            match refreshed {
                Ok(()) => tracing::debug!(id = %id, sector = %sector, "embedding refreshed"),
                Err(e) => tracing::debug!(id = %id, error = %e, "embedding refresh failed"),
            }
        });
    }

    // ── Maintenance ──────────────────────────────────────────────────────────

    pub async fn run_decay(&self) -> Result<DecayReport> {
        let dynamics = self.dynamics.clone();
        let batch = self.config.maintenance.decay_batch;
        let segment_aware = self.config.dynamics.segment_aware_decay;
        let now = self.clock.now_millis();
        self.db
            .call(move |conn| maintenance::run_decay_sweep(conn, &dynamics, batch, segment_aware, now))
            .await
    }

    pub async fn prune(&self) -> Result<usize> {
        let cfg = self.config.waypoints.clone();
        let now = self.clock.now_millis();
        self.db.call(move |conn| maintenance::prune_graph(conn, &cfg, now)).await
    }

    pub async fn flush_coactivations(&self) -> Result<usize> {
        if self.coactivations.is_empty() {
            return Ok(0);
        }
        let buffer = Arc::clone(&self.coactivations);
        let cfg = self.config.waypoints.clone();
        let now = self.clock.now_millis();
        self.db
            .call(move |conn| maintenance::flush_coactivations(conn, &buffer, &cfg, now))
            .await
    }

    /// Turn clusters of similar recent memories into reflective memories.
    pub async fn run_reflection(&self) -> Result<ReflectionReport> {
        let cfg = self.config.maintenance.clone();
        let window = cfg.reflect_window;
        let recent = self.db.call(move |conn| store::list_recent(conn, window)).await?;
        if recent.len() < cfg.reflect_min_memories {
            tracing::debug!(found = recent.len(), needed = cfg.reflect_min_memories, "reflection skipped");
            return Ok(ReflectionReport {
                created: 0,
                clusters: 0,
                skipped: Some(format!(
                    "{} memories, need {}",
                    recent.len(),
                    cfg.reflect_min_memories
                )),
            });
        }

        let clusters = maintenance::cluster_memories(&recent, cfg.reflect_similarity);
        let mut created = 0;
        for cluster in &clusters {
            let now = self.clock.now_millis();
            let sources = cluster.ids();
            let salience = maintenance::reflection_salience(cluster, now);
            let metadata = serde_json::json!({
                "type": "auto_reflect",
                "sector": Sector::Reflective.as_str(),
                "sources": sources,
                "freq": sources.len(),
                "at": self.clock.now().to_rfc3339(),
            });
            let ingested = self
                .add_memory(
                    NewMemory::new(maintenance::reflection_text(cluster))
                        .with_tags(["reflect:auto"])
                        .with_metadata(metadata)
                        .with_owner(cluster.members[0].owner_id.clone()),
                )
                .await?;

            let reflection_id = ingested.id.clone();
            let fresh = !ingested.deduplicated;
            self.db
                .call(move |conn| {
                    if fresh {
                        store::set_salience(conn, &reflection_id, salience, now)?;
                    }
                    maintenance::mark_consolidated(conn, &sources, now)
                })
                .await?;
            tracing::info!(id = %ingested.id, sources = cluster.members.len(), salience, "reflection created");
            created += 1;
        }

        if created > 0 {
            let now = self.clock.now_millis();
            let clusters_found = clusters.len();
            self.db
                .call(move |conn| {
                    store::log_maintenance_op(
                        conn,
                        MaintenanceOp::Reflect,
                        created,
                        Some(&serde_json::json!({ "clusters": clusters_found })),
                        now,
                    )
                })
                .await?;
        }
        Ok(ReflectionReport {
            created,
            clusters: clusters.len(),
            skipped: None,
        })
    }

    pub async fn refresh_profiles(&self) -> Result<usize> {
        let now = self.clock.now_millis();
        self.db.call(move |conn| profile::refresh_profiles(conn, now)).await
    }

    pub async fn profile(&self, owner_id: &str) -> Result<Option<OwnerProfile>> {
        let owner = owner_id.to_string();
        self.db.call(move |conn| profile::get_profile(conn, &owner)).await
    }

    pub async fn stats(&self) -> Result<StatsResponse> {
        let backend = self.vectors.name();
        let path = self.db_path.clone();
        self.db
            .call(move |conn| stats::store_stats(conn, backend, path.as_deref()))
            .await
    }

    /// One pass of every maintenance job, in order.
    pub async fn maintain_once(&self) -> Result<MaintenanceReport> {
        Ok(MaintenanceReport {
            decay: self.run_decay().await?,
            pruned: self.prune().await?,
            coactivated: self.flush_coactivations().await?,
            reflection: self.run_reflection().await?,
            profiles: self.refresh_profiles().await?,
        })
    }

    /// Start the background scheduler. Jobs stop when the handle is shut
    /// down or dropped.
    pub fn start_maintenance(self: &Arc<Self>) -> MaintenanceHandle {
        maintenance::start(Arc::clone(self), &self.config.maintenance)
    }
}
