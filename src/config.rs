use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::memory::types::{RetrievalTier, Sector};

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct StrataConfig {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub embedding: EmbeddingConfig,
    pub sectors: SectorsConfig,
    pub scoring: ScoringConfig,
    pub retrieval: RetrievalConfig,
    pub ingestion: IngestionConfig,
    pub dynamics: DynamicsConfig,
    pub waypoints: WaypointConfig,
    pub maintenance: MaintenanceConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub log_level: String,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct StorageConfig {
    pub db_path: String,
    pub default_owner: String,
    /// `"sqlite"` (brute force) or `"sqlite-vec"` (vec0 index).
    pub vector_backend: String,
    pub busy_timeout_ms: u64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct EmbeddingConfig {
    pub provider: String,
    pub dimensions: usize,
    /// Upper bound on any single embedding or vector-store call.
    pub call_timeout_ms: u64,
}

/// Pattern set, weight and decay rate for one sector.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SectorConfig {
    pub weight: f64,
    pub decay_lambda: f64,
    /// Case-insensitive regular expressions.
    pub patterns: Vec<String>,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SectorsConfig {
    pub episodic: SectorConfig,
    pub semantic: SectorConfig,
    pub procedural: SectorConfig,
    pub emotional: SectorConfig,
    pub reflective: SectorConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ScoringConfig {
    pub similarity: f64,
    pub overlap: f64,
    pub waypoint: f64,
    pub recency: f64,
    pub tag_match: f64,
    /// Similarity boost steepness.
    pub tau: f64,
    pub recency_days: f64,
    pub recency_max_days: f64,
    /// Past `recency_max_days` the raw recency term goes negative. `true` clamps it to 0.
    pub clamp_recency: bool,
    pub keyword_boost: f64,
    pub keyword_min_length: usize,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RetrievalConfig {
    pub tier: RetrievalTier,
    pub default_k: usize,
    /// Hard cap on concurrently running queries.
    pub max_active: usize,
    pub cache_ttl_secs: u64,
    pub cache_capacity: usize,
    pub query_timeout_ms: u64,
    /// Graph expansion runs only when the average top similarity is below this.
    pub expansion_threshold: f64,
    /// Vector hits fetched per sector, as a multiple of `k`.
    pub candidate_multiplier: usize,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct IngestionConfig {
    pub segment_size: i64,
    /// Content longer than this goes through the summarizer. 0 disables it.
    pub summary_max_length: usize,
    pub chunk_target_tokens: usize,
    pub chunk_overlap: f64,
    pub seed_scan_limit: usize,
    pub softmax_beta: f64,
    pub initial_salience: f64,
    pub salience_per_sector: f64,
    pub dedup_boost: f64,
    pub dedup_max_distance: u32,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct DynamicsConfig {
    /// Retrieval-trace reinforcement rate.
    pub trace_eta: f64,
    /// Floor added back during decay.
    pub alpha_reinforce: f64,
    pub reinforce_boost: f64,
    pub consolidation_threshold: f64,
    /// Weight of the newest score in the feedback moving average.
    pub feedback_alpha: f64,
    pub neighbor_gamma: f64,
    pub neighbor_decay_per_day: f64,
    pub segment_aware_decay: bool,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct WaypointConfig {
    pub same_sector_threshold: f64,
    pub link_weight: f64,
    pub contextual_increment: f64,
    pub contextual_base: f64,
    pub reinforce_increment: f64,
    pub expansion_decay: f64,
    pub expansion_floor: f64,
    pub prune_threshold: f64,
    pub coactivation_eta: f64,
    pub coactivation_tau_hours: f64,
    pub coactivation_batch: usize,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct MaintenanceConfig {
    pub enabled: bool,
    pub decay_interval_minutes: u64,
    pub initial_decay_delay_secs: u64,
    pub decay_batch: usize,
    pub prune_interval_hours: u64,
    pub coactivation_interval_ms: u64,
    pub auto_reflect: bool,
    pub reflect_interval_minutes: u64,
    pub reflect_min_memories: usize,
    pub reflect_window: usize,
    pub reflect_similarity: f64,
    pub profile_interval_minutes: u64,
}

impl Default for StrataConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            storage: StorageConfig::default(),
            embedding: EmbeddingConfig::default(),
            sectors: SectorsConfig::default(),
            scoring: ScoringConfig::default(),
            retrieval: RetrievalConfig::default(),
            ingestion: IngestionConfig::default(),
            dynamics: DynamicsConfig::default(),
            waypoints: WaypointConfig::default(),
            maintenance: MaintenanceConfig::default(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            log_level: "info".into(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        let db_path = default_strata_dir()
            .join("memory.db")
            .to_string_lossy()
            .into_owned();
        Self {
            db_path,
            default_owner: "anonymous".into(),
            vector_backend: "sqlite".into(),
            busy_timeout_ms: 5000,
        }
    }
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: "synthetic".into(),
            dimensions: 256,
            call_timeout_ms: 10_000,
        }
    }
}

impl Default for SectorConfig {
    fn default() -> Self {
        Self {
            weight: 1.0,
            decay_lambda: 0.005,
            patterns: Vec::new(),
        }
    }
}

fn patterns(list: &[&str]) -> Vec<String> {
    list.iter().map(|p| p.to_string()).collect()
}

impl Default for SectorsConfig {
    fn default() -> Self {
        Self {
            episodic: SectorConfig {
                weight: 1.2,
                decay_lambda: 0.015,
                patterns: patterns(&[
                    r"\b(today|yesterday|tomorrow|last\s+(week|month|year)|next\s+(week|month|year))\b",
                    r"\b(remember\s+when|recall|that\s+time|when\s+I|I\s+was|we\s+were)\b",
                    r"\b(went|saw|met|felt|heard|visited|attended|participated)\b",
                    r"\b(at\s+\d{1,2}:\d{2}|on\s+(monday|tuesday|wednesday|thursday|friday|saturday|sunday))\b",
                    r"\b(event|moment|experience|incident|occurrence|happened)\b",
                    r"\bI\s+'?m\s+going\s+to\b",
                ]),
            },
            semantic: SectorConfig {
                weight: 1.0,
                decay_lambda: 0.005,
                patterns: patterns(&[
                    r"\b(is\s+a|represents|means|stands\s+for|defined\s+as)\b",
                    r"\b(concept|theory|principle|law|hypothesis|theorem|axiom)\b",
                    r"\b(fact|statistic|data|evidence|proof|research|study|report)\b",
                    r"\b(capital|population|distance|weight|height|width|depth)\b",
                    r"\b(history|science|geography|math|physics|biology|chemistry)\b",
                    r"\b(know|understand|learn|read|write|speak)\b",
                ]),
            },
            procedural: SectorConfig {
                weight: 1.1,
                decay_lambda: 0.008,
                patterns: patterns(&[
                    r"\b(how\s+to|step\s+by\s+step|guide|tutorial|manual|instructions)\b",
                    r"\b(first|second|then|next|finally|afterwards|lastly)\b",
                    r"\b(install|run|execute|compile|build|deploy|configure|setup)\b",
                    r"\b(click|press|type|enter|select|drag|drop|scroll)\b",
                    r"\b(method|function|class|algorithm|routine|recipe)\b",
                    r"\b(to\s+do|to\s+make|to\s+build|to\s+create)\b",
                ]),
            },
            emotional: SectorConfig {
                weight: 1.3,
                decay_lambda: 0.02,
                patterns: patterns(&[
                    r"\b(feel|feeling|felt|emotions?|mood|vibe)\b",
                    r"\b(happy|sad|angry|mad|excited|scared|anxious|nervous|depressed)\b",
                    r"\b(love|hate|like|dislike|adore|detest|enjoy|loathe)\b",
                    r"\b(amazing|terrible|awesome|awful|wonderful|horrible|great|bad)\b",
                    r"\b(frustrated|confused|overwhelmed|stressed|relaxed|calm)\b",
                    r"\b(wow|omg|yay|nooo|ugh|sigh)\b",
                    r"!{2,}",
                ]),
            },
            reflective: SectorConfig {
                weight: 0.8,
                decay_lambda: 0.001,
                patterns: patterns(&[
                    r"\b(realize|realized|realization|insight|epiphany)\b",
                    r"\b(think|thought|thinking|ponder|contemplate|reflect)\b",
                    r"\b(understand|understood|understanding|grasp|comprehend)\b",
                    r"\b(pattern|trend|connection|link|relationship|correlation)\b",
                    r"\b(lesson|moral|takeaway|conclusion|summary|implication)\b",
                    r"\b(feedback|review|analysis|evaluation|assessment)\b",
                    r"\b(improve|grow|change|adapt|evolve)\b",
                ]),
            },
        }
    }
}

impl SectorsConfig {
    pub fn get(&self, sector: Sector) -> &SectorConfig {
        match sector {
            Sector::Episodic => &self.episodic,
            Sector::Semantic => &self.semantic,
            Sector::Procedural => &self.procedural,
            Sector::Emotional => &self.emotional,
            Sector::Reflective => &self.reflective,
        }
    }
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            similarity: 0.35,
            overlap: 0.20,
            waypoint: 0.15,
            recency: 0.10,
            tag_match: 0.20,
            tau: 3.0,
            recency_days: 7.0,
            recency_max_days: 60.0,
            clamp_recency: false,
            keyword_boost: 2.5,
            keyword_min_length: 3,
        }
    }
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            tier: RetrievalTier::Hybrid,
            default_k: 10,
            max_active: 64,
            cache_ttl_secs: 60,
            cache_capacity: 500,
            query_timeout_ms: 30_000,
            expansion_threshold: 0.55,
            candidate_multiplier: 3,
        }
    }
}

impl Default for IngestionConfig {
    fn default() -> Self {
        Self {
            segment_size: 10_000,
            summary_max_length: 1000,
            chunk_target_tokens: 768,
            chunk_overlap: 0.1,
            seed_scan_limit: 1000,
            softmax_beta: 2.0,
            initial_salience: 0.4,
            salience_per_sector: 0.1,
            dedup_boost: 0.15,
            dedup_max_distance: 3,
        }
    }
}

impl Default for DynamicsConfig {
    fn default() -> Self {
        Self {
            trace_eta: 0.18,
            alpha_reinforce: 0.08,
            reinforce_boost: 0.1,
            consolidation_threshold: 0.8,
            feedback_alpha: 0.1,
            neighbor_gamma: 0.2,
            neighbor_decay_per_day: 0.02,
            segment_aware_decay: false,
        }
    }
}

impl Default for WaypointConfig {
    fn default() -> Self {
        Self {
            same_sector_threshold: 0.75,
            link_weight: 0.5,
            contextual_increment: 0.1,
            contextual_base: 0.3,
            reinforce_increment: 0.05,
            expansion_decay: 0.8,
            expansion_floor: 0.1,
            prune_threshold: 0.05,
            coactivation_eta: 0.1,
            coactivation_tau_hours: 1.0,
            coactivation_batch: 50,
        }
    }
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            decay_interval_minutes: 1440,
            initial_decay_delay_secs: 3,
            decay_batch: 10_000,
            prune_interval_hours: 168,
            coactivation_interval_ms: 1000,
            auto_reflect: false,
            reflect_interval_minutes: 10,
            reflect_min_memories: 20,
            reflect_window: 100,
            reflect_similarity: 0.8,
            profile_interval_minutes: 30,
        }
    }
}

/// Returns `~/.strata/`, or `./.strata/` when there is no home directory.
pub fn default_strata_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".strata")
}

/// Returns the default config file path: `~/.strata/config.toml`
pub fn default_config_path() -> PathBuf {
    default_strata_dir().join("config.toml")
}

impl StrataConfig {
    /// Load config from TOML file (if it exists) then apply env var overrides.
    pub fn load() -> Result<Self> {
        Self::load_from(default_config_path())
    }

    /// Load from a specific path, then apply env var overrides.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut config = if path.exists() {
            let contents =
                std::fs::read_to_string(path).context("failed to read config file")?;
            toml::from_str(&contents).context("failed to parse config TOML")?
        } else {
            info!("no config file at {}, using defaults", path.display());
            StrataConfig::default()
        };

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Apply environment variable overrides (STRATA_DB, STRATA_OWNER,
    /// STRATA_LOG_LEVEL, STRATA_TIER, STRATA_MAX_ACTIVE).
    fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var("STRATA_DB") {
            self.storage.db_path = val;
        }
        if let Ok(val) = std::env::var("STRATA_OWNER") {
            self.storage.default_owner = val;
        }
        if let Ok(val) = std::env::var("STRATA_LOG_LEVEL") {
            self.server.log_level = val;
        }
        if let Ok(val) = std::env::var("STRATA_TIER") {
            match val.parse() {
                Ok(tier) => self.retrieval.tier = tier,
                Err(e) => tracing::warn!(value = %val, "ignoring STRATA_TIER: {e}"),
            }
        }
        if let Ok(val) = std::env::var("STRATA_MAX_ACTIVE") {
            match val.parse() {
                Ok(n) => self.retrieval.max_active = n,
                Err(_) => tracing::warn!(value = %val, "ignoring non-numeric STRATA_MAX_ACTIVE"),
            }
        }
    }

    /// Reject values the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.embedding.dimensions == 0 {
            bail!("embedding.dimensions must be positive");
        }
        if self.retrieval.max_active == 0 {
            bail!("retrieval.max_active must be at least 1");
        }
        if self.ingestion.segment_size <= 0 {
            bail!("ingestion.segment_size must be positive");
        }
        if !(0.0..1.0).contains(&self.ingestion.chunk_overlap) {
            bail!("ingestion.chunk_overlap must be in [0, 1)");
        }
        for sector in Sector::ALL {
            let cfg = self.sectors.get(sector);
            if cfg.weight < 0.0 || cfg.decay_lambda < 0.0 {
                bail!("sector {sector} has a negative weight or decay rate");
            }
        }
        match self.storage.vector_backend.as_str() {
            "sqlite" | "sqlite-vec" => Ok(()),
            other => bail!("unknown vector backend: {other}. Supported: sqlite, sqlite-vec"),
        }
    }

    /// Resolve the database path, expanding `~` if needed.
    pub fn resolved_db_path(&self) -> PathBuf {
        expand_tilde(&self.storage.db_path)
    }
}

pub fn expand_tilde(path: &str) -> PathBuf {
    match (path.strip_prefix("~/"), dirs::home_dir()) {
        (Some(rest), Some(home)) => home.join(rest),
        _ => PathBuf::from(path),
    }
}
