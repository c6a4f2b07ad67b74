//! Core memory type definitions.
//!
//! Defines [`Sector`] (the five cognitive sectors), [`Memory`] (a full stored
//! record), [`Waypoint`] (an associative graph edge), and the request/result
//! types that flow through ingestion and recall.

use serde::{Deserialize, Serialize};

/// The five cognitive sectors a memory can belong to.
///
/// Declaration order matters: it is the tie-break order for classification and
/// the row/column order of the resonance matrix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Sector {
    /// Events and experiences anchored in time.
    Episodic,
    /// Facts, definitions, general knowledge.
    Semantic,
    /// How-to knowledge, steps, instructions.
    Procedural,
    /// Feelings and affect.
    Emotional,
    /// Insights, lessons, conclusions.
    Reflective,
}

impl Sector {
    pub const ALL: [Sector; 5] = [
        Self::Episodic,
        Self::Semantic,
        Self::Procedural,
        Self::Emotional,
        Self::Reflective,
    ];

    /// SQL-compatible string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Episodic => "episodic",
            Self::Semantic => "semantic",
            Self::Procedural => "procedural",
            Self::Emotional => "emotional",
            Self::Reflective => "reflective",
        }
    }

    /// Position in [`Sector::ALL`].
    pub fn index(&self) -> usize {
        match self {
            Self::Episodic => 0,
            Self::Semantic => 1,
            Self::Procedural => 2,
            Self::Emotional => 3,
            Self::Reflective => 4,
        }
    }
}

impl std::fmt::Display for Sector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Sector {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "episodic" => Ok(Self::Episodic),
            "semantic" => Ok(Self::Semantic),
            "procedural" => Ok(Self::Procedural),
            "emotional" => Ok(Self::Emotional),
            "reflective" => Ok(Self::Reflective),
            _ => Err(format!("unknown sector: {s}")),
        }
    }
}

/// Retrieval configuration mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetrievalTier {
    /// Vector and graph signals only.
    Fast,
    /// Like `Fast`, and also persists a pooled low-dimension copy of each mean vector.
    Smart,
    /// Adds keyword and BM25 scoring on top of the vector pipeline.
    Hybrid,
}

impl std::str::FromStr for RetrievalTier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "fast" => Ok(Self::Fast),
            "smart" => Ok(Self::Smart),
            "hybrid" => Ok(Self::Hybrid),
            _ => Err(format!("unknown retrieval tier: {s}")),
        }
    }
}

/// Output of the sector classifier.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SectorClass {
    pub primary: Sector,
    /// Secondary sectors, strongest first.
    pub additional: Vec<Sector>,
    /// In `[0.0, 1.0]`.
    pub confidence: f64,
}

impl SectorClass {
    /// Primary sector followed by the additional ones.
    pub fn sectors(&self) -> Vec<Sector> {
        let mut all = Vec::with_capacity(1 + self.additional.len());
        all.push(self.primary);
        all.extend(self.additional.iter().copied());
        all
    }

    /// `true` if `sector` is the primary or one of the additional sectors.
    pub fn contains(&self, sector: Sector) -> bool {
        self.primary == sector || self.additional.contains(&sector)
    }
}

/// A memory record, matching the `memories` table.
#[derive(Debug, Clone, Serialize)]
pub struct Memory {
    /// UUID v7, never reused.
    pub id: String,
    pub owner_id: String,
    /// Append-only bucket the memory was written into.
    pub segment: i64,
    /// Stored text, possibly shortened at ingest.
    pub content: String,
    /// 64-bit near-duplicate fingerprint.
    pub simhash: u64,
    pub primary_sector: Sector,
    pub tags: Vec<String>,
    pub metadata: serde_json::Value,
    /// Epoch milliseconds.
    pub created_at: i64,
    pub updated_at: i64,
    pub last_seen_at: i64,
    /// Retrieval-worthiness in `[0.0, 1.0]`.
    pub salience: f64,
    pub decay_lambda: f64,
    /// Starts at 1, incremented on every content edit.
    pub version: i64,
    pub mean_dim: usize,
    #[serde(skip)]
    pub mean_vector: Vec<f32>,
    #[serde(skip)]
    pub compressed_vector: Option<Vec<f32>>,
    /// Exponential moving average of past relevance scores.
    pub feedback_score: f64,
}

/// A directed, weighted associative edge between two memories.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Waypoint {
    pub src_id: String,
    pub dst_id: String,
    pub owner_id: String,
    pub weight: f64,
    pub created_at: i64,
    pub updated_at: i64,
}

/// One sector's embedding for one memory.
#[derive(Debug, Clone, PartialEq)]
pub struct SectorVector {
    pub id: String,
    pub sector: Sector,
    pub owner_id: String,
    pub vector: Vec<f32>,
}

impl SectorVector {
    pub fn dim(&self) -> usize {
        self.vector.len()
    }
}

/// Input to [`crate::engine::MemoryEngine::add_memory`].
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NewMemory {
    pub content: String,
    #[serde(default)]
    pub tags: Vec<String>,
    /// A `"sector"` key naming a valid sector overrides classification.
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
    #[serde(default)]
    pub owner_id: Option<String>,
}

impl NewMemory {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..Default::default()
        }
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn with_owner(mut self, owner_id: impl Into<String>) -> Self {
        self.owner_id = Some(owner_id.into());
        self
    }
}

/// Partial edit applied by [`crate::engine::MemoryEngine::update_memory`].
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MemoryUpdate {
    pub content: Option<String>,
    pub tags: Option<Vec<String>>,
    pub metadata: Option<serde_json::Value>,
}

/// Result of an ingest call.
#[derive(Debug, Clone, Serialize)]
pub struct IngestResult {
    /// Id of the new memory, or of the existing one it was merged into.
    pub id: String,
    pub primary_sector: Sector,
    pub sectors: Vec<Sector>,
    /// Number of chunks the content was embedded as. 0 when deduplicated.
    pub chunks: usize,
    pub deduplicated: bool,
}

/// Result of an update call.
#[derive(Debug, Clone, Serialize)]
pub struct UpdateResult {
    pub id: String,
    pub version: i64,
    /// `true` if the content changed and vectors were rewritten.
    pub reembedded: bool,
}

/// Optional constraints on a query.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryFilter {
    /// Restrict the vector search to these sectors. Empty means all sectors.
    #[serde(default)]
    pub sectors: Vec<Sector>,
    pub min_salience: Option<f64>,
    pub owner_id: Option<String>,
    /// Inclusive lower bound on `created_at`, epoch milliseconds.
    pub start_time: Option<i64>,
    /// Inclusive upper bound on `created_at`, epoch milliseconds.
    pub end_time: Option<i64>,
}

/// One ranked recall result. Not persisted.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryResult {
    pub id: String,
    pub content: String,
    pub score: f64,
    pub sectors: Vec<Sector>,
    pub primary_sector: Sector,
    /// Graph path from the seed that reached this memory. A direct hit is `[id]`.
    pub path: Vec<String>,
    pub salience: f64,
    pub last_seen_at: i64,
    pub tags: Vec<String>,
    pub metadata: serde_json::Value,
}
