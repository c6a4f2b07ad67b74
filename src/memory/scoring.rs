//! Hybrid relevance scoring.
//!
//! Blends boosted vector similarity, token overlap, waypoint weight, recency,
//! tag affinity and (under the hybrid tier) a keyword score into one
//! sigmoid-bounded value, then z-normalizes the ranked pool.

use std::collections::{BTreeSet, HashMap};

use crate::config::ScoringConfig;
use crate::embedding::cosine_similarity;
use crate::memory::types::{Sector, SectorVector};

const EPSILON: f64 = 1e-8;

/// Per-candidate inputs to [`HybridScorer::score`].
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ScoreSignals {
    /// Raw similarity after the cross-sector penalty.
    pub similarity: f64,
    pub overlap: f64,
    pub waypoint: f64,
    pub recency: f64,
    pub tag_match: f64,
    /// Keyword score already multiplied by the configured boost.
    pub keyword: f64,
}

#[derive(Debug, Clone)]
pub struct HybridScorer {
    cfg: ScoringConfig,
}

impl HybridScorer {
    pub fn new(cfg: &ScoringConfig) -> Self {
        Self { cfg: cfg.clone() }
    }

    /// `1 - e^(-tau * sim)`
    pub fn boosted_similarity(&self, sim: f64) -> f64 {
        1.0 - (-self.cfg.tau * sim).exp()
    }

    /// `e^(-d/T) * (1 - d/T_max)`. Negative past `T_max` unless `clamp_recency` is set.
    pub fn recency(&self, days: f64) -> f64 {
        let days = days.max(0.0);
        let raw = (-days / self.cfg.recency_days).exp() * (1.0 - days / self.cfg.recency_max_days);
        if self.cfg.clamp_recency {
            raw.clamp(0.0, 1.0)
        } else {
            raw
        }
    }

    pub fn keyword_boost(&self) -> f64 {
        self.cfg.keyword_boost
    }

    pub fn score(&self, s: &ScoreSignals) -> f64 {
        let raw = self.cfg.similarity * self.boosted_similarity(s.similarity)
            + self.cfg.overlap * s.overlap
            + self.cfg.waypoint * s.waypoint
            + self.cfg.recency * s.recency
            + self.cfg.tag_match * s.tag_match
            + s.keyword;
        sigmoid(raw)
    }
}

pub fn sigmoid(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}

/// Share of query tokens present in the memory. 0 for an empty query.
pub fn token_overlap(query: &BTreeSet<String>, memory: &BTreeSet<String>) -> f64 {
    if query.is_empty() {
        return 0.0;
    }
    query.iter().filter(|t| memory.contains(*t)).count() as f64 / query.len() as f64
}

/// Tag affinity: an exact tag hit scores 2, otherwise every query token that
/// contains or is contained in the tag scores 1. Normalized by twice the tag count.
pub fn tag_match(query_tokens: &BTreeSet<String>, tags: &[String]) -> f64 {
    if tags.is_empty() {
        return 0.0;
    }
    let mut matches = 0usize;
    for tag in tags {
        let tag = tag.to_lowercase();
        if query_tokens.contains(&tag) {
            matches += 2;
        } else {
            matches += query_tokens
                .iter()
                .filter(|t| tag.contains(t.as_str()) || t.contains(tag.as_str()))
                .count();
        }
    }
    (matches as f64 / (2 * tags.len()) as f64).min(1.0)
}

/// How strongly a memory in `memory` relates to a query classified as `query`.
/// 1.0 for the same sector, 0.3 for pairs without an entry.
pub fn relationship_weight(query: Sector, memory: Sector) -> f64 {
    use Sector::*;
    match (query, memory) {
        (a, b) if a == b => 1.0,
        (Semantic, Procedural) | (Procedural, Semantic) => 0.8,
        (Semantic, Episodic) => 0.6,
        (Semantic, Reflective) => 0.7,
        (Semantic, Emotional) => 0.4,
        (Procedural, Episodic) | (Procedural, Reflective) => 0.6,
        (Procedural, Emotional) => 0.3,
        (Episodic, Reflective) => 0.8,
        (Episodic, Semantic) | (Episodic, Procedural) => 0.6,
        (Episodic, Emotional) => 0.7,
        (Reflective, Episodic) => 0.8,
        (Reflective, Semantic) => 0.7,
        (Reflective, Procedural) | (Reflective, Emotional) => 0.6,
        (Emotional, Episodic) => 0.7,
        (Emotional, Reflective) => 0.6,
        (Emotional, Semantic) => 0.4,
        (Emotional, Procedural) => 0.3,
        _ => 0.3,
    }
}

/// Row: memory sector, column: query sector, both in [`Sector::ALL`] order.
const RESONANCE: [[f64; 5]; 5] = [
    [1.0, 0.7, 0.3, 0.6, 0.6],
    [0.7, 1.0, 0.4, 0.7, 0.8],
    [0.3, 0.4, 1.0, 0.5, 0.2],
    [0.6, 0.7, 0.5, 1.0, 0.8],
    [0.6, 0.8, 0.2, 0.8, 1.0],
];

pub fn resonance(memory: Sector, query: Sector) -> f64 {
    RESONANCE[memory.index()][query.index()]
}

/// Weight of one sector's similarity in multi-vector fusion. The query's
/// primary sector gets the larger value.
pub fn fusion_weight(sector: Sector, query_primary: Sector) -> f64 {
    let favored = sector == query_primary;
    match sector {
        Sector::Semantic => if favored { 1.2 } else { 0.8 },
        Sector::Emotional => if favored { 1.5 } else { 0.6 },
        Sector::Procedural => if favored { 1.3 } else { 0.7 },
        Sector::Episodic => if favored { 1.4 } else { 0.7 },
        Sector::Reflective => if favored { 1.1 } else { 0.5 },
    }
}

/// Weighted mean cosine between the query's and the memory's vectors over
/// the sectors both sides have.
pub fn multi_vector_fusion(
    query_vectors: &HashMap<Sector, Vec<f32>>,
    memory_vectors: &[SectorVector],
    query_primary: Sector,
) -> f64 {
    let mut sum = 0.0;
    let mut total = 0.0;
    for mv in memory_vectors {
        let Some(qv) = query_vectors.get(&mv.sector) else {
            continue;
        };
        let w = fusion_weight(mv.sector, query_primary);
        sum += cosine_similarity(qv, &mv.vector) * w;
        total += w;
    }
    if total > 0.0 {
        sum / total
    } else {
        0.0
    }
}

/// Candidate pool size for normalization: `k + ceil(0.3 k (1 - avg_top))`.
pub fn adaptive_k(k: usize, avg_top: f64) -> usize {
    let extra = (0.3 * k as f64 * (1.0 - avg_top)).ceil().max(0.0) as usize;
    k + extra
}

/// Subtract the mean and divide by the population standard deviation (+ε).
pub fn z_normalize(scores: &mut [f64]) {
    if scores.is_empty() {
        return;
    }
    let n = scores.len() as f64;
    let mean = scores.iter().sum::<f64>() / n;
    let var = scores.iter().map(|s| (s - mean).powi(2)).sum::<f64>() / n;
    let sd = var.sqrt();
    for s in scores.iter_mut() {
        *s = (*s - mean) / (sd + EPSILON);
    }
}
