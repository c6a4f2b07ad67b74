//! Candidate scoring for recall.
//!
//! The engine does the I/O (embedding, vector search, graph expansion, row
//! loads) and hands the pieces to this module, which turns each candidate into
//! a scored [`QueryResult`] and ranks the pool. Nothing here touches storage.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::clock::days_between;
use crate::memory::classify::Classifier;
use crate::memory::dynamics::{clamp_unit, SalienceDynamics};
use crate::memory::scoring::{
    adaptive_k, multi_vector_fusion, relationship_weight, resonance, tag_match, token_overlap,
    z_normalize, HybridScorer, ScoreSignals,
};
use crate::memory::types::{Memory, QueryFilter, QueryResult, Sector, SectorClass, SectorVector};
use crate::memory::vector_store::VectorHit;
use crate::memory::waypoints::Expansion;
use crate::text::Normalizer;

/// Similarities averaged per sector when judging search confidence.
const CONFIDENCE_WINDOW: usize = 8;

/// Query-side state computed once per recall.
#[derive(Debug, Clone)]
pub struct PreparedQuery {
    pub text: String,
    pub k: usize,
    pub class: SectorClass,
    /// Date or "what did I do" phrasing. Logged only.
    pub temporal: bool,
    pub tokens: BTreeSet<String>,
    /// Sectors to embed and search.
    pub sectors: Vec<Sector>,
}

impl PreparedQuery {
    pub fn new(
        text: &str,
        k: usize,
        filter: &QueryFilter,
        classifier: &Classifier,
        normalizer: &dyn Normalizer,
    ) -> Self {
        let sectors = if filter.sectors.is_empty() {
            Sector::ALL.to_vec()
        } else {
            let mut s = filter.sectors.clone();
            s.sort();
            s.dedup();
            s
        };
        Self {
            text: text.to_string(),
            k,
            class: classifier.classify(text, None),
            temporal: classifier.has_temporal_markers(text),
            tokens: normalizer.token_set(text),
            sectors,
        }
    }
}

/// Mean of the top similarities of every searched sector. 0 with no hits.
pub fn avg_top_similarity(hits: &BTreeMap<Sector, Vec<VectorHit>>) -> f64 {
    let top: Vec<f64> = hits
        .values()
        .flat_map(|h| h.iter().take(CONFIDENCE_WINDOW).map(|x| x.score))
        .collect();
    if top.is_empty() {
        0.0
    } else {
        top.iter().sum::<f64>() / top.len() as f64
    }
}

/// Distinct candidate ids in first-seen order: sector hits by sector, then
/// graph expansions.
pub fn union_ids(hits: &BTreeMap<Sector, Vec<VectorHit>>, expansions: &[Expansion]) -> Vec<String> {
    let mut seen = BTreeSet::new();
    let mut ids = Vec::new();
    let all = hits
        .values()
        .flat_map(|h| h.iter().map(|x| x.id.as_str()))
        .chain(expansions.iter().map(|e| e.id.as_str()));
    for id in all {
        if seen.insert(id.to_string()) {
            ids.push(id.to_string());
        }
    }
    ids
}

/// `true` if `memory` satisfies every constraint in `filter`.
pub fn passes_filter(filter: &QueryFilter, memory: &Memory) -> bool {
    if filter.min_salience.is_some_and(|min| memory.salience < min) {
        return false;
    }
    if filter.owner_id.as_deref().is_some_and(|o| o != memory.owner_id) {
        return false;
    }
    if filter.start_time.is_some_and(|t| memory.created_at < t) {
        return false;
    }
    if filter.end_time.is_some_and(|t| memory.created_at > t) {
        return false;
    }
    true
}

/// A candidate with everything needed to score it.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub memory: Memory,
    pub vectors: Vec<SectorVector>,
    pub expansion: Option<Expansion>,
    /// Raw keyword score before the boost. 0 outside the hybrid tier.
    pub keyword: f64,
}

/// Scores candidates against one prepared query.
pub struct CandidateScorer<'a> {
    pub scorer: &'a HybridScorer,
    pub dynamics: &'a SalienceDynamics,
    pub normalizer: &'a dyn Normalizer,
    pub query: &'a PreparedQuery,
    pub query_vectors: &'a HashMap<Sector, Vec<f32>>,
    pub hits: &'a BTreeMap<Sector, Vec<VectorHit>>,
    pub now: i64,
}

impl CandidateScorer<'_> {
    /// Best similarity signal for a memory: its fused similarity scaled by
    /// sector resonance, or a stronger direct hit in any searched sector.
    fn best_similarity(&self, c: &Candidate) -> f64 {
        let primary = self.query.class.primary;
        let fused = multi_vector_fusion(self.query_vectors, &c.vectors, primary);
        let mut best = fused * resonance(c.memory.primary_sector, primary);
        for hits in self.hits.values() {
            if let Some(hit) = hits.iter().find(|h| h.id == c.memory.id) {
                if hit.score > best {
                    best = hit.score;
                }
            }
        }
        best
    }

    pub fn score(&self, c: &Candidate) -> QueryResult {
        let m = &c.memory;
        let class = &self.query.class;

        let penalty = if class.contains(m.primary_sector) {
            1.0
        } else {
            relationship_weight(class.primary, m.primary_sector)
        };
        let similarity = self.best_similarity(c) * penalty;

        let idle_days = days_between(m.last_seen_at, self.now);
        let salience = self.dynamics.calc_decay(m.primary_sector, m.salience, idle_days, None);
        let memory_tokens = self.normalizer.token_set(&m.content);

        let signals = ScoreSignals {
            similarity,
            overlap: token_overlap(&self.query.tokens, &memory_tokens),
            waypoint: c.expansion.as_ref().map_or(0.0, |e| clamp_unit(e.weight)),
            recency: self.scorer.recency(idle_days),
            tag_match: tag_match(&self.query.tokens, &m.tags),
            keyword: c.keyword * self.scorer.keyword_boost(),
        };

        let mut sectors: Vec<Sector> = c.vectors.iter().map(|v| v.sector).collect();
        sectors.dedup();

        QueryResult {
            id: m.id.clone(),
            content: m.content.clone(),
            score: self.scorer.score(&signals),
            sectors,
            primary_sector: m.primary_sector,
            path: c
                .expansion
                .as_ref()
                .map_or_else(|| vec![m.id.clone()], |e| e.path.clone()),
            salience,
            last_seen_at: m.last_seen_at,
            tags: m.tags.clone(),
            metadata: m.metadata.clone(),
        }
    }
}

fn sort_results(results: &mut [QueryResult]) {
    results.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.id.cmp(&b.id))
    });
}

/// Keep the top `k + ceil(0.3 k (1 - avg_top))`, z-normalize their scores,
/// re-sort, and truncate to `k`.
pub fn rank(mut results: Vec<QueryResult>, k: usize, avg_top: f64) -> Vec<QueryResult> {
    sort_results(&mut results);
    results.truncate(adaptive_k(k, avg_top));
    let mut scores: Vec<f64> = results.iter().map(|r| r.score).collect();
    z_normalize(&mut scores);
    for (r, s) in results.iter_mut().zip(scores) {
        r.score = s;
    }
    sort_results(&mut results);
    results.truncate(k);
    results
}

/// Every unordered pair of ids, each pair sorted.
pub fn coactivation_pairs(ids: &[String]) -> Vec<(String, String)> {
    let mut pairs = Vec::new();
    for (i, a) in ids.iter().enumerate() {
        for b in &ids[i + 1..] {
            if a <= b {
                pairs.push((a.clone(), b.clone()));
            } else {
                pairs.push((b.clone(), a.clone()));
            }
        }
    }
    pairs
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DynamicsConfig, IngestionConfig, ScoringConfig, SectorsConfig};
    use crate::text::CanonicalNormalizer;

    fn hit(id: &str, score: f64) -> VectorHit {
        VectorHit {
            id: id.to_string(),
            score,
        }
    }

    fn memory(id: &str, sector: Sector, content: &str) -> Memory {
        Memory {
            id: id.to_string(),
            owner_id: "o".into(),
            segment: 0,
            content: content.to_string(),
            simhash: 0,
            primary_sector: sector,
            tags: vec![],
            metadata: serde_json::json!({}),
            created_at: 1_000,
            updated_at: 1_000,
            last_seen_at: 1_000,
            salience: 0.5,
            decay_lambda: 0.005,
            version: 1,
            mean_dim: 0,
            mean_vector: vec![],
            compressed_vector: None,
            feedback_score: 0.0,
        }
    }

    fn result(id: &str, score: f64) -> QueryResult {
        QueryResult {
            id: id.to_string(),
            content: String::new(),
            score,
            sectors: vec![],
            primary_sector: Sector::Semantic,
            path: vec![id.to_string()],
            salience: 0.5,
            last_seen_at: 0,
            tags: vec![],
            metadata: serde_json::json!({}),
        }
    }

    #[test]
    fn avg_top_uses_eight_per_sector() {
        let mut hits = BTreeMap::new();
        hits.insert(
            Sector::Semantic,
            (0..10).map(|i| hit(&format!("s{i}"), if i < 8 { 0.5 } else { 0.0 })).collect(),
        );
        hits.insert(Sector::Episodic, vec![hit("e", 1.0)]);
        assert!((avg_top_similarity(&hits) - 5.0 / 9.0).abs() < 1e-12);
        assert_eq!(avg_top_similarity(&BTreeMap::new()), 0.0);
    }

    #[test]
    fn union_keeps_first_occurrence() {
        let mut hits = BTreeMap::new();
        hits.insert(Sector::Episodic, vec![hit("a", 0.9), hit("b", 0.8)]);
        hits.insert(Sector::Semantic, vec![hit("b", 0.7), hit("c", 0.6)]);
        let exp = vec![Expansion {
            id: "d".into(),
            weight: 0.5,
            path: vec!["a".into(), "d".into()],
        }];
        assert_eq!(union_ids(&hits, &exp), vec!["a", "b", "c", "d"]);
    }

    #[test]
    fn filters_apply_to_stored_fields() {
        let m = memory("a", Sector::Semantic, "x");
        assert!(passes_filter(&QueryFilter::default(), &m));
        assert!(!passes_filter(
            &QueryFilter {
                min_salience: Some(0.6),
                ..Default::default()
            },
            &m
        ));
        assert!(!passes_filter(
            &QueryFilter {
                owner_id: Some("other".into()),
                ..Default::default()
            },
            &m
        ));
        assert!(passes_filter(
            &QueryFilter {
                start_time: Some(1_000),
                end_time: Some(1_000),
                ..Default::default()
            },
            &m
        ));
        assert!(!passes_filter(
            &QueryFilter {
                start_time: Some(1_001),
                ..Default::default()
            },
            &m
        ));
    }

    #[test]
    fn cross_sector_candidates_are_penalized() {
        let scorer = HybridScorer::new(&ScoringConfig::default());
        let dynamics = SalienceDynamics::new(
            &SectorsConfig::default(),
            &DynamicsConfig::default(),
            &IngestionConfig::default(),
        );
        let query = PreparedQuery {
            text: "python language".into(),
            k: 5,
            class: SectorClass {
                primary: Sector::Semantic,
                additional: vec![],
                confidence: 0.5,
            },
            temporal: false,
            tokens: CanonicalNormalizer.token_set("python language"),
            sectors: Sector::ALL.to_vec(),
        };
        let mut hits = BTreeMap::new();
        hits.insert(Sector::Semantic, vec![hit("sem", 0.8)]);
        hits.insert(Sector::Emotional, vec![hit("emo", 0.8)]);
        let qv = HashMap::new();
        let cs = CandidateScorer {
            scorer: &scorer,
            dynamics: &dynamics,
            normalizer: &CanonicalNormalizer,
            query: &query,
            query_vectors: &qv,
            hits: &hits,
            now: 1_000,
        };
        let candidate = |m: Memory| Candidate {
            memory: m,
            vectors: vec![],
            expansion: None,
            keyword: 0.0,
        };
        let sem = cs.score(&candidate(memory("sem", Sector::Semantic, "unrelated")));
        let emo = cs.score(&candidate(memory("emo", Sector::Emotional, "unrelated")));
        assert!(sem.score > emo.score);
        assert_eq!(sem.path, vec!["sem"]);
        assert!((sem.salience - 0.5).abs() < 1e-12);
    }

    #[test]
    fn rank_normalizes_and_truncates() {
        let pool = vec![result("a", 0.9), result("b", 0.7), result("c", 0.5), result("d", 0.5)];
        let ranked = rank(pool, 2, 1.0);
        assert_eq!(ranked.len(), 2);
        assert_eq!(ranked[0].id, "a");
        assert_eq!(ranked[1].id, "b");
        assert!(ranked[0].score > 0.0);
    }

    #[test]
    fn rank_breaks_ties_by_id() {
        let ranked = rank(vec![result("b", 0.5), result("a", 0.5)], 2, 1.0);
        assert_eq!(ranked[0].id, "a");
    }

    #[test]
    fn pairs_are_sorted_and_complete() {
        let ids = vec!["c".to_string(), "a".to_string(), "b".to_string()];
        let pairs = coactivation_pairs(&ids);
        assert_eq!(pairs.len(), 3);
        assert!(pairs.contains(&("a".into(), "c".into())));
        assert!(pairs.iter().all(|(a, b)| a < b));
    }
}
