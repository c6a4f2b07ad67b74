//! Pattern-weighted sector classification.
//!
//! Each sector contributes `matches × weight` where `matches` counts the
//! non-overlapping hits of every pattern in its set. The highest-scoring
//! sector is primary; close runners-up become additional sectors.

use regex::{Regex, RegexBuilder};

use crate::config::SectorsConfig;
use crate::error::{MemoryError, Result};
use crate::memory::types::{Sector, SectorClass};

const TEMPORAL_PATTERNS: &[&str] = &[
    r"\b(today|yesterday|tomorrow|this\s+week|last\s+week|this\s+morning)\b",
    r"\b\d{4}-\d{2}-\d{2}\b",
    r"\b20\d{2}[/-]?(0[1-9]|1[0-2])[/-]?(0[1-9]|[12]\d|3[01])\b",
    r"\b(january|february|march|april|may|june|july|august|september|october|november|december)\s+\d{1,2}",
    r"\bwhat\s+(did|have)\s+(i|we)\s+(do|done)\b",
];

struct CompiledSector {
    sector: Sector,
    weight: f64,
    patterns: Vec<Regex>,
}

pub struct Classifier {
    sectors: Vec<CompiledSector>,
    temporal: Vec<Regex>,
}

fn compile(pattern: &str) -> Result<Regex> {
    RegexBuilder::new(pattern)
        .case_insensitive(true)
        .build()
        .map_err(|e| MemoryError::Config(format!("invalid pattern {pattern:?}: {e}")))
}

impl Classifier {
    /// Compile every sector's patterns. Fails on the first invalid one.
    pub fn new(config: &SectorsConfig) -> Result<Self> {
        let mut sectors = Vec::with_capacity(Sector::ALL.len());
        for sector in Sector::ALL {
            let cfg = config.get(sector);
            let patterns = cfg
                .patterns
                .iter()
                .map(|p| compile(p))
                .collect::<Result<Vec<_>>>()?;
            sectors.push(CompiledSector {
                sector,
                weight: cfg.weight,
                patterns,
            });
        }
        let temporal = TEMPORAL_PATTERNS
            .iter()
            .map(|p| compile(p))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { sectors, temporal })
    }

    /// Raw per-sector scores in declaration order.
    pub fn scores(&self, content: &str) -> Vec<(Sector, f64)> {
        self.sectors
            .iter()
            .map(|s| {
                let hits: usize = s.patterns.iter().map(|p| p.find_iter(content).count()).sum();
                (s.sector, hits as f64 * s.weight)
            })
            .collect()
    }

    /// Assign `content` to a primary sector plus any strong secondaries.
    ///
    /// A `"sector"` string in `metadata` naming a valid sector short-circuits
    /// pattern matching with confidence 1.0.
    pub fn classify(&self, content: &str, metadata: Option<&serde_json::Value>) -> SectorClass {
        if let Some(sector) = metadata
            .and_then(|m| m.get("sector"))
            .and_then(|s| s.as_str())
            .and_then(|s| s.parse::<Sector>().ok())
        {
            return SectorClass {
                primary: sector,
                additional: Vec::new(),
                confidence: 1.0,
            };
        }

        let mut ranked = self.scores(content);
        // Stable: equal scores keep declaration order.
        ranked.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

        let (primary, primary_score) = ranked[0];
        if primary_score <= 0.0 {
            return SectorClass {
                primary: Sector::Semantic,
                additional: Vec::new(),
                confidence: 0.2,
            };
        }

        let threshold = f64::max(1.0, primary_score * 0.3);
        let additional = ranked[1..]
            .iter()
            .filter(|(_, score)| *score > 0.0 && *score >= threshold)
            .map(|(sector, _)| *sector)
            .collect();
        let runner_up = ranked.get(1).map(|(_, s)| *s).unwrap_or(0.0);
        let confidence = (primary_score / (primary_score + runner_up + 1.0)).min(1.0);

        SectorClass {
            primary,
            additional,
            confidence,
        }
    }

    /// Whether a query refers to a specific time ("yesterday", an ISO date, ...).
    pub fn has_temporal_markers(&self, text: &str) -> bool {
        self.temporal.iter().any(|p| p.is_match(text))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SectorConfig;

    fn classifier() -> Classifier {
        Classifier::new(&SectorsConfig::default()).unwrap()
    }

    #[test]
    fn episodic_event() {
        let c = classifier().classify("Yesterday I went to the park at 4pm", None);
        assert_eq!(c.primary, Sector::Episodic);
        assert!(c.additional.is_empty());
        // 2 hits × 1.2 = 2.4; 2.4 / (2.4 + 0 + 1)
        assert!((c.confidence - 2.4 / 3.4).abs() < 1e-9);
    }

    #[test]
    fn semantic_fact() {
        let c = classifier().classify("Python is a high-level language known for readability", None);
        assert_eq!(c.primary, Sector::Semantic);
        assert!((c.confidence - 0.5).abs() < 1e-9);
    }

    #[test]
    fn no_matches_defaults_to_semantic() {
        let c = classifier().classify("zzz qqq", None);
        assert_eq!(c.primary, Sector::Semantic);
        assert_eq!(c.confidence, 0.2);
        assert!(c.additional.is_empty());
    }

    #[test]
    fn metadata_sector_overrides_patterns() {
        let meta = serde_json::json!({"sector": "reflective"});
        let c = classifier().classify("Yesterday I went to the park", Some(&meta));
        assert_eq!(c.primary, Sector::Reflective);
        assert_eq!(c.confidence, 1.0);

        let bogus = serde_json::json!({"sector": "entity"});
        let c = classifier().classify("Yesterday I went to the park", Some(&bogus));
        assert_eq!(c.primary, Sector::Episodic);
    }

    #[test]
    fn strong_secondaries_become_additional() {
        // emotional: 5 hits × 1.3 = 6.5; episodic: 2 hits × 1.2 = 2.4 (above 6.5 × 0.3)
        let c = classifier().classify("Yesterday I felt so happy and excited, it was amazing!!", None);
        assert_eq!(c.primary, Sector::Emotional);
        assert!(c.additional.contains(&Sector::Episodic));
    }

    #[test]
    fn ties_keep_declaration_order() {
        let mut cfg = SectorsConfig::default();
        cfg.episodic = SectorConfig {
            weight: 1.0,
            decay_lambda: 0.01,
            patterns: vec![r"\bfoo\b".into()],
        };
        cfg.semantic = SectorConfig {
            weight: 1.0,
            decay_lambda: 0.01,
            patterns: vec![r"\bfoo\b".into()],
        };
        let c = Classifier::new(&cfg).unwrap().classify("foo", None);
        assert_eq!(c.primary, Sector::Episodic);
        assert_eq!(c.additional, vec![Sector::Semantic]);
    }

    #[test]
    fn invalid_pattern_is_a_config_error() {
        let mut cfg = SectorsConfig::default();
        cfg.semantic.patterns.push("(unclosed".into());
        assert!(matches!(Classifier::new(&cfg), Err(MemoryError::Config(_))));
    }

    #[test]
    fn temporal_markers() {
        let c = classifier();
        assert!(c.has_temporal_markers("what did I do yesterday"));
        assert!(c.has_temporal_markers("notes from 2025-11-20"));
        assert!(c.has_temporal_markers("March 3 standup"));
        assert!(!c.has_temporal_markers("what language is known for readability"));
    }
}
