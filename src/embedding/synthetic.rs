//! Deterministic feature-hashing embedder.
//!
//! Canonical tokens (plus their synonyms), character trigrams, adjacent-token
//! bigrams and a small positional signal are hashed into a fixed-width vector
//! and L2-normalized. Feature keys are prefixed with the sector name, so the
//! same text embeds differently per sector. Texts that share vocabulary land
//! close together, which is all recall needs from a reference provider.

use async_trait::async_trait;
use std::collections::HashMap;

use super::{normalize, Embedder};
use crate::config::SectorsConfig;
use crate::error::{MemoryError, Result};
use crate::memory::types::Sector;
use crate::text::{canonicalize_token, synonyms_for, CanonicalNormalizer, Normalizer};

pub struct SyntheticEmbedder {
    dim: usize,
    sector_weights: [f64; 5],
    normalizer: CanonicalNormalizer,
}

impl SyntheticEmbedder {
    pub fn new(dim: usize, sectors: &SectorsConfig) -> Self {
        let mut sector_weights = [1.0; 5];
        for sector in Sector::ALL {
            sector_weights[sector.index()] = sectors.get(sector).weight;
        }
        Self {
            dim: dim.max(1),
            sector_weights,
            normalizer: CanonicalNormalizer,
        }
    }

    fn slot(&self, h: u32) -> usize {
        if self.dim.is_power_of_two() {
            (h as usize) & (self.dim - 1)
        } else {
            (h as usize) % self.dim
        }
    }

    fn add_feature(&self, v: &mut [f64], key: &str, w: f64) {
        let h = fnv1a(key);
        let h2 = murmurish(key, 0xdead_beef);
        let val = if h & 1 == 0 { w } else { -w };
        v[self.slot(h)] += val;
        v[self.slot(h2)] += val * 0.5;
    }

    fn add_position(&self, v: &mut [f64], pos: usize, w: f64) {
        let idx = pos % self.dim;
        let angle = pos as f64 / 10_000f64.powf((2 * idx) as f64 / self.dim as f64);
        v[idx] += w * angle.sin();
        v[(idx + 1) % self.dim] += w * angle.cos();
    }

    /// Synchronous embedding, exposed for tests and blocking callers.
    pub fn embed_sync(&self, text: &str, sector: Sector) -> Vec<f32> {
        let canonical = self.normalizer.tokens(text);
        if canonical.is_empty() {
            return vec![1.0 / (self.dim as f32).sqrt(); self.dim];
        }

        let mut expanded: Vec<String> = Vec::with_capacity(canonical.len());
        for tok in &canonical {
            expanded.push(tok.clone());
            for syn in synonyms_for(tok) {
                expanded.push(canonicalize_token(syn));
            }
        }

        let total = expanded.len() as f64;
        let mut counts: HashMap<&str, usize> = HashMap::new();
        for tok in &expanded {
            *counts.entry(tok.as_str()).or_default() += 1;
        }
        // Sorted for a deterministic accumulation order.
        let mut counts: Vec<(&str, usize)> = counts.into_iter().collect();
        counts.sort_unstable();

        let sw = self.sector_weights[sector.index()];
        let prefix = sector.as_str();
        let mut v = vec![0.0f64; self.dim];

        for (tok, c) in counts {
            let c = c as f64;
            let tf = c / total;
            let idf = (1.0 + total / c).ln();
            let w = (tf * idf + 1.0) * sw;
            self.add_feature(&mut v, &format!("{prefix}|tok|{tok}"), w);
            let bytes = tok.as_bytes();
            if bytes.len() >= 3 {
                for tri in bytes.windows(3) {
                    let tri = String::from_utf8_lossy(tri);
                    self.add_feature(&mut v, &format!("{prefix}|c3|{tri}"), w * 0.4);
                }
            }
        }

        for (i, pair) in canonical.windows(2).enumerate() {
            let pw = 1.0 / (1.0 + i as f64 * 0.1);
            self.add_feature(&mut v, &format!("{prefix}|bi|{}_{}", pair[0], pair[1]), 1.4 * sw * pw);
        }

        let dl = (1.0 + total).ln();
        for i in 0..canonical.len().min(50) {
            self.add_position(&mut v, i, (0.5 * sw) / dl);
        }

        let mut out: Vec<f32> = v.into_iter().map(|x| x as f32).collect();
        normalize(&mut out);
        out
    }
}

#[async_trait]
impl Embedder for SyntheticEmbedder {
    async fn embed(&self, text: &str, sector: Sector) -> Result<Vec<f32>> {
        let v = self.embed_sync(text, sector);
        if v.len() != self.dim {
            return Err(MemoryError::Embedding(format!(
                "expected {} dimensions, produced {}",
                self.dim,
                v.len()
            )));
        }
        Ok(v)
    }

    fn dimensions(&self) -> usize {
        self.dim
    }
}

fn fnv1a(s: &str) -> u32 {
    let mut h: u32 = 0x811c_9dc5;
    for c in s.chars() {
        h = (h ^ c as u32).wrapping_mul(16_777_619);
    }
    h
}

fn murmurish(s: &str, seed: u32) -> u32 {
    let mut h = seed;
    for c in s.chars() {
        h = (h ^ c as u32).wrapping_mul(0x5bd1_e995);
        h ^= h >> 13;
    }
    h
}
