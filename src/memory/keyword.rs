//! Lexical scoring for the hybrid tier: exact phrase, keyword n-gram overlap,
//! and a corpus-free BM25 approximation.

use std::collections::{BTreeSet, HashMap};

use crate::text::Normalizer;

const BM25_K1: f64 = 1.5;
const BM25_B: f64 = 0.75;
const BM25_CORPUS_SIZE: f64 = 10_000.0;
const BM25_AVG_DOC_LEN: f64 = 100.0;

/// Candidates at or below this keyword score are dropped.
pub const KEYWORD_THRESHOLD: f64 = 0.05;

/// Canonical tokens of at least `min_len` characters, their character
/// trigrams, and `_`-joined token bigrams and trigrams.
pub fn extract_keywords(tokens: &[String], min_len: usize) -> BTreeSet<String> {
    let mut keywords = BTreeSet::new();
    for token in tokens {
        if token.len() >= min_len {
            keywords.insert(token.clone());
            let bytes = token.as_bytes();
            if bytes.len() >= 3 {
                for tri in bytes.windows(3) {
                    keywords.insert(String::from_utf8_lossy(tri).into_owned());
                }
            }
        }
    }
    for pair in tokens.windows(2) {
        let bigram = format!("{}_{}", pair[0], pair[1]);
        if bigram.len() >= min_len {
            keywords.insert(bigram);
        }
    }
    for triple in tokens.windows(3) {
        keywords.insert(format!("{}_{}_{}", triple[0], triple[1], triple[2]));
    }
    keywords
}

fn keyword_weight(k: &str) -> f64 {
    if k.contains('_') {
        2.0
    } else {
        1.0
    }
}

/// Weighted share of query keywords found in the content. N-grams count double.
pub fn keyword_overlap(query: &BTreeSet<String>, content: &BTreeSet<String>) -> f64 {
    let mut matched = 0.0;
    let mut total = 0.0;
    for k in query {
        let w = keyword_weight(k);
        if content.contains(k) {
            matched += w;
        }
        total += w;
    }
    if total == 0.0 {
        0.0
    } else {
        matched / total
    }
}

pub fn exact_phrase_match(query: &str, content: &str) -> bool {
    content.to_lowercase().contains(query.trim().to_lowercase().as_str())
}

/// BM25 against fixed corpus statistics.
pub fn bm25(query_terms: &[String], content_terms: &[String]) -> f64 {
    let mut tf: HashMap<&str, f64> = HashMap::new();
    for term in content_terms {
        *tf.entry(term.as_str()).or_default() += 1.0;
    }
    let doc_len = content_terms.len() as f64;
    query_terms
        .iter()
        .filter_map(|q| tf.get(q.as_str()).copied())
        .map(|f| {
            let idf = ((BM25_CORPUS_SIZE + 1.0) / (f + 0.5)).ln();
            let norm = f + BM25_K1 * (1.0 - BM25_B + BM25_B * (doc_len / BM25_AVG_DOC_LEN));
            idf * (f * (BM25_K1 + 1.0)) / norm
        })
        .sum()
}

/// Precomputed query side of keyword scoring.
pub struct KeywordQuery {
    text: String,
    terms: Vec<String>,
    keywords: BTreeSet<String>,
    min_len: usize,
}

impl KeywordQuery {
    pub fn new(normalizer: &dyn Normalizer, text: &str, min_len: usize) -> Self {
        let terms = normalizer.tokens(text);
        let keywords = extract_keywords(&terms, min_len);
        Self {
            text: text.to_string(),
            terms,
            keywords,
            min_len,
        }
    }

    /// Raw keyword score of one candidate, before the configured boost:
    /// phrase (1.0) + overlap × 0.8 + min(1, bm25 / 10) × 0.5.
    pub fn score(&self, normalizer: &dyn Normalizer, content: &str) -> f64 {
        let mut total = 0.0;
        if exact_phrase_match(&self.text, content) {
            total += 1.0;
        }
        let content_terms = normalizer.tokens(content);
        let content_keywords = extract_keywords(&content_terms, self.min_len);
        total += keyword_overlap(&self.keywords, &content_keywords) * 0.8;
        total += (bm25(&self.terms, &content_terms) / 10.0).min(1.0) * 0.5;
        total
    }

    /// Scores above [`KEYWORD_THRESHOLD`] for each `(id, content)` candidate.
    pub fn score_all<'a, I>(&self, normalizer: &dyn Normalizer, candidates: I) -> HashMap<String, f64>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        candidates
            .into_iter()
            .filter_map(|(id, content)| {
                let s = self.score(normalizer, content);
                (s > KEYWORD_THRESHOLD).then(|| (id.to_string(), s))
            })
            .collect()
    }
}
