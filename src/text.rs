//! Text canonicalization: tokenize, stem, and fold synonyms.
//!
//! Every lexical signal in the engine (simhash, overlap, keyword scoring,
//! synthetic embeddings) goes through the same [`Normalizer`] so that
//! "meetings", "meet" and "sync" land on one canonical token.

use std::collections::{BTreeSet, HashMap};
use std::sync::LazyLock;

/// Turns raw text into canonical tokens.
pub trait Normalizer: Send + Sync {
    /// Canonical tokens in input order, duplicates kept.
    fn tokens(&self, text: &str) -> Vec<String>;

    /// Distinct canonical tokens.
    fn token_set(&self, text: &str) -> BTreeSet<String> {
        self.tokens(text).into_iter().collect()
    }
}

/// Synonym groups. The first word of each group is the canonical form.
const SYNONYM_GROUPS: &[&[&str]] = &[
    &["prefer", "like", "love", "enjoy", "favor"],
    &["theme", "mode", "style", "layout"],
    &["meeting", "meet", "session", "call", "sync"],
    &["dark", "night", "black"],
    &["light", "bright", "day"],
    &["user", "person", "people", "customer"],
    &["task", "todo", "job"],
    &["note", "memo", "reminder"],
    &["time", "schedule", "when", "date"],
    &["project", "initiative", "plan"],
    &["issue", "problem", "bug"],
    &["document", "doc", "file"],
    &["question", "query", "ask"],
];

static CANONICAL: LazyLock<HashMap<&'static str, usize>> = LazyLock::new(|| {
    let mut map = HashMap::new();
    for (group, words) in SYNONYM_GROUPS.iter().enumerate() {
        for word in words.iter() {
            map.insert(*word, group);
        }
    }
    map
});

/// Suffix rewrites, tried in order. The first one leaving at least three
/// characters wins.
const STEM_RULES: &[(&str, &str)] = &[("ies", "y"), ("ing", ""), ("ers", "er"), ("er", "er"), ("ed", ""), ("s", "")];

/// Lowercased ASCII alphanumeric runs.
pub fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_ascii_lowercase())
        .collect()
}

fn stem(token: &str) -> String {
    if token.len() <= 3 {
        return token.to_string();
    }
    for (suffix, replacement) in STEM_RULES {
        if let Some(base) = token.strip_suffix(suffix) {
            let stemmed = format!("{base}{replacement}");
            if stemmed.len() >= 3 {
                return stemmed;
            }
        }
    }
    token.to_string()
}

/// Canonical form of a single token: synonym group head, else its stem
/// (folded again if the stem is itself a synonym).
pub fn canonicalize_token(token: &str) -> String {
    let lower = token.to_ascii_lowercase();
    if let Some(&group) = CANONICAL.get(lower.as_str()) {
        return SYNONYM_GROUPS[group][0].to_string();
    }
    let stemmed = stem(&lower);
    match CANONICAL.get(stemmed.as_str()) {
        Some(&group) => SYNONYM_GROUPS[group][0].to_string(),
        None => stemmed,
    }
}

/// Every member of the token's synonym group, or just the token itself.
pub fn synonyms_for(token: &str) -> Vec<&'static str> {
    let canonical = canonicalize_token(token);
    match CANONICAL.get(canonical.as_str()) {
        Some(&group) => SYNONYM_GROUPS[group].to_vec(),
        None => Vec::new(),
    }
}

/// The default normalizer.
#[derive(Debug, Default, Clone, Copy)]
pub struct CanonicalNormalizer;

impl Normalizer for CanonicalNormalizer {
    fn tokens(&self, text: &str) -> Vec<String> {
        tokenize(text)
            .iter()
            .map(|t| canonicalize_token(t))
            .filter(|t| t.len() > 1)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokenize_splits_on_non_alphanumerics() {
        assert_eq!(tokenize("Hello, World-42!"), vec!["hello", "world", "42"]);
        assert!(tokenize("  ...  ").is_empty());
    }

    #[test]
    fn stemming_keeps_three_characters() {
        assert_eq!(canonicalize_token("parties"), "party");
        assert_eq!(canonicalize_token("running"), "runn");
        assert_eq!(canonicalize_token("thing"), "thing");
        assert_eq!(canonicalize_token("builders"), "builder");
        assert_eq!(canonicalize_token("cats"), "cat");
        assert_eq!(canonicalize_token("bus"), "bus");
    }

    #[test]
    fn synonyms_fold_to_group_head() {
        assert_eq!(canonicalize_token("enjoy"), "prefer");
        assert_eq!(canonicalize_token("Meetings"), "meeting");
        assert_eq!(canonicalize_token("bugs"), "issue");
        assert!(synonyms_for("sync").contains(&"session"));
        assert!(synonyms_for("python").is_empty());
    }

    #[test]
    fn normalizer_drops_single_characters() {
        let n = CanonicalNormalizer;
        assert_eq!(n.tokens("I love a dark theme"), vec!["prefer", "dark", "theme"]);
        let set = n.token_set("dark night black");
        assert_eq!(set.len(), 1);
    }
}
