use std::collections::{BTreeSet, HashMap};
use std::sync::OnceLock;

use regex::Regex;

/// Scores how alike two free-text screen descriptions are, in 0.0–1.0.
pub trait ContextSimilarity: Send + Sync {
    fn name(&self) -> &'static str;

    /// One score per candidate, in candidate order.
    fn scores(&self, query: &str, candidates: &[&str]) -> Vec<f64>;
}

/// Jaccard overlap of lowercase whitespace-separated words.
#[derive(Debug, Clone, Copy, Default)]
pub struct WordOverlap;

impl ContextSimilarity for WordOverlap {
    fn name(&self) -> &'static str {
        "word-overlap"
    }

    fn scores(&self, query: &str, candidates: &[&str]) -> Vec<f64> {
        let query_words = word_set(query);
        candidates
            .iter()
            .map(|candidate| {
                let words = word_set(candidate);
                if words.is_empty() {
                    return 0.0;
                }
                let union = query_words.union(&words).count();
                if union == 0 {
                    return 0.0;
                }
                query_words.intersection(&words).count() as f64 / union as f64
            })
            .collect()
    }
}

fn word_set(text: &str) -> BTreeSet<String> {
    text.split_whitespace().map(str::to_lowercase).collect()
}

/// Cosine similarity of TF-IDF vectors built over the query and all
/// candidates together (smoothed idf, L2-normalised rows).
#[derive(Debug, Clone, Copy, Default)]
pub struct TfIdfCosine;

impl ContextSimilarity for TfIdfCosine {
    fn name(&self) -> &'static str {
        "tfidf-cosine"
    }

    fn scores(&self, query: &str, candidates: &[&str]) -> Vec<f64> {
        let mut documents: Vec<Vec<String>> = Vec::with_capacity(candidates.len() + 1);
        documents.push(tokens(query));
        documents.extend(candidates.iter().map(|candidate| tokens(candidate)));

        let mut document_frequency: HashMap<&str, usize> = HashMap::new();
        for document in &documents {
            let unique: BTreeSet<&str> = document.iter().map(String::as_str).collect();
            for term in unique {
                *document_frequency.entry(term).or_default() += 1;
            }
        }
        let total = documents.len() as f64;
        let idf = |term: &str| {
            let df = document_frequency.get(term).copied().unwrap_or(0) as f64;
            ((1.0 + total) / (1.0 + df)).ln() + 1.0
        };

        let vectors: Vec<HashMap<&str, f64>> = documents
            .iter()
            .map(|document| {
                let mut counts: HashMap<&str, f64> = HashMap::new();
                for term in document {
                    *counts.entry(term.as_str()).or_default() += 1.0;
                }
                let mut weighted: HashMap<&str, f64> = counts
                    .into_iter()
                    .map(|(term, count)| (term, count * idf(term)))
                    .collect();
                let norm = weighted.values().map(|value| value * value).sum::<f64>().sqrt();
                if norm > 0.0 {
                    for value in weighted.values_mut() {
                        *value /= norm;
                    }
                }
                weighted
            })
            .collect();

        let Some((query_vector, candidate_vectors)) = vectors.split_first() else {
            return Vec::new();
        };
        candidate_vectors
            .iter()
            .map(|candidate| {
                query_vector
                    .iter()
                    .filter_map(|(term, weight)| candidate.get(term).map(|other| weight * other))
                    .sum::<f64>()
                    .clamp(0.0, 1.0)
            })
            .collect()
    }
}

fn token_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\b\w\w+\b").expect("valid token pattern"))
}

fn tokens(text: &str) -> Vec<String> {
    let lowered = text.to_lowercase();
    token_pattern()
        .find_iter(&lowered)
        .map(|found| found.as_str().to_string())
        .collect()
}
