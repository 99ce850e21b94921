use async_trait::async_trait;
use rustc_hash::FxHashMap;

use super::tokenize::tokenize;
use crate::error::SimilarityError;

/// Scores a sentence against cluster representatives.
///
/// Implementations return one score per candidate, in candidate order. Scores
/// are expected in `[0, 1]`, with identical sentences scoring `1.0`.
#[async_trait]
pub trait SimilarityProvider: Send + Sync {
    async fn score(
        &self,
        sentence: &str,
        candidates: &[&str],
    ) -> Result<Vec<f32>, SimilarityError>;
}

/// Cosine similarity between two dense vectors. Zero vectors score `0.0`.
#[must_use]
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let dot_product: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }

    dot_product / (norm_a * norm_b)
}

/// In-process provider: cosine over token count vectors.
///
/// Useful without an NLU deployment and as a deterministic stand-in in tests.
#[derive(Debug, Clone, Copy, Default)]
pub struct LexicalSimilarity;

impl LexicalSimilarity {
    #[must_use]
    pub fn similarity(a: &str, b: &str) -> f32 {
        if a == b {
            return 1.0;
        }
        let left = term_counts(a);
        let right = term_counts(b);
        if left.is_empty() || right.is_empty() {
            return 0.0;
        }

        let mut vocabulary: Vec<&str> = left
            .keys()
            .chain(right.keys())
            .map(String::as_str)
            .collect();
        vocabulary.sort_unstable();
        vocabulary.dedup();

        let project = |counts: &FxHashMap<String, f32>| -> Vec<f32> {
            vocabulary
                .iter()
                .map(|term| counts.get(*term).copied().unwrap_or(0.0))
                .collect()
        };
        cosine_similarity(&project(&left), &project(&right))
    }
}

fn term_counts(text: &str) -> FxHashMap<String, f32> {
    let mut counts = FxHashMap::default();
    for token in tokenize(text) {
        *counts.entry(token).or_insert(0.0) += 1.0;
    }
    counts
}

#[async_trait]
impl SimilarityProvider for LexicalSimilarity {
    async fn score(
        &self,
        sentence: &str,
        candidates: &[&str],
    ) -> Result<Vec<f32>, SimilarityError> {
        Ok(candidates
            .iter()
            .map(|candidate| Self::similarity(sentence, candidate))
            .collect())
    }
}
