//! TF-IDF tag ranking over a shared term weight cache.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use dashmap::DashMap;
use rustc_hash::{FxHashMap, FxHashSet};
use serde::Serialize;
use tracing::{info, warn};

/// Weight given to a term the cache has never seen.
pub const DEFAULT_TERM_WEIGHT: f64 = 10.0;

const BUILTIN_STOPWORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "but", "by", "can", "could", "did", "do", "does",
    "for", "from", "had", "has", "have", "how", "i", "if", "in", "is", "it", "its", "me", "my",
    "no", "not", "of", "on", "or", "our", "please", "so", "that", "the", "their", "there",
    "this", "to", "was", "we", "what", "when", "where", "which", "who", "why", "will", "with",
    "would", "you", "your", "的", "了", "吗", "呢", "吧", "啊", "是", "我", "你", "在", "和",
    "有", "就", "都", "也", "么", "怎", "什",
];

/// Process-wide `term -> inverse document frequency` map.
///
/// A term's weight is fixed by its first lookup (or seed) and never changes.
/// Sharded so concurrent lookups of unrelated terms do not contend.
#[derive(Debug)]
pub struct TermWeightCache {
    weights: DashMap<String, f64>,
    default_weight: f64,
}

impl Default for TermWeightCache {
    fn default() -> Self {
        Self::new(DEFAULT_TERM_WEIGHT)
    }
}

impl TermWeightCache {
    #[must_use]
    pub fn new(default_weight: f64) -> Self {
        Self {
            weights: DashMap::new(),
            default_weight,
        }
    }

    /// Returns the established weight for `term`, inserting the default if absent.
    pub fn weight(&self, term: &str) -> f64 {
        if let Some(weight) = self.weights.get(term) {
            return *weight;
        }
        // The entry lock makes concurrent first writers agree on one value.
        *self
            .weights
            .entry(term.to_string())
            .or_insert(self.default_weight)
    }

    /// Seeds `term` with `weight` unless it is already known.
    ///
    /// Returns the weight now in effect.
    pub fn insert_if_absent(&self, term: &str, weight: f64) -> f64 {
        *self.weights.entry(term.to_string()).or_insert(weight)
    }

    #[must_use]
    pub fn get(&self, term: &str) -> Option<f64> {
        self.weights.get(term).map(|weight| *weight)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.weights.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.weights.is_empty()
    }

    /// Seeds the cache from a `term weight` file, one pair per line.
    ///
    /// Blank lines and lines starting with `#` are ignored; malformed lines are
    /// skipped with a warning. Returns the number of terms seeded.
    ///
    /// # Errors
    /// Fails when the file cannot be read.
    pub fn seed_from_file(&self, path: &Path) -> Result<usize> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read term weight file {}", path.display()))?;
        let mut seeded = 0;
        for (index, line) in raw.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let mut fields = line.split_whitespace();
            match (fields.next(), fields.next().map(str::parse::<f64>)) {
                (Some(term), Some(Ok(weight))) if weight.is_finite() => {
                    self.insert_if_absent(&term.to_lowercase(), weight);
                    seeded += 1;
                }
                _ => warn!(line = index + 1, path = %path.display(), "skipping malformed term weight line"),
            }
        }
        info!(seeded, path = %path.display(), "seeded term weight cache");
        Ok(seeded)
    }
}

/// Tokens never considered as tags.
#[derive(Debug, Clone)]
pub struct StopWords {
    words: FxHashSet<String>,
}

impl Default for StopWords {
    fn default() -> Self {
        Self::builtin()
    }
}

impl StopWords {
    #[must_use]
    pub fn builtin() -> Self {
        Self {
            words: BUILTIN_STOPWORDS.iter().map(|w| (*w).to_string()).collect(),
        }
    }

    #[must_use]
    pub fn empty() -> Self {
        Self {
            words: FxHashSet::default(),
        }
    }

    /// Adds every non-empty line of `path` to the list.
    ///
    /// # Errors
    /// Fails when the file cannot be read.
    pub fn extend_from_file(&mut self, path: &Path) -> Result<usize> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read stop word file {}", path.display()))?;
        let before = self.words.len();
        self.words.extend(
            raw.lines()
                .map(str::trim)
                .filter(|line| !line.is_empty())
                .map(str::to_lowercase),
        );
        Ok(self.words.len() - before)
    }

    #[must_use]
    pub fn contains(&self, token: &str) -> bool {
        self.words.contains(token)
    }
}

/// A ranked tag candidate.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RankedTag {
    pub term: String,
    pub weight: f64,
}

/// Ranks a cluster's tokens by TF-IDF.
#[derive(Debug, Clone)]
pub struct TagExtractor {
    cache: Arc<TermWeightCache>,
    stopwords: Arc<StopWords>,
}

impl TagExtractor {
    #[must_use]
    pub fn new(cache: Arc<TermWeightCache>, stopwords: StopWords) -> Self {
        Self {
            cache,
            stopwords: Arc::new(stopwords),
        }
    }

    #[must_use]
    pub fn cache(&self) -> &Arc<TermWeightCache> {
        &self.cache
    }

    /// Returns at most `top_n` terms, weight descending, ties by term ascending.
    ///
    /// Stop words and blank tokens are excluded before term frequencies are
    /// computed. The only side effect is populating the cache for unseen terms.
    pub fn extract_tags<I, S>(&self, tokens: I, top_n: usize) -> Vec<RankedTag>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        if top_n == 0 {
            return Vec::new();
        }

        let mut frequencies: FxHashMap<String, usize> = FxHashMap::default();
        let mut total = 0usize;
        for token in tokens {
            let token = token.as_ref().trim();
            if token.is_empty() || self.stopwords.contains(token) {
                continue;
            }
            *frequencies.entry(token.to_string()).or_insert(0) += 1;
            total += 1;
        }
        if total == 0 {
            return Vec::new();
        }

        #[allow(clippy::cast_precision_loss)]
        let total = total as f64;
        let mut ranked: Vec<RankedTag> = frequencies
            .into_iter()
            .map(|(term, count)| {
                #[allow(clippy::cast_precision_loss)]
                let tf = count as f64 / total;
                let weight = tf * self.cache.weight(&term);
                RankedTag { term, weight }
            })
            .collect();

        ranked.sort_by(|a, b| {
            b.weight
                .total_cmp(&a.weight)
                .then_with(|| a.term.cmp(&b.term))
        });
        ranked.truncate(top_n);
        ranked
    }
}
