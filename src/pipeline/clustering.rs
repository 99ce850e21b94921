//! Incremental first-fit clustering of feedback sentences.
//!
//! Sentences are consumed batch by batch in input order. Each sentence joins
//! the existing cluster whose representative scores highest above the
//! acceptance threshold, or opens a new cluster. Earlier assignments are never
//! revisited, so the result depends on input order.

use std::num::NonZeroUsize;
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, warn};

use super::similarity::SimilarityProvider;
use super::tags::{RankedTag, TagExtractor};
use super::tokenize::tokenize;
use crate::store::models::{Feedback, NewCluster};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClusteringConfig {
    pub batch_size: NonZeroUsize,
    /// Consecutive batches without a new cluster after which input is abandoned.
    pub early_stop_threshold: NonZeroUsize,
    pub min_cluster_size: usize,
    pub max_input_size: usize,
    /// A sentence joins a cluster only when its score is strictly above this.
    pub similarity_threshold: f32,
    pub tag_count: usize,
}

impl Default for ClusteringConfig {
    fn default() -> Self {
        Self {
            batch_size: NonZeroUsize::new(50).unwrap_or(NonZeroUsize::MIN),
            early_stop_threshold: NonZeroUsize::new(3).unwrap_or(NonZeroUsize::MIN),
            min_cluster_size: 10,
            max_input_size: 10_000,
            similarity_threshold: 0.75,
            tag_count: 2,
        }
    }
}

impl From<&crate::config::Config> for ClusteringConfig {
    fn from(config: &crate::config::Config) -> Self {
        Self {
            batch_size: config.cluster_batch_size(),
            early_stop_threshold: config.early_stop_threshold(),
            min_cluster_size: config.min_cluster_size(),
            max_input_size: config.max_input_size(),
            similarity_threshold: config.similarity_threshold(),
            tag_count: config.tag_count(),
        }
    }
}

/// Counters describing one clustering run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ClusteringStats {
    /// Items offered after applying `max_input_size`.
    pub input_size: usize,
    /// Items actually read before stopping.
    pub consumed: usize,
    pub batches: usize,
    /// Items dropped because the similarity provider failed for them.
    pub skipped: usize,
    pub early_stopped: bool,
    pub clusters_formed: usize,
    pub clusters_pruned: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClusterOutcome {
    pub members: Vec<Feedback>,
    pub tags: Vec<RankedTag>,
}

impl ClusterOutcome {
    #[must_use]
    pub fn member_ids(&self) -> Vec<i64> {
        self.members.iter().map(|member| member.id).collect()
    }
}

impl From<ClusterOutcome> for NewCluster {
    fn from(outcome: ClusterOutcome) -> Self {
        Self {
            members: outcome.members,
            tags: outcome.tags.into_iter().map(|tag| tag.term).collect(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ClusteringResult {
    pub clusters: Vec<ClusterOutcome>,
    pub stats: ClusteringStats,
}

struct WorkingCluster<'a> {
    representative: &'a str,
    members: Vec<&'a Feedback>,
}

/// Stateless between calls; every run owns its working cluster list.
#[derive(Clone)]
pub struct ClusteringEngine {
    similarity: Arc<dyn SimilarityProvider>,
    tags: TagExtractor,
}

impl std::fmt::Debug for ClusteringEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusteringEngine")
            .field("similarity", &"<dyn SimilarityProvider>")
            .field("tags", &self.tags)
            .finish()
    }
}

impl ClusteringEngine {
    #[must_use]
    pub fn new(similarity: Arc<dyn SimilarityProvider>, tags: TagExtractor) -> Self {
        Self { similarity, tags }
    }

    #[must_use]
    pub fn tag_extractor(&self) -> &TagExtractor {
        &self.tags
    }

    /// Clusters `feedback` in input order.
    ///
    /// Items past `config.max_input_size` are never read. Empty input yields an
    /// empty result.
    pub async fn cluster(&self, feedback: &[Feedback], config: &ClusteringConfig) -> ClusteringResult {
        let input = &feedback[..feedback.len().min(config.max_input_size)];
        let mut stats = ClusteringStats {
            input_size: input.len(),
            ..ClusteringStats::default()
        };
        let mut working: Vec<WorkingCluster<'_>> = Vec::new();
        let mut stale_batches = 0usize;

        for batch in input.chunks(config.batch_size.get()) {
            let clusters_before = working.len();
            for item in batch {
                stats.consumed += 1;
                match self.assign(item, &working, config.similarity_threshold).await {
                    Ok(Some(index)) => working[index].members.push(item),
                    Ok(None) => working.push(WorkingCluster {
                        representative: &item.text,
                        members: vec![item],
                    }),
                    Err(error) => {
                        stats.skipped += 1;
                        warn!(feedback_id = item.id, error = %error, "skipping sentence, similarity unavailable");
                    }
                }
            }
            stats.batches += 1;

            if working.len() == clusters_before {
                stale_batches += 1;
            } else {
                stale_batches = 0;
            }
            debug!(
                batch = stats.batches,
                clusters = working.len(),
                stale_batches,
                "clustering batch processed"
            );
            if stale_batches >= config.early_stop_threshold.get() {
                stats.early_stopped = stats.consumed < input.len();
                break;
            }
        }

        stats.clusters_formed = working.len();
        let survivors: Vec<WorkingCluster<'_>> = working
            .into_iter()
            .filter(|cluster| cluster.members.len() >= config.min_cluster_size)
            .collect();
        stats.clusters_pruned = stats.clusters_formed - survivors.len();

        let clusters = survivors
            .into_iter()
            .map(|cluster| {
                let tokens = cluster
                    .members
                    .iter()
                    .flat_map(|member| tokenize(&member.text));
                let tags = self.tags.extract_tags(tokens, config.tag_count);
                ClusterOutcome {
                    members: cluster.members.into_iter().cloned().collect(),
                    tags,
                }
            })
            .collect();

        ClusteringResult { clusters, stats }
    }

    /// Index of the best cluster above `threshold`, `None` to open a new one.
    ///
    /// A representative with the same text always accepts. Ties keep the
    /// earliest cluster.
    async fn assign(
        &self,
        item: &Feedback,
        working: &[WorkingCluster<'_>],
        threshold: f32,
    ) -> Result<Option<usize>, crate::error::SimilarityError> {
        if working.is_empty() {
            return Ok(None);
        }
        let candidates: Vec<&str> = working.iter().map(|cluster| cluster.representative).collect();
        let scores = self.similarity.score(&item.text, &candidates).await?;
        if scores.len() != candidates.len() {
            return Err(crate::error::SimilarityError::MalformedResponse {
                expected: candidates.len(),
                got: scores.len(),
            });
        }

        let mut best: Option<(usize, f32)> = None;
        for (index, score) in scores.into_iter().enumerate() {
            // Identical text is self-similar, whatever the provider or threshold says.
            let score = if candidates[index] == item.text {
                f32::INFINITY
            } else {
                score
            };
            if score > threshold && best.is_none_or(|(_, top)| score > top) {
                best = Some((index, score));
            }
        }
        Ok(best.map(|(index, _)| index))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::error::SimilarityError;
    use crate::pipeline::similarity::LexicalSimilarity;
    use crate::pipeline::tags::{StopWords, TermWeightCache};

    fn feedback(id: i64, text: &str) -> Feedback {
        Feedback {
            id,
            text: text.to_string(),
            timestamp: chrono::DateTime::from_timestamp(id, 0).expect("timestamp"),
        }
    }

    fn engine(similarity: Arc<dyn SimilarityProvider>) -> ClusteringEngine {
        let tags = TagExtractor::new(Arc::new(TermWeightCache::default()), StopWords::builtin());
        ClusteringEngine::new(similarity, tags)
    }

    fn config(batch: usize, early_stop: usize, min_size: usize) -> ClusteringConfig {
        ClusteringConfig {
            batch_size: NonZeroUsize::new(batch).unwrap(),
            early_stop_threshold: NonZeroUsize::new(early_stop).unwrap(),
            min_cluster_size: min_size,
            ..ClusteringConfig::default()
        }
    }

    /// Scores by exact text equality and counts calls.
    #[derive(Default)]
    struct ExactMatch {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl SimilarityProvider for ExactMatch {
        async fn score(
            &self,
            sentence: &str,
            candidates: &[&str],
        ) -> Result<Vec<f32>, SimilarityError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(candidates
                .iter()
                .map(|c| if *c == sentence { 1.0 } else { 0.0 })
                .collect())
        }
    }

    /// Fails for sentences listed in `unavailable`.
    struct Flaky {
        unavailable: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl SimilarityProvider for Flaky {
        async fn score(
            &self,
            sentence: &str,
            candidates: &[&str],
        ) -> Result<Vec<f32>, SimilarityError> {
            if self.unavailable.lock().unwrap().iter().any(|s| s == sentence) {
                return Err(SimilarityError::Unavailable(anyhow::anyhow!("timeout")));
            }
            LexicalSimilarity.score(sentence, candidates).await
        }
    }

    #[tokio::test]
    async fn empty_input_yields_empty_result() {
        let result = engine(Arc::new(LexicalSimilarity))
            .cluster(&[], &ClusteringConfig::default())
            .await;
        assert!(result.clusters.is_empty());
        assert_eq!(result.stats.batches, 0);
    }

    #[tokio::test]
    async fn repeated_sentence_collapses_into_one_cluster() {
        let input: Vec<Feedback> = (0..30).map(|i| feedback(i, "where is my order")).collect();
        let result = engine(Arc::new(LexicalSimilarity))
            .cluster(&input, &config(10, 100, 10))
            .await;

        assert_eq!(result.clusters.len(), 1);
        assert_eq!(result.clusters[0].members.len(), 30);
        let tags: Vec<&str> = result.clusters[0].tags.iter().map(|t| t.term.as_str()).collect();
        assert_eq!(tags, vec!["order"]);
    }

    #[tokio::test]
    async fn identical_text_joins_even_at_maximum_threshold() {
        let input: Vec<Feedback> = (0..30).map(|i| feedback(i, "where is my order")).collect();
        let config = ClusteringConfig {
            similarity_threshold: 1.0,
            ..config(10, 3, 10)
        };
        let result = engine(Arc::new(LexicalSimilarity)).cluster(&input, &config).await;

        assert_eq!(result.stats.clusters_formed, 1);
        assert_eq!(result.clusters.len(), 1);
        assert_eq!(result.clusters[0].members.len(), 30);
    }

    #[tokio::test]
    async fn near_duplicate_needs_score_strictly_above_threshold() {
        let input = vec![
            feedback(1, "reset my password"),
            feedback(2, "reset my password now"),
        ];
        let config = ClusteringConfig {
            similarity_threshold: 1.0,
            ..config(10, 3, 1)
        };
        let result = engine(Arc::new(LexicalSimilarity)).cluster(&input, &config).await;

        assert_eq!(result.stats.clusters_formed, 2);
    }

    #[tokio::test]
    async fn early_stop_after_stale_batches() {
        let input: Vec<Feedback> = (0..100).map(|i| feedback(i, "same question")).collect();
        let provider = Arc::new(ExactMatch::default());
        let result = engine(provider.clone())
            .cluster(&input, &config(10, 3, 1))
            .await;

        // Batch 1 opens the cluster, batches 2..=4 are stale.
        assert_eq!(result.stats.batches, 4);
        assert_eq!(result.stats.consumed, 40);
        assert!(result.stats.early_stopped);
        assert_eq!(result.clusters[0].members.len(), 40);
        // The very first sentence needs no provider call.
        assert_eq!(provider.calls.load(Ordering::SeqCst), 39);
    }

    #[tokio::test]
    async fn novel_topics_reset_the_stale_counter() {
        let mut input = Vec::new();
        for batch in 0..6 {
            for i in 0..5 {
                let text = if i == 0 { format!("topic {batch}") } else { "topic 0".to_string() };
                input.push(feedback(batch * 5 + i, &text));
            }
        }
        let result = engine(Arc::new(ExactMatch::default()))
            .cluster(&input, &config(5, 1, 1))
            .await;

        // Batch 0 and every later batch open a new cluster, so nothing is abandoned.
        assert_eq!(result.stats.consumed, 30);
        assert!(!result.stats.early_stopped);
        assert_eq!(result.stats.clusters_formed, 6);
    }

    #[tokio::test]
    async fn small_clusters_are_pruned() {
        let mut input: Vec<Feedback> = (0..12).map(|i| feedback(i, "cancel subscription")).collect();
        input.extend((12..15).map(|i| feedback(i, "printer jammed")));
        let result = engine(Arc::new(LexicalSimilarity))
            .cluster(&input, &config(50, 3, 10))
            .await;

        assert_eq!(result.clusters.len(), 1);
        assert_eq!(result.stats.clusters_formed, 2);
        assert_eq!(result.stats.clusters_pruned, 1);
        assert!(result.clusters.iter().all(|c| c.members.len() >= 10));
    }

    #[tokio::test]
    async fn input_beyond_cap_is_never_read() {
        let input: Vec<Feedback> = (0..50).map(|i| feedback(i, "same question")).collect();
        let cfg = ClusteringConfig {
            max_input_size: 20,
            ..config(10, 100, 1)
        };
        let result = engine(Arc::new(ExactMatch::default())).cluster(&input, &cfg).await;

        assert_eq!(result.stats.input_size, 20);
        assert_eq!(result.stats.consumed, 20);
        assert_eq!(result.clusters[0].member_ids(), (0..20).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn unavailable_similarity_skips_sentence() {
        let provider = Flaky {
            unavailable: Mutex::new(vec!["refund status".to_string()]),
        };
        let input = vec![
            feedback(1, "refund please"),
            feedback(2, "refund status"),
            feedback(3, "refund please"),
        ];
        let result = engine(Arc::new(provider))
            .cluster(&input, &config(10, 3, 1))
            .await;

        assert_eq!(result.stats.skipped, 1);
        assert_eq!(result.clusters.len(), 1);
        assert_eq!(result.clusters[0].member_ids(), vec![1, 3]);
    }

    #[tokio::test]
    async fn first_fit_picks_highest_score_and_keeps_order() {
        let input = vec![
            feedback(1, "track my parcel"),
            feedback(2, "cancel my order"),
            feedback(3, "cancel my order today"),
            feedback(4, "track my parcel now"),
        ];
        let cfg = ClusteringConfig {
            similarity_threshold: 0.5,
            ..config(2, 10, 1)
        };
        let result = engine(Arc::new(LexicalSimilarity)).cluster(&input, &cfg).await;

        let groups: Vec<Vec<i64>> = result.clusters.iter().map(ClusterOutcome::member_ids).collect();
        assert_eq!(groups, vec![vec![1, 4], vec![2, 3]]);
    }

    #[tokio::test]
    async fn malformed_scores_count_as_skipped() {
        struct Short;

        #[async_trait]
        impl SimilarityProvider for Short {
            async fn score(&self, _: &str, _: &[&str]) -> Result<Vec<f32>, SimilarityError> {
                Ok(Vec::new())
            }
        }

        let input = vec![feedback(1, "a b"), feedback(2, "a b")];
        let result = engine(Arc::new(Short)).cluster(&input, &config(10, 3, 1)).await;
        assert_eq!(result.stats.skipped, 1);
        assert_eq!(result.clusters.len(), 1);
    }
}
