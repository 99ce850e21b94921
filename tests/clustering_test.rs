use std::num::NonZeroUsize;
use std::sync::Arc;

use chrono::DateTime;
use futures::future::join_all;

use selflearn_worker::pipeline::clustering::{ClusteringConfig, ClusteringEngine};
use selflearn_worker::pipeline::similarity::LexicalSimilarity;
use selflearn_worker::pipeline::tags::{StopWords, TagExtractor, TermWeightCache};
use selflearn_worker::store::models::Feedback;

const SUFFIXES: [&str; 5] = ["today", "again", "now", "quickly", "online"];
const SINGLETONS: [&str; 5] = [
    "what is the weather in tokyo",
    "recommend a good pasta recipe",
    "who won the football match yesterday",
    "translate hello into french",
    "book a taxi to the airport",
];

fn feedback(id: i64, text: String) -> Feedback {
    Feedback {
        id,
        text,
        timestamp: DateTime::from_timestamp(1_700_000_000 + id, 0).expect("timestamp"),
    }
}

/// 500 rephrasings of one question followed by 5 unrelated ones.
fn password_questions() -> Vec<Feedback> {
    let mut items: Vec<Feedback> = (0..500_i64)
        .map(|id| {
            let suffix = SUFFIXES[usize::try_from(id).expect("index") % SUFFIXES.len()];
            feedback(id + 1, format!("how can i reset my account password {suffix}"))
        })
        .collect();
    items.extend(
        SINGLETONS
            .iter()
            .zip(501_i64..)
            .map(|(text, id)| feedback(id, (*text).to_string())),
    );
    items
}

fn engine(cache: Arc<TermWeightCache>) -> ClusteringEngine {
    ClusteringEngine::new(
        Arc::new(LexicalSimilarity),
        TagExtractor::new(cache, StopWords::builtin()),
    )
}

fn config(early_stop_threshold: usize) -> ClusteringConfig {
    ClusteringConfig {
        batch_size: NonZeroUsize::new(20).expect("non-zero"),
        early_stop_threshold: NonZeroUsize::new(early_stop_threshold).expect("non-zero"),
        min_cluster_size: 10,
        ..ClusteringConfig::default()
    }
}

#[tokio::test]
async fn near_duplicates_collapse_into_one_cluster_before_early_stop() {
    let engine = engine(Arc::new(TermWeightCache::default()));
    let result = engine.cluster(&password_questions(), &config(3)).await;

    // The first batch opens the cluster, the next three add nothing new.
    assert_eq!(result.stats.batches, 4);
    assert_eq!(result.stats.consumed, 80);
    assert!(result.stats.early_stopped);
    assert_eq!(result.clusters.len(), 1);

    let cluster = &result.clusters[0];
    assert_eq!(cluster.members.len(), 80);
    assert_eq!(cluster.members[0].id, 1);
    let tags: Vec<&str> = cluster.tags.iter().map(|tag| tag.term.as_str()).collect();
    assert_eq!(tags, vec!["account", "password"]);
}

#[tokio::test]
async fn full_pass_prunes_singletons() {
    let engine = engine(Arc::new(TermWeightCache::default()));
    let result = engine.cluster(&password_questions(), &config(1_000)).await;

    assert!(!result.stats.early_stopped);
    assert_eq!(result.stats.consumed, 505);
    assert_eq!(result.stats.clusters_formed, 6);
    assert_eq!(result.stats.clusters_pruned, 5);
    assert_eq!(result.clusters.len(), 1);
    assert_eq!(result.clusters[0].members.len(), 500);
    assert!(
        result.clusters[0]
            .members
            .iter()
            .all(|member| member.text.contains("password"))
    );
}

#[tokio::test]
async fn seeded_weights_reorder_tags() {
    let cache = Arc::new(TermWeightCache::default());
    cache.insert_if_absent("account", 1.0);
    let engine = engine(Arc::clone(&cache));

    let result = engine.cluster(&password_questions(), &config(1_000)).await;
    let tags: Vec<&str> = result.clusters[0]
        .tags
        .iter()
        .map(|tag| tag.term.as_str())
        .collect();
    assert_eq!(tags, vec!["password", "reset"]);
    assert!(result.clusters[0].tags[0].weight >= result.clusters[0].tags[1].weight);
    assert_eq!(cache.get("account"), Some(1.0));
}

#[tokio::test]
async fn concurrent_runs_share_the_cache_and_agree() {
    let cache = Arc::new(TermWeightCache::default());
    let engine = engine(Arc::clone(&cache));
    let input = password_questions();
    let config = config(1_000);

    let runs = (0..8).map(|_| engine.cluster(&input, &config));
    let results = join_all(runs).await;

    let expected: Vec<Vec<i64>> = results[0]
        .clusters
        .iter()
        .map(|cluster| cluster.member_ids())
        .collect();
    for result in &results {
        let ids: Vec<Vec<i64>> = result
            .clusters
            .iter()
            .map(|cluster| cluster.member_ids())
            .collect();
        assert_eq!(ids, expected);
        assert_eq!(result.clusters[0].tags, results[0].clusters[0].tags);
    }
    assert_eq!(cache.get("password"), Some(10.0));
}
