//! Prometheus metrics for the report lifecycle and clustering runs.
use prometheus::{
    Counter, Gauge, Histogram, Registry, register_counter_with_registry,
    register_gauge_with_registry, register_histogram_with_registry,
};
use std::sync::Arc;

use crate::pipeline::clustering::ClusteringStats;

#[derive(Debug, Clone)]
pub struct Metrics {
    pub reports_requested: Counter,
    pub reports_deduplicated: Counter,
    pub reports_finished: Counter,
    pub reports_failed: Counter,
    pub reports_deleted: Counter,
    pub clusters_created: Counter,
    pub clusters_pruned: Counter,
    pub sentences_skipped: Counter,
    pub early_stops: Counter,
    pub similarity_retries: Counter,

    pub clustering_duration: Histogram,
    pub feedback_fetch_duration: Histogram,

    pub active_runs: Gauge,
}

impl Metrics {
    /// Registers every metric against `registry`.
    ///
    /// # Errors
    /// Fails when a metric with the same name is already registered.
    pub fn new(registry: Arc<Registry>) -> Result<Self, prometheus::Error> {
        Ok(Self {
            reports_requested: register_counter_with_registry!(
                "selflearn_reports_requested_total",
                "Total number of report requests accepted",
                registry
            )?,
            reports_deduplicated: register_counter_with_registry!(
                "selflearn_reports_deduplicated_total",
                "Report requests answered with an existing report",
                registry
            )?,
            reports_finished: register_counter_with_registry!(
                "selflearn_reports_finished_total",
                "Clustering runs that finished",
                registry
            )?,
            reports_failed: register_counter_with_registry!(
                "selflearn_reports_failed_total",
                "Clustering runs that failed",
                registry
            )?,
            reports_deleted: register_counter_with_registry!(
                "selflearn_reports_deleted_total",
                "Reports deleted through the API",
                registry
            )?,
            clusters_created: register_counter_with_registry!(
                "selflearn_clusters_created_total",
                "Clusters that survived pruning and were persisted",
                registry
            )?,
            clusters_pruned: register_counter_with_registry!(
                "selflearn_clusters_pruned_total",
                "Clusters dropped for being below the minimum size",
                registry
            )?,
            sentences_skipped: register_counter_with_registry!(
                "selflearn_sentences_skipped_total",
                "Sentences skipped because similarity was unavailable",
                registry
            )?,
            early_stops: register_counter_with_registry!(
                "selflearn_early_stops_total",
                "Clustering runs that stopped before exhausting input",
                registry
            )?,
            similarity_retries: register_counter_with_registry!(
                "selflearn_similarity_retries_total",
                "Retried similarity service requests",
                registry
            )?,
            clustering_duration: register_histogram_with_registry!(
                "selflearn_clustering_duration_seconds",
                "Wall time of a clustering run",
                vec![0.1, 0.5, 1.0, 5.0, 15.0, 60.0, 300.0, 900.0],
                registry
            )?,
            feedback_fetch_duration: register_histogram_with_registry!(
                "selflearn_feedback_fetch_duration_seconds",
                "Time spent reading the feedback window",
                vec![0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 30.0],
                registry
            )?,
            active_runs: register_gauge_with_registry!(
                "selflearn_active_runs",
                "Clustering runs currently in flight",
                registry
            )?,
        })
    }

    #[allow(clippy::cast_precision_loss)]
    pub fn record_run(&self, stats: &ClusteringStats) {
        self.clusters_created
            .inc_by((stats.clusters_formed - stats.clusters_pruned) as f64);
        self.clusters_pruned.inc_by(stats.clusters_pruned as f64);
        self.sentences_skipped.inc_by(stats.skipped as f64);
        if stats.early_stopped {
            self.early_stops.inc();
        }
    }
}
