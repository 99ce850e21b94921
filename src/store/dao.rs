//! Data access for reports, clusters and the feedback they are built from.

mod memory;
mod postgres;

use anyhow::Result;
use async_trait::async_trait;

use super::models::{
    Cluster, ClusterId, ClusterMember, Feedback, NewCluster, Page, QuestionType, Report,
    ReportFilter, ReportId, ReportKey, TimeWindow,
};

pub use memory::{InMemoryFeedbackSource, InMemoryReportStore};
pub use postgres::{PgFeedbackSource, PgReportStore};

/// Outcome of the dedup-aware insert.
#[derive(Debug, Clone, PartialEq)]
pub struct CreateOutcome {
    pub report: Report,
    /// `false` when a report already existed for the same key.
    pub created: bool,
}

/// Durable storage for reports, clusters and cluster membership.
#[async_trait]
pub trait ReportStore: Send + Sync {
    /// Inserts a `running` report for `key` unless one exists, atomically.
    async fn create_or_get(&self, key: &ReportKey) -> Result<CreateOutcome>;

    async fn get_report(&self, id: ReportId) -> Result<Option<Report>>;

    /// Newest first, bounded by `filter.limit`.
    async fn list_reports(&self, filter: &ReportFilter) -> Result<Vec<Report>>;

    /// Removes the report and its clusters. Returns `false` if it did not exist.
    async fn delete_report(&self, id: ReportId) -> Result<bool>;

    /// Persists clusters and flips `running` to `finished` in one transaction.
    ///
    /// Returns `false` without writing when the report is gone or already terminal.
    async fn complete_report(&self, id: ReportId, clusters: &[NewCluster]) -> Result<bool>;

    /// Flips `running` to `failed`. Returns `false` when the report is gone or already terminal.
    async fn fail_report(&self, id: ReportId, reason: &str) -> Result<bool>;

    /// Fails every report still `running`. Used once at startup.
    async fn fail_running_reports(&self, reason: &str) -> Result<u64>;

    async fn list_clusters(&self, report_id: ReportId) -> Result<Vec<Cluster>>;

    /// `None` when the cluster does not belong to the report.
    async fn list_cluster_members(
        &self,
        report_id: ReportId,
        cluster_id: ClusterId,
        page: Page,
    ) -> Result<Option<Vec<ClusterMember>>>;

    async fn ping(&self) -> Result<()>;
}

/// Read-only source of feedback sentences.
#[async_trait]
pub trait FeedbackSource: Send + Sync {
    /// Feedback within `window` in arrival order, at most `limit` items.
    async fn fetch_window(
        &self,
        tenant_id: &str,
        question_type: QuestionType,
        window: &TimeWindow,
        limit: usize,
    ) -> Result<Vec<Feedback>>;
}
