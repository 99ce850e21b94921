//! Error taxonomy shared by the report lifecycle and the clustering pipeline.

use thiserror::Error;

use crate::store::models::{ReportId, ReportStatus};

/// Errors surfaced by [`crate::report::ReportManager`] operations.
#[derive(Debug, Error)]
pub enum ReportError {
    /// Malformed window, unknown question type or missing tenant context.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("report {0} not found")]
    NotFound(ReportId),
    #[error("cluster {cluster_id} not found in report {report_id}")]
    ClusterNotFound { report_id: ReportId, cluster_id: i64 },
    /// The report exists but has no clusters to show yet (or never will).
    #[error("report {id} is {status}, clusters are only available once finished")]
    NotReady { id: ReportId, status: ReportStatus },
    #[error("storage error: {0:#}")]
    Storage(#[source] anyhow::Error),
}

impl ReportError {
    pub(crate) fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidArgument(message.into())
    }
}

/// Per-call failure of a [`crate::pipeline::similarity::SimilarityProvider`].
///
/// Recovered inside the clustering loop by skipping the sentence.
#[derive(Debug, Error)]
pub enum SimilarityError {
    #[error("similarity service unavailable: {0:#}")]
    Unavailable(#[source] anyhow::Error),
    #[error("similarity response carried {got} scores for {expected} candidates")]
    MalformedResponse { expected: usize, got: usize },
}
