use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::task::JoinError;
use tracing::{debug, error, info, warn};

use super::tracker::RunTracker;
use crate::error::ReportError;
use crate::observability::metrics::Metrics;
use crate::pipeline::clustering::{ClusteringConfig, ClusteringEngine, ClusteringResult};
use crate::store::dao::{FeedbackSource, ReportStore};
use crate::util::retry::RetryConfig;
use crate::store::models::{
    Cluster, ClusterId, ClusterMember, NewCluster, Page, QuestionType, Report, ReportFilter,
    ReportId, ReportKey, ReportStatus, TimeWindow,
};

/// Reason stored on reports abandoned by a previous process.
pub const INTERRUPTED_REASON: &str = "interrupted by worker restart";

/// Backoff for the single terminal write of a run.
const TERMINAL_WRITE_RETRY: RetryConfig = RetryConfig::new(5, 100, 2_000);

/// Answer to a report request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RequestOutcome {
    pub report: Report,
    /// `false` when an existing report for the same window was returned.
    pub created: bool,
}

/// Owns the report lifecycle and the clustering runs behind it.
///
/// A new report is inserted as `running` and its clustering run is spawned
/// onto the runtime; the caller only ever polls the report row. Every run
/// ends with exactly one terminal write, `finished` or `failed`, including
/// when the run panics.
pub struct ReportManager {
    store: Arc<dyn ReportStore>,
    feedback: Arc<dyn FeedbackSource>,
    engine: ClusteringEngine,
    config: ClusteringConfig,
    metrics: Arc<Metrics>,
    runs: RunTracker,
}

impl std::fmt::Debug for ReportManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReportManager")
            .field("engine", &self.engine)
            .field("config", &self.config)
            .field("active_runs", &self.runs.active())
            .finish_non_exhaustive()
    }
}

impl ReportManager {
    #[must_use]
    pub fn new(
        store: Arc<dyn ReportStore>,
        feedback: Arc<dyn FeedbackSource>,
        engine: ClusteringEngine,
        config: ClusteringConfig,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            store,
            feedback,
            engine,
            config,
            metrics,
            runs: RunTracker::default(),
        }
    }

    /// Returns the report for this window, starting a clustering run only when
    /// the report did not exist yet.
    ///
    /// # Errors
    /// [`ReportError::InvalidArgument`] for an empty tenant or an inverted
    /// window, [`ReportError::Storage`] when the insert fails (no run is started).
    pub async fn request_report(
        &self,
        tenant_id: &str,
        question_type: QuestionType,
        window_start: DateTime<Utc>,
        window_end: DateTime<Utc>,
    ) -> Result<RequestOutcome, ReportError> {
        let tenant_id = tenant_id.trim();
        if tenant_id.is_empty() {
            return Err(ReportError::invalid("tenant id is required"));
        }
        let window = TimeWindow::new(window_start, window_end)
            .ok_or_else(|| ReportError::invalid("start_time must not be after end_time"))?;

        let key = ReportKey {
            tenant_id: tenant_id.to_string(),
            question_type,
            window,
        };
        let outcome = self
            .store
            .create_or_get(&key)
            .await
            .map_err(ReportError::Storage)?;
        self.metrics.reports_requested.inc();

        if !outcome.created {
            self.metrics.reports_deduplicated.inc();
            info!(
                report_id = outcome.report.id,
                tenant_id,
                %question_type,
                status = %outcome.report.status,
                "report already exists for window"
            );
            return Ok(RequestOutcome {
                report: outcome.report,
                created: false,
            });
        }

        info!(
            report_id = outcome.report.id,
            tenant_id,
            %question_type,
            window_start = %window.start(),
            window_end = %window.end(),
            "report created, starting clustering run"
        );
        self.launch(&outcome.report);

        Ok(RequestOutcome {
            report: outcome.report,
            created: true,
        })
    }

    /// # Errors
    /// [`ReportError::NotFound`] when absent.
    pub async fn get_report(&self, id: ReportId) -> Result<Report, ReportError> {
        self.store
            .get_report(id)
            .await
            .map_err(ReportError::Storage)?
            .ok_or(ReportError::NotFound(id))
    }

    /// Newest first, at most `filter.limit` reports.
    ///
    /// # Errors
    /// [`ReportError::Storage`] when the store cannot be read.
    pub async fn list_reports(&self, filter: &ReportFilter) -> Result<Vec<Report>, ReportError> {
        self.store
            .list_reports(filter)
            .await
            .map_err(ReportError::Storage)
    }

    /// Deletes the report and its clusters, aborting its run if still in flight.
    ///
    /// # Errors
    /// [`ReportError::NotFound`] when absent.
    pub async fn delete_report(&self, id: ReportId) -> Result<(), ReportError> {
        let deleted = self
            .store
            .delete_report(id)
            .await
            .map_err(ReportError::Storage)?;
        if !deleted {
            return Err(ReportError::NotFound(id));
        }
        self.metrics.reports_deleted.inc();

        if self.runs.cancel(id) {
            info!(report_id = id, "report deleted, in-flight clustering run aborted");
        } else {
            info!(report_id = id, "report deleted");
        }
        Ok(())
    }

    /// Clusters of a finished report, in creation order.
    ///
    /// # Errors
    /// [`ReportError::NotFound`] when absent, [`ReportError::NotReady`] unless finished.
    pub async fn clusters(&self, id: ReportId) -> Result<Vec<Cluster>, ReportError> {
        self.finished_report(id).await?;
        self.store
            .list_clusters(id)
            .await
            .map_err(ReportError::Storage)
    }

    /// One page of a cluster's member questions.
    ///
    /// # Errors
    /// [`ReportError::ClusterNotFound`] when the cluster is not part of the report.
    pub async fn cluster_members(
        &self,
        report_id: ReportId,
        cluster_id: ClusterId,
        page: Page,
    ) -> Result<Vec<ClusterMember>, ReportError> {
        self.finished_report(report_id).await?;
        self.store
            .list_cluster_members(report_id, cluster_id, page)
            .await
            .map_err(ReportError::Storage)?
            .ok_or(ReportError::ClusterNotFound {
                report_id,
                cluster_id,
            })
    }

    /// Fails reports a previous process left `running`.
    ///
    /// Call once at startup, before serving requests.
    ///
    /// # Errors
    /// [`ReportError::Storage`] when the update fails.
    pub async fn recover_interrupted(&self) -> Result<u64, ReportError> {
        let failed = self
            .store
            .fail_running_reports(INTERRUPTED_REASON)
            .await
            .map_err(ReportError::Storage)?;
        if failed > 0 {
            warn!(failed, "marked interrupted reports as failed");
            #[allow(clippy::cast_precision_loss)]
            let failed_count = failed as f64;
            self.metrics.reports_failed.inc_by(failed_count);
        }
        Ok(failed)
    }

    /// Number of clustering runs in flight.
    #[must_use]
    pub fn active_runs(&self) -> usize {
        self.runs.active()
    }

    #[must_use]
    pub fn is_running(&self, id: ReportId) -> bool {
        self.runs.is_running(id)
    }

    /// # Errors
    /// [`ReportError::Storage`] when the store is unreachable.
    pub async fn ping(&self) -> Result<(), ReportError> {
        self.store.ping().await.map_err(ReportError::Storage)
    }

    async fn finished_report(&self, id: ReportId) -> Result<Report, ReportError> {
        let report = self.get_report(id).await?;
        if report.status != ReportStatus::Finished {
            return Err(ReportError::NotReady {
                id,
                status: report.status,
            });
        }
        Ok(report)
    }

    fn launch(&self, report: &Report) {
        let run = ClusteringRun {
            feedback: Arc::clone(&self.feedback),
            engine: self.engine.clone(),
            config: self.config,
            metrics: Arc::clone(&self.metrics),
            report: report.clone(),
        };
        let work = tokio::spawn(run.execute());
        self.runs.register(report.id, work.abort_handle());
        self.metrics.active_runs.inc();

        // Spawned after registration so `finish` can never precede `register`.
        let settle = Settle {
            store: Arc::clone(&self.store),
            metrics: Arc::clone(&self.metrics),
            retry: TERMINAL_WRITE_RETRY,
            report_id: report.id,
        };
        let runs = self.runs.clone();
        tokio::spawn(async move {
            let outcome = work.await;
            runs.finish(settle.report_id);
            settle.metrics.active_runs.dec();
            settle.apply(outcome).await;
        });
    }
}

/// Everything a detached run needs, owned.
struct ClusteringRun {
    feedback: Arc<dyn FeedbackSource>,
    engine: ClusteringEngine,
    config: ClusteringConfig,
    metrics: Arc<Metrics>,
    report: Report,
}

impl ClusteringRun {
    async fn execute(self) -> anyhow::Result<ClusteringResult> {
        let window = TimeWindow::new(self.report.window_start, self.report.window_end)
            .context("report window is inverted")?;

        let fetch_started = Instant::now();
        let feedback = self
            .feedback
            .fetch_window(
                &self.report.tenant_id,
                self.report.question_type,
                &window,
                self.config.max_input_size,
            )
            .await
            .context("failed to read feedback window")?;
        self.metrics
            .feedback_fetch_duration
            .observe(fetch_started.elapsed().as_secs_f64());

        let started = Instant::now();
        let result = self.engine.cluster(&feedback, &self.config).await;
        self.metrics
            .clustering_duration
            .observe(started.elapsed().as_secs_f64());
        self.metrics.record_run(&result.stats);

        info!(
            report_id = self.report.id,
            input_size = result.stats.input_size,
            consumed = result.stats.consumed,
            batches = result.stats.batches,
            skipped = result.stats.skipped,
            early_stopped = result.stats.early_stopped,
            clusters_formed = result.stats.clusters_formed,
            clusters_kept = result.clusters.len(),
            "clustering run complete"
        );
        Ok(result)
    }
}

/// Performs the single terminal write for a run.
struct Settle {
    store: Arc<dyn ReportStore>,
    metrics: Arc<Metrics>,
    retry: RetryConfig,
    report_id: ReportId,
}

impl Settle {
    async fn apply(&self, outcome: Result<anyhow::Result<ClusteringResult>, JoinError>) {
        match outcome {
            Ok(Ok(result)) => {
                let clusters: Vec<NewCluster> =
                    result.clusters.into_iter().map(NewCluster::from).collect();
                let written = self
                    .with_retry("complete_report", || {
                        self.store.complete_report(self.report_id, &clusters)
                    })
                    .await;
                match written {
                    Ok(true) => {
                        self.metrics.reports_finished.inc();
                        info!(
                            report_id = self.report_id,
                            clusters = clusters.len(),
                            "report finished"
                        );
                    }
                    Ok(false) => {
                        warn!(
                            report_id = self.report_id,
                            "report no longer running, discarding clustering result"
                        );
                    }
                    Err(error) => {
                        error!(report_id = self.report_id, error = %format!("{error:#}"), "failed to persist clusters");
                        self.fail(&format!("failed to persist clusters: {error:#}"))
                            .await;
                    }
                }
            }
            Ok(Err(error)) => {
                error!(report_id = self.report_id, error = %format!("{error:#}"), "clustering run failed");
                self.fail(&format!("{error:#}")).await;
            }
            Err(join_error) if join_error.is_cancelled() => {
                info!(report_id = self.report_id, "clustering run cancelled");
            }
            Err(join_error) => {
                error!(report_id = self.report_id, error = %join_error, "clustering run panicked");
                self.fail("clustering run panicked").await;
            }
        }
    }

    /// Runs a terminal write, backing off between attempts on storage errors.
    async fn with_retry<T, F, Fut>(&self, operation: &'static str, mut write: F) -> anyhow::Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let mut attempt = 0;
        loop {
            tokio::time::sleep(self.retry.delay_for_attempt(attempt)).await;
            attempt += 1;
            match write().await {
                Ok(value) => return Ok(value),
                Err(error) if self.retry.can_retry(attempt) => {
                    warn!(
                        report_id = self.report_id,
                        operation,
                        attempt,
                        error = %format!("{error:#}"),
                        "terminal write failed, retrying"
                    );
                }
                Err(error) => return Err(error),
            }
        }
    }

    async fn fail(&self, reason: &str) {
        let written = self
            .with_retry("fail_report", || self.store.fail_report(self.report_id, reason))
            .await;
        match written {
            Ok(true) => {
                self.metrics.reports_failed.inc();
                warn!(report_id = self.report_id, reason, "report failed");
            }
            Ok(false) => {
                debug!(report_id = self.report_id, "report already terminal or deleted");
            }
            Err(error) => {
                error!(
                    report_id = self.report_id,
                    error = %format!("{error:#}"),
                    "failed to mark report failed after retries, it stays running until restart"
                );
            }
        }
    }
}
