use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use chrono::Utc;

use super::{CreateOutcome, FeedbackSource, ReportStore};
use crate::store::models::{
    Cluster, ClusterId, ClusterMember, Feedback, NewCluster, Page, QuestionType, Report,
    ReportFilter, ReportId, ReportKey, ReportStatus, TimeWindow,
};

#[derive(Debug, Default)]
struct Inner {
    next_report_id: ReportId,
    next_cluster_id: ClusterId,
    reports: HashMap<ReportId, Report>,
    keys: HashMap<ReportKey, ReportId>,
    clusters: HashMap<ReportId, Vec<(Cluster, Vec<ClusterMember>)>>,
}

/// Process-local [`ReportStore`] with the same transition rules as the Postgres one.
///
/// Used by tests and by embedders that do not need durability.
#[derive(Debug, Default)]
pub struct InMemoryReportStore {
    inner: Mutex<Inner>,
}

impl InMemoryReportStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>> {
        self.inner
            .lock()
            .map_err(|_| anyhow!("in-memory report store mutex poisoned"))
    }
}

#[async_trait]
impl ReportStore for InMemoryReportStore {
    async fn create_or_get(&self, key: &ReportKey) -> Result<CreateOutcome> {
        let mut inner = self.lock()?;
        if let Some(existing) = inner.keys.get(key).and_then(|id| inner.reports.get(id)) {
            return Ok(CreateOutcome {
                report: existing.clone(),
                created: false,
            });
        }

        inner.next_report_id += 1;
        let report = Report {
            id: inner.next_report_id,
            tenant_id: key.tenant_id.clone(),
            question_type: key.question_type,
            window_start: key.window.start(),
            window_end: key.window.end(),
            status: ReportStatus::Running,
            created_at: Utc::now(),
            finished_at: None,
            failure_reason: None,
        };
        inner.keys.insert(key.clone(), report.id);
        inner.reports.insert(report.id, report.clone());

        Ok(CreateOutcome {
            report,
            created: true,
        })
    }

    async fn get_report(&self, id: ReportId) -> Result<Option<Report>> {
        Ok(self.lock()?.reports.get(&id).cloned())
    }

    async fn list_reports(&self, filter: &ReportFilter) -> Result<Vec<Report>> {
        let inner = self.lock()?;
        let mut reports: Vec<Report> = inner
            .reports
            .values()
            .filter(|report| {
                filter
                    .tenant_id
                    .as_deref()
                    .is_none_or(|tenant| report.tenant_id == tenant)
            })
            .filter(|report| {
                filter
                    .question_type
                    .is_none_or(|kind| report.question_type == kind)
            })
            .cloned()
            .collect();
        reports.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        reports.truncate(filter.limit);
        Ok(reports)
    }

    async fn delete_report(&self, id: ReportId) -> Result<bool> {
        let mut inner = self.lock()?;
        let Some(report) = inner.reports.remove(&id) else {
            return Ok(false);
        };
        inner.keys.remove(&report.key());
        inner.clusters.remove(&id);
        Ok(true)
    }

    async fn complete_report(&self, id: ReportId, clusters: &[NewCluster]) -> Result<bool> {
        let mut inner = self.lock()?;
        let running = inner
            .reports
            .get(&id)
            .is_some_and(|report| report.status == ReportStatus::Running);
        if !running {
            return Ok(false);
        }

        let mut persisted = Vec::with_capacity(clusters.len());
        for cluster in clusters {
            inner.next_cluster_id += 1;
            let members = cluster
                .members
                .iter()
                .enumerate()
                .map(|(position, feedback)| ClusterMember {
                    feedback_id: feedback.id,
                    text: feedback.text.clone(),
                    is_representative: position == 0,
                })
                .collect();
            persisted.push((
                Cluster {
                    id: inner.next_cluster_id,
                    report_id: id,
                    representative_feedback_id: cluster.representative().map(|f| f.id),
                    member_feedback_ids: cluster.members.iter().map(|f| f.id).collect(),
                    tags: cluster.tags.clone(),
                },
                members,
            ));
        }
        inner.clusters.insert(id, persisted);

        if let Some(report) = inner.reports.get_mut(&id) {
            report.status = ReportStatus::Finished;
            report.finished_at = Some(Utc::now());
        }
        Ok(true)
    }

    async fn fail_report(&self, id: ReportId, reason: &str) -> Result<bool> {
        let mut inner = self.lock()?;
        match inner.reports.get_mut(&id) {
            Some(report) if report.status == ReportStatus::Running => {
                report.status = ReportStatus::Failed;
                report.finished_at = Some(Utc::now());
                report.failure_reason = Some(reason.to_string());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn fail_running_reports(&self, reason: &str) -> Result<u64> {
        let mut inner = self.lock()?;
        let mut failed = 0;
        for report in inner.reports.values_mut() {
            if report.status == ReportStatus::Running {
                report.status = ReportStatus::Failed;
                report.finished_at = Some(Utc::now());
                report.failure_reason = Some(reason.to_string());
                failed += 1;
            }
        }
        Ok(failed)
    }

    async fn list_clusters(&self, report_id: ReportId) -> Result<Vec<Cluster>> {
        let inner = self.lock()?;
        Ok(inner
            .clusters
            .get(&report_id)
            .map(|clusters| clusters.iter().map(|(cluster, _)| cluster.clone()).collect())
            .unwrap_or_default())
    }

    async fn list_cluster_members(
        &self,
        report_id: ReportId,
        cluster_id: ClusterId,
        page: Page,
    ) -> Result<Option<Vec<ClusterMember>>> {
        let inner = self.lock()?;
        let members = inner
            .clusters
            .get(&report_id)
            .and_then(|clusters| clusters.iter().find(|(cluster, _)| cluster.id == cluster_id))
            .map(|(_, members)| {
                members
                    .iter()
                    .skip(page.offset())
                    .take(page.size)
                    .cloned()
                    .collect()
            });
        Ok(members)
    }

    async fn ping(&self) -> Result<()> {
        self.lock().map(|_| ())
    }
}

/// Fixed feedback set keyed by tenant and question type.
#[derive(Debug, Default)]
pub struct InMemoryFeedbackSource {
    entries: Mutex<Vec<(String, QuestionType, Feedback)>>,
}

impl InMemoryFeedbackSource {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends feedback in arrival order.
    ///
    /// # Errors
    /// Fails only if the internal mutex was poisoned.
    pub fn push(
        &self,
        tenant_id: &str,
        question_type: QuestionType,
        feedback: impl IntoIterator<Item = Feedback>,
    ) -> Result<()> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| anyhow!("in-memory feedback mutex poisoned"))?;
        entries.extend(
            feedback
                .into_iter()
                .map(|item| (tenant_id.to_string(), question_type, item)),
        );
        Ok(())
    }
}

#[async_trait]
impl FeedbackSource for InMemoryFeedbackSource {
    async fn fetch_window(
        &self,
        tenant_id: &str,
        question_type: QuestionType,
        window: &TimeWindow,
        limit: usize,
    ) -> Result<Vec<Feedback>> {
        let entries = self
            .entries
            .lock()
            .map_err(|_| anyhow!("in-memory feedback mutex poisoned"))?;
        Ok(entries
            .iter()
            .filter(|(tenant, kind, feedback)| {
                tenant == tenant_id && *kind == question_type && window.contains(feedback.timestamp)
            })
            .map(|(_, _, feedback)| feedback.clone())
            .take(limit)
            .collect())
    }
}
