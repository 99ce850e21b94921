use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tracing::debug;

use super::{CreateOutcome, FeedbackSource, ReportStore};
use crate::store::models::{
    Cluster, ClusterId, ClusterMember, Feedback, NewCluster, Page, QuestionType, Report,
    ReportFilter, ReportId, ReportKey, ReportStatus, TimeWindow,
};

/// Insert-then-lookup rounds before giving up on a churning key.
const CREATE_ATTEMPTS: usize = 3;

const REPORT_COLUMNS: &str = "id, tenant_id, question_type, window_start, window_end, status, \
                              created_at, finished_at, failure_reason";

/// Postgres-backed [`ReportStore`].
#[derive(Debug, Clone)]
pub struct PgReportStore {
    pool: PgPool,
}

impl PgReportStore {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn report_from_row(row: &PgRow) -> Result<Report> {
    let question_type: String = row.try_get("question_type")?;
    let status: String = row.try_get("status")?;
    Ok(Report {
        id: row.try_get("id")?,
        tenant_id: row.try_get("tenant_id")?,
        question_type: question_type.parse()?,
        window_start: row.try_get("window_start")?,
        window_end: row.try_get("window_end")?,
        status: status.parse()?,
        created_at: row.try_get("created_at")?,
        finished_at: row.try_get("finished_at")?,
        failure_reason: row.try_get("failure_reason")?,
    })
}

#[async_trait]
impl ReportStore for PgReportStore {
    async fn create_or_get(&self, key: &ReportKey) -> Result<CreateOutcome> {
        // The unique constraint serialises concurrent requests for the same key.
        // A conflicting row deleted before the lookup sends us back to the insert.
        for _ in 0..CREATE_ATTEMPTS {
            let inserted = sqlx::query(&format!(
                r"
                INSERT INTO selflearn_reports (tenant_id, question_type, window_start, window_end, status)
                VALUES ($1, $2, $3, $4, 'running')
                ON CONFLICT (tenant_id, question_type, window_start, window_end) DO NOTHING
                RETURNING {REPORT_COLUMNS}
                "
            ))
            .bind(&key.tenant_id)
            .bind(key.question_type.as_ref())
            .bind(key.window.start())
            .bind(key.window.end())
            .fetch_optional(&self.pool)
            .await
            .context("failed to insert selflearn_reports row")?;

            if let Some(row) = inserted {
                return Ok(CreateOutcome {
                    report: report_from_row(&row)?,
                    created: true,
                });
            }

            let existing = sqlx::query(&format!(
                r"
                SELECT {REPORT_COLUMNS}
                FROM selflearn_reports
                WHERE tenant_id = $1 AND question_type = $2 AND window_start = $3 AND window_end = $4
                "
            ))
            .bind(&key.tenant_id)
            .bind(key.question_type.as_ref())
            .bind(key.window.start())
            .bind(key.window.end())
            .fetch_optional(&self.pool)
            .await
            .context("failed to load existing selflearn_reports row")?;

            if let Some(row) = existing {
                return Ok(CreateOutcome {
                    report: report_from_row(&row)?,
                    created: false,
                });
            }
            debug!(tenant_id = %key.tenant_id, "conflicting report vanished before lookup, retrying insert");
        }

        bail!("report for {} kept disappearing during insert", key.tenant_id)
    }

    async fn get_report(&self, id: ReportId) -> Result<Option<Report>> {
        let row = sqlx::query(&format!(
            "SELECT {REPORT_COLUMNS} FROM selflearn_reports WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .context("failed to fetch report")?;

        row.as_ref().map(report_from_row).transpose()
    }

    async fn list_reports(&self, filter: &ReportFilter) -> Result<Vec<Report>> {
        let limit = i64::try_from(filter.limit).unwrap_or(i64::MAX);
        let rows = sqlx::query(&format!(
            r"
            SELECT {REPORT_COLUMNS}
            FROM selflearn_reports
            WHERE ($1::TEXT IS NULL OR tenant_id = $1)
              AND ($2::TEXT IS NULL OR question_type = $2)
            ORDER BY created_at DESC, id DESC
            LIMIT $3
            "
        ))
        .bind(filter.tenant_id.as_deref())
        .bind(filter.question_type.map(|kind| kind.to_string()))
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("failed to list reports")?;

        rows.iter().map(report_from_row).collect()
    }

    async fn delete_report(&self, id: ReportId) -> Result<bool> {
        let result = sqlx::query("DELETE FROM selflearn_reports WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .context("failed to delete report")?;

        Ok(result.rows_affected() > 0)
    }

    async fn complete_report(&self, id: ReportId, clusters: &[NewCluster]) -> Result<bool> {
        let mut tx = self
            .pool
            .begin()
            .await
            .context("failed to begin transaction")?;

        let status: Option<String> =
            sqlx::query_scalar("SELECT status FROM selflearn_reports WHERE id = $1 FOR UPDATE")
                .bind(id)
                .fetch_optional(&mut *tx)
                .await
                .context("failed to lock report row")?;

        if status.as_deref() != Some(ReportStatus::Running.as_ref()) {
            tx.rollback()
                .await
                .context("failed to rollback transaction")?;
            return Ok(false);
        }

        for (position, cluster) in clusters.iter().enumerate() {
            let cluster_id: ClusterId = sqlx::query_scalar(
                r"
                INSERT INTO selflearn_clusters (report_id, position, representative_feedback_id, tags)
                VALUES ($1, $2, $3, $4)
                RETURNING id
                ",
            )
            .bind(id)
            .bind(i32::try_from(position).context("cluster position overflow")?)
            .bind(cluster.representative().map(|feedback| feedback.id))
            .bind(cluster.tags.as_slice())
            .fetch_one(&mut *tx)
            .await
            .context("failed to insert selflearn_clusters row")?;

            for (member_position, member) in cluster.members.iter().enumerate() {
                sqlx::query(
                    r"
                    INSERT INTO selflearn_cluster_members
                        (cluster_id, feedback_id, content, position, is_representative)
                    VALUES ($1, $2, $3, $4, $5)
                    ON CONFLICT (cluster_id, feedback_id) DO NOTHING
                    ",
                )
                .bind(cluster_id)
                .bind(member.id)
                .bind(&member.text)
                .bind(i32::try_from(member_position).context("member position overflow")?)
                .bind(member_position == 0)
                .execute(&mut *tx)
                .await
                .context("failed to insert selflearn_cluster_members row")?;
            }
        }

        sqlx::query(
            r"
            UPDATE selflearn_reports
            SET status = 'finished', finished_at = NOW()
            WHERE id = $1
            ",
        )
        .bind(id)
        .execute(&mut *tx)
        .await
        .context("failed to mark report finished")?;

        tx.commit().await.context("failed to commit transaction")?;
        Ok(true)
    }

    async fn fail_report(&self, id: ReportId, reason: &str) -> Result<bool> {
        let result = sqlx::query(
            r"
            UPDATE selflearn_reports
            SET status = 'failed', finished_at = NOW(), failure_reason = $2
            WHERE id = $1 AND status = 'running'
            ",
        )
        .bind(id)
        .bind(reason)
        .execute(&self.pool)
        .await
        .context("failed to mark report failed")?;

        Ok(result.rows_affected() > 0)
    }

    async fn fail_running_reports(&self, reason: &str) -> Result<u64> {
        let result = sqlx::query(
            r"
            UPDATE selflearn_reports
            SET status = 'failed', finished_at = NOW(), failure_reason = $1
            WHERE status = 'running'
            ",
        )
        .bind(reason)
        .execute(&self.pool)
        .await
        .context("failed to fail interrupted reports")?;

        Ok(result.rows_affected())
    }

    async fn list_clusters(&self, report_id: ReportId) -> Result<Vec<Cluster>> {
        let rows = sqlx::query(
            r"
            SELECT c.id, c.representative_feedback_id, c.tags,
                   COALESCE(
                       ARRAY_AGG(m.feedback_id ORDER BY m.position)
                           FILTER (WHERE m.feedback_id IS NOT NULL),
                       '{}'
                   ) AS member_ids
            FROM selflearn_clusters c
            LEFT JOIN selflearn_cluster_members m ON m.cluster_id = c.id
            WHERE c.report_id = $1
            GROUP BY c.id
            ORDER BY c.position
            ",
        )
        .bind(report_id)
        .fetch_all(&self.pool)
        .await
        .context("failed to list clusters")?;

        rows.iter()
            .map(|row| {
                Ok(Cluster {
                    id: row.try_get("id")?,
                    report_id,
                    representative_feedback_id: row.try_get("representative_feedback_id")?,
                    member_feedback_ids: row.try_get("member_ids")?,
                    tags: row.try_get("tags")?,
                })
            })
            .collect()
    }

    async fn list_cluster_members(
        &self,
        report_id: ReportId,
        cluster_id: ClusterId,
        page: Page,
    ) -> Result<Option<Vec<ClusterMember>>> {
        let owned: Option<i64> = sqlx::query_scalar(
            "SELECT id FROM selflearn_clusters WHERE id = $1 AND report_id = $2",
        )
        .bind(cluster_id)
        .bind(report_id)
        .fetch_optional(&self.pool)
        .await
        .context("failed to look up cluster")?;

        if owned.is_none() {
            return Ok(None);
        }

        let rows = sqlx::query(
            r"
            SELECT feedback_id, content, is_representative
            FROM selflearn_cluster_members
            WHERE cluster_id = $1
            ORDER BY position
            LIMIT $2 OFFSET $3
            ",
        )
        .bind(cluster_id)
        .bind(i64::try_from(page.size).unwrap_or(i64::MAX))
        .bind(i64::try_from(page.offset()).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await
        .context("failed to list cluster members")?;

        let members = rows
            .iter()
            .map(|row| {
                Ok(ClusterMember {
                    feedback_id: row.try_get("feedback_id")?,
                    text: row.try_get("content")?,
                    is_representative: row.try_get("is_representative")?,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Some(members))
    }

    async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .context("database ping failed")?;
        Ok(())
    }
}

/// Reads `user_feedback`, keeping the first occurrence of each question text.
#[derive(Debug, Clone)]
pub struct PgFeedbackSource {
    pool: PgPool,
}

impl PgFeedbackSource {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl FeedbackSource for PgFeedbackSource {
    async fn fetch_window(
        &self,
        tenant_id: &str,
        question_type: QuestionType,
        window: &TimeWindow,
        limit: usize,
    ) -> Result<Vec<Feedback>> {
        let rows = sqlx::query(
            r"
            SELECT MIN(id) AS id, question, MIN(created_at) AS created_at
            FROM user_feedback
            WHERE tenant_id = $1
              AND question_type = $2
              AND created_at BETWEEN $3 AND $4
            GROUP BY question
            ORDER BY MIN(created_at), MIN(id)
            LIMIT $5
            ",
        )
        .bind(tenant_id)
        .bind(question_type.code())
        .bind(window.start())
        .bind(window.end())
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await
        .context("failed to fetch user_feedback window")?;

        rows.iter()
            .map(|row| {
                let timestamp: DateTime<Utc> = row.try_get("created_at")?;
                Ok(Feedback {
                    id: row.try_get("id")?,
                    text: row.try_get("question")?,
                    timestamp,
                })
            })
            .collect()
    }
}
