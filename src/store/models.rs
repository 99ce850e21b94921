use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub type ReportId = i64;
pub type ClusterId = i64;
pub type FeedbackId = i64;

/// Lifecycle of a clustering report. `Running` is the only non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, sqlx::Type, Serialize, Deserialize)]
#[sqlx(type_name = "text", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum ReportStatus {
    Running,
    Finished,
    Failed,
}

impl ReportStatus {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        !matches!(self, ReportStatus::Running)
    }
}

impl AsRef<str> for ReportStatus {
    fn as_ref(&self) -> &str {
        match self {
            ReportStatus::Running => "running",
            ReportStatus::Finished => "finished",
            ReportStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for ReportStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_ref())
    }
}

impl FromStr for ReportStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(ReportStatus::Running),
            "finished" => Ok(ReportStatus::Finished),
            "failed" => Ok(ReportStatus::Failed),
            other => Err(anyhow::anyhow!("unknown report status: {other}")),
        }
    }
}

/// Which population of user questions a report clusters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QuestionType {
    /// Questions the bot could not answer.
    Unsolved,
    /// Questions answered but marked unhelpful by the user.
    Dissatisfied,
}

impl QuestionType {
    /// Numeric code used by existing admin clients.
    #[must_use]
    pub fn code(self) -> i16 {
        match self {
            QuestionType::Unsolved => 0,
            QuestionType::Dissatisfied => 1,
        }
    }
}

impl AsRef<str> for QuestionType {
    fn as_ref(&self) -> &str {
        match self {
            QuestionType::Unsolved => "unsolved",
            QuestionType::Dissatisfied => "dissatisfied",
        }
    }
}

impl fmt::Display for QuestionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_ref())
    }
}

impl FromStr for QuestionType {
    type Err = anyhow::Error;

    /// Accepts either the name or the numeric code.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "0" | "unsolved" => Ok(QuestionType::Unsolved),
            "1" | "dissatisfied" => Ok(QuestionType::Dissatisfied),
            other => Err(anyhow::anyhow!("unknown question type: {other}")),
        }
    }
}

/// Closed time window `[start, end]` over feedback timestamps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimeWindow {
    start: DateTime<Utc>,
    end: DateTime<Utc>,
}

impl TimeWindow {
    /// Returns `None` when `start` is after `end`.
    #[must_use]
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Option<Self> {
        (start <= end).then_some(Self { start, end })
    }

    /// Builds a window from unix seconds.
    #[must_use]
    pub fn from_unix(start: i64, end: i64) -> Option<Self> {
        let start = DateTime::<Utc>::from_timestamp(start, 0)?;
        let end = DateTime::<Utc>::from_timestamp(end, 0)?;
        Self::new(start, end)
    }

    #[must_use]
    pub fn start(&self) -> DateTime<Utc> {
        self.start
    }

    #[must_use]
    pub fn end(&self) -> DateTime<Utc> {
        self.end
    }

    #[must_use]
    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        self.start <= at && at <= self.end
    }
}

/// Dedup identity of a report.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ReportKey {
    pub tenant_id: String,
    pub question_type: QuestionType,
    pub window: TimeWindow,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Report {
    pub id: ReportId,
    pub tenant_id: String,
    pub question_type: QuestionType,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub status: ReportStatus,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub failure_reason: Option<String>,
}

impl Report {
    #[must_use]
    pub fn key(&self) -> ReportKey {
        ReportKey {
            tenant_id: self.tenant_id.clone(),
            question_type: self.question_type,
            window: TimeWindow {
                start: self.window_start,
                end: self.window_end,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ReportFilter {
    pub tenant_id: Option<String>,
    pub question_type: Option<QuestionType>,
    pub limit: usize,
}

/// An unresolved user utterance, read-only input to clustering.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Feedback {
    pub id: FeedbackId,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

/// A surviving cluster ready to be persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct NewCluster {
    pub members: Vec<Feedback>,
    pub tags: Vec<String>,
}

impl NewCluster {
    #[must_use]
    pub fn representative(&self) -> Option<&Feedback> {
        self.members.first()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Cluster {
    pub id: ClusterId,
    pub report_id: ReportId,
    pub representative_feedback_id: Option<FeedbackId>,
    pub member_feedback_ids: Vec<FeedbackId>,
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClusterMember {
    pub feedback_id: FeedbackId,
    pub text: String,
    pub is_representative: bool,
}

/// 1-based page over cluster members.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    pub number: usize,
    pub size: usize,
}

impl Page {
    #[must_use]
    pub fn offset(&self) -> usize {
        self.number.saturating_sub(1).saturating_mul(self.size)
    }
}
