use axum::{
    Json,
    extract::{
        Path, Query, State,
        rejection::{JsonRejection, QueryRejection},
    },
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use chrono::DateTime;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::app::AppState;
use crate::error::ReportError;
use crate::store::models::{
    Cluster, ClusterId, ClusterMember, Page, QuestionType, Report, ReportFilter, ReportId,
};

/// Header carrying the tenant (application) id.
const TENANT_HEADER: &str = "x-appid";
const DEFAULT_LIST_LIMIT: usize = 10;
const MAX_LIST_LIMIT: usize = 10;
const DEFAULT_PAGE_SIZE: usize = 20;
const MAX_PAGE_SIZE: usize = 100;

#[derive(Debug, Deserialize)]
pub(crate) struct TypeQuery {
    #[serde(rename = "type")]
    question_type: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ListQuery {
    limit: Option<usize>,
    #[serde(rename = "type")]
    question_type: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct PageQuery {
    page: Option<usize>,
    limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ReportRequest {
    start_time: i64,
    end_time: i64,
}

#[derive(Debug, Serialize)]
struct ReportCreatedResponse {
    report_id: ReportId,
    status: String,
}

#[derive(Debug, Serialize)]
struct ReportResponse {
    report_id: ReportId,
    tenant_id: String,
    question_type: String,
    start_time: i64,
    end_time: i64,
    status: String,
    created_at: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    finished_at: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    failure_reason: Option<String>,
}

impl From<Report> for ReportResponse {
    fn from(report: Report) -> Self {
        Self {
            report_id: report.id,
            tenant_id: report.tenant_id,
            question_type: report.question_type.to_string(),
            start_time: report.window_start.timestamp(),
            end_time: report.window_end.timestamp(),
            status: report.status.to_string(),
            created_at: report.created_at.timestamp(),
            finished_at: report.finished_at.map(|at| at.timestamp()),
            failure_reason: report.failure_reason,
        }
    }
}

#[derive(Debug, Serialize)]
struct ReportListResponse {
    reports: Vec<ReportResponse>,
}

#[derive(Debug, Serialize)]
struct ClusterResponse {
    cluster_id: ClusterId,
    size: usize,
    feedback_ids: Vec<i64>,
    tags: Vec<String>,
}

impl From<Cluster> for ClusterResponse {
    fn from(cluster: Cluster) -> Self {
        Self {
            cluster_id: cluster.id,
            size: cluster.member_feedback_ids.len(),
            feedback_ids: cluster.member_feedback_ids,
            tags: cluster.tags,
        }
    }
}

#[derive(Debug, Serialize)]
struct ClusterListResponse {
    report_id: ReportId,
    clusters: Vec<ClusterResponse>,
}

#[derive(Debug, Serialize)]
struct QuestionListResponse {
    report_id: ReportId,
    cluster_id: ClusterId,
    page: usize,
    limit: usize,
    questions: Vec<ClusterMember>,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

fn error_body(status: StatusCode, message: impl Into<String>) -> Response {
    (
        status,
        Json(ErrorResponse {
            error: message.into(),
        }),
    )
        .into_response()
}

fn report_error_response(error: &ReportError) -> Response {
    let status = match error {
        ReportError::InvalidArgument(_) => StatusCode::BAD_REQUEST,
        ReportError::NotFound(_) | ReportError::ClusterNotFound { .. } => StatusCode::NOT_FOUND,
        ReportError::NotReady { .. } => StatusCode::CONFLICT,
        ReportError::Storage(_) => {
            error!(error = %error, "report storage failure");
            return error_body(StatusCode::INTERNAL_SERVER_ERROR, "storage error");
        }
    };
    error_body(status, error.to_string())
}

fn tenant_from(headers: &HeaderMap) -> Result<String, Response> {
    headers
        .get(TENANT_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
        .ok_or_else(|| {
            error_body(
                StatusCode::BAD_REQUEST,
                format!("missing {TENANT_HEADER} header"),
            )
        })
}

fn parse_question_type(raw: &str) -> Result<QuestionType, Response> {
    raw.parse::<QuestionType>()
        .map_err(|error| error_body(StatusCode::BAD_REQUEST, error.to_string()))
}

/// Loads a report and hides it from other tenants.
async fn owned_report(state: &AppState, tenant_id: &str, id: ReportId) -> Result<Report, Response> {
    let report = state
        .reports()
        .get_report(id)
        .await
        .map_err(|error| report_error_response(&error))?;
    if report.tenant_id != tenant_id {
        return Err(report_error_response(&ReportError::NotFound(id)));
    }
    Ok(report)
}

/// POST /v1/reports?type=
pub(crate) async fn request_report(
    State(state): State<AppState>,
    headers: HeaderMap,
    query: Result<Query<TypeQuery>, QueryRejection>,
    body: Result<Json<ReportRequest>, JsonRejection>,
) -> Response {
    let tenant_id = match tenant_from(&headers) {
        Ok(tenant_id) => tenant_id,
        Err(response) => return response,
    };
    let question_type = match query {
        Ok(Query(TypeQuery {
            question_type: Some(raw),
        })) => match parse_question_type(&raw) {
            Ok(kind) => kind,
            Err(response) => return response,
        },
        Ok(_) => return error_body(StatusCode::BAD_REQUEST, "query parameter `type` is required"),
        Err(rejection) => return error_body(StatusCode::BAD_REQUEST, rejection.body_text()),
    };
    let Json(request) = match body {
        Ok(body) => body,
        Err(rejection) => {
            warn!(error = %rejection.body_text(), "rejected report request body");
            return error_body(StatusCode::BAD_REQUEST, rejection.body_text());
        }
    };

    let (Some(start), Some(end)) = (
        DateTime::from_timestamp(request.start_time, 0),
        DateTime::from_timestamp(request.end_time, 0),
    ) else {
        return error_body(StatusCode::BAD_REQUEST, "timestamp out of range");
    };

    match state
        .reports()
        .request_report(&tenant_id, question_type, start, end)
        .await
    {
        Ok(outcome) => {
            let status = if outcome.created {
                StatusCode::ACCEPTED
            } else {
                StatusCode::OK
            };
            info!(
                report_id = outcome.report.id,
                created = outcome.created,
                "report request accepted"
            );
            (
                status,
                Json(ReportCreatedResponse {
                    report_id: outcome.report.id,
                    status: outcome.report.status.to_string(),
                }),
            )
                .into_response()
        }
        Err(error) => report_error_response(&error),
    }
}

/// GET /v1/reports?limit=&type=
pub(crate) async fn list_reports(
    State(state): State<AppState>,
    headers: HeaderMap,
    query: Result<Query<ListQuery>, QueryRejection>,
) -> Response {
    let tenant_id = match tenant_from(&headers) {
        Ok(tenant_id) => tenant_id,
        Err(response) => return response,
    };
    let Query(query) = match query {
        Ok(query) => query,
        Err(rejection) => return error_body(StatusCode::BAD_REQUEST, rejection.body_text()),
    };
    let question_type = match query.question_type.as_deref() {
        Some(raw) => match parse_question_type(raw) {
            Ok(kind) => Some(kind),
            Err(response) => return response,
        },
        None => None,
    };

    let filter = ReportFilter {
        tenant_id: Some(tenant_id),
        question_type,
        limit: query
            .limit
            .unwrap_or(DEFAULT_LIST_LIMIT)
            .min(MAX_LIST_LIMIT),
    };
    match state.reports().list_reports(&filter).await {
        Ok(reports) => (
            StatusCode::OK,
            Json(ReportListResponse {
                reports: reports.into_iter().map(ReportResponse::from).collect(),
            }),
        )
            .into_response(),
        Err(error) => report_error_response(&error),
    }
}

/// GET /v1/reports/{id}
pub(crate) async fn get_report(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<ReportId>,
) -> Response {
    let tenant_id = match tenant_from(&headers) {
        Ok(tenant_id) => tenant_id,
        Err(response) => return response,
    };
    match owned_report(&state, &tenant_id, id).await {
        Ok(report) => (StatusCode::OK, Json(ReportResponse::from(report))).into_response(),
        Err(response) => response,
    }
}

/// DELETE /v1/reports/{id}
pub(crate) async fn delete_report(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<ReportId>,
) -> Response {
    let tenant_id = match tenant_from(&headers) {
        Ok(tenant_id) => tenant_id,
        Err(response) => return response,
    };
    if let Err(response) = owned_report(&state, &tenant_id, id).await {
        return response;
    }
    match state.reports().delete_report(id).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(error) => report_error_response(&error),
    }
}

/// GET /v1/reports/{id}/clusters
pub(crate) async fn list_clusters(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<ReportId>,
) -> Response {
    let tenant_id = match tenant_from(&headers) {
        Ok(tenant_id) => tenant_id,
        Err(response) => return response,
    };
    if let Err(response) = owned_report(&state, &tenant_id, id).await {
        return response;
    }
    match state.reports().clusters(id).await {
        Ok(clusters) => (
            StatusCode::OK,
            Json(ClusterListResponse {
                report_id: id,
                clusters: clusters.into_iter().map(ClusterResponse::from).collect(),
            }),
        )
            .into_response(),
        Err(error) => report_error_response(&error),
    }
}

/// GET /v1/reports/{id}/clusters/{cluster_id}/questions?page=&limit=
pub(crate) async fn list_cluster_questions(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path((id, cluster_id)): Path<(ReportId, ClusterId)>,
    query: Result<Query<PageQuery>, QueryRejection>,
) -> Response {
    let tenant_id = match tenant_from(&headers) {
        Ok(tenant_id) => tenant_id,
        Err(response) => return response,
    };
    let Query(query) = match query {
        Ok(query) => query,
        Err(rejection) => return error_body(StatusCode::BAD_REQUEST, rejection.body_text()),
    };
    let page = Page {
        number: query.page.unwrap_or(1).max(1),
        size: query
            .limit
            .unwrap_or(DEFAULT_PAGE_SIZE)
            .clamp(1, MAX_PAGE_SIZE),
    };
    if let Err(response) = owned_report(&state, &tenant_id, id).await {
        return response;
    }
    match state.reports().cluster_members(id, cluster_id, page).await {
        Ok(questions) => (
            StatusCode::OK,
            Json(QuestionListResponse {
                report_id: id,
                cluster_id,
                page: page.number,
                limit: page.size,
                questions,
            }),
        )
            .into_response(),
        Err(error) => report_error_response(&error),
    }
}
