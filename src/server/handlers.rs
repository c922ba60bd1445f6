//! API endpoint handlers.

use axum::{
    body::Bytes,
    extract::{Multipart, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::warn;

use super::AppState;
use crate::config::PageSelection;
use crate::error::Pdf2JsonError;
use crate::model::{BoundingBox, ExtractionMode, Stage};
use crate::orchestrator::StageOptions;
use crate::usage::UsageSummary;

const DEFAULT_RECENT_LIMIT: usize = 20;
const DEFAULT_USAGE_DAYS: u32 = 7;

/// A [`Pdf2JsonError`] rendered as `{"error": ..., "code": ...}`.
#[derive(Debug)]
pub struct ApiError(pub Pdf2JsonError);

impl From<Pdf2JsonError> for ApiError {
    fn from(e: Pdf2JsonError) -> Self {
        ApiError(e)
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match &self.0 {
            Pdf2JsonError::DocumentNotFound(_) | Pdf2JsonError::FieldNotFound { .. } => StatusCode::NOT_FOUND,
            Pdf2JsonError::StagePrerequisiteMissing { .. } | Pdf2JsonError::NoStageResult { .. } => {
                StatusCode::CONFLICT
            }
            Pdf2JsonError::InvalidStage(_) | Pdf2JsonError::InvalidRequest(_) | Pdf2JsonError::FileNotFound { .. } => {
                StatusCode::BAD_REQUEST
            }
            Pdf2JsonError::UnreadablePdf { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            Pdf2JsonError::AiRequestFailed { .. }
            | Pdf2JsonError::AiResponseUnparseable { .. }
            | Pdf2JsonError::ProviderNotConfigured { .. }
            | Pdf2JsonError::DownloadFailed { .. }
            | Pdf2JsonError::DownloadTimeout { .. } => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn code(&self) -> &'static str {
        match &self.0 {
            Pdf2JsonError::StagePrerequisiteMissing { .. } => "stage_prerequisite_missing",
            Pdf2JsonError::InvalidStage(_) => "invalid_stage",
            Pdf2JsonError::DocumentNotFound(_) => "document_not_found",
            Pdf2JsonError::FieldNotFound { .. } => "field_not_found",
            Pdf2JsonError::NoStageResult { .. } => "no_stage_result",
            Pdf2JsonError::InvalidRequest(_) => "invalid_request",
            Pdf2JsonError::UnreadablePdf { .. } => "unreadable_pdf",
            Pdf2JsonError::AiRequestFailed { .. } => "ai_request_failed",
            Pdf2JsonError::AiResponseUnparseable { .. } => "ai_response_unparseable",
            Pdf2JsonError::ProviderNotConfigured { .. } => "provider_not_configured",
            _ => "internal",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            warn!("{} {}", status, self.0);
        }
        (status, Json(json!({ "error": self.0.to_string(), "code": self.code() }))).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

fn stage(n: u8) -> Result<Stage, ApiError> {
    Ok(Stage::from_number(n)?)
}

fn pages(param: Option<&str>) -> Result<PageSelection, ApiError> {
    match param {
        None | Some("") => Ok(PageSelection::First),
        Some(p) => Ok(p.parse()?),
    }
}

/// Health check endpoint.
pub async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

// ── Documents ────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct RecentParams {
    pub limit: Option<usize>,
}

pub async fn list_documents(State(state): State<AppState>, Query(params): Query<RecentParams>) -> impl IntoResponse {
    let limit = params.limit.unwrap_or(DEFAULT_RECENT_LIMIT);
    state.pipeline.recent_documents(limit).await.map(Json).map_err(ApiError)
}

/// Multipart upload; the PDF is the part named `file`.
pub async fn upload_document(State(state): State<AppState>, mut multipart: Multipart) -> Result<Response, ApiError> {
    let bad = |e: axum::extract::multipart::MultipartError| Pdf2JsonError::InvalidRequest(format!("multipart: {e}"));
    while let Some(field) = multipart.next_field().await.map_err(bad)? {
        if field.name() != Some("file") {
            continue;
        }
        let filename = field.file_name().unwrap_or("document.pdf").to_string();
        let bytes = field.bytes().await.map_err(bad)?;
        let document = state.pipeline.upload(&filename, &bytes).await?;
        return Ok((StatusCode::CREATED, Json(document)).into_response());
    }
    Err(Pdf2JsonError::InvalidRequest("missing multipart field 'file'".into()).into())
}

pub async fn get_document(State(state): State<AppState>, Path(id): Path<String>) -> impl IntoResponse {
    state.pipeline.document(&id).await.map(Json).map_err(ApiError)
}

pub async fn delete_document(State(state): State<AppState>, Path(id): Path<String>) -> Result<StatusCode, ApiError> {
    state.pipeline.delete_document(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn get_state(State(state): State<AppState>, Path(id): Path<String>) -> impl IntoResponse {
    state.pipeline.state(&id).await.map(Json).map_err(ApiError)
}

// ── Stages ───────────────────────────────────────────────────────────────

/// An empty body means default options; anything else must parse.
pub async fn run_stage(
    State(state): State<AppState>,
    Path((id, n)): Path<(String, u8)>,
    body: Bytes,
) -> Result<Response, ApiError> {
    let options = stage_options(&body)?;
    let result = state.pipeline.run_stage(&id, stage(n)?, &options).await?;
    Ok(Json(result).into_response())
}

fn stage_options(body: &[u8]) -> Result<StageOptions, Pdf2JsonError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(StageOptions::default());
    }
    serde_json::from_slice(body).map_err(|e| Pdf2JsonError::InvalidRequest(format!("stage options: {e}")))
}

#[derive(Debug, Deserialize)]
pub struct RefineBody {
    pub feedback: String,
    #[serde(default)]
    pub options: StageOptions,
}

pub async fn refine_stage(
    State(state): State<AppState>,
    Path((id, n)): Path<(String, u8)>,
    Json(body): Json<RefineBody>,
) -> Result<Response, ApiError> {
    let result = state
        .pipeline
        .refine_stage(&id, stage(n)?, &body.feedback, &body.options)
        .await?;
    Ok(Json(result).into_response())
}

pub async fn validate_stage(
    State(state): State<AppState>,
    Path((id, n)): Path<(String, u8)>,
    Json(corrections): Json<Value>,
) -> Result<Response, ApiError> {
    let result = state.pipeline.validate_stage(&id, stage(n)?, corrections).await?;
    Ok(Json(result).into_response())
}

pub async fn reset_validation(
    State(state): State<AppState>,
    Path((id, n)): Path<(String, u8)>,
) -> Result<Response, ApiError> {
    let pipeline_state = state.pipeline.reset_validation(&id, stage(n)?).await?;
    Ok(Json(pipeline_state).into_response())
}

pub async fn feedback_history(
    State(state): State<AppState>,
    Path((id, n)): Path<(String, u8)>,
) -> Result<Response, ApiError> {
    let history = state.pipeline.feedback_history(&id, stage(n)?).await?;
    Ok(Json(history).into_response())
}

// ── Layout ───────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct LayoutParams {
    pub page: Option<String>,
    pub mode: Option<String>,
}

pub async fn field_boundaries(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(params): Query<LayoutParams>,
) -> Result<Response, ApiError> {
    let pages = pages(params.page.as_deref())?;
    let layout = state.pipeline.field_boundaries(&id, &pages).await?;
    Ok(Json(layout).into_response())
}

pub async fn update_field_region(
    State(state): State<AppState>,
    Path((id, field_id)): Path<(String, u32)>,
    Json(region): Json<BoundingBox>,
) -> Result<Response, ApiError> {
    let field = state.pipeline.update_field_region(&id, field_id, region).await?;
    Ok(Json(field).into_response())
}

pub async fn preview(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(params): Query<LayoutParams>,
) -> Result<Response, ApiError> {
    let mode: ExtractionMode = match params.mode.as_deref() {
        None | Some("") => ExtractionMode::default(),
        Some(m) => m.parse()?,
    };
    let pages = pages(params.page.as_deref())?;
    let preview = state.pipeline.preprocessing_preview(&id, mode, &pages).await?;
    Ok(Json(preview).into_response())
}

// ── Usage ────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct UsageParams {
    pub days: Option<u32>,
}

#[derive(Debug, Serialize)]
pub struct UsageReport {
    #[serde(flatten)]
    pub summary: UsageSummary,
    pub suggestions: Vec<String>,
}

pub async fn usage_summary(
    State(state): State<AppState>,
    Query(params): Query<UsageParams>,
) -> ApiResult<UsageReport> {
    let summary = state
        .pipeline
        .usage_summary(params.days.unwrap_or(DEFAULT_USAGE_DAYS))
        .await?;
    let suggestions = summary.suggestions();
    Ok(Json(UsageReport { summary, suggestions }))
}

pub async fn usage_records(State(state): State<AppState>) -> impl IntoResponse {
    state.pipeline.usage_records().await.map(Json).map_err(ApiError)
}
