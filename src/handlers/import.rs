//! Import submission (multipart upload), job listing, status polling and result download.

use crate::error::AppError;
use crate::identity::Identity;
use crate::service::{ImportJob, ImportRequest, JobStatus};
use crate::state::AppState;
use axum::{
    extract::{Multipart, Path, State},
    http::{header, StatusCode},
    response::IntoResponse,
    Json,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

#[derive(Serialize)]
pub struct ImportStarted {
    pub status: &'static str,
    pub task_id: Uuid,
    pub name: String,
}

#[derive(Serialize)]
pub struct ImportStatus {
    pub task_id: Uuid,
    pub file_name: String,
    pub status: JobStatus,
    /// Percent of rows started, 0..100.
    pub progress: f64,
    pub total_rows: usize,
    pub succeeded: usize,
    pub failed: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl ImportStatus {
    fn from_job(job: &ImportJob, segment: &str) -> Self {
        let result = (job.status == JobStatus::Completed)
            .then(|| format!("/{}/status/{}/result", segment, job.id));
        ImportStatus {
            task_id: job.id,
            file_name: job.file_name.clone(),
            status: job.status,
            progress: job.percent(),
            total_rows: job.total_rows,
            succeeded: job.succeeded,
            failed: job.failed,
            error: job.error.clone(),
            result,
            created_at: job.created_at,
        }
    }
}

pub async fn submit(
    State(state): State<AppState>,
    Path(segment): Path<String>,
    identity: Identity,
    mut multipart: Multipart,
) -> Result<impl IntoResponse, AppError> {
    let entity = state.entity(&segment)?;
    let mut req = ImportRequest::default();
    let mut has_file = false;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| AppError::BadRequest(format!("multipart: {}", e)))?
    {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "file" => {
                req.file_name = field.file_name().unwrap_or("upload.csv").to_string();
                req.bytes = field
                    .bytes()
                    .await
                    .map_err(|e| AppError::BadRequest(format!("file: {}", e)))?
                    .to_vec();
                has_file = true;
            }
            "action" => req.action = text(field, &name).await?.parse()?,
            "mappings" => {
                req.mappings = parse_json(&text(field, &name).await?, &name)?;
            }
            "defaultValues" => {
                let raw = text(field, &name).await?;
                req.default_values = if raw.trim().is_empty() {
                    Default::default()
                } else {
                    parse_json(&raw, &name)?
                };
            }
            "columns" => req.columns = parse_columns(&text(field, &name).await?),
            other => tracing::debug!(field = %other, "ignoring multipart field"),
        }
    }
    if !has_file {
        return Err(AppError::BadRequest("file is required".into()));
    }

    let job = state.imports.submit(entity, req, &identity).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(ImportStarted {
            status: "started",
            task_id: job.id,
            name: format!("Importing {}", entity.name),
        }),
    ))
}

pub async fn list(
    State(state): State<AppState>,
    Path(segment): Path<String>,
) -> Result<Json<Vec<ImportStatus>>, AppError> {
    let entity = state.entity(&segment)?;
    let jobs = state.imports.list(Some(&entity.name));
    Ok(Json(jobs.iter().map(|job| ImportStatus::from_job(job, &segment)).collect()))
}

pub async fn status(
    State(state): State<AppState>,
    Path((segment, job_id)): Path<(String, String)>,
) -> Result<Json<ImportStatus>, AppError> {
    let job = job_for(&state, &segment, &job_id).await?;
    Ok(Json(ImportStatus::from_job(&job, &segment)))
}

pub async fn result(
    State(state): State<AppState>,
    Path((segment, job_id)): Path<(String, String)>,
) -> Result<impl IntoResponse, AppError> {
    let job = job_for(&state, &segment, &job_id).await?;
    let bytes = state.imports.result(job.id).await?;
    Ok((
        [
            (header::CONTENT_TYPE, "text/csv; charset=utf-8".to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{}-results.csv\"", job.id),
            ),
        ],
        bytes,
    ))
}

/// The job, provided it imports into the entity named by `segment`.
async fn job_for(state: &AppState, segment: &str, job_id: &str) -> Result<ImportJob, AppError> {
    let entity = state.entity(segment)?;
    let id = Uuid::parse_str(job_id).map_err(|_| AppError::BadRequest("invalid job id".into()))?;
    let job = state.imports.status(id).await?;
    if job.entity != entity.name {
        return Err(AppError::NotFound(format!("import job {}", id)));
    }
    Ok(job)
}

async fn text(field: axum::extract::multipart::Field<'_>, name: &str) -> Result<String, AppError> {
    field
        .text()
        .await
        .map_err(|e| AppError::BadRequest(format!("{}: {}", name, e)))
}

fn parse_json<T: serde::de::DeserializeOwned>(raw: &str, name: &str) -> Result<T, AppError> {
    serde_json::from_str(raw).map_err(|e| AppError::BadRequest(format!("{} must be a JSON object: {}", name, e)))
}

/// A JSON array of headers, or a comma separated list.
fn parse_columns(raw: &str) -> Vec<String> {
    match serde_json::from_str::<Vec<String>>(raw) {
        Ok(cols) => cols,
        Err(_) => raw
            .split(',')
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty())
            .collect(),
    }
}
