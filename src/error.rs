//! Typed errors and HTTP mapping.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("missing reference: {kind} '{id}'")]
    MissingReference { kind: &'static str, id: String },
    #[error("invalid primary key on entity {entity}: {reason}")]
    InvalidPrimaryKey { entity: String, reason: String },
    #[error("duplicate {kind}: {name}")]
    Duplicate { kind: &'static str, name: String },
    #[error("config load: {0}")]
    Load(String),
    #[error("validation: {0}")]
    Validation(String),
}

#[derive(Error, Debug)]
pub enum AppError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("unknown entity: {0}")]
    UnknownEntity(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("validation: {0}")]
    Validation(String),
    #[error("invalid field '{field}' for {entity}")]
    InvalidField { entity: String, field: String },
    #[error("unsupported operator: {0}")]
    UnsupportedOperator(String),
    #[error("invalid {entity} key for field '{field}': {key}")]
    RelatedNotFound {
        entity: String,
        field: String,
        key: String,
    },
    #[error("missing required fields: {}", .0.join(", "))]
    MissingMapping(Vec<String>),
    #[error("empty request: {0}")]
    EmptyRequest(String),
    #[error("query param `q` is required")]
    MissingQuery,
    #[error("cannot delete some records because they are protected")]
    Protected { blockers: Vec<String> },
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("database: {0}")]
    Db(#[from] sqlx::Error),
    #[error("storage: {0}")]
    Storage(String),
    #[error("internal: {0}")]
    Internal(String),
}

impl AppError {
    /// Stable machine-readable code, shared by the HTTP envelope and the import report.
    pub fn code(&self) -> &'static str {
        match self {
            AppError::Config(_) => "config_error",
            AppError::UnknownEntity(_) | AppError::NotFound(_) => "not_found",
            AppError::Validation(_) => "validation_error",
            AppError::InvalidField { .. } => "invalid_field",
            AppError::UnsupportedOperator(_) => "unsupported_operator",
            AppError::RelatedNotFound { .. } => "related_not_found",
            AppError::MissingMapping(_) => "missing_mapping",
            AppError::EmptyRequest(_) => "empty_request",
            AppError::MissingQuery => "missing_query",
            AppError::Protected { .. } => "protected",
            AppError::Conflict(_) => "conflict",
            AppError::BadRequest(_) => "bad_request",
            AppError::Db(sqlx::Error::RowNotFound) => "not_found",
            AppError::Db(_) => "database_error",
            AppError::Storage(_) => "storage_error",
            AppError::Internal(_) => "internal_error",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            AppError::Config(_) | AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::UnknownEntity(_) | AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Validation(_) | AppError::RelatedNotFound { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            AppError::InvalidField { .. }
            | AppError::UnsupportedOperator(_)
            | AppError::MissingMapping(_)
            | AppError::EmptyRequest(_)
            | AppError::MissingQuery
            | AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::Protected { .. } | AppError::Conflict(_) => StatusCode::CONFLICT,
            AppError::Db(sqlx::Error::RowNotFound) => StatusCode::NOT_FOUND,
            AppError::Db(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::Storage(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    /// True for errors caused by the caller's input rather than the infrastructure.
    pub fn is_client_error(&self) -> bool {
        self.status().is_client_error()
    }
}

#[derive(Serialize)]
pub struct ErrorBody {
    pub error: ErrorDetail,
}

#[derive(Serialize)]
pub struct ErrorDetail {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        }
        let details = match &self {
            AppError::Protected { blockers } => Some(serde_json::json!({ "protected_objects": blockers })),
            AppError::MissingMapping(fields) => Some(serde_json::json!({ "fields": fields })),
            AppError::InvalidField { entity, field } => Some(serde_json::json!({ "entity": entity, "field": field })),
            _ => None,
        };
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code().to_string(),
                message: self.to_string(),
                details,
            },
        };
        (status, Json(body)).into_response()
    }
}
