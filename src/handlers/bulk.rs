//! Mass update, mass delete and export handlers.

use crate::error::AppError;
use crate::identity::Identity;
use crate::response::affected;
use crate::service::{BulkService, ExportRequest, ExportResult, MassDeleteRequest, MassUpdateReport, MassUpdateRequest};
use crate::state::AppState;
use axum::{
    extract::{Path, State},
    response::IntoResponse,
    Json,
};

pub async fn mass_update(
    State(state): State<AppState>,
    Path(segment): Path<String>,
    identity: Identity,
    Json(req): Json<MassUpdateRequest>,
) -> Result<Json<MassUpdateReport>, AppError> {
    let entity = state.entity(&segment)?;
    let report = BulkService::mass_update(&state.registry, state.store.as_ref(), entity, &req, &identity).await?;
    Ok(Json(report))
}

pub async fn mass_delete(
    State(state): State<AppState>,
    Path(segment): Path<String>,
    Json(req): Json<MassDeleteRequest>,
) -> Result<impl IntoResponse, AppError> {
    let entity = state.entity(&segment)?;
    let deleted = BulkService::mass_delete(state.store.as_ref(), entity, &req).await?;
    Ok(affected(format!("{} records deleted", deleted), deleted))
}

pub async fn export(
    State(state): State<AppState>,
    Path(segment): Path<String>,
    Json(req): Json<ExportRequest>,
) -> Result<Json<ExportResult>, AppError> {
    let entity = state.entity(&segment)?;
    let policy = state.settings.operator_policy();
    Ok(Json(BulkService::export(state.store.as_ref(), entity, &req, policy).await?))
}
