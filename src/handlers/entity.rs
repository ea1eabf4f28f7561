//! Entity CRUD handlers: list, create, read, update, replace, delete.

use crate::error::AppError;
use crate::identity::Identity;
use crate::response::{success_one, success_one_ok};
use crate::service::{CrudService, ListPage, Retrieved};
use crate::state::AppState;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use serde_json::Value;
use std::collections::HashMap;

pub async fn list(
    State(state): State<AppState>,
    Path(segment): Path<String>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Json<ListPage>, AppError> {
    let entity = state.entity(&segment)?;
    let page = CrudService::list(&state.registry, state.store.as_ref(), state.paging(), entity, &params).await?;
    Ok(Json(page))
}

pub async fn create(
    State(state): State<AppState>,
    Path(segment): Path<String>,
    identity: Identity,
    Json(body): Json<Value>,
) -> Result<impl IntoResponse, AppError> {
    let entity = state.entity(&segment)?;
    let row = CrudService::create(&state.registry, state.store.as_ref(), entity, &body, &identity).await?;
    Ok(success_one(row))
}

pub async fn read(
    State(state): State<AppState>,
    Path((segment, id)): Path<(String, String)>,
) -> Result<Json<Retrieved>, AppError> {
    let entity = state.entity(&segment)?;
    let key = entity.parse_key(&id)?;
    Ok(Json(CrudService::retrieve(&state.registry, state.store.as_ref(), entity, &key).await?))
}

/// PATCH: only the fields present in the body change.
pub async fn update(
    State(state): State<AppState>,
    Path((segment, id)): Path<(String, String)>,
    identity: Identity,
    Json(body): Json<Value>,
) -> Result<impl IntoResponse, AppError> {
    let entity = state.entity(&segment)?;
    let key = entity.parse_key(&id)?;
    let row = CrudService::update(&state.registry, state.store.as_ref(), entity, &key, &body, &identity).await?;
    Ok(success_one_ok(row))
}

/// PUT: like PATCH, but every required field must be supplied.
pub async fn replace(
    State(state): State<AppState>,
    Path((segment, id)): Path<(String, String)>,
    identity: Identity,
    Json(body): Json<Value>,
) -> Result<impl IntoResponse, AppError> {
    let entity = state.entity(&segment)?;
    let key = entity.parse_key(&id)?;
    let obj = body
        .as_object()
        .ok_or_else(|| AppError::BadRequest("body must be a JSON object".into()))?;
    let missing: Vec<&str> = entity
        .required_fields()
        .into_iter()
        .filter(|f| !f.primary_key && obj.get(&f.name).map_or(true, Value::is_null))
        .map(|f| f.name.as_str())
        .collect();
    if !missing.is_empty() {
        return Err(AppError::Validation(format!("{} is required", missing.join(", "))));
    }
    let row = CrudService::update(&state.registry, state.store.as_ref(), entity, &key, &body, &identity).await?;
    Ok(success_one_ok(row))
}

pub async fn delete(
    State(state): State<AppState>,
    Path((segment, id)): Path<(String, String)>,
) -> Result<StatusCode, AppError> {
    let entity = state.entity(&segment)?;
    let key = entity.parse_key(&id)?;
    CrudService::delete(state.store.as_ref(), entity, &key).await?;
    Ok(StatusCode::NO_CONTENT)
}
