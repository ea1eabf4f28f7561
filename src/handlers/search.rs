//! Cross-entity search and the meta catalogue.

use crate::error::AppError;
use crate::service::{MetaService, ModelFields, ModuleEntry, SearchHits, SearchService};
use crate::state::AppState;
use axum::{
    extract::{Query, State},
    Json,
};
use serde::Deserialize;
use std::collections::BTreeMap;

#[derive(Debug, Deserialize)]
pub struct SearchParams {
    pub q: Option<String>,
    pub module: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct FieldsParams {
    pub namespace: Option<String>,
    pub model: Option<String>,
}

pub async fn search(
    State(state): State<AppState>,
    Query(params): Query<SearchParams>,
) -> Result<Json<BTreeMap<String, SearchHits>>, AppError> {
    let hits = SearchService::search(
        &state.registry,
        state.store.as_ref(),
        params.q.as_deref(),
        params.module.as_deref(),
    )
    .await?;
    Ok(Json(hits))
}

pub async fn modules(State(state): State<AppState>) -> Json<BTreeMap<String, ModuleEntry>> {
    Json(MetaService::modules(&state.registry))
}

pub async fn fields(State(state): State<AppState>, Query(params): Query<FieldsParams>) -> Json<Vec<ModelFields>> {
    Json(MetaService::fields(
        &state.registry,
        params.namespace.as_deref(),
        params.model.as_deref(),
    ))
}
