//! Per-entity routes. Handlers resolve the entity from the first path segment.

use crate::handlers::{bulk, entity, import};
use crate::state::AppState;
use axum::{
    extract::DefaultBodyLimit,
    routing::{delete, get, post, put},
    Router,
};
use tower_http::limit::RequestBodyLimitLayer;

pub fn entity_routes(state: AppState) -> Router {
    let max_upload = state.settings.max_upload_bytes;
    Router::new()
        .route("/:entity", get(entity::list).post(entity::create))
        .route("/:entity/mass-update", put(bulk::mass_update))
        .route("/:entity/mass-delete", delete(bulk::mass_delete))
        .route("/:entity/export", post(bulk::export))
        .route("/:entity/import", post(import::submit))
        .route("/:entity/imports", get(import::list))
        .route("/:entity/status/:job_id", get(import::status))
        .route("/:entity/status/:job_id/result", get(import::result))
        .route(
            "/:entity/:id",
            get(entity::read)
                .patch(entity::update)
                .put(entity::replace)
                .delete(entity::delete),
        )
        .layer(DefaultBodyLimit::max(max_upload))
        .layer(RequestBodyLimitLayer::new(max_upload))
        .with_state(state)
}
