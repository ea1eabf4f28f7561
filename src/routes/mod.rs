//! Router assembly.

mod common;
mod entity;

pub use common::{catalogue_routes, common_routes};
pub use entity::entity_routes;

use crate::state::AppState;
use axum::Router;

/// Every route of the engine on one router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .merge(common_routes(state.clone()))
        .merge(catalogue_routes(state.clone()))
        .merge(entity_routes(state))
}
