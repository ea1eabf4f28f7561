//! Example consumer: serves the engine over the entities declared in `ENGINE_SCHEMA_PATH`.
//!
//! Run from repo root: `ENGINE_SCHEMA_PATH=example_consumer/entities.json cargo run -p example-consumer`
//! Uses PostgreSQL when `DATABASE_URL` is set, the in-memory store otherwise.

use entity_engine::{
    init_tracing, load_from_path, router, AppState, EntityStore, LocalFileStore, MemoryStore, PgStore, Settings,
};
use std::sync::Arc;
use tokio::net::TcpListener;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    init_tracing("entity_engine=info,example_consumer=info");

    let settings = Settings::from_env()?;
    let registry = Arc::new(load_from_path(&settings.schema_path).await?);
    tracing::info!(entities = registry.entities().len(), path = %settings.schema_path.display(), "registry loaded");

    let store: Arc<dyn EntityStore> = match &settings.database_url {
        Some(url) => Arc::new(PgStore::connect(url, registry.clone()).await?),
        None => {
            tracing::warn!("DATABASE_URL not set, records are kept in memory");
            Arc::new(MemoryStore::new(registry.clone()))
        }
    };
    let files = Arc::new(LocalFileStore::new(&settings.media_root));
    let bind = settings.bind.clone();
    let state = AppState::new(registry, store, files, settings);

    let listener = TcpListener::bind(&bind).await?;
    tracing::info!("Example consumer listening on http://{}", listener.local_addr()?);
    axum::serve(listener, router(state)).await?;
    Ok(())
}
