//! Shared application state for all routes.

use crate::config::{SchemaRegistry, Settings};
use crate::error::AppError;
use crate::service::{ImportManager, Paging};
use crate::store::{EntityStore, FileStore};
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<SchemaRegistry>,
    pub store: Arc<dyn EntityStore>,
    pub files: Arc<dyn FileStore>,
    pub imports: ImportManager,
    pub settings: Arc<Settings>,
}

impl AppState {
    /// Wire the import manager to the same registry and stores.
    pub fn new(
        registry: Arc<SchemaRegistry>,
        store: Arc<dyn EntityStore>,
        files: Arc<dyn FileStore>,
        settings: Settings,
    ) -> Self {
        let imports = ImportManager::new(registry.clone(), store.clone(), files.clone());
        AppState {
            registry,
            store,
            files,
            imports,
            settings: Arc::new(settings),
        }
    }

    pub fn paging(&self) -> Paging {
        Paging::from(self.settings.as_ref())
    }

    /// Entity addressed by a URL segment: its path segment, or its name.
    pub fn entity(&self, segment: &str) -> Result<&crate::config::EntityType, AppError> {
        self.registry
            .describe_by_path(segment)
            .or_else(|_| self.registry.describe(segment))
    }
}
