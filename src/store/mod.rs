//! Storage abstractions consumed by the engine: the entity store and the file store.
//!
//! A record is a JSON object keyed by field name. Many-to-many fields are carried
//! on the record as an array of related keys; reverse relations are never stored.

mod files;
mod memory;
mod postgres;

pub use files::{FileRef, FileStore, LocalFileStore, MemoryFileStore};
pub use memory::MemoryStore;
pub use postgres::PgStore;

use crate::config::EntityType;
use crate::error::AppError;
use crate::query::{Page, Predicate, SortOrder};
use async_trait::async_trait;
use serde_json::Value;

pub type Record = serde_json::Map<String, Value>;

#[async_trait]
pub trait EntityStore: Send + Sync {
    async fn get(&self, entity: &EntityType, key: &Value) -> Result<Option<Record>, AppError>;

    /// Records matching `predicate`, ordered by `order` (primary key when `None`).
    async fn filter(
        &self,
        entity: &EntityType,
        predicate: &Predicate,
        order: Option<&SortOrder>,
        page: Option<Page>,
    ) -> Result<Vec<Record>, AppError>;

    async fn count(&self, entity: &EntityType, predicate: &Predicate) -> Result<u64, AppError>;

    /// Insert one row; absent fields take their defaults. Returns the stored row.
    async fn create(&self, entity: &EntityType, attrs: Record) -> Result<Record, AppError>;

    /// Write the fields present in `record` to the row identified by its primary key.
    async fn save(&self, entity: &EntityType, record: Record) -> Result<Record, AppError>;

    /// Delete every row in `keys` or none: referential protection fails with `Protected`.
    async fn delete(&self, entity: &EntityType, keys: &[Value]) -> Result<u64, AppError>;

    async fn ping(&self) -> Result<(), AppError> {
        Ok(())
    }
}
