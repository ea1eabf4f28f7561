//! Entity engine: metadata-driven CRUD, condition filters, bulk mutation, CSV import and
//! search over entity types declared in a JSON registry.

pub mod config;
pub mod error;
pub mod extractors;
pub mod handlers;
pub mod identity;
pub mod query;
pub mod response;
pub mod routes;
pub mod service;
pub mod sql;
pub mod state;
pub mod store;
pub mod telemetry;

pub use config::{load_from_path, load_from_str, EntityType, FieldDescriptor, SchemaRegistry, Settings};
pub use error::{AppError, ConfigError};
pub use identity::Identity;
pub use query::{compile, compile_with, ConditionNode, OperatorPolicy, Predicate};
pub use routes::{catalogue_routes, common_routes, entity_routes, router};
pub use service::{BulkService, CrudService, ImportManager, SearchService, Serializer};
pub use state::AppState;
pub use store::{EntityStore, FileStore, LocalFileStore, MemoryFileStore, MemoryStore, PgStore};
pub use telemetry::init_tracing;
