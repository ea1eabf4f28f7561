//! Generic services over registered entities: serialization, CRUD, bulk mutation,
//! import, search and the meta catalogue.

mod bulk;
mod crud;
mod import;
mod meta;
mod search;
mod serializer;
pub mod tabular;
mod validation;

pub use bulk::{BulkService, ExportRequest, ExportResult, FailedUpdate, MassDeleteRequest, MassUpdateReport, MassUpdateRequest};
pub use crud::{CrudService, ListMetadata, ListPage, Paging, Retrieved, RESERVED_PARAMS};
pub use import::{ImportAction, ImportJob, ImportManager, ImportRequest, JobStatus, RowOutcome, RowStatus};
pub use meta::{FieldEntry, MetaService, ModelFields, ModuleEntry};
pub use search::{SearchHits, SearchService};
pub use serializer::{coerce_scalar, Serializer, WriteMode, CREATED_BY, UPDATED_BY};
pub use tabular::{CsvParser, Row, TabularParser};
pub use validation::RequestValidator;
