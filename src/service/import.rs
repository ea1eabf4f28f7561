//! Asynchronous bulk import of an uploaded tabular file into one entity type.
//!
//! A job is validated and recorded on submission, then processed row by row on a spawned
//! task. Row failures end up in the result report; only infrastructure failures fail the job.

use crate::config::{key_text, EntityType, SchemaRegistry};
use crate::error::AppError;
use crate::identity::Identity;
use crate::service::tabular::{is_blank_row, write_report, CsvParser, Row, TabularParser};
use crate::service::{Serializer, CREATED_BY, UPDATED_BY};
use crate::store::{EntityStore, FileRef, FileStore, Record};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::str::FromStr;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use uuid::Uuid;

const POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImportAction {
    #[default]
    Create,
    Update,
    Both,
}

impl FromStr for ImportAction {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "create" => Ok(ImportAction::Create),
            "update" => Ok(ImportAction::Update),
            "both" => Ok(ImportAction::Both),
            other => Err(AppError::Validation(format!("unknown import action: {}", other))),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Submitted,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_finished(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RowStatus {
    Success,
    Error,
}

impl RowStatus {
    fn as_str(self) -> &'static str {
        match self {
            RowStatus::Success => "success",
            RowStatus::Error => "error",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowOutcome {
    pub row: usize,
    pub status: RowStatus,
    pub message: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ImportJob {
    pub id: Uuid,
    pub entity: String,
    pub action: ImportAction,
    pub file_name: String,
    pub columns: Vec<String>,
    /// field name → column header
    pub mappings: BTreeMap<String, String>,
    pub default_values: Record,
    pub source: FileRef,
    pub result: Option<FileRef>,
    pub status: JobStatus,
    /// Share of rows started, 0..1.
    pub progress: f64,
    pub total_rows: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub error: Option<String>,
    pub submitted_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl ImportJob {
    /// Progress as a percentage rounded to two decimals.
    pub fn percent(&self) -> f64 {
        (self.progress * 10_000.0).round() / 100.0
    }
}

/// Everything a caller supplies to start an import.
#[derive(Clone, Debug, Default)]
pub struct ImportRequest {
    pub action: ImportAction,
    pub file_name: String,
    pub bytes: Vec<u8>,
    pub columns: Vec<String>,
    pub mappings: BTreeMap<String, String>,
    pub default_values: Record,
}

/// Runs import jobs and keeps their read model.
#[derive(Clone)]
pub struct ImportManager {
    registry: Arc<SchemaRegistry>,
    store: Arc<dyn EntityStore>,
    files: Arc<dyn FileStore>,
    parser: Arc<dyn TabularParser>,
    jobs: Arc<RwLock<HashMap<Uuid, ImportJob>>>,
}

impl ImportManager {
    pub fn new(registry: Arc<SchemaRegistry>, store: Arc<dyn EntityStore>, files: Arc<dyn FileStore>) -> Self {
        ImportManager {
            registry,
            store,
            files,
            parser: Arc::new(CsvParser),
            jobs: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Validate the mapping, store the upload and start the worker. Returns the job as submitted.
    pub async fn submit(
        &self,
        entity: &EntityType,
        req: ImportRequest,
        identity: &Identity,
    ) -> Result<ImportJob, AppError> {
        let required = check_mappings(entity, &req, identity)?;

        let id = Uuid::new_v4();
        let file_name = Path::new(&req.file_name)
            .file_name()
            .and_then(|n| n.to_str())
            .filter(|n| !n.is_empty())
            .unwrap_or("upload.csv")
            .to_string();
        let source = self.files.put(&format!("imports/{}/{}", id, file_name), req.bytes).await?;
        let job = ImportJob {
            id,
            entity: entity.name.clone(),
            action: req.action,
            file_name,
            columns: req.columns,
            mappings: req.mappings,
            default_values: req.default_values,
            source,
            result: None,
            status: JobStatus::Submitted,
            progress: 0.0,
            total_rows: 0,
            succeeded: 0,
            failed: 0,
            error: None,
            submitted_by: identity.principal.clone(),
            created_at: Utc::now(),
            finished_at: None,
        };
        self.persist(&job).await?;
        self.write_jobs().insert(id, job.clone());
        tracing::info!(job = %id, entity = %job.entity, action = ?job.action, "import submitted");

        let worker = self.clone();
        let identity = identity.clone();
        tokio::spawn(async move { worker.run(id, required, identity).await });
        Ok(job)
    }

    /// Current state of a job, falling back to its persisted record.
    pub async fn status(&self, id: Uuid) -> Result<ImportJob, AppError> {
        let cached = self.read_jobs().get(&id).cloned();
        if let Some(job) = cached {
            return Ok(job);
        }
        let bytes = match self.files.get(&job_file(id)).await {
            Ok(bytes) => bytes,
            Err(AppError::NotFound(_)) => return Err(AppError::NotFound(format!("import job {}", id))),
            Err(e) => return Err(e),
        };
        serde_json::from_slice(&bytes).map_err(|e| AppError::Internal(format!("job record {}: {}", id, e)))
    }

    /// Jobs submitted to this process, newest first, optionally for one entity type.
    /// Jobs from earlier processes stay reachable by id through [`ImportManager::status`].
    pub fn list(&self, entity: Option<&str>) -> Vec<ImportJob> {
        let mut jobs: Vec<ImportJob> = self
            .read_jobs()
            .values()
            .filter(|job| entity.map_or(true, |name| job.entity == name))
            .cloned()
            .collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        jobs
    }

    /// Bytes of the result report of a finished job.
    pub async fn result(&self, id: Uuid) -> Result<Vec<u8>, AppError> {
        let job = self.status(id).await?;
        match (job.status, &job.result) {
            (JobStatus::Completed, Some(file)) => self.files.get(file).await,
            (JobStatus::Failed, _) => Err(AppError::Validation(format!(
                "import job {} failed: {}",
                id,
                job.error.unwrap_or_default()
            ))),
            _ => Err(AppError::Validation(format!("import job {} has not finished", id))),
        }
    }

    /// Poll until the job reaches a terminal state.
    pub async fn wait(&self, id: Uuid) -> Result<ImportJob, AppError> {
        loop {
            let job = self.status(id).await?;
            if job.status.is_finished() {
                return Ok(job);
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    async fn run(&self, id: Uuid, required: Vec<String>, identity: Identity) {
        self.update(id, |job| job.status = JobStatus::Running);
        let outcome = self.process(id, &required, &identity).await;
        let job = self.update(id, |job| {
            job.finished_at = Some(Utc::now());
            match &outcome {
                Ok(result) => {
                    job.status = JobStatus::Completed;
                    job.progress = 1.0;
                    job.result = Some(result.clone());
                }
                Err(e) => {
                    job.status = JobStatus::Failed;
                    job.error = Some(e.to_string());
                }
            }
        });
        let Some(job) = job else { return };
        match &outcome {
            Ok(_) => tracing::info!(
                job = %id,
                entity = %job.entity,
                succeeded = job.succeeded,
                failed = job.failed,
                "import completed"
            ),
            Err(e) => tracing::error!(job = %id, entity = %job.entity, error = %e, "import failed"),
        }
        if let Err(e) = self.persist(&job).await {
            tracing::error!(job = %id, error = %e, "could not persist import job");
        }
    }

    async fn process(&self, id: Uuid, required: &[String], identity: &Identity) -> Result<FileRef, AppError> {
        let job = self
            .read_jobs()
            .get(&id)
            .cloned()
            .ok_or_else(|| AppError::NotFound(format!("import job {}", id)))?;
        let entity = self.registry.describe(&job.entity)?;
        let bytes = self.files.get(&job.source).await?;
        let rows: Vec<Row> = self
            .parser
            .parse(&bytes)?
            .into_iter()
            .filter(|row| !is_blank_row(row))
            .collect();
        let total = rows.len();
        self.update(id, |j| j.total_rows = total);

        let mut outcomes = Vec::with_capacity(total);
        for (i, row) in rows.iter().enumerate() {
            let index = i + 1;
            self.update(id, |j| j.progress = row_progress(index, total));
            let outcome = match self.import_row(entity, &job, required, row, identity).await {
                Ok(key) => RowOutcome {
                    row: index,
                    status: RowStatus::Success,
                    message: key,
                },
                Err(e) => {
                    if e.is_client_error() {
                        tracing::warn!(job = %id, row = index, error = %e, "import row rejected");
                    } else {
                        tracing::error!(job = %id, row = index, error = %e, "import row failed");
                    }
                    RowOutcome {
                        row: index,
                        status: RowStatus::Error,
                        message: row_message(&e),
                    }
                }
            };
            self.update(id, |j| match outcome.status {
                RowStatus::Success => j.succeeded += 1,
                RowStatus::Error => j.failed += 1,
            });
            outcomes.push(outcome);
        }

        let report = write_report(outcomes.iter().map(|o| (o.row, o.status.as_str(), o.message.as_str())))?;
        self.files.put(&format!("imports/{}/results.csv", id), report).await
    }

    /// Write one row; returns the key of the written record.
    async fn import_row(
        &self,
        entity: &EntityType,
        job: &ImportJob,
        required: &[String],
        row: &Row,
        identity: &Identity,
    ) -> Result<String, AppError> {
        let cell = |field: &str| {
            job.mappings
                .get(field)
                .and_then(|col| row.get(col))
                .map(|v| v.trim())
                .filter(|v| !v.is_empty())
        };
        let missing: Vec<String> = required.iter().filter(|f| cell(f).is_none()).cloned().collect();
        if !missing.is_empty() {
            return Err(AppError::MissingMapping(missing));
        }

        let mut payload = serde_json::Map::new();
        for field in job.mappings.keys() {
            let value = match cell(field) {
                Some(text) => cell_value(entity, field, text),
                None => match job.default_values.get(field) {
                    Some(default) => default.clone(),
                    None => continue,
                },
            };
            payload.insert(field.clone(), value);
        }
        for (field, default) in &job.default_values {
            payload.entry(field.clone()).or_insert_with(|| default.clone());
        }

        let existing = match (job.action, payload.get(&entity.pk)) {
            (ImportAction::Create, _) | (_, None) => None,
            (action, Some(raw)) => {
                let key = entity.normalize_key(raw)?;
                if self.store.get(entity, &key).await?.is_some() {
                    Some(key)
                } else if action == ImportAction::Update {
                    return Err(AppError::NotFound(format!("{} {}", entity.name, key_text(&key))));
                } else {
                    None
                }
            }
        };

        let payload = Value::Object(payload);
        let written = match existing {
            Some(key) => {
                Serializer::update(&self.registry, self.store.as_ref(), entity, &key, &payload, identity).await?
            }
            None => {
                let mut payload = payload;
                if let Value::Object(obj) = &mut payload {
                    // only update rows address an existing key
                    if entity.pk_field().auto_generated {
                        obj.remove(&entity.pk);
                    }
                }
                Serializer::create(&self.registry, self.store.as_ref(), entity, &payload, identity).await?
            }
        };
        Ok(entity.key_of(&written).map(key_text).unwrap_or_default())
    }

    async fn persist(&self, job: &ImportJob) -> Result<(), AppError> {
        let bytes = serde_json::to_vec_pretty(job).map_err(|e| AppError::Internal(e.to_string()))?;
        self.files.put(job_file(job.id).as_str(), bytes).await?;
        Ok(())
    }

    /// Apply `f` to the job in the table and return the updated copy.
    fn update(&self, id: Uuid, f: impl FnOnce(&mut ImportJob)) -> Option<ImportJob> {
        let mut jobs = self.write_jobs();
        let job = jobs.get_mut(&id)?;
        f(job);
        Some(job.clone())
    }

    // a panic elsewhere must not wedge the job table
    fn read_jobs(&self) -> RwLockReadGuard<'_, HashMap<Uuid, ImportJob>> {
        self.jobs.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_jobs(&self) -> RwLockWriteGuard<'_, HashMap<Uuid, ImportJob>> {
        self.jobs.write().unwrap_or_else(|e| e.into_inner())
    }
}

fn job_file(id: Uuid) -> FileRef {
    FileRef(format!("imports/{}/job.json", id))
}

/// Check mapping and default keys; returns the fields every row must supply.
/// Attribution fields are stamped from the submitter, so they need no column when one is known.
fn check_mappings(entity: &EntityType, req: &ImportRequest, identity: &Identity) -> Result<Vec<String>, AppError> {
    for (field, column) in &req.mappings {
        entity.require_mutable_field(field)?;
        if !req.columns.is_empty() && !req.columns.iter().any(|c| c == column) {
            return Err(AppError::Validation(format!(
                "column '{}' mapped to {} is not in the column list",
                column, field
            )));
        }
    }
    for field in req.default_values.keys() {
        entity.require_mutable_field(field)?;
    }

    let stamped = |name: &str| identity.principal.is_some() && (name == CREATED_BY || name == UPDATED_BY);
    let mut required: Vec<String> = entity
        .required_fields()
        .iter()
        .filter(|f| !stamped(&f.name))
        .map(|f| f.name.clone())
        .collect();
    if req.action == ImportAction::Update && !required.contains(&entity.pk) {
        required.push(entity.pk.clone());
    }
    let missing: Vec<String> = required
        .iter()
        .filter(|f| !req.mappings.contains_key(f.as_str()))
        .cloned()
        .collect();
    if !missing.is_empty() {
        return Err(AppError::MissingMapping(missing));
    }
    Ok(required)
}

/// Fraction of rows started once the 1-based row `index` begins.
fn row_progress(index: usize, total: usize) -> f64 {
    if total == 0 {
        return 1.0;
    }
    index as f64 / total as f64
}

/// Many-to-many cells hold comma separated keys; everything else stays text for coercion.
fn cell_value(entity: &EntityType, field: &str, text: &str) -> Value {
    match entity.field(field) {
        Some(f) if f.is_many_to_many() => Value::Array(
            text.split(',')
                .map(str::trim)
                .filter(|k| !k.is_empty())
                .map(|k| Value::String(k.to_string()))
                .collect(),
        ),
        _ => Value::String(text.to_string()),
    }
}

fn row_message(e: &AppError) -> String {
    match e {
        AppError::MissingMapping(fields) => format!("Missing required fields: {}", fields.join(", ")),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::load_from_str;
    use crate::query::Predicate;
    use crate::store::{MemoryFileStore, MemoryStore};
    use serde_json::json;

    fn manager() -> ImportManager {
        let registry = Arc::new(
            load_from_str(
                r#"{ "entities": [ { "name": "Contact", "namespace": "crm", "fields": [
                    { "name": "id", "type": "serial", "primary_key": true },
                    { "name": "name", "type": "varchar", "nullable": false },
                    { "name": "email", "type": "varchar", "nullable": false },
                    { "name": "city", "type": "varchar" },
                    { "name": "created_by", "type": "varchar" }
                ] } ] }"#,
            )
            .unwrap(),
        );
        let store: Arc<dyn EntityStore> = Arc::new(MemoryStore::new(registry.clone()));
        ImportManager::new(registry, store, Arc::new(MemoryFileStore::default()))
    }

    fn request(action: ImportAction, csv: &str) -> ImportRequest {
        ImportRequest {
            action,
            file_name: "contacts.csv".into(),
            bytes: csv.as_bytes().to_vec(),
            columns: vec!["ID".into(), "Name".into(), "Email".into(), "Town".into()],
            mappings: [("name", "Name"), ("email", "Email"), ("city", "Town")]
                .into_iter()
                .map(|(f, c)| (f.to_string(), c.to_string()))
                .collect(),
            default_values: json!({ "city": "Oslo" }).as_object().cloned().unwrap(),
        }
    }

    #[tokio::test]
    async fn row_missing_required_value_is_reported_and_others_succeed() {
        let imports = manager();
        let contact = imports.registry.describe("Contact").unwrap().clone();
        let csv = "ID,Name,Email,Town\n,Ann,ann@x.io,\n,Bob,,Rome\n,,,\n,Cid,cid@x.io,Lima\n";
        let job = imports
            .submit(&contact, request(ImportAction::Create, csv), &Identity::user("u1"))
            .await
            .unwrap();
        let done = imports.wait(job.id).await.unwrap();
        assert_eq!(done.status, JobStatus::Completed);
        assert_eq!((done.total_rows, done.succeeded, done.failed), (3, 2, 1));
        assert_eq!(done.percent(), 100.0);

        let report = String::from_utf8(imports.result(job.id).await.unwrap()).unwrap();
        assert_eq!(
            report,
            "row,status,message\n1,success,1\n2,error,Missing required fields: email\n3,success,2\n"
        );
        let rows = imports.store.filter(&contact, &Predicate::All, None, None).await.unwrap();
        assert_eq!(rows[0]["city"], json!("Oslo"));
        assert_eq!(rows[0]["created_by"], json!("u1"));
        assert_eq!(rows[1]["city"], json!("Lima"));
    }

    #[tokio::test]
    async fn submission_checks_mappings_before_starting() {
        let imports = manager();
        let contact = imports.registry.describe("Contact").unwrap().clone();
        let mut req = request(ImportAction::Create, "Name\n");
        req.mappings.remove("email");
        assert!(matches!(
            imports.submit(&contact, req, &Identity::anonymous()).await,
            Err(AppError::MissingMapping(fields)) if fields == vec!["email".to_string()]
        ));

        let mut req = request(ImportAction::Create, "Name\n");
        req.mappings.insert("nickname".into(), "Name".into());
        assert!(matches!(
            imports.submit(&contact, req, &Identity::anonymous()).await,
            Err(AppError::InvalidField { .. })
        ));

        let req = request(ImportAction::Update, "Name\n");
        assert!(matches!(
            imports.submit(&contact, req, &Identity::anonymous()).await,
            Err(AppError::MissingMapping(fields)) if fields == vec!["id".to_string()]
        ));
    }

    #[tokio::test]
    async fn both_updates_known_keys_and_creates_the_rest() {
        let imports = manager();
        let contact = imports.registry.describe("Contact").unwrap().clone();
        let seed = "ID,Name,Email,Town\n,Ann,ann@x.io,Paris\n";
        let first = imports
            .submit(&contact, request(ImportAction::Create, seed), &Identity::anonymous())
            .await
            .unwrap();
        imports.wait(first.id).await.unwrap();

        let mut req = request(ImportAction::Both, "ID,Name,Email,Town\n1,Anna,ann@x.io,\n9,Dan,dan@x.io,Kyiv\n");
        req.mappings.insert("id".into(), "ID".into());
        let job = imports.submit(&contact, req, &Identity::anonymous()).await.unwrap();
        let done = imports.wait(job.id).await.unwrap();
        assert_eq!((done.succeeded, done.failed), (2, 0));

        let rows = imports.store.filter(&contact, &Predicate::All, None, None).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["name"], json!("Anna"));
        assert_eq!(rows[0]["city"], json!("Oslo"));
        assert_eq!(rows[1]["id"], json!(2));
    }

    #[tokio::test]
    async fn unknown_jobs_and_unfinished_results() {
        let imports = manager();
        assert!(matches!(imports.status(Uuid::new_v4()).await, Err(AppError::NotFound(_))));
        assert!(matches!(imports.result(Uuid::new_v4()).await, Err(AppError::NotFound(_))));
    }

    #[tokio::test]
    async fn required_attribution_needs_no_mapping_when_submitter_is_known() {
        let registry = Arc::new(
            load_from_str(
                r#"{ "entities": [ { "name": "Note", "namespace": "crm", "fields": [
                    { "name": "id", "type": "serial", "primary_key": true },
                    { "name": "body", "type": "varchar" },
                    { "name": "created_by", "type": "varchar", "nullable": false }
                ] } ] }"#,
            )
            .unwrap(),
        );
        let store: Arc<dyn EntityStore> = Arc::new(MemoryStore::new(registry.clone()));
        let imports = ImportManager::new(registry.clone(), store, Arc::new(MemoryFileStore::default()));
        let note = registry.describe("Note").unwrap();
        let req = || ImportRequest {
            file_name: "notes.csv".into(),
            bytes: b"Body\nfirst\n".to_vec(),
            mappings: [("body".to_string(), "Body".to_string())].into_iter().collect(),
            ..Default::default()
        };

        assert!(matches!(
            imports.submit(note, req(), &Identity::anonymous()).await,
            Err(AppError::MissingMapping(fields)) if fields == vec!["created_by".to_string()]
        ));
        let job = imports.submit(note, req(), &Identity::user("alice")).await.unwrap();
        let done = imports.wait(job.id).await.unwrap();
        assert_eq!((done.succeeded, done.failed), (1, 0));
        let rows = imports.store.filter(note, &Predicate::All, None, None).await.unwrap();
        assert_eq!(rows[0]["created_by"], json!("alice"));
    }

    #[test]
    fn progress_reaches_one_on_the_last_row() {
        let seen: Vec<f64> = (1..=4).map(|index| row_progress(index, 4)).collect();
        assert_eq!(seen, vec![0.25, 0.5, 0.75, 1.0]);
        assert_eq!(row_progress(1, 1), 1.0);
        assert_eq!(row_progress(0, 0), 1.0);
    }

    #[tokio::test]
    async fn list_returns_newest_jobs_for_the_requested_entity() {
        let imports = manager();
        let contact = imports.registry.describe("Contact").unwrap().clone();
        let csv = "ID,Name,Email,Town\n,Ann,ann@x.io,\n";
        let first = imports
            .submit(&contact, request(ImportAction::Create, csv), &Identity::anonymous())
            .await
            .unwrap();
        imports.wait(first.id).await.unwrap();
        let second = imports
            .submit(&contact, request(ImportAction::Create, csv), &Identity::anonymous())
            .await
            .unwrap();
        imports.wait(second.id).await.unwrap();

        let ids: Vec<Uuid> = imports.list(Some("Contact")).iter().map(|j| j.id).collect();
        assert_eq!(ids, vec![second.id, first.id]);
        assert_eq!(imports.list(None).len(), 2);
        assert!(imports.list(Some("Invoice")).is_empty());
    }
}
