use entity_engine::config::load_from_str;
use entity_engine::service::{
    BulkService, ImportAction, ImportRequest, JobStatus, MassDeleteRequest, SearchService, Serializer,
};
use entity_engine::{AppError, EntityStore, Identity, ImportManager, LocalFileStore, MemoryStore, Predicate, SchemaRegistry};
use serde_json::json;
use std::sync::Arc;

const SCHEMA: &str = r#"{ "entities": [
    { "name": "Author", "namespace": "library", "display_field": "name", "fields": [
        { "name": "id", "type": "serial", "primary_key": true },
        { "name": "name", "type": "varchar", "nullable": false }
    ] },
    { "name": "Shelf", "namespace": "library", "fields": [
        { "name": "id", "type": "serial", "primary_key": true },
        { "name": "code", "type": "integer", "nullable": false }
    ] },
    { "name": "Book", "namespace": "library", "display_field": "title", "fields": [
        { "name": "id", "type": "serial", "primary_key": true },
        { "name": "title", "type": "varchar", "nullable": false },
        { "name": "author", "type": "fk", "nullable": false, "relation": { "target": "Author" } },
        { "name": "shelf", "type": "fk", "relation": { "target": "Shelf", "on_delete": "cascade" } }
    ] }
] }"#;

fn setup() -> (Arc<SchemaRegistry>, Arc<MemoryStore>) {
    let registry = Arc::new(load_from_str(SCHEMA).unwrap());
    let store = Arc::new(MemoryStore::new(registry.clone()));
    (registry, store)
}

#[tokio::test]
async fn search_returns_only_types_with_matches() {
    let (registry, store) = setup();
    let anon = Identity::anonymous();
    let author = registry.describe("Author").unwrap();
    let book = registry.describe("Book").unwrap();
    Serializer::create(&registry, store.as_ref(), author, &json!({ "name": "Alice Munro" }), &anon)
        .await
        .unwrap();
    Serializer::create(&registry, store.as_ref(), book, &json!({ "title": "Runaway", "author": 1 }), &anon)
        .await
        .unwrap();

    let hits = SearchService::search(&registry, store.as_ref(), Some("alice"), None).await.unwrap();
    assert_eq!(hits.keys().collect::<Vec<_>>(), vec!["Author"]);
    assert!(matches!(
        SearchService::search(&registry, store.as_ref(), Some("alice"), Some("Planet")).await,
        Err(AppError::UnknownEntity(_))
    ));
}

#[tokio::test]
async fn mass_delete_is_all_or_nothing_and_cascades() {
    let (registry, store) = setup();
    let anon = Identity::anonymous();
    let author = registry.describe("Author").unwrap();
    let shelf = registry.describe("Shelf").unwrap();
    let book = registry.describe("Book").unwrap();
    for name in ["Ann", "Ben"] {
        Serializer::create(&registry, store.as_ref(), author, &json!({ "name": name }), &anon)
            .await
            .unwrap();
    }
    Serializer::create(&registry, store.as_ref(), shelf, &json!({ "code": 7 }), &anon)
        .await
        .unwrap();
    Serializer::create(
        &registry,
        store.as_ref(),
        book,
        &json!({ "title": "Tide", "author": 1, "shelf": 1 }),
        &anon,
    )
    .await
    .unwrap();

    let req = MassDeleteRequest { ids: vec![json!(1), json!(2)] };
    match BulkService::mass_delete(store.as_ref(), author, &req).await {
        Err(AppError::Protected { blockers }) => assert_eq!(blockers, vec!["Tide"]),
        other => panic!("expected protected, got {:?}", other),
    }
    assert_eq!(store.count(author, &Predicate::All).await.unwrap(), 2);

    let req = MassDeleteRequest { ids: vec![json!(1)] };
    assert_eq!(BulkService::mass_delete(store.as_ref(), shelf, &req).await.unwrap(), 1);
    assert_eq!(store.count(book, &Predicate::All).await.unwrap(), 0);
}

#[tokio::test]
async fn finished_jobs_are_readable_from_the_file_store() {
    let (registry, store) = setup();
    let root = std::env::temp_dir().join(format!("entity-engine-import-{}", uuid::Uuid::new_v4()));
    let files = Arc::new(LocalFileStore::new(&root));
    let store: Arc<dyn EntityStore> = store;
    let imports = ImportManager::new(registry.clone(), store.clone(), files.clone());
    let shelf = registry.describe("Shelf").unwrap();

    let req = ImportRequest {
        action: ImportAction::Create,
        file_name: "shelves.csv".into(),
        bytes: b"Code\n1\nten\n3\n".to_vec(),
        columns: Vec::new(),
        mappings: [("code".to_string(), "Code".to_string())].into_iter().collect(),
        default_values: Default::default(),
    };
    let job = imports.submit(shelf, req, &Identity::user("importer")).await.unwrap();
    let done = imports.wait(job.id).await.unwrap();
    assert_eq!(done.status, JobStatus::Completed);
    assert_eq!((done.succeeded, done.failed), (2, 1));

    // a fresh manager only knows what was persisted
    let reopened = ImportManager::new(registry, store, files);
    let persisted = reopened.status(job.id).await.unwrap();
    assert_eq!(persisted.status, JobStatus::Completed);
    assert_eq!(persisted.submitted_by.as_deref(), Some("importer"));
    let report = String::from_utf8(reopened.result(job.id).await.unwrap()).unwrap();
    assert!(report.starts_with("row,status,message\n1,success,1\n2,error,"));
    let _ = tokio::fs::remove_dir_all(root).await;
}
