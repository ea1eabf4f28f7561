//! Free-text search fanned out across every searchable entity type.

use crate::config::{EntityType, FieldSchema, SchemaRegistry};
use crate::error::AppError;
use crate::query::search_predicate;
use crate::service::Serializer;
use crate::store::EntityStore;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;

#[derive(Debug, Serialize)]
pub struct SearchHits {
    pub data: Vec<Value>,
    pub schema: Vec<FieldSchema>,
}

pub struct SearchService;

impl SearchService {
    /// Entity name → matches and schema, only for types with at least one match.
    pub async fn search(
        registry: &SchemaRegistry,
        store: &dyn EntityStore,
        query: Option<&str>,
        module: Option<&str>,
    ) -> Result<BTreeMap<String, SearchHits>, AppError> {
        let text = query.map(str::trim).filter(|q| !q.is_empty()).ok_or(AppError::MissingQuery)?;
        let candidates: Vec<&EntityType> = match module.map(str::trim).filter(|m| !m.is_empty()) {
            Some(name) => {
                let entity = registry.describe(name).or_else(|_| registry.describe_by_path(name))?;
                vec![entity]
            }
            None => registry.entities().iter().collect(),
        };

        let mut out = BTreeMap::new();
        for entity in candidates.into_iter().filter(|e| e.is_searchable()) {
            let rows = store.filter(entity, &search_predicate(entity, text), None, None).await?;
            if rows.is_empty() {
                continue;
            }
            tracing::debug!(entity = %entity.name, matches = rows.len(), "search hits");
            let data = Serializer::represent_many(registry, store, entity, &rows).await?;
            let schema = entity.schema_listing().into_iter().filter(|f| !f.reverse).collect();
            out.insert(entity.name.clone(), SearchHits { data, schema });
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::load_from_str;
    use crate::store::{MemoryStore, Record};
    use serde_json::json;
    use std::sync::Arc;

    async fn seeded() -> (Arc<SchemaRegistry>, MemoryStore) {
        let reg = Arc::new(
            load_from_str(
                r#"{ "entities": [
                { "name": "Contact", "namespace": "crm", "fields": [
                    { "name": "id", "type": "serial", "primary_key": true },
                    { "name": "name", "type": "varchar" }
                ] },
                { "name": "Company", "namespace": "crm", "fields": [
                    { "name": "id", "type": "serial", "primary_key": true },
                    { "name": "title", "type": "varchar" }
                ] },
                { "name": "Counter", "namespace": "ops", "fields": [
                    { "name": "id", "type": "serial", "primary_key": true },
                    { "name": "value", "type": "integer" }
                ] }
            ] }"#,
            )
            .unwrap(),
        );
        let store = MemoryStore::new(reg.clone());
        let insert = |v: serde_json::Value| -> Record { v.as_object().cloned().unwrap() };
        store.create(reg.describe("Contact").unwrap(), insert(json!({ "name": "Alice Liddell" }))).await.unwrap();
        store.create(reg.describe("Company").unwrap(), insert(json!({ "title": "Acme" }))).await.unwrap();
        store.create(reg.describe("Counter").unwrap(), insert(json!({ "value": 7 }))).await.unwrap();
        (reg, store)
    }

    #[tokio::test]
    async fn only_matching_types_are_returned() {
        let (reg, store) = seeded().await;
        let hits = SearchService::search(&reg, &store, Some("alice"), None).await.unwrap();
        assert_eq!(hits.keys().collect::<Vec<_>>(), vec!["Contact"]);
        assert_eq!(hits["Contact"].data[0]["name"], json!("Alice Liddell"));

        let none = SearchService::search(&reg, &store, Some("zebra"), None).await.unwrap();
        assert!(none.is_empty());
    }

    #[tokio::test]
    async fn blank_query_and_unknown_module_fail() {
        let (reg, store) = seeded().await;
        assert!(matches!(
            SearchService::search(&reg, &store, Some("   "), None).await,
            Err(AppError::MissingQuery)
        ));
        assert!(matches!(SearchService::search(&reg, &store, None, None).await, Err(AppError::MissingQuery)));
        assert!(matches!(
            SearchService::search(&reg, &store, Some("a"), Some("Invoice")).await,
            Err(AppError::UnknownEntity(_))
        ));
        let narrowed = SearchService::search(&reg, &store, Some("ac"), Some("Company")).await.unwrap();
        assert_eq!(narrowed.len(), 1);
    }

    #[tokio::test]
    async fn entities_with_only_sensitive_text_are_skipped() {
        let reg = load_from_str(
            r#"{ "entities": [ { "name": "Vault", "namespace": "ops", "sensitive_fields": ["secret_note"], "fields": [
                { "name": "id", "type": "serial", "primary_key": true },
                { "name": "secret_note", "type": "varchar" }
            ] } ] }"#,
        )
        .unwrap();
        let vault = reg.describe("Vault").unwrap();
        let store = MemoryStore::new(Arc::new(reg.clone()));
        store
            .create(vault, json!({ "secret_note": "abc" }).as_object().cloned().unwrap())
            .await
            .unwrap();

        let hits = SearchService::search(&reg, &store, Some("zzz-not-present"), None).await.unwrap();
        assert!(hits.is_empty());
        let hits = SearchService::search(&reg, &store, Some("abc"), Some("Vault")).await.unwrap();
        assert!(hits.is_empty());
    }
}
