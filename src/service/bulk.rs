//! Bulk mutation over key sets (mass update, mass delete) and condition-filtered export.

use crate::config::{key_text, EntityType, SchemaRegistry};
use crate::error::AppError;
use crate::identity::Identity;
use crate::query::{compile_with, ConditionNode, OperatorPolicy, Predicate};
use crate::service::{Serializer, WriteMode};
use crate::store::{EntityStore, Record};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Default, Deserialize)]
pub struct MassUpdateRequest {
    #[serde(default)]
    pub ids: Vec<Value>,
    #[serde(default)]
    pub data: Value,
}

#[derive(Debug, Default, Deserialize)]
pub struct MassDeleteRequest {
    #[serde(default)]
    pub ids: Vec<Value>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ExportRequest {
    #[serde(default)]
    pub columns: Vec<String>,
    #[serde(default)]
    pub conditions: Vec<ConditionNode>,
}

#[derive(Debug, Serialize)]
pub struct FailedUpdate {
    pub key: Value,
    pub code: &'static str,
    pub error: String,
}

#[derive(Debug, Default, Serialize)]
pub struct MassUpdateReport {
    pub updated: u64,
    pub failed: Vec<FailedUpdate>,
}

#[derive(Debug, Serialize)]
pub struct ExportResult {
    pub columns: Vec<String>,
    pub results: Vec<serde_json::Map<String, Value>>,
}

pub struct BulkService;

impl BulkService {
    /// Apply one payload to every record in `ids`. Not atomic: each record is saved on its own
    /// and failures are reported per key.
    pub async fn mass_update(
        registry: &SchemaRegistry,
        store: &dyn EntityStore,
        entity: &EntityType,
        req: &MassUpdateRequest,
        identity: &Identity,
    ) -> Result<MassUpdateReport, AppError> {
        let empty_payload = req.data.as_object().map_or(true, |o| o.is_empty());
        if req.ids.is_empty() || empty_payload {
            return Err(AppError::EmptyRequest("provide 'ids' and 'data' for the update".into()));
        }
        let keys = normalize_keys(entity, &req.ids)?;
        let rows = store
            .filter(entity, &Predicate::key_in(entity.pk.clone(), keys), None, None)
            .await?;
        if rows.is_empty() {
            return Err(AppError::NotFound("no records found for the provided ids".into()));
        }
        // resolved once so embedded creations happen once for the whole batch
        let attrs =
            Serializer::from_representation(registry, store, entity, &req.data, identity, WriteMode::Update).await?;

        let mut report = MassUpdateReport::default();
        for row in rows {
            let Some(key) = entity.key_of(&row).cloned() else { continue };
            let mut record: Record = attrs.clone();
            record.insert(entity.pk.clone(), key.clone());
            match store.save(entity, record).await {
                Ok(_) => report.updated += 1,
                Err(e) => {
                    tracing::warn!(entity = %entity.name, key = %key_text(&key), error = %e, "mass update failed for record");
                    report.failed.push(FailedUpdate {
                        key,
                        code: e.code(),
                        error: e.to_string(),
                    });
                }
            }
        }
        Ok(report)
    }

    /// Delete every record in `ids`, or none of them when any is protected.
    pub async fn mass_delete(store: &dyn EntityStore, entity: &EntityType, req: &MassDeleteRequest) -> Result<u64, AppError> {
        if req.ids.is_empty() {
            return Err(AppError::EmptyRequest("provide 'ids' for the delete".into()));
        }
        let keys = normalize_keys(entity, &req.ids)?;
        let found = store
            .count(entity, &Predicate::key_in(entity.pk.clone(), keys.clone()))
            .await?;
        if found == 0 {
            return Err(AppError::NotFound("no records found for the provided ids".into()));
        }
        let deleted = store.delete(entity, &keys).await?;
        tracing::debug!(entity = %entity.name, deleted, "mass delete");
        Ok(deleted)
    }

    /// Filtered rows with every selected value rendered as text.
    pub async fn export(
        store: &dyn EntityStore,
        entity: &EntityType,
        req: &ExportRequest,
        policy: OperatorPolicy,
    ) -> Result<ExportResult, AppError> {
        let columns: Vec<String> = if req.columns.is_empty() {
            entity
                .column_fields()
                .filter(|f| !entity.is_sensitive(&f.name))
                .map(|f| f.name.clone())
                .collect()
        } else {
            for name in &req.columns {
                let field = entity.require_field(name)?;
                if field.is_many() || entity.is_sensitive(name) {
                    return Err(AppError::InvalidField {
                        entity: entity.name.clone(),
                        field: name.clone(),
                    });
                }
            }
            req.columns.clone()
        };
        let predicate = compile_with(entity, &req.conditions, policy)?;
        let rows = store.filter(entity, &predicate, None, None).await?;
        let results = rows
            .iter()
            .map(|row| {
                columns
                    .iter()
                    .map(|c| (c.clone(), Value::String(row.get(c).map(key_text).unwrap_or_default())))
                    .collect()
            })
            .collect();
        Ok(ExportResult { columns, results })
    }
}

fn normalize_keys(entity: &EntityType, ids: &[Value]) -> Result<Vec<Value>, AppError> {
    ids.iter().map(|id| entity.normalize_key(id)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::load_from_str;
    use crate::store::MemoryStore;
    use serde_json::json;
    use std::sync::Arc;

    fn registry() -> Arc<SchemaRegistry> {
        Arc::new(
            load_from_str(
                r#"{ "entities": [
                { "name": "Product", "namespace": "shop", "sensitive_fields": ["cost"], "fields": [
                    { "name": "id", "type": "serial", "primary_key": true },
                    { "name": "name", "type": "varchar", "nullable": false },
                    { "name": "price", "type": "numeric" },
                    { "name": "cost", "type": "numeric" },
                    { "name": "sku", "type": "varchar", "unique": true }
                ] }
            ] }"#,
            )
            .unwrap(),
        )
    }

    async fn seed(store: &MemoryStore, product: &EntityType) {
        for (name, price, sku) in [("Pen", json!(2), json!("P1")), ("Ink", json!(5.5), json!("I1")), ("Pad", Value::Null, json!("D1"))] {
            let attrs = json!({ "name": name, "price": price, "sku": sku });
            store.create(product, attrs.as_object().cloned().unwrap()).await.unwrap();
        }
    }

    #[tokio::test]
    async fn mass_update_is_idempotent_and_reports_failures() {
        let reg = registry();
        let store = MemoryStore::new(reg.clone());
        let product = reg.describe("Product").unwrap();
        seed(&store, product).await;
        let anon = Identity::anonymous();
        let req = MassUpdateRequest {
            ids: vec![json!(1), json!("2")],
            data: json!({ "price": "9.5" }),
        };
        let first = BulkService::mass_update(&reg, &store, product, &req, &anon).await.unwrap();
        let after_first = store.filter(product, &Predicate::All, None, None).await.unwrap();
        let second = BulkService::mass_update(&reg, &store, product, &req, &anon).await.unwrap();
        let after_second = store.filter(product, &Predicate::All, None, None).await.unwrap();
        assert_eq!(first.updated, 2);
        assert_eq!(second.updated, 2);
        assert_eq!(after_first, after_second);
        assert_eq!(after_second[0]["price"], json!(9.5));

        let clash = MassUpdateRequest {
            ids: vec![json!(1), json!(2)],
            data: json!({ "sku": "SAME" }),
        };
        let report = BulkService::mass_update(&reg, &store, product, &clash, &anon).await.unwrap();
        assert_eq!(report.updated, 1);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].code, "conflict");
    }

    #[tokio::test]
    async fn empty_and_unmatched_requests_are_rejected() {
        let reg = registry();
        let store = MemoryStore::new(reg.clone());
        let product = reg.describe("Product").unwrap();
        let anon = Identity::anonymous();
        let empty = MassUpdateRequest {
            ids: vec![json!(1)],
            data: json!({}),
        };
        assert!(matches!(
            BulkService::mass_update(&reg, &store, product, &empty, &anon).await,
            Err(AppError::EmptyRequest(_))
        ));
        assert!(matches!(
            BulkService::mass_delete(&store, product, &MassDeleteRequest::default()).await,
            Err(AppError::EmptyRequest(_))
        ));
        let missing = MassDeleteRequest { ids: vec![json!(42)] };
        assert!(matches!(
            BulkService::mass_delete(&store, product, &missing).await,
            Err(AppError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn export_renders_text_and_hides_sensitive_columns() {
        let reg = registry();
        let store = MemoryStore::new(reg.clone());
        let product = reg.describe("Product").unwrap();
        seed(&store, product).await;
        let req = ExportRequest {
            columns: Vec::new(),
            conditions: vec![ConditionNode::new("name", "starts_with", json!("p"), "AND")],
        };
        let out = BulkService::export(&store, product, &req, OperatorPolicy::Skip).await.unwrap();
        assert_eq!(out.columns, vec!["id", "name", "price", "sku"]);
        assert_eq!(out.results.len(), 2);
        assert_eq!(out.results[0]["price"], json!("2"));
        assert_eq!(out.results[1]["price"], json!(""));

        let req = ExportRequest {
            columns: vec!["cost".into()],
            conditions: Vec::new(),
        };
        assert!(matches!(
            BulkService::export(&store, product, &req, OperatorPolicy::Skip).await,
            Err(AppError::InvalidField { .. })
        ));
    }
}
