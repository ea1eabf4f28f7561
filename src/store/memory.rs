//! In-process entity store. Honors relation integrity and on-delete policies like a
//! relational backend would, so services behave the same against both stores.

use crate::config::{key_text, EntityType, FieldDescriptor, FieldKind, OnDeleteConfig, PkType, SchemaRegistry};
use crate::error::AppError;
use crate::query::{compare, loose_eq, Page, Predicate, SortOrder};
use crate::store::{EntityStore, Record};
use async_trait::async_trait;
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

#[derive(Debug, Default)]
struct Table {
    rows: Vec<Record>,
    next_id: i64,
}

type Tables = HashMap<String, Table>;

pub struct MemoryStore {
    registry: Arc<SchemaRegistry>,
    tables: RwLock<Tables>,
}

impl MemoryStore {
    pub fn new(registry: Arc<SchemaRegistry>) -> Self {
        MemoryStore {
            registry,
            tables: RwLock::new(HashMap::new()),
        }
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Tables>, AppError> {
        self.tables
            .read()
            .map_err(|_| AppError::Internal("memory store lock poisoned".into()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Tables>, AppError> {
        self.tables
            .write()
            .map_err(|_| AppError::Internal("memory store lock poisoned".into()))
    }
}

fn find_index(table: Option<&Table>, entity: &EntityType, key: &Value) -> Option<usize> {
    table?
        .rows
        .iter()
        .position(|r| r.get(&entity.pk).is_some_and(|v| loose_eq(v, key)))
}

fn row_exists(tables: &Tables, entity: &EntityType, key: &Value) -> bool {
    find_index(tables.get(&entity.name), entity, key).is_some()
}

fn reject_unknown_keys(entity: &EntityType, record: &Record) -> Result<(), AppError> {
    for name in record.keys() {
        entity.require_mutable_field(name)?;
    }
    Ok(())
}

/// Integrity checks shared by create and save: nullability, uniqueness, relation targets.
fn check_row(
    registry: &SchemaRegistry,
    tables: &Tables,
    entity: &EntityType,
    row: &Record,
    own_index: Option<usize>,
) -> Result<(), AppError> {
    let existing = tables.get(&entity.name);
    for field in entity.mutable_fields() {
        let value = row.get(&field.name).unwrap_or(&Value::Null);
        if value.is_null() {
            if !field.nullable && !field.auto_generated && !field.is_many() {
                return Err(AppError::Validation(format!("{} may not be null", field.name)));
            }
            continue;
        }
        if field.unique {
            let clash = existing.is_some_and(|t| {
                t.rows.iter().enumerate().any(|(i, r)| {
                    Some(i) != own_index && r.get(&field.name).is_some_and(|v| loose_eq(v, value))
                })
            });
            if clash {
                return Err(AppError::Conflict(format!(
                    "{} with this {} already exists",
                    entity.name, field.name
                )));
            }
        }
        if let Some(target_name) = field.target() {
            let target = registry.describe(target_name)?;
            let keys: Vec<&Value> = match value {
                Value::Array(items) => items.iter().collect(),
                single => vec![single],
            };
            for key in keys {
                if !row_exists(tables, target, key) {
                    return Err(AppError::RelatedNotFound {
                        entity: target.name.clone(),
                        field: field.name.clone(),
                        key: key_text(key),
                    });
                }
            }
        }
    }
    Ok(())
}

fn initial_value(field: &FieldDescriptor, entity: &EntityType, table: &mut Table) -> Result<Value, AppError> {
    if let Some(default) = &field.default {
        return Ok(default.clone());
    }
    if field.is_many_to_many() {
        return Ok(Value::Array(Vec::new()));
    }
    if field.primary_key {
        return match entity.pk_type {
            PkType::Int | PkType::BigInt => {
                table.next_id += 1;
                Ok(Value::Number(table.next_id.into()))
            }
            PkType::Uuid => Ok(Value::String(uuid::Uuid::new_v4().to_string())),
            PkType::Text => Err(AppError::Validation(format!("{} is required", field.name))),
        };
    }
    if field.auto_generated && field.kind == FieldKind::DateTime {
        return Ok(Value::String(chrono::Utc::now().to_rfc3339()));
    }
    Ok(Value::Null)
}

fn cmp_nullable(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    let a = a.filter(|v| !v.is_null());
    let b = b.filter(|v| !v.is_null());
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Greater,
        (Some(_), None) => Ordering::Less,
        (Some(x), Some(y)) => compare(x, y).unwrap_or(Ordering::Equal),
    }
}

/// Rows scheduled for deletion per entity, keyed by the textual form of their key.
#[derive(Default)]
struct Collector {
    doomed: HashMap<String, HashSet<String>>,
    protected: Vec<(String, String, String)>,
    nulled: Vec<(String, String, String)>,
}

impl Collector {
    fn is_doomed(&self, entity: &str, key: &str) -> bool {
        self.doomed.get(entity).is_some_and(|k| k.contains(key))
    }

    /// Walk single-valued relations pointing at the doomed rows, applying each field's policy.
    fn collect(&mut self, registry: &SchemaRegistry, tables: &Tables, entity: &EntityType, keys: Vec<String>) -> Result<(), AppError> {
        let mut work = vec![(entity.name.clone(), keys)];
        while let Some((name, keys)) = work.pop() {
            let fresh: Vec<String> = keys
                .into_iter()
                .filter(|k| self.doomed.entry(name.clone()).or_default().insert(k.clone()))
                .collect();
            if fresh.is_empty() {
                continue;
            }
            for (source, field) in registry.referencing(&name) {
                if !field.is_single_relation() {
                    continue;
                }
                let Some(table) = tables.get(&source.name) else { continue };
                let on_delete = field.relation.as_ref().map(|r| r.on_delete).unwrap_or_default();
                let mut cascaded = Vec::new();
                for row in &table.rows {
                    let points_here = row
                        .get(&field.name)
                        .is_some_and(|v| !v.is_null() && fresh.contains(&key_text(v)));
                    if !points_here {
                        continue;
                    }
                    let row_key = source.key_of(row).map(key_text).unwrap_or_default();
                    match on_delete {
                        OnDeleteConfig::Protect => {
                            self.protected.push((source.name.clone(), row_key, source.display_name(row)))
                        }
                        OnDeleteConfig::Cascade => cascaded.push(row_key),
                        OnDeleteConfig::SetNull => {
                            self.nulled.push((source.name.clone(), row_key, field.name.clone()))
                        }
                    }
                }
                if !cascaded.is_empty() {
                    work.push((source.name.clone(), cascaded));
                }
            }
        }
        Ok(())
    }

    /// Protected rows that are not themselves going away.
    fn blockers(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        self.protected
            .iter()
            .filter(|(entity, key, _)| !self.is_doomed(entity, key))
            .filter(|(entity, key, _)| seen.insert((entity.clone(), key.clone())))
            .map(|(_, _, label)| label.clone())
            .collect()
    }
}

#[async_trait]
impl EntityStore for MemoryStore {
    async fn get(&self, entity: &EntityType, key: &Value) -> Result<Option<Record>, AppError> {
        let tables = self.read()?;
        let table = tables.get(&entity.name);
        Ok(find_index(table, entity, key).and_then(|i| table.map(|t| t.rows[i].clone())))
    }

    async fn filter(
        &self,
        entity: &EntityType,
        predicate: &Predicate,
        order: Option<&SortOrder>,
        page: Option<Page>,
    ) -> Result<Vec<Record>, AppError> {
        let mut rows: Vec<Record> = {
            let tables = self.read()?;
            tables
                .get(&entity.name)
                .map(|t| t.rows.iter().filter(|r| predicate.matches(r)).cloned().collect())
                .unwrap_or_default()
        };
        let (field, descending) = match order {
            Some(o) => (o.field.as_str(), o.descending),
            None => (entity.pk.as_str(), false),
        };
        rows.sort_by(|a, b| {
            let ord = cmp_nullable(a.get(field), b.get(field));
            if descending {
                ord.reverse()
            } else {
                ord
            }
        });
        Ok(match page {
            Some(p) => rows
                .into_iter()
                .skip(p.offset as usize)
                .take(p.limit as usize)
                .collect(),
            None => rows,
        })
    }

    async fn count(&self, entity: &EntityType, predicate: &Predicate) -> Result<u64, AppError> {
        let tables = self.read()?;
        Ok(tables
            .get(&entity.name)
            .map(|t| t.rows.iter().filter(|r| predicate.matches(r)).count() as u64)
            .unwrap_or(0))
    }

    async fn create(&self, entity: &EntityType, attrs: Record) -> Result<Record, AppError> {
        reject_unknown_keys(entity, &attrs)?;
        let mut tables = self.write()?;
        let mut table = tables.remove(&entity.name).unwrap_or_default();
        let mut row = Record::new();
        for field in entity.mutable_fields() {
            let value = match attrs.get(&field.name) {
                Some(v) if !(v.is_null() && field.primary_key) => v.clone(),
                _ => match initial_value(field, entity, &mut table) {
                    Ok(v) => v,
                    Err(e) => {
                        tables.insert(entity.name.clone(), table);
                        return Err(e);
                    }
                },
            };
            row.insert(field.name.clone(), value);
        }
        // explicit integer keys move the sequence past them
        if let Some(n) = row.get(&entity.pk).and_then(Value::as_i64) {
            table.next_id = table.next_id.max(n);
        }
        tables.insert(entity.name.clone(), table);
        check_row(&self.registry, &tables, entity, &row, None)?;
        if let Some(table) = tables.get_mut(&entity.name) {
            table.rows.push(row.clone());
        }
        Ok(row)
    }

    async fn save(&self, entity: &EntityType, record: Record) -> Result<Record, AppError> {
        reject_unknown_keys(entity, &record)?;
        let key = entity
            .key_of(&record)
            .cloned()
            .ok_or_else(|| AppError::Validation(format!("{} is required", entity.pk)))?;
        let mut tables = self.write()?;
        let index = find_index(tables.get(&entity.name), entity, &key)
            .ok_or_else(|| AppError::NotFound(format!("{} {}", entity.name, key_text(&key))))?;
        let mut row = tables
            .get(&entity.name)
            .map(|t| t.rows[index].clone())
            .unwrap_or_default();
        for (name, value) in record {
            if name != entity.pk {
                row.insert(name, value);
            }
        }
        check_row(&self.registry, &tables, entity, &row, Some(index))?;
        if let Some(table) = tables.get_mut(&entity.name) {
            table.rows[index] = row.clone();
        }
        Ok(row)
    }

    async fn delete(&self, entity: &EntityType, keys: &[Value]) -> Result<u64, AppError> {
        let mut tables = self.write()?;
        let present: Vec<String> = match tables.get(&entity.name) {
            Some(table) => table
                .rows
                .iter()
                .filter(|r| r.get(&entity.pk).is_some_and(|v| keys.iter().any(|k| loose_eq(v, k))))
                .filter_map(|r| entity.key_of(r).map(key_text))
                .collect(),
            None => Vec::new(),
        };
        if present.is_empty() {
            return Ok(0);
        }

        let mut collector = Collector::default();
        collector.collect(&self.registry, &tables, entity, present.clone())?;
        let blockers = collector.blockers();
        if !blockers.is_empty() {
            tracing::debug!(entity = %entity.name, blockers = blockers.len(), "delete refused");
            return Err(AppError::Protected { blockers });
        }

        for (name, doomed) in &collector.doomed {
            let described = self.registry.describe(name)?;
            if let Some(table) = tables.get_mut(name) {
                table
                    .rows
                    .retain(|r| !described.key_of(r).is_some_and(|k| doomed.contains(&key_text(k))));
            }
        }
        for (name, row_key, field) in &collector.nulled {
            if collector.is_doomed(name, row_key) {
                continue;
            }
            let described = self.registry.describe(name)?;
            if let Some(table) = tables.get_mut(name) {
                for row in table
                    .rows
                    .iter_mut()
                    .filter(|r| described.key_of(r).is_some_and(|k| key_text(k) == *row_key))
                {
                    row.insert(field.clone(), Value::Null);
                }
            }
        }
        // memberships pointing at removed rows disappear with them
        for source in self.registry.entities() {
            for field in source.fields.iter().filter(|f| f.is_many_to_many()) {
                let Some(doomed) = field.target().and_then(|t| collector.doomed.get(t)) else { continue };
                let Some(table) = tables.get_mut(&source.name) else { continue };
                for row in &mut table.rows {
                    if let Some(Value::Array(members)) = row.get_mut(&field.name) {
                        members.retain(|m| !doomed.contains(&key_text(m)));
                    }
                }
            }
        }
        tracing::debug!(entity = %entity.name, deleted = present.len(), "rows deleted");
        Ok(present.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::load_from_str;
    use serde_json::json;

    fn registry() -> Arc<SchemaRegistry> {
        Arc::new(
            load_from_str(
                r#"{ "entities": [
                { "name": "Customer", "namespace": "crm", "display_field": "name", "fields": [
                    { "name": "id", "type": "serial", "primary_key": true },
                    { "name": "name", "type": "varchar", "nullable": false },
                    { "name": "email", "type": "email", "unique": true }
                ] },
                { "name": "Tag", "namespace": "crm", "fields": [
                    { "name": "id", "type": "serial", "primary_key": true },
                    { "name": "label", "type": "varchar" }
                ] },
                { "name": "Order", "namespace": "sales", "fields": [
                    { "name": "id", "type": "serial", "primary_key": true },
                    { "name": "customer", "type": "fk", "relation": { "target": "Customer" } },
                    { "name": "tags", "type": "m2m", "relation": { "target": "Tag", "many": true } },
                    { "name": "status", "type": "varchar", "default": "new" }
                ] },
                { "name": "Note", "namespace": "crm", "fields": [
                    { "name": "id", "type": "serial", "primary_key": true },
                    { "name": "customer", "type": "fk",
                      "relation": { "target": "Customer", "on_delete": "cascade" } },
                    { "name": "order", "type": "fk",
                      "relation": { "target": "Order", "on_delete": "set_null" } }
                ] }
            ] }"#,
            )
            .unwrap(),
        )
    }

    fn attrs(v: Value) -> Record {
        v.as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn create_fills_keys_and_defaults() {
        let reg = registry();
        let store = MemoryStore::new(reg.clone());
        let order = reg.describe("Order").unwrap();
        let row = store.create(order, Record::new()).await.unwrap();
        assert_eq!(row["id"], json!(1));
        assert_eq!(row["status"], json!("new"));
        assert_eq!(row["tags"], json!([]));
        let row = store.create(order, Record::new()).await.unwrap();
        assert_eq!(row["id"], json!(2));
    }

    #[tokio::test]
    async fn create_checks_nullability_uniqueness_and_targets() {
        let reg = registry();
        let store = MemoryStore::new(reg.clone());
        let customer = reg.describe("Customer").unwrap();
        let order = reg.describe("Order").unwrap();
        assert!(matches!(
            store.create(customer, Record::new()).await,
            Err(AppError::Validation(_))
        ));
        store
            .create(customer, attrs(json!({ "name": "Ann", "email": "a@x.io" })))
            .await
            .unwrap();
        assert!(matches!(
            store.create(customer, attrs(json!({ "name": "Bo", "email": "a@x.io" }))).await,
            Err(AppError::Conflict(_))
        ));
        assert!(matches!(
            store.create(order, attrs(json!({ "customer": 99 }))).await,
            Err(AppError::RelatedNotFound { .. })
        ));
        assert!(matches!(
            store.create(order, attrs(json!({ "order_set": [] }))).await,
            Err(AppError::InvalidField { .. })
        ));
    }

    #[tokio::test]
    async fn protected_batch_deletes_nothing() {
        let reg = registry();
        let store = MemoryStore::new(reg.clone());
        let customer = reg.describe("Customer").unwrap();
        let order = reg.describe("Order").unwrap();
        store.create(customer, attrs(json!({ "name": "Ann" }))).await.unwrap();
        store.create(customer, attrs(json!({ "name": "Bo" }))).await.unwrap();
        store.create(order, attrs(json!({ "customer": 1 }))).await.unwrap();

        let err = store.delete(customer, &[json!(1), json!(2)]).await.unwrap_err();
        match err {
            AppError::Protected { blockers } => assert_eq!(blockers, vec!["Order (1)".to_string()]),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(store.count(customer, &Predicate::All).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn cascade_set_null_and_membership_cleanup() {
        let reg = registry();
        let store = MemoryStore::new(reg.clone());
        let customer = reg.describe("Customer").unwrap();
        let order = reg.describe("Order").unwrap();
        let note = reg.describe("Note").unwrap();
        let tag = reg.describe("Tag").unwrap();
        store.create(customer, attrs(json!({ "name": "Ann" }))).await.unwrap();
        store.create(tag, attrs(json!({ "label": "vip" }))).await.unwrap();
        store.create(order, attrs(json!({ "tags": [1] }))).await.unwrap();
        store.create(note, attrs(json!({ "customer": 1 }))).await.unwrap();
        store.create(note, attrs(json!({ "order": 1 }))).await.unwrap();

        assert_eq!(store.delete(customer, &[json!("1")]).await.unwrap(), 1);
        assert_eq!(store.count(note, &Predicate::All).await.unwrap(), 1);

        assert_eq!(store.delete(order, &[json!(1)]).await.unwrap(), 1);
        let remaining = store.get(note, &json!(2)).await.unwrap().unwrap();
        assert_eq!(remaining["order"], Value::Null);

        let order = store.create(order, attrs(json!({ "tags": [1] }))).await.unwrap();
        store.delete(tag, &[json!(1)]).await.unwrap();
        let reloaded = store.get(reg.describe("Order").unwrap(), &order["id"]).await.unwrap().unwrap();
        assert_eq!(reloaded["tags"], json!([]));
    }

    #[tokio::test]
    async fn filter_orders_and_pages() {
        let reg = registry();
        let store = MemoryStore::new(reg.clone());
        let customer = reg.describe("Customer").unwrap();
        for name in ["Cy", "Ann", "Bo"] {
            store.create(customer, attrs(json!({ "name": name }))).await.unwrap();
        }
        let rows = store
            .filter(customer, &Predicate::All, Some(&SortOrder::parse("-name")), Some(Page { offset: 1, limit: 1 }))
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["name"], json!("Bo"));
    }
}
