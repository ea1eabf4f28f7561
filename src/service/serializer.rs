//! Generic serialization: store records to their transport representation (relations
//! expanded one level) and validated payloads back to store attributes.

use crate::config::{key_text, EntityType, FieldDescriptor, FieldKind, PkType, SchemaRegistry};
use crate::error::AppError;
use crate::identity::Identity;
use crate::query::Predicate;
use crate::service::RequestValidator;
use crate::store::{EntityStore, Record};
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;

/// Keys added by [`Serializer::represent_many`] that are not fields.
const REPRESENTATION_ONLY: &[&str] = &["display_name", "module"];

pub const CREATED_BY: &str = "created_by";
pub const UPDATED_BY: &str = "updated_by";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WriteMode {
    Create,
    Update,
}

type ResolveFuture<'a> = Pin<Box<dyn Future<Output = Result<Record, AppError>> + Send + 'a>>;

/// Embedded many-to-many payload waiting for the rest of the write to validate.
struct PendingCreate<'a> {
    field: String,
    slot: usize,
    target: &'a EntityType,
    attrs: Record,
}

pub struct Serializer;

impl Serializer {
    pub async fn to_representation(
        registry: &SchemaRegistry,
        store: &dyn EntityStore,
        entity: &EntityType,
        record: &Record,
    ) -> Result<Value, AppError> {
        let mut out = Self::represent_many(registry, store, entity, std::slice::from_ref(record)).await?;
        Ok(out.pop().unwrap_or(Value::Null))
    }

    /// Representation of many records with one lookup per relation field.
    pub async fn represent_many(
        registry: &SchemaRegistry,
        store: &dyn EntityStore,
        entity: &EntityType,
        records: &[Record],
    ) -> Result<Vec<Value>, AppError> {
        let mut nested: HashMap<&str, HashMap<String, Value>> = HashMap::new();
        for field in entity
            .mutable_fields()
            .filter(|f| f.relation.is_some() && !entity.is_sensitive(&f.name))
        {
            let Some(target) = field.target() else { continue };
            let target = registry.describe(target)?;
            let mut seen = HashSet::new();
            let keys: Vec<Value> = records
                .iter()
                .flat_map(|r| match r.get(&field.name) {
                    Some(Value::Array(items)) => items.clone(),
                    Some(v) if !v.is_null() => vec![v.clone()],
                    _ => Vec::new(),
                })
                .filter(|k| seen.insert(key_text(k)))
                .collect();
            let rows = if keys.is_empty() {
                Vec::new()
            } else {
                store
                    .filter(target, &Predicate::key_in(target.pk.clone(), keys), None, None)
                    .await?
            };
            let by_key = rows
                .iter()
                .filter_map(|row| target.key_of(row).map(|k| (key_text(k), nested_representation(target, row))))
                .collect();
            nested.insert(field.name.as_str(), by_key);
        }

        Ok(records
            .iter()
            .map(|record| {
                let mut out = serde_json::Map::new();
                for field in entity.mutable_fields().filter(|f| !entity.is_sensitive(&f.name)) {
                    let value = record.get(&field.name).cloned().unwrap_or(Value::Null);
                    let value = match nested.get(field.name.as_str()) {
                        Some(by_key) => match value {
                            Value::Array(items) => Value::Array(
                                items.iter().filter_map(|k| by_key.get(&key_text(k)).cloned()).collect(),
                            ),
                            Value::Null => Value::Null,
                            key => by_key.get(&key_text(&key)).cloned().unwrap_or(Value::Null),
                        },
                        None => value,
                    };
                    out.insert(field.name.clone(), value);
                }
                out.insert("display_name".into(), Value::String(entity.display_name(record)));
                out.insert("module".into(), Value::String(entity.name.clone()));
                Value::Object(out)
            })
            .collect())
    }

    /// Validate `payload` against `entity` and resolve its relations into store attributes.
    ///
    /// Embedded many-to-many objects without an existing key are created, but only once
    /// every other field of the payload has validated.
    pub fn from_representation<'a>(
        registry: &'a SchemaRegistry,
        store: &'a dyn EntityStore,
        entity: &'a EntityType,
        payload: &'a Value,
        identity: &'a Identity,
        mode: WriteMode,
    ) -> ResolveFuture<'a> {
        Box::pin(async move {
            let obj = payload
                .as_object()
                .ok_or_else(|| AppError::BadRequest(format!("{} payload must be a JSON object", entity.name)))?;
            let mut record = Record::new();
            let mut members: Vec<(String, Vec<Option<Value>>)> = Vec::new();
            let mut pending: Vec<PendingCreate<'a>> = Vec::new();

            for (name, value) in obj {
                let field = entity.require_mutable_field(name)?;
                if field.primary_key && mode == WriteMode::Update {
                    return Err(AppError::Validation(format!("{} cannot be changed", field.name)));
                }
                if value.is_null() {
                    if field.is_many() {
                        return Err(AppError::Validation(format!("{} expects a list", field.name)));
                    }
                    if !field.nullable && !field.auto_generated {
                        return Err(AppError::Validation(format!("{} may not be null", field.name)));
                    }
                    record.insert(name.clone(), Value::Null);
                    continue;
                }
                if field.is_single_relation() {
                    let target = registry.describe(field.target().unwrap_or_default())?;
                    let raw = match value {
                        Value::Object(o) => o.get(&target.pk).cloned().unwrap_or(Value::Null),
                        v => v.clone(),
                    };
                    let key = Self::existing_key(store, target, field, &raw).await?;
                    record.insert(name.clone(), key);
                } else if field.is_many_to_many() {
                    let target = registry.describe(field.target().unwrap_or_default())?;
                    let Value::Array(items) = value else {
                        return Err(AppError::Validation(format!("{} expects a list", field.name)));
                    };
                    let mut slots = Vec::with_capacity(items.len());
                    for item in items {
                        let Value::Object(o) = item else {
                            slots.push(Some(Self::existing_key(store, target, field, item).await?));
                            continue;
                        };
                        if let Some(key) = Self::reference_key(store, target, o).await? {
                            slots.push(Some(key));
                            continue;
                        }
                        let mut attrs = o.clone();
                        attrs.retain(|k, _| !REPRESENTATION_ONLY.contains(&k.as_str()) || target.field(k).is_some());
                        let attrs = Value::Object(attrs);
                        let resolved =
                            Self::from_representation(registry, store, target, &attrs, identity, WriteMode::Create)
                                .await?;
                        pending.push(PendingCreate {
                            field: name.clone(),
                            slot: slots.len(),
                            target,
                            attrs: resolved,
                        });
                        slots.push(None);
                    }
                    members.push((name.clone(), slots));
                } else {
                    record.insert(name.clone(), coerce_scalar(field, value)?);
                }
            }

            stamp_attribution(registry, entity, identity, mode, &mut record);
            match mode {
                WriteMode::Create => {
                    let missing: Vec<&str> = entity
                        .required_fields()
                        .into_iter()
                        .filter(|f| !record.contains_key(&f.name))
                        .map(|f| f.name.as_str())
                        .collect();
                    if !missing.is_empty() {
                        return Err(AppError::Validation(format!("{} is required", missing.join(", "))));
                    }
                    RequestValidator::validate(entity, &record)?;
                }
                WriteMode::Update => RequestValidator::validate_partial(entity, &record)?,
            }

            for create in pending {
                let created = store.create(create.target, create.attrs).await?;
                let key = create.target.key_of(&created).cloned();
                if let Some((_, slots)) = members.iter_mut().find(|(f, _)| *f == create.field) {
                    slots[create.slot] = key;
                }
            }
            for (name, slots) in members {
                record.insert(name, Value::Array(slots.into_iter().flatten().collect()));
            }
            Ok(record)
        })
    }

    /// Resolve a payload and insert it.
    pub async fn create(
        registry: &SchemaRegistry,
        store: &dyn EntityStore,
        entity: &EntityType,
        payload: &Value,
        identity: &Identity,
    ) -> Result<Record, AppError> {
        let attrs = Self::from_representation(registry, store, entity, payload, identity, WriteMode::Create).await?;
        store.create(entity, attrs).await
    }

    /// Resolve a partial payload and apply it to the row at `key`.
    pub async fn update(
        registry: &SchemaRegistry,
        store: &dyn EntityStore,
        entity: &EntityType,
        key: &Value,
        payload: &Value,
        identity: &Identity,
    ) -> Result<Record, AppError> {
        let existing = store
            .get(entity, key)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("{} {}", entity.name, key_text(key))))?;
        let stored_key = entity.key_of(&existing).cloned().unwrap_or_else(|| key.clone());
        let payload = without_matching_key(entity, &stored_key, payload)?;
        let mut attrs =
            Self::from_representation(registry, store, entity, &payload, identity, WriteMode::Update).await?;
        attrs.insert(entity.pk.clone(), stored_key);
        store.save(entity, attrs).await
    }

    /// Key of an existing `target` row, or `RelatedNotFound`.
    async fn existing_key(
        store: &dyn EntityStore,
        target: &EntityType,
        field: &FieldDescriptor,
        raw: &Value,
    ) -> Result<Value, AppError> {
        let not_found = || AppError::RelatedNotFound {
            entity: target.name.clone(),
            field: field.name.clone(),
            key: key_text(raw),
        };
        let key = target.normalize_key(raw).map_err(|_| not_found())?;
        match store.get(target, &key).await? {
            Some(row) => Ok(target.key_of(&row).cloned().unwrap_or(key)),
            None => Err(not_found()),
        }
    }

    /// An embedded object that names an existing row is a reference, not a creation.
    async fn reference_key(
        store: &dyn EntityStore,
        target: &EntityType,
        obj: &serde_json::Map<String, Value>,
    ) -> Result<Option<Value>, AppError> {
        let Some(raw) = obj.get(&target.pk).filter(|v| !v.is_null()) else {
            return Ok(None);
        };
        let Ok(key) = target.normalize_key(raw) else {
            return Ok(None);
        };
        Ok(store
            .get(target, &key)
            .await?
            .and_then(|row| target.key_of(&row).cloned()))
    }
}

fn nested_representation(target: &EntityType, row: &Record) -> Value {
    let mut out = serde_json::Map::new();
    for field in target.safe_fields() {
        out.insert(field.name.clone(), row.get(&field.name).cloned().unwrap_or(Value::Null));
    }
    out.insert("display_name".into(), Value::String(target.display_name(row)));
    out.insert("module".into(), Value::String(target.name.clone()));
    Value::Object(out)
}

/// A full-object PUT may echo the key; anything else is an attempt to change it.
fn without_matching_key(entity: &EntityType, key: &Value, payload: &Value) -> Result<Value, AppError> {
    let Some(obj) = payload.as_object() else {
        return Err(AppError::BadRequest(format!("{} payload must be a JSON object", entity.name)));
    };
    let mut obj = obj.clone();
    if let Some(sent) = obj.remove(&entity.pk) {
        if !sent.is_null() && !crate::query::loose_eq(&sent, key) {
            return Err(AppError::Validation(format!("{} cannot be changed", entity.pk)));
        }
    }
    Ok(Value::Object(obj))
}

fn stamp_attribution(
    registry: &SchemaRegistry,
    entity: &EntityType,
    identity: &Identity,
    mode: WriteMode,
    record: &mut Record,
) {
    let Some(principal) = identity.principal.as_deref() else { return };
    let stamps: &[&str] = match mode {
        WriteMode::Create => &[CREATED_BY, UPDATED_BY],
        WriteMode::Update => &[UPDATED_BY],
    };
    for name in stamps {
        let Some(field) = entity.field(name).filter(|f| !f.is_reverse() && !f.is_many()) else { continue };
        let raw = Value::String(principal.to_string());
        let value = field
            .target()
            .and_then(|t| registry.describe(t).ok())
            .and_then(|t| t.normalize_key(&raw).ok())
            .unwrap_or(raw);
        record.insert(field.name.clone(), value);
    }
}

/// Type-check and normalize one scalar payload value for `field`.
pub fn coerce_scalar(field: &FieldDescriptor, value: &Value) -> Result<Value, AppError> {
    let invalid = |expected: &str| AppError::Validation(format!("{}: expected {}, got {}", field.name, expected, value));
    let out = match field.kind {
        FieldKind::Text => match value {
            Value::String(s) if s.is_empty() && !field.blank => {
                return Err(AppError::Validation(format!("{} may not be blank", field.name)))
            }
            Value::String(_) => value.clone(),
            Value::Number(_) | Value::Bool(_) => Value::String(key_text(value)),
            _ => return Err(invalid("text")),
        },
        FieldKind::Number => match value {
            Value::Number(_) => value.clone(),
            Value::String(s) => parse_number(s).ok_or_else(|| invalid("a number"))?,
            _ => return Err(invalid("a number")),
        },
        FieldKind::Boolean => match value {
            Value::Bool(_) => value.clone(),
            Value::String(s) => match s.trim().to_lowercase().as_str() {
                "true" | "1" | "yes" => Value::Bool(true),
                "false" | "0" | "no" => Value::Bool(false),
                _ => return Err(invalid("a boolean")),
            },
            Value::Number(n) => match n.as_i64() {
                Some(1) => Value::Bool(true),
                Some(0) => Value::Bool(false),
                _ => return Err(invalid("a boolean")),
            },
            _ => return Err(invalid("a boolean")),
        },
        FieldKind::DateTime => match value {
            Value::String(s) => normalize_temporal(field, s.trim()).ok_or_else(|| invalid("a date/time"))?,
            _ => return Err(invalid("a date/time")),
        },
        FieldKind::Identifier => match value {
            Value::String(s) if field.type_name.to_lowercase().contains("uuid") => uuid::Uuid::parse_str(s.trim())
                .map(|u| Value::String(u.to_string()))
                .map_err(|_| invalid("a uuid"))?,
            Value::String(s) if field.primary_key && PkType::Text != pk_type_of(field) => {
                parse_number(s).ok_or_else(|| invalid("an integer"))?
            }
            Value::String(_) | Value::Number(_) => value.clone(),
            _ => return Err(invalid("an identifier")),
        },
        FieldKind::Relation => value.clone(),
    };
    RequestValidator::validate_field(field, &out)?;
    Ok(out)
}

fn pk_type_of(field: &FieldDescriptor) -> PkType {
    let lower = field.type_name.to_lowercase();
    if lower.contains("uuid") {
        PkType::Uuid
    } else if lower.contains("serial") || lower.contains("int") || lower.contains("auto") {
        PkType::Int
    } else {
        PkType::Text
    }
}

fn parse_number(s: &str) -> Option<Value> {
    let s = s.trim();
    if let Ok(i) = s.parse::<i64>() {
        return Some(Value::Number(i.into()));
    }
    s.parse::<f64>().ok().and_then(serde_json::Number::from_f64).map(Value::Number)
}

const NAIVE_FORMATS: &[&str] = &["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M"];

/// Accept RFC 3339, `YYYY-MM-DD HH:MM:SS` or `YYYY-MM-DD` and normalize per column type.
fn normalize_temporal(field: &FieldDescriptor, s: &str) -> Option<Value> {
    let parsed_naive = || {
        DateTime::parse_from_rfc3339(s)
            .map(|d| d.naive_utc())
            .ok()
            .or_else(|| NAIVE_FORMATS.iter().find_map(|f| NaiveDateTime::parse_from_str(s, f).ok()))
            .or_else(|| {
                NaiveDate::parse_from_str(s, "%Y-%m-%d")
                    .ok()
                    .and_then(|d| d.and_hms_opt(0, 0, 0))
            })
    };
    let text = match field.pg_type.as_deref() {
        Some("date") => parsed_naive()?.date().format("%Y-%m-%d").to_string(),
        Some("time") => NaiveTime::parse_from_str(s, "%H:%M:%S")
            .or_else(|_| NaiveTime::parse_from_str(s, "%H:%M"))
            .ok()?
            .format("%H:%M:%S")
            .to_string(),
        _ => match DateTime::parse_from_rfc3339(s) {
            Ok(d) => d.with_timezone(&chrono::Utc).to_rfc3339(),
            Err(_) => parsed_naive()?.and_utc().to_rfc3339(),
        },
    };
    Some(Value::String(text))
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
                { "name": "User", "namespace": "auth", "display_field": "username",
                  "sensitive_fields": ["api_key"], "fields": [
                    { "name": "id", "type": "serial", "primary_key": true },
                    { "name": "username", "type": "varchar", "nullable": false },
                    { "name": "password", "type": "varchar" },
                    { "name": "api_key", "type": "varchar" }
                ] },
                { "name": "Tag", "namespace": "crm", "display_field": "label", "fields": [
                    { "name": "id", "type": "serial", "primary_key": true },
                    { "name": "label", "type": "varchar", "nullable": false }
                ] },
                { "name": "Ticket", "namespace": "crm", "fields": [
                    { "name": "id", "type": "serial", "primary_key": true },
                    { "name": "title", "type": "varchar", "nullable": false },
                    { "name": "opened", "type": "date" },
                    { "name": "owner", "type": "fk", "relation": { "target": "User" } },
                    { "name": "tags", "type": "m2m", "relation": { "target": "Tag", "many": true } },
                    { "name": "created_by", "type": "varchar" },
                    { "name": "updated_by", "type": "varchar" }
                ] }
            ] }"#,
            )
            .unwrap(),
        )
    }

    #[tokio::test]
    async fn nested_relations_hide_credentials_and_sensitive_fields() {
        let reg = registry();
        let store = MemoryStore::new(reg.clone());
        let user = reg.describe("User").unwrap();
        let ticket = reg.describe("Ticket").unwrap();
        let anon = Identity::anonymous();
        Serializer::create(&reg, &store, user, &json!({ "username": "ann", "password": "x", "api_key": "k" }), &anon)
            .await
            .unwrap();
        let row = Serializer::create(&reg, &store, ticket, &json!({ "title": "Broken", "owner": "1" }), &anon)
            .await
            .unwrap();
        let out = Serializer::to_representation(&reg, &store, ticket, &row).await.unwrap();
        assert_eq!(out["owner"], json!({ "id": 1, "username": "ann", "display_name": "ann", "module": "User" }));
        assert_eq!(out["display_name"], json!("Ticket (1)"));
        assert_eq!(out["module"], json!("Ticket"));
    }

    #[tokio::test]
    async fn membership_survives_a_round_trip() {
        let reg = registry();
        let store = MemoryStore::new(reg.clone());
        let tag = reg.describe("Tag").unwrap();
        let ticket = reg.describe("Ticket").unwrap();
        let anon = Identity::anonymous();
        Serializer::create(&reg, &store, tag, &json!({ "label": "urgent" }), &anon).await.unwrap();
        let row = Serializer::create(
            &reg,
            &store,
            ticket,
            &json!({ "title": "T", "tags": [1, { "label": "new-tag" }] }),
            &anon,
        )
        .await
        .unwrap();
        assert_eq!(row["tags"], json!([1, 2]));

        let out = Serializer::to_representation(&reg, &store, ticket, &row).await.unwrap();
        let mut payload = out.as_object().cloned().unwrap();
        payload.retain(|k, _| k == "tags");
        let attrs = Serializer::from_representation(&reg, &store, ticket, &Value::Object(payload), &anon, WriteMode::Update)
            .await
            .unwrap();
        assert_eq!(attrs["tags"], row["tags"]);
        assert_eq!(store.count(tag, &Predicate::All).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn unresolved_keys_fail_without_side_effects() {
        let reg = registry();
        let store = MemoryStore::new(reg.clone());
        let tag = reg.describe("Tag").unwrap();
        let ticket = reg.describe("Ticket").unwrap();
        let anon = Identity::anonymous();
        let err = Serializer::create(&reg, &store, ticket, &json!({ "title": "T", "tags": [{ "label": "a" }, 9] }), &anon)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::RelatedNotFound { ref field, .. } if field == "tags"));
        assert_eq!(store.count(tag, &Predicate::All).await.unwrap(), 0);

        let err = Serializer::create(&reg, &store, ticket, &json!({ "title": "T", "owner": 5 }), &anon)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::RelatedNotFound { .. }));
    }

    #[tokio::test]
    async fn create_requires_fields_and_stamps_attribution() {
        let reg = registry();
        let store = MemoryStore::new(reg.clone());
        let ticket = reg.describe("Ticket").unwrap();
        let who = Identity::user("alice");
        assert!(matches!(
            Serializer::create(&reg, &store, ticket, &json!({ "opened": "2024-03-01" }), &who).await,
            Err(AppError::Validation(_))
        ));
        let row = Serializer::create(&reg, &store, ticket, &json!({ "title": "T", "opened": "2024-03-01T10:00:00Z" }), &who)
            .await
            .unwrap();
        assert_eq!(row["opened"], json!("2024-03-01"));
        assert_eq!(row["created_by"], json!("alice"));
        assert_eq!(row["updated_by"], json!("alice"));

        let bob = Identity::user("bob");
        let key = row["id"].clone();
        let row = Serializer::update(&reg, &store, ticket, &key, &json!({ "id": 1, "title": "T2" }), &bob)
            .await
            .unwrap();
        assert_eq!(row["created_by"], json!("alice"));
        assert_eq!(row["updated_by"], json!("bob"));
        assert!(matches!(
            Serializer::update(&reg, &store, ticket, &key, &json!({ "id": 2 }), &bob).await,
            Err(AppError::Validation(_))
        ));
        assert!(matches!(
            Serializer::update(&reg, &store, ticket, &key, &json!({ "user_set": [] }), &bob).await,
            Err(AppError::InvalidField { .. })
        ));
    }

    #[tokio::test]
    async fn required_attribution_is_satisfied_by_the_caller() {
        let reg = Arc::new(
            load_from_str(
                r#"{ "entities": [ { "name": "Note", "namespace": "crm", "fields": [
                    { "name": "id", "type": "serial", "primary_key": true },
                    { "name": "body", "type": "varchar" },
                    { "name": "created_by", "type": "varchar", "nullable": false }
                ] } ] }"#,
            )
            .unwrap(),
        );
        let store = MemoryStore::new(reg.clone());
        let note = reg.describe("Note").unwrap();
        let row = Serializer::create(&reg, &store, note, &json!({ "body": "hi" }), &Identity::user("alice"))
            .await
            .unwrap();
        assert_eq!(row["created_by"], json!("alice"));
        match Serializer::create(&reg, &store, note, &json!({ "body": "hi" }), &Identity::anonymous()).await {
            Err(AppError::Validation(msg)) => assert_eq!(msg, "created_by is required"),
            other => panic!("expected validation error, got {:?}", other),
        }
    }
}
