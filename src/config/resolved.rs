//! Resolved entity model: definitions validated and flattened for runtime use.

use crate::config::{OnDeleteConfig, ThroughConfig, ValidationRule};
use crate::error::AppError;
use crate::store::Record;
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};

/// Field names never exposed inside nested relation representations.
pub const CREDENTIAL_FIELDS: &[&str] = &["password", "secret", "secret_key", "token"];

/// Type category of a field.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    Text,
    Number,
    DateTime,
    Boolean,
    Relation,
    Identifier,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Cardinality {
    One,
    Many,
}

#[derive(Clone, Debug)]
pub struct RelationInfo {
    pub target: String,
    pub cardinality: Cardinality,
    /// Auto-created accessor on the target side of a forward relation.
    pub reverse: bool,
    /// For reverse relations: the forward field on `target` that points back.
    pub via_field: Option<String>,
    pub on_delete: OnDeleteConfig,
    pub through: Option<ThroughConfig>,
}

/// Primary key type for parsing path/body ids.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PkType {
    Uuid,
    BigInt,
    Int,
    Text,
}

#[derive(Clone, Debug)]
pub struct FieldDescriptor {
    pub name: String,
    pub type_name: String,
    pub kind: FieldKind,
    pub nullable: bool,
    pub blank: bool,
    pub unique: bool,
    pub primary_key: bool,
    pub default: Option<Value>,
    pub auto_generated: bool,
    pub max_length: Option<u32>,
    pub choices: Option<Vec<String>>,
    pub relation: Option<RelationInfo>,
    pub validation: Option<ValidationRule>,
    /// PostgreSQL type used to cast bound parameters (relations use the target key's type).
    pub pg_type: Option<String>,
}

impl FieldDescriptor {
    pub fn is_reverse(&self) -> bool {
        self.relation.as_ref().is_some_and(|r| r.reverse)
    }

    pub fn is_many(&self) -> bool {
        self.relation
            .as_ref()
            .is_some_and(|r| r.cardinality == Cardinality::Many)
    }

    /// Forward foreign key (stored on this entity's row).
    pub fn is_single_relation(&self) -> bool {
        self.relation
            .as_ref()
            .is_some_and(|r| !r.reverse && r.cardinality == Cardinality::One)
    }

    /// Forward many-to-many field.
    pub fn is_many_to_many(&self) -> bool {
        self.relation
            .as_ref()
            .is_some_and(|r| !r.reverse && r.cardinality == Cardinality::Many)
    }

    pub fn target(&self) -> Option<&str> {
        self.relation.as_ref().map(|r| r.target.as_str())
    }

    /// Required on input: non-nullable, non-blank, no default, not produced by the store.
    pub fn is_required(&self) -> bool {
        !self.nullable
            && !self.blank
            && self.default.is_none()
            && !self.auto_generated
            && !self.is_many()
    }

    /// Text and date/time fields take part in free-text search.
    pub fn is_searchable(&self) -> bool {
        matches!(self.kind, FieldKind::Text | FieldKind::DateTime)
    }
}

/// One entry of the read-only schema listing.
#[derive(Clone, Debug, Serialize)]
pub struct FieldSchema {
    pub name: String,
    #[serde(rename = "type")]
    pub type_name: String,
    pub kind: FieldKind,
    pub null: bool,
    pub blank: bool,
    pub unique: bool,
    pub primary_key: bool,
    pub related_model: Option<String>,
    pub reverse: bool,
    pub required: bool,
}

#[derive(Clone, Debug)]
pub struct EntityType {
    pub name: String,
    pub namespace: String,
    pub path_segment: String,
    pub table: String,
    pub db_schema: String,
    pub display_field: Option<String>,
    pub searchable: bool,
    /// Field names stripped from every response.
    pub sensitive_fields: HashSet<String>,
    pub pk: String,
    pub pk_type: PkType,
    pub fields: Vec<FieldDescriptor>,
}

impl EntityType {
    pub fn field(&self, name: &str) -> Option<&FieldDescriptor> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Field lookup that fails with `InvalidField` for unknown names.
    pub fn require_field(&self, name: &str) -> Result<&FieldDescriptor, AppError> {
        self.field(name).ok_or_else(|| AppError::InvalidField {
            entity: self.name.clone(),
            field: name.to_string(),
        })
    }

    /// Like [`require_field`](Self::require_field) but also rejects reverse relations.
    pub fn require_mutable_field(&self, name: &str) -> Result<&FieldDescriptor, AppError> {
        let field = self.require_field(name)?;
        if field.is_reverse() {
            return Err(AppError::InvalidField {
                entity: self.name.clone(),
                field: name.to_string(),
            });
        }
        Ok(field)
    }

    pub fn pk_field(&self) -> &FieldDescriptor {
        // the loader guarantees exactly one primary key
        self.fields
            .iter()
            .find(|f| f.primary_key)
            .unwrap_or(&self.fields[0])
    }

    pub fn mutable_fields(&self) -> impl Iterator<Item = &FieldDescriptor> {
        self.fields.iter().filter(|f| !f.is_reverse())
    }

    /// Fields stored on the entity's own row (no many-valued relations).
    pub fn column_fields(&self) -> impl Iterator<Item = &FieldDescriptor> {
        self.fields.iter().filter(|f| !f.is_many())
    }

    /// Text and date/time fields that may be matched by free-text search (sensitive ones excluded).
    pub fn searchable_fields(&self) -> Vec<&FieldDescriptor> {
        self.fields
            .iter()
            .filter(|f| f.is_searchable() && !self.is_sensitive(&f.name))
            .collect()
    }

    pub fn is_searchable(&self) -> bool {
        self.searchable && !self.searchable_fields().is_empty()
    }

    pub fn required_fields(&self) -> Vec<&FieldDescriptor> {
        self.mutable_fields().filter(|f| f.is_required()).collect()
    }

    pub fn is_sensitive(&self, name: &str) -> bool {
        self.sensitive_fields.contains(name)
    }

    /// Field subset used when this entity is nested inside another one.
    pub fn safe_fields(&self) -> impl Iterator<Item = &FieldDescriptor> {
        self.column_fields()
            .filter(|f| !self.is_sensitive(&f.name) && !CREDENTIAL_FIELDS.contains(&f.name.as_str()))
    }

    /// Parse a key taken from a URL path.
    pub fn parse_key(&self, raw: &str) -> Result<Value, AppError> {
        Ok(match self.pk_type {
            PkType::Uuid => {
                let u = uuid::Uuid::parse_str(raw).map_err(|_| AppError::BadRequest("invalid uuid".into()))?;
                Value::String(u.to_string())
            }
            PkType::BigInt | PkType::Int => {
                let n: i64 = raw.parse().map_err(|_| AppError::BadRequest("invalid id".into()))?;
                Value::Number(n.into())
            }
            PkType::Text => Value::String(raw.to_string()),
        })
    }

    /// Normalize a key taken from a JSON body or a CSV cell (`"7"` → `7` for integer keys).
    pub fn normalize_key(&self, key: &Value) -> Result<Value, AppError> {
        match key {
            Value::String(s) => self.parse_key(s.trim()),
            Value::Number(n) if matches!(self.pk_type, PkType::BigInt | PkType::Int) => n
                .as_i64()
                .map(|i| Value::Number(i.into()))
                .ok_or_else(|| AppError::BadRequest(format!("invalid id: {}", n))),
            Value::Number(n) if self.pk_type == PkType::Text => Ok(Value::String(n.to_string())),
            other => Err(AppError::BadRequest(format!("invalid id: {}", other))),
        }
    }

    pub fn key_of<'r>(&self, record: &'r Record) -> Option<&'r Value> {
        record.get(&self.pk).filter(|v| !v.is_null())
    }

    /// Human-readable label: the display field when set, else `Entity (key)`.
    pub fn display_name(&self, record: &Record) -> String {
        if let Some(text) = self
            .display_field
            .as_ref()
            .and_then(|f| record.get(f))
            .and_then(|v| v.as_str())
        {
            return text.to_string();
        }
        let key = self.key_of(record).map(key_text).unwrap_or_default();
        format!("{} ({})", self.name, key)
    }

    /// Read-only listing, reverse relations included and tagged.
    pub fn schema_listing(&self) -> Vec<FieldSchema> {
        self.fields
            .iter()
            .map(|f| FieldSchema {
                name: f.name.clone(),
                type_name: f.type_name.clone(),
                kind: f.kind,
                null: f.nullable,
                blank: f.blank,
                unique: f.unique,
                primary_key: f.primary_key,
                related_model: f.target().map(String::from),
                reverse: f.is_reverse(),
                required: !f.is_reverse() && f.is_required(),
            })
            .collect()
    }

    /// JSON-schema-like description attached to single-entity responses.
    pub fn json_schema(&self) -> Value {
        let mut properties = serde_json::Map::new();
        let mut required = Vec::new();
        for f in self.mutable_fields().filter(|f| !self.is_sensitive(&f.name)) {
            if f.is_required() && !f.primary_key {
                required.push(Value::String(f.name.clone()));
            }
            let type_name = if f.primary_key { "string" } else { f.type_name.as_str() };
            properties.insert(
                f.name.clone(),
                serde_json::json!({
                    "title": title_case(&f.name),
                    "type": type_name,
                    "kind": f.kind,
                    "nullable": f.nullable,
                    "blank": f.blank,
                }),
            );
        }
        serde_json::json!({
            "title": format!("{} schema", self.name),
            "description": format!("Schema for {}", self.name),
            "type": "object",
            "properties": properties,
            "required": required,
        })
    }
}

/// Textual form of a key or cell value: strings unquoted, null empty.
pub fn key_text(v: &Value) -> String {
    match v {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn title_case(name: &str) -> String {
    name.split('_')
        .filter(|w| !w.is_empty())
        .map(|w| {
            let mut chars = w.chars();
            match chars.next() {
                Some(c) => c.to_uppercase().chain(chars).collect::<String>(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Process-wide, read-only registry of entity types.
#[derive(Clone, Debug, Default)]
pub struct SchemaRegistry {
    entities: Vec<EntityType>,
    by_name: HashMap<String, usize>,
    by_path: HashMap<String, usize>,
}

impl SchemaRegistry {
    pub(crate) fn from_entities(entities: Vec<EntityType>) -> Self {
        let by_name = entities
            .iter()
            .enumerate()
            .map(|(i, e)| (e.name.clone(), i))
            .collect();
        let by_path = entities
            .iter()
            .enumerate()
            .map(|(i, e)| (e.path_segment.clone(), i))
            .collect();
        SchemaRegistry {
            entities,
            by_name,
            by_path,
        }
    }

    pub fn describe(&self, name: &str) -> Result<&EntityType, AppError> {
        self.by_name
            .get(name)
            .map(|&i| &self.entities[i])
            .ok_or_else(|| AppError::UnknownEntity(name.to_string()))
    }

    pub fn describe_by_path(&self, path: &str) -> Result<&EntityType, AppError> {
        self.by_path
            .get(path)
            .map(|&i| &self.entities[i])
            .ok_or_else(|| AppError::UnknownEntity(path.to_string()))
    }

    pub fn entities(&self) -> &[EntityType] {
        &self.entities
    }

    /// Entity types exposing at least one text or date/time field.
    pub fn list_searchable(&self) -> Vec<&EntityType> {
        self.entities.iter().filter(|e| e.is_searchable()).collect()
    }

    /// Namespace → entity types, ordered by namespace.
    pub fn namespaces(&self) -> BTreeMap<&str, Vec<&EntityType>> {
        let mut out: BTreeMap<&str, Vec<&EntityType>> = BTreeMap::new();
        for e in &self.entities {
            out.entry(e.namespace.as_str()).or_default().push(e);
        }
        out
    }

    /// Forward relations (on any entity) that target `name`: (source entity, field).
    pub fn referencing(&self, name: &str) -> Vec<(&EntityType, &FieldDescriptor)> {
        self.entities
            .iter()
            .flat_map(|e| e.fields.iter().map(move |f| (e, f)))
            .filter(|(_, f)| f.target() == Some(name) && !f.is_reverse())
            .collect()
    }
}
