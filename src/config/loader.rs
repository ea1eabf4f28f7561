//! Load entity definitions from JSON and resolve them into the schema registry.

use crate::config::resolved::{Cardinality, EntityType, FieldDescriptor, FieldKind, PkType, RelationInfo, SchemaRegistry};
use crate::config::types::*;
use crate::config::validate;
use crate::error::ConfigError;
use std::collections::{HashMap, HashSet};
use std::path::Path;

/// Build the registry from the full definition document (validates first).
pub fn resolve(config: &FullConfig) -> Result<SchemaRegistry, ConfigError> {
    validate(config)?;

    let mut entities: Vec<EntityType> = Vec::with_capacity(config.entities.len());
    for e in &config.entities {
        let lower = e.name.to_lowercase();
        let table = e.table.clone().unwrap_or_else(|| lower.clone());
        let mut fields = Vec::with_capacity(e.fields.len());
        for f in &e.fields {
            fields.push(resolve_field(&e.name, &table, f)?);
        }
        let pk_field = fields
            .iter()
            .find(|f| f.primary_key)
            .ok_or_else(|| ConfigError::InvalidPrimaryKey {
                entity: e.name.clone(),
                reason: "no primary key field".into(),
            })?;
        let pk = pk_field.name.clone();
        let pk_type = infer_pk_type(&pk_field.type_name);
        entities.push(EntityType {
            name: e.name.clone(),
            namespace: e.namespace.clone(),
            path_segment: e.path_segment.clone().unwrap_or(lower),
            table,
            db_schema: e.db_schema.clone().unwrap_or_else(|| "public".into()),
            display_field: e.display_field.clone(),
            searchable: e.searchable,
            sensitive_fields: e.sensitive_fields.iter().cloned().collect(),
            pk,
            pk_type,
            fields,
        });
    }

    // foreign keys bind with the type of the key they point at
    let key_types: HashMap<String, Option<String>> = entities
        .iter()
        .map(|e| (e.name.clone(), e.pk_field().pg_type.clone()))
        .collect();
    for entity in &mut entities {
        for field in entity.fields.iter_mut().filter(|f| f.relation.is_some()) {
            field.pg_type = field.target().and_then(|t| key_types.get(t)).cloned().flatten();
        }
    }

    let reverse = build_reverse_fields(config);
    for entity in &mut entities {
        let Some(extra) = reverse.get(entity.name.as_str()) else { continue };
        let mut names: HashSet<String> = entity.fields.iter().map(|f| f.name.clone()).collect();
        for field in extra {
            if !names.insert(field.name.clone()) {
                return Err(ConfigError::Duplicate {
                    kind: "reverse relation",
                    name: format!("{}.{}", entity.name, field.name),
                });
            }
            entity.fields.push(field.clone());
        }
    }

    tracing::debug!(entities = entities.len(), "schema registry resolved");
    Ok(SchemaRegistry::from_entities(entities))
}

/// Parse and resolve a JSON definition document.
pub fn load_from_str(json: &str) -> Result<SchemaRegistry, ConfigError> {
    let config: FullConfig = serde_json::from_str(json).map_err(|e| ConfigError::Load(e.to_string()))?;
    resolve(&config)
}

/// Read, parse and resolve a JSON definition file.
pub async fn load_from_path(path: impl AsRef<Path>) -> Result<SchemaRegistry, ConfigError> {
    let path = path.as_ref();
    let raw = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| ConfigError::Load(format!("{}: {}", path.display(), e)))?;
    load_from_str(&raw)
}

fn resolve_field(entity: &str, table: &str, f: &FieldConfig) -> Result<FieldDescriptor, ConfigError> {
    let inferred = infer_kind(&f.type_);
    let kind = match (&f.relation, inferred) {
        (Some(_), _) => FieldKind::Relation,
        (None, FieldKind::Relation) => {
            return Err(ConfigError::Validation(format!(
                "{}.{}: relation type '{}' without relation target",
                entity, f.name, f.type_
            )))
        }
        (None, k) => k,
    };
    let lower = f.type_.to_lowercase();
    let auto_generated = f.auto
        || lower.contains("serial")
        || lower.contains("autofield")
        || (f.primary_key && lower.contains("uuid"));
    let relation = f.relation.as_ref().map(|r| RelationInfo {
        target: r.target.clone(),
        cardinality: if r.many { Cardinality::Many } else { Cardinality::One },
        reverse: false,
        via_field: None,
        on_delete: r.on_delete,
        through: if r.many {
            Some(r.through.clone().unwrap_or_else(|| ThroughConfig {
                table: format!("{}_{}", table, f.name),
                source_column: "source_id".into(),
                target_column: "target_id".into(),
            }))
        } else {
            None
        },
    });
    Ok(FieldDescriptor {
        name: f.name.clone(),
        type_name: f.type_.clone(),
        kind,
        // primary keys and many-valued relations are never null on input
        nullable: f.nullable && !f.primary_key,
        blank: f.blank,
        unique: f.unique || f.primary_key,
        primary_key: f.primary_key,
        default: f.default.clone(),
        auto_generated,
        max_length: f.max_length,
        choices: f.choices.clone(),
        relation,
        validation: f.validation.clone(),
        pg_type: column_pg_type_name(&f.type_),
    })
}

fn build_reverse_fields(config: &FullConfig) -> HashMap<&str, Vec<FieldDescriptor>> {
    let mut out: HashMap<&str, Vec<FieldDescriptor>> = HashMap::new();
    for e in &config.entities {
        let table = e.table.clone().unwrap_or_else(|| e.name.to_lowercase());
        for f in &e.fields {
            let Some(rel) = &f.relation else { continue };
            let name = rel
                .related_name
                .clone()
                .unwrap_or_else(|| format!("{}_set", e.name.to_lowercase()));
            out.entry(rel.target.as_str()).or_default().push(FieldDescriptor {
                name,
                type_name: if rel.many { "many_to_many_rel".into() } else { "many_to_one_rel".into() },
                kind: FieldKind::Relation,
                nullable: true,
                blank: true,
                unique: false,
                primary_key: false,
                default: None,
                auto_generated: true,
                max_length: None,
                choices: None,
                relation: Some(RelationInfo {
                    target: e.name.clone(),
                    cardinality: Cardinality::Many,
                    reverse: true,
                    via_field: Some(f.name.clone()),
                    on_delete: rel.on_delete,
                    through: rel.many.then(|| {
                        rel.through.clone().unwrap_or_else(|| ThroughConfig {
                            table: format!("{}_{}", table, f.name),
                            source_column: "source_id".into(),
                            target_column: "target_id".into(),
                        })
                    }),
                }),
                validation: None,
                pg_type: None,
            });
        }
    }
    out
}

/// Map a raw type name onto its category.
pub fn infer_kind(type_name: &str) -> FieldKind {
    let lower = type_name.to_lowercase();
    match lower.as_str() {
        "fk" | "foreign_key" | "foreignkey" | "one_to_one" | "onetoone" | "m2m" | "many_to_many" | "manytomany"
        | "relation" => return FieldKind::Relation,
        _ => {}
    }
    if lower.contains("uuid") || lower.contains("serial") || lower.contains("autofield") {
        FieldKind::Identifier
    } else if lower.starts_with("bool") {
        FieldKind::Boolean
    } else if lower.contains("int")
        || lower.starts_with("numeric")
        || lower.starts_with("decimal")
        || lower.starts_with("float")
        || lower.starts_with("double")
        || lower == "real"
        || lower == "money"
    {
        FieldKind::Number
    } else if lower == "date" || lower == "time" || lower.starts_with("timestamp") || lower.starts_with("datetime") {
        FieldKind::DateTime
    } else {
        FieldKind::Text
    }
}

/// PostgreSQL type name for parameter casts; `None` binds as-is (text).
fn column_pg_type_name(type_name: &str) -> Option<String> {
    let lower = type_name.to_lowercase();
    let name = match lower.as_str() {
        "timestamptz" | "timestamp with time zone" => "timestamptz",
        "date" => "date",
        "time" => "time",
        "uuid" => "uuid",
        "bigserial" | "bigint" | "int8" | "bigautofield" => "bigint",
        "serial" | "integer" | "int" | "int4" | "autofield" => "integer",
        "smallint" | "int2" | "smallserial" => "smallint",
        "float" | "double" | "double precision" | "float8" | "real" => "double precision",
        l if l.starts_with("timestamp") || l.starts_with("datetime") => "timestamp",
        l if l.starts_with("numeric") || l.starts_with("decimal") => "numeric",
        l if l.starts_with("bool") => "boolean",
        // schema-qualified custom type (e.g. sales.order_status)
        _ if type_name.contains('.') => return Some(type_name.to_string()),
        _ => return None,
    };
    Some(name.to_string())
}

fn infer_pk_type(type_name: &str) -> PkType {
    let lower = type_name.to_lowercase();
    if lower.contains("uuid") {
        PkType::Uuid
    } else if lower.contains("bigserial") || lower.contains("bigint") || lower.contains("bigauto") {
        PkType::BigInt
    } else if lower.contains("serial") || lower.contains("int") || lower.contains("autofield") {
        PkType::Int
    } else {
        PkType::Text
    }
}
