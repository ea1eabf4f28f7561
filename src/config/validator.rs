//! Definition validation: referential integrity and naming consistency.

use crate::config::FullConfig;
use crate::error::ConfigError;
use std::collections::HashSet;

pub fn validate(config: &FullConfig) -> Result<(), ConfigError> {
    let by_name = config.entities_by_name();
    let mut names = HashSet::new();
    let mut paths = HashSet::new();

    for e in &config.entities {
        if e.name.trim().is_empty() || e.namespace.trim().is_empty() {
            return Err(ConfigError::Validation("entity name and namespace are required".into()));
        }
        if !names.insert(e.name.as_str()) {
            return Err(ConfigError::Duplicate {
                kind: "entity",
                name: e.name.clone(),
            });
        }
        let path = e.path_segment.clone().unwrap_or_else(|| e.name.to_lowercase());
        if !paths.insert(path.clone()) {
            return Err(ConfigError::Duplicate {
                kind: "path segment",
                name: path,
            });
        }

        let mut field_names = HashSet::new();
        for f in &e.fields {
            if !field_names.insert(f.name.as_str()) {
                return Err(ConfigError::Duplicate {
                    kind: "field",
                    name: format!("{}.{}", e.name, f.name),
                });
            }
        }

        let pks: Vec<_> = e.fields.iter().filter(|f| f.primary_key).collect();
        match pks.as_slice() {
            [] => {
                return Err(ConfigError::InvalidPrimaryKey {
                    entity: e.name.clone(),
                    reason: "no primary key field".into(),
                })
            }
            [pk] if pk.relation.is_some() => {
                return Err(ConfigError::InvalidPrimaryKey {
                    entity: e.name.clone(),
                    reason: "primary key cannot be a relation".into(),
                })
            }
            [_] => {}
            _ => {
                return Err(ConfigError::InvalidPrimaryKey {
                    entity: e.name.clone(),
                    reason: "composite primary keys are not supported".into(),
                })
            }
        }

        if let Some(display) = &e.display_field {
            if !field_names.contains(display.as_str()) {
                return Err(ConfigError::MissingReference {
                    kind: "display field",
                    id: format!("{}.{}", e.name, display),
                });
            }
        }

        for f in &e.fields {
            let Some(rel) = &f.relation else { continue };
            if !by_name.contains_key(rel.target.as_str()) {
                return Err(ConfigError::MissingReference {
                    kind: "relation target",
                    id: format!("{}.{} -> {}", e.name, f.name, rel.target),
                });
            }
            if rel.through.is_some() && !rel.many {
                return Err(ConfigError::Validation(format!(
                    "{}.{}: through table requires a many-to-many relation",
                    e.name, f.name
                )));
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EntityConfig, FieldConfig, RelationConfig};

    fn field(name: &str, ty: &str) -> FieldConfig {
        serde_json::from_value(serde_json::json!({ "name": name, "type": ty })).unwrap()
    }

    fn entity(name: &str, fields: Vec<FieldConfig>) -> EntityConfig {
        EntityConfig {
            name: name.into(),
            namespace: "crm".into(),
            path_segment: None,
            table: None,
            db_schema: None,
            display_field: None,
            searchable: true,
            sensitive_fields: vec![],
            fields,
        }
    }

    fn pk() -> FieldConfig {
        let mut f = field("id", "serial");
        f.primary_key = true;
        f
    }

    #[test]
    fn rejects_missing_primary_key() {
        let config = FullConfig {
            entities: vec![entity("Tag", vec![field("label", "varchar")])],
        };
        assert!(matches!(validate(&config), Err(ConfigError::InvalidPrimaryKey { .. })));
    }

    #[test]
    fn rejects_unknown_relation_target() {
        let mut owner = field("owner", "fk");
        owner.relation = Some(RelationConfig {
            target: "User".into(),
            many: false,
            on_delete: Default::default(),
            related_name: None,
            through: None,
        });
        let config = FullConfig {
            entities: vec![entity("Tag", vec![pk(), owner])],
        };
        assert!(matches!(validate(&config), Err(ConfigError::MissingReference { .. })));
    }

    #[test]
    fn rejects_duplicate_path_segments() {
        let config = FullConfig {
            entities: vec![entity("Tag", vec![pk()]), entity("TAG", vec![pk()])],
        };
        assert!(matches!(validate(&config), Err(ConfigError::Duplicate { kind: "path segment", .. })));
    }
}
