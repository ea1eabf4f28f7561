//! Read-only catalogue of registered modules and their fields.

use crate::config::SchemaRegistry;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;

#[derive(Debug, Serialize)]
pub struct ModuleEntry {
    pub name: String,
    /// Entity name → collection path.
    pub views: BTreeMap<String, String>,
}

#[derive(Debug, Serialize)]
pub struct Lookup {
    pub model: String,
    pub id: String,
}

#[derive(Debug, Serialize)]
pub struct FieldEntry {
    pub api_name: String,
    pub data_type: String,
    pub picklists: Option<Vec<String>>,
    pub lookup: Option<Lookup>,
    pub primary_key: bool,
    pub max_length: Option<u32>,
    pub null: bool,
    pub blank: bool,
    pub default: Option<Value>,
    pub unique: bool,
}

#[derive(Debug, Serialize)]
pub struct ModelFields {
    pub namespace: String,
    pub model: String,
    pub fields: Vec<FieldEntry>,
}

pub struct MetaService;

impl MetaService {
    pub fn modules(registry: &SchemaRegistry) -> BTreeMap<String, ModuleEntry> {
        registry
            .namespaces()
            .into_iter()
            .map(|(ns, entities)| {
                let views = entities
                    .iter()
                    .map(|e| (e.name.clone(), format!("/{}/", e.path_segment)))
                    .collect();
                (ns.to_string(), ModuleEntry { name: ns.to_string(), views })
            })
            .collect()
    }

    /// Field listings, optionally narrowed by namespace and entity name. Reverse relations are left out.
    pub fn fields(registry: &SchemaRegistry, namespace: Option<&str>, model: Option<&str>) -> Vec<ModelFields> {
        registry
            .entities()
            .iter()
            .filter(|e| namespace.map_or(true, |ns| e.namespace == ns))
            .filter(|e| model.map_or(true, |m| e.name == m))
            .map(|e| ModelFields {
                namespace: e.namespace.clone(),
                model: e.name.clone(),
                fields: e
                    .mutable_fields()
                    .map(|f| FieldEntry {
                        api_name: f.name.clone(),
                        data_type: f.type_name.clone(),
                        picklists: f.choices.clone(),
                        lookup: f.target().and_then(|t| registry.describe(t).ok()).map(|t| Lookup {
                            model: t.name.clone(),
                            id: t.pk.clone(),
                        }),
                        primary_key: f.primary_key,
                        max_length: f.max_length,
                        null: f.nullable,
                        blank: f.blank,
                        default: f.default.clone(),
                        unique: f.unique,
                    })
                    .collect(),
            })
            .collect()
    }
}
