//! Raw declarative entity definitions, as read from the registration document (JSON).

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// On-delete policy of a forward single-valued relation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnDeleteConfig {
    #[default]
    Protect,
    Cascade,
    SetNull,
}

/// PostgreSQL join table backing a many-to-many field.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ThroughConfig {
    pub table: String,
    #[serde(default = "default_source_column")]
    pub source_column: String,
    #[serde(default = "default_target_column")]
    pub target_column: String,
}

fn default_source_column() -> String {
    "source_id".into()
}

fn default_target_column() -> String {
    "target_id".into()
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RelationConfig {
    /// Name of the related entity.
    pub target: String,
    #[serde(default)]
    pub many: bool,
    #[serde(default)]
    pub on_delete: OnDeleteConfig,
    /// Name of the reverse accessor synthesized on the target. Default `<source>_set`.
    #[serde(default)]
    pub related_name: Option<String>,
    #[serde(default)]
    pub through: Option<ThroughConfig>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ValidationRule {
    #[serde(default)]
    pub required: Option<bool>,
    #[serde(default)]
    pub format: Option<String>,
    #[serde(default)]
    pub max_length: Option<u32>,
    #[serde(default)]
    pub min_length: Option<u32>,
    #[serde(default)]
    pub pattern: Option<String>,
    #[serde(default)]
    pub allowed: Option<Vec<serde_json::Value>>,
    #[serde(default)]
    pub minimum: Option<f64>,
    #[serde(default)]
    pub maximum: Option<f64>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FieldConfig {
    pub name: String,
    /// Raw type name, e.g. `varchar`, `email`, `integer`, `timestamptz`, `fk`, `m2m`.
    #[serde(rename = "type")]
    pub type_: String,
    #[serde(default = "default_true")]
    pub nullable: bool,
    #[serde(default)]
    pub blank: bool,
    #[serde(default)]
    pub unique: bool,
    #[serde(default)]
    pub primary_key: bool,
    #[serde(default)]
    pub default: Option<serde_json::Value>,
    /// Value produced by the store (serial keys, timestamps). Never required on input.
    #[serde(default)]
    pub auto: bool,
    #[serde(default)]
    pub max_length: Option<u32>,
    #[serde(default)]
    pub choices: Option<Vec<String>>,
    #[serde(default)]
    pub relation: Option<RelationConfig>,
    #[serde(default)]
    pub validation: Option<ValidationRule>,
}

fn default_true() -> bool {
    true
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EntityConfig {
    pub name: String,
    pub namespace: String,
    /// URL segment. Default: lowercase name.
    #[serde(default)]
    pub path_segment: Option<String>,
    /// Table name. Default: lowercase name.
    #[serde(default)]
    pub table: Option<String>,
    #[serde(default)]
    pub db_schema: Option<String>,
    #[serde(default)]
    pub display_field: Option<String>,
    #[serde(default = "default_true")]
    pub searchable: bool,
    /// Field names that must never be exposed in responses (password hashes, secrets).
    #[serde(default)]
    pub sensitive_fields: Vec<String>,
    pub fields: Vec<FieldConfig>,
}

/// The whole registration document.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FullConfig {
    pub entities: Vec<EntityConfig>,
}

impl FullConfig {
    pub fn entity(&self, name: &str) -> Option<&EntityConfig> {
        self.entities.iter().find(|e| e.name == name)
    }

    pub(crate) fn entities_by_name(&self) -> HashMap<&str, &EntityConfig> {
        self.entities.iter().map(|e| (e.name.as_str(), e)).collect()
    }
}
