//! Condition trees and their compilation into predicates.

use crate::config::{key_text, EntityType, FieldDescriptor, FieldKind};
use crate::error::AppError;
use crate::query::predicate::{Comparison, Predicate};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Operator {
    Is,
    IsNot,
    Contains,
    NotContains,
    IsEmpty,
    NotEmpty,
    StartsWith,
    EndsWith,
    Lt,
    Lte,
    Gt,
    Gte,
    Between,
    NotBetween,
}

impl Operator {
    pub fn parse(s: &str) -> Option<Self> {
        Some(match s.trim() {
            "is" => Operator::Is,
            "is not" => Operator::IsNot,
            "contains" => Operator::Contains,
            "doesn't contain" => Operator::NotContains,
            "is empty" => Operator::IsEmpty,
            "not empty" => Operator::NotEmpty,
            "starts_with" => Operator::StartsWith,
            "ends_with" => Operator::EndsWith,
            "<" => Operator::Lt,
            "<=" => Operator::Lte,
            ">" => Operator::Gt,
            ">=" => Operator::Gte,
            "between" => Operator::Between,
            "not between" => Operator::NotBetween,
            _ => return None,
        })
    }

    fn negated(self) -> bool {
        matches!(
            self,
            Operator::IsNot | Operator::NotContains | Operator::NotEmpty | Operator::NotBetween
        )
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Connector {
    #[default]
    And,
    Or,
}

impl Connector {
    pub fn parse(s: Option<&str>) -> Result<Self, AppError> {
        match s.map(str::trim) {
            None | Some("") => Ok(Connector::And),
            Some(c) if c.eq_ignore_ascii_case("and") => Ok(Connector::And),
            Some(c) if c.eq_ignore_ascii_case("or") => Ok(Connector::Or),
            Some(other) => Err(AppError::Validation(format!("unknown connector: {}", other))),
        }
    }
}

/// One `{field, operator, value, connector}` entry of a condition tree.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ConditionNode {
    #[serde(default)]
    pub field: String,
    #[serde(default)]
    pub operator: String,
    #[serde(default)]
    pub value: Value,
    #[serde(default)]
    pub connector: Option<String>,
}

impl ConditionNode {
    pub fn new(field: &str, operator: &str, value: Value, connector: &str) -> Self {
        ConditionNode {
            field: field.into(),
            operator: operator.into(),
            value,
            connector: Some(connector.into()),
        }
    }
}

/// What to do with an operator outside the fixed table.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum OperatorPolicy {
    #[default]
    Skip,
    Reject,
}

/// Compile with the default (skipping) operator policy.
pub fn compile(entity: &EntityType, tree: &[ConditionNode]) -> Result<Predicate, AppError> {
    compile_with(entity, tree, OperatorPolicy::Skip)
}

/// Fold the nodes strictly left to right: `((n0 c1 n1) c2 n2) ...`.
pub fn compile_with(
    entity: &EntityType,
    tree: &[ConditionNode],
    policy: OperatorPolicy,
) -> Result<Predicate, AppError> {
    let mut acc = Predicate::All;
    for node in tree {
        if node.field.trim().is_empty() || node.operator.trim().is_empty() {
            continue;
        }
        let field = entity.require_field(node.field.trim())?;
        if field.is_many() {
            return Err(AppError::Validation(format!(
                "{} cannot be used in conditions",
                field.name
            )));
        }
        let connector = Connector::parse(node.connector.as_deref())?;
        let Some(op) = Operator::parse(&node.operator) else {
            if policy == OperatorPolicy::Reject {
                return Err(AppError::UnsupportedOperator(node.operator.clone()));
            }
            tracing::warn!(operator = %node.operator, field = %field.name, "skipping unsupported operator");
            continue;
        };
        let predicate = node_predicate(field, op, &node.value)?;
        acc = match connector {
            Connector::And => acc.and(predicate),
            Connector::Or => acc.or(predicate),
        };
    }
    Ok(acc)
}

/// OR-combined case-insensitive substring match over every searchable field.
/// Matches nothing when the entity has no searchable field.
pub fn search_predicate(entity: &EntityType, text: &str) -> Predicate {
    let fields = entity.searchable_fields();
    if fields.is_empty() {
        return Predicate::key_in(entity.pk.clone(), Vec::new());
    }
    fields
        .into_iter()
        .fold(Predicate::All, |acc, f| {
            acc.or(Predicate::compare(
                f.name.clone(),
                Comparison::IContains,
                Value::String(text.to_string()),
            ))
        })
}

fn node_predicate(field: &FieldDescriptor, op: Operator, value: &Value) -> Result<Predicate, AppError> {
    let name = field.name.clone();
    let base = match op {
        Operator::Is | Operator::IsNot => Predicate::equals(name, coerce(field, value)?),
        Operator::Contains | Operator::NotContains => {
            Predicate::compare(name, Comparison::IContains, Value::String(key_text(value)))
        }
        Operator::StartsWith => Predicate::compare(name, Comparison::IStartsWith, Value::String(key_text(value))),
        Operator::EndsWith => Predicate::compare(name, Comparison::IEndsWith, Value::String(key_text(value))),
        Operator::IsEmpty | Operator::NotEmpty => Predicate::IsNull { field: name },
        Operator::Lt => Predicate::compare(name, Comparison::Lt, coerce(field, value)?),
        Operator::Lte => Predicate::compare(name, Comparison::Lte, coerce(field, value)?),
        Operator::Gt => Predicate::compare(name, Comparison::Gt, coerce(field, value)?),
        Operator::Gte => Predicate::compare(name, Comparison::Gte, coerce(field, value)?),
        Operator::Between | Operator::NotBetween => match value {
            Value::Array(bounds) if bounds.len() == 2 => Predicate::Range {
                field: name,
                low: coerce(field, &bounds[0])?,
                high: coerce(field, &bounds[1])?,
            },
            _ => {
                return Err(AppError::Validation(format!(
                    "{}: between expects a [low, high] array",
                    field.name
                )))
            }
        },
    };
    Ok(if op.negated() { base.negate() } else { base })
}

/// Coerce a condition value to the field's category so stores compare like with like.
fn coerce(field: &FieldDescriptor, value: &Value) -> Result<Value, AppError> {
    let invalid = || AppError::Validation(format!("{}: invalid value {}", field.name, value));
    Ok(match (field.kind, value) {
        (_, Value::Null) => Value::Null,
        (FieldKind::Number, Value::Number(_)) => value.clone(),
        (FieldKind::Number, Value::String(s)) => {
            let s = s.trim();
            if let Ok(i) = s.parse::<i64>() {
                Value::Number(i.into())
            } else {
                let f: f64 = s.parse().map_err(|_| invalid())?;
                serde_json::Number::from_f64(f).map(Value::Number).ok_or_else(invalid)?
            }
        }
        (FieldKind::Boolean, Value::Bool(_)) => value.clone(),
        (FieldKind::Boolean, Value::String(s)) => match s.trim().to_lowercase().as_str() {
            "true" | "1" => Value::Bool(true),
            "false" | "0" => Value::Bool(false),
            _ => return Err(invalid()),
        },
        (FieldKind::Text | FieldKind::DateTime, Value::String(_)) => value.clone(),
        (FieldKind::Text | FieldKind::DateTime, Value::Number(_) | Value::Bool(_)) => Value::String(key_text(value)),
        (FieldKind::Relation | FieldKind::Identifier, Value::String(_) | Value::Number(_)) => value.clone(),
        _ => return Err(invalid()),
    })
}
