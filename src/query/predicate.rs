//! Compiled, store-independent filter expressions and their in-memory evaluation.

use crate::config::key_text;
use crate::store::Record;
use serde_json::Value;
use std::cmp::Ordering;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Comparison {
    Eq,
    Lt,
    Lte,
    Gt,
    Gte,
    /// Case-insensitive substring.
    IContains,
    IStartsWith,
    IEndsWith,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Predicate {
    /// Matches every record (empty condition tree).
    All,
    Compare { field: String, op: Comparison, value: Value },
    /// Inclusive range.
    Range { field: String, low: Value, high: Value },
    IsNull { field: String },
    In { field: String, values: Vec<Value> },
    Not(Box<Predicate>),
    And(Box<Predicate>, Box<Predicate>),
    Or(Box<Predicate>, Box<Predicate>),
}

impl Predicate {
    pub fn compare(field: impl Into<String>, op: Comparison, value: Value) -> Self {
        Predicate::Compare {
            field: field.into(),
            op,
            value,
        }
    }

    pub fn equals(field: impl Into<String>, value: Value) -> Self {
        Self::compare(field, Comparison::Eq, value)
    }

    pub fn key_in(field: impl Into<String>, values: Vec<Value>) -> Self {
        Predicate::In {
            field: field.into(),
            values,
        }
    }

    pub fn negate(self) -> Self {
        Predicate::Not(Box::new(self))
    }

    /// Conjunction where `All` is the identity.
    pub fn and(self, other: Predicate) -> Self {
        match (self, other) {
            (Predicate::All, p) | (p, Predicate::All) => p,
            (a, b) => Predicate::And(Box::new(a), Box::new(b)),
        }
    }

    /// Disjunction where `All` is the identity, as an empty filter combined with a condition.
    pub fn or(self, other: Predicate) -> Self {
        match (self, other) {
            (Predicate::All, p) | (p, Predicate::All) => p,
            (a, b) => Predicate::Or(Box::new(a), Box::new(b)),
        }
    }

    /// Evaluate against one record. Missing fields read as null; comparisons with null are false.
    pub fn matches(&self, record: &Record) -> bool {
        match self {
            Predicate::All => true,
            Predicate::Compare { field, op, value } => {
                let actual = field_value(record, field);
                if actual.is_null() {
                    return false;
                }
                match op {
                    Comparison::Eq => loose_eq(actual, value),
                    Comparison::Lt => compare(actual, value) == Some(Ordering::Less),
                    Comparison::Lte => matches!(compare(actual, value), Some(Ordering::Less | Ordering::Equal)),
                    Comparison::Gt => compare(actual, value) == Some(Ordering::Greater),
                    Comparison::Gte => matches!(compare(actual, value), Some(Ordering::Greater | Ordering::Equal)),
                    Comparison::IContains => lower_text(actual).contains(&lower_text(value)),
                    Comparison::IStartsWith => lower_text(actual).starts_with(&lower_text(value)),
                    Comparison::IEndsWith => lower_text(actual).ends_with(&lower_text(value)),
                }
            }
            Predicate::Range { field, low, high } => {
                let actual = field_value(record, field);
                !actual.is_null()
                    && matches!(compare(actual, low), Some(Ordering::Greater | Ordering::Equal))
                    && matches!(compare(actual, high), Some(Ordering::Less | Ordering::Equal))
            }
            Predicate::IsNull { field } => field_value(record, field).is_null(),
            Predicate::In { field, values } => {
                let actual = field_value(record, field);
                !actual.is_null() && values.iter().any(|v| loose_eq(actual, v))
            }
            Predicate::Not(inner) => !inner.matches(record),
            Predicate::And(a, b) => a.matches(record) && b.matches(record),
            Predicate::Or(a, b) => a.matches(record) || b.matches(record),
        }
    }
}

static NULL: Value = Value::Null;

fn field_value<'r>(record: &'r Record, field: &str) -> &'r Value {
    record.get(field).unwrap_or(&NULL)
}

fn lower_text(v: &Value) -> String {
    key_text(v).to_lowercase()
}

fn as_number(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Equality that tolerates `7` vs `"7"` (keys from paths and CSV cells arrive as text).
pub fn loose_eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(_), Value::String(_)) | (Value::String(_), Value::Number(_)) => {
            matches!((as_number(a), as_number(b)), (Some(x), Some(y)) if x == y)
        }
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        _ => a == b,
    }
}

/// Ordering between two scalar values; `None` when they are not comparable.
pub fn compare(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        _ => as_number(a)?.partial_cmp(&as_number(b)?),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(v: Value) -> Record {
        v.as_object().cloned().unwrap()
    }

    #[test]
    fn all_is_identity_for_both_connectors() {
        let p = Predicate::equals("a", json!(1));
        assert_eq!(Predicate::All.and(p.clone()), p);
        assert_eq!(Predicate::All.or(p.clone()), p);
    }

    #[test]
    fn null_never_compares_but_negation_flips() {
        let row = record(json!({ "name": null }));
        let contains = Predicate::compare("name", Comparison::IContains, json!("a"));
        assert!(!contains.matches(&row));
        assert!(contains.negate().matches(&row));
        assert!(Predicate::IsNull { field: "name".into() }.matches(&row));
        assert!(Predicate::IsNull { field: "missing".into() }.matches(&row));
    }

    #[test]
    fn range_is_inclusive_and_numbers_compare_loosely() {
        let row = record(json!({ "age": 30 }));
        let range = Predicate::Range {
            field: "age".into(),
            low: json!(30),
            high: json!("40"),
        };
        assert!(range.matches(&row));
        assert!(Predicate::key_in("age", vec![json!("30")]).matches(&row));
        assert!(!Predicate::key_in("age", vec![]).matches(&row));
    }

    #[test]
    fn text_matching_is_case_insensitive_over_textual_form() {
        let row = record(json!({ "name": "Alice", "joined": "2024-03-01" }));
        assert!(Predicate::compare("name", Comparison::IStartsWith, json!("al")).matches(&row));
        assert!(Predicate::compare("name", Comparison::IEndsWith, json!("ICE")).matches(&row));
        assert!(Predicate::compare("joined", Comparison::IContains, json!("2024-03")).matches(&row));
    }
}
