//! Request validation from per-field rules and picklists.

use crate::config::{EntityType, FieldDescriptor, ValidationRule};
use crate::error::AppError;
use crate::store::Record;
use regex::Regex;
use serde_json::Value;

pub struct RequestValidator;

impl RequestValidator {
    /// Validate a create payload. Fields whose rule says `required` must be present.
    pub fn validate(entity: &EntityType, record: &Record) -> Result<(), AppError> {
        for field in entity.mutable_fields() {
            let val = record.get(&field.name);
            let required = field.validation.as_ref().and_then(|r| r.required) == Some(true);
            if required && val.map_or(true, Value::is_null) {
                return Err(AppError::Validation(format!("{} is required", field.name)));
            }
            if let Some(v) = val {
                Self::validate_field(field, v)?;
            }
        }
        Ok(())
    }

    /// Validate only the fields present in the payload (partial update).
    pub fn validate_partial(entity: &EntityType, record: &Record) -> Result<(), AppError> {
        for (name, v) in record {
            if let Some(field) = entity.field(name) {
                Self::validate_field(field, v)?;
            }
        }
        Ok(())
    }

    /// Column length, picklist and rule checks for one value.
    pub fn validate_field(field: &FieldDescriptor, v: &Value) -> Result<(), AppError> {
        if v.is_null() {
            return Ok(());
        }
        let col = field.name.as_str();
        if let (Some(max), Some(s)) = (field.max_length, v.as_str()) {
            if s.chars().count() > max as usize {
                return Err(AppError::Validation(format!(
                    "{} must be at most {} characters",
                    col, max
                )));
            }
        }
        if let Some(choices) = &field.choices {
            let text = crate::config::key_text(v);
            if !choices.iter().any(|c| *c == text) {
                return Err(AppError::Validation(format!(
                    "{} is not a valid choice for {}",
                    text, col
                )));
            }
        }
        match &field.validation {
            Some(rule) => apply_rule(col, v, rule),
            None => Ok(()),
        }
    }
}

fn apply_rule(col: &str, v: &Value, rule: &ValidationRule) -> Result<(), AppError> {
    if let Some(format) = &rule.format {
        validate_format(col, v, format)?;
    }
    if let Some(max) = rule.max_length {
        if let Some(s) = v.as_str() {
            if s.chars().count() > max as usize {
                return Err(AppError::Validation(format!(
                    "{} must be at most {} characters",
                    col, max
                )));
            }
        }
    }
    if let Some(min) = rule.min_length {
        if let Some(s) = v.as_str() {
            if s.chars().count() < min as usize {
                return Err(AppError::Validation(format!(
                    "{} must be at least {} characters",
                    col, min
                )));
            }
        }
    }
    if let Some(ref pattern) = rule.pattern {
        let re = Regex::new(pattern).map_err(|_| AppError::Validation(format!("invalid pattern for {}", col)))?;
        if let Some(s) = v.as_str() {
            if !re.is_match(s) {
                return Err(AppError::Validation(format!("{} does not match required pattern", col)));
            }
        }
    }
    if let Some(ref allowed) = rule.allowed {
        if !allowed.iter().any(|a| value_eq(v, a)) {
            return Err(AppError::Validation(format!(
                "{} must be one of: {:?}",
                col,
                allowed.iter().take(5).collect::<Vec<_>>()
            )));
        }
    }
    if let Some(min) = rule.minimum {
        if let Some(n) = v.as_f64() {
            if n < min {
                return Err(AppError::Validation(format!("{} must be at least {}", col, min)));
            }
        }
    }
    if let Some(max) = rule.maximum {
        if let Some(n) = v.as_f64() {
            if n > max {
                return Err(AppError::Validation(format!("{} must be at most {}", col, max)));
            }
        }
    }
    Ok(())
}

fn value_eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::String(s), Value::String(t)) => s == t,
        (Value::Number(n), Value::Number(m)) => n.as_f64() == m.as_f64(),
        _ => a == b,
    }
}

fn validate_format(col: &str, v: &Value, format: &str) -> Result<(), AppError> {
    match format.to_lowercase().as_str() {
        "email" => {
            if let Some(s) = v.as_str() {
                if !s.contains('@') || s.len() < 3 {
                    return Err(AppError::Validation(format!("{} must be a valid email", col)));
                }
            }
        }
        "uuid" => {
            if let Some(s) = v.as_str() {
                if uuid::Uuid::parse_str(s).is_err() {
                    return Err(AppError::Validation(format!("{} must be a valid UUID", col)));
                }
            }
        }
        _ => {}
    }
    Ok(())
}
