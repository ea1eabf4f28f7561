//! Builds parameterized SELECT, INSERT, UPDATE, DELETE from the resolved entity type,
//! and renders compiled predicates as WHERE clauses.

use crate::config::{EntityType, FieldDescriptor, ThroughConfig};
use crate::error::AppError;
use crate::query::{Comparison, Page, Predicate, SortOrder};
use crate::store::Record;
use serde_json::Value;

/// Quote identifier for PostgreSQL (safe: only from config).
fn quoted(s: &str) -> String {
    format!("\"{}\"", s.replace('"', "\"\""))
}

/// Full qualified table name.
fn qualified_table(schema: &str, table: &str) -> String {
    format!("{}.{}", quoted(schema), quoted(table))
}

fn entity_table(entity: &EntityType) -> String {
    qualified_table(&entity.db_schema, &entity.table)
}

pub fn through_table(entity: &EntityType, through: &ThroughConfig) -> String {
    qualified_table(&entity.db_schema, &through.table)
}

#[derive(Debug, Default)]
pub struct QueryBuf {
    pub sql: String,
    pub params: Vec<Value>,
}

impl QueryBuf {
    fn new() -> Self {
        QueryBuf::default()
    }

    fn push_param(&mut self, v: Value) -> u32 {
        let n = self.params.len() as u32 + 1;
        self.params.push(v);
        n
    }

    /// Bind `v` and return its placeholder, cast to `pg_type` when known.
    fn placeholder(&mut self, v: Value, pg_type: Option<&str>) -> String {
        let n = self.push_param(v);
        match pg_type {
            Some(t) => format!("${}::{}", n, t),
            None => format!("${}", n),
        }
    }
}

/// SELECT list: custom enum (schema.typename) as text, numeric as float8 so rows decode to JSON scalars.
fn select_column_list(entity: &EntityType) -> String {
    entity
        .column_fields()
        .map(|f| {
            let q = quoted(&f.name);
            match f.pg_type.as_deref() {
                Some(t) if t.contains('.') => format!("{}::text AS {}", q, q),
                Some("numeric") => format!("{}::float8 AS {}", q, q),
                _ => q,
            }
        })
        .collect::<Vec<_>>()
        .join(", ")
}

fn column<'e>(entity: &'e EntityType, name: &str) -> Result<&'e FieldDescriptor, AppError> {
    let field = entity.require_field(name)?;
    if field.is_many() {
        return Err(AppError::Validation(format!("{} is not a column", name)));
    }
    Ok(field)
}

fn like_pattern(value: &Value, prefix: bool, suffix: bool) -> Value {
    let text = crate::config::key_text(value)
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_");
    let mut out = String::with_capacity(text.len() + 2);
    if prefix {
        out.push('%');
    }
    out.push_str(&text);
    if suffix {
        out.push('%');
    }
    Value::String(out)
}

/// Render `predicate` as a boolean SQL expression, appending its parameters to `q`.
///
/// Negation wraps the inner expression in `COALESCE(..., FALSE)` so a comparison
/// against NULL negates to true, as in-memory evaluation does.
pub fn where_clause(entity: &EntityType, predicate: &Predicate, q: &mut QueryBuf) -> Result<String, AppError> {
    Ok(match predicate {
        Predicate::All => "TRUE".to_string(),
        Predicate::Compare { field, op, value } => {
            let f = column(entity, field)?;
            let col = quoted(&f.name);
            let pg_type = f.pg_type.as_deref();
            match op {
                Comparison::Eq => format!("{} = {}", col, q.placeholder(value.clone(), pg_type)),
                Comparison::Lt => format!("{} < {}", col, q.placeholder(value.clone(), pg_type)),
                Comparison::Lte => format!("{} <= {}", col, q.placeholder(value.clone(), pg_type)),
                Comparison::Gt => format!("{} > {}", col, q.placeholder(value.clone(), pg_type)),
                Comparison::Gte => format!("{} >= {}", col, q.placeholder(value.clone(), pg_type)),
                Comparison::IContains => {
                    format!("CAST({} AS TEXT) ILIKE {}", col, q.placeholder(like_pattern(value, true, true), None))
                }
                Comparison::IStartsWith => {
                    format!("CAST({} AS TEXT) ILIKE {}", col, q.placeholder(like_pattern(value, false, true), None))
                }
                Comparison::IEndsWith => {
                    format!("CAST({} AS TEXT) ILIKE {}", col, q.placeholder(like_pattern(value, true, false), None))
                }
            }
        }
        Predicate::Range { field, low, high } => {
            let f = column(entity, field)?;
            let pg_type = f.pg_type.as_deref();
            let low = q.placeholder(low.clone(), pg_type);
            let high = q.placeholder(high.clone(), pg_type);
            format!("{} BETWEEN {} AND {}", quoted(&f.name), low, high)
        }
        Predicate::IsNull { field } => format!("{} IS NULL", quoted(&column(entity, field)?.name)),
        Predicate::In { field, values } => {
            let f = column(entity, field)?;
            if values.is_empty() {
                return Ok("FALSE".to_string());
            }
            let placeholders: Vec<String> = values
                .iter()
                .map(|v| q.placeholder(v.clone(), f.pg_type.as_deref()))
                .collect();
            format!("{} IN ({})", quoted(&f.name), placeholders.join(", "))
        }
        Predicate::Not(inner) => format!("NOT COALESCE(({}), FALSE)", where_clause(entity, inner, q)?),
        Predicate::And(a, b) => format!("({} AND {})", where_clause(entity, a, q)?, where_clause(entity, b, q)?),
        Predicate::Or(a, b) => format!("({} OR {})", where_clause(entity, a, q)?, where_clause(entity, b, q)?),
    })
}

/// SELECT by primary key. Caller adds nothing: the key is the sole param.
pub fn select_by_key(entity: &EntityType, key: &Value) -> QueryBuf {
    let mut q = QueryBuf::new();
    let ph = q.placeholder(key.clone(), entity.pk_field().pg_type.as_deref());
    q.sql = format!(
        "SELECT {} FROM {} WHERE {} = {}",
        select_column_list(entity),
        entity_table(entity),
        quoted(&entity.pk),
        ph
    );
    q
}

/// SELECT rows matching `predicate`, ordered by `order` (primary key by default), optionally paged.
pub fn select_filtered(
    entity: &EntityType,
    predicate: &Predicate,
    order: Option<&SortOrder>,
    page: Option<Page>,
) -> Result<QueryBuf, AppError> {
    let mut q = QueryBuf::new();
    let where_sql = where_clause(entity, predicate, &mut q)?;
    let order_clause = match order {
        Some(o) => {
            let f = column(entity, &o.field)?;
            let dir = if o.descending { "DESC NULLS LAST" } else { "ASC NULLS LAST" };
            if f.primary_key {
                format!(" ORDER BY {} {}", quoted(&f.name), dir)
            } else {
                format!(" ORDER BY {} {}, {}", quoted(&f.name), dir, quoted(&entity.pk))
            }
        }
        None => format!(" ORDER BY {}", quoted(&entity.pk)),
    };
    let page_clause = page
        .map(|p| format!(" LIMIT {} OFFSET {}", p.limit, p.offset))
        .unwrap_or_default();
    q.sql = format!(
        "SELECT {} FROM {} WHERE {}{}{}",
        select_column_list(entity),
        entity_table(entity),
        where_sql,
        order_clause,
        page_clause
    );
    Ok(q)
}

pub fn count(entity: &EntityType, predicate: &Predicate) -> Result<QueryBuf, AppError> {
    let mut q = QueryBuf::new();
    let where_sql = where_clause(entity, predicate, &mut q)?;
    q.sql = format!("SELECT COUNT(*) AS \"count\" FROM {} WHERE {}", entity_table(entity), where_sql);
    Ok(q)
}

/// INSERT: only the column fields present in `attrs`, so omitted columns take their database default.
pub fn insert(entity: &EntityType, attrs: &Record) -> QueryBuf {
    let mut q = QueryBuf::new();
    let mut cols = Vec::new();
    let mut placeholders = Vec::new();
    for f in entity.column_fields() {
        let Some(val) = attrs.get(&f.name) else { continue };
        if val.is_null() && f.primary_key {
            continue;
        }
        cols.push(quoted(&f.name));
        placeholders.push(q.placeholder(val.clone(), f.pg_type.as_deref()));
    }
    let table = entity_table(entity);
    let returning = select_column_list(entity);
    q.sql = if cols.is_empty() {
        format!("INSERT INTO {} DEFAULT VALUES RETURNING {}", table, returning)
    } else {
        format!(
            "INSERT INTO {} ({}) VALUES ({}) RETURNING {}",
            table,
            cols.join(", "),
            placeholders.join(", "),
            returning
        )
    };
    q
}

/// UPDATE by key: SET only the column fields present in `attrs` (never the key itself).
/// With nothing to set it degrades to a SELECT of the row.
pub fn update(entity: &EntityType, key: &Value, attrs: &Record) -> QueryBuf {
    let mut q = QueryBuf::new();
    let mut sets = Vec::new();
    for f in entity.column_fields().filter(|f| !f.primary_key) {
        let Some(val) = attrs.get(&f.name) else { continue };
        sets.push(format!("{} = {}", quoted(&f.name), q.placeholder(val.clone(), f.pg_type.as_deref())));
    }
    if sets.is_empty() {
        return select_by_key(entity, key);
    }
    let key_ph = q.placeholder(key.clone(), entity.pk_field().pg_type.as_deref());
    q.sql = format!(
        "UPDATE {} SET {} WHERE {} = {} RETURNING {}",
        entity_table(entity),
        sets.join(", "),
        quoted(&entity.pk),
        key_ph,
        select_column_list(entity)
    );
    q
}

/// DELETE every row whose key is in `keys`.
pub fn delete_in(entity: &EntityType, keys: &[Value]) -> Result<QueryBuf, AppError> {
    let mut q = QueryBuf::new();
    let where_sql = where_clause(entity, &Predicate::key_in(entity.pk.clone(), keys.to_vec()), &mut q)?;
    q.sql = format!("DELETE FROM {} WHERE {}", entity_table(entity), where_sql);
    Ok(q)
}

/// Rows of `source` whose single relation `field` points at one of `keys`.
pub fn select_referencing(source: &EntityType, field: &FieldDescriptor, keys: &[Value]) -> Result<QueryBuf, AppError> {
    select_filtered(source, &Predicate::key_in(field.name.clone(), keys.to_vec()), None, None)
}

/// `(source, target)` pairs of a through table for the given owners.
pub fn select_members(owner: &EntityType, through: &ThroughConfig, source_keys: &[Value]) -> QueryBuf {
    let mut q = QueryBuf::new();
    let pg_type = owner.pk_field().pg_type.as_deref();
    let placeholders: Vec<String> = source_keys
        .iter()
        .map(|k| q.placeholder(k.clone(), pg_type))
        .collect();
    let src = quoted(&through.source_column);
    let dst = quoted(&through.target_column);
    q.sql = if placeholders.is_empty() {
        format!(
            "SELECT {} AS \"source\", {} AS \"target\" FROM {} WHERE FALSE",
            src,
            dst,
            through_table(owner, through)
        )
    } else {
        format!(
            "SELECT {} AS \"source\", {} AS \"target\" FROM {} WHERE {} IN ({}) ORDER BY {}",
            src,
            dst,
            through_table(owner, through),
            src,
            placeholders.join(", "),
            dst
        )
    };
    q
}

/// Remove every membership row whose `column` holds one of `keys`.
pub fn delete_members(
    owner: &EntityType,
    through: &ThroughConfig,
    column: &str,
    keys: &[Value],
    pg_type: Option<&str>,
) -> QueryBuf {
    let mut q = QueryBuf::new();
    if keys.is_empty() {
        q.sql = "SELECT 1 WHERE FALSE".to_string();
        return q;
    }
    let placeholders: Vec<String> = keys.iter().map(|k| q.placeholder(k.clone(), pg_type)).collect();
    q.sql = format!(
        "DELETE FROM {} WHERE {} IN ({})",
        through_table(owner, through),
        quoted(column),
        placeholders.join(", ")
    );
    q
}

pub fn insert_member(
    owner: &EntityType,
    through: &ThroughConfig,
    source: &Value,
    target: &Value,
    target_pg_type: Option<&str>,
) -> QueryBuf {
    let mut q = QueryBuf::new();
    let src = q.placeholder(source.clone(), owner.pk_field().pg_type.as_deref());
    let dst = q.placeholder(target.clone(), target_pg_type);
    q.sql = format!(
        "INSERT INTO {} ({}, {}) VALUES ({}, {})",
        through_table(owner, through),
        quoted(&through.source_column),
        quoted(&through.target_column),
        src,
        dst
    );
    q
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::load_from_str;
    use crate::query::{compile, ConditionNode};
    use serde_json::json;

    fn registry() -> crate::config::SchemaRegistry {
        load_from_str(
            r#"{ "entities": [
                { "name": "Person", "namespace": "crm", "db_schema": "crm", "fields": [
                    { "name": "id", "type": "serial", "primary_key": true },
                    { "name": "name", "type": "varchar" },
                    { "name": "age", "type": "integer" },
                    { "name": "balance", "type": "numeric" },
                    { "name": "tags", "type": "m2m", "relation": { "target": "Tag", "many": true } }
                ] },
                { "name": "Tag", "namespace": "crm", "fields": [
                    { "name": "id", "type": "uuid", "primary_key": true }
                ] }
            ] }"#,
        )
        .unwrap()
    }

    #[test]
    fn renders_left_fold_with_casts_and_negation() {
        let reg = registry();
        let person = reg.describe("Person").unwrap();
        let tree = vec![
            ConditionNode::new("age", "not between", json!([18, 30]), "AND"),
            ConditionNode::new("name", "contains", json!("50%_off"), "OR"),
        ];
        let predicate = compile(person, &tree).unwrap();
        let q = select_filtered(person, &predicate, None, Some(Page { offset: 20, limit: 10 })).unwrap();
        assert_eq!(
            q.sql,
            "SELECT \"id\", \"name\", \"age\", \"balance\"::float8 AS \"balance\" FROM \"crm\".\"person\" \
             WHERE (NOT COALESCE((\"age\" BETWEEN $1::integer AND $2::integer), FALSE) \
             OR CAST(\"name\" AS TEXT) ILIKE $3) ORDER BY \"id\" LIMIT 10 OFFSET 20"
        );
        assert_eq!(q.params, vec![json!(18), json!(30), json!("%50\\%\\_off%")]);
    }

    #[test]
    fn empty_key_set_matches_nothing() {
        let reg = registry();
        let person = reg.describe("Person").unwrap();
        let q = delete_in(person, &[]).unwrap();
        assert_eq!(q.sql, "DELETE FROM \"crm\".\"person\" WHERE FALSE");
        assert!(q.params.is_empty());
    }

    #[test]
    fn many_valued_fields_are_not_columns() {
        let reg = registry();
        let person = reg.describe("Person").unwrap();
        let p = Predicate::equals("tags", json!(1));
        assert!(matches!(count(person, &p), Err(AppError::Validation(_))));
        let p = Predicate::equals("nope", json!(1));
        assert!(matches!(count(person, &p), Err(AppError::InvalidField { .. })));
    }

    #[test]
    fn insert_and_update_skip_absent_columns() {
        let reg = registry();
        let person = reg.describe("Person").unwrap();
        let attrs = json!({ "name": "Ann", "tags": [] }).as_object().cloned().unwrap();
        let q = insert(person, &attrs);
        assert!(q.sql.starts_with("INSERT INTO \"crm\".\"person\" (\"name\") VALUES ($1) RETURNING"));

        let q = update(person, &json!(4), &attrs);
        assert!(q.sql.starts_with("UPDATE \"crm\".\"person\" SET \"name\" = $1 WHERE \"id\" = $2::integer"));
        assert_eq!(q.params, vec![json!("Ann"), json!(4)]);

        let q = update(person, &json!(4), &Record::new());
        assert!(q.sql.starts_with("SELECT"));
    }

    #[test]
    fn membership_queries_use_through_table() {
        let reg = registry();
        let person = reg.describe("Person").unwrap();
        let through = person.field("tags").and_then(|f| f.relation.as_ref()).and_then(|r| r.through.clone()).unwrap();
        let q = insert_member(person, &through, &json!(1), &json!("7d0f8e0a-2f55-4b8e-9d55-0c1c7c3f4b11"), Some("uuid"));
        assert_eq!(
            q.sql,
            "INSERT INTO \"crm\".\"person_tags\" (\"source_id\", \"target_id\") VALUES ($1::integer, $2::uuid)"
        );
    }
}
