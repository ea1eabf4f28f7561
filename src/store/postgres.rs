//! PostgreSQL entity store on sqlx. Many-to-many fields live in through tables and are
//! loaded and written alongside the owning row.

use crate::config::{key_text, EntityType, SchemaRegistry};
use crate::error::AppError;
use crate::query::{Page, Predicate, SortOrder};
use crate::sql::{
    count, delete_in, delete_members, insert, insert_member, select_by_key, select_filtered, select_members,
    select_referencing, update, PgBindValue, QueryBuf,
};
use crate::store::{EntityStore, Record};
use async_trait::async_trait;
use serde_json::Value;
use sqlx::postgres::{PgArguments, PgPoolOptions, PgRow};
use sqlx::{PgExecutor, PgPool, Postgres};
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
    registry: Arc<SchemaRegistry>,
}

impl PgStore {
    pub fn new(pool: PgPool, registry: Arc<SchemaRegistry>) -> Self {
        PgStore { pool, registry }
    }

    pub async fn connect(database_url: &str, registry: Arc<SchemaRegistry>) -> Result<Self, AppError> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;
        Ok(Self::new(pool, registry))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Fill every many-to-many field of `rows` from its through table.
    async fn load_members(&self, entity: &EntityType, rows: &mut [Record]) -> Result<(), AppError> {
        if rows.is_empty() {
            return Ok(());
        }
        let keys: Vec<Value> = rows.iter().filter_map(|r| entity.key_of(r).cloned()).collect();
        for field in entity.fields.iter().filter(|f| f.is_many_to_many()) {
            let Some(through) = field.relation.as_ref().and_then(|r| r.through.as_ref()) else { continue };
            let pairs = fetch_all(&self.pool, &select_members(entity, through, &keys)).await?;
            let mut by_owner: HashMap<String, Vec<Value>> = HashMap::new();
            for pair in pairs {
                let source = pair.get("source").map(key_text).unwrap_or_default();
                by_owner
                    .entry(source)
                    .or_default()
                    .push(pair.get("target").cloned().unwrap_or(Value::Null));
            }
            for row in rows.iter_mut() {
                let key = entity.key_of(row).map(key_text).unwrap_or_default();
                let members = by_owner.remove(&key).unwrap_or_default();
                row.insert(field.name.clone(), Value::Array(members));
            }
        }
        Ok(())
    }

    /// Replace the membership set of every many-to-many field present in `attrs`.
    async fn write_members(
        conn: &mut sqlx::PgConnection,
        entity: &EntityType,
        key: &Value,
        attrs: &Record,
    ) -> Result<(), AppError> {
        for field in entity.fields.iter().filter(|f| f.is_many_to_many()) {
            let Some(Value::Array(members)) = attrs.get(&field.name) else { continue };
            let Some(through) = field.relation.as_ref().and_then(|r| r.through.as_ref()) else { continue };
            let owner_type = entity.pk_field().pg_type.as_deref();
            let q = delete_members(entity, through, &through.source_column, std::slice::from_ref(key), owner_type);
            execute(&mut *conn, &q).await?;
            for member in members {
                let q = insert_member(entity, through, key, member, field.pg_type.as_deref());
                execute(&mut *conn, &q).await?;
            }
        }
        Ok(())
    }

    /// Describe the rows that still reference `keys` through a single-valued relation.
    async fn blockers(&self, entity: &EntityType, keys: &[Value]) -> Result<Vec<String>, AppError> {
        let mut out = Vec::new();
        for (source, field) in self.registry.referencing(&entity.name) {
            if !field.is_single_relation() {
                continue;
            }
            let rows = fetch_all(&self.pool, &select_referencing(source, field, keys)?).await?;
            out.extend(rows.iter().map(|r| source.display_name(r)));
        }
        Ok(out)
    }
}

fn reject_unknown_keys(entity: &EntityType, record: &Record) -> Result<(), AppError> {
    for name in record.keys() {
        entity.require_mutable_field(name)?;
    }
    Ok(())
}

fn bind_all(q: &QueryBuf) -> sqlx::query::Query<'_, Postgres, PgArguments> {
    let mut query = sqlx::query(&q.sql);
    for p in &q.params {
        query = query.bind(PgBindValue::from_json(p));
    }
    query
}

async fn fetch_all<'c, E: PgExecutor<'c>>(exec: E, q: &QueryBuf) -> Result<Vec<Record>, AppError> {
    tracing::debug!(sql = %q.sql, params = ?q.params, "query");
    let rows = bind_all(q).fetch_all(exec).await.map_err(map_db_error)?;
    Ok(rows.iter().map(row_to_record).collect())
}

async fn fetch_optional<'c, E: PgExecutor<'c>>(exec: E, q: &QueryBuf) -> Result<Option<Record>, AppError> {
    tracing::debug!(sql = %q.sql, params = ?q.params, "query");
    let row = bind_all(q).fetch_optional(exec).await.map_err(map_db_error)?;
    Ok(row.as_ref().map(row_to_record))
}

async fn execute<'c, E: PgExecutor<'c>>(exec: E, q: &QueryBuf) -> Result<u64, AppError> {
    tracing::debug!(sql = %q.sql, params = ?q.params, "execute");
    let done = bind_all(q).execute(exec).await.map_err(map_db_error)?;
    Ok(done.rows_affected())
}

fn db_code(e: &sqlx::Error) -> Option<String> {
    match e {
        sqlx::Error::Database(db) => db.code().map(|c| c.into_owned()),
        _ => None,
    }
}

/// Constraint violations are caller errors; everything else stays a database error.
fn map_db_error(e: sqlx::Error) -> AppError {
    let message = match &e {
        sqlx::Error::Database(db) => db.message().to_string(),
        _ => return AppError::Db(e),
    };
    match db_code(&e).as_deref() {
        Some("23505") => AppError::Conflict(message),
        Some("23502") | Some("23503") | Some("23514") | Some("22P02") => AppError::Validation(message),
        _ => AppError::Db(e),
    }
}

#[async_trait]
impl EntityStore for PgStore {
    async fn get(&self, entity: &EntityType, key: &Value) -> Result<Option<Record>, AppError> {
        let Some(row) = fetch_optional(&self.pool, &select_by_key(entity, key)).await? else {
            return Ok(None);
        };
        let mut rows = [row];
        self.load_members(entity, &mut rows).await?;
        let [row] = rows;
        Ok(Some(row))
    }

    async fn filter(
        &self,
        entity: &EntityType,
        predicate: &Predicate,
        order: Option<&SortOrder>,
        page: Option<Page>,
    ) -> Result<Vec<Record>, AppError> {
        let q = select_filtered(entity, predicate, order, page)?;
        let mut rows = fetch_all(&self.pool, &q).await?;
        self.load_members(entity, &mut rows).await?;
        Ok(rows)
    }

    async fn count(&self, entity: &EntityType, predicate: &Predicate) -> Result<u64, AppError> {
        use sqlx::Row;
        let q = count(entity, predicate)?;
        tracing::debug!(sql = %q.sql, params = ?q.params, "query");
        let row = bind_all(&q).fetch_one(&self.pool).await.map_err(map_db_error)?;
        let n: i64 = row.try_get("count")?;
        Ok(n.max(0) as u64)
    }

    async fn create(&self, entity: &EntityType, attrs: Record) -> Result<Record, AppError> {
        reject_unknown_keys(entity, &attrs)?;
        let mut tx = self.pool.begin().await?;
        let mut row = fetch_optional(&mut *tx, &insert(entity, &attrs))
            .await?
            .ok_or(AppError::Db(sqlx::Error::RowNotFound))?;
        let key = entity
            .key_of(&row)
            .cloned()
            .ok_or_else(|| AppError::Internal(format!("{} insert returned no key", entity.name)))?;
        Self::write_members(&mut *tx, entity, &key, &attrs).await?;
        tx.commit().await?;
        for field in entity.fields.iter().filter(|f| f.is_many_to_many()) {
            let members = attrs.get(&field.name).cloned().unwrap_or(Value::Array(Vec::new()));
            row.insert(field.name.clone(), members);
        }
        Ok(row)
    }

    async fn save(&self, entity: &EntityType, record: Record) -> Result<Record, AppError> {
        reject_unknown_keys(entity, &record)?;
        let key = entity
            .key_of(&record)
            .cloned()
            .ok_or_else(|| AppError::Validation(format!("{} is required", entity.pk)))?;
        let mut tx = self.pool.begin().await?;
        fetch_optional(&mut *tx, &update(entity, &key, &record))
            .await?
            .ok_or_else(|| AppError::NotFound(format!("{} {}", entity.name, key_text(&key))))?;
        Self::write_members(&mut *tx, entity, &key, &record).await?;
        tx.commit().await?;
        self.get(entity, &key)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("{} {}", entity.name, key_text(&key))))
    }

    async fn delete(&self, entity: &EntityType, keys: &[Value]) -> Result<u64, AppError> {
        if keys.is_empty() {
            return Ok(0);
        }
        let mut tx = self.pool.begin().await?;
        let owner_type = entity.pk_field().pg_type.as_deref();
        for field in entity.fields.iter().filter(|f| f.is_many_to_many()) {
            let Some(through) = field.relation.as_ref().and_then(|r| r.through.as_ref()) else { continue };
            execute(&mut *tx, &delete_members(entity, through, &through.source_column, keys, owner_type)).await?;
        }
        for (source, field) in self.registry.referencing(&entity.name) {
            if !field.is_many_to_many() {
                continue;
            }
            let Some(through) = field.relation.as_ref().and_then(|r| r.through.as_ref()) else { continue };
            execute(&mut *tx, &delete_members(source, through, &through.target_column, keys, owner_type)).await?;
        }
        let q = delete_in(entity, keys)?;
        tracing::debug!(sql = %q.sql, params = ?q.params, "execute");
        let deleted = match bind_all(&q).execute(&mut *tx).await {
            Ok(done) => done.rows_affected(),
            Err(e) if db_code(&e).as_deref() == Some("23503") => {
                tx.rollback().await?;
                let blockers = self.blockers(entity, keys).await?;
                tracing::debug!(entity = %entity.name, blockers = blockers.len(), "delete refused");
                return Err(AppError::Protected { blockers });
            }
            Err(e) => return Err(map_db_error(e)),
        };
        tx.commit().await?;
        Ok(deleted)
    }

    async fn ping(&self) -> Result<(), AppError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

fn row_to_record(row: &PgRow) -> Record {
    use sqlx::Column;
    use sqlx::Row;
    let mut map = Record::new();
    for col in row.columns() {
        let name = col.name();
        map.insert(name.to_string(), cell_to_value(row, name));
    }
    map
}

fn cell_to_value(row: &PgRow, name: &str) -> Value {
    use sqlx::Row;
    if let Ok(Some(n)) = row.try_get::<Option<i16>, _>(name) {
        return Value::Number(n.into());
    }
    if let Ok(Some(n)) = row.try_get::<Option<i32>, _>(name) {
        return Value::Number(n.into());
    }
    if let Ok(Some(n)) = row.try_get::<Option<i64>, _>(name) {
        return Value::Number(n.into());
    }
    if let Ok(Some(n)) = row.try_get::<Option<f32>, _>(name) {
        if let Some(n) = serde_json::Number::from_f64(n as f64) {
            return Value::Number(n);
        }
    }
    if let Ok(Some(n)) = row.try_get::<Option<f64>, _>(name) {
        if let Some(n) = serde_json::Number::from_f64(n) {
            return Value::Number(n);
        }
    }
    if let Ok(Some(b)) = row.try_get::<Option<bool>, _>(name) {
        return Value::Bool(b);
    }
    if let Ok(Some(u)) = row.try_get::<Option<uuid::Uuid>, _>(name) {
        return Value::String(u.to_string());
    }
    if let Ok(Some(d)) = row.try_get::<Option<chrono::DateTime<chrono::Utc>>, _>(name) {
        return Value::String(d.to_rfc3339());
    }
    if let Ok(Some(d)) = row.try_get::<Option<chrono::NaiveDateTime>, _>(name) {
        return Value::String(d.format("%Y-%m-%dT%H:%M:%S%.f").to_string());
    }
    if let Ok(Some(d)) = row.try_get::<Option<chrono::NaiveDate>, _>(name) {
        return Value::String(d.format("%Y-%m-%d").to_string());
    }
    if let Ok(Some(t)) = row.try_get::<Option<chrono::NaiveTime>, _>(name) {
        return Value::String(t.format("%H:%M:%S").to_string());
    }
    if let Ok(Some(s)) = row.try_get::<Option<String>, _>(name) {
        return Value::String(s);
    }
    if let Ok(Some(j)) = row.try_get::<Option<Value>, _>(name) {
        return j;
    }
    Value::Null
}
