//! Generic CRUD over any registered entity: list with filters and paging, retrieve with
//! schema, create, partial update, delete.

use crate::config::{key_text, EntityType, SchemaRegistry, Settings, DEFAULT_PAGE_SIZE, MAX_PAGE_SIZE};
use crate::error::AppError;
use crate::identity::Identity;
use crate::query::{compile, search_predicate, Comparison, ConditionNode, Page, Predicate, SortOrder};
use crate::service::Serializer;
use crate::store::EntityStore;
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};

/// Query parameters with a fixed meaning; every other parameter names a field.
pub const RESERVED_PARAMS: &[&str] = &["page", "page_size", "search", "ordering"];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Paging {
    pub default_size: u64,
    pub max_size: u64,
}

impl Default for Paging {
    fn default() -> Self {
        Paging {
            default_size: DEFAULT_PAGE_SIZE,
            max_size: MAX_PAGE_SIZE,
        }
    }
}

impl From<&Settings> for Paging {
    fn from(settings: &Settings) -> Self {
        Paging {
            default_size: settings.page_size,
            max_size: settings.max_page_size,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ListMetadata {
    pub total_records: u64,
    pub page_size: u64,
    pub current_page: u64,
    pub total_pages: u64,
    pub model: String,
    pub namespace: String,
    pub schema: Vec<crate::config::FieldSchema>,
}

#[derive(Debug, Serialize)]
pub struct ListPage {
    pub count: u64,
    pub next: Option<u64>,
    pub previous: Option<u64>,
    pub results: Vec<Value>,
    pub metadata: ListMetadata,
}

#[derive(Debug, Serialize)]
pub struct Retrieved {
    pub data: Value,
    pub schema: Value,
}

pub struct CrudService;

impl CrudService {
    /// Exact-match filters from `params`, optional `search` and `ordering`, page-number paging.
    pub async fn list(
        registry: &SchemaRegistry,
        store: &dyn EntityStore,
        paging: Paging,
        entity: &EntityType,
        params: &HashMap<String, String>,
    ) -> Result<ListPage, AppError> {
        let predicate = Self::list_predicate(entity, params)?;
        let order = match params.get("ordering").map(|s| s.trim()).filter(|s| !s.is_empty()) {
            Some(raw) => {
                let order = SortOrder::parse(raw);
                let field = entity.require_field(&order.field)?;
                if field.is_many() {
                    return Err(AppError::InvalidField {
                        entity: entity.name.clone(),
                        field: order.field,
                    });
                }
                Some(order)
            }
            None => None,
        };
        let page = parse_positive(params.get("page"), "page")?.unwrap_or(1);
        let page_size = parse_positive(params.get("page_size"), "page_size")?
            .unwrap_or(paging.default_size)
            .min(paging.max_size);

        let count = store.count(entity, &predicate).await?;
        let total_pages = count.div_ceil(page_size).max(1);
        if page > total_pages {
            return Err(AppError::NotFound(format!("invalid page {}", page)));
        }
        let rows = store
            .filter(
                entity,
                &predicate,
                order.as_ref(),
                Some(Page {
                    offset: (page - 1) * page_size,
                    limit: page_size,
                }),
            )
            .await?;
        let results = Serializer::represent_many(registry, store, entity, &rows).await?;
        tracing::debug!(entity = %entity.name, count, page, "list");
        Ok(ListPage {
            count,
            next: (page < total_pages).then_some(page + 1),
            previous: (page > 1).then(|| page - 1),
            results,
            metadata: ListMetadata {
                total_records: count,
                page_size,
                current_page: page,
                total_pages,
                model: entity.name.clone(),
                namespace: entity.namespace.clone(),
                schema: entity.schema_listing(),
            },
        })
    }

    fn list_predicate(entity: &EntityType, params: &HashMap<String, String>) -> Result<Predicate, AppError> {
        // sorted so the bound parameter order is stable
        let filters: BTreeMap<&str, &str> = params
            .iter()
            .filter(|(k, _)| !RESERVED_PARAMS.contains(&k.as_str()))
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();
        let mut nodes = Vec::with_capacity(filters.len());
        for (name, raw) in filters {
            let field = entity.require_field(name)?;
            if field.is_many() {
                return Err(AppError::InvalidField {
                    entity: entity.name.clone(),
                    field: name.to_string(),
                });
            }
            nodes.push(ConditionNode::new(name, "is", Value::String(raw.to_string()), "AND"));
        }
        let mut predicate = compile(entity, &nodes)?;
        if let Some(text) = params.get("search").map(|s| s.trim()).filter(|s| !s.is_empty()) {
            predicate = predicate.and(search_predicate(entity, text));
        }
        Ok(predicate)
    }

    /// One record by key, with the entity's JSON schema and the keys of its neighbours.
    pub async fn retrieve(
        registry: &SchemaRegistry,
        store: &dyn EntityStore,
        entity: &EntityType,
        key: &Value,
    ) -> Result<Retrieved, AppError> {
        let row = store
            .get(entity, key)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("{} {}", entity.name, key_text(key))))?;
        let mut data = Serializer::to_representation(registry, store, entity, &row).await?;
        if let (Some(key), Value::Object(map)) = (entity.key_of(&row), &mut data) {
            let previous = Self::adjacent_key(store, entity, key, Comparison::Lt).await?;
            let next = Self::adjacent_key(store, entity, key, Comparison::Gt).await?;
            map.insert("previous_id".into(), previous);
            map.insert("next_id".into(), next);
        }
        Ok(Retrieved {
            data,
            schema: entity.json_schema(),
        })
    }

    /// Key of the closest record below (`Lt`) or above (`Gt`) `key` in key order, or null.
    async fn adjacent_key(
        store: &dyn EntityStore,
        entity: &EntityType,
        key: &Value,
        op: Comparison,
    ) -> Result<Value, AppError> {
        let order = SortOrder {
            field: entity.pk.clone(),
            descending: op == Comparison::Lt,
        };
        let rows = store
            .filter(
                entity,
                &Predicate::compare(entity.pk.clone(), op, key.clone()),
                Some(&order),
                Some(Page { offset: 0, limit: 1 }),
            )
            .await?;
        Ok(rows
            .first()
            .and_then(|r| entity.key_of(r))
            .cloned()
            .unwrap_or(Value::Null))
    }

    pub async fn create(
        registry: &SchemaRegistry,
        store: &dyn EntityStore,
        entity: &EntityType,
        payload: &Value,
        identity: &Identity,
    ) -> Result<Value, AppError> {
        let row = Serializer::create(registry, store, entity, payload, identity).await?;
        tracing::debug!(entity = %entity.name, key = %entity.key_of(&row).map(key_text).unwrap_or_default(), "created");
        Serializer::to_representation(registry, store, entity, &row).await
    }

    pub async fn update(
        registry: &SchemaRegistry,
        store: &dyn EntityStore,
        entity: &EntityType,
        key: &Value,
        payload: &Value,
        identity: &Identity,
    ) -> Result<Value, AppError> {
        let row = Serializer::update(registry, store, entity, key, payload, identity).await?;
        Serializer::to_representation(registry, store, entity, &row).await
    }

    /// Delete one record; `Protected` when other records still depend on it.
    pub async fn delete(store: &dyn EntityStore, entity: &EntityType, key: &Value) -> Result<(), AppError> {
        if store.get(entity, key).await?.is_none() {
            return Err(AppError::NotFound(format!("{} {}", entity.name, key_text(key))));
        }
        store.delete(entity, std::slice::from_ref(key)).await?;
        Ok(())
    }
}

fn parse_positive(raw: Option<&String>, name: &str) -> Result<Option<u64>, AppError> {
    let Some(raw) = raw.map(|s| s.trim()).filter(|s| !s.is_empty()) else {
        return Ok(None);
    };
    match raw.parse::<u64>() {
        Ok(n) if n >= 1 => Ok(Some(n)),
        _ => Err(AppError::BadRequest(format!("{} must be a positive integer", name))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::load_from_str;
    use crate::store::MemoryStore;
    use serde_json::json;
    use std::sync::Arc;

    fn params(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    async fn seeded() -> (Arc<SchemaRegistry>, MemoryStore) {
        let reg = Arc::new(
            load_from_str(
                r#"{ "entities": [ { "name": "City", "namespace": "geo", "display_field": "name", "fields": [
                    { "name": "id", "type": "serial", "primary_key": true },
                    { "name": "name", "type": "varchar", "nullable": false },
                    { "name": "country", "type": "varchar" },
                    { "name": "population", "type": "integer" }
                ] } ] }"#,
            )
            .unwrap(),
        );
        let store = MemoryStore::new(reg.clone());
        let city = reg.describe("City").unwrap();
        let anon = Identity::anonymous();
        for (name, country, pop) in [("Lyon", "FR", 500), ("Paris", "FR", 2100), ("Porto", "PT", 230)] {
            CrudService::create(&reg, &store, city, &json!({ "name": name, "country": country, "population": pop }), &anon)
                .await
                .unwrap();
        }
        (reg, store)
    }

    #[tokio::test]
    async fn list_filters_searches_orders_and_pages() {
        let (reg, store) = seeded().await;
        let city = reg.describe("City").unwrap();
        let page = CrudService::list(
            &reg,
            &store,
            Paging::default(),
            city,
            &params(&[("country", "FR"), ("ordering", "-population"), ("page_size", "1")]),
        )
        .await
        .unwrap();
        assert_eq!(page.count, 2);
        assert_eq!(page.next, Some(2));
        assert_eq!(page.previous, None);
        assert_eq!(page.metadata.total_pages, 2);
        assert_eq!(page.results[0]["name"], json!("Paris"));

        let page = CrudService::list(&reg, &store, Paging::default(), city, &params(&[("search", "PORT")]))
            .await
            .unwrap();
        assert_eq!(page.count, 1);
        assert_eq!(page.results[0]["display_name"], json!("Porto"));
    }

    #[tokio::test]
    async fn list_rejects_unknown_parameters_and_bad_pages() {
        let (reg, store) = seeded().await;
        let city = reg.describe("City").unwrap();
        assert!(matches!(
            CrudService::list(&reg, &store, Paging::default(), city, &params(&[("mayor", "x")])).await,
            Err(AppError::InvalidField { .. })
        ));
        assert!(matches!(
            CrudService::list(&reg, &store, Paging::default(), city, &params(&[("page", "0")])).await,
            Err(AppError::BadRequest(_))
        ));
        assert!(matches!(
            CrudService::list(&reg, &store, Paging::default(), city, &params(&[("page", "9")])).await,
            Err(AppError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn retrieve_attaches_schema_and_delete_removes() {
        let (reg, store) = seeded().await;
        let city = reg.describe("City").unwrap();
        let got = CrudService::retrieve(&reg, &store, city, &json!(1)).await.unwrap();
        assert_eq!(got.data["name"], json!("Lyon"));
        assert_eq!(got.schema["required"], json!(["name"]));
        CrudService::delete(&store, city, &json!(1)).await.unwrap();
        assert!(matches!(
            CrudService::retrieve(&reg, &store, city, &json!(1)).await,
            Err(AppError::NotFound(_))
        ));
        assert!(matches!(CrudService::delete(&store, city, &json!(1)).await, Err(AppError::NotFound(_))));
    }

    #[tokio::test]
    async fn retrieve_links_neighbouring_keys_across_gaps() {
        let (reg, store) = seeded().await;
        let city = reg.describe("City").unwrap();
        CrudService::delete(&store, city, &json!(2)).await.unwrap();

        let first = CrudService::retrieve(&reg, &store, city, &json!(1)).await.unwrap();
        assert_eq!(first.data["previous_id"], Value::Null);
        assert_eq!(first.data["next_id"], json!(3));
        let last = CrudService::retrieve(&reg, &store, city, &json!(3)).await.unwrap();
        assert_eq!(last.data["previous_id"], json!(1));
        assert_eq!(last.data["next_id"], Value::Null);
    }
}
