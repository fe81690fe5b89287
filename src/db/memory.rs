//! In-memory document store
//!
//! Embedded [`Database`] backend: BTree tables keyed by document id, with
//! the same change-returning write semantics and error message shapes as
//! the production driver. Used for stand-alone operation and throughout the
//! test suite.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use uuid::Uuid;

use super::{Database, FilterExpr, ViewQuery, WriteResult};
use crate::error::{CrudError, Result};
use crate::schema::{IndexSpec, Resource};

/// In-memory document tables.
#[derive(Default)]
pub struct MemoryDatabase {
    tables: DashMap<String, BTreeMap<String, Resource>>,
    indexes: DashMap<String, Vec<String>>,
}

impl MemoryDatabase {
    /// An empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of documents in `table`.
    pub fn len(&self, table: &str) -> usize {
        self.tables.get(table).map(|t| t.len()).unwrap_or(0)
    }

    /// Whether `table` holds no documents.
    pub fn is_empty(&self, table: &str) -> bool {
        self.len(table) == 0
    }

    fn run_query(&self, query: &ViewQuery) -> Vec<Resource> {
        let Some(table) = self.tables.get(&query.table) else {
            return Vec::new();
        };
        let mut rows: Vec<Resource> = table
            .values()
            .filter(|row| matches_filters(row, &query.filters))
            .cloned()
            .collect();
        if let Some(order) = &query.order_by {
            rows.sort_by(|a, b| {
                let ordering = compare_values(
                    a.get(&order.field).unwrap_or(&Value::Null),
                    b.get(&order.field).unwrap_or(&Value::Null),
                );
                if order.descending {
                    ordering.reverse()
                } else {
                    ordering
                }
            });
        }
        rows
    }
}

fn matches_filters(row: &Resource, filters: &[FilterExpr]) -> bool {
    filters.iter().all(|filter| match filter {
        FilterExpr::Eq(field, value) => row.get(field).unwrap_or(&Value::Null) == value,
        FilterExpr::Ne(field, value) => row.get(field).unwrap_or(&Value::Null) != value,
        FilterExpr::Predicate(predicate) => predicate(row),
    })
}

fn type_rank(value: &Value) -> u8 {
    match value {
        Value::Null => 0,
        Value::Bool(_) => 1,
        Value::Number(_) => 2,
        Value::String(_) => 3,
        Value::Array(_) => 4,
        Value::Object(_) => 5,
    }
}

fn compare_values(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x
            .as_f64()
            .partial_cmp(&y.as_f64())
            .unwrap_or(Ordering::Equal),
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        _ => type_rank(a).cmp(&type_rank(b)),
    }
}

fn document_id(value: &Resource) -> Option<String> {
    value.get("id").and_then(Value::as_str).map(str::to_string)
}

fn not_found_message() -> String {
    "The query did not find a document and returned null".to_string()
}

#[async_trait]
impl Database for MemoryDatabase {
    async fn ensure_database(&self) -> Result<()> {
        Ok(())
    }

    async fn table_list(&self) -> Result<Vec<String>> {
        Ok(self.tables.iter().map(|t| t.key().clone()).collect())
    }

    async fn table_create(&self, table: &str) -> Result<()> {
        self.tables.entry(table.to_string()).or_default();
        self.indexes.entry(table.to_string()).or_default();
        Ok(())
    }

    async fn index_list(&self, table: &str) -> Result<Vec<String>> {
        Ok(self
            .indexes
            .get(table)
            .map(|names| names.clone())
            .unwrap_or_default())
    }

    async fn index_create(&self, table: &str, index: &IndexSpec) -> Result<()> {
        let mut names = self.indexes.entry(table.to_string()).or_default();
        if names.iter().any(|n| n == &index.name) {
            return Err(CrudError::Database(format!(
                "Index `{}` already exists on table `{table}`",
                index.name
            )));
        }
        names.push(index.name.clone());
        Ok(())
    }

    async fn index_drop(&self, table: &str, name: &str) -> Result<()> {
        if let Some(mut names) = self.indexes.get_mut(table) {
            names.retain(|n| n != name);
        }
        Ok(())
    }

    async fn get(&self, table: &str, id: &str) -> Result<Option<Resource>> {
        Ok(self
            .tables
            .get(table)
            .and_then(|t| t.get(id).cloned()))
    }

    async fn insert(&self, table: &str, mut value: Resource) -> Result<WriteResult> {
        let id = match document_id(&value) {
            Some(id) => id,
            None => {
                let id = Uuid::new_v4().to_string();
                value.insert("id".to_string(), Value::String(id.clone()));
                id
            }
        };
        let mut rows = self.tables.entry(table.to_string()).or_default();
        if rows.contains_key(&id) {
            return Ok(WriteResult::failed(format!(
                "Duplicate primary key `{id}` in table \"{table}\": the document already exists"
            )));
        }
        rows.insert(id, value.clone());
        Ok(WriteResult::changed(None, Some(value)))
    }

    async fn update(&self, table: &str, id: &str, value: Resource) -> Result<WriteResult> {
        let mut rows = self.tables.entry(table.to_string()).or_default();
        let Some(existing) = rows.get_mut(id) else {
            return Ok(WriteResult::failed(not_found_message()));
        };
        let old = existing.clone();
        for (field, field_value) in value {
            existing.insert(field, field_value);
        }
        Ok(WriteResult::changed(Some(old), Some(existing.clone())))
    }

    async fn replace(&self, table: &str, id: &str, value: Resource) -> Result<WriteResult> {
        let mut rows = self.tables.entry(table.to_string()).or_default();
        let Some(existing) = rows.get_mut(id) else {
            return Ok(WriteResult::failed(not_found_message()));
        };
        let old = existing.clone();
        *existing = value.clone();
        Ok(WriteResult::changed(Some(old), Some(value)))
    }

    async fn delete(&self, table: &str, id: &str) -> Result<WriteResult> {
        let mut rows = self.tables.entry(table.to_string()).or_default();
        match rows.remove(id) {
            Some(old) => Ok(WriteResult::changed(Some(old), None)),
            None => Ok(WriteResult::failed(not_found_message())),
        }
    }

    async fn query_ids(&self, query: &ViewQuery) -> Result<Vec<String>> {
        let rows = self.run_query(query);
        let offset = query.offset.unwrap_or(0) as usize;
        let limit = query.limit.map(|l| l as usize).unwrap_or(usize::MAX);
        Ok(rows
            .into_iter()
            .skip(offset)
            .take(limit)
            .filter_map(|row| document_id(&row))
            .collect())
    }

    async fn query_count(&self, query: &ViewQuery) -> Result<u64> {
        Ok(self.run_query(query).len() as u64)
    }
}
