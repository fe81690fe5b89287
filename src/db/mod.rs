//! Database interface
//!
//! The engine talks to a document store through the [`Database`] trait:
//! table/index management for bootstrap, change-returning writes for the
//! CRUD operations, and id-plucking collection queries for views. Write
//! results mirror the driver wire shape (`errors` / `first_error` /
//! `changes`), with raw error strings classified by the error module.

pub mod memory;

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::{CrudError, Result};
use crate::schema::{IndexSpec, Resource};

pub use memory::MemoryDatabase;

/// One change produced by a write.
#[derive(Debug, Clone, Default)]
pub struct Change {
    /// Document state before the write.
    pub old_val: Option<Resource>,
    /// Document state after the write.
    pub new_val: Option<Resource>,
}

/// Outcome of a change-returning write.
#[derive(Debug, Clone, Default)]
pub struct WriteResult {
    /// Number of failed documents.
    pub errors: u64,
    /// Raw driver message for the first failure.
    pub first_error: Option<String>,
    /// Per-document changes.
    pub changes: Vec<Change>,
}

impl WriteResult {
    /// A successful single-document result.
    pub fn changed(old_val: Option<Resource>, new_val: Option<Resource>) -> Self {
        Self {
            errors: 0,
            first_error: None,
            changes: vec![Change { old_val, new_val }],
        }
    }

    /// A failed result carrying the raw driver message.
    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            errors: 1,
            first_error: Some(message.into()),
            changes: Vec::new(),
        }
    }

    /// Classify failures and unwrap the change list.
    pub fn into_changes(self) -> Result<Vec<Change>> {
        if self.errors > 0 {
            let message = self
                .first_error
                .unwrap_or_else(|| "Unknown database write failure".to_string());
            return Err(CrudError::from_database_message(&message));
        }
        Ok(self.changes)
    }
}

/// Predicate over a document.
pub type FilterPredicate = Arc<dyn Fn(&Resource) -> bool + Send + Sync>;

/// One filtering step of a collection query.
#[derive(Clone)]
pub enum FilterExpr {
    /// Field equals value.
    Eq(String, Value),
    /// Field differs from value.
    Ne(String, Value),
    /// Arbitrary caller-supplied predicate.
    Predicate(FilterPredicate),
}

impl std::fmt::Debug for FilterExpr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FilterExpr::Eq(field, value) => write!(f, "Eq({field}, {value})"),
            FilterExpr::Ne(field, value) => write!(f, "Ne({field}, {value})"),
            FilterExpr::Predicate(_) => write!(f, "Predicate(<fn>)"),
        }
    }
}

/// Ordering step of a collection query.
#[derive(Debug, Clone)]
pub struct OrderBy {
    /// Field to order on.
    pub field: String,
    /// Reverse the natural ascending order.
    pub descending: bool,
}

/// A composable collection query: the value view transforms operate on.
#[derive(Debug, Clone)]
pub struct ViewQuery {
    /// Source table.
    pub table: String,
    /// Filtering steps, applied in order.
    pub filters: Vec<FilterExpr>,
    /// Optional ordering.
    pub order_by: Option<OrderBy>,
    /// Rows to skip.
    pub offset: Option<u64>,
    /// Maximum rows to return.
    pub limit: Option<u64>,
}

impl ViewQuery {
    /// A query over the whole table in natural id order.
    pub fn table(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            filters: Vec::new(),
            order_by: None,
            offset: None,
            limit: None,
        }
    }

    /// Keep rows where `field` equals `value`.
    pub fn filter_eq(mut self, field: impl Into<String>, value: Value) -> Self {
        self.filters.push(FilterExpr::Eq(field.into(), value));
        self
    }

    /// Keep rows where `field` differs from `value`.
    pub fn filter_ne(mut self, field: impl Into<String>, value: Value) -> Self {
        self.filters.push(FilterExpr::Ne(field.into(), value));
        self
    }

    /// Keep rows matching an arbitrary predicate.
    pub fn filter(mut self, predicate: FilterPredicate) -> Self {
        self.filters.push(FilterExpr::Predicate(predicate));
        self
    }

    /// Order by `field` ascending.
    pub fn order_by(mut self, field: impl Into<String>) -> Self {
        self.order_by = Some(OrderBy {
            field: field.into(),
            descending: false,
        });
        self
    }

    /// Order by `field` descending.
    pub fn order_by_desc(mut self, field: impl Into<String>) -> Self {
        self.order_by = Some(OrderBy {
            field: field.into(),
            descending: true,
        });
        self
    }

    /// Skip the first `offset` rows.
    pub fn skip(mut self, offset: u64) -> Self {
        self.offset = Some(offset);
        self
    }

    /// Return at most `limit` rows.
    pub fn take(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// A document store with change-returning writes.
#[async_trait]
pub trait Database: Send + Sync {
    /// Create the target database if it does not exist.
    async fn ensure_database(&self) -> Result<()>;

    /// List existing tables.
    async fn table_list(&self) -> Result<Vec<String>>;

    /// Create a table.
    async fn table_create(&self, table: &str) -> Result<()>;

    /// List secondary indexes on a table.
    async fn index_list(&self, table: &str) -> Result<Vec<String>>;

    /// Create a secondary index. Compound and functional indexes receive
    /// their full spec so the driver can use native helpers.
    async fn index_create(&self, table: &str, index: &IndexSpec) -> Result<()>;

    /// Drop a secondary index.
    async fn index_drop(&self, table: &str, name: &str) -> Result<()>;

    /// Fetch one document by id.
    async fn get(&self, table: &str, id: &str) -> Result<Option<Resource>>;

    /// Insert a document, returning changes.
    async fn insert(&self, table: &str, value: Resource) -> Result<WriteResult>;

    /// Merge fields into a document, returning changes.
    async fn update(&self, table: &str, id: &str, value: Resource) -> Result<WriteResult>;

    /// Replace a document wholesale, returning changes.
    async fn replace(&self, table: &str, id: &str, value: Resource) -> Result<WriteResult>;

    /// Delete a document, returning changes.
    async fn delete(&self, table: &str, id: &str) -> Result<WriteResult>;

    /// Run a collection query plucking only ids.
    async fn query_ids(&self, query: &ViewQuery) -> Result<Vec<String>>;

    /// Count the rows a collection query matches, ignoring slicing.
    async fn query_count(&self, query: &ViewQuery) -> Result<u64>;
}
