//! Seams to the hosted backend: identity, relational rows, object storage.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use bytes::Bytes;
use serde_json::Value;
use shared::domain::UserId;

use crate::error::StorageError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CurrentUser {
    pub id: UserId,
    pub display_name: String,
    pub avatar_url: Option<String>,
}

impl CurrentUser {
    pub fn new(id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            id: UserId::new(id),
            display_name: display_name.into(),
            avatar_url: None,
        }
    }
}

pub trait IdentityProvider: Send + Sync {
    fn current_user(&self) -> Option<CurrentUser>;
}

pub struct StaticIdentity(Option<CurrentUser>);

impl StaticIdentity {
    pub fn signed_in(user: CurrentUser) -> Self {
        Self(Some(user))
    }

    pub fn signed_out() -> Self {
        Self(None)
    }
}

impl IdentityProvider for StaticIdentity {
    fn current_user(&self) -> Option<CurrentUser> {
        self.0.clone()
    }
}

/// Row filter. `Any` is a disjunction of conjunctions.
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    Eq { column: String, value: String },
    IsNull { column: String },
    Any(Vec<Vec<Filter>>),
}

impl Filter {
    pub fn eq(column: impl Into<String>, value: impl ToString) -> Self {
        Filter::Eq {
            column: column.into(),
            value: value.to_string(),
        }
    }

    pub fn is_null(column: impl Into<String>) -> Self {
        Filter::IsNull {
            column: column.into(),
        }
    }

    pub fn matches(&self, row: &Value) -> bool {
        match self {
            Filter::Eq { column, value } => column_text(row, column).as_deref() == Some(value),
            Filter::IsNull { column } => row.get(column).map_or(true, Value::is_null),
            Filter::Any(groups) => groups
                .iter()
                .any(|group| group.iter().all(|filter| filter.matches(row))),
        }
    }
}

fn column_text(row: &Value, column: &str) -> Option<String> {
    match row.get(column)? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderBy {
    pub column: String,
    pub ascending: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SelectQuery {
    pub table: String,
    pub columns: String,
    pub filters: Vec<Filter>,
    pub order: Option<OrderBy>,
    pub limit: Option<u32>,
}

impl SelectQuery {
    pub fn from(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            columns: "*".into(),
            filters: Vec::new(),
            order: None,
            limit: None,
        }
    }

    pub fn columns(mut self, columns: impl Into<String>) -> Self {
        self.columns = columns.into();
        self
    }

    pub fn filter(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn order_by(mut self, column: impl Into<String>, ascending: bool) -> Self {
        self.order = Some(OrderBy {
            column: column.into(),
            ascending,
        });
        self
    }

    pub fn limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn matches(&self, row: &Value) -> bool {
        self.filters.iter().all(|filter| filter.matches(row))
    }
}

#[async_trait]
pub trait RelationalStore: Send + Sync {
    async fn select(&self, query: &SelectQuery) -> Result<Vec<Value>>;
    /// Inserts one row and returns it as stored.
    async fn insert(&self, table: &str, row: Value) -> Result<Value>;
    /// Patches every row matching `filters` and returns the updated rows.
    async fn update(&self, table: &str, filters: &[Filter], patch: Value) -> Result<Vec<Value>>;
    async fn rpc(&self, function: &str, args: Value) -> Result<Value>;
}

pub struct MissingRelationalStore;

#[async_trait]
impl RelationalStore for MissingRelationalStore {
    async fn select(&self, query: &SelectQuery) -> Result<Vec<Value>> {
        Err(anyhow!(
            "relational store is not configured (select from {})",
            query.table
        ))
    }

    async fn insert(&self, table: &str, _row: Value) -> Result<Value> {
        Err(anyhow!("relational store is not configured (insert into {table})"))
    }

    async fn update(&self, table: &str, _filters: &[Filter], _patch: Value) -> Result<Vec<Value>> {
        Err(anyhow!("relational store is not configured (update {table})"))
    }

    async fn rpc(&self, function: &str, _args: Value) -> Result<Value> {
        Err(anyhow!("relational store is not configured (rpc {function})"))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadOptions {
    pub content_type: String,
    pub cache_control_secs: u32,
    pub upsert: bool,
}

impl UploadOptions {
    pub fn new(content_type: impl Into<String>) -> Self {
        Self {
            content_type: content_type.into(),
            cache_control_secs: 3600,
            upsert: false,
        }
    }
}

/// Byte-level progress: `(sent, total)`.
pub type TransferProgress<'a> = dyn Fn(u64, u64) + Send + Sync + 'a;

#[async_trait]
pub trait ObjectStorage: Send + Sync {
    async fn upload(
        &self,
        bucket: &str,
        path: &str,
        body: Bytes,
        options: &UploadOptions,
        progress: &TransferProgress<'_>,
    ) -> Result<(), StorageError>;

    fn public_url(&self, bucket: &str, path: &str) -> String;
}

pub struct MissingObjectStorage;

#[async_trait]
impl ObjectStorage for MissingObjectStorage {
    async fn upload(
        &self,
        bucket: &str,
        _path: &str,
        _body: Bytes,
        _options: &UploadOptions,
        _progress: &TransferProgress<'_>,
    ) -> Result<(), StorageError> {
        Err(StorageError::Rejected(format!(
            "object storage is not configured (bucket {bucket})"
        )))
    }

    fn public_url(&self, bucket: &str, path: &str) -> String {
        format!("unconfigured://{bucket}/{path}")
    }
}

#[cfg(test)]
#[path = "tests/backend_tests.rs"]
mod tests;
