//! PostgREST-style row access and storage-API uploads over `reqwest`.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde_json::Value;
use shared::error::{ApiError, ErrorCode};
use tokio::sync::mpsc;
use tracing::debug;

use crate::{
    backend::{Filter, ObjectStorage, RelationalStore, SelectQuery, TransferProgress, UploadOptions},
    config::Settings,
    error::StorageError,
};

const UPLOAD_CHUNK_BYTES: usize = 64 * 1024;

#[derive(Clone)]
struct Credentials {
    api_key: String,
    access_token: Option<String>,
}

impl Credentials {
    fn apply(&self, request: RequestBuilder) -> RequestBuilder {
        let bearer = self.access_token.as_deref().unwrap_or(&self.api_key);
        request
            .header("apikey", &self.api_key)
            .bearer_auth(bearer)
    }
}

pub struct RestStore {
    http: Client,
    base_url: String,
    credentials: Credentials,
}

impl RestStore {
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        access_token: Option<String>,
    ) -> Self {
        Self {
            http: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            credentials: Credentials {
                api_key: api_key.into(),
                access_token,
            },
        }
    }

    pub fn from_settings(settings: &Settings) -> Self {
        Self::new(
            &settings.backend_url,
            &settings.api_key,
            settings.access_token.clone(),
        )
    }

    fn table_url(&self, table: &str) -> String {
        format!("{}/rest/v1/{table}", self.base_url)
    }
}

/// Renders filters as PostgREST query pairs.
pub fn filter_query(filters: &[Filter]) -> Vec<(String, String)> {
    filters
        .iter()
        .map(|filter| match filter {
            Filter::Eq { column, value } => (column.clone(), format!("eq.{value}")),
            Filter::IsNull { column } => (column.clone(), "is.null".to_string()),
            Filter::Any(groups) => ("or".to_string(), format!("({})", render_groups(groups))),
        })
        .collect()
}

fn render_groups(groups: &[Vec<Filter>]) -> String {
    groups
        .iter()
        .map(|group| match group.as_slice() {
            [single] => render_inline(single),
            many => format!(
                "and({})",
                many.iter().map(render_inline).collect::<Vec<_>>().join(",")
            ),
        })
        .collect::<Vec<_>>()
        .join(",")
}

fn render_inline(filter: &Filter) -> String {
    match filter {
        Filter::Eq { column, value } => format!("{column}.eq.{value}"),
        Filter::IsNull { column } => format!("{column}.is.null"),
        Filter::Any(groups) => format!("or({})", render_groups(groups)),
    }
}

async fn api_error(response: Response) -> anyhow::Error {
    let status = response.status().as_u16();
    let body = response.text().await.unwrap_or_default();
    ApiError::from_body(status, &body).into()
}

#[async_trait]
impl RelationalStore for RestStore {
    async fn select(&self, query: &SelectQuery) -> Result<Vec<Value>> {
        let mut params = vec![("select".to_string(), query.columns.clone())];
        params.extend(filter_query(&query.filters));
        if let Some(order) = &query.order {
            let direction = if order.ascending { "asc" } else { "desc" };
            params.push(("order".to_string(), format!("{}.{direction}", order.column)));
        }
        if let Some(limit) = query.limit {
            params.push(("limit".to_string(), limit.to_string()));
        }

        let response = self
            .credentials
            .apply(self.http.get(self.table_url(&query.table)))
            .query(&params)
            .send()
            .await
            .with_context(|| format!("select from {} failed", query.table))?;
        if !response.status().is_success() {
            return Err(api_error(response).await);
        }
        Ok(response.json().await?)
    }

    async fn insert(&self, table: &str, row: Value) -> Result<Value> {
        let response = self
            .credentials
            .apply(self.http.post(self.table_url(table)))
            .header("Prefer", "return=representation")
            .json(&row)
            .send()
            .await
            .with_context(|| format!("insert into {table} failed"))?;
        if !response.status().is_success() {
            return Err(api_error(response).await);
        }
        let rows: Vec<Value> = response.json().await?;
        rows.into_iter()
            .next()
            .ok_or_else(|| anyhow!("insert into {table} returned no row"))
    }

    async fn update(&self, table: &str, filters: &[Filter], patch: Value) -> Result<Vec<Value>> {
        let response = self
            .credentials
            .apply(self.http.patch(self.table_url(table)))
            .header("Prefer", "return=representation")
            .query(&filter_query(filters))
            .json(&patch)
            .send()
            .await
            .with_context(|| format!("update of {table} failed"))?;
        if !response.status().is_success() {
            return Err(api_error(response).await);
        }
        Ok(response.json().await?)
    }

    async fn rpc(&self, function: &str, args: Value) -> Result<Value> {
        let response = self
            .credentials
            .apply(
                self.http
                    .post(format!("{}/rest/v1/rpc/{function}", self.base_url)),
            )
            .json(&args)
            .send()
            .await
            .with_context(|| format!("rpc {function} failed"))?;
        if !response.status().is_success() {
            return Err(api_error(response).await);
        }
        Ok(response.json().await?)
    }
}

pub struct HttpObjectStorage {
    http: Client,
    base_url: String,
    credentials: Credentials,
    chunk_bytes: usize,
}

impl HttpObjectStorage {
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        access_token: Option<String>,
    ) -> Self {
        Self {
            http: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            credentials: Credentials {
                api_key: api_key.into(),
                access_token,
            },
            chunk_bytes: UPLOAD_CHUNK_BYTES,
        }
    }

    pub fn from_settings(settings: &Settings) -> Self {
        Self::new(
            &settings.backend_url,
            &settings.api_key,
            settings.access_token.clone(),
        )
    }

    pub fn with_chunk_bytes(mut self, chunk_bytes: usize) -> Self {
        self.chunk_bytes = chunk_bytes.max(1);
        self
    }
}

/// Maps a failed storage response onto the retry classes.
pub fn classify_storage_failure(status: StatusCode, body: &str, size: u64) -> StorageError {
    let ApiError { code, message, .. } = ApiError::from_body(status.as_u16(), body);
    let lowered = message.to_ascii_lowercase();
    if lowered.contains("row-level security") {
        return StorageError::PermissionDenied(message);
    }
    if lowered.contains("maximum allowed size") {
        return StorageError::PayloadTooLarge { size };
    }
    match code {
        ErrorCode::Unauthorized | ErrorCode::Forbidden => StorageError::PermissionDenied(message),
        ErrorCode::PayloadTooLarge => StorageError::PayloadTooLarge { size },
        // A missing bucket is worth trying again and then falling back.
        code if code.is_transient() || code == ErrorCode::NotFound => {
            StorageError::Transfer(format!("HTTP {}: {message}", status.as_u16()))
        }
        _ => StorageError::Rejected(message),
    }
}

#[async_trait]
impl ObjectStorage for HttpObjectStorage {
    async fn upload(
        &self,
        bucket: &str,
        path: &str,
        body: Bytes,
        options: &UploadOptions,
        progress: &TransferProgress<'_>,
    ) -> Result<(), StorageError> {
        let total = body.len() as u64;
        let chunks: Vec<Bytes> = (0..body.len())
            .step_by(self.chunk_bytes)
            .map(|start| body.slice(start..(start + self.chunk_bytes).min(body.len())))
            .collect();

        let (sent_tx, mut sent_rx) = mpsc::unbounded_channel::<u64>();
        let mut sent = 0u64;
        let stream = futures::stream::iter(chunks.into_iter().map(move |chunk| {
            sent += chunk.len() as u64;
            let _ = sent_tx.send(sent);
            Ok::<Bytes, std::io::Error>(chunk)
        }));

        let request = self
            .credentials
            .apply(
                self.http
                    .post(format!("{}/storage/v1/object/{bucket}/{path}", self.base_url)),
            )
            .header("Content-Type", &options.content_type)
            .header("Cache-Control", format!("max-age={}", options.cache_control_secs))
            .header("x-upsert", options.upsert.to_string())
            .body(reqwest::Body::wrap_stream(stream))
            .send();
        tokio::pin!(request);

        let outcome = loop {
            tokio::select! {
                outcome = &mut request => break outcome,
                Some(sent) = sent_rx.recv() => progress(sent, total),
            }
        };
        while let Ok(sent) = sent_rx.try_recv() {
            progress(sent, total);
        }

        let response = outcome.map_err(|err| StorageError::Transfer(err.to_string()))?;
        let status = response.status();
        if status.is_success() {
            debug!(bucket, path, bytes = total, "storage: object stored");
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        Err(classify_storage_failure(status, &body, total))
    }

    fn public_url(&self, bucket: &str, path: &str) -> String {
        format!("{}/storage/v1/object/public/{bucket}/{path}", self.base_url)
    }
}

#[cfg(test)]
#[path = "tests/rest_tests.rs"]
mod tests;
