//! Bulk writes into Elasticsearch
//!
//! Each batch is one `_bulk` request of `index` actions keyed by content
//! id, so delivering the same batch twice leaves the index unchanged.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::error::{EtlError, EtlResult};
use crate::models::SearchDocument;
use crate::retry::RetryPolicy;

/// Outcome of one bulk delivery.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadReport {
    pub indexed: usize,
    /// Documents the engine rejected on their own merits (mapping errors
    /// and the like). Retrying would not help.
    pub failed: usize,
}

/// Destination for transformed documents.
#[async_trait]
pub trait Loader: Send + Sync {
    async fn load(&self, documents: &[SearchDocument]) -> EtlResult<LoadReport>;
}

/// Field mapping applied when the index is created.
pub fn index_mapping() -> Value {
    json!({
        "settings": {
            "refresh_interval": "1s",
            "analysis": {
                "analyzer": {
                    "ru_en": {
                        "tokenizer": "standard",
                        "filter": ["lowercase"]
                    }
                }
            }
        },
        "mappings": {
            "dynamic": "strict",
            "properties": {
                "id": { "type": "keyword" },
                "title": {
                    "type": "text",
                    "analyzer": "ru_en",
                    "fields": { "raw": { "type": "keyword" } }
                },
                "description": { "type": "text", "analyzer": "ru_en" },
                "h1": { "type": "text", "analyzer": "ru_en" }
            }
        }
    })
}

#[derive(Debug, Deserialize)]
struct BulkResponse {
    #[serde(default)]
    errors: bool,
    #[serde(default)]
    items: Vec<BulkItem>,
}

#[derive(Debug, Deserialize)]
struct BulkItem {
    index: Option<BulkItemResult>,
}

#[derive(Debug, Deserialize)]
struct BulkItemResult {
    #[serde(rename = "_id")]
    id: Option<String>,
    status: u16,
    error: Option<Value>,
}

/// Writes documents through the `_bulk` API.
#[derive(Debug, Clone)]
pub struct ElasticsearchLoader {
    client: Client,
    address: String,
    index: String,
    retry: RetryPolicy,
}

impl ElasticsearchLoader {
    pub fn new(address: impl Into<String>, index: impl Into<String>, timeout: Duration, retry: RetryPolicy) -> EtlResult<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            address: address.into().trim_end_matches('/').to_string(),
            index: index.into(),
            retry,
        })
    }

    pub fn index(&self) -> &str {
        &self.index
    }

    /// Create the index with [`index_mapping`] unless it already exists.
    ///
    /// Returns whether the index was created.
    pub async fn ensure_index(&self) -> EtlResult<bool> {
        self.retry.run("ensure index", || self.try_ensure_index()).await
    }

    async fn try_ensure_index(&self) -> EtlResult<bool> {
        let url = format!("{}/{}", self.address, self.index);

        let head = self.client.head(&url).send().await?;
        match head.status() {
            StatusCode::OK => return Ok(false),
            StatusCode::NOT_FOUND => {},
            status => return Err(index_error(status, String::new())),
        }

        let response = self.client.put(&url).json(&index_mapping()).send().await?;
        let status = response.status();
        if status.is_success() {
            info!(index = %self.index, "Created search index");
            return Ok(true);
        }

        let body = response.text().await.unwrap_or_default();
        // Another instance may have won the race.
        if status == StatusCode::BAD_REQUEST && body.contains("resource_already_exists_exception") {
            return Ok(false);
        }
        Err(index_error(status, body))
    }

    async fn send_bulk(&self, body: &str, count: usize) -> EtlResult<LoadReport> {
        let response = self
            .client
            .post(format!("{}/_bulk", self.address))
            .header(reqwest::header::CONTENT_TYPE, "application/x-ndjson")
            .body(body.to_owned())
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(index_error(status, text));
        }

        let reply: BulkResponse = response.json().await?;
        if !reply.errors {
            return Ok(LoadReport { indexed: count, failed: 0 });
        }

        let results: Vec<&BulkItemResult> = reply.items.iter().filter_map(|i| i.index.as_ref()).collect();

        // Back-pressure on individual items: resend the whole batch, which
        // is safe because every action is an overwrite by id.
        if let Some(rejected) = results.iter().find(|r| r.status == StatusCode::TOO_MANY_REQUESTS.as_u16()) {
            return Err(EtlError::Index {
                status: rejected.status,
                message: "bulk item rejected by engine back-pressure".to_string(),
            });
        }

        let mut report = LoadReport::default();
        for result in results {
            if result.status < 300 && result.error.is_none() {
                report.indexed += 1;
            } else {
                report.failed += 1;
                warn!(
                    id = result.id.as_deref().unwrap_or("?"),
                    status = result.status,
                    error = %result.error.as_ref().map(|e| e.to_string()).unwrap_or_default(),
                    "Document rejected by search index"
                );
            }
        }
        Ok(report)
    }
}

fn index_error(status: StatusCode, body: String) -> EtlError {
    EtlError::Index {
        status: status.as_u16(),
        message: if body.is_empty() {
            status.canonical_reason().unwrap_or("unknown").to_string()
        } else {
            body
        },
    }
}

/// Encode `documents` as `_bulk` NDJSON: an action line followed by the
/// source line for each document, newline terminated.
pub fn bulk_body(documents: &[SearchDocument]) -> EtlResult<String> {
    let mut body = String::new();
    for doc in documents {
        let action = json!({ "index": { "_index": doc.index, "_id": doc.id } });
        body.push_str(&serde_json::to_string(&action)?);
        body.push('\n');
        body.push_str(&serde_json::to_string(&doc.source)?);
        body.push('\n');
    }
    Ok(body)
}

#[async_trait]
impl Loader for ElasticsearchLoader {
    async fn load(&self, documents: &[SearchDocument]) -> EtlResult<LoadReport> {
        if documents.is_empty() {
            return Ok(LoadReport::default());
        }

        let body = bulk_body(documents)?;
        let report = self
            .retry
            .run("bulk index", || self.send_bulk(&body, documents.len()))
            .await?;

        debug!(indexed = report.indexed, failed = report.failed, "Bulk load complete");
        Ok(report)
    }
}
