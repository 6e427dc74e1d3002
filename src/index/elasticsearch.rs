//! Elasticsearch-backed document store over the REST API.
//!
//! Writes go through `_bulk` with explicit ids. Creates use the `create`
//! action so a replayed document answers 409 instead of overwriting the
//! derived counters already on it; 409 is reported as `Exists`.

use crate::config::IndexConfig;
use crate::error::{IngestError, Result};
use crate::index::{
    BulkResponse, CounterDelta, Document, DocumentStore, ItemOutcome, ItemStatus, PageToken,
};
use futures::future::BoxFuture;
use reqwest::{Client, RequestBuilder};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use tracing::debug;

const COUNTER_SCRIPT: &str = "if (ctx._source[params.field] == null) { ctx._source[params.field] = params.delta } else { ctx._source[params.field] += params.delta }";

#[derive(Debug, Clone)]
pub struct ElasticsearchStore {
    client: Client,
    base_url: String,
    credentials: Option<(String, Option<String>)>,
}

impl ElasticsearchStore {
    pub fn new(config: &IndexConfig) -> Result<Self> {
        let base_url = config
            .url
            .as_deref()
            .filter(|u| !u.trim().is_empty())
            .ok_or_else(|| IngestError::FatalConfig("index url must not be empty".to_string()))?
            .trim_end_matches('/')
            .to_string();
        let client = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| IngestError::FatalConfig(format!("http client build failed: {}", e)))?;
        Ok(ElasticsearchStore {
            client,
            base_url,
            credentials: config
                .username
                .clone()
                .map(|user| (user, config.password.clone())),
        })
    }

    fn post(&self, path: &str) -> RequestBuilder {
        let request = self.client.post(format!("{}/{}", self.base_url, path));
        match &self.credentials {
            Some((user, password)) => request.basic_auth(user, password.as_ref()),
            None => request,
        }
    }

    async fn send<T: for<'de> Deserialize<'de>>(&self, request: RequestBuilder, what: &str) -> Result<T> {
        let response = request
            .send()
            .await
            .map_err(|e| IngestError::TransientIo(format!("{} request failed: {}", what, e)))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(IngestError::TransientIo(format!(
                "{} returned status {}: {}",
                what,
                status,
                truncate(&body, 512)
            )));
        }
        response
            .json()
            .await
            .map_err(|e| IngestError::TransientIo(format!("{} decode failed: {}", what, e)))
    }

    async fn bulk(&self, action: &'static str, lines: Vec<String>, what: &str) -> Result<BulkResponse> {
        if lines.is_empty() {
            return Ok(BulkResponse::default());
        }
        let mut body = lines.join("\n");
        body.push('\n');
        let request = self
            .post("_bulk")
            .header("Content-Type", "application/x-ndjson")
            .body(body);
        let wire: WireBulkResponse = self.send(request, what).await?;
        debug!(op = what, items = wire.items.len(), errors = wire.errors, "bulk response");
        Ok(BulkResponse {
            items: wire
                .items
                .into_iter()
                .filter_map(|mut item| item.remove(action))
                .map(|item| item.into_outcome(action))
                .collect(),
        })
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

fn action_line(action: &str, index: &str, id: &str) -> String {
    let mut line = serde_json::Map::new();
    line.insert(action.to_string(), json!({ "_index": index, "_id": id }));
    Value::Object(line).to_string()
}

#[derive(Debug, Serialize, Deserialize)]
struct WireSource {
    uri: String,
    author_did: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    subject_uri: Option<String>,
    time_us: i64,
    #[serde(default)]
    record: Value,
}

impl From<Document> for WireSource {
    fn from(doc: Document) -> Self {
        WireSource {
            uri: doc.id,
            author_did: doc.author_id,
            subject_uri: doc.subject_id,
            time_us: doc.time_us,
            record: doc.body,
        }
    }
}

impl WireSource {
    fn into_document(self, id: String) -> Document {
        Document {
            id,
            author_id: self.author_did,
            subject_id: self.subject_uri,
            time_us: self.time_us,
            body: self.record,
        }
    }
}

#[derive(Debug, Deserialize)]
struct WireBulkResponse {
    #[serde(default)]
    errors: bool,
    items: Vec<HashMap<String, WireBulkItem>>,
}

#[derive(Debug, Deserialize)]
struct WireBulkItem {
    #[serde(rename = "_id")]
    id: String,
    status: u16,
    #[serde(default)]
    error: Option<Value>,
}

impl WireBulkItem {
    fn into_outcome(self, action: &str) -> ItemOutcome {
        let status = match self.status {
            200..=299 => ItemStatus::Ok,
            409 if action == "create" => ItemStatus::Exists,
            404 => ItemStatus::NotFound,
            code => ItemStatus::Failed(
                self.error
                    .as_ref()
                    .and_then(|e| e.get("reason"))
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .unwrap_or_else(|| format!("status {}", code)),
            ),
        };
        ItemOutcome {
            id: self.id,
            status,
        }
    }
}

#[derive(Debug, Deserialize)]
struct WireMgetResponse {
    docs: Vec<WireHit>,
}

#[derive(Debug, Deserialize)]
struct WireHit {
    #[serde(rename = "_id")]
    id: String,
    #[serde(default = "found_default")]
    found: bool,
    #[serde(rename = "_source", default)]
    source: Option<WireSource>,
}

fn found_default() -> bool {
    true
}

impl WireHit {
    fn into_document(self) -> Option<Document> {
        if !self.found {
            return None;
        }
        let id = self.id;
        self.source.map(|s| s.into_document(id))
    }
}

#[derive(Debug, Deserialize)]
struct WireSearchResponse {
    hits: WireHits,
}

#[derive(Debug, Deserialize)]
struct WireHits {
    hits: Vec<WireHit>,
}

impl DocumentStore for ElasticsearchStore {
    fn bulk_create<'a>(
        &'a self,
        index: &'a str,
        docs: Vec<Document>,
    ) -> BoxFuture<'a, Result<BulkResponse>> {
        Box::pin(async move {
            let mut lines = Vec::with_capacity(docs.len() * 2);
            for doc in docs {
                lines.push(action_line("create", index, &doc.id));
                lines.push(serde_json::to_string(&WireSource::from(doc))?);
            }
            self.bulk("create", lines, "bulk create").await
        })
    }

    fn bulk_delete<'a>(
        &'a self,
        index: &'a str,
        ids: Vec<String>,
    ) -> BoxFuture<'a, Result<BulkResponse>> {
        Box::pin(async move {
            let lines = ids
                .iter()
                .map(|id| action_line("delete", index, id))
                .collect();
            self.bulk("delete", lines, "bulk delete").await
        })
    }

    fn bulk_update_counter<'a>(
        &'a self,
        index: &'a str,
        deltas: Vec<CounterDelta>,
    ) -> BoxFuture<'a, Result<BulkResponse>> {
        Box::pin(async move {
            let mut lines = Vec::with_capacity(deltas.len() * 2);
            for delta in deltas {
                lines.push(action_line("update", index, &delta.id));
                lines.push(
                    json!({
                        "script": {
                            "source": COUNTER_SCRIPT,
                            "lang": "painless",
                            "params": { "field": delta.field, "delta": delta.delta }
                        }
                    })
                    .to_string(),
                );
            }
            self.bulk("update", lines, "bulk counter update").await
        })
    }

    fn multi_get<'a>(
        &'a self,
        index: &'a str,
        ids: Vec<String>,
    ) -> BoxFuture<'a, Result<Vec<Document>>> {
        Box::pin(async move {
            if ids.is_empty() {
                return Ok(Vec::new());
            }
            let request = self
                .post(&format!("{}/_mget", index))
                .json(&json!({ "ids": ids }));
            let wire: WireMgetResponse = self.send(request, "mget").await?;
            Ok(wire
                .docs
                .into_iter()
                .filter_map(WireHit::into_document)
                .collect())
        })
    }

    fn find_by_author<'a>(
        &'a self,
        index: &'a str,
        author_id: &'a str,
        after: Option<PageToken>,
        limit: usize,
    ) -> BoxFuture<'a, Result<Vec<Document>>> {
        Box::pin(async move {
            let mut query = json!({
                "size": limit,
                "query": { "term": { "author_did": author_id } },
                "sort": [ { "time_us": "asc" }, { "uri": "asc" } ],
            });
            if let Some(token) = after {
                query["search_after"] = json!([token.time_us, token.id]);
            }
            let request = self
                .post(&format!("{}/_search", index))
                .json(&query);
            let wire: WireSearchResponse = self.send(request, "author search").await?;
            Ok(wire
                .hits
                .hits
                .into_iter()
                .filter_map(WireHit::into_document)
                .collect())
        })
    }
}
