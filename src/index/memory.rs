//! In-memory document store
//!
//! Every mutating call is appended to an op log so tests can assert the
//! order in which the write path touched the store.

use crate::error::Result;
use crate::index::{
    BulkResponse, CounterDelta, Document, DocumentStore, ItemOutcome, ItemStatus, PageToken,
};
use futures::future::BoxFuture;
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// One recorded mutating call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreOp {
    Create { index: String, ids: Vec<String> },
    Delete { index: String, ids: Vec<String> },
    UpdateCounter { index: String, ids: Vec<String> },
}

#[derive(Default)]
struct Inner {
    indices: HashMap<String, BTreeMap<String, Document>>,
    ops: Vec<StoreOp>,
}

#[derive(Clone, Default)]
pub struct InMemoryDocumentStore {
    inner: Arc<RwLock<Inner>>,
}

impl InMemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, index: &str, id: &str) -> Option<Document> {
        self.inner
            .read()
            .indices
            .get(index)
            .and_then(|docs| docs.get(id))
            .cloned()
    }

    pub fn contains(&self, index: &str, id: &str) -> bool {
        self.get(index, id).is_some()
    }

    /// Number of documents in `index`
    pub fn count(&self, index: &str) -> usize {
        self.inner
            .read()
            .indices
            .get(index)
            .map_or(0, BTreeMap::len)
    }

    /// Numeric field of a stored document's body
    pub fn counter(&self, index: &str, id: &str, field: &str) -> Option<i64> {
        self.get(index, id)
            .and_then(|doc| doc.body.get(field).and_then(Value::as_i64))
    }

    /// Seed a document without recording an op
    pub fn insert(&self, index: &str, doc: Document) {
        self.inner
            .write()
            .indices
            .entry(index.to_string())
            .or_default()
            .insert(doc.id.clone(), doc);
    }

    pub fn ops(&self) -> Vec<StoreOp> {
        self.inner.read().ops.clone()
    }

    pub fn clear_ops(&self) {
        self.inner.write().ops.clear();
    }
}

impl DocumentStore for InMemoryDocumentStore {
    fn bulk_create<'a>(
        &'a self,
        index: &'a str,
        docs: Vec<Document>,
    ) -> BoxFuture<'a, Result<BulkResponse>> {
        Box::pin(async move {
            let mut inner = self.inner.write();
            let ids: Vec<String> = docs.iter().map(|d| d.id.clone()).collect();
            inner.ops.push(StoreOp::Create {
                index: index.to_string(),
                ids: ids.clone(),
            });
            let target = inner.indices.entry(index.to_string()).or_default();
            let items = docs
                .into_iter()
                .map(|doc| {
                    let id = doc.id.clone();
                    let status = if target.contains_key(&id) {
                        ItemStatus::Exists
                    } else {
                        target.insert(id.clone(), doc);
                        ItemStatus::Ok
                    };
                    ItemOutcome { id, status }
                })
                .collect();
            Ok(BulkResponse { items })
        })
    }

    fn bulk_delete<'a>(
        &'a self,
        index: &'a str,
        ids: Vec<String>,
    ) -> BoxFuture<'a, Result<BulkResponse>> {
        Box::pin(async move {
            let mut inner = self.inner.write();
            inner.ops.push(StoreOp::Delete {
                index: index.to_string(),
                ids: ids.clone(),
            });
            let target = inner.indices.entry(index.to_string()).or_default();
            let items = ids
                .into_iter()
                .map(|id| {
                    let status = match target.remove(&id) {
                        Some(_) => ItemStatus::Ok,
                        None => ItemStatus::NotFound,
                    };
                    ItemOutcome { id, status }
                })
                .collect();
            Ok(BulkResponse { items })
        })
    }

    fn bulk_update_counter<'a>(
        &'a self,
        index: &'a str,
        deltas: Vec<CounterDelta>,
    ) -> BoxFuture<'a, Result<BulkResponse>> {
        Box::pin(async move {
            let mut inner = self.inner.write();
            inner.ops.push(StoreOp::UpdateCounter {
                index: index.to_string(),
                ids: deltas.iter().map(|d| d.id.clone()).collect(),
            });
            let target = inner.indices.entry(index.to_string()).or_default();
            let items = deltas
                .into_iter()
                .map(|delta| {
                    let status = match target.get_mut(&delta.id) {
                        Some(doc) => {
                            bump(&mut doc.body, &delta.field, delta.delta);
                            ItemStatus::Ok
                        }
                        None => ItemStatus::NotFound,
                    };
                    ItemOutcome {
                        id: delta.id,
                        status,
                    }
                })
                .collect();
            Ok(BulkResponse { items })
        })
    }

    fn multi_get<'a>(
        &'a self,
        index: &'a str,
        ids: Vec<String>,
    ) -> BoxFuture<'a, Result<Vec<Document>>> {
        Box::pin(async move {
            let inner = self.inner.read();
            let Some(docs) = inner.indices.get(index) else {
                return Ok(Vec::new());
            };
            Ok(ids.iter().filter_map(|id| docs.get(id).cloned()).collect())
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
            let inner = self.inner.read();
            let Some(docs) = inner.indices.get(index) else {
                return Ok(Vec::new());
            };
            let mut owned: Vec<&Document> = docs
                .values()
                .filter(|d| d.author_id == author_id)
                .filter(|d| match &after {
                    Some(token) => (d.time_us, d.id.as_str()) > (token.time_us, token.id.as_str()),
                    None => true,
                })
                .collect();
            owned.sort_by(|a, b| (a.time_us, &a.id).cmp(&(b.time_us, &b.id)));
            Ok(owned.into_iter().take(limit).cloned().collect())
        })
    }
}

fn bump(body: &mut Value, field: &str, delta: i64) {
    if !body.is_object() {
        *body = Value::Object(Default::default());
    }
    if let Some(map) = body.as_object_mut() {
        let current = map.get(field).and_then(Value::as_i64).unwrap_or(0);
        map.insert(field.to_string(), Value::from(current + delta));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(id: &str, author: &str, time_us: i64) -> Document {
        Document {
            id: id.to_string(),
            author_id: author.to_string(),
            subject_id: None,
            time_us,
            body: json!({}),
        }
    }

    #[tokio::test]
    async fn test_create_is_idempotent() {
        let store = InMemoryDocumentStore::new();
        store.bulk_create("posts", vec![doc("p1", "d1", 1)]).await.unwrap();
        store
            .bulk_update_counter(
                "posts",
                vec![CounterDelta {
                    id: "p1".to_string(),
                    field: "like_count".to_string(),
                    delta: 2,
                }],
            )
            .await
            .unwrap();
        let replay = store.bulk_create("posts", vec![doc("p1", "d1", 1)]).await.unwrap();

        assert_eq!(replay.items[0].status, ItemStatus::Exists);
        assert_eq!(store.count("posts"), 1);
        assert_eq!(store.counter("posts", "p1", "like_count"), Some(2));
    }

    #[tokio::test]
    async fn test_delete_missing_reports_not_found() {
        let store = InMemoryDocumentStore::new();
        store.insert("likes", doc("a", "d1", 1));
        let response = store
            .bulk_delete("likes", vec!["a".to_string(), "b".to_string()])
            .await
            .unwrap();
        assert_eq!(response.not_found(), 1);
        assert!(response.failures().is_empty());
        assert!(!store.contains("likes", "a"));
    }

    #[tokio::test]
    async fn test_counter_on_missing_document() {
        let store = InMemoryDocumentStore::new();
        let response = store
            .bulk_update_counter(
                "posts",
                vec![CounterDelta {
                    id: "nope".to_string(),
                    field: "like_count".to_string(),
                    delta: 1,
                }],
            )
            .await
            .unwrap();
        assert_eq!(response.not_found(), 1);
    }

    #[tokio::test]
    async fn test_find_by_author_pages() {
        let store = InMemoryDocumentStore::new();
        for (i, id) in ["c", "a", "b"].iter().enumerate() {
            store.insert("likes", doc(id, "d1", i as i64));
        }
        store.insert("likes", doc("z", "d2", 0));

        let first = store.find_by_author("likes", "d1", None, 2).await.unwrap();
        assert_eq!(
            first.iter().map(|d| d.id.as_str()).collect::<Vec<_>>(),
            vec!["c", "a"]
        );
        let rest = store
            .find_by_author("likes", "d1", Some(PageToken::after(&first[1])), 2)
            .await
            .unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].id, "b");
    }

    #[tokio::test]
    async fn test_op_log_records_order() {
        let store = InMemoryDocumentStore::new();
        store.bulk_create("t", vec![doc("x", "d1", 1)]).await.unwrap();
        store.bulk_delete("l", vec!["x".to_string()]).await.unwrap();
        assert_eq!(
            store.ops(),
            vec![
                StoreOp::Create {
                    index: "t".to_string(),
                    ids: vec!["x".to_string()]
                },
                StoreOp::Delete {
                    index: "l".to_string(),
                    ids: vec!["x".to_string()]
                },
            ]
        );
    }
}
