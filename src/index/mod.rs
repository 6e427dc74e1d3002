//! Document store capability consumed by the write path.
//!
//! The pipeline never defines the storage engine; it needs bulk
//! create/delete/counter-update by explicit id with per-item outcomes,
//! plus two reads used by reconciliation.
//!
//! Implementations:
//! - `InMemoryDocumentStore`: tests and smoke runs
//! - `FaultyDocumentStore`: wrapper injecting per-item and per-call failures
//! - `DryRunStore`: wrapper that suppresses every mutating call
//! - `ElasticsearchStore`: production (feature-gated)

pub mod dry_run;
#[cfg(feature = "elasticsearch")]
pub mod elasticsearch;
pub mod memory;
pub mod simulated;

pub use dry_run::DryRunStore;
#[cfg(feature = "elasticsearch")]
pub use elasticsearch::ElasticsearchStore;
pub use memory::{InMemoryDocumentStore, StoreOp};
pub use simulated::{FaultConfig, FaultyDocumentStore};

use crate::config::{CollectionKind, IndexConfig};
use crate::error::{ItemFailure, Result};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

/// An indexed document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    /// Explicit, deterministic id; repeating a create is a no-op
    pub id: String,
    pub author_id: String,
    pub subject_id: Option<String>,
    pub time_us: i64,
    pub body: Value,
}

/// Minimal audit record kept for a deleted document
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TombstoneRecord {
    pub doc_id: String,
    pub author_id: String,
    pub subject_id: Option<String>,
    /// When the original was published
    pub original_time_us: i64,
    pub deleted_at_us: i64,
}

impl TombstoneRecord {
    pub fn from_live(doc: &Document, deleted_at_us: i64) -> Self {
        TombstoneRecord {
            doc_id: doc.id.clone(),
            author_id: doc.author_id.clone(),
            subject_id: doc.subject_id.clone(),
            original_time_us: doc.time_us,
            deleted_at_us,
        }
    }

    /// Tombstones share the document id of what they replace
    pub fn into_document(self) -> Document {
        Document {
            id: self.doc_id,
            author_id: self.author_id,
            subject_id: self.subject_id,
            time_us: self.deleted_at_us,
            body: serde_json::json!({ "original_time_us": self.original_time_us }),
        }
    }
}

/// ±n adjustment of a numeric field on one document
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CounterDelta {
    pub id: String,
    pub field: String,
    pub delta: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemStatus {
    Ok,
    /// Create of an id that is already stored; nothing changed
    Exists,
    NotFound,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemOutcome {
    pub id: String,
    pub status: ItemStatus,
}

/// Per-item outcomes of one bulk call
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BulkResponse {
    pub items: Vec<ItemOutcome>,
}

impl BulkResponse {
    pub fn all_ok<I: IntoIterator<Item = String>>(ids: I) -> Self {
        BulkResponse {
            items: ids
                .into_iter()
                .map(|id| ItemOutcome {
                    id,
                    status: ItemStatus::Ok,
                })
                .collect(),
        }
    }

    /// Rejected items. `Exists` and `NotFound` are not rejections.
    pub fn failures(&self) -> Vec<ItemFailure> {
        self.items
            .iter()
            .filter_map(|item| match &item.status {
                ItemStatus::Failed(reason) => Some(ItemFailure {
                    id: item.id.clone(),
                    reason: reason.clone(),
                }),
                _ => None,
            })
            .collect()
    }

    /// Ids whose call took effect
    pub fn applied(&self) -> impl Iterator<Item = &str> {
        self.items
            .iter()
            .filter(|item| item.status == ItemStatus::Ok)
            .map(|item| item.id.as_str())
    }

    pub fn not_found(&self) -> usize {
        self.items
            .iter()
            .filter(|item| item.status == ItemStatus::NotFound)
            .count()
    }
}

/// Resume point for author queries: strictly after `(time_us, id)`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageToken {
    pub time_us: i64,
    pub id: String,
}

impl PageToken {
    pub fn after(doc: &Document) -> Self {
        PageToken {
            time_us: doc.time_us,
            id: doc.id.clone(),
        }
    }
}

/// Bulk write + lookup capability of the backing document store
pub trait DocumentStore: Send + Sync + 'static {
    /// Create by explicit id; ids already stored report `Exists`
    fn bulk_create<'a>(
        &'a self,
        index: &'a str,
        docs: Vec<Document>,
    ) -> BoxFuture<'a, Result<BulkResponse>>;

    /// Delete by id; missing ids report `NotFound`
    fn bulk_delete<'a>(&'a self, index: &'a str, ids: Vec<String>)
        -> BoxFuture<'a, Result<BulkResponse>>;

    fn bulk_update_counter<'a>(
        &'a self,
        index: &'a str,
        deltas: Vec<CounterDelta>,
    ) -> BoxFuture<'a, Result<BulkResponse>>;

    /// Fetch the live documents among `ids`; missing ids are omitted
    fn multi_get<'a>(&'a self, index: &'a str, ids: Vec<String>)
        -> BoxFuture<'a, Result<Vec<Document>>>;

    /// Documents owned by `author_id`, ordered by `(time_us, id)`
    fn find_by_author<'a>(
        &'a self,
        index: &'a str,
        author_id: &'a str,
        after: Option<PageToken>,
        limit: usize,
    ) -> BoxFuture<'a, Result<Vec<Document>>>;
}

impl<T: DocumentStore + ?Sized> DocumentStore for Arc<T> {
    fn bulk_create<'a>(
        &'a self,
        index: &'a str,
        docs: Vec<Document>,
    ) -> BoxFuture<'a, Result<BulkResponse>> {
        (**self).bulk_create(index, docs)
    }

    fn bulk_delete<'a>(
        &'a self,
        index: &'a str,
        ids: Vec<String>,
    ) -> BoxFuture<'a, Result<BulkResponse>> {
        (**self).bulk_delete(index, ids)
    }

    fn bulk_update_counter<'a>(
        &'a self,
        index: &'a str,
        deltas: Vec<CounterDelta>,
    ) -> BoxFuture<'a, Result<BulkResponse>> {
        (**self).bulk_update_counter(index, deltas)
    }

    fn multi_get<'a>(
        &'a self,
        index: &'a str,
        ids: Vec<String>,
    ) -> BoxFuture<'a, Result<Vec<Document>>> {
        (**self).multi_get(index, ids)
    }

    fn find_by_author<'a>(
        &'a self,
        index: &'a str,
        author_id: &'a str,
        after: Option<PageToken>,
        limit: usize,
    ) -> BoxFuture<'a, Result<Vec<Document>>> {
        (**self).find_by_author(index, author_id, after, limit)
    }
}

/// One collection's documents plus its tombstones
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexPair {
    pub live: String,
    pub tombstones: String,
}

/// Index names used by one indexer process
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexLayout {
    /// Collection this process writes
    pub primary: IndexPair,
    /// The other collection; only touched by account purges
    pub secondary: IndexPair,
    /// Index holding the documents whose counters this collection bumps
    pub counter_index: String,
    pub counter_field: String,
}

impl IndexLayout {
    pub fn for_collection(kind: CollectionKind, config: &IndexConfig) -> Self {
        let posts = IndexPair {
            live: config.posts_index.clone(),
            tombstones: config.post_tombstones_index.clone(),
        };
        let likes = IndexPair {
            live: config.likes_index.clone(),
            tombstones: config.like_tombstones_index.clone(),
        };
        match kind {
            CollectionKind::Likes => IndexLayout {
                primary: likes,
                secondary: posts,
                counter_index: config.posts_index.clone(),
                counter_field: "like_count".to_string(),
            },
            CollectionKind::Posts => IndexLayout {
                primary: posts,
                secondary: likes,
                counter_index: config.posts_index.clone(),
                counter_field: "reply_count".to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failures_exclude_not_found() {
        let response = BulkResponse {
            items: vec![
                ItemOutcome {
                    id: "a".to_string(),
                    status: ItemStatus::Ok,
                },
                ItemOutcome {
                    id: "b".to_string(),
                    status: ItemStatus::NotFound,
                },
                ItemOutcome {
                    id: "e".to_string(),
                    status: ItemStatus::Exists,
                },
                ItemOutcome {
                    id: "c".to_string(),
                    status: ItemStatus::Failed("version conflict".to_string()),
                },
            ],
        };
        let failures = response.failures();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].id, "c");
        assert_eq!(response.not_found(), 1);
        assert_eq!(response.applied().collect::<Vec<_>>(), vec!["a"]);
    }

    #[test]
    fn test_layout_for_likes() {
        let layout = IndexLayout::for_collection(CollectionKind::Likes, &IndexConfig::default());
        assert_eq!(layout.primary.live, "likes");
        assert_eq!(layout.primary.tombstones, "like_tombstones");
        assert_eq!(layout.secondary.live, "posts");
        assert_eq!(layout.counter_index, "posts");
        assert_eq!(layout.counter_field, "like_count");
    }

    #[test]
    fn test_tombstone_keeps_references() {
        let doc = Document {
            id: "at://d1/app.bsky.feed.like/x1".to_string(),
            author_id: "d1".to_string(),
            subject_id: Some("y1".to_string()),
            time_us: 1000,
            body: serde_json::json!({}),
        };
        let tombstone = TombstoneRecord::from_live(&doc, 2000).into_document();
        assert_eq!(tombstone.id, doc.id);
        assert_eq!(tombstone.subject_id.as_deref(), Some("y1"));
        assert_eq!(tombstone.time_us, 2000);
        assert_eq!(tombstone.body["original_time_us"], 1000);
    }
}
