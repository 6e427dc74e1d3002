//! Dry-run wrapper: reads pass through, writes are logged and dropped.

use crate::error::Result;
use crate::index::{BulkResponse, CounterDelta, Document, DocumentStore, PageToken};
use futures::future::BoxFuture;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

pub struct DryRunStore<S> {
    inner: S,
    suppressed: AtomicU64,
}

impl<S: DocumentStore> DryRunStore<S> {
    pub fn new(inner: S) -> Self {
        DryRunStore {
            inner,
            suppressed: AtomicU64::new(0),
        }
    }

    /// Items that would have been written
    pub fn suppressed(&self) -> u64 {
        self.suppressed.load(Ordering::Relaxed)
    }

    fn suppress(&self, op: &str, index: &str, ids: Vec<String>) -> BulkResponse {
        self.suppressed
            .fetch_add(ids.len() as u64, Ordering::Relaxed);
        debug!(op, index, items = ids.len(), "dry run: write suppressed");
        BulkResponse::all_ok(ids)
    }
}

impl<S: DocumentStore> DocumentStore for DryRunStore<S> {
    fn bulk_create<'a>(
        &'a self,
        index: &'a str,
        docs: Vec<Document>,
    ) -> BoxFuture<'a, Result<BulkResponse>> {
        let ids = docs.into_iter().map(|d| d.id).collect();
        let response = self.suppress("create", index, ids);
        Box::pin(async move { Ok(response) })
    }

    fn bulk_delete<'a>(
        &'a self,
        index: &'a str,
        ids: Vec<String>,
    ) -> BoxFuture<'a, Result<BulkResponse>> {
        let response = self.suppress("delete", index, ids);
        Box::pin(async move { Ok(response) })
    }

    fn bulk_update_counter<'a>(
        &'a self,
        index: &'a str,
        deltas: Vec<CounterDelta>,
    ) -> BoxFuture<'a, Result<BulkResponse>> {
        let ids = deltas.into_iter().map(|d| d.id).collect();
        let response = self.suppress("update_counter", index, ids);
        Box::pin(async move { Ok(response) })
    }

    fn multi_get<'a>(
        &'a self,
        index: &'a str,
        ids: Vec<String>,
    ) -> BoxFuture<'a, Result<Vec<Document>>> {
        self.inner.multi_get(index, ids)
    }

    fn find_by_author<'a>(
        &'a self,
        index: &'a str,
        author_id: &'a str,
        after: Option<PageToken>,
        limit: usize,
    ) -> BoxFuture<'a, Result<Vec<Document>>> {
        self.inner.find_by_author(index, author_id, after, limit)
    }
}
