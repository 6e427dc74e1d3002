//! Applying committed batches to the document store.
//!
//! Deletes: look up the live documents, tombstone the ones found, then
//! delete every id, then decrement the counters of what was removed.
//! The tombstone write completes before the delete call is issued.
//!
//! Creates: bulk create by explicit id, then increment counters for the
//! documents that were actually new. A replayed create reports `Exists`
//! and leaves the counter alone, which keeps replays idempotent.
//!
//! Account purges: page through everything the author owns in both
//! collections and tombstone + delete page by page.
//!
//! Counter updates are best-effort: failures are logged and counted but
//! never fail the batch.

use crate::clock::Clock;
use crate::cursor::{Counter, CursorTracker};
use crate::error::{IngestError, Result};
use crate::event::{Batch, BatchOps, CreateEvent, DeleteEvent, PurgeEvent};
use crate::index::{
    BulkResponse, CounterDelta, Document, DocumentStore, IndexLayout, IndexPair, PageToken,
    TombstoneRecord,
};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

pub struct ReconciliationEngine {
    store: Arc<dyn DocumentStore>,
    layout: IndexLayout,
    tracker: Arc<CursorTracker>,
    clock: Arc<dyn Clock>,
    purge_page_size: usize,
    purge_query_timeout: Duration,
}

impl ReconciliationEngine {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        layout: IndexLayout,
        tracker: Arc<CursorTracker>,
        clock: Arc<dyn Clock>,
        purge_page_size: usize,
        purge_query_timeout: Duration,
    ) -> Self {
        ReconciliationEngine {
            store,
            layout,
            tracker,
            clock,
            purge_page_size: purge_page_size.max(1),
            purge_query_timeout,
        }
    }

    pub fn layout(&self) -> &IndexLayout {
        &self.layout
    }

    pub async fn apply_batch(&self, batch: &Batch) -> Result<()> {
        match &batch.ops {
            BatchOps::Delete(events) => self.apply_deletes(events).await,
            BatchOps::Create(events) => self.apply_creates(events).await,
        }
    }

    pub async fn apply_creates(&self, events: &[CreateEvent]) -> Result<()> {
        if events.is_empty() {
            return Ok(());
        }
        let index = self.layout.primary.live.as_str();
        let subjects: HashMap<&str, &str> = events
            .iter()
            .filter_map(|e| e.subject_id.as_deref().map(|s| (e.doc_id.as_str(), s)))
            .collect();
        let docs = events
            .iter()
            .map(|e| Document {
                id: e.doc_id.clone(),
                author_id: e.author_id.clone(),
                subject_id: e.subject_id.clone(),
                time_us: e.time_us,
                body: e.payload.clone(),
            })
            .collect();

        let response = self.store.bulk_create(index, docs).await?;
        let created: Vec<&str> = response.applied().collect();
        self.tracker.count(Counter::Created, created.len() as u64);
        debug!(index, requested = events.len(), created = created.len(), "bulk create");

        let bumps = created.iter().filter_map(|id| subjects.get(id).copied());
        self.adjust_counters(bumps, 1).await;

        check_items(index, &response)
    }

    pub async fn apply_deletes(&self, events: &[DeleteEvent]) -> Result<()> {
        if events.is_empty() {
            return Ok(());
        }
        let deleted_at: HashMap<&str, i64> = events
            .iter()
            .map(|e| (e.doc_id.as_str(), e.time_us))
            .collect();
        let mut ids: Vec<String> = deleted_at.keys().map(|id| id.to_string()).collect();
        ids.sort();

        let live = self
            .store
            .multi_get(&self.layout.primary.live, ids.clone())
            .await?;
        let now = self.clock.now_us();
        let tombstones = live
            .iter()
            .map(|doc| {
                let at = deleted_at.get(doc.id.as_str()).copied().unwrap_or(now);
                TombstoneRecord::from_live(doc, at)
            })
            .collect();

        let removed = self
            .tombstone_and_delete(&self.layout.primary, tombstones, ids.clone())
            .await?;
        self.tracker.count(Counter::Deleted, removed.len() as u64);

        for id in ids.iter().filter(|id| !live.iter().any(|d| &d.id == *id)) {
            debug!(id = %id, "delete target not found");
        }

        let subjects: HashMap<&str, &str> = live
            .iter()
            .filter_map(|d| d.subject_id.as_deref().map(|s| (d.id.as_str(), s)))
            .collect();
        let drops = removed.iter().filter_map(|id| subjects.get(id.as_str()).copied());
        self.adjust_counters(drops, -1).await;
        Ok(())
    }

    /// Remove everything `purge.author_id` owns in both collections.
    /// Returns the number of documents removed.
    pub async fn apply_purge(&self, purge: &PurgeEvent) -> Result<u64> {
        let mut removed = 0u64;
        for pair in [&self.layout.primary, &self.layout.secondary] {
            removed += self.purge_pair(pair, purge).await?;
        }
        self.tracker.count(Counter::Purged, removed);
        info!(author = %purge.author_id, removed, "account purged");
        Ok(removed)
    }

    async fn purge_pair(&self, pair: &IndexPair, purge: &PurgeEvent) -> Result<u64> {
        let mut removed = 0u64;
        let mut after: Option<PageToken> = None;
        loop {
            let page = tokio::time::timeout(
                self.purge_query_timeout,
                self.store.find_by_author(
                    &pair.live,
                    &purge.author_id,
                    after.clone(),
                    self.purge_page_size,
                ),
            )
            .await
            .map_err(|_| {
                IngestError::TransientIo(format!(
                    "author query on {} timed out after {:?}",
                    pair.live, self.purge_query_timeout
                ))
            })??;

            let Some(last) = page.last() else {
                break;
            };
            after = Some(PageToken::after(last));
            let full = page.len() >= self.purge_page_size;

            let ids = page.iter().map(|d| d.id.clone()).collect();
            let tombstones = page
                .iter()
                .map(|doc| TombstoneRecord::from_live(doc, purge.time_us))
                .collect();
            removed += self.tombstone_and_delete(pair, tombstones, ids).await?.len() as u64;
            debug!(index = %pair.live, author = %purge.author_id, page = page.len(), "purge page");

            if !full {
                break;
            }
        }
        Ok(removed)
    }

    /// Tombstones first, then deletes. Returns the ids actually removed.
    async fn tombstone_and_delete(
        &self,
        pair: &IndexPair,
        tombstones: Vec<TombstoneRecord>,
        ids: Vec<String>,
    ) -> Result<Vec<String>> {
        if !tombstones.is_empty() {
            let count = tombstones.len() as u64;
            let docs = tombstones
                .into_iter()
                .map(TombstoneRecord::into_document)
                .collect();
            let response = self.store.bulk_create(&pair.tombstones, docs).await?;
            // Nothing may be deleted without its tombstone.
            check_items(&pair.tombstones, &response)?;
            self.tracker.count(Counter::Tombstoned, count);
        }

        let response = self.store.bulk_delete(&pair.live, ids).await?;
        check_items(&pair.live, &response)?;
        Ok(response.applied().map(str::to_string).collect())
    }

    /// Apply `delta` once per subject occurrence. Best-effort.
    async fn adjust_counters<'a, I>(&self, subjects: I, delta: i64)
    where
        I: Iterator<Item = &'a str>,
    {
        let mut totals: BTreeMap<&str, i64> = BTreeMap::new();
        for subject in subjects {
            *totals.entry(subject).or_default() += delta;
        }
        if totals.is_empty() {
            return;
        }
        let field = self.layout.counter_field.clone();
        let deltas: Vec<CounterDelta> = totals
            .into_iter()
            .map(|(id, delta)| CounterDelta {
                id: id.to_string(),
                field: field.clone(),
                delta,
            })
            .collect();
        let requested = deltas.len();

        match self
            .store
            .bulk_update_counter(&self.layout.counter_index, deltas)
            .await
        {
            Ok(response) => {
                let failures = response.failures();
                for failure in &failures {
                    warn!(id = %failure.id, reason = %failure.reason, field = %field, "counter update rejected");
                }
                self.tracker
                    .count(Counter::CounterFailures, failures.len() as u64);
                if response.not_found() > 0 {
                    debug!(missing = response.not_found(), field = %field, "counter targets not indexed");
                }
            }
            Err(e) => {
                let e = IngestError::SecondaryOperation(e.to_string());
                warn!(error = %e, updates = requested, "counter update failed");
                self.tracker.count(Counter::CounterFailures, requested as u64);
            }
        }
    }
}

fn check_items(index: &str, response: &BulkResponse) -> Result<()> {
    let failures = response.failures();
    if failures.is_empty() {
        return Ok(());
    }
    Err(IngestError::PartialBulkFailure {
        index: index.to_string(),
        failures,
    })
}
