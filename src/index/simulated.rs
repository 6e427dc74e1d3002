//! Fault-injecting document store wrapper
//!
//! Deterministic counterpart of a flaky cluster: chosen ids are rejected
//! per item, whole calls fail a set number of times, counter updates
//! can be made to fail outright and bulk creates can be slowed down.
//! Used to exercise the partial failure, ordering and shutdown paths of
//! the write side.

use crate::error::{IngestError, Result};
use crate::index::{
    BulkResponse, CounterDelta, Document, DocumentStore, ItemOutcome, ItemStatus, PageToken,
};
use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::time::Duration;

/// What to break
#[derive(Debug, Clone, Default)]
pub struct FaultConfig {
    /// Ids rejected item-by-item by create and delete
    pub reject_ids: HashSet<String>,
    /// Fail this many bulk create calls before succeeding
    pub failing_create_calls: u32,
    /// Fail this many bulk delete calls before succeeding
    pub failing_delete_calls: u32,
    /// Every counter update call fails
    pub fail_counter_updates: bool,
    /// Latency added to every bulk create call
    pub create_delay: Duration,
}

impl FaultConfig {
    pub fn no_faults() -> Self {
        Self::default()
    }

    pub fn reject(ids: &[&str]) -> Self {
        FaultConfig {
            reject_ids: ids.iter().map(|s| s.to_string()).collect(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FaultStats {
    pub create_calls: u64,
    pub delete_calls: u64,
    pub counter_calls: u64,
    pub injected_call_failures: u64,
    pub injected_item_failures: u64,
}

struct FaultState {
    config: FaultConfig,
    stats: FaultStats,
}

pub struct FaultyDocumentStore<S> {
    inner: S,
    state: Mutex<FaultState>,
}

impl<S: DocumentStore> FaultyDocumentStore<S> {
    pub fn new(inner: S, config: FaultConfig) -> Self {
        FaultyDocumentStore {
            inner,
            state: Mutex::new(FaultState {
                config,
                stats: FaultStats::default(),
            }),
        }
    }

    pub fn stats(&self) -> FaultStats {
        self.state.lock().stats.clone()
    }

    /// Replace the fault configuration, e.g. to heal the store
    pub fn set_config(&self, config: FaultConfig) {
        self.state.lock().config = config;
    }

    /// Split `ids` into rejected and forwarded, counting the call
    fn partition(&self, ids: Vec<String>) -> (Vec<String>, Vec<String>) {
        let mut state = self.state.lock();
        let (rejected, forwarded): (Vec<_>, Vec<_>) = ids
            .into_iter()
            .partition(|id| state.config.reject_ids.contains(id));
        state.stats.injected_item_failures += rejected.len() as u64;
        (rejected, forwarded)
    }

    fn take_call_failure(&self, pick: fn(&mut FaultConfig) -> &mut u32) -> bool {
        let mut state = self.state.lock();
        let remaining = pick(&mut state.config);
        if *remaining == 0 {
            return false;
        }
        *remaining -= 1;
        state.stats.injected_call_failures += 1;
        true
    }
}

fn merge(rejected: Vec<String>, mut response: BulkResponse) -> BulkResponse {
    response
        .items
        .extend(rejected.into_iter().map(|id| ItemOutcome {
            id,
            status: ItemStatus::Failed("injected rejection".to_string()),
        }));
    response
}

impl<S: DocumentStore> DocumentStore for FaultyDocumentStore<S> {
    fn bulk_create<'a>(
        &'a self,
        index: &'a str,
        docs: Vec<Document>,
    ) -> BoxFuture<'a, Result<BulkResponse>> {
        Box::pin(async move {
            let delay = {
                let mut state = self.state.lock();
                state.stats.create_calls += 1;
                state.config.create_delay
            };
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            if self.take_call_failure(|c| &mut c.failing_create_calls) {
                return Err(IngestError::TransientIo("injected create failure".to_string()));
            }
            let (rejected, _) = self.partition(docs.iter().map(|d| d.id.clone()).collect());
            let forwarded: Vec<Document> = docs
                .into_iter()
                .filter(|d| !rejected.contains(&d.id))
                .collect();
            let response = self.inner.bulk_create(index, forwarded).await?;
            Ok(merge(rejected, response))
        })
    }

    fn bulk_delete<'a>(
        &'a self,
        index: &'a str,
        ids: Vec<String>,
    ) -> BoxFuture<'a, Result<BulkResponse>> {
        Box::pin(async move {
            self.state.lock().stats.delete_calls += 1;
            if self.take_call_failure(|c| &mut c.failing_delete_calls) {
                return Err(IngestError::TransientIo("injected delete failure".to_string()));
            }
            let (rejected, forwarded) = self.partition(ids);
            let response = self.inner.bulk_delete(index, forwarded).await?;
            Ok(merge(rejected, response))
        })
    }

    fn bulk_update_counter<'a>(
        &'a self,
        index: &'a str,
        deltas: Vec<CounterDelta>,
    ) -> BoxFuture<'a, Result<BulkResponse>> {
        Box::pin(async move {
            let fail = {
                let mut state = self.state.lock();
                state.stats.counter_calls += 1;
                if state.config.fail_counter_updates {
                    state.stats.injected_call_failures += 1;
                }
                state.config.fail_counter_updates
            };
            if fail {
                return Err(IngestError::TransientIo("injected counter failure".to_string()));
            }
            self.inner.bulk_update_counter(index, deltas).await
        })
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
