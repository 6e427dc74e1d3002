//! Orchestrator
//!
//! Owns the run: startup checks, the source task, the dispatcher loop
//! and the write workers.
//!
//! ```text
//!  Source ──(bounded)──► dispatcher ──(bounded)──► WorkerPool ──► DocumentStore
//!                        classify                      │
//!                        accumulate                    ▼
//!                        purge barrier           CursorTracker ──► CursorStore
//! ```
//!
//! ## Shutdown
//!
//! Cancellation, a newer instance or the source ending all lead to the
//! same drain: stop the source, hand off whatever is still buffered,
//! close the work queue, let the workers finish (each unit bounded by
//! the shutdown grace), then flush the cursor one last time.

use crate::clock::Clock;
use crate::config::{IndexerConfig, SourceKind};
use crate::cursor::{
    resolve_start_cursor, Counter, CursorStore, CursorTracker, DryRunCursorStore,
    IntervalCounters, StartAdjustment,
};
use crate::error::{IngestError, Result};
use crate::event::{classify, Accumulated, BatchAccumulator, CollectionSpec, RawRecord};
use crate::index::{DocumentStore, DryRunStore, IndexLayout};
use crate::pipeline::reconcile::ReconciliationEngine;
use crate::pipeline::worker::{spawn_worker_pool, WorkKind, WorkUnit, WorkerPoolHandle};
use crate::source::{CursorGranularity, Source, SourceItem, SpoolSource, StreamSource};
use crate::storage::LocalFsObjectStore;
#[cfg(feature = "s3")]
use crate::storage::S3ObjectStore;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Upper bound on the dispatcher's housekeeping tick
const MAX_TICK: Duration = Duration::from_secs(1);

/// Why the processing loop stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    Cancelled,
    /// The source closed its channel (spool `once` mode, reconnect disabled)
    SourceEnded,
    /// A newer instance registered in the cursor store
    Yielded,
}

/// Outcome of a completed run
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub start_cursor: i64,
    pub final_cursor: i64,
    pub adjustment: StartAdjustment,
    pub exit: ExitReason,
    /// Whether an uncommitted unit held the cursor back
    pub pinned: bool,
    pub totals: IntervalCounters,
}

pub struct Orchestrator {
    config: IndexerConfig,
    cursor_store: Arc<dyn CursorStore>,
    doc_store: Arc<dyn DocumentStore>,
    clock: Arc<dyn Clock>,
}

impl Orchestrator {
    /// In dry-run mode both stores are wrapped so no write leaves the process.
    pub fn new(
        config: IndexerConfig,
        cursor_store: Arc<dyn CursorStore>,
        doc_store: Arc<dyn DocumentStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let (cursor_store, doc_store): (Arc<dyn CursorStore>, Arc<dyn DocumentStore>) =
            if config.dry_run {
                (
                    Arc::new(DryRunCursorStore::new(cursor_store)),
                    Arc::new(DryRunStore::new(doc_store)),
                )
            } else {
                (cursor_store, doc_store)
            };
        Orchestrator {
            config,
            cursor_store,
            doc_store,
            clock,
        }
    }

    /// Run until `cancel` fires, the source ends or a newer instance appears.
    ///
    /// Only configuration errors and startup cursor failures are returned;
    /// batch failures are contained and show up in the summary.
    pub async fn run(&self, cancel: CancellationToken) -> Result<RunSummary> {
        self.config.validate()?;
        let spec = CollectionSpec::for_kind(self.config.collection);
        let pipeline = &self.config.pipeline;

        let now_us = self.clock.now_us();
        let stored = self.cursor_store.get_cursor().await?;
        let (start_cursor, adjustment) = resolve_start_cursor(
            stored,
            self.config.no_rewind,
            self.config.max_rewind_minutes,
            now_us,
        );
        if adjustment != StartAdjustment::None {
            self.cursor_store.reset_cursor(start_cursor).await?;
        }
        let instance_start_us = now_us;
        self.cursor_store.write_instance_info(instance_start_us).await?;
        info!(
            collection = spec.nsid,
            start_cursor,
            adjustment = ?adjustment,
            dry_run = self.config.dry_run,
            "indexer starting"
        );

        let tracker = Arc::new(CursorTracker::new(
            start_cursor,
            pipeline.cursor_flush_interval,
            self.clock.clone(),
        ));
        let source = self.build_source(spec, start_cursor, tracker.clone())?;
        let granularity = source.granularity();
        info!(source = source.name(), "source selected");

        let (src_tx, mut src_rx) = mpsc::channel(self.config.stream.channel_capacity.max(1));
        let source_cancel = cancel.child_token();
        let source_task = tokio::spawn(source.run(src_tx, source_cancel.clone()));

        let engine = Arc::new(ReconciliationEngine::new(
            self.doc_store.clone(),
            IndexLayout::for_collection(self.config.collection, &self.config.index),
            tracker.clone(),
            self.clock.clone(),
            pipeline.purge_page_size,
            pipeline.purge_query_timeout,
        ));
        let pool = spawn_worker_pool(
            pipeline.worker_pool_size,
            pipeline.queue_depth,
            engine,
            tracker.clone(),
            pipeline.shutdown_grace,
        );

        let mut dispatcher = Dispatcher {
            spec,
            granularity,
            accumulator: BatchAccumulator::new(pipeline.max_batch_size),
            tracker: tracker.clone(),
            pool,
            in_flight: Vec::new(),
            last_seen_us: None,
            cancel: cancel.clone(),
            draining: false,
            drain_enqueue_timeout: pipeline.drain_enqueue_timeout,
        };

        let mut tick = tokio::time::interval(pipeline.cursor_flush_interval.min(MAX_TICK));
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let check_every = pipeline.instance_check_every;
        let mut since_check = 0u64;

        let exit = loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break ExitReason::Cancelled,
                item = src_rx.recv() => match item {
                    Some(SourceItem::Record(raw)) => {
                        dispatcher.on_record(raw).await;
                        since_check += 1;
                        if check_every > 0 && since_check >= check_every {
                            since_check = 0;
                            if self.newer_instance_registered(instance_start_us).await {
                                break ExitReason::Yielded;
                            }
                        }
                    }
                    Some(SourceItem::Checkpoint(time_us)) => {
                        dispatcher.on_checkpoint(time_us).await;
                        self.flush_cursor(&tracker).await;
                    }
                    None => break ExitReason::SourceEnded,
                },
                _ = tick.tick() => {
                    dispatcher.on_idle().await;
                    self.flush_cursor(&tracker).await;
                }
            }
        };
        info!(exit = ?exit, "processing loop stopped, draining");

        // Drain
        source_cancel.cancel();
        drop(src_rx);
        match source_task.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "source stopped with error"),
            Err(e) => error!(error = %e, "source task panicked"),
        }
        dispatcher.draining = true;
        dispatcher.flush_open().await;
        dispatcher.pool.shutdown().await;

        tracker.force_flush(self.cursor_store.as_ref()).await?;
        let summary = RunSummary {
            start_cursor,
            final_cursor: tracker.committed_position(),
            adjustment,
            exit,
            pinned: tracker.is_pinned(),
            totals: tracker.totals(),
        };
        info!(
            exit = ?summary.exit,
            final_cursor = summary.final_cursor,
            pinned = summary.pinned,
            records = summary.totals.records,
            failed_units = summary.totals.failed_units,
            "indexer stopped"
        );
        Ok(summary)
    }

    fn build_source(
        &self,
        spec: CollectionSpec,
        start_cursor: i64,
        tracker: Arc<CursorTracker>,
    ) -> Result<Source> {
        let clock = self.clock.clone();
        match self.config.source {
            SourceKind::Stream => Ok(Source::Stream(StreamSource::new(
                &self.config.stream,
                spec.nsid,
                start_cursor,
                tracker,
                clock,
            )?)),
            SourceKind::LocalSpool => {
                let path = self.config.spool.path.clone().ok_or_else(|| {
                    IngestError::FatalConfig("local-spool source requires a path".to_string())
                })?;
                Ok(Source::LocalSpool(SpoolSource::new(
                    LocalFsObjectStore::new(path),
                    &self.config.spool,
                    spec.nsid,
                    start_cursor,
                    clock,
                )))
            }
            #[cfg(feature = "s3")]
            SourceKind::RemoteSpool => {
                let s3 = self.config.spool.s3.as_ref().ok_or_else(|| {
                    IngestError::FatalConfig("remote-spool source requires a bucket".to_string())
                })?;
                let store = S3ObjectStore::new(s3)
                    .map_err(|e| IngestError::FatalConfig(format!("S3 spool: {}", e)))?;
                Ok(Source::RemoteSpool(SpoolSource::new(
                    store,
                    &self.config.spool,
                    spec.nsid,
                    start_cursor,
                    clock,
                )))
            }
            #[cfg(not(feature = "s3"))]
            SourceKind::RemoteSpool => Err(IngestError::FatalConfig(
                "remote-spool requires a build with --features s3".to_string(),
            )),
        }
    }

    async fn newer_instance_registered(&self, instance_start_us: i64) -> bool {
        match self
            .cursor_store
            .check_for_newer_instance(instance_start_us)
            .await
        {
            Ok(true) => {
                info!(instance_start_us, "newer instance registered, yielding");
                true
            }
            Ok(false) => false,
            Err(e) => {
                warn!(error = %e, "instance check failed");
                false
            }
        }
    }

    async fn flush_cursor(&self, tracker: &CursorTracker) {
        match tracker.flush_if_due(self.cursor_store.as_ref()).await {
            Ok(Some(position)) => debug!(position, "cursor flushed"),
            Ok(None) => {}
            Err(e) => warn!(error = %e, "cursor flush failed, will retry"),
        }
    }
}

/// A unit handed to the pool and not yet seen finished
struct InFlight {
    done: oneshot::Receiver<()>,
    /// Documents the unit writes
    doc_ids: HashSet<String>,
}

/// Single-task stage between the source channel and the work queue.
///
/// Units run concurrently on the pool, so a unit touching a document
/// that an in-flight unit also writes waits for that unit first. A
/// delete therefore never overtakes the create it follows.
struct Dispatcher {
    spec: CollectionSpec,
    granularity: CursorGranularity,
    accumulator: BatchAccumulator,
    tracker: Arc<CursorTracker>,
    pool: WorkerPoolHandle,
    in_flight: Vec<InFlight>,
    /// Highest event time handed to the accumulator
    last_seen_us: Option<i64>,
    /// Interrupts waits on the pool before draining starts
    cancel: CancellationToken,
    draining: bool,
    drain_enqueue_timeout: Duration,
}

impl Dispatcher {
    async fn on_record(&mut self, raw: RawRecord) {
        self.tracker.count(Counter::Records, 1);
        let event = match classify(&raw, &self.spec) {
            Ok(event) => event,
            Err(e) => {
                debug!(provenance = ?raw.provenance, reason = %e.reason, "record rejected");
                self.tracker.count(Counter::Rejected, 1);
                return;
            }
        };
        let time_us = event.time_us();
        self.last_seen_us = Some(self.last_seen_us.map_or(time_us, |seen| seen.max(time_us)));

        match self.accumulator.push(event) {
            Accumulated::Buffered => {}
            Accumulated::Ready(batch) => {
                let mut batches = vec![batch];
                if self.granularity == CursorGranularity::PerRecord {
                    // The resume position covers every buffered event, so
                    // everything buffered has to ride in the same unit.
                    batches.extend(self.accumulator.flush());
                }
                let position = self.record_position();
                self.enqueue(WorkKind::Batches(batches), position).await;
            }
            Accumulated::Purge {
                flushed,
                discarded,
                purge,
            } => {
                if discarded > 0 {
                    debug!(author = %purge.author_id, discarded, "buffered events after purge dropped");
                }
                if !flushed.is_empty() {
                    self.enqueue(WorkKind::Batches(flushed), None).await;
                }
                // Everything before the purge must be durable first. An
                // interrupted wait means cancellation, and the purge unit
                // is then handed back by the submit below.
                self.barrier().await;
                let position = self.record_position();
                info!(author = %purge.author_id, time_us = purge.time_us, "account purge");
                self.enqueue(WorkKind::Purge(purge), position).await;
                // Later events of the author must not race the purge.
                self.barrier().await;
            }
        }
    }

    async fn on_checkpoint(&mut self, time_us: i64) {
        let batches = self.accumulator.flush();
        if batches.is_empty() {
            let ticket = self.tracker.begin();
            self.tracker.propose_advance(ticket, Some(time_us));
            return;
        }
        self.enqueue(WorkKind::Batches(batches), Some(time_us)).await;
    }

    /// Hand off partially filled batches so a quiet feed still commits
    async fn on_idle(&mut self) {
        self.prune_in_flight();
        if self.accumulator.buffered() == 0 {
            return;
        }
        if self.granularity == CursorGranularity::PerRecord {
            self.flush_open().await;
        }
    }

    async fn flush_open(&mut self) {
        let batches = self.accumulator.flush();
        if batches.is_empty() {
            return;
        }
        let position = self.record_position();
        self.enqueue(WorkKind::Batches(batches), position).await;
    }

    fn record_position(&self) -> Option<i64> {
        match self.granularity {
            CursorGranularity::PerRecord => self.last_seen_us,
            CursorGranularity::PerCheckpoint => None,
        }
    }

    async fn enqueue(&mut self, kind: WorkKind, position: Option<i64>) {
        self.prune_in_flight();
        let doc_ids: HashSet<String> = kind.doc_ids().into_iter().map(str::to_string).collect();
        let (unit, done) = WorkUnit::new(self.tracker.begin(), kind, position);
        if !self.wait_for_overlap(&doc_ids).await {
            self.pool.reject(unit);
            return;
        }
        let submitted = if self.draining {
            self.pool.submit_timeout(unit, self.drain_enqueue_timeout).await
        } else {
            self.pool.submit_until(unit, &self.cancel).await
        };
        match submitted {
            Ok(()) => self.in_flight.push(InFlight { done, doc_ids }),
            Err(unit) => self.pool.reject(unit),
        }
    }

    /// Wait for in-flight units writing any of `doc_ids`. Returns false
    /// if the wait was interrupted.
    async fn wait_for_overlap(&mut self, doc_ids: &HashSet<String>) -> bool {
        if doc_ids.is_empty() {
            return true;
        }
        let (overlapping, rest): (Vec<_>, Vec<_>) = std::mem::take(&mut self.in_flight)
            .into_iter()
            .partition(|unit| !unit.doc_ids.is_disjoint(doc_ids));
        self.in_flight = rest;
        if overlapping.is_empty() {
            return true;
        }
        debug!(units = overlapping.len(), "waiting for units writing the same documents");
        self.await_units(overlapping).await
    }

    /// Wait for every in-flight unit. Returns false if interrupted.
    async fn barrier(&mut self) -> bool {
        let pending = std::mem::take(&mut self.in_flight);
        debug!(units = pending.len(), "waiting for in-flight units");
        self.await_units(pending).await
    }

    async fn await_units(&self, units: Vec<InFlight>) -> bool {
        let all_done = futures::future::join_all(units.into_iter().map(|unit| unit.done));
        tokio::select! {
            biased;
            () = self.interrupted() => {
                warn!("stopped waiting for in-flight units");
                false
            }
            _ = all_done => true,
        }
    }

    /// Resolves when a blocked wait on the pool should give up:
    /// cancellation while running, the enqueue deadline while draining
    async fn interrupted(&self) {
        if self.draining {
            tokio::time::sleep(self.drain_enqueue_timeout).await;
        } else {
            self.cancel.cancelled().await;
        }
    }

    fn prune_in_flight(&mut self) {
        self.in_flight.retain_mut(|unit| {
            matches!(unit.done.try_recv(), Err(oneshot::error::TryRecvError::Empty))
        });
    }
}
