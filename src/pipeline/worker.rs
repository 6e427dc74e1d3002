//! Write worker pool
//!
//! ```text
//!              ┌──► worker 0 ──┐
//! dispatcher ──┼──► worker 1 ──┼──► ReconciliationEngine ──► propose_advance / abandon
//!   (bounded)  └──► worker N ──┘
//! ```
//!
//! All workers pull from one bounded queue, so a slow store pushes back
//! on the dispatcher instead of growing memory. Within a unit, delete
//! batches are applied before create batches. Once draining starts,
//! each unit still gets its own grace period before it is abandoned.

use crate::cursor::{CursorTracker, Ticket};
use crate::error::{IngestError, Result};
use crate::event::{Batch, BatchOps, PurgeEvent};
use crate::pipeline::reconcile::ReconciliationEngine;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub enum WorkKind {
    /// Batches handed off together; deletes go first
    Batches(Vec<Batch>),
    Purge(PurgeEvent),
}

impl WorkKind {
    /// Ids of the documents this unit creates or deletes
    pub fn doc_ids(&self) -> Vec<&str> {
        let mut ids = Vec::new();
        if let WorkKind::Batches(batches) = self {
            for batch in batches {
                match &batch.ops {
                    BatchOps::Create(events) => ids.extend(events.iter().map(|e| e.doc_id.as_str())),
                    BatchOps::Delete(events) => ids.extend(events.iter().map(|e| e.doc_id.as_str())),
                }
            }
        }
        ids
    }
}

/// One unit of work and the cursor position it unlocks
pub struct WorkUnit {
    pub ticket: Ticket,
    pub kind: WorkKind,
    /// Where the cursor may move once this and every earlier unit commit
    pub position: Option<i64>,
    /// Resolved when the unit finished, committed or not
    pub done: oneshot::Sender<()>,
}

impl WorkUnit {
    pub fn new(ticket: Ticket, kind: WorkKind, position: Option<i64>) -> (Self, oneshot::Receiver<()>) {
        let (done, done_rx) = oneshot::channel();
        (
            WorkUnit {
                ticket,
                kind,
                position,
                done,
            },
            done_rx,
        )
    }
}

/// Sending side of the work queue
pub struct WorkerPoolHandle {
    tx: mpsc::Sender<WorkUnit>,
    draining: CancellationToken,
    workers: Vec<JoinHandle<()>>,
    tracker: Arc<CursorTracker>,
}

impl WorkerPoolHandle {
    /// Enqueue, waiting for queue space. Returns the unit if the pool is gone.
    pub async fn submit(&self, unit: WorkUnit) -> std::result::Result<(), WorkUnit> {
        self.tx.send(unit).await.map_err(|e| e.0)
    }

    /// Enqueue, waiting for queue space until `cancel` fires. A unit
    /// that could not be enqueued is handed back.
    pub async fn submit_until(
        &self,
        unit: WorkUnit,
        cancel: &CancellationToken,
    ) -> std::result::Result<(), WorkUnit> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(unit),
            permit = self.tx.reserve() => match permit {
                Ok(permit) => {
                    permit.send(unit);
                    Ok(())
                }
                Err(_) => Err(unit),
            },
        }
    }

    /// Enqueue with a deadline, used while draining
    pub async fn submit_timeout(&self, unit: WorkUnit, timeout: Duration) -> std::result::Result<(), WorkUnit> {
        self.tx
            .send_timeout(unit, timeout)
            .await
            .map_err(|e| e.into_inner())
    }

    /// Close the queue, start per-unit grace timers and wait for every
    /// worker to finish what was already queued
    pub async fn shutdown(self) {
        let WorkerPoolHandle {
            tx,
            draining,
            workers,
            tracker: _,
        } = self;
        drop(tx);
        draining.cancel();
        for worker in workers {
            if let Err(e) = worker.await {
                error!(error = %e, "write worker panicked");
            }
        }
        info!("write workers stopped");
    }

    /// Give up on a unit that was never enqueued
    pub fn reject(&self, unit: WorkUnit) {
        error!(ticket = unit.ticket.seq(), "unit not enqueued, batch dropped");
        self.tracker.abandon(unit.ticket);
    }
}

/// Spawn `size` workers sharing one queue of `queue_depth` units
pub fn spawn_worker_pool(
    size: usize,
    queue_depth: usize,
    engine: Arc<ReconciliationEngine>,
    tracker: Arc<CursorTracker>,
    grace: Duration,
) -> WorkerPoolHandle {
    let (tx, rx) = mpsc::channel(queue_depth.max(1));
    let rx = Arc::new(Mutex::new(rx));
    let draining = CancellationToken::new();

    let workers = (0..size.max(1))
        .map(|id| {
            let worker = Worker {
                id,
                rx: rx.clone(),
                engine: engine.clone(),
                tracker: tracker.clone(),
                draining: draining.clone(),
                grace,
            };
            tokio::spawn(worker.run())
        })
        .collect();

    WorkerPoolHandle {
        tx,
        draining,
        workers,
        tracker,
    }
}

struct Worker {
    id: usize,
    rx: Arc<Mutex<mpsc::Receiver<WorkUnit>>>,
    engine: Arc<ReconciliationEngine>,
    tracker: Arc<CursorTracker>,
    draining: CancellationToken,
    grace: Duration,
}

impl Worker {
    async fn run(self) {
        debug!(worker = self.id, "write worker started");
        loop {
            // Hold the lock only while waiting for the next unit.
            let unit = match self.rx.lock().await.recv().await {
                Some(unit) => unit,
                None => break,
            };
            self.process(unit).await;
        }
        debug!(worker = self.id, "write worker exiting");
    }

    async fn process(&self, unit: WorkUnit) {
        let WorkUnit {
            ticket,
            kind,
            position,
            done,
        } = unit;
        let seq = ticket.seq();

        let grace_expired = async {
            self.draining.cancelled().await;
            tokio::time::sleep(self.grace).await;
        };
        let result = tokio::select! {
            result = self.apply(&kind) => result,
            () = grace_expired => Err(IngestError::TransientIo(format!(
                "unit {} exceeded shutdown grace of {:?}",
                seq, self.grace
            ))),
        };

        match result {
            Ok(()) => {
                debug!(worker = self.id, ticket = seq, position = ?position, "unit committed");
                self.tracker.propose_advance(ticket, position);
            }
            Err(IngestError::PartialBulkFailure { index, failures }) => {
                for failure in &failures {
                    error!(worker = self.id, ticket = seq, index = %index, id = %failure.id, reason = %failure.reason, "bulk item rejected");
                }
                warn!(worker = self.id, ticket = seq, failed = failures.len(), "unit partially failed, cursor withheld");
                self.tracker.abandon(ticket);
            }
            Err(e) => {
                error!(worker = self.id, ticket = seq, error = %e, "unit failed, cursor withheld");
                self.tracker.abandon(ticket);
            }
        }
        let _ = done.send(());
    }

    async fn apply(&self, kind: &WorkKind) -> Result<()> {
        match kind {
            WorkKind::Batches(batches) => {
                let deletes = batches.iter().filter(|b| matches!(b.ops, BatchOps::Delete(_)));
                let creates = batches.iter().filter(|b| matches!(b.ops, BatchOps::Create(_)));
                for batch in deletes.chain(creates) {
                    self.engine.apply_batch(batch).await?;
                }
                Ok(())
            }
            WorkKind::Purge(purge) => self.engine.apply_purge(purge).await.map(|_| ()),
        }
    }
}
