//! Spooled file source.
//!
//! Discovers timestamped database drops under a prefix and replays them
//! oldest first as a pseudo-stream. The position advances per file: a
//! [`SourceItem::Checkpoint`] follows the last row of each file, and the
//! cursor only reaches it once every batch from that file has committed.
//! Reprocessing a whole file after a crash mid-file is harmless because
//! writes are idempotent by document id.

use crate::clock::Clock;
use crate::config::{SpoolConfig, SpoolMode};
use crate::error::{IngestError, Result};
use crate::event::{Provenance, RawRecord};
use crate::source::filename::parse_spool_timestamp;
use crate::source::sqlite::{materialize, read_posts};
use crate::source::SourceItem;
use crate::storage::ObjectStore;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// A discovered spool object
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpoolCandidate {
    pub key: String,
    pub time_us: i64,
}

/// How a single file ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileOutcome {
    /// Every row was handed off, checkpoint emitted
    Complete { rows: u64 },
    /// Stopped before the end; no checkpoint
    Interrupted,
}

pub struct SpoolSource<S: ObjectStore> {
    store: S,
    file_prefix: String,
    mode: SpoolMode,
    interval: Duration,
    collection: String,
    /// Timestamp of the last file fully handed off
    position_us: i64,
    clock: Arc<dyn Clock>,
}

impl<S: ObjectStore> SpoolSource<S> {
    pub fn new(
        store: S,
        config: &SpoolConfig,
        collection: &str,
        start_time_us: i64,
        clock: Arc<dyn Clock>,
    ) -> Self {
        SpoolSource {
            store,
            file_prefix: config.file_prefix.clone(),
            mode: config.mode,
            interval: config.interval,
            collection: collection.to_string(),
            position_us: start_time_us,
            clock,
        }
    }

    pub fn position_us(&self) -> i64 {
        self.position_us
    }

    /// Candidates newer than the current position, oldest first
    pub async fn discover(&self) -> Result<Vec<SpoolCandidate>> {
        let objects = self.store.list(&self.file_prefix).await?;
        let mut candidates: Vec<SpoolCandidate> = objects
            .into_iter()
            .filter_map(|meta| {
                let time_us = parse_spool_timestamp(&meta.key, &self.file_prefix)?;
                (time_us > self.position_us).then_some(SpoolCandidate {
                    key: meta.key,
                    time_us,
                })
            })
            .collect();
        candidates.sort_by(|a, b| (a.time_us, &a.key).cmp(&(b.time_us, &b.key)));
        Ok(candidates)
    }

    /// Stream one file's rows into `tx`, then its checkpoint.
    ///
    /// Errors mean the file could not be fetched, decompressed or read;
    /// rows already handed off stay handed off, but no checkpoint is sent.
    pub async fn process_one(
        &mut self,
        candidate: &SpoolCandidate,
        tx: &mpsc::Sender<SourceItem>,
        cancel: &CancellationToken,
    ) -> Result<FileOutcome> {
        let data = self.store.get(&candidate.key).await?;
        debug!(key = %candidate.key, bytes = data.len(), "spool file fetched");

        let key = candidate.key.clone();
        let collection = self.collection.clone();
        let clock = self.clock.clone();
        let rows_tx = tx.clone();
        let rows_cancel = cancel.clone();

        // rusqlite is blocking; rows cross back through the bounded
        // channel, so a slow pipeline stalls the reader rather than memory.
        let (rows, complete) = tokio::task::spawn_blocking(move || -> Result<(u64, bool)> {
            let file = materialize(&data)?;
            drop(data);
            let mut complete = true;
            let mut row_index = 0u64;
            let rows = read_posts(file.path(), |row| {
                if rows_cancel.is_cancelled() {
                    complete = false;
                    return false;
                }
                let record = RawRecord {
                    payload: row.into_payload(&collection),
                    provenance: Provenance::Spool {
                        key: key.clone(),
                        row: row_index,
                    },
                    arrival_time_us: clock.now_us(),
                };
                row_index += 1;
                if rows_tx.blocking_send(SourceItem::Record(record)).is_err() {
                    complete = false;
                    return false;
                }
                true
            })?;
            Ok((rows, complete))
        })
        .await
        .map_err(|e| IngestError::TransientIo(format!("spool reader task failed: {}", e)))??;

        if !complete {
            return Ok(FileOutcome::Interrupted);
        }
        if tx.send(SourceItem::Checkpoint(candidate.time_us)).await.is_err() {
            return Ok(FileOutcome::Interrupted);
        }
        self.position_us = self.position_us.max(candidate.time_us);
        info!(key = %candidate.key, rows, position_us = self.position_us, "spool file handed off");
        Ok(FileOutcome::Complete { rows })
    }

    /// One discovery + processing pass. Returns `false` once the run
    /// should stop (cancelled or nobody listening).
    async fn pass(&mut self, tx: &mpsc::Sender<SourceItem>, cancel: &CancellationToken) -> bool {
        let candidates = match self.discover().await {
            Ok(candidates) => candidates,
            Err(e) => {
                warn!(prefix = %self.file_prefix, error = %e, "spool discovery failed");
                return !tx.is_closed();
            }
        };
        debug!(candidates = candidates.len(), position_us = self.position_us, "spool pass");

        for candidate in candidates {
            if cancel.is_cancelled() {
                return false;
            }
            match self.process_one(&candidate, tx, cancel).await {
                Ok(FileOutcome::Complete { .. }) => {}
                Ok(FileOutcome::Interrupted) => return false,
                Err(e) => {
                    // Later files wait too: the cursor must not pass this one.
                    error!(key = %candidate.key, error = %e, "spool file unreadable, retrying next pass");
                    return !tx.is_closed();
                }
            }
        }
        true
    }

    /// Run in the configured mode. `tx` is dropped on return.
    pub async fn run(mut self, tx: mpsc::Sender<SourceItem>, cancel: CancellationToken) -> Result<()> {
        loop {
            if !self.pass(&tx, &cancel).await {
                break;
            }
            if self.mode == SpoolMode::Once {
                break;
            }
            tokio::select! {
                () = tokio::time::sleep(self.interval) => {}
                _ = cancel.cancelled() => break,
            }
        }
        info!(position_us = self.position_us, "spool source closed");
        Ok(())
    }
}
