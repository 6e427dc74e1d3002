//! Bounded same-kind batching.
//!
//! Creates and deletes accumulate in separate open batches. A batch is
//! handed off when it reaches `max_batch_size`, on an explicit flush, or
//! when an account purge needs everything before it committed first.

use crate::event::{CreateEvent, DeleteEvent, DomainEvent, PurgeEvent};

/// Events of one kind, ready to commit
#[derive(Debug, Clone, PartialEq)]
pub enum BatchOps {
    Create(Vec<CreateEvent>),
    Delete(Vec<DeleteEvent>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    pub ops: BatchOps,
    /// Largest event timestamp in the batch
    pub max_time_us: i64,
}

impl Batch {
    pub fn len(&self) -> usize {
        match &self.ops {
            BatchOps::Create(events) => events.len(),
            BatchOps::Delete(events) => events.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Result of feeding one event to the accumulator
#[derive(Debug, PartialEq)]
pub enum Accumulated {
    /// Event buffered, nothing to hand off yet
    Buffered,
    /// A full batch to hand off
    Ready(Batch),
    /// Purge barrier: `flushed` must commit before `purge` is applied.
    /// `discarded` buffered events of the author postdated the purge.
    Purge {
        flushed: Vec<Batch>,
        discarded: usize,
        purge: PurgeEvent,
    },
}

struct OpenBatch<T> {
    events: Vec<T>,
    max_time_us: i64,
}

impl<T> OpenBatch<T> {
    fn new(capacity: usize) -> Self {
        OpenBatch {
            events: Vec::with_capacity(capacity),
            max_time_us: i64::MIN,
        }
    }

    fn push(&mut self, event: T, time_us: i64) {
        self.events.push(event);
        self.max_time_us = self.max_time_us.max(time_us);
    }

    fn take(&mut self, capacity: usize) -> Option<(Vec<T>, i64)> {
        if self.events.is_empty() {
            return None;
        }
        let max = self.max_time_us;
        self.max_time_us = i64::MIN;
        Some((std::mem::replace(&mut self.events, Vec::with_capacity(capacity)), max))
    }
}

/// Groups classified events into bounded batches, separated by kind
pub struct BatchAccumulator {
    max_batch_size: usize,
    creates: OpenBatch<CreateEvent>,
    deletes: OpenBatch<DeleteEvent>,
}

impl BatchAccumulator {
    pub fn new(max_batch_size: usize) -> Self {
        let max_batch_size = max_batch_size.max(1);
        BatchAccumulator {
            max_batch_size,
            creates: OpenBatch::new(max_batch_size),
            deletes: OpenBatch::new(max_batch_size),
        }
    }

    /// Number of buffered events across both kinds
    pub fn buffered(&self) -> usize {
        self.creates.events.len() + self.deletes.events.len()
    }

    pub fn push(&mut self, event: DomainEvent) -> Accumulated {
        match event {
            DomainEvent::Create(create) => {
                let time_us = create.time_us;
                self.creates.push(create, time_us);
                if self.creates.events.len() >= self.max_batch_size {
                    return self.take_creates().map_or(Accumulated::Buffered, Accumulated::Ready);
                }
                Accumulated::Buffered
            }
            DomainEvent::Delete(delete) => {
                // A create still buffered here would otherwise be applied
                // after its own delete. Cancel the pair instead.
                let before = self.creates.events.len();
                self.creates.events.retain(|c| c.doc_id != delete.doc_id);
                if self.creates.events.len() != before {
                    self.recompute_max();
                }
                let time_us = delete.time_us;
                self.deletes.push(delete, time_us);
                if self.deletes.events.len() >= self.max_batch_size {
                    return self.take_deletes().map_or(Accumulated::Buffered, Accumulated::Ready);
                }
                Accumulated::Buffered
            }
            DomainEvent::AccountPurge(purge) => {
                let (flushed, discarded) = self.prepare_purge(&purge.author_id, purge.time_us);
                Accumulated::Purge {
                    flushed,
                    discarded,
                    purge,
                }
            }
        }
    }

    /// Drop buffered events of `author_id` newer than `time_us`, then
    /// flush everything else. Returns the flushed batches and the number
    /// of events dropped.
    pub fn prepare_purge(&mut self, author_id: &str, time_us: i64) -> (Vec<Batch>, usize) {
        let before = self.buffered();
        self.creates
            .events
            .retain(|c| c.author_id != author_id || c.time_us <= time_us);
        self.deletes
            .events
            .retain(|d| d.author_id != author_id || d.time_us <= time_us);
        let discarded = before - self.buffered();
        self.recompute_max();
        (self.flush(), discarded)
    }

    /// Hand off everything buffered, deletes before creates
    pub fn flush(&mut self) -> Vec<Batch> {
        self.take_deletes()
            .into_iter()
            .chain(self.take_creates())
            .collect()
    }

    fn take_creates(&mut self) -> Option<Batch> {
        self.creates
            .take(self.max_batch_size)
            .map(|(events, max_time_us)| Batch {
                ops: BatchOps::Create(events),
                max_time_us,
            })
    }

    fn take_deletes(&mut self) -> Option<Batch> {
        self.deletes
            .take(self.max_batch_size)
            .map(|(events, max_time_us)| Batch {
                ops: BatchOps::Delete(events),
                max_time_us,
            })
    }

    fn recompute_max(&mut self) {
        self.creates.max_time_us = self
            .creates
            .events
            .iter()
            .map(|e| e.time_us)
            .max()
            .unwrap_or(i64::MIN);
        self.deletes.max_time_us = self
            .deletes
            .events
            .iter()
            .map(|e| e.time_us)
            .max()
            .unwrap_or(i64::MIN);
    }
}
