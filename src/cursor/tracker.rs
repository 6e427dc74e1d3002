//! Guarded cursor accumulator.
//!
//! The one piece of mutable state shared between the dispatcher and the
//! write workers. Everything else travels through channels.
//!
//! ```text
//! dispatcher ── begin() ──► Ticket ──► worker ── propose_advance / abandon
//!                                                        │
//!                              flush_if_due() ◄──────────┘
//!                                    │
//!                              CursorStore (≤ 1 write per interval)
//! ```
//!
//! Tickets are issued in source arrival order. The pending cursor only
//! moves to the position of the highest *contiguous* committed ticket,
//! so a unit finishing early never lets the cursor jump past an
//! earlier unit that is still running or that failed. An abandoned
//! ticket pins the cursor for the rest of the run; the units behind it
//! are replayed after restart. Once pinned, the cursor is frozen and
//! later resolutions are dropped instead of retained.

use crate::clock::Clock;
use crate::cursor::store::CursorStore;
use crate::error::Result;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Handle for one unit of work awaiting resolution
#[derive(Debug, PartialEq, Eq)]
pub struct Ticket(u64);

impl Ticket {
    pub fn seq(&self) -> u64 {
        self.0
    }
}

/// Per-interval pipeline counters, logged at every flush
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IntervalCounters {
    pub records: u64,
    pub created: u64,
    pub deleted: u64,
    pub tombstoned: u64,
    pub purged: u64,
    pub rejected: u64,
    pub dropped: u64,
    pub failed_units: u64,
    pub counter_failures: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Counter {
    Records,
    Created,
    Deleted,
    Tombstoned,
    Purged,
    Rejected,
    Dropped,
    FailedUnits,
    CounterFailures,
}

impl IntervalCounters {
    fn add(&mut self, counter: Counter, n: u64) {
        let slot = match counter {
            Counter::Records => &mut self.records,
            Counter::Created => &mut self.created,
            Counter::Deleted => &mut self.deleted,
            Counter::Tombstoned => &mut self.tombstoned,
            Counter::Purged => &mut self.purged,
            Counter::Rejected => &mut self.rejected,
            Counter::Dropped => &mut self.dropped,
            Counter::FailedUnits => &mut self.failed_units,
            Counter::CounterFailures => &mut self.counter_failures,
        };
        *slot = slot.saturating_add(n);
    }
}

#[derive(Debug, Clone, Copy)]
enum Resolution {
    Committed(Option<i64>),
    Abandoned,
}

struct TrackerState {
    next_ticket: u64,
    /// Lowest unresolved ticket
    low_water: u64,
    /// Resolutions above `low_water`
    resolved: BTreeMap<u64, Resolution>,
    /// Set once an abandoned ticket reaches `low_water`
    pinned: bool,
    pending_cursor: Option<i64>,
    flushed_cursor: i64,
    last_flush_us: i64,
    interval: IntervalCounters,
    totals: IntervalCounters,
}

impl TrackerState {
    fn drain_contiguous(&mut self) {
        while !self.pinned {
            let Some(resolution) = self.resolved.remove(&self.low_water) else {
                break;
            };
            match resolution {
                Resolution::Committed(position) => {
                    if let Some(position) = position {
                        let current = self.pending_cursor.unwrap_or(self.flushed_cursor);
                        if position > current {
                            self.pending_cursor = Some(position);
                        }
                    }
                    self.low_water += 1;
                }
                Resolution::Abandoned => {
                    warn!(
                        ticket = self.low_water,
                        position = self.pending_cursor.unwrap_or(self.flushed_cursor),
                        "cursor pinned behind uncommitted unit"
                    );
                    self.pinned = true;
                    self.resolved.clear();
                }
            }
        }
    }
}

/// Shared cursor candidate + interval counters behind a single mutex
pub struct CursorTracker {
    state: Mutex<TrackerState>,
    flush_interval: Duration,
    clock: Arc<dyn Clock>,
}

impl CursorTracker {
    /// `start_position` is the cursor the run resumed from
    pub fn new(start_position: i64, flush_interval: Duration, clock: Arc<dyn Clock>) -> Self {
        let now = clock.now_us();
        CursorTracker {
            state: Mutex::new(TrackerState {
                next_ticket: 0,
                low_water: 0,
                resolved: BTreeMap::new(),
                pinned: false,
                pending_cursor: None,
                flushed_cursor: start_position,
                last_flush_us: now,
                interval: IntervalCounters::default(),
                totals: IntervalCounters::default(),
            }),
            flush_interval,
            clock,
        }
    }

    /// Issue the next ticket in arrival order
    pub fn begin(&self) -> Ticket {
        let mut state = self.state.lock();
        let ticket = Ticket(state.next_ticket);
        state.next_ticket += 1;
        ticket
    }

    /// The unit is durably committed; `position` is where the cursor may
    /// move once every earlier unit has committed too.
    pub fn propose_advance(&self, ticket: Ticket, position: Option<i64>) {
        let mut state = self.state.lock();
        if state.pinned {
            return;
        }
        state
            .resolved
            .insert(ticket.0, Resolution::Committed(position));
        state.drain_contiguous();
    }

    /// The unit did not fully commit; the cursor must not pass it
    pub fn abandon(&self, ticket: Ticket) {
        let mut state = self.state.lock();
        state.interval.add(Counter::FailedUnits, 1);
        state.totals.add(Counter::FailedUnits, 1);
        if state.pinned {
            return;
        }
        state.resolved.insert(ticket.0, Resolution::Abandoned);
        state.drain_contiguous();
    }

    pub fn count(&self, counter: Counter, n: u64) {
        if n == 0 {
            return;
        }
        let mut state = self.state.lock();
        state.interval.add(counter, n);
        state.totals.add(counter, n);
    }

    /// Highest position safe to persist right now
    pub fn committed_position(&self) -> i64 {
        let state = self.state.lock();
        state.pending_cursor.unwrap_or(state.flushed_cursor)
    }

    pub fn is_pinned(&self) -> bool {
        self.state.lock().pinned
    }

    /// Lifetime counters of this run
    pub fn totals(&self) -> IntervalCounters {
        self.state.lock().totals
    }

    /// Flush the pending cursor if the flush interval has elapsed.
    /// Returns the position written, if any.
    pub async fn flush_if_due(&self, store: &dyn CursorStore) -> Result<Option<i64>> {
        let snapshot = {
            let mut state = self.state.lock();
            if self.clock.elapsed_since(state.last_flush_us) < self.flush_interval {
                return Ok(None);
            }
            Self::take_snapshot(&mut state, self.clock.now_us())
        };
        self.write_snapshot(store, snapshot).await
    }

    /// Unconditional flush, used on drain
    pub async fn force_flush(&self, store: &dyn CursorStore) -> Result<Option<i64>> {
        let snapshot = {
            let mut state = self.state.lock();
            Self::take_snapshot(&mut state, self.clock.now_us())
        };
        self.write_snapshot(store, snapshot).await
    }

    fn take_snapshot(state: &mut TrackerState, now_us: i64) -> (Option<i64>, IntervalCounters) {
        state.last_flush_us = now_us;
        (
            state.pending_cursor.take(),
            std::mem::take(&mut state.interval),
        )
    }

    async fn write_snapshot(
        &self,
        store: &dyn CursorStore,
        (candidate, counters): (Option<i64>, IntervalCounters),
    ) -> Result<Option<i64>> {
        info!(
            records = counters.records,
            created = counters.created,
            deleted = counters.deleted,
            tombstoned = counters.tombstoned,
            purged = counters.purged,
            rejected = counters.rejected,
            dropped = counters.dropped,
            failed_units = counters.failed_units,
            counter_failures = counters.counter_failures,
            cursor = ?candidate,
            "interval stats"
        );

        let Some(position) = candidate else {
            return Ok(None);
        };

        match store.update_cursor(position).await {
            Ok(()) => {
                let mut state = self.state.lock();
                if position > state.flushed_cursor {
                    state.flushed_cursor = position;
                }
                Ok(Some(position))
            }
            Err(e) => {
                // Put the candidate back so the next flush retries it.
                let mut state = self.state.lock();
                let current = state.pending_cursor.unwrap_or(position);
                state.pending_cursor = Some(current.max(position));
                Err(e)
            }
        }
    }
}
