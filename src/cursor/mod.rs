//! Cursor persistence and the shared advancement tracker.

pub mod store;
pub mod tracker;

pub use store::{
    resolve_start_cursor, Cursor, CursorStore, DryRunCursorStore, ObjectCursorStore,
    StartAdjustment,
};
pub use tracker::{Counter, CursorTracker, IntervalCounters, Ticket};
