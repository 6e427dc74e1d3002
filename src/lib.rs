//! Ingestion pipeline for a social feed: consumes a realtime websocket
//! stream or batched SQLite spool files, classifies records, batches
//! them and writes them to a document store with tombstones, derived
//! counters and a guarded resume cursor.

pub mod clock;
pub mod config;
pub mod cursor;
pub mod error;
pub mod event;
pub mod index;
pub mod observability;
pub mod pipeline;
pub mod source;
pub mod storage;

pub use clock::{Clock, SimulatedClock, SystemClock};
pub use config::IndexerConfig;
pub use error::{IngestError, Result};
pub use pipeline::{ExitReason, Orchestrator, RunSummary};
