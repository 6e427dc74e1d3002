//! Raw records, typed domain events and batches.
//!
//! ```text
//! RawRecord ──classify()──► DomainEvent ──BatchAccumulator──► Batch
//! ```

pub mod batch;
pub mod classify;

pub use batch::{Accumulated, Batch, BatchAccumulator, BatchOps};
pub use classify::{classify, CollectionSpec};

use serde_json::Value;

/// Where a raw record came from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Provenance {
    /// Websocket feed; `connection` counts reconnects within the run
    Stream { connection: u64 },
    /// Row of a spooled database file
    Spool { key: String, row: u64 },
}

/// Opaque payload as delivered by a source
#[derive(Debug, Clone, PartialEq)]
pub struct RawRecord {
    pub payload: Value,
    pub provenance: Provenance,
    /// Local receive time, epoch microseconds
    pub arrival_time_us: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CreateEvent {
    /// Deterministic record URI, used as the document id
    pub doc_id: String,
    /// Referenced document whose derived counter this event bumps
    pub subject_id: Option<String>,
    pub author_id: String,
    /// The record body as published
    pub payload: Value,
    pub time_us: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeleteEvent {
    pub doc_id: String,
    pub author_id: String,
    pub time_us: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PurgeEvent {
    pub author_id: String,
    pub time_us: i64,
}

/// Classified event; exactly one per accepted raw record
#[derive(Debug, Clone, PartialEq)]
pub enum DomainEvent {
    Create(CreateEvent),
    Delete(DeleteEvent),
    AccountPurge(PurgeEvent),
}

impl DomainEvent {
    pub fn time_us(&self) -> i64 {
        match self {
            DomainEvent::Create(e) => e.time_us,
            DomainEvent::Delete(e) => e.time_us,
            DomainEvent::AccountPurge(e) => e.time_us,
        }
    }

    pub fn author_id(&self) -> &str {
        match self {
            DomainEvent::Create(e) => &e.author_id,
            DomainEvent::Delete(e) => &e.author_id,
            DomainEvent::AccountPurge(e) => &e.author_id,
        }
    }
}

/// Build the record URI that doubles as the document id
pub fn record_uri(author_id: &str, collection: &str, rkey: &str) -> String {
    format!("at://{}/{}/{}", author_id, collection, rkey)
}
