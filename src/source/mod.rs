//! Event sources.
//!
//! The variant set is closed and chosen from configuration at startup:
//!
//! | Variant | Input | Cursor granularity |
//! |---------|-------|--------------------|
//! | `Stream` | websocket feed | per record |
//! | `LocalSpool` | database drops in a local directory | per file |
//! | `RemoteSpool` | database drops under an S3 prefix | per file |
//!
//! Every source writes into one bounded channel and drops its sender
//! when it stops, which is how the dispatcher learns the input ended.

pub mod filename;
pub mod spool;
pub mod sqlite;
pub mod stream;

pub use spool::{FileOutcome, SpoolCandidate, SpoolSource};
pub use stream::{StreamSource, StreamState};

use crate::error::Result;
use crate::event::RawRecord;
#[cfg(feature = "s3")]
use crate::storage::S3ObjectStore;
use crate::storage::LocalFsObjectStore;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// What a source hands to the dispatcher
#[derive(Debug, Clone, PartialEq)]
pub enum SourceItem {
    Record(RawRecord),
    /// Every record before this marker has been handed off; the cursor
    /// may reach `time_us` once they are all committed
    Checkpoint(i64),
}

/// Where the resumable position comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorGranularity {
    /// Each record's own `time_us`
    PerRecord,
    /// Only explicit [`SourceItem::Checkpoint`] markers
    PerCheckpoint,
}

pub enum Source {
    Stream(StreamSource),
    LocalSpool(SpoolSource<LocalFsObjectStore>),
    #[cfg(feature = "s3")]
    RemoteSpool(SpoolSource<S3ObjectStore>),
}

impl Source {
    pub fn name(&self) -> &'static str {
        match self {
            Source::Stream(_) => "stream",
            Source::LocalSpool(_) => "local-spool",
            #[cfg(feature = "s3")]
            Source::RemoteSpool(_) => "remote-spool",
        }
    }

    pub fn granularity(&self) -> CursorGranularity {
        match self {
            Source::Stream(_) => CursorGranularity::PerRecord,
            Source::LocalSpool(_) => CursorGranularity::PerCheckpoint,
            #[cfg(feature = "s3")]
            Source::RemoteSpool(_) => CursorGranularity::PerCheckpoint,
        }
    }

    /// Produce until exhausted or cancelled; the channel closes on return
    pub async fn run(self, tx: mpsc::Sender<SourceItem>, cancel: CancellationToken) -> Result<()> {
        match self {
            Source::Stream(source) => source.run(tx, cancel).await,
            Source::LocalSpool(source) => source.run(tx, cancel).await,
            #[cfg(feature = "s3")]
            Source::RemoteSpool(source) => source.run(tx, cancel).await,
        }
    }
}
