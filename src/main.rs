//! feed-indexer
//!
//! Runs one ingestion pipeline for one collection until interrupted.
//! Configuration comes from `INDEXER_CONFIG` and `INDEXER_*` variables;
//! see [`feed_indexer::config`] for the full list.

#[cfg(not(target_env = "msvc"))]
use tikv_jemallocator::Jemalloc;

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

use feed_indexer::config::{CursorBackend, IndexBackend, IndexerConfig};
use feed_indexer::cursor::{CursorStore, ObjectCursorStore};
use feed_indexer::index::{DocumentStore, InMemoryDocumentStore};
use feed_indexer::observability::{init_tracing, LogConfig};
use feed_indexer::storage::{InMemoryObjectStore, LocalFsObjectStore};
use feed_indexer::{IngestError, Orchestrator, SystemClock};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing(&LogConfig::from_env());

    let config = IndexerConfig::load()?;
    config.validate()?;

    let cursor_store = build_cursor_store(&config)?;
    let doc_store = build_document_store(&config)?;

    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        signal_cancel.cancel();
    });

    let orchestrator = Orchestrator::new(config, cursor_store, doc_store, Arc::new(SystemClock::new()));
    match orchestrator.run(cancel).await {
        Ok(summary) => {
            info!(
                exit = ?summary.exit,
                start_cursor = summary.start_cursor,
                final_cursor = summary.final_cursor,
                created = summary.totals.created,
                deleted = summary.totals.deleted,
                purged = summary.totals.purged,
                "run complete"
            );
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "indexer failed");
            Err(e.into())
        }
    }
}

/// Resolves on SIGINT or SIGTERM. A listener that cannot be installed
/// is logged and never fires.
#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let listen = |kind: SignalKind, name: &'static str| {
        let installed = signal(kind);
        async move {
            match installed {
                Ok(mut stream) => {
                    stream.recv().await;
                }
                Err(e) => {
                    error!(signal = name, error = %e, "cannot listen for signal");
                    std::future::pending::<()>().await;
                }
            }
            name
        }
    };

    let name = tokio::select! {
        name = listen(SignalKind::terminate(), "SIGTERM") => name,
        name = listen(SignalKind::interrupt(), "SIGINT") => name,
    };
    info!(signal = name, "shutdown requested, draining");
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("interrupt received, draining"),
        Err(e) => {
            error!(error = %e, "cannot listen for interrupt");
            std::future::pending::<()>().await;
        }
    }
}

fn build_cursor_store(config: &IndexerConfig) -> Result<Arc<dyn CursorStore>, IngestError> {
    let name = config.cursor_name();
    match config.cursor.backend {
        CursorBackend::LocalFs => {
            std::fs::create_dir_all(&config.cursor.dir)?;
            Ok(Arc::new(ObjectCursorStore::new(
                LocalFsObjectStore::new(config.cursor.dir.clone()),
                &name,
            )))
        }
        CursorBackend::Memory => Ok(Arc::new(ObjectCursorStore::new(
            InMemoryObjectStore::new(),
            &name,
        ))),
        #[cfg(feature = "s3")]
        CursorBackend::S3 => {
            let s3 = config.cursor.s3.as_ref().ok_or_else(|| {
                IngestError::FatalConfig("s3 cursor store requires a bucket".to_string())
            })?;
            let store = feed_indexer::storage::S3ObjectStore::new(s3)
                .map_err(|e| IngestError::FatalConfig(format!("S3 cursor store: {}", e)))?;
            Ok(Arc::new(ObjectCursorStore::new(store, &name)))
        }
        #[cfg(not(feature = "s3"))]
        CursorBackend::S3 => Err(IngestError::FatalConfig(
            "s3 cursor store requires a build with --features s3".to_string(),
        )),
    }
}

fn build_document_store(config: &IndexerConfig) -> Result<Arc<dyn DocumentStore>, IngestError> {
    match config.index.backend {
        IndexBackend::Memory => {
            warn!("memory index backend: documents are lost on exit");
            Ok(Arc::new(InMemoryDocumentStore::new()))
        }
        #[cfg(feature = "elasticsearch")]
        IndexBackend::Elasticsearch => Ok(Arc::new(
            feed_indexer::index::ElasticsearchStore::new(&config.index)?,
        )),
        #[cfg(not(feature = "elasticsearch"))]
        IndexBackend::Elasticsearch => Err(IngestError::FatalConfig(
            "elasticsearch backend requires a build with --features elasticsearch".to_string(),
        )),
    }
}
