//! Spool Pipeline Tests
//!
//! End-to-end runs of the orchestrator over SQLite drops in a temporary
//! directory, with the in-memory document store behind the write path.

use feed_indexer::config::{
    CollectionKind, IndexBackend, IndexConfig, IndexerConfig, PipelineConfig,
    SourceKind, SpoolConfig, SpoolMode,
};
use feed_indexer::cursor::{CursorStore, ObjectCursorStore};
use feed_indexer::index::{
    Document, DocumentStore, FaultConfig, FaultyDocumentStore, InMemoryDocumentStore,
};
use feed_indexer::source::filename::spool_file_name;
use feed_indexer::source::sqlite::{write_posts, PostRow};
use feed_indexer::storage::InMemoryObjectStore;
use feed_indexer::{ExitReason, Orchestrator, SystemClock};
use serde_json::json;
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

const T0: i64 = 1_735_689_600_000_000;
const HOUR: i64 = 3_600_000_000;

type MemoryCursorStore = ObjectCursorStore<InMemoryObjectStore>;

// =============================================================================
// Helpers
// =============================================================================

fn post_uri(did: &str, rkey: &str) -> String {
    format!("at://{}/app.bsky.feed.post/{}", did, rkey)
}

fn post(did: &str, rkey: &str, time_us: i64) -> PostRow {
    PostRow {
        did: did.to_string(),
        rkey: rkey.to_string(),
        time_us,
        operation: Some("create".to_string()),
        record: Some(json!({"text": format!("post {}", rkey)}).to_string()),
    }
}

fn reply(did: &str, rkey: &str, parent: &str, time_us: i64) -> PostRow {
    PostRow {
        record: Some(json!({"text": "re", "reply": {"parent": {"uri": parent}}}).to_string()),
        ..post(did, rkey, time_us)
    }
}

fn delete(did: &str, rkey: &str, time_us: i64) -> PostRow {
    PostRow {
        did: did.to_string(),
        rkey: rkey.to_string(),
        time_us,
        operation: Some("delete".to_string()),
        record: None,
    }
}

/// Write one drop named after `time_us`, optionally zstd-compressed
fn drop_file(dir: &Path, time_us: i64, rows: &[PostRow], compress: bool) {
    let suffix = if compress { ".db.zst" } else { ".db" };
    let name = spool_file_name("posts", time_us, suffix).unwrap();
    let scratch = tempfile::tempdir().unwrap();
    let db = scratch.path().join("drop.db");
    write_posts(&db, rows).unwrap();
    let bytes = std::fs::read(&db).unwrap();
    let bytes = if compress {
        zstd::encode_all(std::io::Cursor::new(bytes), 3).unwrap()
    } else {
        bytes
    };
    std::fs::write(dir.join(name), bytes).unwrap();
}

/// Two drops: replies to a post in the first, a reply and a delete in the second
fn standard_drops(dir: &Path) {
    drop_file(
        dir,
        T0,
        &[post("d1", "p1", 10), reply("d2", "p2", &post_uri("d1", "p1"), 20)],
        false,
    );
    drop_file(
        dir,
        T0 + HOUR,
        &[reply("d3", "p3", &post_uri("d1", "p1"), 30), delete("d1", "p0", 40)],
        true,
    );
}

fn seed_p0(store: &InMemoryDocumentStore) {
    store.insert(
        "posts",
        Document {
            id: post_uri("d1", "p0"),
            author_id: "d1".to_string(),
            subject_id: None,
            time_us: 1,
            body: json!({"text": "old"}),
        },
    );
}

fn config(dir: &Path) -> IndexerConfig {
    IndexerConfig {
        collection: CollectionKind::Posts,
        source: SourceKind::LocalSpool,
        spool: SpoolConfig {
            path: Some(dir.to_path_buf()),
            file_prefix: "posts".to_string(),
            mode: SpoolMode::Once,
            ..SpoolConfig::default()
        },
        index: IndexConfig {
            backend: IndexBackend::Memory,
            ..IndexConfig::default()
        },
        pipeline: PipelineConfig::test(),
        ..IndexerConfig::default()
    }
}

fn cursor_store() -> Arc<MemoryCursorStore> {
    Arc::new(ObjectCursorStore::new(InMemoryObjectStore::new(), "posts"))
}

async fn run(
    config: IndexerConfig,
    cursors: &Arc<MemoryCursorStore>,
    docs: Arc<dyn DocumentStore>,
) -> feed_indexer::RunSummary {
    let cursors: Arc<dyn CursorStore> = cursors.clone();
    Orchestrator::new(config, cursors, docs, Arc::new(SystemClock::new()))
        .run(CancellationToken::new())
        .await
        .unwrap()
}

async fn stored_cursor(cursors: &MemoryCursorStore) -> Option<i64> {
    cursors
        .get_cursor()
        .await
        .unwrap()
        .map(|c| c.last_processed_time_us)
}

// =============================================================================
// Tests
// =============================================================================

#[tokio::test]
async fn test_spool_once_indexes_files_and_advances_cursor() {
    let dir = tempfile::tempdir().unwrap();
    standard_drops(dir.path());
    let docs = InMemoryDocumentStore::new();
    seed_p0(&docs);
    let cursors = cursor_store();

    let summary = run(config(dir.path()), &cursors, Arc::new(docs.clone())).await;

    assert_eq!(summary.exit, ExitReason::SourceEnded);
    assert_eq!(summary.final_cursor, T0 + HOUR);
    assert!(!summary.pinned);
    assert_eq!(stored_cursor(&cursors).await, Some(T0 + HOUR));

    assert_eq!(docs.count("posts"), 3);
    assert_eq!(docs.counter("posts", &post_uri("d1", "p1"), "reply_count"), Some(2));
    assert!(!docs.contains("posts", &post_uri("d1", "p0")));
    let tombstone = docs.get("post_tombstones", &post_uri("d1", "p0")).unwrap();
    assert_eq!(tombstone.body["original_time_us"], 1);
    assert_eq!(summary.totals.created, 3);
    assert_eq!(summary.totals.tombstoned, 1);
}

#[tokio::test]
async fn test_replay_from_zero_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    standard_drops(dir.path());
    let docs = InMemoryDocumentStore::new();
    seed_p0(&docs);

    run(config(dir.path()), &cursor_store(), Arc::new(docs.clone())).await;
    let posts_after_first = docs.count("posts");
    let tombstones_after_first = docs.count("post_tombstones");

    // Fresh cursor store: every file is processed a second time.
    let summary = run(config(dir.path()), &cursor_store(), Arc::new(docs.clone())).await;

    assert_eq!(summary.final_cursor, T0 + HOUR);
    assert_eq!(summary.totals.created, 0);
    assert_eq!(docs.count("posts"), posts_after_first);
    assert_eq!(docs.count("post_tombstones"), tombstones_after_first);
    assert_eq!(docs.counter("posts", &post_uri("d1", "p1"), "reply_count"), Some(2));
}

#[tokio::test]
async fn test_resume_skips_files_at_or_before_cursor() {
    let dir = tempfile::tempdir().unwrap();
    standard_drops(dir.path());
    let docs = InMemoryDocumentStore::new();
    let cursors = cursor_store();
    cursors.update_cursor(T0).await.unwrap();

    let summary = run(config(dir.path()), &cursors, Arc::new(docs.clone())).await;

    assert_eq!(summary.start_cursor, T0);
    assert_eq!(summary.final_cursor, T0 + HOUR);
    assert!(!docs.contains("posts", &post_uri("d1", "p1")));
    assert!(docs.contains("posts", &post_uri("d3", "p3")));
    // The parent was never indexed; a missing counter target is not a failure.
    assert_eq!(docs.counter("posts", &post_uri("d1", "p1"), "reply_count"), None);
    assert_eq!(summary.totals.counter_failures, 0);
}

#[tokio::test]
async fn test_partial_failure_withholds_cursor() {
    let dir = tempfile::tempdir().unwrap();
    standard_drops(dir.path());
    let inner = InMemoryDocumentStore::new();
    let p3 = post_uri("d3", "p3");
    let docs = FaultyDocumentStore::new(inner.clone(), FaultConfig::reject(&[p3.as_str()]));
    let cursors = cursor_store();

    let summary = run(config(dir.path()), &cursors, Arc::new(docs)).await;

    assert_eq!(summary.exit, ExitReason::SourceEnded);
    assert_eq!(summary.final_cursor, T0);
    assert!(summary.pinned);
    assert_eq!(summary.totals.failed_units, 1);
    assert_eq!(stored_cursor(&cursors).await, Some(T0));
    assert!(!inner.contains("posts", &p3));
}

#[tokio::test]
async fn test_corrupt_file_stops_the_pass() {
    let dir = tempfile::tempdir().unwrap();
    standard_drops(dir.path());
    let corrupt = spool_file_name("posts", T0 + HOUR / 2, ".db").unwrap();
    std::fs::write(dir.path().join(corrupt), b"not a database").unwrap();
    let docs = InMemoryDocumentStore::new();
    let cursors = cursor_store();

    let summary = run(config(dir.path()), &cursors, Arc::new(docs.clone())).await;

    assert_eq!(summary.final_cursor, T0);
    assert!(docs.contains("posts", &post_uri("d1", "p1")));
    assert!(!docs.contains("posts", &post_uri("d3", "p3")));
}

#[tokio::test]
async fn test_dry_run_performs_no_writes() {
    let dir = tempfile::tempdir().unwrap();
    standard_drops(dir.path());
    let docs = InMemoryDocumentStore::new();
    seed_p0(&docs);
    let cursors = cursor_store();
    let config = IndexerConfig {
        dry_run: true,
        ..config(dir.path())
    };

    let summary = run(config, &cursors, Arc::new(docs.clone())).await;

    assert!(docs.ops().is_empty());
    assert!(docs.contains("posts", &post_uri("d1", "p0")));
    assert_eq!(docs.count("post_tombstones"), 0);
    assert_eq!(cursors.get_cursor().await.unwrap(), None);
    // The pipeline itself still ran to the end of the input.
    assert_eq!(summary.final_cursor, T0 + HOUR);
    assert_eq!(summary.totals.records, 4);
}

#[tokio::test]
async fn test_missing_spool_path_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config(dir.path());
    config.spool.path = None;
    let cursors: Arc<dyn CursorStore> = cursor_store();

    let result = Orchestrator::new(
        config,
        cursors,
        Arc::new(InMemoryDocumentStore::new()),
        Arc::new(SystemClock::new()),
    )
    .run(CancellationToken::new())
    .await;

    assert!(matches!(result, Err(feed_indexer::IngestError::FatalConfig(_))));
}
