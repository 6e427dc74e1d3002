//! Reading spooled SQLite databases.
//!
//! Spooled objects are SQLite files, optionally zstd-compressed. The
//! payload is probed by content, never by extension. Each row of the
//! `posts` table is re-shaped into the JSON form the live feed uses so
//! a single classifier handles both sources.

use rusqlite::{Connection, OpenFlags};
use serde_json::{json, Value};
use std::io::{Cursor, Error as IoError, ErrorKind, Result as IoResult, Write};
use std::path::Path;
use tempfile::NamedTempFile;

/// zstd frame magic number, little-endian 0xFD2FB528
const ZSTD_MAGIC: [u8; 4] = [0x28, 0xB5, 0x2F, 0xFD];

const SELECT_POSTS: &str =
    "SELECT did, rkey, time_us, operation, record FROM posts ORDER BY time_us, rowid";

pub fn is_zstd(data: &[u8]) -> bool {
    data.starts_with(&ZSTD_MAGIC)
}

/// Write the (decompressed) database to a temp file that is removed on drop
pub fn materialize(data: &[u8]) -> IoResult<NamedTempFile> {
    let mut file = NamedTempFile::new()?;
    if is_zstd(data) {
        let raw = zstd::decode_all(Cursor::new(data))?;
        file.write_all(&raw)?;
    } else {
        file.write_all(data)?;
    }
    file.flush()?;
    Ok(file)
}

/// One row of the `posts` table
#[derive(Debug, Clone, PartialEq)]
pub struct PostRow {
    pub did: String,
    pub rkey: String,
    pub time_us: i64,
    pub operation: Option<String>,
    /// Record body as JSON text; absent for deletes
    pub record: Option<String>,
}

impl PostRow {
    /// Re-shape into a feed commit event for collection `nsid`
    pub fn into_payload(self, nsid: &str) -> Value {
        let mut commit = json!({
            "operation": self.operation.unwrap_or_else(|| "create".to_string()),
            "collection": nsid,
            "rkey": self.rkey,
        });
        if let Some(record) = self
            .record
            .as_deref()
            .and_then(|text| serde_json::from_str::<Value>(text).ok())
        {
            commit["record"] = record;
        }
        json!({
            "did": self.did,
            "time_us": self.time_us,
            "kind": "commit",
            "commit": commit,
        })
    }
}

fn sqlite_error(e: rusqlite::Error) -> IoError {
    IoError::new(ErrorKind::InvalidData, format!("sqlite: {}", e))
}

/// Stream every row to `visit` in `(time_us, rowid)` order.
///
/// `visit` returns `false` to stop early. Returns the number of rows
/// visited. Blocking; call from a blocking context.
pub fn read_posts<F>(path: &Path, mut visit: F) -> IoResult<u64>
where
    F: FnMut(PostRow) -> bool,
{
    let conn = Connection::open_with_flags(
        path,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )
    .map_err(sqlite_error)?;
    let mut stmt = conn.prepare(SELECT_POSTS).map_err(sqlite_error)?;
    let mut rows = stmt.query([]).map_err(sqlite_error)?;

    let mut visited = 0u64;
    while let Some(row) = rows.next().map_err(sqlite_error)? {
        let post = PostRow {
            did: row.get(0).map_err(sqlite_error)?,
            rkey: row.get(1).map_err(sqlite_error)?,
            time_us: row.get(2).map_err(sqlite_error)?,
            operation: row.get(3).map_err(sqlite_error)?,
            record: row.get(4).map_err(sqlite_error)?,
        };
        visited += 1;
        if !visit(post) {
            break;
        }
    }
    Ok(visited)
}

/// Build a `posts` database at `path`. Used by tests and local tooling.
pub fn write_posts(path: &Path, rows: &[PostRow]) -> IoResult<()> {
    let mut conn = Connection::open(path).map_err(sqlite_error)?;
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS posts (
            did TEXT NOT NULL,
            rkey TEXT NOT NULL,
            time_us INTEGER NOT NULL,
            operation TEXT,
            record TEXT
        )",
    )
    .map_err(sqlite_error)?;
    let tx = conn.transaction().map_err(sqlite_error)?;
    {
        let mut insert = tx
            .prepare(
                "INSERT INTO posts (did, rkey, time_us, operation, record) VALUES (?1, ?2, ?3, ?4, ?5)",
            )
            .map_err(sqlite_error)?;
        for row in rows {
            insert
                .execute(rusqlite::params![
                    row.did,
                    row.rkey,
                    row.time_us,
                    row.operation,
                    row.record
                ])
                .map_err(sqlite_error)?;
        }
    }
    tx.commit().map_err(sqlite_error)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(rkey: &str, time_us: i64, text: Option<&str>) -> PostRow {
        PostRow {
            did: "d1".to_string(),
            rkey: rkey.to_string(),
            time_us,
            operation: Some(if text.is_some() { "create" } else { "delete" }.to_string()),
            record: text.map(|t| json!({ "text": t }).to_string()),
        }
    }

    fn database(rows: &[PostRow]) -> Vec<u8> {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("posts.db");
        write_posts(&path, rows).unwrap();
        std::fs::read(path).unwrap()
    }

    #[test]
    fn test_reads_plain_and_compressed_alike() {
        let rows = vec![row("b", 20, Some("second")), row("a", 10, Some("first"))];
        let plain = database(&rows);
        let compressed = zstd::encode_all(Cursor::new(&plain), 3).unwrap();
        assert!(!is_zstd(&plain));
        assert!(is_zstd(&compressed));

        for bytes in [plain, compressed] {
            let file = materialize(&bytes).unwrap();
            let mut seen = Vec::new();
            let count = read_posts(file.path(), |r| {
                seen.push(r.rkey);
                true
            })
            .unwrap();
            assert_eq!(count, 2);
            assert_eq!(seen, vec!["a", "b"]);
        }
    }

    #[test]
    fn test_garbage_is_an_error() {
        let file = materialize(b"definitely not sqlite").unwrap();
        assert!(read_posts(file.path(), |_| true).is_err());
    }

    #[test]
    fn test_truncated_zstd_is_an_error() {
        let compressed = zstd::encode_all(Cursor::new(vec![7u8; 4096]), 3).unwrap();
        assert!(materialize(&compressed[..8]).is_err());
    }

    #[test]
    fn test_row_payload_shape() {
        let payload = row("p1", 42, Some("hi")).into_payload("app.bsky.feed.post");
        assert_eq!(payload["did"], "d1");
        assert_eq!(payload["time_us"], 42);
        assert_eq!(payload["commit"]["collection"], "app.bsky.feed.post");
        assert_eq!(payload["commit"]["record"]["text"], "hi");

        let deleted = row("p1", 43, None).into_payload("app.bsky.feed.post");
        assert_eq!(deleted["commit"]["operation"], "delete");
        assert!(deleted["commit"].get("record").is_none());
    }

    #[test]
    fn test_visit_can_stop_early() {
        let bytes = database(&[row("a", 1, Some("x")), row("b", 2, Some("y"))]);
        let file = materialize(&bytes).unwrap();
        let count = read_posts(file.path(), |_| false).unwrap();
        assert_eq!(count, 1);
    }
}
