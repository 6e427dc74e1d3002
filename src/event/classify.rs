//! Shape-based classification of raw records.
//!
//! The feed carries no single discriminant, so the decision is made here,
//! once, from the payload's shape:
//!
//! | Shape | Event |
//! |-------|-------|
//! | `commit.record` with a subject (likes) or text (posts), not an update | `Create` |
//! | `commit.operation == "delete"` with an `rkey` | `Delete` |
//! | `account` with `active: false` and a terminal status, no `commit` | `AccountPurge` |
//!
//! Anything else is a [`ValidationError`]: counted and skipped.

use crate::config::CollectionKind;
use crate::error::ValidationError;
use crate::event::{
    record_uri, CreateEvent, DeleteEvent, DomainEvent, PurgeEvent, RawRecord,
};
use serde_json::Value;

/// Account statuses after which nothing the author published may remain
const PURGE_STATUSES: &[&str] = &["deleted", "takendown"];

/// Collection-specific classification rules
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CollectionSpec {
    pub kind: CollectionKind,
    /// Record collection identifier in the feed
    pub nsid: &'static str,
}

impl CollectionSpec {
    pub const LIKES: CollectionSpec = CollectionSpec {
        kind: CollectionKind::Likes,
        nsid: "app.bsky.feed.like",
    };
    pub const POSTS: CollectionSpec = CollectionSpec {
        kind: CollectionKind::Posts,
        nsid: "app.bsky.feed.post",
    };

    pub fn for_kind(kind: CollectionKind) -> Self {
        match kind {
            CollectionKind::Likes => Self::LIKES,
            CollectionKind::Posts => Self::POSTS,
        }
    }

    /// Extract the referenced document from a record body.
    ///
    /// `Err` when the collection requires a subject and it is missing.
    fn subject_of(&self, record: &Value) -> Result<Option<String>, ValidationError> {
        match self.kind {
            CollectionKind::Likes => str_at(record, &["subject", "uri"])
                .map(|uri| Some(uri.to_string()))
                .ok_or_else(|| ValidationError::new("like without subject.uri")),
            CollectionKind::Posts => {
                if !record.get("text").is_some_and(Value::is_string) {
                    return Err(ValidationError::new("post without text"));
                }
                Ok(str_at(record, &["reply", "parent", "uri"]).map(str::to_string))
            }
        }
    }
}

fn str_at<'a>(value: &'a Value, path: &[&str]) -> Option<&'a str> {
    path.iter()
        .try_fold(value, |v, key| v.get(*key))
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
}

/// Map a raw record to exactly one domain event
pub fn classify(raw: &RawRecord, spec: &CollectionSpec) -> Result<DomainEvent, ValidationError> {
    let payload = &raw.payload;
    let author_id = str_at(payload, &["did"])
        .ok_or_else(|| ValidationError::new("missing did"))?
        .to_string();
    let time_us = payload
        .get("time_us")
        .and_then(Value::as_i64)
        .ok_or_else(|| ValidationError::new("missing time_us"))?;

    match (payload.get("commit"), payload.get("account")) {
        (Some(commit), _) => classify_commit(commit, spec, author_id, time_us),
        (None, Some(account)) => classify_account(account, author_id, time_us),
        (None, None) => Err(ValidationError::new("neither commit nor account payload")),
    }
}

fn classify_commit(
    commit: &Value,
    spec: &CollectionSpec,
    author_id: String,
    time_us: i64,
) -> Result<DomainEvent, ValidationError> {
    let collection = str_at(commit, &["collection"])
        .ok_or_else(|| ValidationError::new("commit without collection"))?;
    if collection != spec.nsid {
        return Err(ValidationError::new(format!(
            "unexpected collection {}",
            collection
        )));
    }
    let rkey = str_at(commit, &["rkey"]).ok_or_else(|| ValidationError::new("commit without rkey"))?;
    let doc_id = record_uri(&author_id, collection, rkey);
    let operation = str_at(commit, &["operation"]);

    if operation == Some("delete") {
        return Ok(DomainEvent::Delete(DeleteEvent {
            doc_id,
            author_id,
            time_us,
        }));
    }

    let record = commit
        .get("record")
        .filter(|r| r.is_object())
        .ok_or_else(|| ValidationError::new("commit without record"))?;
    // An update rewrites a prior version; only first publication is indexed.
    if operation == Some("update") {
        return Err(ValidationError::new("record update is not indexed"));
    }
    let subject_id = spec.subject_of(record)?;

    Ok(DomainEvent::Create(CreateEvent {
        doc_id,
        subject_id,
        author_id,
        payload: record.clone(),
        time_us,
    }))
}

fn classify_account(
    account: &Value,
    author_id: String,
    time_us: i64,
) -> Result<DomainEvent, ValidationError> {
    let active = account
        .get("active")
        .and_then(Value::as_bool)
        .ok_or_else(|| ValidationError::new("account without active flag"))?;
    if active {
        return Err(ValidationError::new("account is active"));
    }
    match str_at(account, &["status"]) {
        Some(status) if PURGE_STATUSES.contains(&status) => {
            Ok(DomainEvent::AccountPurge(PurgeEvent { author_id, time_us }))
        }
        other => Err(ValidationError::new(format!(
            "inactive account with recoverable status {:?}",
            other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Provenance;
    use serde_json::json;

    fn raw(payload: Value) -> RawRecord {
        RawRecord {
            payload,
            provenance: Provenance::Stream { connection: 0 },
            arrival_time_us: 0,
        }
    }

    #[test]
    fn test_like_create() {
        let event = classify(
            &raw(json!({
                "did": "d1",
                "time_us": 1000,
                "kind": "commit",
                "commit": {
                    "operation": "create",
                    "collection": "app.bsky.feed.like",
                    "rkey": "x1",
                    "record": {"subject": {"uri": "y1", "cid": "c"}, "createdAt": "2025-01-01T00:00:00Z"}
                }
            })),
            &CollectionSpec::LIKES,
        )
        .unwrap();

        match event {
            DomainEvent::Create(e) => {
                assert_eq!(e.doc_id, "at://d1/app.bsky.feed.like/x1");
                assert_eq!(e.subject_id.as_deref(), Some("y1"));
                assert_eq!(e.author_id, "d1");
                assert_eq!(e.time_us, 1000);
            }
            other => panic!("expected create, got {:?}", other),
        }
    }

    #[test]
    fn test_create_without_operation_field_is_shape_classified() {
        let event = classify(
            &raw(json!({
                "did": "d1",
                "time_us": 5,
                "commit": {"collection": "app.bsky.feed.post", "rkey": "p1", "record": {"text": "hi"}}
            })),
            &CollectionSpec::POSTS,
        )
        .unwrap();
        assert!(matches!(event, DomainEvent::Create(ref e) if e.subject_id.is_none()));
    }

    #[test]
    fn test_post_reply_has_subject() {
        let event = classify(
            &raw(json!({
                "did": "d1",
                "time_us": 5,
                "commit": {
                    "collection": "app.bsky.feed.post",
                    "rkey": "p2",
                    "record": {"text": "re", "reply": {"parent": {"uri": "at://d2/app.bsky.feed.post/p1"}}}
                }
            })),
            &CollectionSpec::POSTS,
        )
        .unwrap();
        assert!(matches!(
            event,
            DomainEvent::Create(ref e) if e.subject_id.as_deref() == Some("at://d2/app.bsky.feed.post/p1")
        ));
    }

    #[test]
    fn test_delete() {
        let event = classify(
            &raw(json!({
                "did": "d1",
                "time_us": 2000,
                "commit": {"operation": "delete", "collection": "app.bsky.feed.like", "rkey": "x9"}
            })),
            &CollectionSpec::LIKES,
        )
        .unwrap();
        assert_eq!(
            event,
            DomainEvent::Delete(DeleteEvent {
                doc_id: "at://d1/app.bsky.feed.like/x9".to_string(),
                author_id: "d1".to_string(),
                time_us: 2000,
            })
        );
    }

    #[test]
    fn test_account_purge() {
        let event = classify(
            &raw(json!({
                "did": "d1",
                "time_us": 3000,
                "kind": "account",
                "account": {"active": false, "status": "deleted"}
            })),
            &CollectionSpec::LIKES,
        )
        .unwrap();
        assert_eq!(
            event,
            DomainEvent::AccountPurge(PurgeEvent {
                author_id: "d1".to_string(),
                time_us: 3000,
            })
        );
    }

    #[test]
    fn test_rejections() {
        let cases = [
            json!({"time_us": 1, "commit": {}}),
            json!({"did": "d1", "commit": {}}),
            json!({"did": "d1", "time_us": 1, "identity": {"handle": "x"}}),
            json!({"did": "d1", "time_us": 1, "account": {"active": true}}),
            json!({"did": "d1", "time_us": 1, "account": {"active": false, "status": "deactivated"}}),
            json!({"did": "d1", "time_us": 1, "commit": {"collection": "app.bsky.feed.like", "operation": "delete"}}),
            json!({"did": "d1", "time_us": 1, "commit": {"collection": "app.bsky.graph.follow", "rkey": "r", "record": {}}}),
            json!({"did": "d1", "time_us": 1, "commit": {"collection": "app.bsky.feed.like", "rkey": "r", "record": {"createdAt": "x"}}}),
            json!({"did": "d1", "time_us": 1, "commit": {"operation": "update", "collection": "app.bsky.feed.like", "rkey": "r", "record": {"subject": {"uri": "y"}}}}),
        ];
        for payload in cases {
            assert!(
                classify(&raw(payload.clone()), &CollectionSpec::LIKES).is_err(),
                "should reject {}",
                payload
            );
        }
    }
}
