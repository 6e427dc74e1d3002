//! Error taxonomy for the ingestion pipeline.
//!
//! | Variant | Handling |
//! |---------|----------|
//! | `TransientIo` | reconnect (stream) or leave uncommitted for reprocessing |
//! | `Validation` | skip and count |
//! | `PartialBulkFailure` | log per item, withhold cursor for that unit |
//! | `SecondaryOperation` | log only |
//! | `FatalConfig` | abort before the processing loop |
//!
//! Only `FatalConfig` and startup cursor failures ever leave the
//! orchestrator; everything else is contained to one unit of work.

use std::io::Error as IoError;

/// A record that could not be mapped to a domain event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub reason: String,
}

impl ValidationError {
    pub fn new(reason: impl Into<String>) -> Self {
        ValidationError {
            reason: reason.into(),
        }
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "invalid record: {}", self.reason)
    }
}

impl std::error::Error for ValidationError {}

/// One rejected item of a bulk call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemFailure {
    pub id: String,
    pub reason: String,
}

/// Error type for pipeline operations
#[derive(Debug)]
pub enum IngestError {
    /// Connection, read or bulk-call failure
    TransientIo(String),
    /// Malformed or incomplete record
    Validation(ValidationError),
    /// Some items of a bulk call were rejected
    PartialBulkFailure {
        index: String,
        failures: Vec<ItemFailure>,
    },
    /// Derived-counter update failed
    SecondaryOperation(String),
    /// Required configuration missing or invalid
    FatalConfig(String),
    /// Cursor or spool storage failure
    Storage(IoError),
    /// JSON encode/decode failure
    Json(serde_json::Error),
}

impl std::fmt::Display for IngestError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IngestError::TransientIo(msg) => write!(f, "transient I/O error: {}", msg),
            IngestError::Validation(e) => write!(f, "{}", e),
            IngestError::PartialBulkFailure { index, failures } => write!(
                f,
                "bulk call on {} rejected {} item(s)",
                index,
                failures.len()
            ),
            IngestError::SecondaryOperation(msg) => {
                write!(f, "secondary operation failed: {}", msg)
            }
            IngestError::FatalConfig(msg) => write!(f, "configuration error: {}", msg),
            IngestError::Storage(e) => write!(f, "storage error: {}", e),
            IngestError::Json(e) => write!(f, "JSON error: {}", e),
        }
    }
}

impl std::error::Error for IngestError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            IngestError::Validation(e) => Some(e),
            IngestError::Storage(e) => Some(e),
            IngestError::Json(e) => Some(e),
            _ => None,
        }
    }
}

impl IngestError {
    /// Whether leaving the unit uncommitted and reprocessing later can fix it
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            IngestError::TransientIo(_)
                | IngestError::PartialBulkFailure { .. }
                | IngestError::Storage(_)
        )
    }
}

impl From<IoError> for IngestError {
    fn from(e: IoError) -> Self {
        IngestError::Storage(e)
    }
}

impl From<serde_json::Error> for IngestError {
    fn from(e: serde_json::Error) -> Self {
        IngestError::Json(e)
    }
}

impl From<ValidationError> for IngestError {
    fn from(e: ValidationError) -> Self {
        IngestError::Validation(e)
    }
}

pub type Result<T> = std::result::Result<T, IngestError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_partial_failure() {
        let err = IngestError::PartialBulkFailure {
            index: "likes".to_string(),
            failures: vec![ItemFailure {
                id: "at://d1/app.bsky.feed.like/x1".to_string(),
                reason: "mapper_parsing_exception".to_string(),
            }],
        };
        assert_eq!(err.to_string(), "bulk call on likes rejected 1 item(s)");
        assert!(err.is_transient());
    }

    #[test]
    fn test_fatal_config_not_transient() {
        let err = IngestError::FatalConfig("missing websocket url".to_string());
        assert!(!err.is_transient());
        assert!(err.to_string().contains("missing websocket url"));
    }

    #[test]
    fn test_io_conversion() {
        let io = IoError::new(std::io::ErrorKind::Other, "disk gone");
        let err: IngestError = io.into();
        assert!(matches!(err, IngestError::Storage(_)));
    }
}
