//! Persisted resume position and instance marker.
//!
//! The whole record is one small JSON object under a single key, read
//! and written as a unit:
//!
//! ```text
//! cursors/{name}.json → {"last_processed_time_us": .., "instance_start_time_us": ..}
//! ```

use crate::clock::MICROS_PER_MINUTE;
use crate::error::{IngestError, Result};
use crate::storage::ObjectStore;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::io::ErrorKind;
use std::pin::Pin;
use tracing::{debug, info};

/// High-water mark of a source plus the identity of the newest instance
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cursor {
    pub last_processed_time_us: i64,
    pub instance_start_time_us: i64,
}

/// Persisted key-value cursor capability
///
/// Callers throttle writes; the store itself writes on every call.
pub trait CursorStore: Send + Sync + 'static {
    /// Read the record, `None` if it was never written
    fn get_cursor(&self) -> Pin<Box<dyn Future<Output = Result<Option<Cursor>>> + Send + '_>>;

    /// Advance the stored position. A value that is not an increase is ignored.
    fn update_cursor(&self, time_us: i64) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;

    /// Overwrite the position unconditionally. Startup only.
    fn reset_cursor(&self, time_us: i64) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;

    /// Record this process as the newest instance
    fn write_instance_info(
        &self,
        start_time_us: i64,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;

    /// Whether an instance started after `my_start_time_us` has registered
    fn check_for_newer_instance(
        &self,
        my_start_time_us: i64,
    ) -> Pin<Box<dyn Future<Output = Result<bool>> + Send + '_>>;
}

/// Cursor store over any [`ObjectStore`] backend
pub struct ObjectCursorStore<S: ObjectStore> {
    store: S,
    key: String,
}

impl<S: ObjectStore> ObjectCursorStore<S> {
    pub fn new(store: S, name: &str) -> Self {
        ObjectCursorStore {
            store,
            key: format!("cursors/{}.json", name),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    async fn read(&self) -> Result<Option<Cursor>> {
        match self.store.get(&self.key).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(IngestError::Storage(e)),
        }
    }

    async fn write(&self, cursor: &Cursor) -> Result<()> {
        let bytes = serde_json::to_vec(cursor)?;
        self.store.put(&self.key, &bytes).await?;
        Ok(())
    }
}

impl<S: ObjectStore> CursorStore for ObjectCursorStore<S> {
    fn get_cursor(&self) -> Pin<Box<dyn Future<Output = Result<Option<Cursor>>> + Send + '_>> {
        Box::pin(self.read())
    }

    fn update_cursor(&self, time_us: i64) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async move {
            // Re-read so a newer instance marker is never clobbered.
            let mut cursor = self.read().await?.unwrap_or_default();
            if time_us <= cursor.last_processed_time_us {
                debug!(
                    stored = cursor.last_processed_time_us,
                    proposed = time_us,
                    "cursor not advanced"
                );
                return Ok(());
            }
            cursor.last_processed_time_us = time_us;
            self.write(&cursor).await
        })
    }

    fn reset_cursor(&self, time_us: i64) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async move {
            let mut cursor = self.read().await?.unwrap_or_default();
            info!(
                from = cursor.last_processed_time_us,
                to = time_us,
                "resetting cursor"
            );
            cursor.last_processed_time_us = time_us;
            self.write(&cursor).await
        })
    }

    fn write_instance_info(
        &self,
        start_time_us: i64,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async move {
            let mut cursor = self.read().await?.unwrap_or_default();
            cursor.instance_start_time_us = start_time_us;
            self.write(&cursor).await
        })
    }

    fn check_for_newer_instance(
        &self,
        my_start_time_us: i64,
    ) -> Pin<Box<dyn Future<Output = Result<bool>> + Send + '_>> {
        Box::pin(async move {
            Ok(self
                .read()
                .await?
                .is_some_and(|c| c.instance_start_time_us > my_start_time_us))
        })
    }
}

impl<T: CursorStore + ?Sized> CursorStore for std::sync::Arc<T> {
    fn get_cursor(&self) -> Pin<Box<dyn Future<Output = Result<Option<Cursor>>> + Send + '_>> {
        (**self).get_cursor()
    }

    fn update_cursor(&self, time_us: i64) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        (**self).update_cursor(time_us)
    }

    fn reset_cursor(&self, time_us: i64) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        (**self).reset_cursor(time_us)
    }

    fn write_instance_info(
        &self,
        start_time_us: i64,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        (**self).write_instance_info(start_time_us)
    }

    fn check_for_newer_instance(
        &self,
        my_start_time_us: i64,
    ) -> Pin<Box<dyn Future<Output = Result<bool>> + Send + '_>> {
        (**self).check_for_newer_instance(my_start_time_us)
    }
}

/// Dry-run wrapper: reads pass through, writes are logged and dropped
pub struct DryRunCursorStore<S> {
    inner: S,
}

impl<S: CursorStore> DryRunCursorStore<S> {
    pub fn new(inner: S) -> Self {
        DryRunCursorStore { inner }
    }
}

impl<S: CursorStore> CursorStore for DryRunCursorStore<S> {
    fn get_cursor(&self) -> Pin<Box<dyn Future<Output = Result<Option<Cursor>>> + Send + '_>> {
        self.inner.get_cursor()
    }

    fn update_cursor(&self, time_us: i64) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async move {
            debug!(time_us, "dry run: cursor update suppressed");
            Ok(())
        })
    }

    fn reset_cursor(&self, time_us: i64) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async move {
            debug!(time_us, "dry run: cursor reset suppressed");
            Ok(())
        })
    }

    fn write_instance_info(
        &self,
        start_time_us: i64,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async move {
            debug!(start_time_us, "dry run: instance marker suppressed");
            Ok(())
        })
    }

    fn check_for_newer_instance(
        &self,
        my_start_time_us: i64,
    ) -> Pin<Box<dyn Future<Output = Result<bool>> + Send + '_>> {
        self.inner.check_for_newer_instance(my_start_time_us)
    }
}

/// Why the start position differs from the stored one
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartAdjustment {
    /// Resume exactly where the store says
    None,
    /// `no_rewind` requested: start at now
    NoRewind,
    /// Stored position was older than the rewind bound
    Clamped,
}

/// Resolve the position processing resumes from.
///
/// `no_rewind` wins; otherwise the stored position (0 if absent) is
/// clamped to `now - max_rewind_minutes`.
pub fn resolve_start_cursor(
    stored: Option<Cursor>,
    no_rewind: bool,
    max_rewind_minutes: Option<u64>,
    now_us: i64,
) -> (i64, StartAdjustment) {
    if no_rewind {
        return (now_us, StartAdjustment::NoRewind);
    }
    let resumed = stored.map_or(0, |c| c.last_processed_time_us);
    if let Some(minutes) = max_rewind_minutes {
        let floor = now_us.saturating_sub((minutes as i64).saturating_mul(MICROS_PER_MINUTE));
        if resumed < floor {
            return (floor, StartAdjustment::Clamped);
        }
    }
    (resumed, StartAdjustment::None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InMemoryObjectStore;

    const NOW: i64 = 1_700_000_000_000_000;

    #[tokio::test]
    async fn test_missing_cursor_is_none() {
        let store = ObjectCursorStore::new(InMemoryObjectStore::new(), "likes");
        assert_eq!(store.get_cursor().await.unwrap(), None);
        assert_eq!(store.key(), "cursors/likes.json");
    }

    #[tokio::test]
    async fn test_update_only_increases() {
        let store = ObjectCursorStore::new(InMemoryObjectStore::new(), "likes");

        store.update_cursor(100).await.unwrap();
        store.update_cursor(50).await.unwrap();
        assert_eq!(
            store.get_cursor().await.unwrap().unwrap().last_processed_time_us,
            100
        );

        store.update_cursor(200).await.unwrap();
        assert_eq!(
            store.get_cursor().await.unwrap().unwrap().last_processed_time_us,
            200
        );
    }

    #[tokio::test]
    async fn test_reset_can_rewind() {
        let store = ObjectCursorStore::new(InMemoryObjectStore::new(), "likes");
        store.update_cursor(500).await.unwrap();
        store.reset_cursor(10).await.unwrap();
        assert_eq!(
            store.get_cursor().await.unwrap().unwrap().last_processed_time_us,
            10
        );
    }

    #[tokio::test]
    async fn test_instance_marker_survives_cursor_updates() {
        let backing = InMemoryObjectStore::new();
        let old = ObjectCursorStore::new(backing.clone(), "likes");
        let new = ObjectCursorStore::new(backing, "likes");

        old.write_instance_info(1_000).await.unwrap();
        assert!(!old.check_for_newer_instance(1_000).await.unwrap());

        new.write_instance_info(2_000).await.unwrap();
        // The older instance keeps advancing but must not erase the marker.
        old.update_cursor(42).await.unwrap();

        assert!(old.check_for_newer_instance(1_000).await.unwrap());
        assert!(!new.check_for_newer_instance(2_000).await.unwrap());
        let record = new.get_cursor().await.unwrap().unwrap();
        assert_eq!(record.last_processed_time_us, 42);
        assert_eq!(record.instance_start_time_us, 2_000);
    }

    #[test]
    fn test_resolve_resumes_stored() {
        let stored = Cursor {
            last_processed_time_us: NOW - 1_000,
            instance_start_time_us: 0,
        };
        assert_eq!(
            resolve_start_cursor(Some(stored), false, None, NOW),
            (NOW - 1_000, StartAdjustment::None)
        );
        assert_eq!(resolve_start_cursor(None, false, None, NOW), (0, StartAdjustment::None));
    }

    #[test]
    fn test_resolve_no_rewind() {
        let stored = Cursor {
            last_processed_time_us: 5,
            instance_start_time_us: 0,
        };
        assert_eq!(
            resolve_start_cursor(Some(stored), true, Some(10), NOW),
            (NOW, StartAdjustment::NoRewind)
        );
    }

    #[test]
    fn test_resolve_clamp_law() {
        for minutes in [0u64, 1, 15, 60 * 24] {
            for stored in [None, Some(0), Some(NOW - 3_600_000_000), Some(NOW)] {
                let stored = stored.map(|t| Cursor {
                    last_processed_time_us: t,
                    instance_start_time_us: 0,
                });
                let (start, _) = resolve_start_cursor(stored, false, Some(minutes), NOW);
                assert!(start >= NOW - minutes as i64 * MICROS_PER_MINUTE);
            }
        }
    }

    #[test]
    fn test_resolve_clamp_reports_adjustment() {
        let stored = Cursor {
            last_processed_time_us: NOW - 2 * 60 * MICROS_PER_MINUTE,
            instance_start_time_us: 0,
        };
        assert_eq!(
            resolve_start_cursor(Some(stored), false, Some(60), NOW),
            (NOW - 60 * MICROS_PER_MINUTE, StartAdjustment::Clamped)
        );
    }

    #[tokio::test]
    async fn test_dry_run_store_drops_writes() {
        let inner = std::sync::Arc::new(ObjectCursorStore::new(InMemoryObjectStore::new(), "likes"));
        inner.update_cursor(100).await.unwrap();
        let store = DryRunCursorStore::new(inner.clone());

        store.update_cursor(500).await.unwrap();
        store.reset_cursor(1).await.unwrap();
        store.write_instance_info(NOW).await.unwrap();

        let cursor = store.get_cursor().await.unwrap().unwrap();
        assert_eq!(cursor.last_processed_time_us, 100);
        assert_eq!(cursor.instance_start_time_us, 0);
    }
}
