//! Indexer Configuration
//!
//! Loaded from an optional TOML file (`INDEXER_CONFIG`) and then
//! overridden by environment variables, so a container can run with no
//! file at all.
//!
//! ## Environment Variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | INDEXER_CONFIG | - | Path to a TOML config file |
//! | INDEXER_COLLECTION | likes | likes or posts |
//! | INDEXER_SOURCE | stream | stream, local-spool or remote-spool |
//! | INDEXER_STREAM_URL | - | Websocket feed URL (required for stream) |
//! | INDEXER_SPOOL_PATH | - | Spool directory (required for local-spool) |
//! | INDEXER_SPOOL_PREFIX | posts | File name prefix of spool drops |
//! | INDEXER_SPOOL_MODE | spool | once or spool |
//! | INDEXER_SPOOL_INTERVAL_SECS | 60 | Rediscovery interval in spool mode |
//! | INDEXER_S3_BUCKET | - | Bucket for remote spool / cursor |
//! | INDEXER_S3_PREFIX | feed-indexer | Key prefix inside the bucket |
//! | INDEXER_S3_ENDPOINT | - | MinIO / LocalStack endpoint |
//! | AWS_REGION | us-east-1 | S3 region |
//! | INDEXER_INDEX_BACKEND | elasticsearch | elasticsearch or memory |
//! | INDEXER_ES_URL | - | Elasticsearch base URL |
//! | INDEXER_ES_USERNAME / INDEXER_ES_PASSWORD | - | Basic auth |
//! | INDEXER_CURSOR_STORE | localfs | localfs, s3 or memory |
//! | INDEXER_CURSOR_DIR | ./state | Cursor directory for localfs |
//! | INDEXER_DRY_RUN | false | Suppress all mutating calls |
//! | INDEXER_NO_REWIND | false | Start at "now" instead of the stored cursor |
//! | INDEXER_MAX_REWIND_MINUTES | - | Clamp the resumed cursor |
//! | INDEXER_MAX_BATCH_SIZE | 100 | Events per batch |
//! | INDEXER_WORKERS | 4 | Write worker pool size |
//! | INDEXER_CURSOR_FLUSH_SECS | 10 | Cursor flush interval |

use crate::error::IngestError;
use serde::de::IntoDeserializer;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

const DEFAULT_S3_REGION: &str = "us-east-1";
const DEFAULT_S3_PREFIX: &str = "feed-indexer";

// Explicit limits
const MAX_BATCH_SIZE_MAX: usize = 10_000;
const WORKER_POOL_SIZE_MAX: usize = 256;

/// Which record collection this process indexes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CollectionKind {
    Likes,
    Posts,
}

/// Source selected at construction time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SourceKind {
    /// Realtime websocket feed
    Stream,
    /// Spool directory on the local filesystem
    LocalSpool,
    /// Spool prefix in an S3-compatible bucket
    RemoteSpool,
}

/// Spool run mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpoolMode {
    /// One discovery + process pass, then terminate
    Once,
    /// Rediscover on a fixed interval until cancelled
    Spool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IndexBackend {
    Elasticsearch,
    /// Process-local store; useful for smoke runs and tests
    Memory,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CursorBackend {
    LocalFs,
    S3,
    Memory,
}

/// S3 configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct S3Config {
    pub bucket: String,
    /// Key prefix within bucket
    pub prefix: String,
    pub region: String,
    /// Custom endpoint (for S3-compatible services like MinIO)
    pub endpoint: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    pub url: Option<String>,
    /// Read deadline so the loop can observe cancellation
    #[serde(with = "duration_secs")]
    pub read_timeout: Duration,
    /// Fixed delay between reconnect attempts
    #[serde(with = "duration_secs")]
    pub reconnect_backoff: Duration,
    pub reconnect: bool,
    /// Capacity of the source record channel (drop-newest when full)
    pub channel_capacity: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        StreamConfig {
            url: None,
            read_timeout: Duration::from_secs(1),
            reconnect_backoff: Duration::from_secs(5),
            reconnect: true,
            channel_capacity: 10_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SpoolConfig {
    pub path: Option<PathBuf>,
    pub file_prefix: String,
    pub mode: SpoolMode,
    #[serde(with = "duration_secs")]
    pub interval: Duration,
    pub s3: Option<S3Config>,
}

impl Default for SpoolConfig {
    fn default() -> Self {
        SpoolConfig {
            path: None,
            file_prefix: "posts".to_string(),
            mode: SpoolMode::Spool,
            interval: Duration::from_secs(60),
            s3: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexConfig {
    pub backend: IndexBackend,
    pub url: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub posts_index: String,
    pub likes_index: String,
    pub post_tombstones_index: String,
    pub like_tombstones_index: String,
    #[serde(with = "duration_secs")]
    pub request_timeout: Duration,
}

impl Default for IndexConfig {
    fn default() -> Self {
        IndexConfig {
            backend: IndexBackend::Elasticsearch,
            url: None,
            username: None,
            password: None,
            posts_index: "posts".to_string(),
            likes_index: "likes".to_string(),
            post_tombstones_index: "post_tombstones".to_string(),
            like_tombstones_index: "like_tombstones".to_string(),
            request_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CursorConfig {
    pub backend: CursorBackend,
    pub dir: PathBuf,
    pub s3: Option<S3Config>,
    /// Key name of the cursor record; defaults to the collection name
    pub name: Option<String>,
}

impl Default for CursorConfig {
    fn default() -> Self {
        CursorConfig {
            backend: CursorBackend::LocalFs,
            dir: PathBuf::from("./state"),
            s3: None,
            name: None,
        }
    }
}

/// Batching, concurrency and shutdown settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub max_batch_size: usize,
    pub worker_pool_size: usize,
    /// Depth of the batch queue between dispatcher and workers
    pub queue_depth: usize,
    #[serde(with = "duration_secs")]
    pub cursor_flush_interval: Duration,
    /// Per in-flight unit bound during drain
    #[serde(with = "duration_secs")]
    pub shutdown_grace: Duration,
    /// How long a flush may wait for queue space once draining
    #[serde(with = "duration_secs")]
    pub drain_enqueue_timeout: Duration,
    /// Processed records between newer-instance checks
    pub instance_check_every: u64,
    pub purge_page_size: usize,
    #[serde(with = "duration_secs")]
    pub purge_query_timeout: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        PipelineConfig {
            max_batch_size: 100,
            worker_pool_size: 4,
            queue_depth: 8,
            cursor_flush_interval: Duration::from_secs(10),
            shutdown_grace: Duration::from_secs(30),
            drain_enqueue_timeout: Duration::from_secs(5),
            instance_check_every: 1_000,
            purge_page_size: 500,
            purge_query_timeout: Duration::from_secs(10),
        }
    }
}

impl PipelineConfig {
    /// Configuration for tests (small batches, fast timers)
    pub fn test() -> Self {
        PipelineConfig {
            max_batch_size: 3,
            worker_pool_size: 2,
            queue_depth: 4,
            cursor_flush_interval: Duration::from_millis(50),
            shutdown_grace: Duration::from_secs(2),
            drain_enqueue_timeout: Duration::from_millis(500),
            instance_check_every: 5,
            purge_page_size: 2,
            purge_query_timeout: Duration::from_secs(1),
        }
    }
}

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexerConfig {
    pub collection: CollectionKind,
    pub source: SourceKind,
    pub dry_run: bool,
    pub no_rewind: bool,
    pub max_rewind_minutes: Option<u64>,
    pub stream: StreamConfig,
    pub spool: SpoolConfig,
    pub index: IndexConfig,
    pub cursor: CursorConfig,
    pub pipeline: PipelineConfig,
}

impl Default for IndexerConfig {
    fn default() -> Self {
        IndexerConfig {
            collection: CollectionKind::Likes,
            source: SourceKind::Stream,
            dry_run: false,
            no_rewind: false,
            max_rewind_minutes: None,
            stream: StreamConfig::default(),
            spool: SpoolConfig::default(),
            index: IndexConfig::default(),
            cursor: CursorConfig::default(),
            pipeline: PipelineConfig::default(),
        }
    }
}

impl IndexerConfig {
    /// Load from `INDEXER_CONFIG` (if set) and the process environment
    pub fn load() -> Result<Self, IngestError> {
        let mut config = match std::env::var("INDEXER_CONFIG") {
            Ok(path) => Self::from_toml_file(&PathBuf::from(path))?,
            Err(_) => IndexerConfig::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    pub fn from_toml_file(path: &PathBuf) -> Result<Self, IngestError> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            IngestError::FatalConfig(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&text)
    }

    pub fn from_toml_str(text: &str) -> Result<Self, IngestError> {
        toml::from_str(text).map_err(|e| IngestError::FatalConfig(format!("invalid TOML: {}", e)))
    }

    /// Apply overrides from a variable lookup (the environment in production)
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), IngestError>
    where
        F: Fn(&str) -> Option<String>,
    {
        fn parse<T: std::str::FromStr>(key: &str, value: String) -> Result<T, IngestError> {
            value
                .trim()
                .parse()
                .map_err(|_| IngestError::FatalConfig(format!("{} has invalid value {:?}", key, value)))
        }
        fn flag(value: String) -> bool {
            matches!(value.trim().to_lowercase().as_str(), "1" | "true" | "yes")
        }
        fn enum_value<T: for<'de> Deserialize<'de>>(key: &str, value: String) -> Result<T, IngestError> {
            let normalized = value.trim().to_lowercase();
            let de: serde::de::value::StrDeserializer<'_, serde::de::value::Error> =
                normalized.as_str().into_deserializer();
            T::deserialize(de)
                .map_err(|_| IngestError::FatalConfig(format!("{} has invalid value {:?}", key, value)))
        }

        if let Some(v) = lookup("INDEXER_COLLECTION") {
            self.collection = enum_value("INDEXER_COLLECTION", v)?;
        }
        if let Some(v) = lookup("INDEXER_SOURCE") {
            self.source = enum_value("INDEXER_SOURCE", v)?;
        }
        if let Some(v) = lookup("INDEXER_STREAM_URL") {
            self.stream.url = Some(v);
        }
        if let Some(v) = lookup("INDEXER_SPOOL_PATH") {
            self.spool.path = Some(PathBuf::from(v));
        }
        if let Some(v) = lookup("INDEXER_SPOOL_PREFIX") {
            self.spool.file_prefix = v;
        }
        if let Some(v) = lookup("INDEXER_SPOOL_MODE") {
            self.spool.mode = enum_value("INDEXER_SPOOL_MODE", v)?;
        }
        if let Some(v) = lookup("INDEXER_SPOOL_INTERVAL_SECS") {
            self.spool.interval = Duration::from_secs(parse("INDEXER_SPOOL_INTERVAL_SECS", v)?);
        }
        if let Some(bucket) = lookup("INDEXER_S3_BUCKET") {
            let s3 = S3Config {
                bucket,
                prefix: lookup("INDEXER_S3_PREFIX").unwrap_or_else(|| DEFAULT_S3_PREFIX.to_string()),
                region: lookup("AWS_REGION").unwrap_or_else(|| DEFAULT_S3_REGION.to_string()),
                endpoint: lookup("INDEXER_S3_ENDPOINT"),
            };
            self.spool.s3 = Some(s3.clone());
            self.cursor.s3 = Some(s3);
        }
        if let Some(v) = lookup("INDEXER_INDEX_BACKEND") {
            self.index.backend = enum_value("INDEXER_INDEX_BACKEND", v)?;
        }
        if let Some(v) = lookup("INDEXER_ES_URL") {
            self.index.url = Some(v);
        }
        if let Some(v) = lookup("INDEXER_ES_USERNAME") {
            self.index.username = Some(v);
        }
        if let Some(v) = lookup("INDEXER_ES_PASSWORD") {
            self.index.password = Some(v);
        }
        if let Some(v) = lookup("INDEXER_CURSOR_STORE") {
            self.cursor.backend = enum_value("INDEXER_CURSOR_STORE", v)?;
        }
        if let Some(v) = lookup("INDEXER_CURSOR_DIR") {
            self.cursor.dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("INDEXER_DRY_RUN") {
            self.dry_run = flag(v);
        }
        if let Some(v) = lookup("INDEXER_NO_REWIND") {
            self.no_rewind = flag(v);
        }
        if let Some(v) = lookup("INDEXER_MAX_REWIND_MINUTES") {
            self.max_rewind_minutes = Some(parse("INDEXER_MAX_REWIND_MINUTES", v)?);
        }
        if let Some(v) = lookup("INDEXER_MAX_BATCH_SIZE") {
            self.pipeline.max_batch_size = parse("INDEXER_MAX_BATCH_SIZE", v)?;
        }
        if let Some(v) = lookup("INDEXER_WORKERS") {
            self.pipeline.worker_pool_size = parse("INDEXER_WORKERS", v)?;
        }
        if let Some(v) = lookup("INDEXER_CURSOR_FLUSH_SECS") {
            self.pipeline.cursor_flush_interval =
                Duration::from_secs(parse("INDEXER_CURSOR_FLUSH_SECS", v)?);
        }
        Ok(())
    }

    /// Name of the cursor record
    pub fn cursor_name(&self) -> String {
        self.cursor.name.clone().unwrap_or_else(|| match self.collection {
            CollectionKind::Likes => "likes".to_string(),
            CollectionKind::Posts => "posts".to_string(),
        })
    }

    /// Reject configurations that cannot reach their collaborators
    pub fn validate(&self) -> Result<(), IngestError> {
        let fatal = |msg: &str| Err(IngestError::FatalConfig(msg.to_string()));

        match self.source {
            SourceKind::Stream if self.stream.url.as_deref().map_or(true, str::is_empty) => {
                return fatal("stream source requires INDEXER_STREAM_URL");
            }
            SourceKind::LocalSpool if self.spool.path.is_none() => {
                return fatal("local-spool source requires INDEXER_SPOOL_PATH");
            }
            SourceKind::RemoteSpool => {
                if self.spool.s3.as_ref().map_or(true, |s3| s3.bucket.is_empty()) {
                    return fatal("remote-spool source requires INDEXER_S3_BUCKET");
                }
                if !cfg!(feature = "s3") {
                    return fatal("remote-spool requires a build with --features s3");
                }
            }
            _ => {}
        }

        if self.index.backend == IndexBackend::Elasticsearch {
            if self.index.url.as_deref().map_or(true, str::is_empty) {
                return fatal("elasticsearch backend requires INDEXER_ES_URL");
            }
            if !cfg!(feature = "elasticsearch") {
                return fatal("elasticsearch backend requires a build with --features elasticsearch");
            }
        }

        if self.cursor.backend == CursorBackend::S3 {
            if self.cursor.s3.is_none() {
                return fatal("s3 cursor store requires INDEXER_S3_BUCKET");
            }
            if !cfg!(feature = "s3") {
                return fatal("s3 cursor store requires a build with --features s3");
            }
        }

        let p = &self.pipeline;
        if p.max_batch_size == 0 || p.max_batch_size > MAX_BATCH_SIZE_MAX {
            return fatal("max_batch_size must be in 1..=10000");
        }
        if p.worker_pool_size == 0 || p.worker_pool_size > WORKER_POOL_SIZE_MAX {
            return fatal("worker_pool_size must be in 1..=256");
        }
        if p.queue_depth == 0 || p.purge_page_size == 0 || p.instance_check_every == 0 {
            return fatal("queue_depth, purge_page_size and instance_check_every must be positive");
        }
        if p.cursor_flush_interval.is_zero() {
            return fatal("cursor_flush_interval must be positive");
        }
        if self.stream.read_timeout.is_zero() {
            return fatal("stream read_timeout must be positive");
        }
        Ok(())
    }
}

/// Serde helper for Duration as whole seconds
mod duration_secs {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_secs_f64().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = f64::deserialize(deserializer)?;
        if !secs.is_finite() || secs < 0.0 {
            return Err(serde::de::Error::custom("duration must be non-negative"));
        }
        Ok(Duration::from_secs_f64(secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_default_config() {
        let config = IndexerConfig::default();
        assert_eq!(config.pipeline.max_batch_size, 100);
        assert_eq!(config.pipeline.cursor_flush_interval, Duration::from_secs(10));
        assert_eq!(config.stream.reconnect_backoff, Duration::from_secs(5));
        assert_eq!(config.cursor_name(), "likes");
    }

    #[test]
    fn test_stream_without_url_is_fatal() {
        let config = IndexerConfig::default();
        let err = config.validate().unwrap_err();
        assert!(matches!(err, IngestError::FatalConfig(_)));
    }

    #[test]
    fn test_env_overrides() {
        let mut config = IndexerConfig::default();
        config
            .apply_env(env(&[
                ("INDEXER_COLLECTION", "posts"),
                ("INDEXER_SOURCE", "local-spool"),
                ("INDEXER_SPOOL_PATH", "/spool"),
                ("INDEXER_SPOOL_MODE", "once"),
                ("INDEXER_INDEX_BACKEND", "memory"),
                ("INDEXER_DRY_RUN", "true"),
                ("INDEXER_MAX_REWIND_MINUTES", "30"),
                ("INDEXER_WORKERS", "8"),
            ]))
            .unwrap();

        assert_eq!(config.collection, CollectionKind::Posts);
        assert_eq!(config.source, SourceKind::LocalSpool);
        assert_eq!(config.spool.mode, SpoolMode::Once);
        assert!(config.dry_run);
        assert_eq!(config.max_rewind_minutes, Some(30));
        assert_eq!(config.pipeline.worker_pool_size, 8);
        assert_eq!(config.cursor_name(), "posts");
        config.validate().unwrap();
    }

    #[test]
    fn test_env_invalid_number_is_fatal() {
        let mut config = IndexerConfig::default();
        let err = config
            .apply_env(env(&[("INDEXER_MAX_BATCH_SIZE", "lots")]))
            .unwrap_err();
        assert!(err.to_string().contains("INDEXER_MAX_BATCH_SIZE"));
    }

    #[test]
    fn test_toml_partial_file() {
        let config = IndexerConfig::from_toml_str(
            r#"
            source = "stream"
            no_rewind = true

            [stream]
            url = "wss://jetstream.example/subscribe"

            [index]
            backend = "memory"

            [pipeline]
            max_batch_size = 50
            cursor_flush_interval = 2.5
            "#,
        )
        .unwrap();

        assert!(config.no_rewind);
        assert_eq!(config.pipeline.max_batch_size, 50);
        assert_eq!(config.pipeline.cursor_flush_interval, Duration::from_millis(2500));
        // Unset fields keep their defaults.
        assert_eq!(config.pipeline.worker_pool_size, 4);
        config.validate().unwrap();
    }

    #[test]
    fn test_zero_batch_size_rejected() {
        let mut config = IndexerConfig::default();
        config.stream.url = Some("ws://localhost".to_string());
        config.index.backend = IndexBackend::Memory;
        config.pipeline.max_batch_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_intervals_rejected() {
        let mut config = IndexerConfig::default();
        config.stream.url = Some("ws://localhost".to_string());
        config.index.backend = IndexBackend::Memory;
        config.validate().unwrap();

        config.pipeline.cursor_flush_interval = Duration::ZERO;
        assert!(matches!(config.validate(), Err(IngestError::FatalConfig(_))));

        config.pipeline.cursor_flush_interval = Duration::from_secs(1);
        config.stream.read_timeout = Duration::ZERO;
        assert!(matches!(config.validate(), Err(IngestError::FatalConfig(_))));
    }

    #[test]
    fn test_zero_flush_interval_from_toml_rejected() {
        let config = IndexerConfig::from_toml_str(
            r#"
            source = "stream"

            [stream]
            url = "ws://localhost"

            [index]
            backend = "memory"

            [pipeline]
            cursor_flush_interval = 0.0
            "#,
        )
        .unwrap();
        assert!(config.validate().is_err());
    }
}
