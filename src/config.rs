//! Configuration for a local database and the subsystems layered on it.
//!
//! Configuration is passed to [`Database::open()`](crate::Database::open)
//! and can be built programmatically or deserialized from YAML/JSON.
//! Everything the core needs is carried here explicitly; there is no
//! process-wide mutable state.
//!
//! # Quick Start
//!
//! ```rust
//! use couchlite::config::DatabaseConfig;
//!
//! let config = DatabaseConfig {
//!     name: "events".into(),
//!     directory: "/var/lib/app/dbs".into(),
//!     ..Default::default()
//! };
//! assert!(config.validate().is_ok());
//! ```
//!
//! # Configuration Structure
//!
//! ```text
//! DatabaseConfig
//! ├── name: String                   # legal database name
//! ├── directory: PathBuf             # holds <name>.sqlite and <name> attachments/
//! ├── blob_store: BlobStoreConfig    # at-rest encryption password
//! ├── replication: ReplicationSettings
//! │   ├── batch_size / batch_delay_ms
//! │   ├── retry_delay_sec / checkpoint_debounce_ms
//! │   ├── max_concurrent_requests / heartbeat_sec / changes_limit
//! │   └── backoff_initial_ms / backoff_max_ms
//! └── views: ViewSettings            # reduce batching, map worker pool
//! ```
//!
//! # YAML Example
//!
//! ```yaml
//! name: "events"
//! directory: "/var/lib/app/dbs"
//! blob_store:
//!   encryption_password: "correct horse"
//! replication:
//!   batch_size: 200
//!   retry_delay_sec: 60
//! views:
//!   reduce_batch_size: 100
//! ```

use crate::error::{CoreError, Result};
use crate::resilience::RetryConfig;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

// ═══════════════════════════════════════════════════════════════════════════════
// DatabaseConfig: passed to Database::open()
// ═══════════════════════════════════════════════════════════════════════════════

/// The top-level config object passed to `Database::open()`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Database name. Must start with a lowercase letter, followed by
    /// lowercase letters, digits or any of `_$()+-/`.
    pub name: String,

    /// Directory holding the SQLite file and the attachment directory.
    pub directory: PathBuf,

    #[serde(default)]
    pub blob_store: BlobStoreConfig,

    #[serde(default)]
    pub replication: ReplicationSettings,

    #[serde(default)]
    pub views: ViewSettings,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            name: "db".to_string(),
            directory: PathBuf::from("."),
            blob_store: BlobStoreConfig::default(),
            replication: ReplicationSettings::default(),
            views: ViewSettings::default(),
        }
    }
}

impl DatabaseConfig {
    /// Create a config rooted in `directory` with fast replication timings.
    pub fn for_testing(name: &str, directory: impl Into<PathBuf>) -> Self {
        Self {
            name: name.to_string(),
            directory: directory.into(),
            blob_store: BlobStoreConfig::default(),
            replication: ReplicationSettings::testing(),
            views: ViewSettings::default(),
        }
    }

    /// Path of the SQLite row store.
    pub fn sqlite_path(&self) -> PathBuf {
        self.directory.join(format!("{}.sqlite", self.storage_name()))
    }

    /// Directory of the blob store.
    pub fn attachments_path(&self) -> PathBuf {
        self.directory.join(format!("{} attachments", self.storage_name()))
    }

    // Slashes are legal in names but not in file names.
    fn storage_name(&self) -> String {
        self.name.replace('/', ":")
    }

    /// Reject configurations the core cannot run with.
    pub fn validate(&self) -> Result<()> {
        if !is_legal_database_name(&self.name) {
            return Err(CoreError::Config(format!(
                "Invalid database name: {:?}",
                self.name
            )));
        }
        self.replication.validate()?;
        if self.views.reduce_batch_size == 0 {
            return Err(CoreError::Config("reduce_batch_size must be > 0".into()));
        }
        Ok(())
    }
}

/// Database names start with a lowercase letter, then `[a-z0-9_$()+/-]*`.
pub fn is_legal_database_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_lowercase() => {}
        _ => return false,
    }
    chars.all(|c| {
        c.is_ascii_lowercase() || c.is_ascii_digit() || "_$()+-/".contains(c)
    })
}

// ═══════════════════════════════════════════════════════════════════════════════
// BlobStoreConfig
// ═══════════════════════════════════════════════════════════════════════════════

/// Blob store settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BlobStoreConfig {
    /// When set, blobs are encrypted at rest with a key derived from it.
    #[serde(default)]
    pub encryption_password: Option<String>,
}

// ═══════════════════════════════════════════════════════════════════════════════
// ReplicationSettings: batching, checkpointing, retry, HTTP
// ═══════════════════════════════════════════════════════════════════════════════

/// Tunables shared by every replication of a database.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationSettings {
    /// Batcher capacity: flush once this many revisions are queued.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Batcher quiescence delay (ms) after the last enqueue.
    #[serde(default = "default_batch_delay_ms")]
    pub batch_delay_ms: u64,

    /// Delay before a failed continuous replication restarts (seconds).
    #[serde(default = "default_retry_delay_sec")]
    pub retry_delay_sec: u64,

    /// Checkpoint saves are coalesced within this window (ms).
    #[serde(default = "default_checkpoint_debounce_ms")]
    pub checkpoint_debounce_ms: u64,

    /// Upper bound on concurrent requests to the remote.
    #[serde(default = "default_max_concurrent_requests")]
    pub max_concurrent_requests: usize,

    /// Change feed heartbeat (seconds; sent to the server in ms).
    #[serde(default = "default_heartbeat_sec")]
    pub heartbeat_sec: u64,

    /// Maximum changes per long-poll response.
    #[serde(default = "default_changes_limit")]
    pub changes_limit: usize,

    /// TCP connect timeout (ms).
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Per-request timeout for everything except the change feed (ms).
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// Change tracker backoff after a transport failure: first delay (ms).
    #[serde(default = "default_backoff_initial_ms")]
    pub backoff_initial_ms: u64,

    /// Change tracker backoff ceiling (ms).
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
}

fn default_batch_size() -> usize {
    200
}

fn default_batch_delay_ms() -> u64 {
    500
}

fn default_retry_delay_sec() -> u64 {
    60
}

fn default_checkpoint_debounce_ms() -> u64 {
    2000
}

fn default_max_concurrent_requests() -> usize {
    5
}

fn default_heartbeat_sec() -> u64 {
    300
}

fn default_changes_limit() -> usize {
    50
}

fn default_connect_timeout_ms() -> u64 {
    10_000
}

fn default_request_timeout_ms() -> u64 {
    60_000
}

fn default_backoff_initial_ms() -> u64 {
    100
}

fn default_backoff_max_ms() -> u64 {
    5 * 60 * 1000
}

impl Default for ReplicationSettings {
    fn default() -> Self {
        Self {
            batch_size: 200,
            batch_delay_ms: 500,
            retry_delay_sec: 60,
            checkpoint_debounce_ms: 2000,
            max_concurrent_requests: 5,
            heartbeat_sec: 300,
            changes_limit: 50,
            connect_timeout_ms: 10_000,
            request_timeout_ms: 60_000,
            backoff_initial_ms: 100,
            backoff_max_ms: 5 * 60 * 1000,
        }
    }
}

impl ReplicationSettings {
    /// Short delays so tests finish quickly.
    pub fn testing() -> Self {
        Self {
            batch_size: 200,
            batch_delay_ms: 20,
            retry_delay_sec: 1,
            checkpoint_debounce_ms: 50,
            max_concurrent_requests: 5,
            heartbeat_sec: 1,
            changes_limit: 50,
            connect_timeout_ms: 1000,
            request_timeout_ms: 5000,
            backoff_initial_ms: 10,
            backoff_max_ms: 100,
        }
    }

    pub fn batch_delay(&self) -> Duration {
        Duration::from_millis(self.batch_delay_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_sec)
    }

    pub fn checkpoint_debounce(&self) -> Duration {
        Duration::from_millis(self.checkpoint_debounce_ms)
    }

    pub fn heartbeat(&self) -> Duration {
        Duration::from_secs(self.heartbeat_sec)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Retry policy for the change tracker (never gives up while running).
    pub fn backoff_config(&self) -> RetryConfig {
        RetryConfig {
            initial_delay: Duration::from_millis(self.backoff_initial_ms),
            max_delay: Duration::from_millis(self.backoff_max_ms),
            backoff_factor: 2.0,
        }
    }

    fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(CoreError::Config("batch_size must be > 0".into()));
        }
        if self.max_concurrent_requests == 0 {
            return Err(CoreError::Config(
                "max_concurrent_requests must be > 0".into(),
            ));
        }
        if self.backoff_initial_ms > self.backoff_max_ms {
            return Err(CoreError::Config(
                "backoff_initial_ms exceeds backoff_max_ms".into(),
            ));
        }
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// ViewSettings: map/reduce execution
// ═══════════════════════════════════════════════════════════════════════════════

/// View indexing and query settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ViewSettings {
    /// Rows handed to a reduce function per call.
    #[serde(default = "default_reduce_batch_size")]
    pub reduce_batch_size: usize,

    /// Safety valve on a single index run's map phase (seconds).
    #[serde(default = "default_map_timeout_sec")]
    pub map_timeout_sec: u64,

    /// Map worker count. 0 means available parallelism.
    #[serde(default)]
    pub map_workers: usize,
}

fn default_reduce_batch_size() -> usize {
    100
}

fn default_map_timeout_sec() -> u64 {
    30 * 60
}

impl Default for ViewSettings {
    fn default() -> Self {
        Self {
            reduce_batch_size: 100,
            map_timeout_sec: 30 * 60,
            map_workers: 0,
        }
    }
}

impl ViewSettings {
    pub fn map_timeout(&self) -> Duration {
        Duration::from_secs(self.map_timeout_sec)
    }

    /// Effective size of the map worker pool.
    pub fn worker_count(&self) -> usize {
        if self.map_workers > 0 {
            return self.map_workers;
        }
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4)
    }
}
