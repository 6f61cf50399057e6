//! # couchlite
//!
//! The core of an embedded, CouchDB-compatible document database: local
//! revision storage, replication with a remote CouchDB-protocol server, and
//! incremental map/reduce views.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────────────┐
//! │                               Database                                 │
//! │                                                                        │
//! │  ┌──────────────┐   ┌────────────────────┐   ┌──────────────────────┐  │
//! │  │  Row store   │   │     BlobStore      │   │  Views (map/reduce)  │  │
//! │  │ (SQLite)     │   │ SHA-1 keyed files  │   │ incremental indexer  │  │
//! │  └──────┬───────┘   └────────────────────┘   └──────────────────────┘  │
//! │         │ change notifications                                          │
//! └─────────┼──────────────────────────────────────────────────────────────┘
//!           ▼
//! ┌───────────────────────────┐          HTTP          ┌──────────────────┐
//! │ Replication (pull / push) │ ◀────────────────────▶ │  Remote CouchDB  │
//! │ ChangeTracker · Batcher   │  _changes _revs_diff   │                  │
//! │ CheckpointSaver           │  _bulk_docs _local     │                  │
//! └───────────────────────────┘                        └──────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```rust,no_run
//! use couchlite::{Database, DatabaseConfig, Replication, ReplicationOptions};
//!
//! #[tokio::main]
//! async fn main() -> couchlite::Result<()> {
//!     let db = Database::open(DatabaseConfig::for_testing("notes", "/tmp/notes")).await?;
//!
//!     let pull = Replication::pull(&db, "https://couch.example.com/notes", ReplicationOptions::default())?;
//!     let mut changes = pull.subscribe();
//!     pull.start()?;
//!     while changes.changed().await.is_ok() {
//!         if !pull.is_running() {
//!             break;
//!         }
//!     }
//!
//!     db.close().await
//! }
//! ```

pub mod auth;
pub mod batch;
pub mod blob;
pub mod change_tracker;
pub mod checkpoint;
pub mod collate;
pub mod config;
pub mod database;
pub mod error;
pub mod metrics;
pub mod remote;
pub mod replication;
pub mod resilience;
pub mod revision;
pub mod view;

// Re-exports for convenience
pub use auth::{Authenticator, BasicAuthenticator, CookieAuthenticator, TokenAuthenticator};
pub use blob::{BlobKey, BlobStore, BlobStoreWriter, EncryptionKey};
pub use change_tracker::{ChangeTracker, ChangeTrackerClient, ChangeTrackerMode, RemoteChange};
pub use checkpoint::{CheckpointSaver, CheckpointSpec};
pub use collate::Collation;
pub use config::{BlobStoreConfig, DatabaseConfig, ReplicationSettings, ViewSettings};
pub use database::{ChangesOptions, Database, DatabaseChange};
pub use error::{CoreError, Result};
pub use remote::{HttpClientFactory, RemoteDb};
pub use replication::{
    Direction, Replication, ReplicationChange, ReplicationOptions, ReplicationStatus,
};
pub use resilience::{Backoff, RetryConfig};
pub use revision::{compare_rev_ids, Revision};
pub use view::{Emitter, IndexUpdate, MapFn, QueryOptions, QueryRow, ReduceFn, View};
