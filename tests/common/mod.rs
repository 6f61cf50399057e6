//! Shared test utilities for integration tests.
//!
//! This module provides:
//! - An in-process mock CouchDB remote (axum)
//! - Database and replication helpers
//! - Log capture via `tracing-subscriber` (set `RUST_LOG` to see it)

#![allow(dead_code)]

pub mod mock_couch;

pub use mock_couch::*;

use couchlite::{Database, DatabaseConfig, Replication, ReplicationStatus};
use std::path::Path;
use std::sync::{Arc, Once};
use std::time::Duration;

static TRACING: Once = Once::new();

/// Install a test log subscriber once per process.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Open a database under `dir` with fast replication timings.
pub async fn open_db(dir: &Path, name: &str) -> Arc<Database> {
    init_tracing();
    Database::open(DatabaseConfig::for_testing(name, dir))
        .await
        .expect("Failed to open database")
}

/// Poll `condition` every 20ms until it holds or `timeout` passes.
pub async fn wait_for<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    condition()
}

/// Wait for a started replication to reach `Stopped`.
pub async fn wait_until_stopped(repl: &Arc<Replication>) {
    let stopped = wait_for(Duration::from_secs(10), || {
        repl.status() == ReplicationStatus::Stopped
    })
    .await;
    assert!(stopped, "replication {} did not stop", repl.session_id());
}

/// Wait for a continuous replication to settle at `Idle`.
pub async fn wait_until_idle(repl: &Arc<Replication>) {
    let idle = wait_for(Duration::from_secs(10), || repl.status() == ReplicationStatus::Idle).await;
    assert!(idle, "replication {} did not go idle (status {})", repl.session_id(), repl.status());
}
