//! SQLite schema and connection setup for the row store.
//!
//! Custom collations are registered on every pooled connection:
//! `REVID` (revision-ID order, so `ORDER BY revid DESC` puts the winner
//! first) and the `JSON*` family used by view keys.
//!
//! # SQLite Busy Handling
//!
//! SQLite can return SQLITE_BUSY/SQLITE_LOCKED when the database is
//! contended. Single statements go through [`execute_with_retry`], which
//! retries with exponential backoff (10ms doubling to 500ms, 5 attempts).

use crate::collate::{collate_json_str, Collation};
use crate::error::{CoreError, Result};
use crate::revision::compare_rev_ids;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, warn};

/// Configuration for SQLite busy retry behavior
const SQLITE_RETRY_MAX_ATTEMPTS: u32 = 5;
const SQLITE_RETRY_BASE_DELAY_MS: u64 = 10;
const SQLITE_RETRY_MAX_DELAY_MS: u64 = 500;

pub(crate) const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS info (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS docs (
        doc_id INTEGER PRIMARY KEY,
        docid TEXT UNIQUE NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS revs (
        sequence INTEGER PRIMARY KEY AUTOINCREMENT,
        doc_id INTEGER NOT NULL REFERENCES docs(doc_id) ON DELETE CASCADE,
        revid TEXT NOT NULL COLLATE REVID,
        parent INTEGER REFERENCES revs(sequence) ON DELETE SET NULL,
        current BOOLEAN NOT NULL DEFAULT 0,
        deleted BOOLEAN NOT NULL DEFAULT 0,
        json TEXT,
        no_attachments BOOLEAN NOT NULL DEFAULT 1,
        doc_type TEXT,
        source TEXT,
        UNIQUE (doc_id, revid)
    )",
    "CREATE INDEX IF NOT EXISTS revs_parent ON revs(parent)",
    "CREATE INDEX IF NOT EXISTS revs_by_docid_revid ON revs(doc_id, revid DESC, current, deleted)",
    "CREATE INDEX IF NOT EXISTS revs_current ON revs(doc_id, current)",
    "CREATE TABLE IF NOT EXISTS attachments (
        sequence INTEGER NOT NULL REFERENCES revs(sequence) ON DELETE CASCADE,
        filename TEXT NOT NULL,
        key TEXT NOT NULL,
        type TEXT,
        length INTEGER NOT NULL,
        revpos INTEGER NOT NULL DEFAULT 0
    )",
    "CREATE INDEX IF NOT EXISTS attachments_by_sequence ON attachments(sequence, filename)",
    "CREATE TABLE IF NOT EXISTS views (
        view_id INTEGER PRIMARY KEY,
        name TEXT UNIQUE NOT NULL,
        version TEXT,
        lastsequence INTEGER NOT NULL DEFAULT 0,
        total_docs INTEGER NOT NULL DEFAULT -1
    )",
    "CREATE TABLE IF NOT EXISTS maps (
        view_id INTEGER NOT NULL REFERENCES views(view_id) ON DELETE CASCADE,
        sequence INTEGER NOT NULL REFERENCES revs(sequence) ON DELETE CASCADE,
        key TEXT NOT NULL COLLATE JSON,
        value TEXT,
        fulltext_id INTEGER
    )",
    "CREATE INDEX IF NOT EXISTS maps_keys ON maps(view_id, key COLLATE JSON)",
    "CREATE INDEX IF NOT EXISTS maps_sequence ON maps(sequence)",
    "CREATE VIRTUAL TABLE IF NOT EXISTS fulltext USING fts4(content)",
    "CREATE TABLE IF NOT EXISTS replicators (
        checkpoint_id TEXT PRIMARY KEY,
        last_sequence TEXT NOT NULL,
        updated_at INTEGER NOT NULL
    )",
];

/// Open the pool for the row store at `path`, creating the schema.
pub(crate) async fn connect(path: &Path) -> Result<SqlitePool> {
    let path_str = path.to_string_lossy();
    let options = SqliteConnectOptions::from_str(&format!("sqlite://{}?mode=rwc", path_str))
        .map_err(|e| CoreError::Config(format!("Invalid SQLite path: {}", e)))?
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .foreign_keys(true)
        .busy_timeout(Duration::from_secs(5))
        .create_if_missing(true)
        .collation("REVID", compare_rev_ids)
        .collation(Collation::Unicode.sqlite_name(), |a: &str, b: &str| {
            collate_json_str(a, b, Collation::Unicode)
        })
        .collation(Collation::Ascii.sqlite_name(), |a: &str, b: &str| {
            collate_json_str(a, b, Collation::Ascii)
        })
        .collation(Collation::Raw.sqlite_name(), |a: &str, b: &str| {
            collate_json_str(a, b, Collation::Raw)
        });

    let pool = SqlitePoolOptions::new()
        .max_connections(4)
        .connect_with(options)
        .await?;

    for statement in SCHEMA {
        sqlx::query(statement).execute(&pool).await?;
    }
    debug!(path = %path_str, "Row store schema ready");
    Ok(pool)
}

/// Check if an error is a retryable SQLite busy/locked error
fn is_sqlite_busy_error(e: &sqlx::Error) -> bool {
    match e {
        sqlx::Error::Database(db_err) => {
            // SQLite error codes: SQLITE_BUSY = 5, SQLITE_LOCKED = 6
            if let Some(code) = db_err.code() {
                return code == "5" || code == "6";
            }
            let msg = db_err.message().to_lowercase();
            msg.contains("database is locked") || msg.contains("database is busy")
        }
        _ => false,
    }
}

/// Execute a database operation with retry on SQLITE_BUSY/SQLITE_LOCKED
pub(crate) async fn execute_with_retry<F, Fut, T>(
    operation_name: &str,
    mut f: F,
) -> std::result::Result<T, sqlx::Error>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = std::result::Result<T, sqlx::Error>>,
{
    let mut attempts = 0;
    let mut delay_ms = SQLITE_RETRY_BASE_DELAY_MS;

    loop {
        attempts += 1;
        match f().await {
            Ok(result) => {
                if attempts > 1 {
                    debug!(operation = operation_name, attempts, "SQLite operation succeeded after retry");
                }
                return Ok(result);
            }
            Err(e) if is_sqlite_busy_error(&e) && attempts < SQLITE_RETRY_MAX_ATTEMPTS => {
                warn!(
                    operation = operation_name,
                    attempts,
                    max_attempts = SQLITE_RETRY_MAX_ATTEMPTS,
                    delay_ms,
                    "SQLite busy, retrying"
                );
                crate::metrics::sqlite_retries_total(operation_name);
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                delay_ms = (delay_ms * 2).min(SQLITE_RETRY_MAX_DELAY_MS);
            }
            Err(e) => {
                if is_sqlite_busy_error(&e) {
                    warn!(operation = operation_name, attempts, "SQLite busy, max retries exceeded");
                }
                return Err(e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_connect_creates_schema() {
        let dir = tempdir().unwrap();
        let pool = connect(&dir.path().join("t.sqlite")).await.unwrap();
        let tables: Vec<(String,)> =
            sqlx::query_as("SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name")
                .fetch_all(&pool)
                .await
                .unwrap();
        let names: Vec<String> = tables.into_iter().map(|(n,)| n).collect();
        for expected in ["docs", "revs", "maps", "views", "replicators", "fulltext"] {
            assert!(names.iter().any(|n| n == expected), "missing {expected}");
        }
    }

    #[tokio::test]
    async fn test_revid_collation_orders_by_generation() {
        let dir = tempdir().unwrap();
        let pool = connect(&dir.path().join("t.sqlite")).await.unwrap();
        sqlx::query("CREATE TABLE t (r TEXT COLLATE REVID)")
            .execute(&pool)
            .await
            .unwrap();
        for r in ["2-a", "10-a", "9-z"] {
            sqlx::query("INSERT INTO t VALUES (?)").bind(r).execute(&pool).await.unwrap();
        }
        let rows: Vec<(String,)> = sqlx::query_as("SELECT r FROM t ORDER BY r DESC")
            .fetch_all(&pool)
            .await
            .unwrap();
        let order: Vec<String> = rows.into_iter().map(|(r,)| r).collect();
        assert_eq!(order, vec!["10-a", "9-z", "2-a"]);
    }

    #[tokio::test]
    async fn test_json_collation_in_sql() {
        let dir = tempdir().unwrap();
        let pool = connect(&dir.path().join("t.sqlite")).await.unwrap();
        sqlx::query("CREATE TABLE k (key TEXT COLLATE JSON)")
            .execute(&pool)
            .await
            .unwrap();
        for k in ["\"b\"", "10", "2", "null", "[1]"] {
            sqlx::query("INSERT INTO k VALUES (?)").bind(k).execute(&pool).await.unwrap();
        }
        let rows: Vec<(String,)> = sqlx::query_as("SELECT key FROM k ORDER BY key")
            .fetch_all(&pool)
            .await
            .unwrap();
        let order: Vec<String> = rows.into_iter().map(|(r,)| r).collect();
        assert_eq!(order, vec!["null", "2", "10", "\"b\"", "[1]"]);
    }

    #[tokio::test]
    async fn test_execute_with_retry_passes_through_other_errors() {
        let calls = AtomicU32::new(0);
        let result: std::result::Result<(), sqlx::Error> = execute_with_retry("test", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(sqlx::Error::RowNotFound) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
