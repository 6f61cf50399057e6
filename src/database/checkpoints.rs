//! Replication checkpoint persistence.
//!
//! Stores the last replicated sequence for each remote checkpoint ID in the
//! `replicators` table. Reads are served from an in-memory cache loaded at
//! open; writes update the cache and persist immediately (the replication
//! side debounces how often it asks).
//!
//! ```text
//! Replication ──(debounced)──▶ set_last_sequence_with_checkpoint_id
//!                                   ├── cache (immediate)
//!                                   └── replicators row (busy-retried)
//! ```

use super::schema::execute_with_retry;
use super::Database;
use crate::error::Result;
use sqlx::sqlite::SqlitePool;
use std::collections::HashMap;
use tracing::debug;

pub(super) async fn load_all(pool: &SqlitePool) -> Result<HashMap<String, String>> {
    let rows: Vec<(String, String)> =
        sqlx::query_as("SELECT checkpoint_id, last_sequence FROM replicators")
            .fetch_all(pool)
            .await?;
    Ok(rows.into_iter().collect())
}

impl Database {
    /// Last sequence saved for `checkpoint_id`, if any.
    pub async fn last_sequence_with_checkpoint_id(&self, checkpoint_id: &str) -> Option<String> {
        self.checkpoints.read().await.get(checkpoint_id).cloned()
    }

    /// Persist `last_sequence` for `checkpoint_id`.
    pub async fn set_last_sequence_with_checkpoint_id(
        &self,
        checkpoint_id: &str,
        last_sequence: &str,
    ) -> Result<()> {
        self.ensure_open()?;
        self.checkpoints
            .write()
            .await
            .insert(checkpoint_id.to_string(), last_sequence.to_string());

        let now = chrono::Utc::now().timestamp_millis();
        execute_with_retry("checkpoint_save", || {
            sqlx::query(
                "INSERT INTO replicators (checkpoint_id, last_sequence, updated_at)
                 VALUES (?, ?, ?)
                 ON CONFLICT(checkpoint_id) DO UPDATE SET
                    last_sequence = excluded.last_sequence,
                    updated_at = excluded.updated_at",
            )
            .bind(checkpoint_id)
            .bind(last_sequence)
            .bind(now)
            .execute(self.pool())
        })
        .await?;
        debug!(checkpoint_id, last_sequence, "Saved checkpoint");
        Ok(())
    }

    /// Forget a checkpoint so the next replication starts from scratch.
    pub async fn reset_checkpoint(&self, checkpoint_id: &str) -> Result<()> {
        self.ensure_open()?;
        self.checkpoints.write().await.remove(checkpoint_id);
        execute_with_retry("checkpoint_reset", || {
            sqlx::query("DELETE FROM replicators WHERE checkpoint_id = ?")
                .bind(checkpoint_id)
                .execute(self.pool())
        })
        .await?;
        Ok(())
    }
}
