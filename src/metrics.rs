//! Metrics for observability.
//!
//! Exports Prometheus-compatible metrics through the `metrics` facade for:
//! - Change feed polling
//! - Revisions pulled, pushed and failed
//! - Batcher flushes and checkpoint saves
//! - Replication status
//! - Blob store writes, dedups and garbage collection
//! - View index updates
//!
//! # Metric Naming Convention
//!
//! All metrics are prefixed with `couchlite_` and follow Prometheus conventions:
//! - Counters end in `_total`
//! - Gauges represent current state
//! - Histograms track distributions (duration, size)
//!
//! No recorder is installed here; the embedding application picks one.

use metrics::{counter, gauge, histogram};
use std::time::Duration;

// =============================================================================
// Change feed
// =============================================================================

/// Record one `_changes` response.
pub fn record_changes_poll(remote: &str, changes: usize, duration: Duration) {
    counter!("couchlite_changes_polls_total", "remote" => remote.to_string()).increment(1);
    if changes > 0 {
        counter!("couchlite_changes_received_total", "remote" => remote.to_string())
            .increment(changes as u64);
    }
    histogram!("couchlite_changes_poll_duration_seconds", "remote" => remote.to_string())
        .record(duration.as_secs_f64());
}

/// Record a change feed failure (transport error or bad status).
pub fn record_changes_error(remote: &str, kind: &str) {
    counter!("couchlite_changes_errors_total", "remote" => remote.to_string(), "kind" => kind.to_string())
        .increment(1);
}

// =============================================================================
// Replication
// =============================================================================

/// Record revisions durably applied (pull) or accepted by the remote (push).
pub fn record_revisions_transferred(direction: &str, count: usize) {
    counter!("couchlite_revisions_transferred_total", "direction" => direction.to_string())
        .increment(count as u64);
}

/// Record revisions that could not be transferred.
pub fn record_revisions_failed(direction: &str, count: usize) {
    counter!("couchlite_revisions_failed_total", "direction" => direction.to_string())
        .increment(count as u64);
}

/// Record a batcher flush.
pub fn record_batch_flush(session: &str, size: usize) {
    counter!("couchlite_batch_flushes_total", "session" => session.to_string()).increment(1);
    histogram!("couchlite_batch_size", "session" => session.to_string()).record(size as f64);
}

/// Record a checkpoint write.
pub fn record_checkpoint_save(success: bool) {
    let status = if success { "success" } else { "failure" };
    counter!("couchlite_checkpoint_saves_total", "status" => status).increment(1);
}

/// Set the replication status gauge for a session.
pub fn set_replication_status(session: &str, status: &str) {
    let value = match status {
        "Stopped" => 0.0,
        "Offline" => 1.0,
        "Idle" => 2.0,
        "Active" => 3.0,
        _ => -1.0,
    };
    gauge!("couchlite_replication_status", "session" => session.to_string()).set(value);
}

/// Record a scheduled retry of a failed continuous replication.
pub fn record_replication_retry(session: &str) {
    counter!("couchlite_replication_retries_total", "session" => session.to_string()).increment(1);
}

// =============================================================================
// Blob store
// =============================================================================

/// Record a blob store write. `dedup` is true when the content already existed.
pub fn record_blob_write(bytes: u64, dedup: bool) {
    let outcome = if dedup { "dedup" } else { "stored" };
    counter!("couchlite_blob_writes_total", "outcome" => outcome).increment(1);
    if !dedup {
        counter!("couchlite_blob_bytes_written_total").increment(bytes);
    }
}

/// Record a garbage collection pass.
pub fn record_blob_gc(deleted: usize, errors: usize) {
    counter!("couchlite_blob_gc_runs_total").increment(1);
    counter!("couchlite_blob_gc_deleted_total").increment(deleted as u64);
    if errors > 0 {
        counter!("couchlite_blob_gc_errors_total").increment(errors as u64);
    }
}

// =============================================================================
// Views
// =============================================================================

/// Record a completed index update.
pub fn record_index_update(view: &str, revisions_mapped: usize, rows_emitted: usize, duration: Duration) {
    counter!("couchlite_index_updates_total", "view" => view.to_string()).increment(1);
    counter!("couchlite_index_rows_emitted_total", "view" => view.to_string())
        .increment(rows_emitted as u64);
    histogram!("couchlite_index_revisions_mapped", "view" => view.to_string())
        .record(revisions_mapped as f64);
    histogram!("couchlite_index_update_duration_seconds", "view" => view.to_string())
        .record(duration.as_secs_f64());
}

/// Record a map function failure (the revision is skipped).
pub fn record_map_error(view: &str) {
    counter!("couchlite_map_errors_total", "view" => view.to_string()).increment(1);
}

// =============================================================================
// Row store
// =============================================================================

/// Record a SQLite busy/locked retry.
pub fn sqlite_retries_total(operation: &str) {
    counter!("couchlite_sqlite_retries_total", "operation" => operation.to_string()).increment(1);
}
