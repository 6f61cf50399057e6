//! Incremental index updates.
//!
//! # Winner Selection
//!
//! New current revisions after the watermark are read ordered by
//! `(doc_id, revid DESC)`, so the first row of each document is the
//! candidate winner and the rest are conflicts. A current revision at or
//! before the watermark may still outrank the candidate (a new losing
//! branch arrived); then the old winner is mapped again and the candidate
//! joins `_conflicts`. The indexed winner never moves to a lower-ranked
//! revision.
//!
//! # Phases
//!
//! 1. Read (no locks): candidates, old winners.
//! 2. Map on the worker pool, bounded by `map_timeout`.
//! 3. Write (one transaction): delete superseded rows, insert emitted rows,
//!    move the watermark. Any error rolls the whole run back.

use super::{EmittedRow, Emitter, MapFn, View};
use crate::database::{parse_body, Database};
use crate::error::{CoreError, Result};
use crate::metrics;
use crate::revision::{compare_rev_ids, Revision, DESIGN_DOC_PREFIX};
use serde_json::{Map, Value};
use sqlx::sqlite::SqliteConnection;
use std::cmp::Ordering;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::time::Instant;
use tokio::task::JoinSet;
use tracing::{debug, error, info, instrument, warn};

/// Outcome of [`View::update_index`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexUpdate {
    /// The index already reflected the latest sequence.
    NotModified,
    Updated {
        revisions_mapped: usize,
        rows_emitted: usize,
    },
}

/// A winning revision waiting to be mapped.
struct MapTask {
    sequence: i64,
    properties: Map<String, Value>,
}

/// Output of mapping one revision.
struct Mapped {
    sequence: i64,
    rows: Vec<EmittedRow>,
}

type CandidateRow = (i64, String, String, i64, Option<String>, Option<String>);

impl View {
    /// Bring the index up to the database's last sequence.
    #[instrument(skip(self), fields(view = %self.name))]
    pub async fn update_index(&self) -> Result<IndexUpdate> {
        let map = self
            .map_fn()
            .ok_or_else(|| CoreError::Config(format!("View {} has no map function", self.name)))?;
        let _lease = self.update_lease.lock().await;
        let db = self.database()?;
        let started = Instant::now();

        let last = self.last_sequence_indexed().await? as i64;
        let db_last = db.last_sequence_number().await? as i64;
        if last >= db_last {
            debug!(last, "Index up to date");
            return Ok(IndexUpdate::NotModified);
        }

        let (tasks, superseded) = self.collect_tasks(&db, last, db_last).await?;
        let revisions_mapped = tasks.len();
        let mapped = self.run_map(&db, map, tasks).await?;
        let rows_emitted = mapped.iter().map(|m| m.rows.len()).sum();

        let _write = db.write_guard().await;
        let mut tx = db.pool().begin().await?;
        if last == 0 {
            delete_all_rows(&mut tx, self.view_id).await?;
        } else {
            delete_rows_where(
                &mut tx,
                self.view_id,
                "sequence IN (SELECT parent FROM revs
                              WHERE sequence > ? AND sequence <= ? AND parent IS NOT NULL)",
                &[last, db_last],
            )
            .await?;
            for sequence in &superseded {
                delete_rows_where(&mut tx, self.view_id, "sequence = ?", &[*sequence]).await?;
            }
        }
        for output in &mapped {
            insert_rows(&mut tx, self.view_id, output).await?;
        }
        sqlx::query(
            "UPDATE views SET lastsequence = ?,
                total_docs = (SELECT COUNT(*) FROM maps WHERE view_id = ?)
             WHERE view_id = ?",
        )
        .bind(db_last)
        .bind(self.view_id)
        .bind(self.view_id)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        let elapsed = started.elapsed();
        metrics::record_index_update(&self.name, revisions_mapped, rows_emitted, elapsed);
        info!(
            from = last,
            to = db_last,
            revisions_mapped,
            rows_emitted,
            elapsed_ms = elapsed.as_millis() as u64,
            "Updated view index"
        );
        Ok(IndexUpdate::Updated {
            revisions_mapped,
            rows_emitted,
        })
    }

    /// Pick the revision to map for every document changed in
    /// `(last, db_last]`. Also returns the sequences of old winners whose
    /// rows must go.
    async fn collect_tasks(&self, db: &Database, last: i64, db_last: i64) -> Result<(Vec<MapTask>, Vec<i64>)> {
        let rows: Vec<CandidateRow> = sqlx::query_as(
            "SELECT revs.doc_id, docs.docid, revs.revid, revs.sequence, revs.json, revs.doc_type
             FROM revs JOIN docs ON revs.doc_id = docs.doc_id
             WHERE revs.sequence > ? AND revs.sequence <= ? AND revs.current = 1 AND revs.deleted = 0
             ORDER BY revs.doc_id, revs.revid DESC",
        )
        .bind(last)
        .bind(db_last)
        .fetch_all(db.pool())
        .await?;

        let document_types = self.document_types();
        let mut tasks = Vec::new();
        let mut superseded = Vec::new();
        let mut rows = rows.into_iter().peekable();

        while let Some((doc_num, doc_id, rev_id, sequence, json, doc_type)) = rows.next() {
            let mut conflicts = Vec::new();
            while let Some((next_doc, ..)) = rows.peek() {
                if *next_doc != doc_num {
                    break;
                }
                if let Some((_, _, rev, ..)) = rows.next() {
                    conflicts.push(rev);
                }
            }
            if doc_id.starts_with(DESIGN_DOC_PREFIX) {
                continue;
            }

            let mut winner = Winner {
                rev_id,
                sequence,
                json,
                doc_type,
            };
            if last > 0 {
                if let Some(old) = old_winner(db, doc_num, last).await? {
                    superseded.push(old.sequence);
                    if compare_rev_ids(&old.rev_id, &winner.rev_id) == Ordering::Greater {
                        let demoted = std::mem::replace(&mut winner, old);
                        conflicts.insert(0, demoted.rev_id);
                    } else {
                        conflicts.push(old.rev_id);
                    }
                }
            }

            if let (Some(allowed), Some(doc_type)) = (&document_types, &winner.doc_type) {
                if !allowed.contains(doc_type) {
                    continue;
                }
            }
            let Some(body) = parse_body(winner.json.as_deref())? else {
                warn!(doc_id = %doc_id, rev_id = %winner.rev_id, "Current revision has no body");
                continue;
            };
            let revision = Revision {
                doc_id,
                rev_id: winner.rev_id,
                sequence: winner.sequence as u64,
                deleted: false,
                body: Some(body),
            };
            let mut properties = revision.properties();
            if !conflicts.is_empty() {
                properties.insert(
                    "_conflicts".into(),
                    Value::Array(conflicts.into_iter().map(Value::String).collect()),
                );
            }
            tasks.push(MapTask {
                sequence: winner.sequence,
                properties,
            });
        }
        Ok((tasks, superseded))
    }

    /// Map every task on the worker pool.
    async fn run_map(&self, db: &Database, map: MapFn, tasks: Vec<MapTask>) -> Result<Vec<Mapped>> {
        if tasks.is_empty() {
            return Ok(Vec::new());
        }
        let settings = &db.config().views;
        let worker_count = settings.worker_count().max(1);
        let chunk_size = tasks.len().div_ceil(worker_count).max(1);

        let mut workers = JoinSet::new();
        let mut tasks = tasks.into_iter().peekable();
        while tasks.peek().is_some() {
            let chunk: Vec<MapTask> = tasks.by_ref().take(chunk_size).collect();
            let map = map.clone();
            let view = self.name.clone();
            workers.spawn_blocking(move || map_chunk(&view, &map, chunk));
        }
        debug!(workers = workers.len(), chunk_size, "Mapping revisions");

        let timeout = settings.map_timeout();
        match tokio::time::timeout(timeout, join_workers(&mut workers)).await {
            Ok(result) => result,
            Err(_) => {
                error!(
                    timeout_sec = timeout.as_secs(),
                    "Map workers did not finish, aborting index update"
                );
                workers.abort_all();
                Err(CoreError::Timeout(format!(
                    "view {} map phase exceeded {}s",
                    self.name,
                    timeout.as_secs()
                )))
            }
        }
    }
}

struct Winner {
    rev_id: String,
    sequence: i64,
    json: Option<String>,
    doc_type: Option<String>,
}

/// Best live leaf of `doc_num` at or before `last`.
async fn old_winner(db: &Database, doc_num: i64, last: i64) -> Result<Option<Winner>> {
    let row: Option<(String, i64, Option<String>, Option<String>)> = sqlx::query_as(
        "SELECT revid, sequence, json, doc_type FROM revs
         WHERE doc_id = ? AND sequence <= ? AND current = 1 AND deleted = 0
         ORDER BY revid DESC LIMIT 1",
    )
    .bind(doc_num)
    .bind(last)
    .fetch_optional(db.pool())
    .await?;
    Ok(row.map(|(rev_id, sequence, json, doc_type)| Winner {
        rev_id,
        sequence,
        json,
        doc_type,
    }))
}

/// Runs on a blocking thread. A panicking map call skips that revision.
fn map_chunk(view: &str, map: &MapFn, chunk: Vec<MapTask>) -> Vec<Mapped> {
    let mut out = Vec::with_capacity(chunk.len());
    for task in chunk {
        let mut emitter = Emitter::new();
        let outcome = catch_unwind(AssertUnwindSafe(|| map(&task.properties, &mut emitter)));
        match outcome {
            Ok(()) => {
                if !emitter.is_empty() {
                    out.push(Mapped {
                        sequence: task.sequence,
                        rows: emitter.into_rows(),
                    });
                }
            }
            Err(_) => {
                let doc_id = task.properties.get("_id").and_then(Value::as_str).unwrap_or("");
                warn!(view, doc_id, sequence = task.sequence, "Map function panicked, skipping");
                metrics::record_map_error(view);
            }
        }
    }
    out
}

async fn join_workers(workers: &mut JoinSet<Vec<Mapped>>) -> Result<Vec<Mapped>> {
    let mut mapped = Vec::new();
    while let Some(joined) = workers.join_next().await {
        let output = joined.map_err(|e| CoreError::Internal(format!("map worker failed: {e}")))?;
        mapped.extend(output);
    }
    mapped.sort_by_key(|m| m.sequence);
    Ok(mapped)
}

async fn insert_rows(conn: &mut SqliteConnection, view_id: i64, output: &Mapped) -> Result<()> {
    for row in &output.rows {
        let full_text_id = match &row.full_text {
            Some(text) => {
                let result = sqlx::query("INSERT INTO fulltext (content) VALUES (?)")
                    .bind(text)
                    .execute(&mut *conn)
                    .await?;
                Some(result.last_insert_rowid())
            }
            None => None,
        };
        let key = serde_json::to_string(&row.key)?;
        let value = match &row.value {
            Value::Null => None,
            other => Some(serde_json::to_string(other)?),
        };
        sqlx::query(
            "INSERT INTO maps (view_id, sequence, key, value, fulltext_id) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(view_id)
        .bind(output.sequence)
        .bind(key)
        .bind(value)
        .bind(full_text_id)
        .execute(&mut *conn)
        .await?;
    }
    Ok(())
}

/// Delete a view's rows matching `condition` (on `maps` columns), along
/// with their full-text entries.
async fn delete_rows_where(
    conn: &mut SqliteConnection,
    view_id: i64,
    condition: &str,
    params: &[i64],
) -> Result<()> {
    let fulltext_sql = format!(
        "DELETE FROM fulltext WHERE rowid IN
           (SELECT fulltext_id FROM maps WHERE view_id = ? AND fulltext_id IS NOT NULL AND {condition})"
    );
    let mut query = sqlx::query(&fulltext_sql).bind(view_id);
    for param in params {
        query = query.bind(*param);
    }
    query.execute(&mut *conn).await?;

    let maps_sql = format!("DELETE FROM maps WHERE view_id = ? AND {condition}");
    let mut query = sqlx::query(&maps_sql).bind(view_id);
    for param in params {
        query = query.bind(*param);
    }
    query.execute(&mut *conn).await?;
    Ok(())
}

pub(super) async fn delete_all_rows(conn: &mut SqliteConnection, view_id: i64) -> Result<()> {
    delete_rows_where(conn, view_id, "1", &[]).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DatabaseConfig;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
    use std::sync::{Arc, Mutex};
    use tempfile::tempdir;

    async fn open_temp(dir: &std::path::Path) -> Arc<Database> {
        Database::open(DatabaseConfig::for_testing("index", dir)).await.unwrap()
    }

    fn obj(v: Value) -> Map<String, Value> {
        v.as_object().unwrap().clone()
    }

    fn history(revs: &[&str]) -> Vec<String> {
        revs.iter().map(|r| r.to_string()).collect()
    }

    /// Emits `_rev` keyed by doc ID and records the `_conflicts` it saw.
    fn rev_recorder(seen: Arc<Mutex<Vec<(String, Value)>>>) -> MapFn {
        Arc::new(move |doc: &Map<String, Value>, emit: &mut Emitter| {
            let id = doc["_id"].as_str().unwrap_or_default().to_string();
            let conflicts = doc.get("_conflicts").cloned().unwrap_or(Value::Null);
            seen.lock().unwrap().push((id.clone(), conflicts));
            emit.emit(id, doc["_rev"].clone());
        })
    }

    async fn indexed_rev(view: &View, doc_id: &str) -> Option<String> {
        let db = view.database().unwrap();
        let rows: Vec<(String, Option<String>)> =
            sqlx::query_as("SELECT key, value FROM maps WHERE view_id = ?")
                .bind(view.view_id())
                .fetch_all(db.pool())
                .await
                .unwrap();
        let key = serde_json::to_string(doc_id).unwrap();
        rows.into_iter()
            .find(|(k, _)| *k == key)
            .and_then(|(_, v)| v)
            .map(|v| serde_json::from_str::<String>(&v).unwrap())
    }

    #[tokio::test]
    async fn test_update_is_incremental() {
        let dir = tempdir().unwrap();
        let db = open_temp(dir.path()).await;
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let view = db.view("all").await.unwrap();
        view.set_map_reduce(
            Arc::new(move |doc: &Map<String, Value>, emit: &mut Emitter| {
                counter.fetch_add(1, AtomicOrdering::SeqCst);
                emit.emit(doc["_id"].clone(), Value::Null);
            }),
            None,
            "1",
        )
        .await
        .unwrap();

        db.put("a", obj(json!({"n": 1}))).await.unwrap();
        db.put("b", obj(json!({"n": 2}))).await.unwrap();
        assert_eq!(
            view.update_index().await.unwrap(),
            IndexUpdate::Updated { revisions_mapped: 2, rows_emitted: 2 }
        );
        assert_eq!(view.update_index().await.unwrap(), IndexUpdate::NotModified);

        db.put("c", obj(json!({"n": 3}))).await.unwrap();
        view.update_index().await.unwrap();
        assert_eq!(calls.load(AtomicOrdering::SeqCst), 3);
        assert_eq!(view.total_rows().await.unwrap(), 3);
        db.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_updated_document_replaces_rows() {
        let dir = tempdir().unwrap();
        let db = open_temp(dir.path()).await;
        let view = db.view("revs").await.unwrap();
        view.set_map_reduce(rev_recorder(Arc::default()), None, "1").await.unwrap();

        let first = db.put("a", obj(json!({"n": 1}))).await.unwrap();
        view.update_index().await.unwrap();
        let second = db
            .put("a", obj(json!({"n": 2, "_rev": first.rev_id})))
            .await
            .unwrap();
        view.update_index().await.unwrap();

        assert_eq!(view.total_rows().await.unwrap(), 1);
        assert_eq!(indexed_rev(&view, "a").await, Some(second.rev_id.clone()));

        db.delete_document("a", &second.rev_id).await.unwrap();
        view.update_index().await.unwrap();
        assert_eq!(view.total_rows().await.unwrap(), 0);
        db.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_winner_never_regresses() {
        let dir = tempdir().unwrap();
        let db = open_temp(dir.path()).await;
        let seen = Arc::new(Mutex::new(Vec::new()));
        let view = db.view("revs").await.unwrap();
        view.set_map_reduce(rev_recorder(seen.clone()), None, "1").await.unwrap();

        db.force_insert(obj(json!({"_id": "d", "_rev": "2-bbb", "v": 2})), &history(&["2-bbb", "1-aaa"]), None)
            .await
            .unwrap();
        view.update_index().await.unwrap();
        assert_eq!(indexed_rev(&view, "d").await.as_deref(), Some("2-bbb"));

        // A losing branch arrives after the winner was indexed.
        db.force_insert(obj(json!({"_id": "d", "_rev": "2-aaa", "v": 3})), &history(&["2-aaa", "1-aaa"]), None)
            .await
            .unwrap();
        view.update_index().await.unwrap();
        assert_eq!(indexed_rev(&view, "d").await.as_deref(), Some("2-bbb"));
        let last = seen.lock().unwrap().last().cloned().unwrap();
        assert_eq!(last, ("d".to_string(), json!(["2-aaa"])));

        // A higher generation wins outright.
        db.force_insert(
            obj(json!({"_id": "d", "_rev": "3-ccc", "v": 4})),
            &history(&["3-ccc", "2-aaa", "1-aaa"]),
            None,
        )
        .await
        .unwrap();
        view.update_index().await.unwrap();
        assert_eq!(indexed_rev(&view, "d").await.as_deref(), Some("3-ccc"));
        assert_eq!(view.total_rows().await.unwrap(), 1);
        let last = seen.lock().unwrap().last().cloned().unwrap();
        assert_eq!(last, ("d".to_string(), json!(["2-bbb"])));
        db.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_design_docs_and_types_skipped() {
        let dir = tempdir().unwrap();
        let db = open_temp(dir.path()).await;
        let seen = Arc::new(Mutex::new(Vec::new()));
        let view = db.view("typed").await.unwrap();
        view.set_map_reduce(rev_recorder(seen.clone()), None, "1").await.unwrap();
        view.set_document_types(Some(["person"]));

        db.put("_design/app", obj(json!({"views": {}}))).await.unwrap();
        db.put("p", obj(json!({"type": "person"}))).await.unwrap();
        db.put("o", obj(json!({"type": "order"}))).await.unwrap();
        db.put("u", obj(json!({"untyped": true}))).await.unwrap();
        view.update_index().await.unwrap();

        let mut ids: Vec<String> = seen.lock().unwrap().iter().map(|(id, _)| id.clone()).collect();
        ids.sort();
        assert_eq!(ids, vec!["p".to_string(), "u".to_string()]);
        db.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_panicking_map_skips_revision() {
        let dir = tempdir().unwrap();
        let db = open_temp(dir.path()).await;
        let view = db.view("fragile").await.unwrap();
        view.set_map_reduce(
            Arc::new(|doc: &Map<String, Value>, emit: &mut Emitter| {
                if doc.contains_key("bad") {
                    panic!("bad document");
                }
                emit.emit(doc["_id"].clone(), 1);
            }),
            None,
            "1",
        )
        .await
        .unwrap();
        db.put("good", obj(json!({}))).await.unwrap();
        db.put("evil", obj(json!({"bad": true}))).await.unwrap();
        view.update_index().await.unwrap();
        assert_eq!(view.total_rows().await.unwrap(), 1);
        assert_eq!(view.last_sequence_indexed().await.unwrap(), 2);
        db.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_missing_map_is_config_error() {
        let dir = tempdir().unwrap();
        let db = open_temp(dir.path()).await;
        let view = db.view("empty").await.unwrap();
        assert!(matches!(view.update_index().await, Err(CoreError::Config(_))));
        db.close().await.unwrap();
    }
}
