//! Map/reduce views over the local database.
//!
//! A view is a named, persistent index: a map function is run over the
//! winning revision of every document and the emitted `(key, value)` rows
//! are stored in the `maps` table, sorted by JSON collation.
//!
//! ```text
//!  revs (sequence > lastsequence)
//!        │ group by doc, winner first
//!        ▼
//!  map workers ──emit──▶ buffered rows ──▶ maps / fulltext (one transaction)
//!                                                 │
//!                              query: range / keys / group / reduce
//! ```
//!
//! The index is incremental: `views.lastsequence` is the watermark of the
//! last database sequence folded in. Changing the map version resets it to
//! zero and the next [`View::update_index`] rebuilds from scratch.
//!
//! Index updates on one view are serialized by an internal lease; queries
//! never wait on it and read the last committed index.

mod indexer;
mod query;

pub use indexer::IndexUpdate;
pub use query::{group_key, group_together, FullTextQueryRow, QueryOptions, QueryRow, TextMatch};

use crate::collate::Collation;
use crate::database::Database;
use crate::error::{CoreError, Result};
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError, Weak};
use tracing::{debug, info, instrument};

/// Map function: called once per winning revision with its properties
/// (including `_id`, `_rev` and, when conflicted, `_conflicts`).
pub type MapFn = Arc<dyn Fn(&Map<String, Value>, &mut Emitter) + Send + Sync>;

/// Reduce function: `(keys, values, rereduce)`. On rereduce the keys are
/// all null and the values are earlier reduce outputs.
pub type ReduceFn = Arc<dyn Fn(&[Value], &[Value], bool) -> Value + Send + Sync>;

/// One emitted row, before it is stored.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct EmittedRow {
    pub key: Value,
    pub value: Value,
    pub full_text: Option<String>,
}

/// Collects the rows a map function emits for one document.
#[derive(Debug, Default)]
pub struct Emitter {
    rows: Vec<EmittedRow>,
}

impl Emitter {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub fn emit(&mut self, key: impl Into<Value>, value: impl Into<Value>) {
        self.rows.push(EmittedRow {
            key: key.into(),
            value: value.into(),
            full_text: None,
        });
    }

    /// Index `text` for full-text search instead of a key.
    pub fn emit_full_text(&mut self, text: impl Into<String>, value: impl Into<Value>) {
        self.rows.push(EmittedRow {
            key: Value::Null,
            value: value.into(),
            full_text: Some(text.into()),
        });
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub(crate) fn into_rows(self) -> Vec<EmittedRow> {
        self.rows
    }
}

/// Sum of the numeric values; non-numbers count as zero.
///
/// The usual body of a counting or summing reduce function.
pub fn total_values(values: &[Value]) -> Value {
    let mut int_total: i64 = 0;
    let mut float_total: f64 = 0.0;
    let mut is_float = false;
    for value in values {
        if let Some(n) = value.as_i64() {
            int_total = int_total.saturating_add(n);
        } else if let Some(f) = value.as_f64() {
            float_total += f;
            is_float = true;
        }
    }
    if is_float {
        Value::from(int_total as f64 + float_total)
    } else {
        Value::from(int_total)
    }
}

#[derive(Default)]
struct Definition {
    map: Option<MapFn>,
    reduce: Option<ReduceFn>,
    collation: Collation,
    document_types: Option<HashSet<String>>,
}

/// A named view of one database.
pub struct View {
    db: Weak<Database>,
    name: String,
    view_id: i64,
    definition: Mutex<Definition>,
    /// Held for the whole of an index update.
    update_lease: tokio::sync::Mutex<()>,
}

impl std::fmt::Debug for View {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("View")
            .field("name", &self.name)
            .field("view_id", &self.view_id)
            .finish_non_exhaustive()
    }
}

impl View {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn view_id(&self) -> i64 {
        self.view_id
    }

    pub(crate) fn database(&self) -> Result<Arc<Database>> {
        let db = self.db.upgrade().ok_or(CoreError::Shutdown)?;
        db.ensure_open()?;
        Ok(db)
    }

    fn definition(&self) -> std::sync::MutexGuard<'_, Definition> {
        self.definition.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn map_fn(&self) -> Option<MapFn> {
        self.definition().map.clone()
    }

    pub fn reduce_fn(&self) -> Option<ReduceFn> {
        self.definition().reduce.clone()
    }

    pub fn collation(&self) -> Collation {
        self.definition().collation
    }

    /// Collation used for keys. Changing it does not re-sort stored rows;
    /// set it before the first index update.
    pub fn set_collation(&self, collation: Collation) {
        self.definition().collation = collation;
    }

    /// Only map documents whose `type` is in `types`. Documents without a
    /// `type` are always mapped.
    pub fn set_document_types<I, S>(&self, types: Option<I>)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.definition().document_types = types.map(|t| t.into_iter().map(Into::into).collect());
    }

    pub(crate) fn document_types(&self) -> Option<HashSet<String>> {
        self.definition().document_types.clone()
    }

    /// Install the map and reduce functions.
    ///
    /// `version` identifies the map function's behavior; when it differs
    /// from the stored version the index is invalidated. Returns `true` if
    /// that happened.
    #[instrument(skip(self, map, reduce), fields(view = %self.name))]
    pub async fn set_map_reduce(
        &self,
        map: MapFn,
        reduce: Option<ReduceFn>,
        version: &str,
    ) -> Result<bool> {
        // An in-flight update must not write the old watermark back over the reset.
        let _lease = self.update_lease.lock().await;
        {
            let mut definition = self.definition();
            definition.map = Some(map);
            definition.reduce = reduce;
        }
        let db = self.database()?;
        let _write = db.write_guard().await;
        let result = sqlx::query(
            "UPDATE views SET version = ?, lastsequence = 0, total_docs = -1
             WHERE view_id = ? AND (version IS NULL OR version != ?)",
        )
        .bind(version)
        .bind(self.view_id)
        .bind(version)
        .execute(db.pool())
        .await?;
        let changed = result.rows_affected() > 0;
        if changed {
            info!(version, "View version changed, index will rebuild");
        }
        Ok(changed)
    }

    /// Stored map version, if one was ever set.
    pub async fn map_version(&self) -> Result<Option<String>> {
        let db = self.database()?;
        let (version,): (Option<String>,) =
            sqlx::query_as("SELECT version FROM views WHERE view_id = ?")
                .bind(self.view_id)
                .fetch_one(db.pool())
                .await?;
        Ok(version)
    }

    /// Database sequence the index reflects.
    pub async fn last_sequence_indexed(&self) -> Result<u64> {
        let db = self.database()?;
        let (last,): (i64,) = sqlx::query_as("SELECT lastsequence FROM views WHERE view_id = ?")
            .bind(self.view_id)
            .fetch_one(db.pool())
            .await?;
        Ok(last.max(0) as u64)
    }

    /// True when the database has sequences the index has not seen.
    pub async fn is_stale(&self) -> Result<bool> {
        let db = self.database()?;
        Ok(self.last_sequence_indexed().await? < db.last_sequence_number().await?)
    }

    /// Number of rows in the index.
    pub async fn total_rows(&self) -> Result<u64> {
        let db = self.database()?;
        let (cached,): (i64,) = sqlx::query_as("SELECT total_docs FROM views WHERE view_id = ?")
            .bind(self.view_id)
            .fetch_one(db.pool())
            .await?;
        if cached >= 0 {
            return Ok(cached as u64);
        }
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM maps WHERE view_id = ?")
            .bind(self.view_id)
            .fetch_one(db.pool())
            .await?;
        Ok(count as u64)
    }

    /// Drop every index row and reset the watermark. The view stays defined.
    #[instrument(skip(self), fields(view = %self.name))]
    pub async fn delete_index(&self) -> Result<()> {
        let _lease = self.update_lease.lock().await;
        let db = self.database()?;
        let _write = db.write_guard().await;
        let mut tx = db.pool().begin().await?;
        indexer::delete_all_rows(&mut tx, self.view_id).await?;
        sqlx::query("UPDATE views SET lastsequence = 0, total_docs = 0 WHERE view_id = ?")
            .bind(self.view_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        debug!("Deleted view index");
        Ok(())
    }

    /// Remove the view and its index from the database.
    pub async fn delete_view(&self) -> Result<()> {
        self.database()?.delete_view(&self.name).await
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Database accessors
// ═══════════════════════════════════════════════════════════════════════════════

impl Database {
    /// The view called `name`, creating its row if needed.
    pub async fn view(self: &Arc<Self>, name: &str) -> Result<Arc<View>> {
        if let Some(view) = self.cached_view(name) {
            return Ok(view);
        }
        self.ensure_open()?;
        if name.is_empty() {
            return Err(CoreError::Config("View name must not be empty".into()));
        }
        {
            let _write = self.write_guard().await;
            sqlx::query("INSERT OR IGNORE INTO views (name) VALUES (?)")
                .bind(name)
                .execute(self.pool())
                .await?;
        }
        self.load_view(name)
            .await?
            .ok_or_else(|| CoreError::Internal(format!("view {name} vanished after insert")))
    }

    /// The view called `name` if it has been created before.
    pub async fn existing_view(self: &Arc<Self>, name: &str) -> Result<Option<Arc<View>>> {
        if let Some(view) = self.cached_view(name) {
            return Ok(Some(view));
        }
        self.ensure_open()?;
        self.load_view(name).await
    }

    /// Names of every stored view.
    pub async fn all_view_names(&self) -> Result<Vec<String>> {
        self.ensure_open()?;
        let rows: Vec<(String,)> = sqlx::query_as("SELECT name FROM views ORDER BY name")
            .fetch_all(self.pool())
            .await?;
        Ok(rows.into_iter().map(|(name,)| name).collect())
    }

    /// Delete a view and its index. Missing views are a [`CoreError::NotFound`].
    #[instrument(skip(self), fields(db = %self.name()))]
    pub async fn delete_view(&self, name: &str) -> Result<()> {
        self.ensure_open()?;
        let _write = self.write_guard().await;
        let mut tx = self.pool().begin().await?;
        let row: Option<(i64,)> = sqlx::query_as("SELECT view_id FROM views WHERE name = ?")
            .bind(name)
            .fetch_optional(&mut *tx)
            .await?;
        let Some((view_id,)) = row else {
            return Err(CoreError::NotFound(format!("view {name}")));
        };
        indexer::delete_all_rows(&mut tx, view_id).await?;
        sqlx::query("DELETE FROM views WHERE view_id = ?")
            .bind(view_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        self.views
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name);
        info!(view = name, "Deleted view");
        Ok(())
    }

    fn cached_view(&self, name: &str) -> Option<Arc<View>> {
        self.views
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    async fn load_view(self: &Arc<Self>, name: &str) -> Result<Option<Arc<View>>> {
        let row: Option<(i64,)> = sqlx::query_as("SELECT view_id FROM views WHERE name = ?")
            .bind(name)
            .fetch_optional(self.pool())
            .await?;
        let Some((view_id,)) = row else {
            return Ok(None);
        };
        let mut views = self.views.lock().unwrap_or_else(PoisonError::into_inner);
        let view = views
            .entry(name.to_string())
            .or_insert_with(|| {
                Arc::new(View {
                    db: Arc::downgrade(self),
                    name: name.to_string(),
                    view_id,
                    definition: Mutex::new(Definition::default()),
                    update_lease: tokio::sync::Mutex::new(()),
                })
            })
            .clone();
        Ok(Some(view))
    }
}
