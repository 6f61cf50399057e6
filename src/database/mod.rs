// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! The local database: revision storage layered on a SQLite row store.
//!
//! A [`Database`] owns three things exclusively: its row store (documents,
//! revisions, view indexes, checkpoints), its blob store directory, and the
//! registry of replications currently running against it.
//!
//! # Revision Model
//!
//! ```text
//!  docs ──< revs (sequence, revid, parent, current, deleted, json)
//!                 │
//!                 └──< attachments (sequence, filename, blob key)
//! ```
//!
//! Every write appends a row to `revs` and gets the next `sequence`.
//! A revision is *current* when it is a leaf of its document's revision
//! tree. Among current revisions, the winner is the highest non-deleted
//! one by [`compare_rev_ids`], falling back to the highest deleted one.
//!
//! # Write Paths
//!
//! - [`Database::put`]: local edit. The caller names the parent via `_rev`;
//!   naming a non-leaf is a [`CoreError::Conflict`].
//! - [`Database::force_insert`]: replicated edit with its full ancestry.
//!   Missing ancestors are inserted as bodiless placeholders so conflicting
//!   branches coexist.
//!
//! Both paths serialize on a write lock and publish a [`DatabaseChange`]
//! after commit.
//!
//! # Close Cascade
//!
//! [`Database::close`] tells every registered replication that the database
//! is going away (they save their checkpoint and stop), then releases the
//! pool. Replications are held weakly so a dropped replication never keeps
//! the database alive, and vice versa.

mod attachments;
mod checkpoints;
pub(crate) mod schema;

pub use attachments::AttachmentInfo;

use crate::blob::{BlobStore, EncryptionKey};
use crate::config::DatabaseConfig;
use crate::error::{CoreError, Result};
use crate::revision::{
    compare_rev_ids, generation_of, next_rev_id, strip_special_properties, Revision,
};
use crate::view::View;
use futures::future::BoxFuture;
use serde_json::{Map, Value};
use sqlx::sqlite::{SqliteConnection, SqlitePool};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, info, instrument, warn};

const CHANGE_CHANNEL_CAPACITY: usize = 1024;

/// Published after every committed revision.
#[derive(Debug, Clone, PartialEq)]
pub struct DatabaseChange {
    pub sequence: u64,
    pub doc_id: String,
    pub rev_id: String,
    pub deleted: bool,
    /// Remote URL the revision was pulled from; `None` for local edits.
    pub source: Option<String>,
}

/// Options for [`Database::changes_since`].
#[derive(Debug, Clone, Default)]
pub struct ChangesOptions {
    pub limit: Option<usize>,
    /// Report every current leaf, not just the winner.
    pub include_conflicts: bool,
    /// Load revision bodies.
    pub include_docs: bool,
}

/// What the database needs from a replication running against it.
///
/// Implemented by [`Replication`](crate::replication::Replication); the
/// database holds these weakly.
pub trait ActiveReplication: Send + Sync {
    fn session_id(&self) -> &str;

    /// The database is closing: save the checkpoint, stop, and drop the
    /// database reference.
    fn database_closing(&self) -> BoxFuture<'_, ()>;
}

/// An open local database.
pub struct Database {
    config: DatabaseConfig,
    pool: SqlitePool,
    blobs: Arc<BlobStore>,
    /// Serializes write transactions.
    write_lock: tokio::sync::Mutex<()>,
    changes: broadcast::Sender<DatabaseChange>,
    /// Last saved sequence per checkpoint ID, mirrored from `replicators`.
    checkpoints: RwLock<HashMap<String, String>>,
    replications: Mutex<Vec<Weak<dyn ActiveReplication>>>,
    pub(crate) views: Mutex<HashMap<String, Arc<View>>>,
    session_counter: AtomicU32,
    private_uuid: String,
    public_uuid: String,
    open: AtomicBool,
    closing: AtomicBool,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("name", &self.config.name)
            .field("open", &self.is_open())
            .finish_non_exhaustive()
    }
}

impl Database {
    /// Open (creating if needed) the database described by `config`.
    #[instrument(skip(config), fields(db = %config.name))]
    pub async fn open(config: DatabaseConfig) -> Result<Arc<Self>> {
        config.validate()?;
        std::fs::create_dir_all(&config.directory)
            .map_err(|e| CoreError::blob_io(&config.directory, e))?;

        let key = config
            .blob_store
            .encryption_password
            .as_deref()
            .map(EncryptionKey::from_password);
        let blobs = BlobStore::open(config.attachments_path(), key)?;
        let pool = schema::connect(&config.sqlite_path()).await?;

        let private_uuid = load_or_create_uuid(&pool, "privateUUID").await?;
        let public_uuid = load_or_create_uuid(&pool, "publicUUID").await?;
        let checkpoints = checkpoints::load_all(&pool).await?;
        if !checkpoints.is_empty() {
            info!(count = checkpoints.len(), "Restored replication checkpoints");
        }

        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        info!(path = %config.sqlite_path().display(), "Opened database");

        Ok(Arc::new(Self {
            config,
            pool,
            blobs: Arc::new(blobs),
            write_lock: tokio::sync::Mutex::new(()),
            changes,
            checkpoints: RwLock::new(checkpoints),
            replications: Mutex::new(Vec::new()),
            views: Mutex::new(HashMap::new()),
            session_counter: AtomicU32::new(0),
            private_uuid,
            public_uuid,
            open: AtomicBool::new(true),
            closing: AtomicBool::new(false),
        }))
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &DatabaseConfig {
        &self.config
    }

    pub fn blob_store(&self) -> &BlobStore {
        &self.blobs
    }

    pub(crate) fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Never leaves this device; feeds checkpoint IDs.
    pub fn private_uuid(&self) -> &str {
        &self.private_uuid
    }

    pub fn public_uuid(&self) -> &str {
        &self.public_uuid
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    pub(crate) fn ensure_open(&self) -> Result<()> {
        if self.is_open() {
            Ok(())
        } else {
            Err(CoreError::InvalidState {
                expected: "open database".into(),
                actual: "closed".into(),
            })
        }
    }

    /// Subscribe to committed revisions.
    pub fn subscribe(&self) -> broadcast::Receiver<DatabaseChange> {
        self.changes.subscribe()
    }

    /// Take the write lock for a transaction that mutates the row store.
    pub(crate) async fn write_guard(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.write_lock.lock().await
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Writes
    // ═══════════════════════════════════════════════════════════════════════

    /// Save a new revision of `doc_id` from `properties`.
    ///
    /// `_rev` names the parent revision and must be a current leaf. Without
    /// `_rev` the document must not exist (or its winner must be deleted).
    /// `_deleted: true` writes a tombstone. Inline attachment `data` is moved
    /// into the blob store and replaced by a stub.
    #[instrument(skip(self, properties), fields(db = %self.config.name))]
    pub async fn put(&self, doc_id: &str, properties: Map<String, Value>) -> Result<Revision> {
        self.ensure_open()?;
        if doc_id.is_empty() {
            return Err(CoreError::Config("Document ID must not be empty".into()));
        }
        let prev_rev = properties
            .get("_rev")
            .and_then(Value::as_str)
            .map(str::to_string);
        let deleted = properties
            .get("_deleted")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let mut body = strip_special_properties(&properties);
        let revpos = prev_rev.as_deref().map(generation_of).unwrap_or(0) + 1;
        self.store_inline_attachments(&mut body, revpos).await?;

        let _guard = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;
        let numeric_id = doc_numeric_id(&mut tx, doc_id).await?;

        let leaves: Vec<(i64, String, bool)> = sqlx::query_as(
            "SELECT sequence, revid, deleted FROM revs WHERE doc_id = ? AND current = 1",
        )
        .bind(numeric_id)
        .fetch_all(&mut *tx)
        .await?;

        let parent: Option<(i64, String)> = match prev_rev.as_deref() {
            Some(prev) => match leaves.iter().find(|(_, rev, _)| rev == prev) {
                Some((seq, rev, _)) => Some((*seq, rev.clone())),
                None => return Err(CoreError::Conflict(format!("{doc_id} is not at {prev}"))),
            },
            None => {
                if leaves.iter().any(|(_, _, del)| !del) {
                    return Err(CoreError::Conflict(format!("{doc_id} already exists")));
                }
                if deleted {
                    return Err(CoreError::NotFound(doc_id.to_string()));
                }
                // Recreating a deleted document continues its tombstone branch.
                leaves
                    .iter()
                    .max_by(|a, b| compare_rev_ids(&a.1, &b.1))
                    .map(|(seq, rev, _)| (*seq, rev.clone()))
            }
        };

        if let Some((parent_seq, _)) = &parent {
            attachments::resolve_stubs(&mut tx, &mut body, *parent_seq).await?;
        }

        let rev_id = next_rev_id(parent.as_ref().map(|(_, r)| r.as_str()), &body, deleted);
        let sequence = insert_revision(
            &mut tx,
            &NewRevision {
                doc_numeric_id: numeric_id,
                rev_id: &rev_id,
                parent: parent.as_ref().map(|(s, _)| *s),
                current: true,
                deleted,
                body: Some(&body),
                source: None,
            },
        )
        .await?;
        if let Some((parent_seq, _)) = &parent {
            sqlx::query("UPDATE revs SET current = 0 WHERE sequence = ?")
                .bind(parent_seq)
                .execute(&mut *tx)
                .await?;
        }
        attachments::insert_rows(&mut tx, sequence, &body).await?;
        tx.commit().await?;

        debug!(doc_id, rev_id = %rev_id, sequence, "Saved revision");
        let revision = Revision {
            doc_id: doc_id.to_string(),
            rev_id,
            sequence: sequence as u64,
            deleted,
            body: Some(body),
        };
        self.notify(&revision, None);
        Ok(revision)
    }

    /// Tombstone the current revision `rev_id` of `doc_id`.
    pub async fn delete_document(&self, doc_id: &str, rev_id: &str) -> Result<Revision> {
        let mut props = Map::new();
        props.insert("_rev".into(), Value::String(rev_id.to_string()));
        props.insert("_deleted".into(), Value::Bool(true));
        self.put(doc_id, props).await
    }

    /// Insert a revision received from elsewhere, with its ancestry.
    ///
    /// `history` lists revision IDs newest first and must start with the
    /// revision's own `_rev`. Returns `None` if the revision already exists.
    #[instrument(skip(self, properties, history), fields(db = %self.config.name))]
    pub async fn force_insert(
        &self,
        properties: Map<String, Value>,
        history: &[String],
        source: Option<&str>,
    ) -> Result<Option<Revision>> {
        self.ensure_open()?;
        let doc_id = properties
            .get("_id")
            .and_then(Value::as_str)
            .ok_or_else(|| CoreError::malformed("revision has no _id"))?
            .to_string();
        let rev_id = properties
            .get("_rev")
            .and_then(Value::as_str)
            .ok_or_else(|| CoreError::malformed("revision has no _rev"))?
            .to_string();
        if history.first().map(String::as_str) != Some(rev_id.as_str()) {
            return Err(CoreError::malformed(format!(
                "history of {doc_id} does not start at {rev_id}"
            )));
        }
        let deleted = properties
            .get("_deleted")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let mut body = strip_special_properties(&properties);
        self.store_inline_attachments(&mut body, generation_of(&rev_id)).await?;

        let _guard = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;
        let numeric_id = doc_numeric_id(&mut tx, &doc_id).await?;

        // Find the newest ancestor we already have.
        let mut common: Option<(usize, i64)> = None;
        for (i, rev) in history.iter().enumerate() {
            let found: Option<(i64,)> =
                sqlx::query_as("SELECT sequence FROM revs WHERE doc_id = ? AND revid = ?")
                    .bind(numeric_id)
                    .bind(rev)
                    .fetch_optional(&mut *tx)
                    .await?;
            if let Some((seq,)) = found {
                common = Some((i, seq));
                break;
            }
        }
        if matches!(common, Some((0, _))) {
            tx.rollback().await?;
            debug!(doc_id = %doc_id, rev_id = %rev_id, "Revision already present");
            return Ok(None);
        }

        let (end, mut parent) = match common {
            Some((i, seq)) => (i, Some(seq)),
            None => (history.len(), None),
        };
        if let Some(ancestor) = parent {
            sqlx::query("UPDATE revs SET current = 0 WHERE sequence = ?")
                .bind(ancestor)
                .execute(&mut *tx)
                .await?;
        }
        let mut sequence = 0;
        for index in (0..end).rev() {
            let leaf = index == 0;
            sequence = insert_revision(
                &mut tx,
                &NewRevision {
                    doc_numeric_id: numeric_id,
                    rev_id: &history[index],
                    parent,
                    current: leaf,
                    deleted: leaf && deleted,
                    body: if leaf { Some(&body) } else { None },
                    source: if leaf { source } else { None },
                },
            )
            .await?;
            parent = Some(sequence);
        }
        attachments::insert_rows(&mut tx, sequence, &body).await?;
        tx.commit().await?;

        debug!(doc_id = %doc_id, rev_id = %rev_id, sequence, "Inserted replicated revision");
        let revision = Revision {
            doc_id,
            rev_id,
            sequence: sequence as u64,
            deleted,
            body: Some(body),
        };
        self.notify(&revision, source);
        Ok(Some(revision))
    }

    fn notify(&self, revision: &Revision, source: Option<&str>) {
        // No receivers is fine.
        let _ = self.changes.send(DatabaseChange {
            sequence: revision.sequence,
            doc_id: revision.doc_id.clone(),
            rev_id: revision.rev_id.clone(),
            deleted: revision.deleted,
            source: source.map(str::to_string),
        });
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Reads
    // ═══════════════════════════════════════════════════════════════════════

    /// The winning revision of `doc_id`, or `None` if missing or deleted.
    pub async fn get_document(&self, doc_id: &str) -> Result<Option<Revision>> {
        self.ensure_open()?;
        let row: Option<(i64, String, bool, Option<String>)> = sqlx::query_as(
            "SELECT revs.sequence, revs.revid, revs.deleted, revs.json
             FROM revs JOIN docs ON revs.doc_id = docs.doc_id
             WHERE docs.docid = ? AND revs.current = 1
             ORDER BY revs.deleted ASC, revs.revid DESC LIMIT 1",
        )
        .bind(doc_id)
        .fetch_optional(&self.pool)
        .await?;
        match row {
            Some((_, _, true, _)) | None => Ok(None),
            Some((seq, rev, deleted, json)) => Ok(Some(Revision {
                doc_id: doc_id.to_string(),
                rev_id: rev,
                sequence: seq as u64,
                deleted,
                body: parse_body(json.as_deref())?,
            })),
        }
    }

    /// A specific revision, deleted or not. Placeholder ancestors have no body.
    pub async fn get_revision(&self, doc_id: &str, rev_id: &str) -> Result<Option<Revision>> {
        self.ensure_open()?;
        let row: Option<(i64, bool, Option<String>)> = sqlx::query_as(
            "SELECT revs.sequence, revs.deleted, revs.json
             FROM revs JOIN docs ON revs.doc_id = docs.doc_id
             WHERE docs.docid = ? AND revs.revid = ?",
        )
        .bind(doc_id)
        .bind(rev_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|(seq, deleted, json)| {
            Ok(Revision {
                doc_id: doc_id.to_string(),
                rev_id: rev_id.to_string(),
                sequence: seq as u64,
                deleted,
                body: parse_body(json.as_deref())?,
            })
        })
        .transpose()
    }

    /// Revision IDs from `rev_id` back to the root, newest first.
    pub async fn revision_history(&self, doc_id: &str, rev_id: &str) -> Result<Vec<String>> {
        self.ensure_open()?;
        let rows: Vec<(String,)> = sqlx::query_as(
            "WITH RECURSIVE chain(sequence, revid, parent) AS (
                SELECT revs.sequence, revs.revid, revs.parent
                FROM revs JOIN docs ON revs.doc_id = docs.doc_id
                WHERE docs.docid = ? AND revs.revid = ?
                UNION ALL
                SELECT r.sequence, r.revid, r.parent FROM revs r JOIN chain c ON r.sequence = c.parent
             )
             SELECT revid FROM chain",
        )
        .bind(doc_id)
        .bind(rev_id)
        .fetch_all(&self.pool)
        .await?;
        let mut history: Vec<String> = rows.into_iter().map(|(r,)| r).collect();
        history.sort_by(|a, b| compare_rev_ids(b, a));
        Ok(history)
    }

    /// Current non-deleted leaves other than the winner, highest first.
    pub async fn conflicting_rev_ids(&self, doc_id: &str) -> Result<Vec<String>> {
        self.ensure_open()?;
        let rows: Vec<(String, bool)> = sqlx::query_as(
            "SELECT revs.revid, revs.deleted
             FROM revs JOIN docs ON revs.doc_id = docs.doc_id
             WHERE docs.docid = ? AND revs.current = 1
             ORDER BY revs.deleted ASC, revs.revid DESC",
        )
        .bind(doc_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .skip(1)
            .filter(|(_, deleted)| !deleted)
            .map(|(rev, _)| rev)
            .collect())
    }

    /// Which of the given revisions are not stored locally.
    pub async fn revs_diff(
        &self,
        revs: &BTreeMap<String, Vec<String>>,
    ) -> Result<BTreeMap<String, Vec<String>>> {
        self.ensure_open()?;
        let mut missing = BTreeMap::new();
        for (doc_id, rev_ids) in revs {
            let rows: Vec<(String,)> = sqlx::query_as(
                "SELECT revs.revid FROM revs JOIN docs ON revs.doc_id = docs.doc_id
                 WHERE docs.docid = ?",
            )
            .bind(doc_id)
            .fetch_all(&self.pool)
            .await?;
            let have: HashSet<String> = rows.into_iter().map(|(r,)| r).collect();
            let absent: Vec<String> = rev_ids
                .iter()
                .filter(|r| !have.contains(*r))
                .cloned()
                .collect();
            if !absent.is_empty() {
                missing.insert(doc_id.clone(), absent);
            }
        }
        Ok(missing)
    }

    /// Current revisions with `sequence > since`, in sequence order.
    pub async fn changes_since(&self, since: u64, options: &ChangesOptions) -> Result<Vec<Revision>> {
        self.ensure_open()?;
        let rows: Vec<(i64, String, String, bool, Option<String>)> = sqlx::query_as(
            "SELECT revs.sequence, docs.docid, revs.revid, revs.deleted, revs.json
             FROM revs JOIN docs ON revs.doc_id = docs.doc_id
             WHERE revs.sequence > ? AND revs.current = 1
             ORDER BY revs.doc_id, revs.deleted ASC, revs.revid DESC",
        )
        .bind(since as i64)
        .fetch_all(&self.pool)
        .await?;

        let mut changes = Vec::with_capacity(rows.len());
        let mut last_doc: Option<String> = None;
        for (seq, doc_id, rev_id, deleted, json) in rows {
            let same_doc = last_doc.as_deref() == Some(doc_id.as_str());
            if same_doc && !options.include_conflicts {
                continue;
            }
            last_doc = Some(doc_id.clone());
            let body = if options.include_docs {
                parse_body(json.as_deref())?
            } else {
                None
            };
            changes.push(Revision {
                doc_id,
                rev_id,
                sequence: seq as u64,
                deleted,
                body,
            });
        }
        changes.sort_by_key(|r| r.sequence);
        if let Some(limit) = options.limit {
            changes.truncate(limit);
        }
        Ok(changes)
    }

    /// Highest sequence assigned so far (0 when empty).
    pub async fn last_sequence_number(&self) -> Result<u64> {
        self.ensure_open()?;
        let (max,): (Option<i64>,) = sqlx::query_as("SELECT MAX(sequence) FROM revs")
            .fetch_one(&self.pool)
            .await?;
        Ok(max.unwrap_or(0) as u64)
    }

    /// Number of documents whose winner is not deleted.
    pub async fn document_count(&self) -> Result<u64> {
        self.ensure_open()?;
        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(DISTINCT doc_id) FROM revs WHERE current = 1 AND deleted = 0",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(count as u64)
    }

    /// Properties of a revision ready to send to a peer: `_revisions` history
    /// and attachment bodies inlined.
    pub async fn revision_for_replication(&self, doc_id: &str, rev_id: &str) -> Result<Map<String, Value>> {
        let revision = self
            .get_revision(doc_id, rev_id)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("{doc_id} {rev_id}")))?;
        let history = self.revision_history(doc_id, rev_id).await?;
        let mut props = revision.properties();
        props.insert(
            "_revisions".into(),
            crate::revision::revisions_object(&history),
        );
        self.expand_attachments(&mut props).await?;
        Ok(props)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Replications
    // ═══════════════════════════════════════════════════════════════════════

    /// Next replication session ID: `repl001`, `repl002`, ...
    pub fn next_session_id(&self) -> String {
        let n = self.session_counter.fetch_add(1, Ordering::Relaxed) + 1;
        format!("repl{:03}", n)
    }

    /// Register a running replication so `close()` can stop it.
    pub fn add_active_replication(&self, replication: Weak<dyn ActiveReplication>) {
        let mut list = self.replications.lock().unwrap_or_else(PoisonError::into_inner);
        list.retain(|r| r.strong_count() > 0);
        list.push(replication);
    }

    pub fn forget_replication(&self, session_id: &str) {
        let mut list = self.replications.lock().unwrap_or_else(PoisonError::into_inner);
        list.retain(|r| match r.upgrade() {
            Some(rep) => rep.session_id() != session_id,
            None => false,
        });
    }

    pub fn active_replications(&self) -> Vec<Arc<dyn ActiveReplication>> {
        let list = self.replications.lock().unwrap_or_else(PoisonError::into_inner);
        list.iter().filter_map(Weak::upgrade).collect()
    }

    /// Stop every replication (saving checkpoints), then release storage.
    ///
    /// Idempotent.
    #[instrument(skip(self), fields(db = %self.config.name))]
    pub async fn close(&self) -> Result<()> {
        if self.closing.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let replications = self.active_replications();
        if !replications.is_empty() {
            info!(count = replications.len(), "Stopping replications before close");
        }
        for replication in replications {
            replication.database_closing().await;
        }
        self.views
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        self.open.store(false, Ordering::Release);
        self.pool.close().await;
        info!("Closed database");
        Ok(())
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        if self.is_open() {
            warn!(db = %self.config.name, "Database dropped without close()");
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Row helpers
// ═══════════════════════════════════════════════════════════════════════════════

struct NewRevision<'a> {
    doc_numeric_id: i64,
    rev_id: &'a str,
    parent: Option<i64>,
    current: bool,
    deleted: bool,
    body: Option<&'a Map<String, Value>>,
    source: Option<&'a str>,
}

async fn insert_revision(conn: &mut SqliteConnection, rev: &NewRevision<'_>) -> Result<i64> {
    let json = rev
        .body
        .map(|b| serde_json::to_string(b))
        .transpose()?;
    let no_attachments = rev
        .body
        .map(|b| !b.contains_key("_attachments"))
        .unwrap_or(true);
    let doc_type = rev
        .body
        .and_then(|b| b.get("type"))
        .and_then(Value::as_str);
    let result = sqlx::query(
        "INSERT INTO revs (doc_id, revid, parent, current, deleted, json, no_attachments, doc_type, source)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(rev.doc_numeric_id)
    .bind(rev.rev_id)
    .bind(rev.parent)
    .bind(rev.current)
    .bind(rev.deleted)
    .bind(json)
    .bind(no_attachments)
    .bind(doc_type)
    .bind(rev.source)
    .execute(&mut *conn)
    .await?;
    Ok(result.last_insert_rowid())
}

/// Row ID of `doc_id` in `docs`, inserting it if new.
async fn doc_numeric_id(conn: &mut SqliteConnection, doc_id: &str) -> Result<i64> {
    let existing: Option<(i64,)> = sqlx::query_as("SELECT doc_id FROM docs WHERE docid = ?")
        .bind(doc_id)
        .fetch_optional(&mut *conn)
        .await?;
    if let Some((id,)) = existing {
        return Ok(id);
    }
    let result = sqlx::query("INSERT INTO docs (docid) VALUES (?)")
        .bind(doc_id)
        .execute(&mut *conn)
        .await?;
    Ok(result.last_insert_rowid())
}

pub(crate) fn parse_body(json: Option<&str>) -> Result<Option<Map<String, Value>>> {
    match json {
        None => Ok(None),
        Some(text) => match serde_json::from_str::<Value>(text)? {
            Value::Object(map) => Ok(Some(map)),
            _ => Err(CoreError::Internal("stored revision body is not an object".into())),
        },
    }
}

async fn load_or_create_uuid(pool: &SqlitePool, key: &str) -> Result<String> {
    let existing: Option<(String,)> = sqlx::query_as("SELECT value FROM info WHERE key = ?")
        .bind(key)
        .fetch_optional(pool)
        .await?;
    if let Some((value,)) = existing {
        return Ok(value);
    }
    let value = hex::encode(rand::random::<[u8; 16]>());
    schema::execute_with_retry("create_uuid", || {
        sqlx::query("INSERT OR IGNORE INTO info (key, value) VALUES (?, ?)")
            .bind(key)
            .bind(&value)
            .execute(pool)
    })
    .await?;
    // Another connection may have won the insert.
    let (stored,): (String,) = sqlx::query_as("SELECT value FROM info WHERE key = ?")
        .bind(key)
        .fetch_one(pool)
        .await?;
    Ok(stored)
}
