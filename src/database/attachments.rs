//! Attachment bookkeeping between revision bodies and the blob store.
//!
//! Revision bodies only ever hold attachment *stubs*:
//!
//! ```json
//! {"_attachments": {"photo.jpg": {"stub": true, "digest": "sha1-…",
//!   "length": 1234, "content_type": "image/jpeg", "revpos": 2}}}
//! ```
//!
//! Inline `data` (base64) arriving through `put` or a pull is moved into the
//! blob store on the way in; `expand_attachments` reverses that for a push.
//! The `attachments` table maps each revision to the blob keys it
//! references, which is what compaction keeps.

use super::Database;
use crate::blob::{BlobKey, BlobStore};
use crate::error::{CoreError, Result};
use data_encoding::BASE64;
use serde_json::{Map, Value};
use sqlx::sqlite::SqliteConnection;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// One attachment of a stored revision.
#[derive(Debug, Clone, PartialEq)]
pub struct AttachmentInfo {
    pub name: String,
    pub key: BlobKey,
    pub content_type: Option<String>,
    pub length: u64,
    pub revpos: u64,
}

fn attachments_mut(body: &mut Map<String, Value>) -> Result<Option<&mut Map<String, Value>>> {
    match body.get_mut("_attachments") {
        None => Ok(None),
        Some(Value::Object(map)) => Ok(Some(map)),
        Some(_) => Err(CoreError::malformed("_attachments is not an object")),
    }
}

impl Database {
    /// Run blocking blob store work off the async executor.
    pub(crate) async fn with_blobs<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&BlobStore) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let blobs = Arc::clone(&self.blobs);
        tokio::task::spawn_blocking(move || f(&blobs))
            .await
            .map_err(|e| CoreError::Internal(format!("blob store task failed: {e}")))?
    }

    /// Move inline `data` into the blob store, leaving stubs behind.
    pub(super) async fn store_inline_attachments(
        &self,
        body: &mut Map<String, Value>,
        revpos: u64,
    ) -> Result<()> {
        let Some(attachments) = attachments_mut(body)? else {
            return Ok(());
        };

        for (name, entry) in attachments.iter_mut() {
            let Some(meta) = entry.as_object_mut() else {
                return Err(CoreError::malformed(format!("attachment {name} is not an object")));
            };
            let Some(data) = meta.remove("data") else {
                continue;
            };
            let encoded = data
                .as_str()
                .ok_or_else(|| CoreError::malformed(format!("attachment {name} data is not a string")))?;
            let bytes = BASE64
                .decode(encoded.as_bytes())
                .map_err(|e| CoreError::malformed(format!("attachment {name}: {e}")))?;
            let length = bytes.len() as u64;
            let key = self.with_blobs(move |blobs| blobs.store(&bytes)).await?;

            meta.remove("follows");
            meta.insert("stub".into(), Value::Bool(true));
            meta.insert("digest".into(), Value::String(key.digest_string()));
            meta.insert("length".into(), Value::from(length));
            if !meta.contains_key("revpos") {
                meta.insert("revpos".into(), Value::from(revpos));
            }
            debug!(attachment = %name, key = %key, length, "Stored inline attachment");
        }
        Ok(())
    }

    /// Replace stubs with base64 `data` read from the blob store.
    pub async fn expand_attachments(&self, props: &mut Map<String, Value>) -> Result<()> {
        let Some(attachments) = attachments_mut(props)? else {
            return Ok(());
        };
        for (name, entry) in attachments.iter_mut() {
            let Some(meta) = entry.as_object_mut() else {
                continue;
            };
            let key = meta
                .get("digest")
                .and_then(Value::as_str)
                .and_then(BlobKey::from_digest_string)
                .ok_or_else(|| CoreError::NotFound(format!("attachment {name} has no local digest")))?;
            let bytes = self.with_blobs(move |blobs| blobs.fetch(&key)).await?;
            meta.remove("stub");
            meta.insert("data".into(), Value::String(BASE64.encode(&bytes)));
        }
        Ok(())
    }

    /// Attachments of one stored revision.
    pub async fn attachments_for(&self, doc_id: &str, rev_id: &str) -> Result<Vec<AttachmentInfo>> {
        self.ensure_open()?;
        let rows: Vec<(String, String, Option<String>, i64, i64)> = sqlx::query_as(
            "SELECT a.filename, a.key, a.type, a.length, a.revpos
             FROM attachments a
             JOIN revs ON a.sequence = revs.sequence
             JOIN docs ON revs.doc_id = docs.doc_id
             WHERE docs.docid = ? AND revs.revid = ?
             ORDER BY a.filename",
        )
        .bind(doc_id)
        .bind(rev_id)
        .fetch_all(self.pool())
        .await?;
        rows.into_iter()
            .map(|(name, key, content_type, length, revpos)| {
                let key = BlobKey::from_hex(&key)
                    .ok_or_else(|| CoreError::Internal(format!("bad blob key {key}")))?;
                Ok(AttachmentInfo {
                    name,
                    key,
                    content_type,
                    length: length as u64,
                    revpos: revpos as u64,
                })
            })
            .collect()
    }

    /// Content of attachment `name` on the winning revision of `doc_id`.
    pub async fn get_attachment(&self, doc_id: &str, name: &str) -> Result<Vec<u8>> {
        let winner = self
            .get_document(doc_id)
            .await?
            .ok_or_else(|| CoreError::NotFound(doc_id.to_string()))?;
        let info = self
            .attachments_for(doc_id, &winner.rev_id)
            .await?
            .into_iter()
            .find(|a| a.name == name)
            .ok_or_else(|| CoreError::NotFound(format!("{doc_id}/{name}")))?;
        self.with_blobs(move |blobs| blobs.fetch(&info.key)).await
    }

    /// Delete every blob no stored revision references.
    ///
    /// Returns the number of files removed.
    pub async fn compact_attachments(&self) -> Result<usize> {
        self.ensure_open()?;
        let rows: Vec<(String,)> = sqlx::query_as("SELECT DISTINCT key FROM attachments")
            .fetch_all(self.pool())
            .await?;
        let keep: HashSet<BlobKey> = rows
            .into_iter()
            .filter_map(|(k,)| BlobKey::from_hex(&k))
            .collect();
        let kept = keep.len();
        let deleted = self
            .with_blobs(move |blobs| Ok(blobs.delete_blobs_except(&keep)))
            .await?;
        info!(deleted, kept, "Compacted attachments");
        Ok(deleted)
    }
}

/// Fill in stubs that carry no digest from the parent revision's rows.
pub(super) async fn resolve_stubs(
    conn: &mut SqliteConnection,
    body: &mut Map<String, Value>,
    parent_sequence: i64,
) -> Result<()> {
    let Some(attachments) = attachments_mut(body)? else {
        return Ok(());
    };
    for (name, entry) in attachments.iter_mut() {
        let Some(meta) = entry.as_object_mut() else {
            continue;
        };
        if meta.contains_key("digest") || meta.get("stub") != Some(&Value::Bool(true)) {
            continue;
        }
        let row: Option<(String, Option<String>, i64, i64)> = sqlx::query_as(
            "SELECT key, type, length, revpos FROM attachments WHERE sequence = ? AND filename = ?",
        )
        .bind(parent_sequence)
        .bind(name)
        .fetch_optional(&mut *conn)
        .await?;
        let (key, content_type, length, revpos) =
            row.ok_or_else(|| CoreError::NotFound(format!("attachment stub {name}")))?;
        let key = BlobKey::from_hex(&key)
            .ok_or_else(|| CoreError::Internal(format!("bad blob key {key}")))?;
        meta.insert("digest".into(), Value::String(key.digest_string()));
        meta.insert("length".into(), Value::from(length));
        meta.insert("revpos".into(), Value::from(revpos));
        if let Some(content_type) = content_type {
            meta.entry("content_type").or_insert(Value::String(content_type));
        }
    }
    Ok(())
}

/// Record the blob keys a new revision references.
pub(super) async fn insert_rows(
    conn: &mut SqliteConnection,
    sequence: i64,
    body: &Map<String, Value>,
) -> Result<()> {
    let Some(Value::Object(attachments)) = body.get("_attachments") else {
        return Ok(());
    };
    for (name, entry) in attachments {
        let digest = entry.get("digest").and_then(Value::as_str);
        let Some(key) = digest.and_then(BlobKey::from_digest_string) else {
            warn!(attachment = %name, digest = ?digest, "Attachment has no local blob, skipping");
            continue;
        };
        sqlx::query(
            "INSERT INTO attachments (sequence, filename, key, type, length, revpos)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(sequence)
        .bind(name)
        .bind(key.to_hex())
        .bind(entry.get("content_type").and_then(Value::as_str))
        .bind(entry.get("length").and_then(Value::as_i64).unwrap_or(0))
        .bind(entry.get("revpos").and_then(Value::as_i64).unwrap_or(0))
        .execute(&mut *conn)
        .await?;
    }
    Ok(())
}
