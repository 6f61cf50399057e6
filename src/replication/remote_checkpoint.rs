//! Where a replication's checkpoint is written.
//!
//! The local `replicators` table is authoritative and read at bring-up.
//! After every local save the same value is mirrored to the remote's
//! `_local/<checkpoint id>` document so the peer can see how far we got.
//! The mirror is best effort: failures are logged and never fail the save.

use crate::checkpoint::CheckpointSink;
use crate::database::Database;
use crate::error::{CoreError, Result};
use crate::remote::RemoteDb;
use futures::future::BoxFuture;
use serde_json::{json, Value};
use std::sync::{Mutex, PoisonError, Weak};
use tracing::{debug, warn};

pub(crate) struct ReplicationCheckpoint {
    db: Weak<Database>,
    remote: RemoteDb,
    /// `_rev` of the remote `_local` document, once known.
    remote_rev: Mutex<Option<String>>,
}

impl ReplicationCheckpoint {
    pub fn new(db: Weak<Database>, remote: RemoteDb) -> Self {
        Self {
            db,
            remote,
            remote_rev: Mutex::new(None),
        }
    }

    fn path(checkpoint_id: &str) -> String {
        format!("_local/{checkpoint_id}")
    }

    fn set_remote_rev(&self, rev: Option<String>) {
        *self.remote_rev.lock().unwrap_or_else(PoisonError::into_inner) = rev;
    }

    fn remote_rev(&self) -> Option<String> {
        self.remote_rev.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Read the remote checkpoint document, remembering its `_rev`.
    ///
    /// `Ok(None)` when the remote has none yet.
    pub async fn fetch_remote(&self, checkpoint_id: &str) -> Result<Option<Value>> {
        match self.remote.get_json(&Self::path(checkpoint_id)).await {
            Ok(doc) => {
                self.set_remote_rev(doc.get("_rev").and_then(Value::as_str).map(str::to_string));
                Ok(Some(doc))
            }
            Err(e) if e.is_not_found() => {
                self.set_remote_rev(None);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    async fn put_remote(&self, checkpoint_id: &str, last_sequence: &str) -> Result<()> {
        let mut body = json!({ "lastSequence": last_sequence });
        if let Some(rev) = self.remote_rev() {
            body["_rev"] = Value::String(rev);
        }
        let response = self.remote.put_json(&Self::path(checkpoint_id), &body).await?;
        let rev = response.get("rev").and_then(Value::as_str).map(str::to_string);
        self.set_remote_rev(rev);
        Ok(())
    }

    async fn mirror_to_remote(&self, checkpoint_id: &str, last_sequence: &str) {
        let result = match self.put_remote(checkpoint_id, last_sequence).await {
            Err(CoreError::RemoteProtocol { status: Some(409), .. }) => {
                // Someone else moved the document; pick up its _rev and retry once.
                match self.fetch_remote(checkpoint_id).await {
                    Ok(_) => self.put_remote(checkpoint_id, last_sequence).await,
                    Err(e) => Err(e),
                }
            }
            other => other,
        };
        match result {
            Ok(()) => debug!(remote = %self.remote.masked_url(), checkpoint_id, "Mirrored checkpoint"),
            Err(e) => warn!(remote = %self.remote.masked_url(), checkpoint_id, error = %e,
                "Could not save remote checkpoint"),
        }
    }
}

impl CheckpointSink for ReplicationCheckpoint {
    fn save_checkpoint<'a>(&'a self, checkpoint_id: &'a str, last_sequence: &'a str) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let db = self.db.upgrade().ok_or(CoreError::Shutdown)?;
            db.set_last_sequence_with_checkpoint_id(checkpoint_id, last_sequence)
                .await?;
            self.mirror_to_remote(checkpoint_id, last_sequence).await;
            Ok(())
        })
    }
}
