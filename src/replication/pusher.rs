//! Push role: local changes out to the remote.
//!
//! ```text
//! changes_since(checkpoint) ──┐
//!                             ├──▶ filter ──▶ batcher ──▶ POST _revs_diff
//! db.subscribe() (continuous)─┘                                │ missing
//!                                               POST _bulk_docs (new_edits=false)
//! ```
//!
//! Revisions that were pulled from this same remote are not echoed back.
//! Items rejected by the remote with 401/403 are logged and counted as
//! done; any other per-item error leaves the sequence pending and records
//! an error so a continuous push retries it.

use super::{PendingRevision, Replication, ReplicationRole};
use crate::database::{ChangesOptions, Database, DatabaseChange};
use crate::error::{status_from_bulk_docs_error, CoreError, Result};
use crate::metrics;
use crate::revision::Revision;
use futures::future::BoxFuture;
use reqwest::Method;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, Weak};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub(super) struct Pusher {
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl Pusher {
    pub fn new() -> Self {
        Self {
            listener: Mutex::new(None),
        }
    }

    fn stop_listener(&self) {
        if let Some(listener) = self
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            listener.abort();
        }
    }

    /// Queue everything since the checkpoint, then (if continuous) follow
    /// the database's change notifications.
    async fn push_from_checkpoint(&self, repl: &Arc<Replication>) -> Result<()> {
        let db = repl.database()?;
        // Subscribe before scanning so nothing committed in between is missed.
        let notifications = repl.is_continuous().then(|| db.subscribe());
        let since = repl
            .last_sequence()
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or(0);
        let scanned_to = scan_since(repl, &db, since).await?;

        if let Some(rx) = notifications {
            self.stop_listener();
            let handle = tokio::spawn(listen(Arc::downgrade(repl), rx, scanned_to));
            *self.listener.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
        }
        Ok(())
    }
}

impl ReplicationRole for Pusher {
    fn begin_replicating<'a>(&'a self, repl: &'a Arc<Replication>) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            if repl.options().create_target {
                create_target(repl).await?;
            }
            self.push_from_checkpoint(repl).await
        })
    }

    fn process_inbox<'a>(&'a self, repl: &'a Arc<Replication>, inbox: Vec<PendingRevision>) -> BoxFuture<'a, ()> {
        Box::pin(push_revisions(repl, inbox))
    }

    fn stop(&self) {
        self.stop_listener();
    }

    fn retry<'a>(&'a self, repl: &'a Arc<Replication>) -> BoxFuture<'a, Result<()>> {
        Box::pin(self.push_from_checkpoint(repl))
    }
}

/// PUT the remote database; an existing one (412) is fine.
async fn create_target(repl: &Replication) -> Result<()> {
    let url = repl.remote().url().clone();
    match repl.remote().send_json(Method::PUT, url, None).await {
        Ok(_) => {
            info!(remote = %repl.remote().masked_url(), "Created remote database");
            Ok(())
        }
        Err(CoreError::RemoteProtocol { status: Some(412), .. }) => {
            debug!("Remote database already exists");
            Ok(())
        }
        Err(e) => Err(e),
    }
}

/// Queue current revisions after `since`. Returns the highest sequence seen.
async fn scan_since(repl: &Replication, db: &Database, since: u64) -> Result<u64> {
    let options = ChangesOptions {
        limit: None,
        include_conflicts: true,
        include_docs: repl.options().push_filter.is_some(),
    };
    let changes = db.changes_since(since, &options).await?;
    debug!(since, changes = changes.len(), "Scanned local changes");
    let mut highest = since;
    for revision in &changes {
        highest = highest.max(revision.sequence);
        consider(repl, revision);
    }
    repl.advance_checkpoint();
    Ok(highest)
}

/// Queue `revision` unless a doc-ID list or push filter excludes it.
fn consider(repl: &Replication, revision: &Revision) {
    let sequence = revision.sequence.to_string();
    let opts = repl.options();
    if let Some(doc_ids) = &opts.doc_ids {
        if !doc_ids.contains(&revision.doc_id) {
            repl.skip_sequence(&sequence);
            return;
        }
    }
    if let Some(filter) = &opts.push_filter {
        if !filter(revision, opts.filter_params.as_ref()) {
            repl.skip_sequence(&sequence);
            return;
        }
    }
    repl.queue_revision(&revision.doc_id, &revision.rev_id, revision.deleted, &sequence);
    repl.add_to_total(1);
}

/// Follow local commits for a continuous push.
async fn listen(repl: Weak<Replication>, mut rx: broadcast::Receiver<DatabaseChange>, mut after: u64) {
    loop {
        let change = rx.recv().await;
        let Some(repl) = repl.upgrade() else { return };
        if !repl.is_running() {
            return;
        }
        match change {
            Ok(change) => {
                if change.sequence <= after {
                    continue;
                }
                after = change.sequence;
                if change.source.as_deref() == Some(repl.remote().url().as_str()) {
                    // Pulled from this remote; it already has it.
                    repl.skip_sequence(&change.sequence.to_string());
                    repl.advance_checkpoint();
                    continue;
                }
                let revision = match load_for_filter(&repl, &change).await {
                    Ok(revision) => revision,
                    Err(e) => {
                        warn!(doc_id = %change.doc_id, error = %e, "Could not load changed revision");
                        continue;
                    }
                };
                consider(&repl, &revision);
            }
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped, "Change notifications lagged, rescanning");
                let db = match repl.database() {
                    Ok(db) => db,
                    Err(_) => return,
                };
                match scan_since(&repl, &db, after).await {
                    Ok(highest) => after = highest,
                    Err(e) => repl.set_error(e),
                }
            }
            Err(RecvError::Closed) => return,
        }
    }
}

async fn load_for_filter(repl: &Replication, change: &DatabaseChange) -> Result<Revision> {
    if repl.options().push_filter.is_none() {
        return Ok(Revision {
            doc_id: change.doc_id.clone(),
            rev_id: change.rev_id.clone(),
            sequence: change.sequence,
            deleted: change.deleted,
            body: None,
        });
    }
    repl.database()?
        .get_revision(&change.doc_id, &change.rev_id)
        .await?
        .ok_or_else(|| CoreError::NotFound(format!("{} {}", change.doc_id, change.rev_id)))
}

/// Status of one `_bulk_docs` response item; `None` means it succeeded.
pub(crate) fn bulk_docs_item_status(item: &Value) -> Option<u16> {
    let error = item.get("error").and_then(Value::as_str).filter(|e| !e.is_empty())?;
    let explicit = match item.get("status") {
        Some(Value::Number(n)) => n.as_u64(),
        Some(Value::String(s)) => s.parse().ok(),
        _ => None,
    };
    match explicit {
        Some(status) if status >= 400 => Some(status as u16),
        _ => Some(status_from_bulk_docs_error(error)),
    }
}

type ItemErrors<'a> = HashMap<(&'a str, Option<&'a str>), u16>;

/// Failed `_bulk_docs` items by `(id, rev)`; the rev is absent when the
/// server did not echo one.
fn item_errors(items: &[Value]) -> ItemErrors<'_> {
    items
        .iter()
        .filter_map(|item| {
            let id = item.get("id").and_then(Value::as_str)?;
            let rev = item.get("rev").and_then(Value::as_str);
            Some(((id, rev), bulk_docs_item_status(item)?))
        })
        .collect()
}

/// Exact match first; a rev-less item applies to every revision of its doc.
fn item_error_for(errors: &ItemErrors<'_>, doc_id: &str, rev_id: &str) -> Option<u16> {
    errors
        .get(&(doc_id, Some(rev_id)))
        .or_else(|| errors.get(&(doc_id, None)))
        .copied()
}

async fn push_revisions(repl: &Arc<Replication>, inbox: Vec<PendingRevision>) {
    let db = match repl.database() {
        Ok(db) => db,
        Err(_) => return,
    };

    let mut diff_request = Map::new();
    for revision in &inbox {
        let entry = diff_request
            .entry(revision.doc_id.clone())
            .or_insert_with(|| Value::Array(Vec::new()));
        if let Value::Array(revs) = entry {
            revs.push(Value::String(revision.rev_id.clone()));
        }
    }

    let diff_body = Value::Object(diff_request);
    let diff = tokio::select! {
        _ = repl.stopped_signal() => return,
        diff = repl.remote().post_json("_revs_diff", &diff_body) => diff,
    };
    let diff = match diff {
        Ok(diff) => diff,
        Err(e) => {
            warn!(error = %e, revisions = inbox.len(), "_revs_diff failed");
            for revision in &inbox {
                repl.revision_failed(revision);
            }
            repl.set_error(e);
            return;
        }
    };

    let mut docs = Vec::new();
    let mut sent = Vec::new();
    for revision in inbox {
        let missing = diff
            .get(&revision.doc_id)
            .and_then(|d| d.get("missing"))
            .and_then(Value::as_array)
            .is_some_and(|m| m.iter().any(|r| r.as_str() == Some(revision.rev_id.as_str())));
        if !missing {
            repl.revision_done(&revision);
            continue;
        }
        match db.revision_for_replication(&revision.doc_id, &revision.rev_id).await {
            Ok(properties) => {
                docs.push(Value::Object(properties));
                sent.push(revision);
            }
            Err(e) if e.is_not_found() => {
                debug!(doc_id = %revision.doc_id, rev_id = %revision.rev_id, "Revision gone, skipping");
                repl.revision_done(&revision);
            }
            Err(e) => {
                warn!(doc_id = %revision.doc_id, error = %e, "Could not load revision to push");
                repl.revision_failed(&revision);
            }
        }
    }
    if docs.is_empty() {
        return;
    }

    let body = json!({ "docs": docs, "new_edits": false });
    let response = tokio::select! {
        _ = repl.stopped_signal() => return,
        response = repl.remote().post_json("_bulk_docs", &body) => response,
    };
    let items = match response {
        Ok(Value::Array(items)) => items,
        Ok(_) => Vec::new(),
        Err(e) => {
            warn!(error = %e, docs = sent.len(), "_bulk_docs failed");
            for revision in &sent {
                repl.revision_failed(revision);
            }
            repl.set_error(e);
            return;
        }
    };

    let errors = item_errors(&items);
    let mut pushed = 0;
    let mut item_error = None;
    for revision in &sent {
        match item_error_for(&errors, &revision.doc_id, &revision.rev_id) {
            None => {
                pushed += 1;
                repl.revision_done(revision);
            }
            Some(status @ (401 | 403)) => {
                warn!(doc_id = %revision.doc_id, status, "Remote rejected revision");
                repl.revision_done(revision);
            }
            Some(status) => {
                warn!(doc_id = %revision.doc_id, status, "Remote failed to store revision");
                repl.revision_failed(revision);
                if item_error.is_none() {
                    item_error = Some(CoreError::status(
                        status,
                        format!("_bulk_docs rejected {} {}", revision.doc_id, revision.rev_id),
                    ));
                }
            }
        }
    }
    metrics::record_revisions_transferred("push", pushed);
    if let Some(e) = item_error {
        repl.set_error(e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bulk_docs_item_status() {
        assert_eq!(bulk_docs_item_status(&json!({"id": "a", "rev": "1-x"})), None);
        assert_eq!(bulk_docs_item_status(&json!({"id": "a", "error": ""})), None);
        assert_eq!(
            bulk_docs_item_status(&json!({"id": "a", "error": "forbidden", "reason": "no"})),
            Some(403)
        );
        assert_eq!(
            bulk_docs_item_status(&json!({"id": "a", "error": "conflict"})),
            Some(409)
        );
        assert_eq!(
            bulk_docs_item_status(&json!({"id": "a", "error": "weird", "status": "507"})),
            Some(507)
        );
        assert_eq!(
            bulk_docs_item_status(&json!({"id": "a", "error": "unauthorized", "status": 200})),
            Some(401)
        );
        assert_eq!(
            bulk_docs_item_status(&json!({"id": "a", "error": "whatever"})),
            Some(502)
        );
    }

    #[test]
    fn test_item_errors_match_by_revision() {
        let items = vec![
            json!({"id": "a", "rev": "1-x", "error": "conflict"}),
            json!({"id": "a", "rev": "2-y"}),
            json!({"id": "b", "error": "forbidden"}),
        ];
        let errors = item_errors(&items);
        assert_eq!(item_error_for(&errors, "a", "1-x"), Some(409));
        assert_eq!(item_error_for(&errors, "a", "2-y"), None);
        assert_eq!(item_error_for(&errors, "b", "1-z"), Some(403));
        assert_eq!(item_error_for(&errors, "c", "1-z"), None);
    }
}
