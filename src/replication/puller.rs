//! Pull role: remote `_changes` feed into the local database.
//!
//! ```text
//! ChangeTracker ──rows──▶ local revs check ──missing──▶ batcher
//!                               │                          │
//!                          present: skip          GET doc?rev&revs=true
//!                                                          │
//!                                                 force_insert(history)
//! ```
//!
//! One-shot pulls read a `feed=normal` response and hold an async task
//! until the tracker stops, so the replication cannot go idle while rows
//! are still arriving. Continuous pulls long-poll and go idle between
//! responses.

use super::{AsyncTask, PendingRevision, Replication, ReplicationRole};
use crate::change_tracker::{
    ChangeTracker, ChangeTrackerClient, ChangeTrackerMode, ChangeTrackerOptions, RemoteChange,
};
use crate::database::Database;
use crate::error::{CoreError, Result};
use crate::metrics;
use crate::revision::parse_revisions_object;
use futures::future::BoxFuture;
use futures::StreamExt;
use reqwest::Method;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError, Weak};
use tracing::{debug, info, warn};

pub(super) struct Puller {
    tracker: Mutex<Option<Arc<ChangeTracker>>>,
}

impl Puller {
    pub fn new() -> Self {
        Self {
            tracker: Mutex::new(None),
        }
    }

    fn replace_tracker(&self, tracker: Option<Arc<ChangeTracker>>) -> Option<Arc<ChangeTracker>> {
        let mut slot = self.tracker.lock().unwrap_or_else(PoisonError::into_inner);
        std::mem::replace(&mut *slot, tracker)
    }

    fn start_change_tracker(&self, repl: &Arc<Replication>) -> Result<()> {
        let opts = repl.options();
        let mode = if opts.continuous {
            ChangeTrackerMode::LongPoll
        } else {
            ChangeTrackerMode::OneShot
        };
        let mut tracker_opts = ChangeTrackerOptions::new(mode, repl.settings());
        tracker_opts.include_conflicts = true;
        tracker_opts.filter_name = opts.filter.clone();
        tracker_opts.filter_params = opts.filter_params.clone();
        tracker_opts.doc_ids = opts.doc_ids.clone();

        let client = Arc::new(PullerClient {
            repl: Arc::downgrade(repl),
            continuous: opts.continuous,
            task: Mutex::new((!opts.continuous).then(|| repl.track_task())),
        });
        let since = repl.last_sequence();
        info!(since = ?since, ?mode, "Starting change tracker");
        let tracker = ChangeTracker::new(
            repl.remote().clone(),
            tracker_opts,
            repl.settings(),
            since,
            client,
        )?;
        if let Some(previous) = self.replace_tracker(Some(Arc::clone(&tracker))) {
            previous.stop();
        }
        tracker.start()
    }
}

impl ReplicationRole for Puller {
    fn begin_replicating<'a>(&'a self, repl: &'a Arc<Replication>) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move { self.start_change_tracker(repl) })
    }

    fn process_inbox<'a>(&'a self, repl: &'a Arc<Replication>, inbox: Vec<PendingRevision>) -> BoxFuture<'a, ()> {
        Box::pin(pull_revisions(repl, inbox))
    }

    fn stop(&self) {
        if let Some(tracker) = self.replace_tracker(None) {
            tracker.stop();
        }
    }

    fn retry<'a>(&'a self, repl: &'a Arc<Replication>) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.stop();
            self.start_change_tracker(repl)
        })
    }
}

/// Receives the tracker's callbacks on behalf of a replication.
struct PullerClient {
    repl: Weak<Replication>,
    continuous: bool,
    /// Keeps a one-shot replication active until the feed ends.
    task: Mutex<Option<AsyncTask>>,
}

impl ChangeTrackerClient for PullerClient {
    fn changes_received(&self, changes: Vec<RemoteChange>) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            let Some(repl) = self.repl.upgrade() else { return };
            if !repl.is_running() {
                return;
            }
            let db = match repl.database() {
                Ok(db) => db,
                Err(_) => return,
            };

            let mut revs: BTreeMap<String, Vec<String>> = BTreeMap::new();
            for change in &changes {
                revs.entry(change.doc_id.clone())
                    .or_default()
                    .extend(change.rev_ids.iter().cloned());
            }
            let missing = match db.revs_diff(&revs).await {
                Ok(missing) => missing,
                Err(e) => {
                    repl.set_error(e);
                    return;
                }
            };

            let mut listed = 0u64;
            let mut present = 0u64;
            for change in &changes {
                let doc_missing = missing.get(&change.doc_id);
                for rev_id in &change.rev_ids {
                    listed += 1;
                    if doc_missing.is_some_and(|m| m.contains(rev_id)) {
                        repl.queue_revision(&change.doc_id, rev_id, change.deleted, &change.sequence);
                    } else {
                        repl.skip_sequence(&change.sequence);
                        present += 1;
                    }
                }
            }
            debug!(listed, present, "Checked incoming revisions");
            if self.continuous {
                repl.add_to_total(listed);
            }
            repl.add_to_completed(present);
            repl.advance_checkpoint();
        })
    }

    fn caught_up(&self) {
        if let Some(repl) = self.repl.upgrade() {
            debug!(session = %repl.session_id(), "Caught up with remote changes");
            repl.flush_inbox();
        }
    }

    fn finished(&self) {
        debug!("Change feed finished");
    }

    fn stopped(&self, error: Option<CoreError>) {
        if let Some(repl) = self.repl.upgrade() {
            if let Some(e) = error {
                repl.set_error(e);
            }
            repl.flush_inbox();
        }
        self.task.lock().unwrap_or_else(PoisonError::into_inner).take();
    }

    fn add_total_docs(&self, delta: usize) {
        if let Some(repl) = self.repl.upgrade() {
            repl.add_to_total(delta as u64);
        }
    }
}

async fn pull_revisions(repl: &Arc<Replication>, inbox: Vec<PendingRevision>) {
    let db = match repl.database() {
        Ok(db) => db,
        Err(_) => return,
    };
    let source = repl.remote().url().to_string();
    let concurrency = repl.settings().max_concurrent_requests.max(1);

    let fetches = futures::stream::iter(inbox)
        .map(|revision| {
            let db = Arc::clone(&db);
            let source = source.as_str();
            async move {
                let result = pull_one(repl, &db, &revision, source).await;
                (revision, result)
            }
        })
        .buffer_unordered(concurrency)
        .collect::<Vec<_>>();

    let results = tokio::select! {
        _ = repl.stopped_signal() => return,
        results = fetches => results,
    };

    let mut pulled = 0;
    for (revision, result) in results {
        match result {
            Ok(()) => {
                pulled += 1;
                repl.revision_done(&revision);
            }
            Err(e) => {
                warn!(doc_id = %revision.doc_id, rev_id = %revision.rev_id, error = %e, "Failed to pull revision");
                repl.revision_failed(&revision);
                if !e.is_not_found() {
                    repl.set_error(e);
                }
            }
        }
    }
    metrics::record_revisions_transferred("pull", pulled);
}

/// Fetch one revision with its history and insert it locally.
async fn pull_one(
    repl: &Replication,
    db: &Database,
    revision: &PendingRevision,
    source: &str,
) -> Result<()> {
    let mut url = repl.remote().document_url(&revision.doc_id)?;
    url.query_pairs_mut()
        .append_pair("rev", &revision.rev_id)
        .append_pair("revs", "true")
        .append_pair("attachments", "true");
    let Value::Object(mut properties) = repl.remote().send_json(Method::GET, url, None).await? else {
        return Err(CoreError::malformed(format!("{} is not a JSON object", revision.doc_id)));
    };

    let history = properties
        .remove("_revisions")
        .as_ref()
        .and_then(parse_revisions_object)
        .unwrap_or_else(|| vec![revision.rev_id.clone()]);

    let properties = match &repl.options().property_transformer {
        Some(transform) => match transform(properties) {
            Some(transformed) => transformed,
            None => {
                debug!(doc_id = %revision.doc_id, "Transformer dropped revision");
                return Ok(());
            }
        },
        None => properties,
    };

    db.force_insert(properties, &history, Some(source)).await?;
    Ok(())
}
