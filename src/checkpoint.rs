//! Replication checkpoints: identity and debounced persistence.
//!
//! # Checkpoint Identity
//!
//! A replication's checkpoint is keyed by the SHA-1 hex of a canonical JSON
//! description of what it replicates:
//!
//! ```json
//! {"continuous":false,"docids":["a","b"],"filter":"app/by_type",
//!  "filterParams":{"k":"v"},"localUUID":"…","push":true,
//!  "remoteURL":"http://host/db","remote_db_uuid":null}
//! ```
//!
//! Keys are sorted at every level and doc IDs are sorted, so two
//! replications configured the same way share a checkpoint regardless of
//! the order their collections were built in.
//!
//! # Debounced Saves
//!
//! Progress is reported after every batch, far more often than it is worth
//! writing. [`CheckpointSaver::set_last_sequence`] records the value and
//! (re)schedules one save after the debounce window; a newer value cancels
//! the scheduled save and takes its place. [`CheckpointSaver::save_now`]
//! flushes synchronously on stop and close.

use crate::error::Result;
use crate::metrics;
use futures::future::BoxFuture;
use serde_json::{Map, Value};
use sha1::{Digest, Sha1};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Everything that distinguishes one replication's progress from another's.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CheckpointSpec {
    pub local_uuid: String,
    pub remote_url: String,
    pub push: bool,
    pub continuous: bool,
    pub remote_db_uuid: Option<String>,
    pub filter: Option<String>,
    pub filter_params: Option<BTreeMap<String, Value>>,
    pub doc_ids: Option<Vec<String>>,
}

impl CheckpointSpec {
    /// Canonical JSON form that gets hashed.
    pub fn canonical_json(&self) -> String {
        // Collected from a BTreeMap so the keys are inserted sorted, whether
        // or not serde_json preserves insertion order.
        let mut spec: BTreeMap<&str, Value> = BTreeMap::new();
        spec.insert("localUUID", Value::String(self.local_uuid.clone()));
        spec.insert("remoteURL", Value::String(self.remote_url.clone()));
        spec.insert("push", Value::Bool(self.push));
        spec.insert("continuous", Value::Bool(self.continuous));
        spec.insert(
            "remote_db_uuid",
            self.remote_db_uuid.clone().map(Value::String).unwrap_or(Value::Null),
        );
        if let Some(filter) = &self.filter {
            spec.insert("filter", Value::String(filter.clone()));
        }
        if let Some(params) = &self.filter_params {
            let params: Map<String, Value> = params
                .iter()
                .map(|(k, v)| (k.clone(), canonicalize(v)))
                .collect();
            spec.insert("filterParams", Value::Object(params));
        }
        if let Some(doc_ids) = &self.doc_ids {
            let mut sorted = doc_ids.clone();
            sorted.sort();
            spec.insert(
                "docids",
                Value::Array(sorted.into_iter().map(Value::String).collect()),
            );
        }
        let spec: Map<String, Value> = spec.into_iter().map(|(k, v)| (k.to_string(), v)).collect();
        Value::Object(spec).to_string()
    }

    /// The `_local/` document ID for this replication.
    pub fn checkpoint_doc_id(&self) -> String {
        hex::encode(Sha1::digest(self.canonical_json().as_bytes()))
    }
}

/// Rebuild nested objects so their keys come out sorted.
fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), canonicalize(v)))
                .collect::<BTreeMap<_, _>>()
                .into_iter()
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

/// Where checkpoint values end up.
pub trait CheckpointSink: Send + Sync {
    fn save_checkpoint<'a>(&'a self, checkpoint_id: &'a str, last_sequence: &'a str) -> BoxFuture<'a, Result<()>>;
}

impl CheckpointSink for crate::Database {
    fn save_checkpoint<'a>(&'a self, checkpoint_id: &'a str, last_sequence: &'a str) -> BoxFuture<'a, Result<()>> {
        Box::pin(self.set_last_sequence_with_checkpoint_id(checkpoint_id, last_sequence))
    }
}

struct SaverState {
    latest: Option<String>,
    saved: Option<String>,
    scheduled: Option<JoinHandle<()>>,
}

struct SaverInner {
    checkpoint_id: String,
    debounce: Duration,
    sink: Weak<dyn CheckpointSink>,
    state: Mutex<SaverState>,
    /// Orders saves so a stale value never lands after a newer one.
    write: tokio::sync::Mutex<()>,
}

impl SaverInner {
    fn lock(&self) -> MutexGuard<'_, SaverState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn save_latest(&self) -> Result<()> {
        let _write = self.write.lock().await;
        let value = {
            let state = self.lock();
            match &state.latest {
                Some(latest) if state.saved.as_ref() != Some(latest) => latest.clone(),
                _ => return Ok(()),
            }
        };
        let Some(sink) = self.sink.upgrade() else {
            warn!(checkpoint_id = %self.checkpoint_id, "Checkpoint target gone, dropping save");
            return Ok(());
        };
        let result = sink.save_checkpoint(&self.checkpoint_id, &value).await;
        metrics::record_checkpoint_save(result.is_ok());
        match &result {
            Ok(()) => {
                debug!(checkpoint_id = %self.checkpoint_id, last_sequence = %value, "Checkpoint saved");
                self.lock().saved = Some(value);
            }
            Err(e) => warn!(checkpoint_id = %self.checkpoint_id, error = %e, "Checkpoint save failed"),
        }
        result
    }
}

/// Debounced writer of one replication's last sequence.
#[derive(Clone)]
pub struct CheckpointSaver {
    inner: Arc<SaverInner>,
}

impl CheckpointSaver {
    /// `initial` is the value already persisted (so it is not written again).
    pub fn new(
        checkpoint_id: impl Into<String>,
        sink: Weak<dyn CheckpointSink>,
        debounce: Duration,
        initial: Option<String>,
    ) -> Self {
        Self {
            inner: Arc::new(SaverInner {
                checkpoint_id: checkpoint_id.into(),
                debounce,
                sink,
                state: Mutex::new(SaverState {
                    latest: initial.clone(),
                    saved: initial,
                    scheduled: None,
                }),
                write: tokio::sync::Mutex::new(()),
            }),
        }
    }

    pub fn checkpoint_id(&self) -> &str {
        &self.inner.checkpoint_id
    }

    /// Most recent value passed to [`set_last_sequence`](Self::set_last_sequence).
    pub fn last_sequence(&self) -> Option<String> {
        self.inner.lock().latest.clone()
    }

    /// Record progress; the write happens once the debounce window passes
    /// without a newer value.
    pub fn set_last_sequence(&self, last_sequence: impl Into<String>) {
        let last_sequence = last_sequence.into();
        let mut state = self.inner.lock();
        if state.latest.as_ref() == Some(&last_sequence) {
            return;
        }
        state.latest = Some(last_sequence);
        if let Some(previous) = state.scheduled.take() {
            previous.abort();
        }
        let inner = Arc::clone(&self.inner);
        state.scheduled = Some(tokio::spawn(async move {
            tokio::time::sleep(inner.debounce).await;
            // Detach the write so a later abort cannot interrupt it.
            tokio::spawn(async move {
                let _ = inner.save_latest().await;
            });
        }));
    }

    /// Cancel any scheduled save and write the latest value now.
    pub async fn save_now(&self) -> Result<()> {
        if let Some(scheduled) = self.inner.lock().scheduled.take() {
            scheduled.abort();
        }
        self.inner.save_latest().await
    }

    /// Cancel any scheduled save without writing.
    pub fn cancel(&self) {
        if let Some(scheduled) = self.inner.lock().scheduled.take() {
            scheduled.abort();
        }
    }
}
