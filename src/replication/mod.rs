// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Replication sessions between a local [`Database`] and a remote one.
//!
//! A [`Replication`] owns the parts both directions share: session bring-up,
//! the revision batcher, activity accounting, checkpointing and retry. What
//! differs between pulling and pushing lives behind a role:
//!
//! - `Puller`: follows the remote `_changes` feed, fetches the revisions the
//!   local database lacks and inserts them with their history.
//! - `Pusher`: scans local changes, asks the remote which revisions it lacks
//!   (`_revs_diff`) and uploads them (`_bulk_docs`, `new_edits=false`).
//!
//! # Bring-up
//!
//! ```text
//! start() ──▶ [cookie auth] GET _session ──▶ login? ──▶ checkpoint lookup
//!                                                          │
//!                                        role.begin_replicating()
//! ```
//!
//! # Activity
//!
//! A replication is *active* while the batcher holds revisions or any
//! tracked async task is outstanding, and *idle* otherwise. Going idle
//! stops a one-shot replication; a continuous one that hit an error
//! schedules a retry after `retry_delay_sec`.
//!
//! Progress reaches observers through [`Replication::subscribe`] as
//! [`ReplicationChange`] snapshots. Checkpoints only advance over
//! contiguously completed sequences and are saved with a debounce.

mod puller;
mod pusher;
mod remote_checkpoint;
mod sequence_map;
mod types;

pub use types::{
    Direction, PropertyTransformer, PushFilter, ReplicationChange, ReplicationOptions,
    ReplicationStatus, BY_CHANNEL_FILTER,
};
pub(crate) use types::PendingRevision;

use crate::auth::{session_user, Authenticator};
use crate::batch::{BatchHandler, Batcher};
use crate::checkpoint::{CheckpointSaver, CheckpointSink, CheckpointSpec};
use crate::config::ReplicationSettings;
use crate::database::{ActiveReplication, Database};
use crate::error::{CoreError, Result};
use crate::metrics;
use crate::remote::{DefaultClientFactory, RemoteDb};
use futures::future::BoxFuture;
use puller::Puller;
use pusher::Pusher;
use remote_checkpoint::ReplicationCheckpoint;
use reqwest::Method;
use sequence_map::SequenceMap;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, info_span, warn, Instrument};

/// Direction-specific replication steps.
trait ReplicationRole: Send + Sync {
    /// Start moving revisions once the checkpoint is known.
    fn begin_replicating<'a>(&'a self, repl: &'a Arc<Replication>) -> BoxFuture<'a, Result<()>>;

    /// Handle one batch from the batcher.
    fn process_inbox<'a>(&'a self, repl: &'a Arc<Replication>, inbox: Vec<PendingRevision>) -> BoxFuture<'a, ()>;

    /// Stop feeds and listeners. Must not block.
    fn stop(&self);

    /// Pick up where the last checkpoint left off.
    fn retry<'a>(&'a self, repl: &'a Arc<Replication>) -> BoxFuture<'a, Result<()>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    NotStarted,
    Running,
    Stopping,
    Stopped,
}

struct RunState {
    phase: Phase,
    active: bool,
    offline: bool,
    last_error: Option<Arc<CoreError>>,
}

/// Counts as one outstanding async task until dropped.
pub(crate) struct AsyncTask {
    repl: Weak<Replication>,
}

impl Drop for AsyncTask {
    fn drop(&mut self) {
        if let Some(repl) = self.repl.upgrade() {
            repl.async_task_finished();
        }
    }
}

/// One replication session.
pub struct Replication {
    session_id: String,
    direction: Direction,
    options: ReplicationOptions,
    settings: ReplicationSettings,
    /// Dropped when the database closes.
    db: Mutex<Option<Arc<Database>>>,
    remote: RemoteDb,
    role: Box<dyn ReplicationRole>,
    batcher: Batcher<PendingRevision>,
    sequences: Mutex<SequenceMap>,
    async_tasks: AtomicUsize,
    state: Mutex<RunState>,
    completed: AtomicU64,
    total: AtomicU64,
    revisions_failed: AtomicUsize,
    checkpoint_sink: Arc<ReplicationCheckpoint>,
    checkpoint: Mutex<Option<CheckpointSaver>>,
    shutdown_tx: watch::Sender<bool>,
    status_tx: watch::Sender<ReplicationChange>,
    bring_up_task: Mutex<Option<JoinHandle<()>>>,
    retry_task: Mutex<Option<JoinHandle<()>>>,
    batcher_watch: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for Replication {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Replication")
            .field("session_id", &self.session_id)
            .field("direction", &self.direction)
            .field("remote", &self.remote.masked_url())
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Replication {
    /// Build a replication between `db` and the database at `remote_url`.
    ///
    /// Credentials embedded in the URL are used for Basic auth unless
    /// `options.authenticator` is set. Nothing happens until
    /// [`start`](Self::start).
    pub fn new(
        db: &Arc<Database>,
        direction: Direction,
        remote_url: &str,
        options: ReplicationOptions,
    ) -> Result<Arc<Self>> {
        db.ensure_open()?;
        let settings = db.config().replication.clone();
        let factory = options
            .client_factory
            .clone()
            .unwrap_or_else(|| Arc::new(DefaultClientFactory));
        let remote = RemoteDb::new(
            remote_url,
            &settings,
            factory.as_ref(),
            options.authenticator.clone(),
            &options.headers,
        )?;
        if direction == Direction::Pull && options.create_target {
            debug!("create_target has no effect on a pull");
        }

        let session_id = db.next_session_id();
        let role: Box<dyn ReplicationRole> = match direction {
            Direction::Pull => Box::new(Puller::new()),
            Direction::Push => Box::new(Pusher::new()),
        };
        let checkpoint_sink = Arc::new(ReplicationCheckpoint::new(Arc::downgrade(db), remote.clone()));
        let (shutdown_tx, _) = watch::channel(false);
        let (status_tx, _) = watch::channel(ReplicationChange::default());

        Ok(Arc::new_cyclic(|weak: &Weak<Self>| {
            let inbox_owner = weak.clone();
            let handler: BatchHandler<PendingRevision> = Arc::new(move |inbox| {
                let owner = inbox_owner.clone();
                Box::pin(async move {
                    if let Some(repl) = owner.upgrade() {
                        repl.process_inbox(inbox).await;
                    }
                })
            });
            let batcher = Batcher::new(
                session_id.clone(),
                settings.batch_size,
                settings.batch_delay(),
                handler,
            );
            Self {
                session_id,
                direction,
                options,
                settings,
                db: Mutex::new(Some(Arc::clone(db))),
                remote,
                role,
                batcher,
                sequences: Mutex::new(SequenceMap::new()),
                async_tasks: AtomicUsize::new(0),
                state: Mutex::new(RunState {
                    phase: Phase::NotStarted,
                    active: false,
                    offline: false,
                    last_error: None,
                }),
                completed: AtomicU64::new(0),
                total: AtomicU64::new(0),
                revisions_failed: AtomicUsize::new(0),
                checkpoint_sink,
                checkpoint: Mutex::new(None),
                shutdown_tx,
                status_tx,
                bring_up_task: Mutex::new(None),
                retry_task: Mutex::new(None),
                batcher_watch: Mutex::new(None),
            }
        }))
    }

    /// Pull from `remote_url` into `db`.
    pub fn pull(db: &Arc<Database>, remote_url: &str, options: ReplicationOptions) -> Result<Arc<Self>> {
        Self::new(db, Direction::Pull, remote_url, options)
    }

    /// Push from `db` to `remote_url`.
    pub fn push(db: &Arc<Database>, remote_url: &str, options: ReplicationOptions) -> Result<Arc<Self>> {
        Self::new(db, Direction::Push, remote_url, options)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Accessors
    // ═══════════════════════════════════════════════════════════════════════

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn is_pull(&self) -> bool {
        self.direction == Direction::Pull
    }

    pub fn is_continuous(&self) -> bool {
        self.options.continuous
    }

    pub fn options(&self) -> &ReplicationOptions {
        &self.options
    }

    pub fn settings(&self) -> &ReplicationSettings {
        &self.settings
    }

    pub fn remote(&self) -> &RemoteDb {
        &self.remote
    }

    /// Channels subscribed through the channel filter.
    pub fn channels(&self) -> Vec<String> {
        self.options.channels()
    }

    pub fn is_running(&self) -> bool {
        lock(&self.state).phase == Phase::Running
    }

    pub fn status(&self) -> ReplicationStatus {
        Self::status_of(&lock(&self.state))
    }

    fn status_of(state: &RunState) -> ReplicationStatus {
        match state.phase {
            Phase::NotStarted | Phase::Stopped => ReplicationStatus::Stopped,
            // Still saving the checkpoint.
            Phase::Stopping => ReplicationStatus::Active,
            Phase::Running if state.offline => ReplicationStatus::Offline,
            Phase::Running if state.active => ReplicationStatus::Active,
            Phase::Running => ReplicationStatus::Idle,
        }
    }

    pub fn last_error(&self) -> Option<Arc<CoreError>> {
        lock(&self.state).last_error.clone()
    }

    pub fn completed_changes_count(&self) -> u64 {
        self.completed.load(Ordering::SeqCst)
    }

    pub fn changes_count(&self) -> u64 {
        self.total.load(Ordering::SeqCst)
    }

    /// Revisions that failed to transfer since the last retry.
    pub fn revisions_failed(&self) -> usize {
        self.revisions_failed.load(Ordering::SeqCst)
    }

    /// Observe status and progress.
    pub fn subscribe(&self) -> watch::Receiver<ReplicationChange> {
        self.status_tx.subscribe()
    }

    /// Last sequence handed to the checkpoint (saved or pending save).
    pub fn last_sequence(&self) -> Option<String> {
        lock(&self.checkpoint).as_ref().and_then(CheckpointSaver::last_sequence)
    }

    /// What identifies this replication's checkpoint.
    pub fn checkpoint_spec(&self) -> Result<CheckpointSpec> {
        let db = self.database()?;
        Ok(CheckpointSpec {
            local_uuid: db.private_uuid().to_string(),
            remote_url: self.remote.url().to_string(),
            push: self.direction.is_push(),
            continuous: self.options.continuous,
            remote_db_uuid: None,
            filter: self.options.filter.clone(),
            filter_params: self.options.filter_params.clone(),
            doc_ids: self.options.doc_ids.clone(),
        })
    }

    /// SHA-1 hex ID of this replication's checkpoint document.
    pub fn remote_checkpoint_doc_id(&self) -> Result<String> {
        Ok(self.checkpoint_spec()?.checkpoint_doc_id())
    }

    pub(crate) fn database(&self) -> Result<Arc<Database>> {
        lock(&self.db).clone().ok_or(CoreError::Shutdown)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Lifecycle
    // ═══════════════════════════════════════════════════════════════════════

    /// Start replicating in the background. A no-op if already running.
    ///
    /// Fails if the database has been closed.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        let db = self.database()?;
        if !db.is_open() {
            warn!(session = %self.session_id, "Not starting replication: database is closed");
            return Err(CoreError::InvalidState {
                expected: "open database".into(),
                actual: "closed".into(),
            });
        }
        {
            let mut state = lock(&self.state);
            if state.phase == Phase::Running {
                return Ok(());
            }
            state.phase = Phase::Running;
            state.active = false;
            state.offline = false;
            state.last_error = None;
        }
        self.shutdown_tx.send_replace(false);
        self.completed.store(0, Ordering::SeqCst);
        self.total.store(0, Ordering::SeqCst);
        self.revisions_failed.store(0, Ordering::SeqCst);
        *lock(&self.sequences) = SequenceMap::new();

        let registered: Arc<dyn ActiveReplication> = Arc::clone(self) as Arc<dyn ActiveReplication>;
        db.add_active_replication(Arc::downgrade(&registered));
        self.watch_batcher();

        info!(
            session = %self.session_id,
            direction = %self.direction,
            remote = %self.remote.masked_url(),
            continuous = self.options.continuous,
            "Starting replication"
        );
        self.notify_change();

        let task = self.track_task();
        let repl = Arc::clone(self);
        let span = info_span!(
            "replication",
            session = %self.session_id,
            direction = %self.direction,
            remote = %self.remote.masked_url()
        );
        let handle = tokio::spawn(
            async move {
                let _task = task;
                if let Err(e) = repl.bring_up().await {
                    if repl.is_running() {
                        warn!(error = %e, "Replication could not start");
                        repl.set_error(e);
                    }
                }
            }
            .instrument(span),
        );
        if let Some(previous) = lock(&self.bring_up_task).replace(handle) {
            previous.abort();
        }
        Ok(())
    }

    /// Stop replicating. Idempotent; the checkpoint is saved in the background.
    pub fn stop(self: &Arc<Self>) {
        if self.begin_stop() {
            let repl = Arc::clone(self);
            tokio::spawn(async move { repl.finish_stop().await });
        }
    }

    /// Stop, wait for the checkpoint to be saved, then start again.
    pub async fn restart(self: &Arc<Self>) -> Result<()> {
        if self.begin_stop() {
            self.finish_stop().await;
        }
        self.start()
    }

    /// Disconnect without stopping. Status reads `Offline` until
    /// [`go_online`](Self::go_online).
    pub fn go_offline(self: &Arc<Self>) {
        {
            let mut state = lock(&self.state);
            if state.phase != Phase::Running || state.offline {
                return;
            }
            state.offline = true;
        }
        info!(session = %self.session_id, "Going offline");
        self.cancel_retry();
        self.role.stop();
        self.batcher.clear();
        lock(&self.sequences).clear();
        self.notify_change();
    }

    /// Reconnect and resume from the last checkpoint.
    pub fn go_online(self: &Arc<Self>) {
        {
            let mut state = lock(&self.state);
            if state.phase != Phase::Running || !state.offline {
                return;
            }
            state.offline = false;
        }
        info!(session = %self.session_id, "Going online");
        self.notify_change();
        let repl = Arc::clone(self);
        tokio::spawn(async move { repl.retry_if_ready().await });
    }

    /// Synchronous half of stopping. Returns false if not running.
    fn begin_stop(&self) -> bool {
        {
            let mut state = lock(&self.state);
            if state.phase != Phase::Running {
                return false;
            }
            state.phase = Phase::Stopping;
        }
        info!(session = %self.session_id, "Stopping replication");
        self.shutdown_tx.send_replace(true);
        self.batcher.clear();
        self.cancel_retry();
        if let Some(task) = lock(&self.bring_up_task).take() {
            task.abort();
        }
        self.role.stop();
        lock(&self.sequences).clear();
        if let Ok(db) = self.database() {
            db.forget_replication(&self.session_id);
        }
        true
    }

    /// Save the checkpoint and publish `Stopped`.
    async fn finish_stop(&self) {
        let saver = lock(&self.checkpoint).clone();
        if let Some(saver) = saver {
            if let Err(e) = saver.save_now().await {
                warn!(session = %self.session_id, error = %e, "Could not save checkpoint on stop");
            }
        }
        {
            let mut state = lock(&self.state);
            if state.phase != Phase::Stopping {
                return;
            }
            state.phase = Phase::Stopped;
            state.active = false;
        }
        info!(
            session = %self.session_id,
            completed = self.completed_changes_count(),
            total = self.changes_count(),
            failed = self.revisions_failed(),
            "Replication stopped"
        );
        self.notify_change();
    }

    async fn bring_up(self: &Arc<Self>) -> Result<()> {
        if let Some(auth) = self
            .remote
            .authenticator()
            .filter(|a| a.uses_cookie_based_login())
            .cloned()
        {
            self.check_session(auth.as_ref()).await?;
        }
        self.fetch_remote_checkpoint_doc().await?;
        if !self.is_running() {
            return Ok(());
        }
        self.role.begin_replicating(self).await
    }

    /// `GET _session` on the database, falling back to the server root.
    async fn check_session(&self, auth: &dyn Authenticator) -> Result<()> {
        let session = match self.remote.get_json("_session").await {
            Ok(session) => session,
            Err(CoreError::RemoteProtocol { status: Some(404), .. }) => {
                debug!("No _session under the database, trying the server root");
                let url = self.remote.server_url_for("/_session")?;
                self.remote.send_json(Method::GET, url, None).await?
            }
            Err(e) => return Err(e),
        };
        match session_user(&session) {
            Some(user) => {
                info!(user, "Already logged in");
                Ok(())
            }
            None => self.login(auth).await,
        }
    }

    async fn login(&self, auth: &dyn Authenticator) -> Result<()> {
        let Some(parameters) = auth.login_parameters() else {
            debug!(?auth, "No login parameters, skipping login");
            return Ok(());
        };
        let path = auth.login_path().unwrap_or_else(|| "/_session".to_string());
        debug!(path = %path, "Logging in");
        self.remote.post_json(&path, &Value::Object(parameters)).await?;
        info!("Logged in");
        Ok(())
    }

    /// Look up the local checkpoint and seed the saver with it.
    async fn fetch_remote_checkpoint_doc(&self) -> Result<()> {
        let db = self.database()?;
        let checkpoint_id = self.remote_checkpoint_doc_id()?;
        let last_sequence = db.last_sequence_with_checkpoint_id(&checkpoint_id).await;
        if let Err(e) = self.checkpoint_sink.fetch_remote(&checkpoint_id).await {
            debug!(error = %e, "Remote checkpoint unavailable");
        }

        let sink: Arc<dyn CheckpointSink> = Arc::clone(&self.checkpoint_sink) as Arc<dyn CheckpointSink>;
        let saver = CheckpointSaver::new(
            checkpoint_id.clone(),
            Arc::downgrade(&sink),
            self.settings.checkpoint_debounce(),
            last_sequence.clone(),
        );
        if let Some(previous) = lock(&self.checkpoint).replace(saver) {
            previous.cancel();
        }
        info!(checkpoint_id = %checkpoint_id, last_sequence = ?last_sequence, "Replicating from checkpoint");
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Activity accounting
    // ═══════════════════════════════════════════════════════════════════════

    /// Count an outstanding task until the returned guard drops.
    pub(crate) fn track_task(self: &Arc<Self>) -> AsyncTask {
        if self.async_tasks.fetch_add(1, Ordering::SeqCst) == 0 {
            self.update_active();
        }
        AsyncTask {
            repl: Arc::downgrade(self),
        }
    }

    fn async_task_finished(self: &Arc<Self>) {
        if self.async_tasks.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.update_active();
        }
    }

    fn watch_batcher(self: &Arc<Self>) {
        let mut slot = lock(&self.batcher_watch);
        if slot.is_some() {
            return;
        }
        let mut counts = self.batcher.subscribe();
        let weak = Arc::downgrade(self);
        *slot = Some(tokio::spawn(async move {
            while counts.changed().await.is_ok() {
                match weak.upgrade() {
                    Some(repl) => repl.update_active(),
                    None => break,
                }
            }
        }));
    }

    /// Recompute active/idle and act on the transition.
    fn update_active(self: &Arc<Self>) {
        let went_idle = {
            let mut state = lock(&self.state);
            if state.phase != Phase::Running {
                return;
            }
            let new_active = self.batcher.count() > 0 || self.async_tasks.load(Ordering::SeqCst) > 0;
            if state.active == new_active {
                return;
            }
            state.active = new_active;
            debug!(
                session = %self.session_id,
                active = new_active,
                batcher = self.batcher.count(),
                tasks = self.async_tasks.load(Ordering::SeqCst),
                "Activity changed"
            );
            !new_active && !state.offline
        };
        self.notify_change();

        if went_idle {
            if !self.options.continuous {
                debug!(session = %self.session_id, "One-shot replication caught up");
                self.stop();
            } else if self.last_error().is_some() {
                info!(
                    session = %self.session_id,
                    failed = self.revisions_failed(),
                    retry_in_sec = self.settings.retry_delay().as_secs(),
                    "Replication idle with errors, scheduling retry"
                );
                self.schedule_retry();
            }
        }
    }

    fn schedule_retry(self: &Arc<Self>) {
        let delay = self.settings.retry_delay();
        let weak = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(repl) = weak.upgrade() {
                repl.retry_if_ready().await;
            }
        });
        if let Some(previous) = lock(&self.retry_task).replace(handle) {
            previous.abort();
        }
    }

    fn cancel_retry(&self) {
        if let Some(task) = lock(&self.retry_task).take() {
            task.abort();
        }
    }

    async fn retry_if_ready(self: &Arc<Self>) {
        {
            let mut state = lock(&self.state);
            if state.phase != Phase::Running || state.offline {
                return;
            }
            state.last_error = None;
        }
        info!(session = %self.session_id, "Retrying replication");
        metrics::record_replication_retry(&self.session_id);
        self.revisions_failed.store(0, Ordering::SeqCst);
        self.notify_change();

        let _task = self.track_task();
        // Failed entries would pin the checkpoint forever. The role re-scans
        // from the saved checkpoint, which queues them again.
        self.batcher.clear();
        lock(&self.sequences).clear();
        let needs_bring_up = lock(&self.checkpoint).is_none();
        let result = if needs_bring_up {
            self.bring_up().await
        } else {
            self.role.retry(self).await
        };
        if let Err(e) = result {
            self.set_error(e);
        }
    }

    /// Resolves once the replication stops.
    pub(crate) async fn stopped_signal(&self) {
        let mut rx = self.shutdown_tx.subscribe();
        let _ = rx.wait_for(|stopped| *stopped).await;
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Progress (used by the roles)
    // ═══════════════════════════════════════════════════════════════════════

    pub(crate) fn set_error(self: &Arc<Self>, error: CoreError) {
        let schedule = {
            let mut state = lock(&self.state);
            if state.phase != Phase::Running {
                return;
            }
            warn!(session = %self.session_id, error = %error, "Replication error");
            state.last_error = Some(Arc::new(error));
            // Already idle: no transition will come along to trigger the retry.
            self.options.continuous && !state.active && !state.offline
        };
        self.notify_change();
        if schedule {
            self.schedule_retry();
        }
    }

    /// Put a revision in the batcher, tracking `sequence` for checkpoints.
    pub(crate) fn queue_revision(&self, doc_id: &str, rev_id: &str, deleted: bool, sequence: &str) {
        let sequence_id = lock(&self.sequences).add(sequence);
        self.batcher.queue(PendingRevision {
            doc_id: doc_id.to_string(),
            rev_id: rev_id.to_string(),
            deleted,
            sequence_id,
        });
    }

    /// Record a sequence that needs no transfer.
    pub(crate) fn skip_sequence(&self, sequence: &str) {
        let mut sequences = lock(&self.sequences);
        let id = sequences.add(sequence);
        sequences.remove(id);
    }

    pub(crate) fn revision_done(&self, revision: &PendingRevision) {
        lock(&self.sequences).remove(revision.sequence_id);
        self.add_to_completed(1);
    }

    /// A revision that should be retried later. Its sequence stays pending
    /// so the checkpoint cannot pass it until the next retry re-scans.
    pub(crate) fn revision_failed(&self, revision: &PendingRevision) {
        debug!(doc_id = %revision.doc_id, rev_id = %revision.rev_id, "Revision failed");
        self.revisions_failed.fetch_add(1, Ordering::SeqCst);
        metrics::record_revisions_failed(self.direction.as_str(), 1);
        self.add_to_completed(1);
    }

    pub(crate) fn add_to_total(&self, delta: u64) {
        if delta > 0 {
            self.total.fetch_add(delta, Ordering::SeqCst);
            self.notify_change();
        }
    }

    pub(crate) fn add_to_completed(&self, delta: u64) {
        if delta > 0 {
            self.completed.fetch_add(delta, Ordering::SeqCst);
            self.notify_change();
        }
    }

    /// Move the checkpoint up to the last contiguously completed sequence.
    pub(crate) fn advance_checkpoint(&self) {
        let value = lock(&self.sequences).checkpointed_value().map(str::to_string);
        if let Some(value) = value {
            self.set_last_sequence(value);
        }
    }

    pub(crate) fn set_last_sequence(&self, last_sequence: String) {
        if let Some(saver) = lock(&self.checkpoint).as_ref() {
            saver.set_last_sequence(last_sequence);
        }
    }

    /// Process queued revisions now instead of after the batch delay.
    pub(crate) fn flush_inbox(&self) {
        let batcher = self.batcher.clone();
        tokio::spawn(async move { batcher.flush_all().await });
    }

    async fn process_inbox(self: &Arc<Self>, inbox: Vec<PendingRevision>) {
        if !self.is_running() {
            return;
        }
        debug!(session = %self.session_id, revisions = inbox.len(), "Processing inbox");
        self.role.process_inbox(self, inbox).await;
        self.advance_checkpoint();
    }

    fn notify_change(&self) {
        let change = {
            let state = lock(&self.state);
            if state.phase == Phase::Stopping {
                return;
            }
            ReplicationChange {
                status: Self::status_of(&state),
                completed_changes: self.completed.load(Ordering::SeqCst),
                total_changes: self.total.load(Ordering::SeqCst),
                last_error: state.last_error.clone(),
            }
        };
        metrics::set_replication_status(&self.session_id, &change.status.to_string());
        self.status_tx.send_replace(change);
    }
}

impl ActiveReplication for Replication {
    fn session_id(&self) -> &str {
        &self.session_id
    }

    fn database_closing(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            let saver = lock(&self.checkpoint).clone();
            if let Some(saver) = saver {
                if let Err(e) = saver.save_now().await {
                    warn!(session = %self.session_id, error = %e, "Could not save checkpoint before close");
                }
            }
            if self.begin_stop() {
                self.finish_stop().await;
            }
            lock(&self.db).take();
        })
    }
}

impl Drop for Replication {
    fn drop(&mut self) {
        self.role.stop();
        for slot in [&self.bring_up_task, &self.retry_task, &self.batcher_watch] {
            if let Some(task) = lock(slot).take() {
                task.abort();
            }
        }
        if let Some(saver) = lock(&self.checkpoint).take() {
            saver.cancel();
        }
    }
}
