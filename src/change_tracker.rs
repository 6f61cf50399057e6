//! Client for a remote database's `_changes` feed.
//!
//! A [`ChangeTracker`] runs in its own task and feeds parsed change rows to
//! a [`ChangeTrackerClient`] (the puller). It keeps its own `since` cursor
//! and is the only writer of it.
//!
//! # State Machine
//!
//! ```text
//! ┌──────┐ start ┌─────────┐ first short batch ┌──────────┐
//! │ Idle │──────▶│ Polling │──────────────────▶│ CaughtUp │
//! └──────┘       └─────────┘                   └──────────┘
//!                     │ stop / fatal status /       │
//!                     │ one-shot done               │
//!                     ▼                             │
//!                ┌──────────┐                       │
//!                │ Stopping │◀──────────────────────┘
//!                └──────────┘
//!                     │ client.stopped()
//!                     ▼
//!                ┌─────────┐
//!                │ Stopped │
//!                └─────────┘
//! ```
//!
//! # Feed Modes
//!
//! - **One-shot** (`feed=normal`): one request, every pending change, then
//!   caught-up, finished and stop.
//! - **Long-poll** (`feed=longpoll`): re-issue the request with the new
//!   cursor after every response until stopped.
//! - **Continuous** is rejected at construction.
//!
//! Transport failures and transient statuses back off exponentially and
//! retry the same request. Any other error status stops the tracker and is
//! handed to the client through [`ChangeTrackerClient::stopped`].

use crate::config::ReplicationSettings;
use crate::error::{CoreError, Result};
use crate::metrics;
use crate::remote::{check_status, read_json, RemoteDb};
use crate::resilience::Backoff;
use futures::future::BoxFuture;
use reqwest::{Method, RequestBuilder};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, info, info_span, warn, Instrument};
use url::form_urlencoded;

/// Emit a `seq` row at most this often on filtered feeds.
const SEQ_INTERVAL: u32 = 5000;

/// Feed flavour requested from the remote.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeTrackerMode {
    OneShot,
    LongPoll,
    Continuous,
}

impl ChangeTrackerMode {
    fn feed(self) -> &'static str {
        match self {
            Self::OneShot => "normal",
            Self::LongPoll => "longpoll",
            Self::Continuous => "continuous",
        }
    }
}

/// Tracker lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackerState {
    Idle,
    Polling,
    CaughtUp,
    Stopping,
    Stopped,
}

impl fmt::Display for TrackerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Polling => write!(f, "polling"),
            Self::CaughtUp => write!(f, "caught_up"),
            Self::Stopping => write!(f, "stopping"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

/// One row of a `_changes` response.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteChange {
    /// The row's `seq`, stringified. Opaque to everything but the remote.
    pub sequence: String,
    pub doc_id: String,
    /// Leaf revisions listed under `changes`.
    pub rev_ids: Vec<String>,
    pub deleted: bool,
}

impl RemoteChange {
    /// Parse a change row. Rows without an ID or revisions yield `None`.
    pub fn from_json(row: &Value) -> Option<Self> {
        let doc_id = row.get("id")?.as_str()?.to_string();
        let rev_ids: Vec<String> = row
            .get("changes")?
            .as_array()?
            .iter()
            .filter_map(|c| c.get("rev").and_then(Value::as_str).map(str::to_string))
            .collect();
        if rev_ids.is_empty() {
            return None;
        }
        Some(Self {
            sequence: sequence_string(row.get("seq").unwrap_or(&Value::Null)),
            doc_id,
            rev_ids,
            deleted: row.get("deleted").and_then(Value::as_bool).unwrap_or(false),
        })
    }
}

/// A sequence value as the string stored in checkpoints.
pub fn sequence_string(seq: &Value) -> String {
    match seq {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Receives what the tracker reads.
///
/// The tracker drops its reference to the client once `stopped` has been
/// delivered, so no callback arrives after it.
pub trait ChangeTrackerClient: Send + Sync {
    /// A batch of parsed rows, in feed order. The tracker waits for the
    /// returned future before polling again.
    fn changes_received(&self, changes: Vec<RemoteChange>) -> BoxFuture<'_, ()>;

    /// Fired once per run, the first time a response leaves nothing pending.
    fn caught_up(&self) {}

    /// The feed ended normally (one-shot done, or a long-poll body with no
    /// `results`).
    fn finished(&self) {}

    /// Last callback. `error` is set when the tracker gave up on a fatal error.
    fn stopped(&self, error: Option<CoreError>);

    /// One-shot feeds report how many revisions they found.
    fn add_total_docs(&self, _delta: usize) {}
}

/// What to ask the remote for.
#[derive(Debug, Clone)]
pub struct ChangeTrackerOptions {
    pub mode: ChangeTrackerMode,
    /// Request every leaf (`style=all_docs`), not just winners.
    pub include_conflicts: bool,
    pub filter_name: Option<String>,
    pub filter_params: Option<BTreeMap<String, Value>>,
    /// Restrict the feed to these documents. Sent as a POST body.
    pub doc_ids: Option<Vec<String>>,
    pub heartbeat: Duration,
    /// Rows per long-poll response. Zero leaves it to the server.
    pub limit: usize,
}

impl ChangeTrackerOptions {
    pub fn new(mode: ChangeTrackerMode, settings: &ReplicationSettings) -> Self {
        Self {
            mode,
            include_conflicts: false,
            filter_name: None,
            filter_params: None,
            doc_ids: None,
            heartbeat: settings.heartbeat(),
            limit: settings.changes_limit,
        }
    }

    fn uses_post(&self) -> bool {
        self.doc_ids.as_ref().is_some_and(|ids| !ids.is_empty())
    }
}

enum PollFailure {
    /// A long-poll outlived its timeout with nothing to report.
    Quiet,
    Failed(CoreError),
}

/// Follows a remote `_changes` feed.
pub struct ChangeTracker {
    remote: RemoteDb,
    options: ChangeTrackerOptions,
    request_timeout: Duration,
    backoff_config: crate::resilience::RetryConfig,
    since: Mutex<Option<String>>,
    client: Mutex<Option<Arc<dyn ChangeTrackerClient>>>,
    running: AtomicBool,
    started: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
    state_tx: watch::Sender<TrackerState>,
    last_error: Mutex<Option<String>>,
}

impl fmt::Debug for ChangeTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChangeTracker")
            .field("remote", &self.remote.masked_url())
            .field("mode", &self.options.mode)
            .field("state", &*self.state_tx.borrow())
            .finish_non_exhaustive()
    }
}

impl ChangeTracker {
    /// Build a tracker starting after `since` (`None` reads from the beginning).
    pub fn new(
        remote: RemoteDb,
        options: ChangeTrackerOptions,
        settings: &ReplicationSettings,
        since: Option<String>,
        client: Arc<dyn ChangeTrackerClient>,
    ) -> Result<Arc<Self>> {
        if options.mode == ChangeTrackerMode::Continuous {
            return Err(CoreError::Config(
                "continuous change feeds are not supported; use long-poll".into(),
            ));
        }
        let (shutdown_tx, _) = watch::channel(false);
        let (state_tx, _) = watch::channel(TrackerState::Idle);
        Ok(Arc::new(Self {
            remote,
            options,
            request_timeout: settings.request_timeout(),
            backoff_config: settings.backoff_config(),
            since: Mutex::new(since.filter(|s| !s.is_empty())),
            client: Mutex::new(Some(client)),
            running: AtomicBool::new(false),
            started: AtomicBool::new(false),
            shutdown_tx,
            state_tx,
            last_error: Mutex::new(None),
        }))
    }

    pub fn mode(&self) -> ChangeTrackerMode {
        self.options.mode
    }

    pub fn state(&self) -> TrackerState {
        *self.state_tx.borrow()
    }

    /// Observe state transitions.
    pub fn subscribe_state(&self) -> watch::Receiver<TrackerState> {
        self.state_tx.subscribe()
    }

    /// Cursor of the last row received.
    pub fn last_sequence(&self) -> Option<String> {
        self.since.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Message of the error that stopped the tracker, if any.
    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Spawn the polling task. A tracker runs at most once.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(CoreError::InvalidState {
                expected: TrackerState::Idle.to_string(),
                actual: self.state().to_string(),
            });
        }
        self.running.store(true, Ordering::SeqCst);
        self.state_tx.send_replace(TrackerState::Polling);

        let span = info_span!("change_tracker", remote = %self.remote.masked_url(), mode = ?self.options.mode);
        let tracker = Arc::clone(self);
        tokio::spawn(async move { tracker.run().await }.instrument(span));
        Ok(())
    }

    /// Stop polling, abort the in-flight request and notify the client.
    ///
    /// Idempotent; only the first call reaches the client.
    pub fn stop(&self) {
        self.stop_with(None);
    }

    fn stop_with(&self, error: Option<CoreError>) {
        let was_running = self.running.swap(false, Ordering::SeqCst);
        if !was_running && self.state() == TrackerState::Stopped {
            return;
        }
        self.state_tx.send_replace(TrackerState::Stopping);
        self.shutdown_tx.send_replace(true);
        self.stopped(error);
    }

    fn stopped(&self, error: Option<CoreError>) {
        if let Some(err) = &error {
            *self.last_error.lock().unwrap_or_else(PoisonError::into_inner) = Some(err.to_string());
        }
        let client = self.client.lock().unwrap_or_else(PoisonError::into_inner).take();
        self.state_tx.send_replace(TrackerState::Stopped);
        if let Some(client) = client {
            debug!(remote = %self.remote.masked_url(), "Change tracker stopped");
            client.stopped(error);
        }
    }

    fn client(&self) -> Option<Arc<dyn ChangeTrackerClient>> {
        self.client.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    // =========================================================================
    // Request construction
    // =========================================================================

    /// Path and query of the next request, relative to the database URL.
    pub fn changes_feed_path(&self) -> String {
        let opts = &self.options;
        let mut path = format!(
            "_changes?feed={}&heartbeat={}",
            opts.mode.feed(),
            opts.heartbeat.as_millis()
        );
        if opts.include_conflicts {
            path.push_str("&style=all_docs");
        }
        if let Some(since) = self.last_sequence() {
            path.push_str("&since=");
            path.push_str(&encode(&since));
        }
        path.push_str(&format!("&seq_interval={SEQ_INTERVAL}"));
        if opts.mode == ChangeTrackerMode::LongPoll && opts.limit > 0 {
            path.push_str(&format!("&limit={}", opts.limit));
        }

        if opts.uses_post() {
            path.push_str("&filter=_doc_ids");
        } else if let Some(filter) = &opts.filter_name {
            path.push_str("&filter=");
            path.push_str(&encode(filter));
            for (key, value) in opts.filter_params.iter().flatten() {
                let value = match value {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                path.push('&');
                path.push_str(&encode(key));
                path.push('=');
                path.push_str(&encode(&value));
            }
        }
        path
    }

    /// Body for doc-ID filtered feeds; `None` means the feed is a GET.
    pub fn changes_feed_post_body(&self) -> Option<Value> {
        let opts = &self.options;
        let doc_ids = opts.doc_ids.as_ref().filter(|ids| !ids.is_empty())?;

        let mut body = Map::new();
        body.insert("feed".into(), Value::from(opts.mode.feed()));
        body.insert("heartbeat".into(), Value::from(opts.heartbeat.as_millis() as u64));
        body.insert(
            "style".into(),
            if opts.include_conflicts {
                Value::from("all_docs")
            } else {
                Value::Null
            },
        );
        if let Some(since) = self.last_sequence() {
            let since = match since.parse::<i64>() {
                Ok(n) => Value::from(n),
                Err(_) => Value::from(since),
            };
            body.insert("since".into(), since);
        }
        body.insert("filter".into(), Value::from("_doc_ids"));
        body.insert("doc_ids".into(), Value::from(doc_ids.clone()));
        Some(Value::Object(body))
    }

    fn build_request(&self) -> Result<RequestBuilder> {
        let url = self.remote.url_for(&self.changes_feed_path())?;
        let request = match self.changes_feed_post_body() {
            Some(body) => self.remote.request(Method::POST, url).json(&body),
            None => self.remote.request(Method::GET, url),
        };
        let timeout = match self.options.mode {
            // The server holds a long-poll open until something changes.
            ChangeTrackerMode::LongPoll => self.options.heartbeat + self.request_timeout,
            _ => self.request_timeout,
        };
        Ok(request.timeout(timeout))
    }

    // =========================================================================
    // Polling loop
    // =========================================================================

    async fn poll_once(&self) -> std::result::Result<Value, PollFailure> {
        let request = self.build_request().map_err(PollFailure::Failed)?;
        let response = match request.send().await {
            Ok(response) => response,
            Err(e) if e.is_timeout() && self.options.mode == ChangeTrackerMode::LongPoll => {
                return Err(PollFailure::Quiet);
            }
            Err(e) => return Err(PollFailure::Failed(CoreError::network("changes feed", e))),
        };
        let response = check_status(response).await.map_err(PollFailure::Failed)?;
        read_json(response).await.map_err(PollFailure::Failed)
    }

    async fn run(self: Arc<Self>) {
        info!("Starting change tracker");
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut backoff = Backoff::new(self.backoff_config.clone());
        let mut caught_up = false;
        let remote = self.remote.masked_url().to_string();

        while self.is_running() {
            let started = Instant::now();
            let outcome = tokio::select! {
                _ = shutdown_rx.wait_for(|stop| *stop) => break,
                outcome = self.poll_once() => outcome,
            };

            let body = match outcome {
                Ok(body) => body,
                Err(PollFailure::Quiet) => {
                    debug!("Long-poll timed out with no changes");
                    backoff.reset();
                    // Nothing arrived, so nothing is pending.
                    if !caught_up {
                        caught_up = true;
                        self.state_tx.send_replace(TrackerState::CaughtUp);
                        if let Some(client) = self.client() {
                            client.caught_up();
                        }
                    }
                    continue;
                }
                Err(PollFailure::Failed(e)) => {
                    if !self.is_running() {
                        // Aborted by stop(); not a failure.
                        break;
                    }
                    if e.is_retryable() {
                        let delay = backoff.next_delay();
                        metrics::record_changes_error(&remote, "transient");
                        warn!(error = %e, failures = backoff.failures(), delay_ms = delay.as_millis() as u64,
                            "Change feed request failed, backing off");
                        tokio::select! {
                            _ = shutdown_rx.wait_for(|stop| *stop) => break,
                            _ = tokio::time::sleep(delay) => {}
                        }
                        continue;
                    }
                    metrics::record_changes_error(&remote, "fatal");
                    warn!(error = %e, "Change feed failed");
                    self.stop_with(Some(e));
                    break;
                }
            };

            let Some(results) = body.get("results").and_then(Value::as_array) else {
                if self.options.mode == ChangeTrackerMode::OneShot {
                    metrics::record_changes_error(&remote, "malformed");
                    self.stop_with(Some(CoreError::malformed("changes response has no results")));
                } else {
                    debug!("Long-poll response without results, finishing");
                    if let Some(client) = self.client() {
                        client.finished();
                    }
                    self.stop();
                }
                break;
            };

            let changes: Vec<RemoteChange> = results.iter().filter_map(RemoteChange::from_json).collect();
            metrics::record_changes_poll(&remote, changes.len(), started.elapsed());
            debug!(rows = results.len(), changes = changes.len(), "Received changes");

            if let Some(last) = changes.last() {
                self.set_since(&last.sequence);
            } else if let Some(last_seq) = body.get("last_seq").filter(|v| !v.is_null()) {
                self.set_since(&sequence_string(last_seq));
            }

            let Some(client) = self.client() else { break };
            if self.options.mode == ChangeTrackerMode::OneShot {
                let revisions: usize = changes.iter().map(|c| c.rev_ids.len()).sum();
                client.add_total_docs(revisions);
            }
            if !changes.is_empty() {
                client.changes_received(changes).await;
            }
            backoff.reset();

            let drained = self.options.mode == ChangeTrackerMode::OneShot
                || self.options.limit == 0
                || results.len() < self.options.limit;
            if drained && !caught_up {
                caught_up = true;
                self.state_tx.send_replace(TrackerState::CaughtUp);
                client.caught_up();
            }

            if self.options.mode == ChangeTrackerMode::OneShot {
                client.finished();
                self.stop();
                break;
            }
        }
        info!("Change tracker exiting");
    }

    fn set_since(&self, sequence: &str) {
        if sequence.is_empty() {
            return;
        }
        *self.since.lock().unwrap_or_else(PoisonError::into_inner) = Some(sequence.to_string());
    }
}

fn encode(value: &str) -> String {
    form_urlencoded::byte_serialize(value.as_bytes()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::DefaultClientFactory;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct CountingClient {
        stopped: AtomicUsize,
        caught_up: AtomicUsize,
    }

    impl ChangeTrackerClient for CountingClient {
        fn changes_received(&self, _changes: Vec<RemoteChange>) -> BoxFuture<'_, ()> {
            Box::pin(async {})
        }

        fn caught_up(&self) {
            self.caught_up.fetch_add(1, Ordering::SeqCst);
        }

        fn stopped(&self, _error: Option<CoreError>) {
            self.stopped.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn remote() -> RemoteDb {
        RemoteDb::new(
            "http://localhost:5984/db",
            &ReplicationSettings::testing(),
            &DefaultClientFactory,
            None,
            &BTreeMap::new(),
        )
        .unwrap()
    }

    fn tracker(options: ChangeTrackerOptions, since: Option<&str>) -> Arc<ChangeTracker> {
        ChangeTracker::new(
            remote(),
            options,
            &ReplicationSettings::testing(),
            since.map(str::to_string),
            Arc::new(CountingClient::default()),
        )
        .unwrap()
    }

    fn options(mode: ChangeTrackerMode) -> ChangeTrackerOptions {
        let mut opts = ChangeTrackerOptions::new(mode, &ReplicationSettings::testing());
        opts.heartbeat = Duration::from_secs(300);
        opts.limit = 50;
        opts
    }

    #[test]
    fn test_one_shot_path() {
        let t = tracker(options(ChangeTrackerMode::OneShot), None);
        assert_eq!(
            t.changes_feed_path(),
            "_changes?feed=normal&heartbeat=300000&seq_interval=5000"
        );
        assert!(t.changes_feed_post_body().is_none());
    }

    #[test]
    fn test_long_poll_path_with_since_and_conflicts() {
        let mut opts = options(ChangeTrackerMode::LongPoll);
        opts.include_conflicts = true;
        let t = tracker(opts, Some("12-g1A[x]"));
        assert_eq!(
            t.changes_feed_path(),
            "_changes?feed=longpoll&heartbeat=300000&style=all_docs&since=12-g1A%5Bx%5D&seq_interval=5000&limit=50"
        );
    }

    #[test]
    fn test_filter_params_json_encoded() {
        let mut opts = options(ChangeTrackerMode::OneShot);
        opts.filter_name = Some("app/by_type".into());
        let mut params = BTreeMap::new();
        params.insert("type".to_string(), json!("note"));
        params.insert("max".to_string(), json!(5));
        opts.filter_params = Some(params);
        let t = tracker(opts, None);
        assert_eq!(
            t.changes_feed_path(),
            "_changes?feed=normal&heartbeat=300000&seq_interval=5000&filter=app%2Fby_type&max=5&type=note"
        );
    }

    #[test]
    fn test_doc_ids_use_post() {
        let mut opts = options(ChangeTrackerMode::OneShot);
        opts.doc_ids = Some(vec!["a".into(), "b".into()]);
        opts.filter_name = Some("ignored".into());
        let t = tracker(opts, Some("7"));
        assert!(t.changes_feed_path().ends_with("&seq_interval=5000&filter=_doc_ids"));
        assert_eq!(
            t.changes_feed_post_body().unwrap(),
            json!({
                "feed": "normal",
                "heartbeat": 300000,
                "style": null,
                "since": 7,
                "filter": "_doc_ids",
                "doc_ids": ["a", "b"],
            })
        );
    }

    #[test]
    fn test_post_body_keeps_opaque_since() {
        let mut opts = options(ChangeTrackerMode::LongPoll);
        opts.doc_ids = Some(vec!["a".into()]);
        opts.include_conflicts = true;
        let t = tracker(opts, Some("3-abc"));
        let body = t.changes_feed_post_body().unwrap();
        assert_eq!(body["since"], "3-abc");
        assert_eq!(body["style"], "all_docs");
    }

    #[test]
    fn test_continuous_rejected() {
        let err = ChangeTracker::new(
            remote(),
            options(ChangeTrackerMode::Continuous),
            &ReplicationSettings::testing(),
            None,
            Arc::new(CountingClient::default()),
        )
        .unwrap_err();
        assert!(matches!(err, CoreError::Config(_)));
    }

    #[test]
    fn test_parse_change_rows() {
        let change = RemoteChange::from_json(&json!({
            "seq": 4, "id": "doc", "deleted": true,
            "changes": [{"rev": "2-a"}, {"rev": "2-b"}]
        }))
        .unwrap();
        assert_eq!(change.sequence, "4");
        assert_eq!(change.rev_ids, vec!["2-a", "2-b"]);
        assert!(change.deleted);

        let opaque = RemoteChange::from_json(&json!({"seq": "9-xyz", "id": "d", "changes": [{"rev": "1-a"}]})).unwrap();
        assert_eq!(opaque.sequence, "9-xyz");
        assert!(!opaque.deleted);

        assert!(RemoteChange::from_json(&json!({"seq": 1, "changes": [{"rev": "1-a"}]})).is_none());
        assert!(RemoteChange::from_json(&json!({"seq": 1, "id": "d", "changes": []})).is_none());
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let client = Arc::new(CountingClient::default());
        let t = ChangeTracker::new(
            remote(),
            options(ChangeTrackerMode::OneShot),
            &ReplicationSettings::testing(),
            None,
            client.clone(),
        )
        .unwrap();
        t.stop();
        t.stop();
        assert_eq!(client.stopped.load(Ordering::SeqCst), 1);
        assert_eq!(t.state(), TrackerState::Stopped);
        assert!(!t.is_running());
    }

    #[tokio::test]
    async fn test_quiet_long_poll_reports_caught_up() {
        // Accepts connections and never answers, so every long-poll times out.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });

        let settings = ReplicationSettings {
            request_timeout_ms: 50,
            ..ReplicationSettings::testing()
        };
        let remote = RemoteDb::new(
            &format!("http://{addr}/db"),
            &settings,
            &DefaultClientFactory,
            None,
            &BTreeMap::new(),
        )
        .unwrap();
        let mut opts = ChangeTrackerOptions::new(ChangeTrackerMode::LongPoll, &settings);
        opts.heartbeat = Duration::from_millis(50);
        let client = Arc::new(CountingClient::default());
        let t = ChangeTracker::new(remote, opts, &settings, None, client.clone()).unwrap();
        t.start().unwrap();

        let mut state = t.subscribe_state();
        let reached = tokio::time::timeout(
            Duration::from_secs(5),
            state.wait_for(|s| *s == TrackerState::CaughtUp),
        )
        .await
        .is_ok_and(|r| r.is_ok());
        assert!(reached, "quiet long-poll never reported caught up");
        // Later quiet polls do not fire it again.
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(client.caught_up.load(Ordering::SeqCst), 1);
        assert!(t.is_running());

        t.stop();
        server.abort();
    }

    #[tokio::test]
    async fn test_start_twice_rejected() {
        let t = tracker(options(ChangeTrackerMode::LongPoll), None);
        t.start().unwrap();
        assert!(matches!(t.start(), Err(CoreError::InvalidState { .. })));
        t.stop();
        assert_eq!(t.state(), TrackerState::Stopped);
    }
}
