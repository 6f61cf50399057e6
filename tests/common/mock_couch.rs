//! In-process mock of a CouchDB-protocol remote.
//!
//! Serves one database over HTTP on an ephemeral port and records how often
//! each endpoint was hit. Supports the endpoints replication uses:
//! `_changes` (normal and longpoll, GET and POST), document GET with
//! `revs=true`, `_revs_diff`, `_bulk_docs`, `_local` checkpoints,
//! `_session` (database and server root) and database PUT.
//!
//! Failure injection:
//! - `fail_next_changes(n)`: the next `n` `_changes` requests get a 503.
//! - `forbid_doc(id)`: `_bulk_docs` rejects that document with `forbidden`.
//! - `fail_next_bulk_docs(n)`: the next `n` `_bulk_docs` requests get a 503.
//! - `conflict_doc(id, n)`: the next `n` `_bulk_docs` items for that
//!   document come back as `conflict`.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use couchlite::revision::{parse_revisions_object, revisions_object};
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

/// One stored revision.
#[derive(Debug, Clone)]
struct StoredRev {
    rev: String,
    deleted: bool,
    body: Map<String, Value>,
    /// Newest first, starting with `rev`.
    history: Vec<String>,
}

#[derive(Debug, Clone)]
struct ChangeRow {
    seq: u64,
    id: String,
    rev: String,
    deleted: bool,
}

/// Request counters, one per endpoint.
#[derive(Default)]
pub struct Counters {
    pub changes: AtomicUsize,
    pub changes_post: AtomicUsize,
    pub doc_gets: AtomicUsize,
    pub revs_diff: AtomicUsize,
    pub bulk_docs: AtomicUsize,
    pub local_gets: AtomicUsize,
    pub local_puts: AtomicUsize,
    pub session_gets: AtomicUsize,
    pub logins: AtomicUsize,
    pub db_puts: AtomicUsize,
}

impl Counters {
    pub fn get(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }
}

#[derive(Default)]
struct MockState {
    /// Every revision of every document, in arrival order.
    docs: Mutex<BTreeMap<String, Vec<StoredRev>>>,
    /// Latest change per document, ordered by `seq`.
    changes: Mutex<Vec<ChangeRow>>,
    next_seq: AtomicUsize,
    local: Mutex<HashMap<String, Value>>,
    db_exists: AtomicBool,
    logged_in: AtomicBool,
    forbidden: Mutex<HashSet<String>>,
    fail_changes: AtomicUsize,
    fail_bulk_docs: AtomicUsize,
    conflicts: Mutex<HashMap<String, usize>>,
    new_change: Notify,
    counters: Counters,
}

impl MockState {
    fn store(&self, id: &str, stored: StoredRev) {
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst) as u64 + 1;
        let row = ChangeRow {
            seq,
            id: id.to_string(),
            rev: stored.rev.clone(),
            deleted: stored.deleted,
        };
        self.docs
            .lock()
            .unwrap()
            .entry(id.to_string())
            .or_default()
            .push(stored);
        let mut changes = self.changes.lock().unwrap();
        changes.retain(|c| c.id != id);
        changes.push(row);
        drop(changes);
        self.new_change.notify_waiters();
    }

    fn knows(&self, id: &str, rev: &str) -> bool {
        self.docs
            .lock()
            .unwrap()
            .get(id)
            .is_some_and(|revs| revs.iter().any(|r| r.history.iter().any(|h| h == rev)))
    }

    fn last_seq(&self) -> u64 {
        self.next_seq.load(Ordering::SeqCst) as u64
    }

    fn rows_since(&self, since: u64, doc_ids: Option<&[String]>) -> Vec<ChangeRow> {
        self.changes
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.seq > since)
            .filter(|c| doc_ids.map_or(true, |ids| ids.contains(&c.id)))
            .cloned()
            .collect()
    }
}

/// A running mock remote. The server stops when this is dropped.
pub struct MockCouch {
    state: Arc<MockState>,
    base: String,
    server: JoinHandle<()>,
}

impl Drop for MockCouch {
    fn drop(&mut self) {
        self.server.abort();
    }
}

impl MockCouch {
    /// Start a server whose database `db` already exists.
    pub async fn start() -> Self {
        let state = Arc::new(MockState::default());
        state.db_exists.store(true, Ordering::SeqCst);

        let app = Router::new()
            .route("/_session", get(server_session))
            .route("/{db}", axum::routing::put(create_db))
            .route("/{db}/_changes", get(changes_get).post(changes_post))
            .route("/{db}/_revs_diff", post(revs_diff))
            .route("/{db}/_bulk_docs", post(bulk_docs))
            .route("/{db}/_session", get(db_session).post(login))
            .route("/{db}/_local/{id}", get(local_get).put(local_put))
            .route("/{db}/{doc}", get(doc_get))
            .with_state(Arc::clone(&state));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        Self {
            state,
            base: format!("http://{addr}"),
            server,
        }
    }

    /// URL of the served database.
    pub fn url(&self) -> String {
        format!("{}/db", self.base)
    }

    pub fn counters(&self) -> &Counters {
        &self.state.counters
    }

    pub fn set_db_exists(&self, exists: bool) {
        self.state.db_exists.store(exists, Ordering::SeqCst);
    }

    pub fn is_logged_in(&self) -> bool {
        self.state.logged_in.load(Ordering::SeqCst)
    }

    pub fn fail_next_changes(&self, n: usize) {
        self.state.fail_changes.store(n, Ordering::SeqCst);
    }

    pub fn fail_next_bulk_docs(&self, n: usize) {
        self.state.fail_bulk_docs.store(n, Ordering::SeqCst);
    }

    pub fn conflict_doc(&self, id: &str, n: usize) {
        self.state.conflicts.lock().unwrap().insert(id.to_string(), n);
    }

    pub fn forbid_doc(&self, id: &str) {
        self.state.forbidden.lock().unwrap().insert(id.to_string());
    }

    /// Add a revision of `id`. Its parent is the document's latest revision.
    pub fn add_doc(&self, id: &str, rev: &str, body: Value) {
        let mut history = vec![rev.to_string()];
        if let Some(latest) = self.state.docs.lock().unwrap().get(id).and_then(|r| r.last()) {
            history.extend(latest.history.iter().cloned());
        }
        let Value::Object(body) = body else {
            panic!("document body must be an object");
        };
        self.state.store(
            id,
            StoredRev {
                rev: rev.to_string(),
                deleted: false,
                body,
                history,
            },
        );
    }

    /// Latest revision ID stored for `id`.
    pub fn latest_rev(&self, id: &str) -> Option<String> {
        self.state
            .docs
            .lock()
            .unwrap()
            .get(id)
            .and_then(|r| r.last())
            .map(|r| r.rev.clone())
    }

    /// Body of the latest revision of `id`.
    pub fn doc(&self, id: &str) -> Option<Map<String, Value>> {
        self.state
            .docs
            .lock()
            .unwrap()
            .get(id)
            .and_then(|r| r.last())
            .map(|r| r.body.clone())
    }

    pub fn doc_count(&self) -> usize {
        self.state.docs.lock().unwrap().len()
    }

    pub fn local_doc(&self, id: &str) -> Option<Value> {
        self.state.local.lock().unwrap().get(id).cloned()
    }

    pub fn last_seq(&self) -> u64 {
        self.state.last_seq()
    }
}

fn error(status: StatusCode, error: &str, reason: &str) -> Response {
    (status, Json(json!({ "error": error, "reason": reason }))).into_response()
}

async fn create_db(State(s): State<Arc<MockState>>, Path(_db): Path<String>) -> Response {
    s.counters.db_puts.fetch_add(1, Ordering::SeqCst);
    if s.db_exists.swap(true, Ordering::SeqCst) {
        return error(StatusCode::PRECONDITION_FAILED, "file_exists", "The database could not be created");
    }
    (StatusCode::CREATED, Json(json!({ "ok": true }))).into_response()
}

fn session_body(s: &MockState) -> Json<Value> {
    let name = if s.logged_in.load(Ordering::SeqCst) {
        json!("tester")
    } else {
        Value::Null
    };
    Json(json!({ "ok": true, "userCtx": { "name": name, "roles": [] } }))
}

async fn server_session(State(s): State<Arc<MockState>>) -> Json<Value> {
    s.counters.session_gets.fetch_add(1, Ordering::SeqCst);
    session_body(&s)
}

async fn db_session(State(s): State<Arc<MockState>>, Path(_db): Path<String>) -> Json<Value> {
    s.counters.session_gets.fetch_add(1, Ordering::SeqCst);
    session_body(&s)
}

async fn login(
    State(s): State<Arc<MockState>>,
    Path(_db): Path<String>,
    Json(body): Json<Value>,
) -> Response {
    s.counters.logins.fetch_add(1, Ordering::SeqCst);
    if body.get("name").and_then(Value::as_str) == Some("tester") && body.get("password").is_some() {
        s.logged_in.store(true, Ordering::SeqCst);
        (
            [("set-cookie", "AuthSession=abc123; Path=/; HttpOnly")],
            Json(json!({ "ok": true, "name": "tester" })),
        )
            .into_response()
    } else {
        error(StatusCode::UNAUTHORIZED, "unauthorized", "Name or password is incorrect.")
    }
}

struct FeedRequest {
    feed: String,
    since: u64,
    limit: Option<usize>,
    doc_ids: Option<Vec<String>>,
}

async fn changes_get(
    State(s): State<Arc<MockState>>,
    Path(_db): Path<String>,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    let request = FeedRequest {
        feed: query.get("feed").cloned().unwrap_or_else(|| "normal".into()),
        since: query.get("since").and_then(|s| s.parse().ok()).unwrap_or(0),
        limit: query.get("limit").and_then(|l| l.parse().ok()),
        doc_ids: None,
    };
    changes_response(&s, request).await
}

async fn changes_post(
    State(s): State<Arc<MockState>>,
    Path(_db): Path<String>,
    Json(body): Json<Value>,
) -> Response {
    s.counters.changes_post.fetch_add(1, Ordering::SeqCst);
    let since = match body.get("since") {
        Some(Value::Number(n)) => n.as_u64().unwrap_or(0),
        Some(Value::String(s)) => s.parse().unwrap_or(0),
        _ => 0,
    };
    let request = FeedRequest {
        feed: body.get("feed").and_then(Value::as_str).unwrap_or("normal").to_string(),
        since,
        limit: None,
        doc_ids: body.get("doc_ids").and_then(Value::as_array).map(|ids| {
            ids.iter().filter_map(Value::as_str).map(str::to_string).collect()
        }),
    };
    changes_response(&s, request).await
}

async fn changes_response(s: &MockState, request: FeedRequest) -> Response {
    s.counters.changes.fetch_add(1, Ordering::SeqCst);
    let pending_failures = s.fail_changes.load(Ordering::SeqCst);
    if pending_failures > 0 {
        s.fail_changes.store(pending_failures - 1, Ordering::SeqCst);
        return error(StatusCode::SERVICE_UNAVAILABLE, "unavailable", "injected failure");
    }

    let doc_ids = request.doc_ids.as_deref();
    let mut rows = s.rows_since(request.since, doc_ids);
    if rows.is_empty() && request.feed == "longpoll" {
        let notified = s.new_change.notified();
        rows = s.rows_since(request.since, doc_ids);
        if rows.is_empty() {
            let _ = tokio::time::timeout(Duration::from_millis(500), notified).await;
            rows = s.rows_since(request.since, doc_ids);
        }
    }
    let truncated = request.limit.is_some_and(|limit| rows.len() > limit);
    if let Some(limit) = request.limit {
        rows.truncate(limit);
    }
    let last_seq = match rows.last() {
        Some(row) if truncated => row.seq,
        _ => s.last_seq().max(request.since),
    };
    let results: Vec<Value> = rows
        .iter()
        .map(|row| {
            let mut item = json!({
                "seq": row.seq,
                "id": row.id,
                "changes": [{ "rev": row.rev }],
            });
            if row.deleted {
                item["deleted"] = Value::Bool(true);
            }
            item
        })
        .collect();
    Json(json!({ "results": results, "last_seq": last_seq })).into_response()
}

async fn doc_get(
    State(s): State<Arc<MockState>>,
    Path((_db, doc)): Path<(String, String)>,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    s.counters.doc_gets.fetch_add(1, Ordering::SeqCst);
    let docs = s.docs.lock().unwrap();
    let Some(revs) = docs.get(&doc) else {
        return error(StatusCode::NOT_FOUND, "not_found", "missing");
    };
    let stored = match query.get("rev") {
        Some(rev) => revs.iter().find(|r| &r.rev == rev),
        None => revs.last(),
    };
    let Some(stored) = stored else {
        return error(StatusCode::NOT_FOUND, "not_found", "missing");
    };
    let mut body = stored.body.clone();
    body.insert("_id".into(), Value::String(doc.clone()));
    body.insert("_rev".into(), Value::String(stored.rev.clone()));
    if stored.deleted {
        body.insert("_deleted".into(), Value::Bool(true));
    }
    if query.get("revs").map(String::as_str) == Some("true") {
        body.insert("_revisions".into(), revisions_object(&stored.history));
    }
    Json(Value::Object(body)).into_response()
}

async fn revs_diff(
    State(s): State<Arc<MockState>>,
    Path(_db): Path<String>,
    Json(body): Json<Map<String, Value>>,
) -> Json<Value> {
    s.counters.revs_diff.fetch_add(1, Ordering::SeqCst);
    let mut response = Map::new();
    for (id, revs) in body {
        let missing: Vec<Value> = revs
            .as_array()
            .into_iter()
            .flatten()
            .filter_map(Value::as_str)
            .filter(|rev| !s.knows(&id, rev))
            .map(|rev| Value::String(rev.to_string()))
            .collect();
        if !missing.is_empty() {
            response.insert(id, json!({ "missing": missing }));
        }
    }
    Json(Value::Object(response))
}

async fn bulk_docs(
    State(s): State<Arc<MockState>>,
    Path(_db): Path<String>,
    Json(body): Json<Value>,
) -> Response {
    s.counters.bulk_docs.fetch_add(1, Ordering::SeqCst);
    let pending_failures = s.fail_bulk_docs.load(Ordering::SeqCst);
    if pending_failures > 0 {
        s.fail_bulk_docs.store(pending_failures - 1, Ordering::SeqCst);
        return error(StatusCode::SERVICE_UNAVAILABLE, "unavailable", "injected failure");
    }
    let docs = body.get("docs").and_then(Value::as_array).cloned().unwrap_or_default();
    let mut items = Vec::new();
    for doc in docs {
        let Value::Object(mut doc) = doc else { continue };
        let id = doc.get("_id").and_then(Value::as_str).unwrap_or_default().to_string();
        let rev = doc.get("_rev").and_then(Value::as_str).unwrap_or_default().to_string();
        if s.forbidden.lock().unwrap().contains(&id) {
            items.push(json!({ "id": id, "error": "forbidden", "reason": "not allowed" }));
            continue;
        }
        if take_conflict(&s, &id) {
            items.push(json!({ "id": id, "rev": rev, "error": "conflict", "reason": "injected" }));
            continue;
        }
        let history = doc
            .remove("_revisions")
            .as_ref()
            .and_then(parse_revisions_object)
            .unwrap_or_else(|| vec![rev.clone()]);
        let deleted = doc.get("_deleted").and_then(Value::as_bool).unwrap_or(false);
        for key in ["_id", "_rev", "_deleted"] {
            doc.remove(key);
        }
        s.store(
            &id,
            StoredRev {
                rev: rev.clone(),
                deleted,
                body: doc,
                history,
            },
        );
        items.push(json!({ "id": id, "rev": rev }));
    }
    Json(Value::Array(items)).into_response()
}

fn take_conflict(s: &MockState, id: &str) -> bool {
    let mut conflicts = s.conflicts.lock().unwrap();
    match conflicts.get_mut(id) {
        Some(remaining) if *remaining > 0 => {
            *remaining -= 1;
            true
        }
        _ => false,
    }
}

async fn local_get(
    State(s): State<Arc<MockState>>,
    Path((_db, id)): Path<(String, String)>,
) -> Response {
    s.counters.local_gets.fetch_add(1, Ordering::SeqCst);
    match s.local.lock().unwrap().get(&id) {
        Some(doc) => Json(doc.clone()).into_response(),
        None => error(StatusCode::NOT_FOUND, "not_found", "missing"),
    }
}

async fn local_put(
    State(s): State<Arc<MockState>>,
    Path((_db, id)): Path<(String, String)>,
    Json(mut body): Json<Value>,
) -> Response {
    s.counters.local_puts.fetch_add(1, Ordering::SeqCst);
    let mut local = s.local.lock().unwrap();
    let current_rev = local.get(&id).and_then(|d| d.get("_rev")).cloned();
    if body.get("_rev") != current_rev.as_ref() {
        return error(StatusCode::CONFLICT, "conflict", "Document update conflict.");
    }
    let counter = current_rev
        .as_ref()
        .and_then(Value::as_str)
        .and_then(|r| r.strip_prefix("0-"))
        .and_then(|n| n.parse::<u64>().ok())
        .unwrap_or(0);
    let rev = format!("0-{}", counter + 1);
    body["_id"] = Value::String(format!("_local/{id}"));
    body["_rev"] = Value::String(rev.clone());
    local.insert(id.clone(), body);
    (
        StatusCode::CREATED,
        Json(json!({ "ok": true, "id": format!("_local/{id}"), "rev": rev })),
    )
        .into_response()
}
