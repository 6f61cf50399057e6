//! Fuzz target for `_changes` row parsing.
//!
//! Feeds arbitrary bytes through JSON parsing into `RemoteChange::from_json`.
//! Nothing a remote sends may panic the tracker.

#![no_main]

use couchlite::change_tracker::{sequence_string, RemoteChange};
use libfuzzer_sys::fuzz_target;
use serde_json::Value;

fuzz_target!(|data: &[u8]| {
    let Ok(body) = serde_json::from_slice::<Value>(data) else {
        return;
    };

    let rows = match body.get("results").and_then(Value::as_array) {
        Some(rows) => rows.clone(),
        None => vec![body.clone()],
    };
    for row in &rows {
        if let Some(change) = RemoteChange::from_json(row) {
            assert!(!change.rev_ids.is_empty());
        }
    }
    if let Some(last_seq) = body.get("last_seq") {
        let _ = sequence_string(last_seq);
    }
});
