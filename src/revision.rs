//! Revision identifiers and revision records.
//!
//! A revision ID has the form `<generation>-<suffix>`, e.g. `3-a1b2c3`.
//! The generation counts edits along a branch; the suffix is a digest of the
//! revision's content and parent. Revision IDs order by generation
//! (numerically), ties broken by comparing suffixes as strings; the highest
//! revision among a document's leaves is its winner.

use serde_json::{Map, Value};
use sha1::{Digest, Sha1};
use std::cmp::Ordering;

/// Document ID prefix for design documents, which are never indexed.
pub const DESIGN_DOC_PREFIX: &str = "_design/";

/// Split a revision ID into `(generation, suffix)`.
///
/// Returns `None` unless the generation is a positive integer followed by
/// `-` and a non-empty suffix.
pub fn parse_rev_id(rev_id: &str) -> Option<(u64, &str)> {
    let (generation, suffix) = rev_id.split_once('-')?;
    if suffix.is_empty() || generation.is_empty() || !generation.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let generation: u64 = generation.parse().ok()?;
    if generation == 0 {
        return None;
    }
    Some((generation, suffix))
}

/// Generation of a revision ID, or 0 if malformed.
pub fn generation_of(rev_id: &str) -> u64 {
    parse_rev_id(rev_id).map(|(g, _)| g).unwrap_or(0)
}

/// Compare two revision IDs.
///
/// Higher generation wins; equal generations compare suffixes
/// lexicographically. Malformed IDs fall back to plain string comparison
/// so the ordering stays total.
pub fn compare_rev_ids(a: &str, b: &str) -> Ordering {
    match (parse_rev_id(a), parse_rev_id(b)) {
        (Some((ga, sa)), Some((gb, sb))) => ga.cmp(&gb).then_with(|| sa.cmp(sb)),
        _ => a.cmp(b),
    }
}

/// Revision ID for the child of `parent` with `body`.
pub fn next_rev_id(parent: Option<&str>, body: &Map<String, Value>, deleted: bool) -> String {
    let generation = parent.map(generation_of).unwrap_or(0) + 1;
    let mut hasher = Sha1::new();
    if let Some(parent) = parent {
        hasher.update(parent.as_bytes());
    }
    hasher.update([u8::from(deleted)]);
    // serde_json maps are key-ordered, so this is canonical.
    hasher.update(Value::Object(body.clone()).to_string().as_bytes());
    format!("{generation}-{}", hex::encode(hasher.finalize()))
}

/// Strip the `_`-prefixed metadata properties from a document body.
pub fn strip_special_properties(props: &Map<String, Value>) -> Map<String, Value> {
    props
        .iter()
        .filter(|(k, _)| !k.starts_with('_') || k.as_str() == "_attachments")
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

/// Build the `_revisions` history object from newest-first revision IDs.
pub fn revisions_object(history: &[String]) -> Value {
    let start = history.first().map(|r| generation_of(r)).unwrap_or(0);
    let ids: Vec<Value> = history
        .iter()
        .map(|r| {
            let suffix = parse_rev_id(r).map(|(_, s)| s).unwrap_or(r.as_str());
            Value::String(suffix.to_string())
        })
        .collect();
    serde_json::json!({ "start": start, "ids": ids })
}

/// Expand a `_revisions` object into newest-first revision IDs.
pub fn parse_revisions_object(revisions: &Value) -> Option<Vec<String>> {
    let start = revisions.get("start")?.as_u64()?;
    let ids = revisions.get("ids")?.as_array()?;
    let mut history = Vec::with_capacity(ids.len());
    for (i, id) in ids.iter().enumerate() {
        let generation = start.checked_sub(i as u64)?;
        if generation == 0 {
            return None;
        }
        history.push(format!("{generation}-{}", id.as_str()?));
    }
    Some(history)
}

/// One stored revision of a document.
#[derive(Debug, Clone, PartialEq)]
pub struct Revision {
    pub doc_id: String,
    pub rev_id: String,
    pub sequence: u64,
    pub deleted: bool,
    /// Properties without `_id`/`_rev`; `None` when not loaded.
    pub body: Option<Map<String, Value>>,
}

impl Revision {
    pub fn generation(&self) -> u64 {
        generation_of(&self.rev_id)
    }

    pub fn is_design_doc(&self) -> bool {
        self.doc_id.starts_with(DESIGN_DOC_PREFIX)
    }

    /// Full document properties including `_id`, `_rev` and `_deleted`.
    pub fn properties(&self) -> Map<String, Value> {
        let mut props = self.body.clone().unwrap_or_default();
        props.insert("_id".into(), Value::String(self.doc_id.clone()));
        props.insert("_rev".into(), Value::String(self.rev_id.clone()));
        if self.deleted {
            props.insert("_deleted".into(), Value::Bool(true));
        }
        props
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_rev_id() {
        assert_eq!(parse_rev_id("1-abc"), Some((1, "abc")));
        assert_eq!(parse_rev_id("12-x-y"), Some((12, "x-y")));
        assert_eq!(parse_rev_id("abc"), None);
        assert_eq!(parse_rev_id("0-abc"), None);
        assert_eq!(parse_rev_id("1-"), None);
        assert_eq!(parse_rev_id("-abc"), None);
        assert_eq!(parse_rev_id("+1-abc"), None);
    }

    #[test]
    fn test_compare_generation_dominates() {
        assert_eq!(compare_rev_ids("2-aaa", "10-aaa"), Ordering::Less);
        assert_eq!(compare_rev_ids("3-aaa", "2-zzz"), Ordering::Greater);
    }

    #[test]
    fn test_compare_suffix_tiebreak() {
        assert_eq!(compare_rev_ids("2-abc", "2-abd"), Ordering::Less);
        assert_eq!(compare_rev_ids("2-b", "2-a"), Ordering::Greater);
        assert_eq!(compare_rev_ids("2-same", "2-same"), Ordering::Equal);
    }

    #[test]
    fn test_compare_malformed_is_total() {
        assert_eq!(compare_rev_ids("garbage", "garbage"), Ordering::Equal);
        assert_eq!(compare_rev_ids("a", "b"), Ordering::Less);
    }

    #[test]
    fn test_next_rev_id() {
        let body = json!({"name": "x"}).as_object().unwrap().clone();
        let first = next_rev_id(None, &body, false);
        assert_eq!(generation_of(&first), 1);
        let second = next_rev_id(Some(&first), &body, false);
        assert_eq!(generation_of(&second), 2);
        assert_ne!(first, second);
        // Deterministic.
        assert_eq!(second, next_rev_id(Some(&first), &body, false));
        assert_ne!(second, next_rev_id(Some(&first), &body, true));
    }

    #[test]
    fn test_revisions_object_roundtrip() {
        let history = vec!["3-c".to_string(), "2-b".to_string(), "1-a".to_string()];
        let obj = revisions_object(&history);
        assert_eq!(obj, json!({"start": 3, "ids": ["c", "b", "a"]}));
        assert_eq!(parse_revisions_object(&obj), Some(history));
    }

    #[test]
    fn test_parse_revisions_object_rejects_underflow() {
        assert_eq!(parse_revisions_object(&json!({"start": 1, "ids": ["b", "a"]})), None);
    }

    #[test]
    fn test_properties_include_metadata() {
        let rev = Revision {
            doc_id: "doc".into(),
            rev_id: "1-a".into(),
            sequence: 1,
            deleted: true,
            body: Some(json!({"k": 1}).as_object().unwrap().clone()),
        };
        let props = rev.properties();
        assert_eq!(props["_id"], "doc");
        assert_eq!(props["_rev"], "1-a");
        assert_eq!(props["_deleted"], true);
        assert_eq!(props["k"], 1);
    }

    #[test]
    fn test_strip_special_properties_keeps_attachments() {
        let props = json!({"_id": "a", "_rev": "1-x", "_attachments": {}, "v": 1});
        let stripped = strip_special_properties(props.as_object().unwrap());
        assert!(stripped.contains_key("_attachments"));
        assert!(stripped.contains_key("v"));
        assert!(!stripped.contains_key("_id"));
    }
}
