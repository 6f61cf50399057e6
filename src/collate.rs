//! JSON collation for view keys.
//!
//! Keys sort by type first, then by value:
//!
//! ```text
//! null < false < true < numbers < strings < arrays < objects
//! ```
//!
//! Arrays compare element-wise (a proper prefix sorts first); objects compare
//! their key/value pairs in order. String comparison depends on the
//! [`Collation`] mode. The same comparator is registered with SQLite so the
//! index can be range-scanned in collation order.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;

/// How view keys are compared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Collation {
    /// Type-aware ordering; strings compare case-insensitively first,
    /// lowercase before uppercase on ties.
    #[default]
    Unicode,
    /// Byte-wise comparison of the serialized JSON.
    Raw,
    /// Type-aware ordering; strings compare by bytes.
    Ascii,
}

impl Collation {
    /// Name of the SQLite collation implementing this mode.
    pub fn sqlite_name(self) -> &'static str {
        match self {
            Collation::Unicode => "JSON",
            Collation::Raw => "JSON_RAW",
            Collation::Ascii => "JSON_ASCII",
        }
    }
}

fn type_rank(v: &Value) -> u8 {
    match v {
        Value::Null => 0,
        Value::Bool(false) => 1,
        Value::Bool(true) => 2,
        Value::Number(_) => 3,
        Value::String(_) => 4,
        Value::Array(_) => 5,
        Value::Object(_) => 6,
    }
}

fn compare_numbers(a: &serde_json::Number, b: &serde_json::Number) -> Ordering {
    if let (Some(x), Some(y)) = (a.as_i64(), b.as_i64()) {
        return x.cmp(&y);
    }
    if let (Some(x), Some(y)) = (a.as_u64(), b.as_u64()) {
        return x.cmp(&y);
    }
    let x = a.as_f64().unwrap_or(0.0);
    let y = b.as_f64().unwrap_or(0.0);
    x.total_cmp(&y)
}

fn compare_unicode_strings(a: &str, b: &str) -> Ordering {
    let folded = a
        .chars()
        .flat_map(char::to_lowercase)
        .cmp(b.chars().flat_map(char::to_lowercase));
    if folded != Ordering::Equal {
        return folded;
    }
    // Same letters: lowercase sorts before uppercase at the first difference.
    for (ca, cb) in a.chars().zip(b.chars()) {
        if ca != cb {
            return match (ca.is_lowercase(), cb.is_lowercase()) {
                (true, false) => Ordering::Less,
                (false, true) => Ordering::Greater,
                _ => ca.cmp(&cb),
            };
        }
    }
    a.chars().count().cmp(&b.chars().count())
}

/// Compare two JSON values under `mode`.
pub fn collate(a: &Value, b: &Value, mode: Collation) -> Ordering {
    if mode == Collation::Raw {
        return a.to_string().cmp(&b.to_string());
    }
    let rank = type_rank(a).cmp(&type_rank(b));
    if rank != Ordering::Equal {
        return rank;
    }
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => compare_numbers(x, y),
        (Value::String(x), Value::String(y)) => match mode {
            Collation::Unicode => compare_unicode_strings(x, y),
            _ => x.as_bytes().cmp(y.as_bytes()),
        },
        (Value::Array(x), Value::Array(y)) => {
            for (ea, eb) in x.iter().zip(y.iter()) {
                let c = collate(ea, eb, mode);
                if c != Ordering::Equal {
                    return c;
                }
            }
            x.len().cmp(&y.len())
        }
        (Value::Object(x), Value::Object(y)) => {
            for ((ka, va), (kb, vb)) in x.iter().zip(y.iter()) {
                let c = compare_unicode_strings(ka, kb).then_with(|| collate(va, vb, mode));
                if c != Ordering::Equal {
                    return c;
                }
            }
            x.len().cmp(&y.len())
        }
        _ => Ordering::Equal,
    }
}

/// Compare two serialized JSON values; unparseable input compares by bytes.
pub fn collate_json_str(a: &str, b: &str, mode: Collation) -> Ordering {
    if mode == Collation::Raw {
        return a.cmp(b);
    }
    match (
        serde_json::from_str::<Value>(a),
        serde_json::from_str::<Value>(b),
    ) {
        (Ok(x), Ok(y)) => collate(&x, &y, mode),
        _ => a.cmp(b),
    }
}
