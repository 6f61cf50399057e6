//! Fuzz target for revision ID parsing and comparison.
//!
//! Revision IDs arrive from remote peers, so malformed ones must never
//! panic and must still order consistently.

#![no_main]

use couchlite::revision::{compare_rev_ids, generation_of, parse_rev_id};
use libfuzzer_sys::fuzz_target;
use std::cmp::Ordering;

fuzz_target!(|data: (&str, &str)| {
    let (a, b) = data;

    if let Some((generation, suffix)) = parse_rev_id(a) {
        assert!(generation > 0);
        assert!(!suffix.is_empty());
        assert_eq!(generation_of(a), generation);
    } else {
        assert_eq!(generation_of(a), 0);
    }

    let ab = compare_rev_ids(a, b);
    let ba = compare_rev_ids(b, a);
    assert_eq!(ab.reverse(), ba);
    assert_eq!(compare_rev_ids(a, a), Ordering::Equal);
});
