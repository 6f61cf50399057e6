//! Fuzz target for view key collation.
//!
//! Keys compared by SQLite come straight from stored JSON text, so
//! comparison must never panic and must stay antisymmetric.

#![no_main]

use couchlite::collate::collate_json_str;
use couchlite::Collation;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: (&str, &str)| {
    let (a, b) = data;
    for mode in [Collation::Unicode, Collation::Ascii, Collation::Raw] {
        let ab = collate_json_str(a, b, mode);
        let ba = collate_json_str(b, a, mode);
        assert_eq!(ab.reverse(), ba);
    }
});
