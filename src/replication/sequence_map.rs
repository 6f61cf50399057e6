//! Ordered tracking of in-flight sequences.
//!
//! Revisions finish out of order (concurrent fetches, failed items), but a
//! checkpoint may only name a sequence once everything before it is done.
//! Each queued revision takes an entry; the checkpointable value is the
//! sequence of the last entry in the longest completed prefix.
//!
//! ```text
//! add:     #1(s=4)  #2(s=5)  #3(s=5)  #4(s=9)
//! remove:  #1       #3
//! ──────────────────────────────────────────
//! checkpointed_value() = "4"   (#2 still pending)
//! ```

use std::collections::VecDeque;

#[derive(Debug, Default)]
pub(crate) struct SequenceMap {
    entries: VecDeque<(u64, String, bool)>,
    next_id: u64,
    last_completed: Option<String>,
}

impl SequenceMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track `sequence`; returns the entry ID to pass to [`remove`](Self::remove).
    pub fn add(&mut self, sequence: impl Into<String>) -> u64 {
        self.next_id += 1;
        self.entries.push_back((self.next_id, sequence.into(), false));
        self.next_id
    }

    /// Mark an entry complete. Unknown IDs are ignored.
    pub fn remove(&mut self, id: u64) {
        if let Some(entry) = self.entries.iter_mut().find(|(entry_id, _, _)| *entry_id == id) {
            entry.2 = true;
        }
        while let Some((_, _, true)) = self.entries.front() {
            if let Some((_, sequence, _)) = self.entries.pop_front() {
                self.last_completed = Some(sequence);
            }
        }
    }

    /// Highest sequence with nothing pending before it.
    pub fn checkpointed_value(&self) -> Option<&str> {
        self.last_completed.as_deref()
    }

    pub fn pending(&self) -> usize {
        self.entries.iter().filter(|(_, _, done)| !done).count()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Forget pending entries (after a stop); the completed value stays.
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_out_of_order_completion() {
        let mut map = SequenceMap::new();
        let a = map.add("4");
        let b = map.add("5");
        let c = map.add("5");
        let d = map.add("9");
        assert_eq!(map.checkpointed_value(), None);

        map.remove(a);
        map.remove(c);
        assert_eq!(map.checkpointed_value(), Some("4"));
        assert_eq!(map.pending(), 2);

        map.remove(b);
        assert_eq!(map.checkpointed_value(), Some("5"));
        map.remove(d);
        assert_eq!(map.checkpointed_value(), Some("9"));
        assert!(map.is_empty());
    }

    #[test]
    fn test_failed_entry_holds_checkpoint() {
        let mut map = SequenceMap::new();
        let _stuck = map.add("1");
        let later = map.add("2");
        map.remove(later);
        assert_eq!(map.checkpointed_value(), None);
        map.clear();
        assert!(map.is_empty());
        map.remove(999);
        assert_eq!(map.checkpointed_value(), None);
    }

    #[test]
    fn test_requeue_after_clear_advances() {
        let mut map = SequenceMap::new();
        let done = map.add("1");
        let stuck = map.add("2");
        let later = map.add("3");
        map.remove(done);
        map.remove(later);
        assert_eq!(map.checkpointed_value(), Some("1"));

        // A retry drops the stale entries and queues the re-scan.
        map.clear();
        map.remove(stuck);
        let again = map.add("2");
        let after = map.add("3");
        assert_eq!(map.checkpointed_value(), Some("1"));
        map.remove(again);
        map.remove(after);
        assert_eq!(map.checkpointed_value(), Some("3"));
        assert!(map.is_empty());
    }
}
