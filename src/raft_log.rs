//! The replicated log. Ordered, append-only, 0-indexed; entries are tagged
//! with the term that created them.

use crate::message::{CommandKind, Index, LogEntry, Term};

/// Result of the follower-side bulk append (§4.2's consistency check plus
/// merge).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppendOutcome {
    pub accepted: bool,
    pub last_new_index: i64,
}

#[derive(Debug, Default)]
pub struct Log {
    entries: Vec<LogEntry>,
}

impl Log {
    pub fn new() -> Self {
        Self { entries: Vec::new() }
    }

    pub fn length(&self) -> usize {
        self.entries.len()
    }

    /// -1 when the log is empty, matching the "prevIndex < 0 always
    /// matches" convention used throughout §4.2/§4.4.
    pub fn last_index(&self) -> i64 {
        self.entries.len() as i64 - 1
    }

    pub fn last_term(&self) -> Term {
        self.entries.last().map(|e| e.term).unwrap_or(0)
    }

    pub fn entry_at(&self, index: i64) -> Option<&LogEntry> {
        if index < 0 {
            return None;
        }
        self.entries.get(index as usize)
    }

    pub fn term_at(&self, index: i64) -> Option<Term> {
        self.entry_at(index).map(|e| e.term)
    }

    pub fn slice_from(&self, index: i64) -> Vec<LogEntry> {
        if index < 0 {
            return self.entries.clone();
        }
        self.entries.get(index as usize..).map(|s| s.to_vec()).unwrap_or_default()
    }

    /// Leader-local append. Returns the new entry's index.
    pub fn append_local(&mut self, term: Term, command: CommandKind) -> Index {
        let index = self.entries.len() as Index;
        self.entries.push(LogEntry { term, index, command });
        index
    }

    /// Drop every entry from `index` onward (inclusive).
    pub fn truncate_from(&mut self, index: Index) {
        self.entries.truncate(index as usize);
    }

    /// The follower-side consistency check: does this log contain an entry
    /// at `prev_index` whose term is `prev_term`? `prev_index < 0` always
    /// matches (there is nothing to check against).
    pub fn match_prefix(&self, prev_index: i64, prev_term: Term) -> bool {
        if prev_index < 0 {
            return true;
        }
        self.term_at(prev_index) == Some(prev_term)
    }

    /// Bulk merge used by the `AppendEntries` handler. Entries are folded
    /// in one at a time: a term mismatch at a position truncates the log
    /// from there and appends the new entry; a term match leaves the
    /// existing entry untouched, which is what makes re-delivery of the
    /// same RPC a no-op after the first successful merge.
    pub fn apply_append(&mut self, prev_index: i64, prev_term: Term, new_entries: &[LogEntry]) -> AppendOutcome {
        if !self.match_prefix(prev_index, prev_term) {
            return AppendOutcome { accepted: false, last_new_index: self.last_index() };
        }

        let mut insert_at = (prev_index + 1) as usize;
        for entry in new_entries {
            match self.entries.get(insert_at) {
                Some(existing) if existing.term == entry.term => {
                    // Already have it; idempotent no-op.
                }
                Some(_) => {
                    self.entries.truncate(insert_at);
                    self.entries.push(entry.clone());
                }
                None => {
                    self.entries.push(entry.clone());
                }
            }
            insert_at += 1;
        }

        AppendOutcome { accepted: true, last_new_index: insert_at as i64 - 1 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Track, TrackId};

    fn add(id: u64) -> CommandKind {
        CommandKind::Add(Track { id, title: "t".into(), artist: "a".into() })
    }

    fn remove(id: u64) -> CommandKind {
        CommandKind::Remove(TrackId(id))
    }

    #[test]
    fn empty_log_has_no_last_entry() {
        let log = Log::new();
        assert_eq!(log.last_index(), -1);
        assert_eq!(log.last_term(), 0);
    }

    #[test]
    fn append_local_assigns_sequential_indices() {
        let mut log = Log::new();
        assert_eq!(log.append_local(1, add(1)), 0);
        assert_eq!(log.append_local(1, add(2)), 1);
        assert_eq!(log.last_index(), 1);
        assert_eq!(log.last_term(), 1);
    }

    #[test]
    fn match_prefix_true_when_index_negative() {
        let log = Log::new();
        assert!(log.match_prefix(-1, 0));
    }

    #[test]
    fn match_prefix_false_on_missing_entry() {
        let log = Log::new();
        assert!(!log.match_prefix(0, 1));
    }

    #[test]
    fn apply_append_rejects_on_term_mismatch_at_prev_index() {
        let mut log = Log::new();
        log.append_local(1, add(1));
        let outcome = log.apply_append(0, 2, &[]);
        assert!(!outcome.accepted);
    }

    #[test]
    fn apply_append_truncates_conflicting_suffix() {
        let mut log = Log::new();
        log.append_local(1, add(1)); // index 0, term 1
        log.append_local(1, add(2)); // index 1, term 1 (will conflict)

        let new_entry = LogEntry { term: 2, index: 1, command: add(3) };
        let outcome = log.apply_append(0, 1, &[new_entry.clone()]);

        assert!(outcome.accepted);
        assert_eq!(log.length(), 2);
        assert_eq!(log.entry_at(1).unwrap().term, 2);
        assert_eq!(log.entry_at(1).unwrap().command, add(3));
    }

    #[test]
    fn redelivering_same_append_entries_is_a_noop() {
        let mut log = Log::new();
        let e0 = LogEntry { term: 1, index: 0, command: add(1) };
        let e1 = LogEntry { term: 1, index: 1, command: add(2) };

        let first = log.apply_append(-1, 0, &[e0.clone(), e1.clone()]);
        assert!(first.accepted);
        assert_eq!(log.length(), 2);

        // Re-deliver the identical RPC.
        let second = log.apply_append(-1, 0, &[e0, e1]);
        assert!(second.accepted);
        assert_eq!(log.length(), 2);
        assert_eq!(second.last_new_index, first.last_new_index);
    }

    #[test]
    fn truncate_from_drops_suffix() {
        let mut log = Log::new();
        log.append_local(1, add(1));
        log.append_local(1, add(2));
        log.append_local(1, remove(1));
        log.truncate_from(1);
        assert_eq!(log.length(), 1);
    }
}
