//! Append-only log store with term/index metadata.
//!
//! Slots are contiguous from 1; `Slot::ZERO` names the empty prefix so that
//! consistency checks have a well-defined base case.

use serde::{Deserialize, Serialize};

use crate::core::types::{Slot, Term};
use crate::state_machine::Command;

/// One replicated log entry.
///
/// For Raft, `term` is the leader term that created the entry. For Paxos,
/// it records the round of the ballot under which the slot was chosen, so
/// the observation API is engine-agnostic.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize, Deserialize)]
pub struct LogEntry {
    pub term: Term,
    pub command: Command,
}

impl LogEntry {
    #[must_use]
    pub const fn new(term: Term, command: Command) -> Self {
        Self { term, command }
    }
}

/// In-memory log store. Entry at slot `i` lives at `entries[i - 1]`.
#[derive(Clone, Debug, Default, Eq, Hash, PartialEq, Serialize, Deserialize)]
pub struct Log {
    entries: Vec<LogEntry>,
}

impl Log {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn last_index(&self) -> Slot {
        Slot::new(self.entries.len() as u64)
    }

    #[must_use]
    pub fn last_term(&self) -> Term {
        self.entries.last().map_or(Term::ZERO, |e| e.term)
    }

    #[must_use]
    pub fn get(&self, slot: Slot) -> Option<&LogEntry> {
        let index = usize::try_from(slot.get().checked_sub(1)?).ok()?;
        self.entries.get(index)
    }

    /// Term recorded at `slot`. `Slot::ZERO` reports `Term::ZERO`; slots past
    /// the end report `None`.
    #[must_use]
    pub fn term_at(&self, slot: Slot) -> Option<Term> {
        if slot == Slot::ZERO {
            return Some(Term::ZERO);
        }
        self.get(slot).map(|e| e.term)
    }

    /// Whether this log has an entry at `slot` with exactly `term`, the
    /// `AppendEntries` consistency check.
    #[must_use]
    pub fn matches(&self, slot: Slot, term: Term) -> bool {
        self.term_at(slot) == Some(term)
    }

    /// Append one entry, returning its slot.
    pub fn append(&mut self, entry: LogEntry) -> Slot {
        self.entries.push(entry);
        self.last_index()
    }

    /// Drop `slot` and everything after it.
    pub fn truncate_from(&mut self, slot: Slot) {
        let keep = usize::try_from(slot.get().saturating_sub(1)).unwrap_or(usize::MAX);
        self.entries.truncate(keep);
    }

    /// Entries at `slot` and after, for building replication batches.
    #[must_use]
    pub fn entries_from(&self, slot: Slot) -> &[LogEntry] {
        let start = usize::try_from(slot.get().saturating_sub(1)).unwrap_or(usize::MAX);
        self.entries.get(start..).unwrap_or(&[])
    }

    /// Merge replicated `entries` in right after `prev`: entries already
    /// present with the same term are skipped (duplicate delivery is a
    /// no-op), a term conflict truncates the old suffix before appending.
    /// Returns the last slot covered by this batch.
    pub fn reconcile(&mut self, prev: Slot, entries: Vec<LogEntry>) -> Slot {
        let mut slot = prev;
        for entry in entries {
            slot = slot.next();
            match self.term_at(slot) {
                Some(term) if term == entry.term => {}
                Some(_) => {
                    self.truncate_from(slot);
                    self.entries.push(entry);
                }
                None => {
                    self.entries.push(entry);
                }
            }
        }
        slot
    }

    /// True if a candidate whose log ends at `(last_term, last_index)` is at
    /// least as up-to-date as this log (compare terms, then lengths).
    #[must_use]
    pub fn candidate_up_to_date(&self, last_index: Slot, last_term: Term) -> bool {
        (last_term, last_index) >= (self.last_term(), self.last_index())
    }

    #[must_use]
    pub fn entries(&self) -> &[LogEntry] {
        &self.entries
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(term: u64, key: &str) -> LogEntry {
        LogEntry::new(Term(term), Command::put(key, "v"))
    }

    #[test]
    fn indexes_are_one_based() {
        let mut log = Log::new();
        assert_eq!(log.last_index(), Slot::ZERO);
        assert_eq!(log.term_at(Slot::ZERO), Some(Term::ZERO));

        let slot = log.append(entry(1, "a"));
        assert_eq!(slot, Slot::new(1));
        assert_eq!(log.term_at(Slot::new(1)), Some(Term(1)));
        assert_eq!(log.term_at(Slot::new(2)), None);
    }

    #[test]
    fn reconcile_skips_duplicates() {
        let mut log = Log::new();
        log.append(entry(1, "a"));
        log.append(entry(1, "b"));

        let last = log.reconcile(Slot::new(1), vec![entry(1, "b"), entry(1, "c")]);
        assert_eq!(last, Slot::new(3));
        assert_eq!(log.last_index(), Slot::new(3));
        assert_eq!(log.get(Slot::new(2)).unwrap().command, Command::put("b", "v"));
    }

    #[test]
    fn reconcile_truncates_conflicting_suffix() {
        let mut log = Log::new();
        log.append(entry(1, "a"));
        log.append(entry(2, "stale"));
        log.append(entry(2, "stale2"));

        let last = log.reconcile(Slot::new(1), vec![entry(3, "fresh")]);
        assert_eq!(last, Slot::new(2));
        assert_eq!(log.last_index(), Slot::new(2));
        assert_eq!(log.term_at(Slot::new(2)), Some(Term(3)));
    }

    #[test]
    fn up_to_date_compares_term_before_length() {
        let mut log = Log::new();
        log.append(entry(1, "a"));
        log.append(entry(1, "b"));

        // Higher last term wins even with a shorter log.
        assert!(log.candidate_up_to_date(Slot::new(1), Term(2)));
        // Same term needs at least our length.
        assert!(log.candidate_up_to_date(Slot::new(2), Term(1)));
        assert!(!log.candidate_up_to_date(Slot::new(1), Term(1)));
    }
}
