//! The replicated log and its storage abstraction.
//!
//! The teacher's `ConsensusModule` is handed `log: Arc<LogStorage + Send +
//! Sync + 'static>` at construction time and never touches a concrete file
//! format directly — appends, truncation and durability are all behind the
//! trait. We keep exactly that split: `LogStorage` *is* the "persistence"
//! collaborator as far as log entries are concerned (term/vote and snapshot
//! records are a separate, smaller collaborator in `persistence.rs`).

use crate::proto::{LogEntry, LogIndex, Term};
use std::sync::{Arc, RwLock};

/// Read/write access to the replicated log. Implementations must make
/// `append` and `truncate_suffix` durable before the values they report
/// back (`last_index`, `match_index`) reflect the change, so that callers
/// relying on "persistence happens-before the dependent RPC" are correct.
pub trait LogStorage: Send + Sync {
    /// Index of the first entry still retained (i.e. one past the last
    /// entry discarded by a snapshot). `None` if the log is empty and no
    /// snapshot has ever been taken.
    fn first_index(&self) -> Option<LogIndex>;

    /// Index of the last entry in the log. `None` if empty.
    fn last_index(&self) -> Option<LogIndex>;

    /// Term of the entry at `index`, or of the implicit zero entry at
    /// index 0. Returns `None` if `index` is outside of `[0, last_index]`
    /// or has already been compacted away (and isn't the snapshot's
    /// last-included position, which callers special-case separately).
    fn term(&self, index: LogIndex) -> Option<Term>;

    /// The entry at `index`, if still retained.
    fn entry(&self, index: LogIndex) -> Option<Arc<LogEntry>>;

    /// Highest index durably persisted so far. May lag behind
    /// `last_index()` if entries were appended but not yet flushed (an
    /// implementation that flushes synchronously in `append` can simply
    /// make this identical to `last_index`, as the in-memory reference
    /// implementation below does).
    fn match_index(&self) -> Option<LogIndex>;

    /// Appends one entry. Entries must be appended in strictly increasing
    /// index order with no gaps relative to `last_index`.
    fn append(&self, entry: LogEntry);

    /// Discards every entry at index `>= from`. Used to resolve a conflict
    /// with a new leader's log. Never called on a committed index.
    fn truncate_suffix(&self, from: LogIndex);

    /// Discards every entry at index `< up_to`, used after a snapshot has
    /// made them redundant.
    fn truncate_prefix(&self, up_to: LogIndex);
}

/// A simple in-memory log, synchronously "durable" as soon as `append`
/// returns. Used by tests and by the in-process demo binary; a real
/// deployment supplies its own disk-backed implementation.
#[derive(Default)]
pub struct MemoryLog {
    inner: RwLock<MemoryLogInner>,
}

#[derive(Default)]
struct MemoryLogInner {
    /// `entries[i]` holds the entry at index `base + i + 1`.
    entries: Vec<Arc<LogEntry>>,
    /// One less than the index of `entries[0]`; i.e. the last index
    /// discarded by a prefix truncation (or 0 if none ever happened).
    base: LogIndex,
}

impl MemoryLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Construct a log pre-seeded with `entries` (used by tests that want
    /// to start from a specific history) and an optional `base` (simulating
    /// recovery after a snapshot already discarded a prefix).
    pub fn from_entries(entries: Vec<LogEntry>, base: LogIndex) -> Self {
        let entries = entries.into_iter().map(Arc::new).collect();
        MemoryLog {
            inner: RwLock::new(MemoryLogInner { entries, base }),
        }
    }
}

impl LogStorage for MemoryLog {
    fn first_index(&self) -> Option<LogIndex> {
        let inner = self.inner.read().unwrap();
        if inner.entries.is_empty() {
            None
        } else {
            Some(inner.base + 1)
        }
    }

    fn last_index(&self) -> Option<LogIndex> {
        let inner = self.inner.read().unwrap();
        if inner.entries.is_empty() {
            None
        } else {
            Some(inner.base + inner.entries.len() as LogIndex)
        }
    }

    fn term(&self, index: LogIndex) -> Option<Term> {
        if index == 0 {
            return Some(0);
        }
        let inner = self.inner.read().unwrap();
        if index <= inner.base {
            return None;
        }
        let offset = (index - inner.base - 1) as usize;
        inner.entries.get(offset).map(|e| e.term)
    }

    fn entry(&self, index: LogIndex) -> Option<Arc<LogEntry>> {
        let inner = self.inner.read().unwrap();
        if index <= inner.base {
            return None;
        }
        let offset = (index - inner.base - 1) as usize;
        inner.entries.get(offset).cloned()
    }

    fn match_index(&self) -> Option<LogIndex> {
        self.last_index()
    }

    fn append(&self, entry: LogEntry) {
        let mut inner = self.inner.write().unwrap();
        let expected = inner.base + inner.entries.len() as LogIndex + 1;
        assert_eq!(entry.index, expected, "append must be contiguous");
        inner.entries.push(Arc::new(entry));
    }

    fn truncate_suffix(&self, from: LogIndex) {
        let mut inner = self.inner.write().unwrap();
        if from <= inner.base {
            inner.entries.clear();
            return;
        }
        let offset = (from - inner.base - 1) as usize;
        inner.entries.truncate(offset);
    }

    fn truncate_prefix(&self, up_to: LogIndex) {
        let mut inner = self.inner.write().unwrap();
        if up_to <= inner.base {
            return;
        }
        let last = inner.base + inner.entries.len() as LogIndex;
        let up_to = up_to.min(last);
        let drop = (up_to - inner.base) as usize;
        inner.entries.drain(0..drop);
        inner.base = up_to;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::LogEntryData;

    fn entry(term: Term, index: LogIndex) -> LogEntry {
        LogEntry {
            term,
            index,
            data: LogEntryData::Dummy,
        }
    }

    #[test]
    fn append_and_read_back() {
        let log = MemoryLog::new();
        assert_eq!(log.last_index(), None);
        log.append(entry(1, 1));
        log.append(entry(1, 2));
        assert_eq!(log.last_index(), Some(2));
        assert_eq!(log.term(1), Some(1));
        assert_eq!(log.term(0), Some(0));
        assert!(log.entry(2).is_some());
    }

    #[test]
    fn truncate_suffix_discards_tail() {
        let log = MemoryLog::new();
        for i in 1..=5 {
            log.append(entry(1, i));
        }
        log.truncate_suffix(3);
        assert_eq!(log.last_index(), Some(2));
        log.append(entry(2, 3));
        assert_eq!(log.term(3), Some(2));
    }

    #[test]
    fn truncate_prefix_advances_first_index() {
        let log = MemoryLog::from_entries(vec![entry(1, 1), entry(1, 2), entry(2, 3)], 0);
        log.truncate_prefix(3);
        assert_eq!(log.first_index(), Some(3));
        assert_eq!(log.term(3), Some(2));
        assert_eq!(log.term(2), None);
    }
}
