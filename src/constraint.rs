//! `MatchConstraint<T>` pairs a response value with the log position that
//! must be durable before the value may be sent. It exists purely so the
//! type system keeps the "persistence happens-before the outbound RPC that
//! depends on it" ordering guarantee from leaking past the server loop:
//! `ConsensusModule::append_entries` hands one back instead of a bare
//! `AppendEntriesResponse`, and only the loop (after awaiting the log
//! flush) is allowed to unwrap it.

use crate::proto::LogPosition;

pub struct MatchConstraint<T> {
    value: T,
    position: LogPosition,
}

impl<T> MatchConstraint<T> {
    pub fn new(value: T, position: LogPosition) -> Self {
        MatchConstraint { value, position }
    }

    pub fn position(&self) -> LogPosition {
        self.position
    }

    /// Unwraps the value. Callers must only do this once the log has been
    /// durably flushed up to `position().index`.
    pub fn into_inner(self) -> T {
        self.value
    }
}

impl<T> From<T> for MatchConstraint<T> {
    /// Convenience for responses that carry no durability requirement
    /// (e.g. a rejection): trivially "satisfied" at `LogPosition` zero.
    fn from(value: T) -> Self {
        MatchConstraint {
            value,
            position: LogPosition { term: 0, index: 0 },
        }
    }
}
