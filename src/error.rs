//! Crate-wide error type.
//!
//! The teacher implementation threads a single `error_chain!`-generated
//! `Error` through the whole crate; we keep that shape but generate it with
//! `thiserror` instead, which is what the rest of the reference pack reaches
//! for (`error_chain` has had no release in years). Every collaborator trait
//! and every public `Server`/`ConsensusModule` method returns `Result<T>`
//! aliased below.

use crate::proto::ServerId;

#[derive(thiserror::Error, Debug)]
pub enum RaftError {
    /// Operation is only valid on the leader.
    #[error("not the leader (hint: {leader_hint:?})")]
    NotALeader { leader_hint: Option<ServerId> },

    /// The submitted entry was overwritten by a later leader before it committed.
    #[error("entry was dropped by a newer leader")]
    DroppedEntry,

    /// The server stepped down, aborted, or otherwise lost track of an entry's fate.
    #[error("commit status of entry is no longer known")]
    CommitStatusUnknown,

    /// A membership change is already in flight and has not finalized.
    #[error("a configuration change is already in progress")]
    ConfChangeInProgress,

    /// The log has reached `max_log_size` entries; submissions are refused
    /// until a snapshot frees space.
    #[error("log is full, awaiting a snapshot to free space")]
    LogFull,

    /// A stepdown or read barrier did not resolve within its deadline.
    #[error("operation timed out")]
    TimeoutError,

    /// The server has been aborted and can no longer accept calls.
    #[error("server has been stopped")]
    Stopped,

    /// A log/invariant violation was observed in a message from a peer.
    #[error("protocol violation: {0}")]
    Internal(String),

    /// Propagated collaborator I/O failure (persistence, rpc, state machine).
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, RaftError>;

impl From<&str> for RaftError {
    fn from(s: &str) -> Self {
        RaftError::Internal(s.to_string())
    }
}

impl From<String> for RaftError {
    fn from(s: String) -> Self {
        RaftError::Internal(s)
    }
}
