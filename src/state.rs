//! Volatile role state. Same shapes as the teacher's `state.rs` call sites
//! (`ServerFollowerState`, `ServerCandidateState`, `ServerLeaderState`,
//! `ServerProgress`), extended with the pre-candidate role the teacher's
//! `pre_vote()` stub never grew a state for, and with the snapshot-transfer
//! bookkeeping `ServerProgress` needs to track `install_snapshot` in flight.

use crate::proto::ServerId;
use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Follower,
    PreCandidate,
    Candidate,
    Leader,
}

pub enum ServerState {
    Follower(ServerFollowerState),
    PreCandidate(ServerCandidateState),
    Candidate(ServerCandidateState),
    Leader(ServerLeaderState),
}

impl ServerState {
    pub fn role(&self) -> Role {
        match self {
            ServerState::Follower(_) => Role::Follower,
            ServerState::PreCandidate(_) => Role::PreCandidate,
            ServerState::Candidate(_) => Role::Candidate,
            ServerState::Leader(_) => Role::Leader,
        }
    }
}

pub struct ServerFollowerState {
    pub election_timeout: Duration,
    pub last_leader_id: Option<ServerId>,
    pub last_heartbeat: Instant,
}

pub struct ServerCandidateState {
    pub election_start: Instant,
    pub election_timeout: Duration,
    pub votes_received: HashSet<ServerId>,
    /// Set as soon as any peer has explicitly rejected our request; used to
    /// decide whether a subsequent timeout may reuse the same term (no
    /// rejections observed yet) or must bump the term again.
    pub some_rejected: bool,
}

/// Leader's view of where a snapshot transfer to a given follower has
/// gotten to. Absent unless an `install_snapshot` is in flight.
pub struct SnapshotProgress {
    pub last_included_index: crate::proto::LogIndex,
    pub offset: u64,
}

pub struct ServerProgress {
    /// Next log index we believe this follower is missing (optimistic).
    pub next_index: crate::proto::LogIndex,
    /// Highest index we know is durably stored on this follower.
    pub match_index: crate::proto::LogIndex,
    pub request_pending: bool,
    pub last_sent: Option<Instant>,
    /// Last index included in the most recent `AppendEntries` we sent this
    /// follower; read back by `append_entries_callback` since the response
    /// itself carries no such field.
    pub last_sent_index: Option<crate::proto::LogIndex>,
    pub snapshot: Option<SnapshotProgress>,
}

impl ServerProgress {
    pub fn new(last_log_index: crate::proto::LogIndex) -> Self {
        ServerProgress {
            next_index: last_log_index + 1,
            match_index: 0,
            request_pending: false,
            last_sent: None,
            last_sent_index: None,
            snapshot: None,
        }
    }
}

pub struct ServerLeaderState {
    pub servers: HashMap<ServerId, ServerProgress>,
    /// Set while `stepdown()` is draining outstanding replication before
    /// sending `timeout_now`.
    pub stepping_down: bool,
    /// Monotonic counter tagging the in-flight read-barrier heartbeat
    /// round(s); bumped every time a new `read_barrier()` call needs a
    /// fresh quorum of acks.
    pub read_index_generation: u64,
    pub read_index_acks: HashMap<u64, HashSet<ServerId>>,
}

impl ServerLeaderState {
    /// The leader never keeps a `ServerProgress` entry for itself — it
    /// trivially matches its own log, mirroring the teacher's
    /// `replicate_entries`, which always skips `leader_id`.
    pub fn new(servers: HashMap<ServerId, ServerProgress>) -> Self {
        ServerLeaderState {
            servers,
            stepping_down: false,
            read_index_generation: 0,
            read_index_acks: HashMap::new(),
        }
    }
}
