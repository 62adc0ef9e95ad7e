//! Wire-level and persisted data types.
//!
//! These mirror the teacher's `protos.rs` almost one-for-one (same field
//! names, same derives) but are extended with the pre-vote round, snapshot
//! transfer, and joint-consensus payloads that the original file only left
//! `TODO`s or empty stand-ins for (`InstallSnapshotRequest {}`, no
//! `PreVoteRequest` at all).

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

/// Opaque unique id for a server. Assigned once (e.g. generated when a
/// server is first added to a configuration) and never reused.
pub type ServerId = Uuid;

pub type Term = u64;

pub type LogIndex = u64;

/// Address/connection info for a cluster member. Resolution into an actual
/// transport connection is the `rpc` collaborator's concern; we only carry
/// the opaque string around.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServerDescriptor {
    pub id: ServerId,
    pub address: String,
}

/// Persistent information describing the state of the current server.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Metadata {
    /// Latest term seen by this server (starts at 0).
    pub current_term: Term,

    /// The id of the server that we have voted for in the current term.
    pub voted_for: Option<ServerId>,

    /// Index of the last log entry safely replicated on a majority of
    /// servers and at the same point committed in the same term.
    ///
    /// NOTE: it is not generally necessary to persist this value; it can
    /// always be reinitialized to at least the index of the last applied
    /// entry from the log/config snapshot.
    pub commit_index: LogIndex,
}

impl Default for Metadata {
    fn default() -> Self {
        Metadata {
            current_term: 0,
            voted_for: None,
            commit_index: 0,
        }
    }
}

/// A set of servers considered for a single role bucket.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerSet {
    pub members: HashMap<ServerId, ServerDescriptor>,
    pub learners: HashMap<ServerId, ServerDescriptor>,
}

impl ServerSet {
    pub fn voter_ids(&self) -> HashSet<ServerId> {
        self.members.keys().copied().collect()
    }

    pub fn iter_ids(&self) -> impl Iterator<Item = ServerId> + '_ {
        self.members.keys().chain(self.learners.keys()).copied()
    }

    pub fn contains(&self, id: &ServerId) -> bool {
        self.members.contains_key(id) || self.learners.contains_key(id)
    }
}

/// A single-set (non-joint) configuration, or one half of a joint one.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct Configuration {
    pub servers: ServerSet,
}

impl Configuration {
    pub fn iter(&self) -> impl Iterator<Item = ServerId> + '_ {
        self.servers.iter_ids()
    }
}

/// The configuration payload carried in a `Configuration` log entry: either
/// a simple set, or the two overlapping sets of a joint-consensus transition.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub enum ConfigurationData {
    Simple(Configuration),
    Joint { old: Configuration, new: Configuration },
}

/// A full configuration, tagged with the index at which it was last
/// changed. Used both for the in-memory snapshot handed to a freshly
/// constructed `ConsensusModule` and for the `state_machine`-level
/// configuration snapshot record.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ConfigurationSnapshot {
    /// Index of the last log entry applied to this configuration.
    pub last_applied: LogIndex,
    pub data: ConfigurationData,
}

impl Default for ConfigurationSnapshot {
    fn default() -> Self {
        ConfigurationSnapshot {
            last_applied: 0,
            data: ConfigurationData::Simple(Configuration::default()),
        }
    }
}

#[derive(Serialize, Debug, Clone)]
pub struct ConfigurationSnapshotRef<'a> {
    pub last_applied: LogIndex,
    pub data: &'a ConfigurationData,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub enum LogEntryData {
    /// Occupies a log index without doing anything else. Used by a fresh
    /// leader to force commit progress in its own term, and as the
    /// trailing entry after a configuration finalizes.
    Dummy,

    /// A membership-change payload (simple or joint).
    Configuration(ConfigurationData),

    /// Opaque bytes handed unchanged to the state machine.
    Command(bytes::Bytes),
}

/// A single entry in the replicated log. Immutable once appended at a
/// given index (aside from truncation of an uncommitted suffix).
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct LogEntry {
    pub term: Term,
    pub index: LogIndex,
    pub data: LogEntryData,
}

/// `(term, index)` identifying a specific position in the log, returned to
/// the caller of a successful `propose*` call as a handle onto the
/// committed/applied promise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LogPosition {
    pub term: Term,
    pub index: LogIndex,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct AppendEntriesRequest {
    pub term: Term,
    pub leader_id: ServerId,
    pub prev_log_index: LogIndex,
    pub prev_log_term: Term,
    pub entries: Vec<LogEntry>,
    pub leader_commit: LogIndex,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct AppendEntriesResponse {
    pub term: Term,
    pub success: bool,

    /// Addition to the paper protocol (also present in LogCabin): on
    /// success this is the last index in the follower's log (used to
    /// detect that it has uncommitted entries from a stale leader); on
    /// failure this is a hint for how far back `next_index` should jump.
    pub last_log_index: Option<LogIndex>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct RequestVoteRequest {
    pub term: Term,
    pub candidate_id: ServerId,
    pub last_log_index: LogIndex,
    pub last_log_term: Term,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct RequestVoteResponse {
    pub term: Term,
    pub vote_granted: bool,
}

/// Same shape as `RequestVoteRequest`/`RequestVoteResponse`, kept as a
/// distinct wire type so the receiver never risks treating a pre-vote as a
/// binding vote (or vice-versa) — unlike the teacher's `pre_vote()`, which
/// only exposed the grant predicate and relied on the caller not to misuse
/// it.
pub type PreVoteRequest = RequestVoteRequest;
pub type PreVoteResponse = RequestVoteResponse;

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct InstallSnapshotRequest {
    pub term: Term,
    pub leader_id: ServerId,
    pub last_included_index: LogIndex,
    pub last_included_term: Term,
    pub last_included_configuration: ConfigurationData,
    /// Opaque state-machine snapshot bytes. Real deployments would chunk
    /// this; we keep it as a single blob with an `offset`/`done` framing so
    /// an adapter *can* chunk it without changing this type.
    pub offset: u64,
    pub data: bytes::Bytes,
    pub done: bool,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct InstallSnapshotResponse {
    pub term: Term,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct TimeoutNow {
    pub term: Term,
}

/// Sent by a leader performing a read barrier: a heartbeat tagged with a
/// generation counter so the leader can tell which broadcast a given ack
/// belongs to.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ReadIndexRequest {
    pub term: Term,
    pub generation: u64,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ReadIndexResponse {
    pub term: Term,
    pub generation: u64,
}

#[derive(Debug, Clone)]
pub enum MessageBody {
    PreVoteRequest(PreVoteRequest),
    PreVoteResponse(PreVoteResponse),
    RequestVote(RequestVoteRequest),
    RequestVoteResponse(RequestVoteResponse),
    /// The `LogIndex` is the last index of the original request, needed by
    /// the leader's callback to know what `match_index` to advance to.
    AppendEntries(AppendEntriesRequest, LogIndex),
    AppendEntriesResponse(AppendEntriesResponse),
    InstallSnapshot(InstallSnapshotRequest),
    InstallSnapshotResponse(InstallSnapshotResponse),
    TimeoutNow(TimeoutNow),
    ReadIndex(ReadIndexRequest),
    ReadIndexResponse(ReadIndexResponse),
}

/// A fire-and-forget outbound message, possibly addressed to several peers
/// at once (the leader deduplicates identical `AppendEntries` payloads
/// across followers at the same `next_index`).
#[derive(Debug, Clone)]
pub struct Message {
    pub to: Vec<ServerId>,
    pub body: MessageBody,
}
