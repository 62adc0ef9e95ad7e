//! The pure Raft state machine: election (with pre-voting), log
//! replication, commit advancement, joint-consensus membership changes and
//! the read barrier. Grounded on the teacher's `ConsensusModule`/`Tick`
//! (`consensus.rs`): a single `cycle()` entry point dispatches on role and
//! elapsed time, every RPC handler returns what should be sent back without
//! performing any I/O itself, and responses that must wait on durability
//! travel inside a `MatchConstraint`. Everything the teacher's module did
//! synchronously (reading/writing `self.log` directly) still does; anything
//! that needs to leave the module to actually move bytes happens through the
//! `Tick` it fills in, which the server loop drains into the `rpc`/
//! `persistence`/`state_machine` collaborators.

use crate::clock::Clock;
use crate::config::ConfigurationStateMachine;
use crate::constraint::MatchConstraint;
use crate::error::{RaftError, Result};
use crate::log::LogStorage;
use crate::proto::*;
use crate::settings::RaftConfig;
use crate::snapshot::SnapshotDescriptor;
use crate::state::*;
use rand::Rng;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Output of a single `cycle()`/RPC handler call: everything the server loop
/// needs to actually do as a result. The module itself never touches the
/// network, a clock outside of `self.clock`, or an async collaborator.
#[derive(Default)]
pub struct Tick {
    pub messages: Vec<Message>,
    /// How long until `cycle()` should be called again if nothing else
    /// happens first (a new inbound message always warrants calling it
    /// immediately instead).
    pub next_tick: Option<Duration>,
    /// `meta` (term/vote/commit_index) changed and must be durably
    /// persisted before any of `messages` that depend on it go out.
    pub must_persist_meta: bool,
    /// The configuration snapshot changed and should be persisted.
    pub must_persist_config: bool,
    /// Followers the leader has determined need a snapshot transfer rather
    /// than further `AppendEntries` catch-up; the server loop is
    /// responsible for obtaining the latest `SnapshotDescriptor` (fresh or
    /// cached) and calling `ConsensusModule::send_snapshot`.
    pub snapshot_needed_for: Vec<ServerId>,
}

impl Tick {
    fn merge_next_tick(&mut self, dur: Duration) {
        self.next_tick = Some(match self.next_tick {
            Some(existing) if existing <= dur => existing,
            _ => dur,
        });
    }
}

/// A token returned by `start_read_barrier`; the caller must wait until a
/// quorum of `ReadIndexResponse`s for this `generation` arrive *and*
/// `commit_index >= index`.
#[derive(Debug, Clone, Copy)]
pub struct ReadBarrierToken {
    pub generation: u64,
    pub index: LogIndex,
}

pub struct ConsensusModule {
    id: ServerId,
    meta: Metadata,
    log: Arc<dyn LogStorage>,
    config: ConfigurationStateMachine,
    state: ServerState,
    clock: Arc<dyn Clock>,
    enable_prevoting: bool,
    election_timeout_range: (u64, u64),
    heartbeat_interval: Duration,
    append_request_threshold: usize,
    max_log_size: u64,
    last_applied: LogIndex,
    last_snapshot: SnapshotDescriptor,
}

impl ConsensusModule {
    pub fn new(
        id: ServerId,
        meta: Metadata,
        log: Arc<dyn LogStorage>,
        config: ConfigurationStateMachine,
        clock: Arc<dyn Clock>,
        raft_config: RaftConfig,
    ) -> Self {
        let now = clock.now();
        let election_timeout_range = raft_config.election_timeout_ms;
        ConsensusModule {
            id,
            // Only a snapshot load (`note_snapshot`/`install_snapshot`) or
            // the server loop's own replay actually advances this; `meta`
            // may carry a `commit_index` well ahead of what the
            // `state_machine` has seen so far (e.g. on restart).
            last_applied: 0,
            meta,
            log,
            config,
            state: ServerState::Follower(ServerFollowerState {
                election_timeout: Self::random_timeout_in(election_timeout_range),
                last_leader_id: None,
                last_heartbeat: now,
            }),
            clock,
            enable_prevoting: raft_config.enable_prevoting,
            election_timeout_range,
            heartbeat_interval: Duration::from_millis(raft_config.heartbeat_interval_ms),
            append_request_threshold: raft_config.append_request_threshold,
            max_log_size: raft_config.max_log_size,
            last_snapshot: SnapshotDescriptor::none(),
        }
    }

    pub fn id(&self) -> ServerId {
        self.id
    }

    pub fn current_term(&self) -> Term {
        self.meta.current_term
    }

    pub fn voted_for(&self) -> Option<ServerId> {
        self.meta.voted_for
    }

    pub fn role(&self) -> Role {
        self.state.role()
    }

    pub fn is_leader(&self) -> bool {
        self.role() == Role::Leader
    }

    pub fn commit_index(&self) -> LogIndex {
        self.meta.commit_index
    }

    pub fn last_applied(&self) -> LogIndex {
        self.last_applied
    }

    /// Called by the server loop once it has applied every command up to
    /// (and including) `index` to the state machine.
    pub fn set_last_applied(&mut self, index: LogIndex) {
        self.last_applied = index;
    }

    pub fn configuration(&self) -> ConfigurationSnapshotRef {
        self.config.snapshot()
    }

    /// Exposes the injected log so the server loop can read entries to
    /// apply and perform prefix truncation after a snapshot; kept out of
    /// the trait-shaped public surface that collaborators see.
    pub fn log_storage(&self) -> &dyn LogStorage {
        self.log.as_ref()
    }

    /// True once a joint-consensus entry has committed but the finalizing
    /// `Simple(new)` entry hasn't been proposed yet — the server loop polls
    /// this after every commit advancement to drive the second phase.
    pub fn configuration_awaits_finalization(&self) -> bool {
        self.config.pending.is_none() && matches!(self.config.value, ConfigurationData::Joint { .. })
    }

    pub fn leader_hint(&self) -> Option<ServerId> {
        match &self.state {
            ServerState::Follower(f) => f.last_leader_id,
            ServerState::Leader(_) => Some(self.id),
            _ => None,
        }
    }

    fn random_timeout(&self) -> Duration {
        Self::random_timeout_in(self.election_timeout_range)
    }

    fn random_timeout_in(range: (u64, u64)) -> Duration {
        let millis = rand::thread_rng().gen_range(range.0..=range.1);
        Duration::from_millis(millis)
    }

    /// Total entries currently retained in the log (post any prefix
    /// truncation from snapshotting), used for `max_log_size` backpressure.
    fn log_len(&self) -> u64 {
        match (self.log.first_index(), self.log.last_index()) {
            (Some(first), Some(last)) => last - first + 1,
            _ => 0,
        }
    }

    /// Hands the module a snapshot its own server loop just produced (or
    /// received and applied), so it can serve it to a lagging follower
    /// without needing to go back out to an async collaborator mid-cycle.
    pub fn note_snapshot(&mut self, desc: SnapshotDescriptor) {
        self.last_snapshot = desc;
    }

    // ---- election -------------------------------------------------------

    /// The main per-tick entry point: checks timeouts for the current role
    /// and acts (starting/retrying an election, sending heartbeats).
    pub fn cycle(&mut self, tick: &mut Tick) {
        let now = self.clock.now();
        match &self.state {
            ServerState::Follower(f) => {
                if now.duration_since(f.last_heartbeat) >= f.election_timeout {
                    self.start_election(tick);
                } else {
                    tick.merge_next_tick(f.election_timeout - now.duration_since(f.last_heartbeat));
                }
            }
            ServerState::PreCandidate(c) | ServerState::Candidate(c) => {
                if now.duration_since(c.election_start) >= c.election_timeout {
                    self.start_election(tick);
                } else {
                    tick.merge_next_tick(c.election_timeout - now.duration_since(c.election_start));
                }
            }
            ServerState::Leader(_) => {
                self.replicate_entries(tick);
                tick.merge_next_tick(self.heartbeat_interval);
            }
        }
    }

    /// Starts a new round: a pre-vote if enabled and we aren't already past
    /// that stage, otherwise a binding election.
    fn start_election(&mut self, tick: &mut Tick) {
        if self.config.is_empty() {
            // Single/no-voter bootstrap configuration: nothing to ask.
            return;
        }
        if self.enable_prevoting && !matches!(self.state, ServerState::Candidate(_)) {
            self.perform_prevote(tick);
        } else {
            self.perform_election(tick);
        }
    }

    fn perform_prevote(&mut self, tick: &mut Tick) {
        let now = self.clock.now();
        let votes_received = {
            let mut s = std::collections::HashSet::new();
            s.insert(self.id);
            s
        };
        let timeout = self.random_timeout();
        self.state = ServerState::PreCandidate(ServerCandidateState {
            election_start: now,
            election_timeout: timeout,
            votes_received: votes_received.clone(),
            some_rejected: false,
        });

        // A lone voter (or one that already holds a quorum of pre-votes
        // trivially, i.e. itself) proceeds straight to a binding election.
        if self.has_vote_quorum(&votes_received) {
            self.perform_election(tick);
            return;
        }

        let req = PreVoteRequest {
            term: self.meta.current_term + 1,
            candidate_id: self.id,
            last_log_index: self.log.last_index().unwrap_or(0),
            last_log_term: self
                .log
                .last_index()
                .and_then(|i| self.log.term(i))
                .unwrap_or(0),
        };

        for peer in self.config.iter() {
            if peer != self.id {
                tick.messages.push(Message {
                    to: vec![peer],
                    body: MessageBody::PreVoteRequest(req.clone()),
                });
            }
        }
    }

    fn perform_election(&mut self, tick: &mut Tick) {
        let now = self.clock.now();
        self.meta.current_term += 1;
        self.meta.voted_for = Some(self.id);
        tick.must_persist_meta = true;

        let timeout = self.random_timeout();
        self.state = ServerState::Candidate(ServerCandidateState {
            election_start: now,
            election_timeout: timeout,
            votes_received: {
                let mut s = std::collections::HashSet::new();
                s.insert(self.id);
                s
            },
            some_rejected: false,
        });

        let req = RequestVoteRequest {
            term: self.meta.current_term,
            candidate_id: self.id,
            last_log_index: self.log.last_index().unwrap_or(0),
            last_log_term: self
                .log
                .last_index()
                .and_then(|i| self.log.term(i))
                .unwrap_or(0),
        };

        for peer in self.config.iter() {
            if peer != self.id {
                tick.messages.push(Message {
                    to: vec![peer],
                    body: MessageBody::RequestVote(req.clone()),
                });
            }
        }

        // A lone voter wins immediately.
        self.maybe_become_leader(tick);
    }

    fn maybe_become_leader(&mut self, tick: &mut Tick) {
        let Some(votes) = (match &self.state {
            ServerState::Candidate(c) => Some(c.votes_received.clone()),
            _ => None,
        }) else {
            return;
        };

        if self.has_vote_quorum(&votes) {
            self.become_leader(tick);
        }
    }

    fn has_vote_quorum(&self, votes: &std::collections::HashSet<ServerId>) -> bool {
        self.config
            .vote_quorums()
            .into_iter()
            .all(|(ids, majority)| ids.iter().filter(|id| votes.contains(id)).count() >= majority)
    }

    fn become_leader(&mut self, tick: &mut Tick) {
        let last_index = self.log.last_index().unwrap_or(0);
        let mut servers = HashMap::new();
        for peer in self.config.iter() {
            if peer != self.id {
                servers.insert(peer, ServerProgress::new(last_index));
            }
        }
        self.state = ServerState::Leader(ServerLeaderState::new(servers));

        // A fresh leader appends a no-op entry in its own term so that it
        // can safely advance `commit_index` (the Raft "leader completeness"
        // caveat: a leader may only directly commit entries from its own
        // term).
        let _ = self.propose_entry(LogEntryData::Dummy, tick);
        self.replicate_entries(tick);
    }

    fn become_follower(&mut self, leader_id: Option<ServerId>, tick: &mut Tick) {
        let now = self.clock.now();
        let timeout = self.random_timeout();
        self.state = ServerState::Follower(ServerFollowerState {
            election_timeout: timeout,
            last_leader_id: leader_id,
            last_heartbeat: now,
        });
        tick.merge_next_tick(timeout);
    }

    /// Updates `current_term`/role on seeing a higher term anywhere (a
    /// request, a response, or a heartbeat). Returns `true` if we stepped
    /// down as a result.
    fn observe_term(&mut self, term: Term, tick: &mut Tick) -> bool {
        if term > self.meta.current_term {
            self.meta.current_term = term;
            self.meta.voted_for = None;
            tick.must_persist_meta = true;
            if !matches!(self.state, ServerState::Follower(_)) {
                self.become_follower(None, tick);
            }
            true
        } else {
            false
        }
    }

    // ---- RPC handlers -----------------------------------------------------

    /// Grant predicate only: never mutates `current_term`/`voted_for`,
    /// matching the teacher's `pre_vote()` but exposed over its own wire
    /// type so a peer can't mistake it for a binding vote.
    pub fn pre_vote(&self, req: &PreVoteRequest) -> PreVoteResponse {
        let up_to_date = self.is_candidate_log_up_to_date(req.last_log_index, req.last_log_term);
        let leader_stale = match &self.state {
            ServerState::Follower(f) => {
                self.clock.now().duration_since(f.last_heartbeat) >= self.min_election_timeout()
            }
            _ => true,
        };
        let granted = req.term >= self.meta.current_term && up_to_date && leader_stale;
        PreVoteResponse {
            term: self.meta.current_term,
            vote_granted: granted,
        }
    }

    fn min_election_timeout(&self) -> Duration {
        Duration::from_millis(self.election_timeout_range.0)
    }

    fn is_candidate_log_up_to_date(&self, last_log_index: LogIndex, last_log_term: Term) -> bool {
        let our_last_index = self.log.last_index().unwrap_or(0);
        let our_last_term = self.log.term(our_last_index).unwrap_or(0);
        (last_log_term, last_log_index) >= (our_last_term, our_last_index)
    }

    pub fn request_vote(&mut self, req: &RequestVoteRequest, tick: &mut Tick) -> RequestVoteResponse {
        self.observe_term(req.term, tick);

        if req.term < self.meta.current_term {
            return RequestVoteResponse {
                term: self.meta.current_term,
                vote_granted: false,
            };
        }

        let up_to_date = self.is_candidate_log_up_to_date(req.last_log_index, req.last_log_term);
        let can_vote = match self.meta.voted_for {
            None => true,
            Some(id) => id == req.candidate_id,
        };

        let granted = up_to_date && can_vote;
        if granted {
            self.meta.voted_for = Some(req.candidate_id);
            tick.must_persist_meta = true;
            if let ServerState::Follower(f) = &mut self.state {
                f.last_heartbeat = self.clock.now();
            }
        }

        RequestVoteResponse {
            term: self.meta.current_term,
            vote_granted: granted,
        }
    }

    pub fn pre_vote_callback(&mut self, peer: ServerId, resp: PreVoteResponse, tick: &mut Tick) {
        if self.observe_term(resp.term, tick) {
            return;
        }
        if !resp.vote_granted {
            return;
        }
        let ServerState::PreCandidate(c) = &mut self.state else {
            return;
        };
        c.votes_received.insert(peer);
        let votes = c.votes_received.clone();
        if self.has_vote_quorum(&votes) {
            self.perform_election(tick);
        }
    }

    pub fn request_vote_callback(&mut self, peer: ServerId, resp: RequestVoteResponse, tick: &mut Tick) {
        if self.observe_term(resp.term, tick) {
            return;
        }
        if resp.term < self.meta.current_term {
            return;
        }
        let ServerState::Candidate(c) = &mut self.state else {
            return;
        };
        if resp.vote_granted {
            c.votes_received.insert(peer);
        } else {
            c.some_rejected = true;
        }
        self.maybe_become_leader(tick);
    }

    /// Follower-side handler. Returns a response wrapped in a
    /// `MatchConstraint` naming the log position that must be durably
    /// persisted before the response may be sent, matching the teacher's
    /// `append_entries` signature.
    pub fn append_entries(
        &mut self,
        req: AppendEntriesRequest,
        tick: &mut Tick,
    ) -> Result<MatchConstraint<AppendEntriesResponse>> {
        self.observe_term(req.term, tick);

        if req.term < self.meta.current_term {
            return Ok(MatchConstraint::from(AppendEntriesResponse {
                term: self.meta.current_term,
                success: false,
                last_log_index: self.log.last_index(),
            }));
        }

        if let ServerState::Follower(f) = &mut self.state {
            f.last_heartbeat = self.clock.now();
            f.last_leader_id = Some(req.leader_id);
        } else {
            self.become_follower(Some(req.leader_id), tick);
        }

        let prev_ok = if req.prev_log_index == 0 {
            true
        } else {
            self.log.term(req.prev_log_index) == Some(req.prev_log_term)
        };

        if !prev_ok {
            return Ok(MatchConstraint::from(AppendEntriesResponse {
                term: self.meta.current_term,
                success: false,
                last_log_index: self.log.last_index(),
            }));
        }

        let mut last_new_index = req.prev_log_index;
        for entry in req.entries {
            let existing_term = self.log.term(entry.index);
            if existing_term == Some(entry.term) {
                last_new_index = entry.index;
                continue;
            }
            if existing_term.is_some() {
                if self.meta.commit_index >= entry.index {
                    return Err("refusing to truncate changes already locally committed".into());
                }
                // Conflict: everything from here on is wrong, discard it.
                self.log.truncate_suffix(entry.index);
                self.config.revert(entry.index);
            }
            self.config.apply(&entry, self.meta.commit_index);
            self.log.append(entry.clone());
            last_new_index = entry.index;
        }

        if req.leader_commit > self.meta.commit_index {
            let new_commit = req.leader_commit.min(last_new_index);
            self.update_committed(new_commit, tick);
        }

        Ok(MatchConstraint::new(
            AppendEntriesResponse {
                term: self.meta.current_term,
                success: true,
                last_log_index: Some(last_new_index),
            },
            LogPosition {
                term: self.meta.current_term,
                index: last_new_index,
            },
        ))
    }

    pub fn append_entries_callback(
        &mut self,
        peer: ServerId,
        resp: AppendEntriesResponse,
        tick: &mut Tick,
    ) {
        if self.observe_term(resp.term, tick) {
            return;
        }
        let ServerState::Leader(leader) = &mut self.state else {
            return;
        };
        let Some(progress) = leader.servers.get_mut(&peer) else {
            return;
        };
        progress.request_pending = false;
        let last_sent_index = progress.last_sent_index.take().unwrap_or(0);

        if resp.success {
            progress.match_index = progress.match_index.max(last_sent_index);
            progress.next_index = progress.match_index + 1;
        } else {
            // Back off: jump to the follower's reported last index plus
            // one, or simply decrement if it didn't report one.
            progress.next_index = resp
                .last_log_index
                .map(|i| i + 1)
                .unwrap_or_else(|| progress.next_index.saturating_sub(1))
                .max(1);
        }

        self.advance_commit_index(tick);
        self.replicate_entries(tick);
    }

    // ---- replication & commit --------------------------------------------

    fn replicate_entries(&mut self, tick: &mut Tick) {
        let current_term = self.meta.current_term;
        let leader_commit = self.meta.commit_index;
        let self_id = self.id;
        let log = Arc::clone(&self.log);
        let first_index = log.first_index().unwrap_or(1);
        let append_request_threshold = self.append_request_threshold;

        let ServerState::Leader(leader) = &mut self.state else {
            return;
        };

        let mut needs_snapshot = Vec::new();

        for (peer, progress) in leader.servers.iter_mut() {
            if progress.request_pending {
                continue;
            }

            if progress.next_index < first_index {
                needs_snapshot.push(*peer);
                progress.request_pending = true;
                continue;
            }

            let prev_log_index = progress.next_index - 1;
            let prev_log_term = if prev_log_index == 0 {
                0
            } else {
                log.term(prev_log_index).unwrap_or(0)
            };

            let last_index = log.last_index().unwrap_or(0);
            let mut entries = Vec::new();
            let mut size = 0usize;
            let mut idx = progress.next_index;
            while idx <= last_index {
                let Some(entry) = log.entry(idx) else { break };
                size += crate::promise::entry_size(&entry.data);
                entries.push((*entry).clone());
                idx += 1;
                if size >= append_request_threshold {
                    break;
                }
            }
            let sent_up_to = idx.saturating_sub(1).max(prev_log_index);

            progress.request_pending = true;
            progress.last_sent = Some(self.clock.now());
            progress.last_sent_index = Some(sent_up_to);

            tick.messages.push(Message {
                to: vec![*peer],
                body: MessageBody::AppendEntries(
                    AppendEntriesRequest {
                        term: current_term,
                        leader_id: self_id,
                        prev_log_index,
                        prev_log_term,
                        entries,
                        leader_commit,
                    },
                    sent_up_to,
                ),
            });
        }

        tick.snapshot_needed_for = needs_snapshot;
    }

    fn advance_commit_index(&mut self, tick: &mut Tick) {
        let ServerState::Leader(leader) = &self.state else {
            return;
        };
        let self_match = self.log.last_index().unwrap_or(0);
        let matches: HashMap<ServerId, LogIndex> = leader
            .servers
            .iter()
            .map(|(id, p)| (*id, p.match_index))
            .collect();

        let last_index = self.log.last_index().unwrap_or(0);
        let mut candidate = self.meta.commit_index;
        for index in (self.meta.commit_index + 1)..=last_index {
            if self.log.term(index) != Some(self.meta.current_term) {
                continue;
            }
            if self.config.has_quorum(self.id, self_match, &matches, index) {
                candidate = index;
            }
        }

        if candidate > self.meta.commit_index {
            self.update_committed(candidate, tick);
        }
    }

    fn update_committed(&mut self, new_commit_index: LogIndex, tick: &mut Tick) {
        self.meta.commit_index = new_commit_index;
        tick.must_persist_meta = true;
        if self.config.commit(new_commit_index) {
            tick.must_persist_config = true;
        }
    }

    // ---- proposing entries -------------------------------------------------

    fn propose_entry(&mut self, data: LogEntryData, tick: &mut Tick) -> Result<LogPosition> {
        if !self.is_leader() {
            return Err(RaftError::NotALeader {
                leader_hint: self.leader_hint(),
            });
        }
        let index = self.log.last_index().unwrap_or(0) + 1;
        let entry = LogEntry {
            term: self.meta.current_term,
            index,
            data,
        };
        if let LogEntryData::Configuration(_) = &entry.data {
            self.config.apply(&entry, self.meta.commit_index);
            tick.must_persist_config = true;
        }
        self.log.append(entry.clone());
        // A lone voter (or a leader that already holds a quorum of
        // match_index without needing a fresh ack) can commit its own
        // entry immediately rather than waiting on the next
        // `append_entries_callback`.
        self.advance_commit_index(tick);
        Ok(LogPosition {
            term: entry.term,
            index: entry.index,
        })
    }

    pub fn propose_command(&mut self, data: bytes::Bytes, tick: &mut Tick) -> Result<LogPosition> {
        if self.log_len() >= self.max_log_size {
            return Err(RaftError::LogFull);
        }
        let pos = self.propose_entry(LogEntryData::Command(data), tick)?;
        self.replicate_entries(tick);
        Ok(pos)
    }

    pub fn propose_noop(&mut self, tick: &mut Tick) -> Result<LogPosition> {
        let pos = self.propose_entry(LogEntryData::Dummy, tick)?;
        self.replicate_entries(tick);
        Ok(pos)
    }

    /// Proposes a full configuration change. The caller is expected to have
    /// already folded the desired membership delta into a `Joint { old, new
    /// }` payload; a second, server-driven call finalizes it to `Simple`
    /// once the joint entry commits (the Open Question decision recorded
    /// alongside the expanded spec).
    pub fn propose_configuration(
        &mut self,
        data: ConfigurationData,
        tick: &mut Tick,
    ) -> Result<LogPosition> {
        if self.config.pending.is_some() {
            return Err(RaftError::ConfChangeInProgress);
        }
        let pos = self.propose_entry(LogEntryData::Configuration(data), tick)?;
        if let ServerState::Leader(leader) = &mut self.state {
            let last_index = self.log.last_index().unwrap_or(0);
            let self_id = self.id;
            for peer in self.config.iter() {
                if peer != self_id {
                    leader
                        .servers
                        .entry(peer)
                        .or_insert_with(|| ServerProgress::new(last_index));
                }
            }
            let voting_ids: std::collections::HashSet<ServerId> = self.config.iter().into_iter().collect();
            leader.servers.retain(|id, _| voting_ids.contains(id));
        }
        self.replicate_entries(tick);
        Ok(pos)
    }

    /// Called by the server loop once the joint entry proposed above has
    /// committed, to append the finalizing `Simple(new)` entry.
    pub fn finalize_configuration(&mut self, tick: &mut Tick) -> Result<Option<LogPosition>> {
        if !self.is_leader() {
            return Err(RaftError::NotALeader {
                leader_hint: self.leader_hint(),
            });
        }
        let ConfigurationData::Joint { new, .. } = &self.config.value else {
            return Ok(None);
        };
        let new = new.clone();
        let _ = self.propose_entry(LogEntryData::Configuration(ConfigurationData::Simple(new)), tick)?;
        // A trailing dummy entry after C_new so the caller has a concrete
        // commit-time signal distinct from the configuration entry's own
        // apply-on-append semantics.
        let pos = self.propose_entry(LogEntryData::Dummy, tick)?;
        self.replicate_entries(tick);
        Ok(Some(pos))
    }

    // ---- snapshotting -------------------------------------------------------

    /// Called by the server loop once it has obtained `desc` (either freshly
    /// taken or already cached) for a follower the previous `cycle()`
    /// reported in `Tick::snapshot_needed_for`.
    pub fn send_snapshot(&mut self, peer: ServerId, desc: SnapshotDescriptor, tick: &mut Tick) {
        self.last_snapshot = desc.clone();
        tick.messages.push(Message {
            to: vec![peer],
            body: MessageBody::InstallSnapshot(InstallSnapshotRequest {
                term: self.meta.current_term,
                leader_id: self.id,
                last_included_index: desc.last_included_index,
                last_included_term: desc.last_included_term,
                last_included_configuration: desc.last_included_configuration,
                offset: 0,
                data: desc.handle.0,
                done: true,
            }),
        });
    }

    pub fn install_snapshot_callback(
        &mut self,
        peer: ServerId,
        resp: InstallSnapshotResponse,
        tick: &mut Tick,
    ) {
        if self.observe_term(resp.term, tick) {
            return;
        }
        let last_included_index = self.last_snapshot.last_included_index;
        let ServerState::Leader(leader) = &mut self.state else {
            return;
        };
        if let Some(progress) = leader.servers.get_mut(&peer) {
            progress.request_pending = false;
            progress.snapshot = None;
            progress.match_index = progress.match_index.max(last_included_index);
            progress.next_index = progress.match_index + 1;
        }
        self.replicate_entries(tick);
    }

    /// Follower side: replaces the local log/config state wholesale with
    /// the snapshot's. The server loop is responsible for handing the
    /// embedded bytes to `state_machine::load_snapshot` and persisting the
    /// descriptor; this call only updates the consensus-visible metadata.
    pub fn install_snapshot(
        &mut self,
        req: InstallSnapshotRequest,
        tick: &mut Tick,
    ) -> Result<InstallSnapshotResponse> {
        self.observe_term(req.term, tick);

        if req.term < self.meta.current_term {
            return Ok(InstallSnapshotResponse {
                term: self.meta.current_term,
            });
        }

        if let ServerState::Follower(f) = &mut self.state {
            f.last_heartbeat = self.clock.now();
            f.last_leader_id = Some(req.leader_id);
        }

        if req.done {
            self.log.truncate_prefix(req.last_included_index + 1);
            self.config = ConfigurationStateMachine::from(ConfigurationSnapshot {
                last_applied: req.last_included_index,
                data: req.last_included_configuration.clone(),
            });
            self.meta.commit_index = self.meta.commit_index.max(req.last_included_index);
            self.last_applied = self.last_applied.max(req.last_included_index);
            self.last_snapshot = SnapshotDescriptor {
                last_included_index: req.last_included_index,
                last_included_term: req.last_included_term,
                last_included_configuration: req.last_included_configuration,
                handle: crate::snapshot::SnapshotHandle(req.data),
            };
            tick.must_persist_meta = true;
            tick.must_persist_config = true;
        }

        Ok(InstallSnapshotResponse {
            term: self.meta.current_term,
        })
    }

    // ---- read barrier -------------------------------------------------------

    pub fn start_read_barrier(&mut self, tick: &mut Tick) -> Result<ReadBarrierToken> {
        if !self.is_leader() {
            return Err(RaftError::NotALeader {
                leader_hint: self.leader_hint(),
            });
        }
        let index = self.meta.commit_index;
        let self_id = self.id;
        let current_term = self.meta.current_term;
        let ServerState::Leader(leader) = &mut self.state else {
            unreachable!()
        };
        leader.read_index_generation += 1;
        let generation = leader.read_index_generation;
        leader.read_index_acks.insert(generation, {
            let mut s = std::collections::HashSet::new();
            s.insert(self_id);
            s
        });

        let req = ReadIndexRequest {
            term: current_term,
            generation,
        };
        for peer in self.config.iter() {
            if peer != self_id {
                tick.messages.push(Message {
                    to: vec![peer],
                    body: MessageBody::ReadIndex(req.clone()),
                });
            }
        }
        Ok(ReadBarrierToken { generation, index })
    }

    pub fn read_index_request(&self, req: &ReadIndexRequest) -> ReadIndexResponse {
        ReadIndexResponse {
            term: self.meta.current_term,
            generation: req.generation,
        }
    }

    /// Returns `true` once a quorum of acks for `resp.generation` have
    /// arrived (the server loop still separately needs `commit_index >=
    /// token.index` before the barrier is actually satisfied).
    pub fn read_index_callback(
        &mut self,
        peer: ServerId,
        resp: ReadIndexResponse,
        tick: &mut Tick,
    ) -> bool {
        if self.observe_term(resp.term, tick) {
            return false;
        }
        let ServerState::Leader(leader) = &mut self.state else {
            return false;
        };
        let Some(acks) = leader.read_index_acks.get_mut(&resp.generation) else {
            return false;
        };
        acks.insert(peer);
        let acks = acks.clone();
        self.has_vote_quorum(&acks)
    }

    // ---- stepdown / leadership transfer --------------------------------------

    /// Begins stepping down: marks the leader state so no new proposals are
    /// accepted, and once the most up-to-date follower is found, sends it
    /// `TimeoutNow` so it can seize leadership without waiting out a full
    /// election timeout.
    pub fn stepdown(&mut self, tick: &mut Tick) -> Result<()> {
        let last_index = self.log.last_index().unwrap_or(0);
        let current_term = self.meta.current_term;
        let ServerState::Leader(leader) = &mut self.state else {
            return Err(RaftError::NotALeader {
                leader_hint: self.leader_hint(),
            });
        };
        leader.stepping_down = true;

        let best = leader
            .servers
            .iter()
            .find(|(_, p)| p.match_index == last_index)
            .map(|(id, _)| *id);

        if let Some(peer) = best {
            tick.messages.push(Message {
                to: vec![peer],
                body: MessageBody::TimeoutNow(TimeoutNow { term: current_term }),
            });
        }
        Ok(())
    }

    pub fn is_stepping_down(&self) -> bool {
        matches!(&self.state, ServerState::Leader(l) if l.stepping_down)
    }

    pub fn timeout_now(&mut self, req: TimeoutNow, tick: &mut Tick) {
        if req.term < self.meta.current_term {
            return;
        }
        self.observe_term(req.term, tick);
        // Skip the randomized backoff entirely: act as if our election
        // timeout had already elapsed.
        self.perform_election(tick);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SimClock;
    use crate::config::ConfigurationStateMachine;
    use crate::log::MemoryLog;
    use crate::proto::{Configuration, ConfigurationData, ConfigurationSnapshot, ServerDescriptor, ServerSet};
    use uuid::Uuid;

    fn single_node_module() -> (ConsensusModule, Arc<SimClock>) {
        let id = Uuid::new_v4();
        let mut members = HashMap::new();
        members.insert(
            id,
            ServerDescriptor {
                id,
                address: "self".into(),
            },
        );
        let config = ConfigurationStateMachine::from(ConfigurationSnapshot {
            last_applied: 0,
            data: ConfigurationData::Simple(Configuration {
                servers: ServerSet {
                    members,
                    learners: HashMap::new(),
                },
            }),
        });
        let clock = Arc::new(SimClock::new());
        let module = ConsensusModule::new(
            id,
            Metadata::default(),
            Arc::new(MemoryLog::new()),
            config,
            clock.clone(),
            RaftConfig::default(),
        );
        (module, clock)
    }

    #[test]
    fn lone_voter_becomes_leader_on_timeout() {
        let (mut module, clock) = single_node_module();
        clock.advance(Duration::from_secs(1));
        let mut tick = Tick::default();
        module.cycle(&mut tick);
        assert_eq!(module.role(), Role::Leader);
    }

    #[test]
    fn leader_commits_its_own_noop_entry() {
        let (mut module, clock) = single_node_module();
        clock.advance(Duration::from_secs(1));
        let mut tick = Tick::default();
        module.cycle(&mut tick);
        assert_eq!(module.commit_index(), 1);
    }

    #[test]
    fn append_entries_rejects_stale_term() {
        let (mut module, _clock) = single_node_module();
        let mut tick = Tick::default();
        let leader_id = Uuid::new_v4();
        let resp = module
            .append_entries(
                AppendEntriesRequest {
                    term: 0,
                    leader_id,
                    prev_log_index: 0,
                    prev_log_term: 0,
                    entries: vec![],
                    leader_commit: 0,
                },
                &mut tick,
            )
            .unwrap()
            .into_inner();
        // term 0 == current_term 0, so not rejected for staleness, but
        // accepted as a heartbeat with no entries.
        assert!(resp.success);
    }

    #[test]
    fn propose_command_requires_leadership() {
        let (mut module, _clock) = single_node_module();
        let mut tick = Tick::default();
        let err = module
            .propose_command(bytes::Bytes::from_static(b"x"), &mut tick)
            .unwrap_err();
        assert!(matches!(err, RaftError::NotALeader { .. }));
    }
}
