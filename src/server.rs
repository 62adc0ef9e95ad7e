//! The Server Loop (§2, §4.2): owns the `ConsensusModule` exclusively inside
//! a single `tokio` task, drains an inbound event channel, and dispatches
//! every `Tick` it produces to the `rpc`/`persistence`/`state_machine`
//! collaborators. Grounded on the teacher's split between `ConsensusModule`
//! (decision) and an external driver that actually calls the network/disk —
//! the teacher's driver lived in `main.rs`'s `run_tick` loop; here it is its
//! own module since the demo binary is no longer the only consumer.

use crate::clock::Clock;
use crate::config::ConfigurationStateMachine;
use crate::consensus::{ConsensusModule, Tick};
use crate::error::{RaftError, Result};
use crate::failure_detector::FailureDetector;
use crate::log::LogStorage;
use crate::persistence::Persistence;
use crate::promise::{PendingProposals, WaitType};
use crate::proto::*;
use crate::rpc::RpcClient;
use crate::settings::RaftConfig;
use crate::snapshot::{self, SnapshotDescriptor};
use crate::state_machine::StateMachine;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, trace, warn};

enum Event {
    AddEntry(bytes::Bytes, WaitType, oneshot::Sender<Result<LogPosition>>),
    SetConfiguration(Configuration, oneshot::Sender<Result<()>>),
    ReadBarrier(oneshot::Sender<Result<()>>),
    Stepdown(oneshot::Sender<Result<()>>),
    Inbound(ServerId, MessageBody),
    CurrentTerm(oneshot::Sender<Term>),
    IsLeader(oneshot::Sender<bool>),
    GetConfiguration(oneshot::Sender<ConfigurationSnapshot>),
    Abort,
}

/// Handle to a running server loop. Cloneable; every clone talks to the
/// same background task over the same channel.
#[derive(Clone)]
pub struct Server {
    tx: mpsc::UnboundedSender<Event>,
}

struct Collaborators {
    rpc: Arc<dyn RpcClient>,
    persistence: Arc<dyn Persistence>,
    state_machine: Arc<dyn StateMachine>,
    failure_detector: Arc<dyn FailureDetector>,
}

impl Server {
    /// Spawns the server loop and returns a handle to it. `meta` and
    /// `config_snapshot` should be whatever was last persisted (or their
    /// `Default`s, for a brand-new server whose configuration will arrive
    /// via the first `set_configuration` call or a replicated entry).
    pub fn start(
        id: ServerId,
        meta: Metadata,
        log: Arc<dyn LogStorage>,
        config_snapshot: ConfigurationSnapshot,
        clock: Arc<dyn Clock>,
        rpc: Arc<dyn RpcClient>,
        persistence: Arc<dyn Persistence>,
        state_machine: Arc<dyn StateMachine>,
        failure_detector: Arc<dyn FailureDetector>,
        raft_config: RaftConfig,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let consensus = ConsensusModule::new(
            id,
            meta,
            log,
            ConfigurationStateMachine::from(config_snapshot),
            clock,
            raft_config.clone(),
        );
        let collaborators = Collaborators {
            rpc,
            persistence,
            state_machine,
            failure_detector,
        };
        tokio::spawn(run(consensus, rx, collaborators, raft_config));
        Server { tx }
    }

    pub async fn add_entry(&self, command: bytes::Bytes, wait: WaitType) -> Result<LogPosition> {
        let (respond, rx) = oneshot::channel();
        self.tx
            .send(Event::AddEntry(command, wait, respond))
            .map_err(|_| RaftError::Stopped)?;
        rx.await.map_err(|_| RaftError::Stopped)?
    }

    pub async fn set_configuration(&self, new: Configuration) -> Result<()> {
        let (respond, rx) = oneshot::channel();
        self.tx
            .send(Event::SetConfiguration(new, respond))
            .map_err(|_| RaftError::Stopped)?;
        rx.await.map_err(|_| RaftError::Stopped)?
    }

    pub async fn read_barrier(&self) -> Result<()> {
        let (respond, rx) = oneshot::channel();
        self.tx
            .send(Event::ReadBarrier(respond))
            .map_err(|_| RaftError::Stopped)?;
        rx.await.map_err(|_| RaftError::Stopped)?
    }

    pub async fn stepdown(&self) -> Result<()> {
        let (respond, rx) = oneshot::channel();
        self.tx
            .send(Event::Stepdown(respond))
            .map_err(|_| RaftError::Stopped)?;
        rx.await.map_err(|_| RaftError::Stopped)?
    }

    /// Delivers an inbound message from `from`, whether a request or a
    /// response, into the server loop. The concrete transport adapter calls
    /// this for everything it receives off the wire.
    pub fn deliver(&self, from: ServerId, body: MessageBody) {
        let _ = self.tx.send(Event::Inbound(from, body));
    }

    pub async fn current_term(&self) -> Result<Term> {
        let (respond, rx) = oneshot::channel();
        self.tx
            .send(Event::CurrentTerm(respond))
            .map_err(|_| RaftError::Stopped)?;
        rx.await.map_err(|_| RaftError::Stopped)
    }

    pub async fn is_leader(&self) -> Result<bool> {
        let (respond, rx) = oneshot::channel();
        self.tx
            .send(Event::IsLeader(respond))
            .map_err(|_| RaftError::Stopped)?;
        rx.await.map_err(|_| RaftError::Stopped)
    }

    pub async fn configuration(&self) -> Result<ConfigurationSnapshot> {
        let (respond, rx) = oneshot::channel();
        self.tx
            .send(Event::GetConfiguration(respond))
            .map_err(|_| RaftError::Stopped)?;
        rx.await.map_err(|_| RaftError::Stopped)
    }

    pub fn abort(&self) {
        let _ = self.tx.send(Event::Abort);
    }
}

struct LoopState {
    pending: PendingProposals,
    config_waiters: Vec<oneshot::Sender<Result<()>>>,
    finalize_in_flight: bool,
    /// Index of the trailing dummy entry appended after C_new by
    /// `finalize_configuration`; `config_waiters` resolve once this commits,
    /// not merely once the configuration value becomes `Simple` (which
    /// happens on append, ahead of commit).
    finalize_dummy_index: Option<LogIndex>,
    last_snapshot_index: LogIndex,
    read_barriers: Vec<(crate::consensus::ReadBarrierToken, oneshot::Sender<Result<()>>)>,
    acked_generations: std::collections::HashSet<u64>,
}

async fn run(
    mut consensus: ConsensusModule,
    mut rx: mpsc::UnboundedReceiver<Event>,
    collab: Collaborators,
    raft_config: RaftConfig,
) {
    let mut state = LoopState {
        pending: PendingProposals::new(),
        config_waiters: Vec::new(),
        finalize_in_flight: false,
        finalize_dummy_index: None,
        last_snapshot_index: 0,
        read_barriers: Vec::new(),
        acked_generations: std::collections::HashSet::new(),
    };

    // Startup replay: the persisted log may hold entries already known
    // committed (per `meta.commit_index`) that the state machine handed to
    // `Server::start` has never seen, e.g. after a restart. Catch it up
    // before accepting any events.
    let commit_index = consensus.commit_index();
    apply_committed(&mut consensus, &collab, &mut state, commit_index, &raft_config).await;

    let mut next_tick = tokio::time::Duration::from_millis(raft_config.heartbeat_interval_ms);

    loop {
        tokio::select! {
            maybe_event = rx.recv() => {
                match maybe_event {
                    None => break,
                    Some(Event::Abort) => {
                        state.pending.fail_all(RaftError::Stopped);
                        for w in state.config_waiters.drain(..) {
                            let _ = w.send(Err(RaftError::Stopped));
                        }
                        for (_, w) in state.read_barriers.drain(..) {
                            let _ = w.send(Err(RaftError::Stopped));
                        }
                        break;
                    }
                    Some(event) => {
                        let mut tick = Tick::default();
                        handle_event(&mut consensus, event, &mut tick, &mut state, &raft_config);
                        dispatch(&mut consensus, tick, &collab, &mut state, &raft_config).await;
                    }
                }
            }
            _ = tokio::time::sleep(next_tick) => {
                let mut tick = Tick::default();
                consensus.cycle(&mut tick);
                dispatch(&mut consensus, tick, &collab, &mut state, &raft_config).await;
            }
        }

        next_tick = next_tick_duration(&raft_config);
    }
}

fn next_tick_duration(cfg: &RaftConfig) -> tokio::time::Duration {
    tokio::time::Duration::from_millis(cfg.heartbeat_interval_ms)
}

fn handle_event(
    consensus: &mut ConsensusModule,
    event: Event,
    tick: &mut Tick,
    state: &mut LoopState,
    _raft_config: &RaftConfig,
) {
    match event {
        Event::AddEntry(command, wait, respond) => match consensus.propose_command(command, tick) {
            Ok(pos) => {
                let rx = state.pending.register(pos.term, pos.index, wait);
                tokio::spawn(async move {
                    let result = rx.await.unwrap_or(Err(RaftError::Stopped));
                    let _ = respond.send(result.map(|_| pos));
                });
            }
            Err(e) => {
                let _ = respond.send(Err(e));
            }
        },
        Event::SetConfiguration(new, respond) => {
            let ConfigurationSnapshotRef { data, .. } = consensus.configuration();
            let old = match data {
                ConfigurationData::Simple(c) => c.clone(),
                ConfigurationData::Joint { .. } => {
                    let _ = respond.send(Err(RaftError::ConfChangeInProgress));
                    return;
                }
            };
            match consensus.propose_configuration(ConfigurationData::Joint { old, new }, tick) {
                Ok(_) => state.config_waiters.push(respond),
                Err(e) => {
                    let _ = respond.send(Err(e));
                }
            }
        }
        Event::ReadBarrier(respond) => match consensus.start_read_barrier(tick) {
            Ok(token) => state.read_barriers.push((token, respond)),
            Err(e) => {
                let _ = respond.send(Err(e));
            }
        },
        Event::Stepdown(respond) => {
            let _ = respond.send(consensus.stepdown(tick));
        }
        Event::Inbound(from, body) => handle_inbound(consensus, from, body, tick, state),
        Event::CurrentTerm(respond) => {
            let _ = respond.send(consensus.current_term());
        }
        Event::IsLeader(respond) => {
            let _ = respond.send(consensus.is_leader());
        }
        Event::GetConfiguration(respond) => {
            let ConfigurationSnapshotRef { last_applied, data } = consensus.configuration();
            let _ = respond.send(ConfigurationSnapshot {
                last_applied,
                data: data.clone(),
            });
        }
        Event::Abort => unreachable!("handled by caller"),
    }
}

fn handle_inbound(
    consensus: &mut ConsensusModule,
    from: ServerId,
    body: MessageBody,
    tick: &mut Tick,
    state: &mut LoopState,
) {
    match body {
        MessageBody::PreVoteRequest(req) => {
            let resp = consensus.pre_vote(&req);
            tick.messages.push(Message {
                to: vec![from],
                body: MessageBody::PreVoteResponse(resp),
            });
        }
        MessageBody::PreVoteResponse(resp) => consensus.pre_vote_callback(from, resp, tick),
        MessageBody::RequestVote(req) => {
            let resp = consensus.request_vote(&req, tick);
            tick.messages.push(Message {
                to: vec![from],
                body: MessageBody::RequestVoteResponse(resp),
            });
        }
        MessageBody::RequestVoteResponse(resp) => consensus.request_vote_callback(from, resp, tick),
        MessageBody::AppendEntries(req, _last_index) => match consensus.append_entries(req, tick) {
            Ok(constraint) => {
                tick.messages.push(Message {
                    to: vec![from],
                    body: MessageBody::AppendEntriesResponse(constraint.into_inner()),
                });
            }
            Err(e) => warn!(error = %e, "rejecting malformed append_entries"),
        },
        MessageBody::AppendEntriesResponse(resp) => consensus.append_entries_callback(from, resp, tick),
        MessageBody::InstallSnapshot(req) => match consensus.install_snapshot(req, tick) {
            Ok(resp) => tick.messages.push(Message {
                to: vec![from],
                body: MessageBody::InstallSnapshotResponse(resp),
            }),
            Err(e) => warn!(error = %e, "rejecting malformed install_snapshot"),
        },
        MessageBody::InstallSnapshotResponse(resp) => {
            consensus.install_snapshot_callback(from, resp, tick)
        }
        MessageBody::TimeoutNow(req) => consensus.timeout_now(req, tick),
        MessageBody::ReadIndex(req) => {
            let resp = consensus.read_index_request(&req);
            tick.messages.push(Message {
                to: vec![from],
                body: MessageBody::ReadIndexResponse(resp),
            });
        }
        MessageBody::ReadIndexResponse(resp) => {
            let generation = resp.generation;
            if consensus.read_index_callback(from, resp, tick) {
                state.acked_generations.insert(generation);
            }
        }
    }
}

async fn dispatch(
    consensus: &mut ConsensusModule,
    tick: Tick,
    collab: &Collaborators,
    state: &mut LoopState,
    raft_config: &RaftConfig,
) {
    let commit_before = consensus.commit_index();

    if tick.must_persist_meta {
        trace!(term = consensus.current_term(), "persisting term/vote");
        if let Err(e) = collab
            .persistence
            .store_term_vote(consensus.current_term(), consensus.voted_for())
            .await
        {
            warn!(error = %e, "failed to persist term/vote");
        }
    }

    for msg in tick.messages {
        for peer in &msg.to {
            collab
                .rpc
                .send(Message {
                    to: vec![*peer],
                    body: msg.body.clone(),
                })
                .await;
        }
    }

    for peer in tick.snapshot_needed_for {
        let desc = take_or_reuse_snapshot(consensus, collab, state, raft_config).await;
        let mut follow_up = Tick::default();
        consensus.send_snapshot(peer, desc, &mut follow_up);
        for msg in follow_up.messages {
            for target in &msg.to {
                collab
                    .rpc
                    .send(Message {
                        to: vec![*target],
                        body: msg.body.clone(),
                    })
                    .await;
            }
        }
    }

    let commit_after = consensus.commit_index();
    if commit_after > commit_before {
        state
            .pending
            .advance_committed(log_storage(consensus), commit_after);
        apply_committed(consensus, collab, state, commit_after, raft_config).await;

        if consensus.configuration_awaits_finalization() && !state.finalize_in_flight {
            let mut follow_up = Tick::default();
            if let Ok(Some(pos)) = consensus.finalize_configuration(&mut follow_up) {
                state.finalize_in_flight = true;
                state.finalize_dummy_index = Some(pos.index);
            }
            for msg in follow_up.messages {
                collab.rpc.send(msg).await;
            }
        }
    }

    if state.finalize_in_flight
        && !consensus.configuration_awaits_finalization()
        && matches!(consensus.configuration().data, ConfigurationData::Simple(_))
        && state
            .finalize_dummy_index
            .is_some_and(|index| commit_after >= index)
    {
        state.finalize_in_flight = false;
        state.finalize_dummy_index = None;
        for w in state.config_waiters.drain(..) {
            let _ = w.send(Ok(()));
        }
    }

    resolve_read_barriers(state, consensus.last_applied());

    let _ = collab.failure_detector.is_alive(consensus.id());
}

async fn apply_committed(
    consensus: &mut ConsensusModule,
    collab: &Collaborators,
    state: &mut LoopState,
    commit_index: LogIndex,
    raft_config: &RaftConfig,
) {
    let last_applied = consensus.last_applied();
    if commit_index <= last_applied {
        return;
    }

    // Applying isn't exposed on `LogStorage` directly here, so the loop
    // reaches into entries one at a time; a production `LogStorage` would
    // batch this.
    let mut to_apply = Vec::new();
    for index in (last_applied + 1)..=commit_index {
        if let Some(entry) = consensus_entry(consensus, index) {
            to_apply.push(entry);
        }
    }

    if !to_apply.is_empty() {
        if let Err(e) = collab.state_machine.apply(&to_apply).await {
            warn!(error = %e, "state machine failed to apply committed entries");
            return;
        }
    }

    consensus.set_last_applied(commit_index);
    state.pending.advance_applied(log_storage(consensus), commit_index);
    debug!(last_applied = commit_index, "advanced last_applied");

    if snapshot::should_snapshot(commit_index, state.last_snapshot_index, raft_config.snapshot_threshold) {
        if let Ok(handle) = collab.state_machine.take_snapshot().await {
            let ConfigurationSnapshotRef { data, .. } = consensus.configuration();
            let desc = SnapshotDescriptor {
                last_included_index: commit_index,
                last_included_term: consensus.current_term(),
                last_included_configuration: data.clone(),
                handle,
            };
            if let Err(e) = collab.persistence.store_snapshot(&desc).await {
                warn!(error = %e, "failed to persist snapshot descriptor");
            }
            consensus.note_snapshot(desc);
            let truncate_to = snapshot::truncation_point(commit_index, raft_config.snapshot_trailing);
            log_storage(consensus).truncate_prefix(truncate_to);
            state.last_snapshot_index = commit_index;
            info!(index = commit_index, "took snapshot and truncated log");
        }
    }
}

fn consensus_entry(consensus: &ConsensusModule, index: LogIndex) -> Option<LogEntry> {
    log_storage(consensus).entry(index).map(|e| (*e).clone())
}

fn log_storage(consensus: &ConsensusModule) -> &dyn LogStorage {
    consensus.log_storage()
}

async fn take_or_reuse_snapshot(
    consensus: &mut ConsensusModule,
    collab: &Collaborators,
    state: &mut LoopState,
    _raft_config: &RaftConfig,
) -> SnapshotDescriptor {
    if let Ok(handle) = collab.state_machine.take_snapshot().await {
        let ConfigurationSnapshotRef { data, .. } = consensus.configuration();
        let desc = SnapshotDescriptor {
            last_included_index: consensus.last_applied(),
            last_included_term: consensus.current_term(),
            last_included_configuration: data.clone(),
            handle,
        };
        state.last_snapshot_index = consensus.last_applied();
        desc
    } else {
        SnapshotDescriptor::none()
    }
}

fn resolve_read_barriers(state: &mut LoopState, last_applied: LogIndex) {
    let acked = state.acked_generations.clone();
    let (ready, pending): (Vec<_>, Vec<_>) = state
        .read_barriers
        .drain(..)
        .partition(|(token, _)| last_applied >= token.index && acked.contains(&token.generation));
    state.read_barriers = pending;
    for generation in ready.iter().map(|(t, _)| t.generation) {
        state.acked_generations.remove(&generation);
    }
    for (_, respond) in ready {
        let _ = respond.send(Ok(()));
    }
}
