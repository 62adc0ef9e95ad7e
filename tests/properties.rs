//! Property tests for the core consensus invariants, driven by a tiny
//! synchronous cluster simulator built directly on `ConsensusModule` (no
//! `Server`/tokio involved — `cycle()` and the RPC handlers are pure, so a
//! proptest-driven sequence of "advance this node's clock" / "deliver this
//! queued message" / "propose a command on the current leader" steps is
//! enough to exercise them deterministically).

use proptest::prelude::*;
use raft::clock::SimClock;
use raft::consensus::{ConsensusModule, Tick};
use raft::config::ConfigurationStateMachine;
use raft::log::MemoryLog;
use raft::settings::RaftConfig;
use raft::proto::{
    Configuration, ConfigurationData, ConfigurationSnapshot, LogIndex, Message, MessageBody,
    Metadata, ServerDescriptor, ServerId, ServerSet, Term,
};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

struct SimCluster {
    ids: Vec<ServerId>,
    nodes: HashMap<ServerId, ConsensusModule>,
    clocks: HashMap<ServerId, Arc<SimClock>>,
    queues: HashMap<ServerId, VecDeque<(ServerId, MessageBody)>>,
}

impl SimCluster {
    fn new(n: usize) -> Self {
        let ids: Vec<ServerId> = (0..n).map(|_| Uuid::new_v4()).collect();
        let mut members = HashMap::new();
        for (i, id) in ids.iter().enumerate() {
            members.insert(
                *id,
                ServerDescriptor {
                    id: *id,
                    address: format!("n{i}"),
                },
            );
        }
        let config_snapshot = ConfigurationSnapshot {
            last_applied: 0,
            data: ConfigurationData::Simple(Configuration {
                servers: ServerSet {
                    members,
                    learners: HashMap::new(),
                },
            }),
        };

        let mut nodes = HashMap::new();
        let mut clocks = HashMap::new();
        let mut queues = HashMap::new();
        for id in &ids {
            let clock = Arc::new(SimClock::new());
            let module = ConsensusModule::new(
                *id,
                Metadata::default(),
                Arc::new(MemoryLog::new()),
                ConfigurationStateMachine::from(config_snapshot.clone()),
                clock.clone(),
                RaftConfig::default(),
            );
            nodes.insert(*id, module);
            clocks.insert(*id, clock);
            queues.insert(*id, VecDeque::new());
        }

        SimCluster {
            ids,
            nodes,
            clocks,
            queues,
        }
    }

    fn route(&mut self, from: ServerId, tick: Tick) {
        for msg in tick.messages {
            for to in &msg.to {
                self.queues
                    .get_mut(to)
                    .unwrap()
                    .push_back((from, msg.body.clone()));
            }
        }
    }

    fn advance_clock(&mut self, id: ServerId, dur: Duration) {
        self.clocks[&id].advance(dur);
        let mut tick = Tick::default();
        self.nodes.get_mut(&id).unwrap().cycle(&mut tick);
        self.route(id, tick);
    }

    /// Pops and delivers the oldest queued message at `id`, if any.
    fn deliver_one(&mut self, id: ServerId) {
        let Some((from, body)) = self.queues.get_mut(&id).unwrap().pop_front() else {
            return;
        };
        let mut tick = Tick::default();
        let node = self.nodes.get_mut(&id).unwrap();
        let reply: Option<MessageBody> = match body {
            MessageBody::PreVoteRequest(req) => Some(MessageBody::PreVoteResponse(node.pre_vote(&req))),
            MessageBody::PreVoteResponse(resp) => {
                node.pre_vote_callback(from, resp, &mut tick);
                None
            }
            MessageBody::RequestVote(req) => {
                Some(MessageBody::RequestVoteResponse(node.request_vote(&req, &mut tick)))
            }
            MessageBody::RequestVoteResponse(resp) => {
                node.request_vote_callback(from, resp, &mut tick);
                None
            }
            MessageBody::AppendEntries(req, _) => match node.append_entries(req, &mut tick) {
                Ok(constraint) => Some(MessageBody::AppendEntriesResponse(constraint.into_inner())),
                Err(_) => None,
            },
            MessageBody::AppendEntriesResponse(resp) => {
                node.append_entries_callback(from, resp, &mut tick);
                None
            }
            // Snapshotting, read-barrier and stepdown are not exercised by
            // this random walk; any such message is simply dropped.
            _ => None,
        };

        if let Some(body) = reply {
            tick.messages.push(Message { to: vec![from], body });
        }
        self.route(id, tick);
    }

    fn propose_on_leader(&mut self, value: u8) {
        let Some(leader_id) = self.ids.iter().copied().find(|id| self.nodes[id].is_leader()) else {
            return;
        };
        let mut tick = Tick::default();
        let node = self.nodes.get_mut(&leader_id).unwrap();
        let _ = node.propose_command(bytes::Bytes::from(vec![value]), &mut tick);
        self.route(leader_id, tick);
    }

    fn leaders_in_term(&self, term: Term) -> usize {
        self.ids
            .iter()
            .filter(|id| self.nodes[*id].is_leader() && self.nodes[*id].current_term() == term)
            .count()
    }

    fn max_term(&self) -> Term {
        self.ids.iter().map(|id| self.nodes[id].current_term()).max().unwrap_or(0)
    }

    fn commit_index(&self, id: ServerId) -> LogIndex {
        self.nodes[&id].commit_index()
    }
}

#[derive(Debug, Clone, Copy)]
enum Step {
    AdvanceClock(u8, u16),
    Deliver(u8),
    Propose(u8),
}

fn step_strategy() -> impl Strategy<Value = Step> {
    prop_oneof![
        (0u8..3, 100u16..900).prop_map(|(n, ms)| Step::AdvanceClock(n, ms)),
        (0u8..3).prop_map(Step::Deliver),
        any::<u8>().prop_map(Step::Propose),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Election Safety: at no point do two nodes believe themselves leader
    /// in the same term.
    #[test]
    fn election_safety(steps in prop::collection::vec(step_strategy(), 1..200)) {
        let mut cluster = SimCluster::new(3);
        for step in steps {
            match step {
                Step::AdvanceClock(n, ms) => {
                    let id = cluster.ids[n as usize % cluster.ids.len()];
                    cluster.advance_clock(id, Duration::from_millis(ms as u64));
                }
                Step::Deliver(n) => {
                    let id = cluster.ids[n as usize % cluster.ids.len()];
                    cluster.deliver_one(id);
                }
                Step::Propose(v) => cluster.propose_on_leader(v),
            }
            let max_term = cluster.max_term();
            for term in 0..=max_term {
                prop_assert!(cluster.leaders_in_term(term) <= 1);
            }
        }
    }

    /// Monotonicity: commit_index never decreases for any single node.
    #[test]
    fn commit_index_is_monotonic(steps in prop::collection::vec(step_strategy(), 1..200)) {
        let mut cluster = SimCluster::new(3);
        let mut last: HashMap<ServerId, LogIndex> = cluster.ids.iter().map(|id| (*id, 0)).collect();
        for step in steps {
            match step {
                Step::AdvanceClock(n, ms) => {
                    let id = cluster.ids[n as usize % cluster.ids.len()];
                    cluster.advance_clock(id, Duration::from_millis(ms as u64));
                }
                Step::Deliver(n) => {
                    let id = cluster.ids[n as usize % cluster.ids.len()];
                    cluster.deliver_one(id);
                }
                Step::Propose(v) => cluster.propose_on_leader(v),
            }
            for id in cluster.ids.clone() {
                let now = cluster.commit_index(id);
                prop_assert!(now >= last[&id]);
                last.insert(id, now);
            }
        }
    }

    /// Log Matching: if two nodes' logs have an entry with the same index
    /// and term, every entry at a lower index is identical between them.
    #[test]
    fn log_matching_holds(steps in prop::collection::vec(step_strategy(), 1..200)) {
        let mut cluster = SimCluster::new(3);
        for step in steps {
            match step {
                Step::AdvanceClock(n, ms) => {
                    let id = cluster.ids[n as usize % cluster.ids.len()];
                    cluster.advance_clock(id, Duration::from_millis(ms as u64));
                }
                Step::Deliver(n) => {
                    let id = cluster.ids[n as usize % cluster.ids.len()];
                    cluster.deliver_one(id);
                }
                Step::Propose(v) => cluster.propose_on_leader(v),
            }
        }

        for a in &cluster.ids {
            for b in &cluster.ids {
                if a == b {
                    continue;
                }
                let log_a = cluster.nodes[a].log_storage();
                let log_b = cluster.nodes[b].log_storage();
                let last = log_a.last_index().unwrap_or(0).min(log_b.last_index().unwrap_or(0));
                let mut diverged_at = None;
                for index in 1..=last {
                    let ta = log_a.term(index);
                    let tb = log_b.term(index);
                    if ta != tb {
                        diverged_at = Some(index);
                        break;
                    }
                }
                if let Some(d) = diverged_at {
                    for index in 1..d {
                        prop_assert_eq!(log_a.term(index), log_b.term(index));
                    }
                }
            }
        }
    }
}
