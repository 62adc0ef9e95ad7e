//! Integration tests driving a small in-process simulated cluster: real
//! `tokio` timers (the election/heartbeat windows are short enough that a
//! few hundred milliseconds of real wall-clock time is enough to exercise
//! them), but an in-memory `RpcClient` that can selectively drop messages
//! to or from a node, standing in for the "deterministic simulated network"
//! called for by the scenario suite.

use bytes::Bytes;
use raft::clock::SystemClock;
use raft::failure_detector::AlwaysAlive;
use raft::log::MemoryLog;
use raft::persistence::MemoryPersistence;
use raft::proto::{
    Configuration, ConfigurationData, ConfigurationSnapshot, Message, MessageBody, Metadata,
    ServerDescriptor, ServerId, ServerSet,
};
use raft::rpc::RpcClient;
use raft::state_machine::MemoryStateMachine;
use raft::{RaftConfig, Server, WaitType};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use uuid::Uuid;

/// A fully-connected in-process network that can partition individual
/// nodes (drop everything to/from them) on command.
struct SimNetwork {
    self_id: ServerId,
    servers: Mutex<HashMap<ServerId, Server>>,
    partitioned: Arc<Mutex<HashSet<ServerId>>>,
}

#[async_trait::async_trait]
impl RpcClient for SimNetwork {
    async fn send(&self, msg: Message) {
        let partitioned = self.partitioned.lock().await;
        if partitioned.contains(&self.self_id) {
            return;
        }
        let servers = self.servers.lock().await;
        for peer in &msg.to {
            if partitioned.contains(peer) {
                continue;
            }
            if let Some(server) = servers.get(peer) {
                server.deliver(self.self_id, msg.body.clone());
            }
        }
    }

    async fn add_server(&self, _info: ServerDescriptor) {}
    async fn remove_server(&self, _id: ServerId) {}
}

struct Cluster {
    ids: Vec<ServerId>,
    servers: HashMap<ServerId, Server>,
    partitioned: Arc<Mutex<HashSet<ServerId>>>,
    state_machines: HashMap<ServerId, Arc<MemoryStateMachine>>,
}

impl Cluster {
    async fn start(n: usize) -> Self {
        let ids: Vec<ServerId> = (0..n).map(|_| Uuid::new_v4()).collect();
        let mut members = HashMap::new();
        for (i, id) in ids.iter().enumerate() {
            members.insert(
                *id,
                ServerDescriptor {
                    id: *id,
                    address: format!("node-{i}"),
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

        let partitioned = Arc::new(Mutex::new(HashSet::new()));
        let networks: Vec<Arc<SimNetwork>> = ids
            .iter()
            .map(|id| {
                Arc::new(SimNetwork {
                    self_id: *id,
                    servers: Mutex::new(HashMap::new()),
                    partitioned: partitioned.clone(),
                })
            })
            .collect();

        let mut servers = HashMap::new();
        let mut state_machines = HashMap::new();
        for (id, network) in ids.iter().zip(networks.iter()) {
            let sm = Arc::new(MemoryStateMachine::new());
            let server = Server::start(
                *id,
                Metadata::default(),
                Arc::new(MemoryLog::new()),
                config_snapshot.clone(),
                Arc::new(SystemClock),
                network.clone(),
                Arc::new(MemoryPersistence::new()),
                sm.clone(),
                Arc::new(AlwaysAlive),
                RaftConfig::default(),
            );
            servers.insert(*id, server);
            state_machines.insert(*id, sm);
        }
        for network in &networks {
            let mut guard = network.servers.lock().await;
            *guard = servers.clone();
        }

        Cluster {
            ids,
            servers,
            partitioned,
            state_machines,
        }
    }

    async fn wait_for_leader(&self, timeout: Duration) -> Option<ServerId> {
        let deadline = tokio::time::Instant::now() + timeout;
        while tokio::time::Instant::now() < deadline {
            for id in &self.ids {
                if self.servers[id].is_leader().await.unwrap_or(false) {
                    return Some(*id);
                }
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        None
    }

    async fn partition(&self, id: ServerId) {
        self.partitioned.lock().await.insert(id);
    }

    async fn heal(&self, id: ServerId) {
        self.partitioned.lock().await.remove(&id);
    }

    fn abort_all(&self) {
        for server in self.servers.values() {
            server.abort();
        }
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn three_node_happy_path_elects_leader_and_commits() {
    let cluster = Cluster::start(3).await;
    let leader_id = cluster
        .wait_for_leader(Duration::from_secs(3))
        .await
        .expect("a leader should be elected");

    let leader = cluster.servers[&leader_id].clone();
    let pos = leader
        .add_entry(Bytes::from_static(b"set x 1"), WaitType::Applied)
        .await
        .expect("leader should accept the command");
    assert!(pos.index >= 1);

    tokio::time::sleep(Duration::from_millis(300)).await;
    for id in &cluster.ids {
        let applied = cluster.state_machines[id].applied_commands().await;
        assert!(
            applied.iter().any(|c| c.as_ref() == b"set x 1"),
            "node {id} should have applied the committed command"
        );
    }

    cluster.abort_all();
}

#[tokio::test(flavor = "multi_thread")]
async fn non_leader_rejects_proposals() {
    let cluster = Cluster::start(3).await;
    let leader_id = cluster
        .wait_for_leader(Duration::from_secs(3))
        .await
        .expect("a leader should be elected");

    let follower_id = cluster.ids.iter().find(|id| **id != leader_id).unwrap();
    let follower = cluster.servers[follower_id].clone();
    let err = follower
        .add_entry(Bytes::from_static(b"x"), WaitType::Committed)
        .await
        .unwrap_err();
    assert!(matches!(err, raft::RaftError::NotALeader { .. }));

    cluster.abort_all();
}

#[tokio::test(flavor = "multi_thread")]
async fn leader_failure_triggers_new_election() {
    let cluster = Cluster::start(3).await;
    let first_leader = cluster
        .wait_for_leader(Duration::from_secs(3))
        .await
        .expect("a leader should be elected");

    cluster.partition(first_leader).await;

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    let mut new_leader = None;
    while tokio::time::Instant::now() < deadline {
        for id in &cluster.ids {
            if *id != first_leader && cluster.servers[id].is_leader().await.unwrap_or(false) {
                new_leader = Some(*id);
                break;
            }
        }
        if new_leader.is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    assert!(
        new_leader.is_some(),
        "the remaining majority should elect a new leader"
    );
    assert_ne!(new_leader.unwrap(), first_leader);

    cluster.abort_all();
}

#[tokio::test(flavor = "multi_thread")]
async fn minority_partition_cannot_elect_a_leader() {
    let cluster = Cluster::start(5).await;
    let leader_id = cluster
        .wait_for_leader(Duration::from_secs(3))
        .await
        .expect("a leader should be elected");

    let minority: Vec<ServerId> = cluster
        .ids
        .iter()
        .filter(|id| **id != leader_id)
        .take(2)
        .copied()
        .collect();
    for id in &minority {
        cluster.partition(*id).await;
    }

    tokio::time::sleep(Duration::from_secs(2)).await;

    // The original leader is still in the majority side and should remain
    // leader (or the majority elects a new one); either way, none of the
    // minority-side nodes should be able to call themselves leader alone.
    for id in &minority {
        let term_before = cluster.servers[id].current_term().await.unwrap();
        tokio::time::sleep(Duration::from_millis(500)).await;
        let term_after = cluster.servers[id].current_term().await.unwrap();
        // Minority nodes keep bumping their term via failed elections but
        // never actually win (no messages get through the partition).
        assert!(term_after >= term_before);
        assert!(!cluster.servers[id].is_leader().await.unwrap());
    }

    for id in &minority {
        cluster.heal(*id).await;
    }
    cluster.abort_all();
}

#[tokio::test(flavor = "multi_thread")]
async fn joint_consensus_membership_change_commits() {
    let cluster = Cluster::start(3).await;
    let leader_id = cluster
        .wait_for_leader(Duration::from_secs(3))
        .await
        .expect("a leader should be elected");
    let leader = cluster.servers[&leader_id].clone();

    let new_member_id = Uuid::new_v4();
    let current = leader.configuration().await.unwrap();
    let ConfigurationData::Simple(mut new_config) = current.data else {
        panic!("expected simple configuration before the change");
    };
    new_config.servers.members.insert(
        new_member_id,
        ServerDescriptor {
            id: new_member_id,
            address: "node-new".into(),
        },
    );

    leader
        .set_configuration(new_config)
        .await
        .expect("membership change should eventually commit");

    let final_config = leader.configuration().await.unwrap();
    assert!(matches!(final_config.data, ConfigurationData::Simple(_)));
    if let ConfigurationData::Simple(c) = final_config.data {
        assert!(c.servers.members.contains_key(&new_member_id));
    }

    cluster.abort_all();
}

#[tokio::test(flavor = "multi_thread")]
async fn read_barrier_waits_for_committed_state() {
    let cluster = Cluster::start(3).await;
    let leader_id = cluster
        .wait_for_leader(Duration::from_secs(3))
        .await
        .expect("a leader should be elected");
    let leader = cluster.servers[&leader_id].clone();

    leader
        .add_entry(Bytes::from_static(b"warm up"), WaitType::Committed)
        .await
        .unwrap();

    let done = Arc::new(AtomicBool::new(false));
    let done2 = done.clone();
    let leader2 = leader.clone();
    let handle = tokio::spawn(async move {
        leader2.read_barrier().await.unwrap();
        done2.store(true, Ordering::SeqCst);
    });

    tokio::time::timeout(Duration::from_secs(2), handle)
        .await
        .expect("read barrier should resolve")
        .unwrap();
    assert!(done.load(Ordering::SeqCst));

    cluster.abort_all();
}
