//! Demo binary: spins up an in-process cluster over the in-memory
//! collaborator implementations (`MemoryLog`, `MemoryPersistence`,
//! `MemoryStateMachine`, `AlwaysAlive`) and submits a handful of commands
//! through whichever node happens to win the election, to exercise the
//! whole stack end to end. Replaces the teacher's Redis-over-HTTP demo,
//! which depended on command semantics this crate leaves to the embedder.

use clap::Parser;
use raft::failure_detector::AlwaysAlive;
use raft::log::MemoryLog;
use raft::persistence::MemoryPersistence;
use raft::proto::{
    Configuration, ConfigurationData, ConfigurationSnapshot, Message, MessageBody, Metadata,
    ServerDescriptor, ServerId, ServerSet,
};
use raft::rpc::RpcClient;
use raft::state_machine::MemoryStateMachine;
use raft::{RaftConfig, Server};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use uuid::Uuid;

#[derive(Parser)]
#[command(about = "Run an in-process demo Raft cluster")]
struct Args {
    /// Number of voting members to start.
    #[arg(long, default_value_t = 3)]
    nodes: usize,

    /// Number of demo commands to submit once a leader is elected.
    #[arg(long, default_value_t = 5)]
    commands: usize,
}

/// Routes `Server::deliver` calls between every node registered with it, so
/// the demo doesn't need a real network.
struct InProcessNetwork {
    servers: Mutex<HashMap<ServerId, Server>>,
    self_id: ServerId,
}

#[async_trait::async_trait]
impl RpcClient for InProcessNetwork {
    async fn send(&self, msg: Message) {
        let servers = self.servers.lock().await;
        for peer in &msg.to {
            if let Some(server) = servers.get(peer) {
                server.deliver(self.self_id, msg.body.clone());
            }
        }
    }

    async fn add_server(&self, _info: ServerDescriptor) {}
    async fn remove_server(&self, _id: ServerId) {}
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();

    let ids: Vec<ServerId> = (0..args.nodes).map(|_| Uuid::new_v4()).collect();
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

    let networks: Vec<Arc<InProcessNetwork>> = ids
        .iter()
        .map(|id| {
            Arc::new(InProcessNetwork {
                servers: Mutex::new(HashMap::new()),
                self_id: *id,
            })
        })
        .collect();

    let mut servers = HashMap::new();
    for (id, network) in ids.iter().zip(networks.iter()) {
        let server = Server::start(
            *id,
            Metadata::default(),
            Arc::new(MemoryLog::new()),
            config_snapshot.clone(),
            Arc::new(raft::clock::SystemClock),
            network.clone(),
            Arc::new(MemoryPersistence::new()),
            Arc::new(MemoryStateMachine::new()),
            Arc::new(AlwaysAlive),
            RaftConfig::default(),
        );
        servers.insert(*id, server);
    }
    for network in &networks {
        let mut guard = network.servers.lock().await;
        *guard = servers.clone();
    }

    tracing::info!(nodes = args.nodes, "cluster started, waiting for a leader");
    tokio::time::sleep(Duration::from_millis(1200)).await;

    let mut leader = None;
    for (id, server) in &servers {
        if server.is_leader().await.unwrap_or(false) {
            leader = Some((*id, server.clone()));
            break;
        }
    }

    let Some((leader_id, leader_server)) = leader else {
        tracing::error!("no leader elected within the demo window");
        return;
    };
    tracing::info!(%leader_id, "leader elected");

    for i in 0..args.commands {
        let command = bytes::Bytes::from(format!("demo-command-{i}"));
        match leader_server
            .add_entry(command, raft::WaitType::Applied)
            .await
        {
            Ok(pos) => tracing::info!(index = pos.index, "command applied"),
            Err(e) => tracing::warn!(error = %e, "command failed"),
        }
    }

    for server in servers.values() {
        server.abort();
    }
}
