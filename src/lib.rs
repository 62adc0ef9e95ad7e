//! A Raft consensus server: leader election (with pre-voting), log
//! replication, snapshotting and joint-consensus membership changes, driven
//! over pluggable `rpc`, `persistence` and `state_machine` collaborators.
//!
//! The FSM (`consensus::ConsensusModule`) is pure and synchronous; the
//! `server::Server` owns it and is the only thing that talks to collaborators
//! or the clock. Construct a `Server` with `settings::RaftConfig` and your
//! own collaborator implementations (or the in-memory reference ones
//! alongside each trait) and call `Server::start`.

pub mod clock;
pub mod config;
pub mod consensus;
pub mod constraint;
pub mod error;
pub mod failure_detector;
pub mod log;
pub mod persistence;
pub mod promise;
pub mod proto;
pub mod rpc;
pub mod server;
pub mod settings;
pub mod snapshot;
pub mod state_machine;

mod state;

pub use consensus::{ConsensusModule, ReadBarrierToken, Tick};
pub use error::{RaftError, Result};
pub use promise::WaitType;
pub use proto::{
    Configuration, ConfigurationData, LogEntry, LogEntryData, LogIndex, LogPosition,
    ServerDescriptor, ServerId, Term,
};
pub use server::Server;
pub use settings::RaftConfig;
