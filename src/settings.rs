//! `RaftConfig`: the tunables §6 calls out, loadable from a `toml` document
//! the way the teacher's sibling crates load their own configuration
//! (`serde`-derived struct with a `Default` impl so a deployment can start
//! from defaults and override only what it needs).

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RaftConfig {
    /// Number of newly-applied entries since the last snapshot that
    /// triggers taking a new one.
    pub snapshot_threshold: u64,

    /// Number of trailing entries kept in the log after a snapshot, so a
    /// slightly-lagging follower can still be caught up with
    /// `append_entries` instead of a full snapshot transfer.
    pub snapshot_trailing: u64,

    /// Soft cap, in bytes, on the entries payload of a single
    /// `append_entries` request.
    pub append_request_threshold: usize,

    /// Backpressure limit: `add_entry` is rejected once the log holds this
    /// many uncommitted entries.
    pub max_log_size: u64,

    pub enable_prevoting: bool,

    /// `(min, max)` milliseconds; the randomized election timeout is drawn
    /// uniformly from this range.
    pub election_timeout_ms: (u64, u64),

    pub heartbeat_interval_ms: u64,
}

impl Default for RaftConfig {
    fn default() -> Self {
        RaftConfig {
            snapshot_threshold: 1024,
            snapshot_trailing: 200,
            append_request_threshold: 100_000,
            max_log_size: 5000,
            enable_prevoting: true,
            election_timeout_ms: (400, 800),
            heartbeat_interval_ms: 150,
        }
    }
}

impl RaftConfig {
    pub fn from_toml(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }
}
