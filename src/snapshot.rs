//! Snapshot descriptors and the leader-side policy for when to ask the
//! state machine to take one and how far to truncate the log afterward.
//!
//! The teacher's `protos.rs` left `InstallSnapshotRequest {}` as an empty
//! placeholder; §4.1's snapshotting paragraph is built out fully here.

use crate::proto::{ConfigurationData, LogIndex, Term};
use serde::{Deserialize, Serialize};

/// An opaque handle to state-machine snapshot bytes, produced by
/// `state_machine::StateMachine::take_snapshot` and consumed by
/// `load_snapshot`. The consensus layer never looks inside it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SnapshotHandle(pub bytes::Bytes);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotDescriptor {
    pub last_included_index: LogIndex,
    pub last_included_term: Term,
    pub last_included_configuration: ConfigurationData,
    pub handle: SnapshotHandle,
}

impl SnapshotDescriptor {
    pub fn none() -> Self {
        SnapshotDescriptor {
            last_included_index: 0,
            last_included_term: 0,
            last_included_configuration: ConfigurationData::Simple(Default::default()),
            handle: SnapshotHandle(bytes::Bytes::new()),
        }
    }
}

/// Decides, from the leader/follower's locally-applied progress, whether a
/// new snapshot should be requested right now.
pub fn should_snapshot(last_applied: LogIndex, last_snapshot_index: LogIndex, threshold: u64) -> bool {
    last_applied.saturating_sub(last_snapshot_index) >= threshold
}

/// The log prefix index that may be safely discarded after taking a
/// snapshot at `last_applied`, retaining `trailing` entries so that a
/// slightly-lagging follower can still be caught up with `append_entries`
/// instead of a full snapshot transfer.
pub fn truncation_point(last_applied: LogIndex, trailing: u64) -> LogIndex {
    last_applied.saturating_sub(trailing)
}
