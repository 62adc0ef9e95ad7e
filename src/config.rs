//! The configuration state machine: applies `Configuration` log entries as
//! soon as they're appended (not when committed — §4.1), tracks a pending
//! joint-consensus change, and answers quorum questions against whichever
//! configuration (simple or joint) is currently active.
//!
//! Grounded on the teacher's `ConfigurationStateMachine` (`config_state.rs`,
//! referenced but not present in the retrieved source — reconstructed here
//! from its call sites in `consensus.rs`: `.value`, `.pending`,
//! `.last_applied`, `.apply()`, `.commit()`, `.revert()`, `.snapshot()`) and
//! extended to the full two-phase joint-consensus protocol the original
//! only stubbed with single-server `ConfigChange`s.

use crate::proto::{
    Configuration, ConfigurationData, ConfigurationSnapshot, ConfigurationSnapshotRef, LogEntry,
    LogEntryData, LogIndex, ServerId,
};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingKind {
    /// The joint (C_old ∪ C_new) entry has been appended but not committed.
    Joint,
    /// The joint entry committed and the C_new-only finalize entry has been
    /// appended but not committed.
    Finalize,
}

pub struct PendingConfiguration {
    /// Log index of the not-yet-committed configuration entry.
    pub last_change: LogIndex,
    pub kind: PendingKind,
}

pub struct ConfigurationStateMachine {
    pub value: ConfigurationData,
    pub last_applied: LogIndex,
    pub pending: Option<PendingConfiguration>,
    /// Remembers the configuration displaced by each uncommitted config
    /// entry, keyed by that entry's index, so `revert()` can restore it if
    /// the entry is truncated away by a new leader.
    history: Vec<(LogIndex, ConfigurationData)>,
}

impl From<ConfigurationSnapshot> for ConfigurationStateMachine {
    fn from(snapshot: ConfigurationSnapshot) -> Self {
        ConfigurationStateMachine {
            value: snapshot.data,
            last_applied: snapshot.last_applied,
            pending: None,
            history: vec![],
        }
    }
}

impl ConfigurationStateMachine {
    pub fn snapshot(&self) -> ConfigurationSnapshotRef {
        ConfigurationSnapshotRef {
            last_applied: self.last_applied,
            data: &self.value,
        }
    }

    /// Applies a log entry to the configuration state the instant it is
    /// appended to the local log (regardless of whether it has committed
    /// yet — a configuration takes effect the moment it is appended).
    pub fn apply(&mut self, entry: &LogEntry, commit_index: LogIndex) {
        self.last_applied = entry.index;

        let data = match &entry.data {
            LogEntryData::Configuration(data) => data.clone(),
            _ => return,
        };

        self.history.push((entry.index, self.value.clone()));
        self.value = data.clone();

        let kind = match &data {
            ConfigurationData::Joint { .. } => PendingKind::Joint,
            ConfigurationData::Simple(_) => PendingKind::Finalize,
        };

        self.pending = Some(PendingConfiguration {
            last_change: entry.index,
            kind,
        });

        // A configuration entry that arrives already covered by
        // `commit_index` (e.g. during startup replay) is trivially
        // resolved.
        if commit_index >= entry.index {
            self.commit(commit_index);
        }
    }

    /// Called whenever `commit_index` advances. Returns `true` if doing so
    /// resolved a pending configuration change (the caller should persist
    /// the new configuration snapshot in that case).
    pub fn commit(&mut self, commit_index: LogIndex) -> bool {
        let resolved = match &self.pending {
            Some(p) if p.last_change <= commit_index => true,
            _ => false,
        };

        if resolved {
            self.pending = None;
            self.history.retain(|(index, _)| *index > commit_index);
        }

        resolved
    }

    /// Rolls the configuration back to what it was before the entry at
    /// `from` (inclusive) was applied, because the local log is about to
    /// truncate everything from `from` onward.
    pub fn revert(&mut self, from: LogIndex) {
        if let Some(pos) = self.history.iter().position(|(index, _)| *index >= from) {
            let (index, value) = self.history[pos].clone();
            self.value = value;
            self.last_applied = index.saturating_sub(1);
            self.history.truncate(pos);
        }

        match &self.pending {
            Some(p) if p.last_change >= from => self.pending = None,
            _ => {}
        }
    }

    /// Whether `server_id` is a voting member of the currently active
    /// configuration (either set, if joint).
    pub fn is_voting_member(&self, server_id: &ServerId) -> bool {
        match &self.value {
            ConfigurationData::Simple(c) => c.servers.members.contains_key(server_id),
            ConfigurationData::Joint { old, new } => {
                old.servers.members.contains_key(server_id)
                    || new.servers.members.contains_key(server_id)
            }
        }
    }

    /// All server ids that should receive replication traffic (voters and
    /// learners, across both halves of a joint configuration).
    pub fn iter(&self) -> Vec<ServerId> {
        match &self.value {
            ConfigurationData::Simple(c) => c.iter().collect(),
            ConfigurationData::Joint { old, new } => {
                let mut ids: Vec<ServerId> = old.iter().collect();
                for id in new.iter() {
                    if !ids.contains(&id) {
                        ids.push(id);
                    }
                }
                ids
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        match &self.value {
            ConfigurationData::Simple(c) => c.servers.members.is_empty(),
            ConfigurationData::Joint { old, new } => {
                old.servers.members.is_empty() && new.servers.members.is_empty()
            }
        }
    }

    /// Majority size(s) required to make progress: one number for a simple
    /// configuration, two (old, new) for a joint one.
    fn majorities(&self) -> Vec<usize> {
        match &self.value {
            ConfigurationData::Simple(c) => vec![c.servers.members.len() / 2 + 1],
            ConfigurationData::Joint { old, new } => {
                vec![old.servers.members.len() / 2 + 1, new.servers.members.len() / 2 + 1]
            }
        }
    }

    /// Whether the given per-server `match_index` map (plus the leader's
    /// own `self_match_index`) has a quorum at or beyond `index`, in every
    /// active configuration set.
    pub fn has_quorum(
        &self,
        self_id: ServerId,
        self_match_index: LogIndex,
        matches: &HashMap<ServerId, LogIndex>,
        index: LogIndex,
    ) -> bool {
        let sets: Vec<&Configuration> = match &self.value {
            ConfigurationData::Simple(c) => vec![c],
            ConfigurationData::Joint { old, new } => vec![old, new],
        };

        for (set, majority) in sets.iter().zip(self.majorities()) {
            let mut count = 0;
            for id in set.servers.members.keys() {
                let mi = if *id == self_id {
                    self_match_index
                } else {
                    *matches.get(id).unwrap_or(&0)
                };
                if mi >= index {
                    count += 1;
                }
            }
            if count < majority {
                return false;
            }
        }
        true
    }

    /// Number of voters whose votes must be collected in every active
    /// configuration set to win an election; empty when the cluster has no
    /// voting members at all (a safety valve, not a real cluster state).
    pub fn vote_quorums(&self) -> Vec<(Vec<ServerId>, usize)> {
        let sets: Vec<&Configuration> = match &self.value {
            ConfigurationData::Simple(c) => vec![c],
            ConfigurationData::Joint { old, new } => vec![old, new],
        };
        sets.into_iter()
            .map(|c| {
                let ids: Vec<ServerId> = c.servers.members.keys().copied().collect();
                let majority = ids.len() / 2 + 1;
                (ids, majority)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::{ServerDescriptor, ServerSet};
    use uuid::Uuid;

    fn desc(id: ServerId) -> ServerDescriptor {
        ServerDescriptor {
            id,
            address: String::new(),
        }
    }

    fn simple_config(ids: &[ServerId]) -> Configuration {
        let mut servers = ServerSet::default();
        for id in ids {
            servers.members.insert(*id, desc(*id));
        }
        Configuration { servers }
    }

    #[test]
    fn joint_quorum_requires_both_sets() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let c = Uuid::new_v4();
        let d = Uuid::new_v4();
        let e = Uuid::new_v4();

        let mut csm = ConfigurationStateMachine::from(ConfigurationSnapshot {
            last_applied: 0,
            data: ConfigurationData::Joint {
                old: simple_config(&[a, b, c]),
                new: simple_config(&[a, b, c, d, e]),
            },
        });
        csm.pending = Some(PendingConfiguration {
            last_change: 1,
            kind: PendingKind::Joint,
        });

        let mut matches = HashMap::new();
        matches.insert(b, 5);
        matches.insert(c, 5);
        // d, e missing => new-set majority (3 of 5) not met yet.
        assert!(!csm.has_quorum(a, 5, &matches, 5));

        matches.insert(d, 5);
        assert!(csm.has_quorum(a, 5, &matches, 5));
    }

    #[test]
    fn commit_resolves_pending_and_revert_restores_history() {
        let a = Uuid::new_v4();
        let mut csm = ConfigurationStateMachine::from(ConfigurationSnapshot::default());
        let old_value = csm.value.clone();

        csm.apply(
            &LogEntry {
                term: 1,
                index: 1,
                data: LogEntryData::Configuration(ConfigurationData::Simple(simple_config(&[a]))),
            },
            0,
        );
        assert!(csm.pending.is_some());

        csm.revert(1);
        assert!(csm.pending.is_none());
        match (&csm.value, &old_value) {
            (ConfigurationData::Simple(a), ConfigurationData::Simple(b)) => assert_eq!(a, b),
            _ => panic!("expected simple configurations"),
        }
    }
}
