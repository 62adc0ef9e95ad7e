//! The `state_machine` collaborator (§4.3). Command semantics and
//! snapshot encoding are the embedder's concern; the consensus layer only
//! ever hands it committed entries, in order, and asks it to snapshot or
//! restore.

use crate::error::Result;
use crate::proto::LogEntry;
use crate::snapshot::SnapshotHandle;
use async_trait::async_trait;

#[async_trait]
pub trait StateMachine: Send + Sync {
    /// Applies entries strictly in index order. Called with one or more
    /// entries already known to be committed.
    async fn apply(&self, entries: &[LogEntry]) -> Result<()>;

    async fn take_snapshot(&self) -> Result<SnapshotHandle>;

    async fn load_snapshot(&self, handle: SnapshotHandle) -> Result<()>;
}

/// A trivial in-memory state machine that records the commands it was
/// asked to apply, in order. Used by tests and the demo binary; modelled
/// after the teacher's `MemoryKVStateMachine`, generalized away from
/// Redis-specific commands since the concrete command language is out of
/// scope here.
#[derive(Default)]
pub struct MemoryStateMachine {
    applied: tokio::sync::Mutex<Vec<bytes::Bytes>>,
}

impl MemoryStateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn applied_commands(&self) -> Vec<bytes::Bytes> {
        self.applied.lock().await.clone()
    }
}

#[async_trait]
impl StateMachine for MemoryStateMachine {
    async fn apply(&self, entries: &[LogEntry]) -> Result<()> {
        let mut applied = self.applied.lock().await;
        for entry in entries {
            if let crate::proto::LogEntryData::Command(data) = &entry.data {
                applied.push(data.clone());
            }
        }
        Ok(())
    }

    async fn take_snapshot(&self) -> Result<SnapshotHandle> {
        let applied = self.applied.lock().await;
        let mut buf = Vec::new();
        for cmd in applied.iter() {
            buf.extend_from_slice(&(cmd.len() as u32).to_be_bytes());
            buf.extend_from_slice(cmd);
        }
        Ok(SnapshotHandle(bytes::Bytes::from(buf)))
    }

    async fn load_snapshot(&self, handle: SnapshotHandle) -> Result<()> {
        let mut applied = self.applied.lock().await;
        applied.clear();
        let buf = handle.0;
        let mut offset = 0usize;
        while offset + 4 <= buf.len() {
            let len = u32::from_be_bytes(buf[offset..offset + 4].try_into().unwrap()) as usize;
            offset += 4;
            if offset + len > buf.len() {
                break;
            }
            applied.push(buf.slice(offset..offset + len));
            offset += len;
        }
        Ok(())
    }
}
