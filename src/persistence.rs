//! The `persistence` collaborator (§4.3), restricted to the term/vote
//! record and the snapshot descriptor: log entries themselves are a
//! separate, lower-level collaborator (`log::LogStorage`) injected directly
//! into the `ConsensusModule`, the way the teacher wires its `log` field.
//! Splitting it this way keeps the FSM's only I/O-shaped dependency
//! (`LogStorage`) synchronous and allocation-free to call, while the
//! coarser term/vote/snapshot record — written far less often — goes
//! through an async trait the server loop awaits before letting a
//! dependent message go out.

use crate::error::Result;
use crate::proto::{ServerId, Term};
use crate::snapshot::SnapshotDescriptor;
use async_trait::async_trait;

#[async_trait]
pub trait Persistence: Send + Sync {
    /// Must be durable (fsynced) before returning: a vote must never be
    /// re-cast after a crash that lost this write.
    async fn store_term_vote(&self, term: Term, voted_for: Option<ServerId>) -> Result<()>;

    async fn load_term_vote(&self) -> Result<(Term, Option<ServerId>)>;

    async fn store_snapshot(&self, desc: &SnapshotDescriptor) -> Result<()>;

    async fn load_snapshot(&self) -> Result<Option<SnapshotDescriptor>>;
}

/// An in-memory stand-in used by tests and the demo binary.
#[derive(Default)]
pub struct MemoryPersistence {
    inner: tokio::sync::Mutex<MemoryPersistenceInner>,
}

#[derive(Default)]
struct MemoryPersistenceInner {
    term_vote: (Term, Option<ServerId>),
    snapshot: Option<SnapshotDescriptor>,
}

impl MemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Persistence for MemoryPersistence {
    async fn store_term_vote(&self, term: Term, voted_for: Option<ServerId>) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.term_vote = (term, voted_for);
        Ok(())
    }

    async fn load_term_vote(&self) -> Result<(Term, Option<ServerId>)> {
        Ok(self.inner.lock().await.term_vote)
    }

    async fn store_snapshot(&self, desc: &SnapshotDescriptor) -> Result<()> {
        self.inner.lock().await.snapshot = Some(desc.clone());
        Ok(())
    }

    async fn load_snapshot(&self) -> Result<Option<SnapshotDescriptor>> {
        Ok(self.inner.lock().await.snapshot.clone())
    }
}
