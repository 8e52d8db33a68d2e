//! The evidence pool.

use parking_lot::Mutex;
use std::collections::HashSet;
use tracing::{debug, info};

use crate::error::Result;
use crate::pending::PendingList;
use crate::types::{Evidence, EvidenceHash};

/// Storage for uncommitted evidence.
///
/// The reactor is generic over the pool so nodes can back it with whatever
/// persistence they use; the contract is small: adding is validated and
/// idempotent, and everything not yet committed sits on the pending list.
pub trait EvidencePool: Send + Sync + 'static {
    /// Adds a piece of evidence.
    ///
    /// Returns `true` if it was new, `false` if it was already known.
    ///
    /// # Errors
    ///
    /// Fails if the evidence does not validate.
    fn add_evidence(&self, evidence: Evidence) -> Result<bool>;

    /// The list of evidence awaiting commitment, gossiped to peers.
    fn pending(&self) -> &PendingList<Evidence>;
}

/// An in-memory [`EvidencePool`].
#[derive(Default)]
pub struct MemoryPool {
    pending: PendingList<Evidence>,
    seen: Mutex<HashSet<EvidenceHash>>,
}

impl MemoryPool {
    /// Creates an empty pool.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks evidence as committed in a block: it leaves the pending list
    /// and will not be accepted again.
    pub fn mark_committed(&self, hashes: &[EvidenceHash]) {
        let committed: HashSet<EvidenceHash> = hashes.iter().copied().collect();
        self.pending.retain(|ev| !committed.contains(&ev.hash()));
        info!(count = hashes.len(), "evidence committed");
    }
}

impl EvidencePool for MemoryPool {
    fn add_evidence(&self, evidence: Evidence) -> Result<bool> {
        evidence.verify_basic()?;
        let hash = evidence.hash();
        {
            let mut seen = self.seen.lock();
            if !seen.insert(hash) {
                debug!(%hash, "evidence already known");
                return Ok(false);
            }
        }
        debug!(%hash, height = evidence.height, "evidence added to pool");
        self.pending.push(evidence);
        Ok(true)
    }

    fn pending(&self) -> &PendingList<Evidence> {
        &self.pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn evidence(height: u64) -> Evidence {
        Evidence::new(height, height * 1_000, vec![height as u8; 16])
    }

    #[test]
    fn adding_valid_evidence_queues_it() {
        let pool = MemoryPool::new();
        assert!(pool.add_evidence(evidence(1)).expect("add"));
        assert_eq!(pool.pending().len(), 1);
    }

    #[test]
    fn duplicates_are_accepted_but_not_requeued() {
        let pool = MemoryPool::new();
        assert!(pool.add_evidence(evidence(1)).expect("add"));
        assert!(!pool.add_evidence(evidence(1)).expect("re-add"));
        assert_eq!(pool.pending().len(), 1);
    }

    #[test]
    fn invalid_evidence_is_rejected() {
        let pool = MemoryPool::new();
        let mut bad = evidence(1);
        bad.payload[0] ^= 0xff;
        assert!(pool.add_evidence(bad).is_err());
        assert!(pool.pending().is_empty());
    }

    #[test]
    fn committed_evidence_is_pruned_and_stays_out() {
        let pool = MemoryPool::new();
        let ev = evidence(2);
        pool.add_evidence(ev.clone()).expect("add");
        pool.add_evidence(evidence(3)).expect("add other");

        pool.mark_committed(&[ev.hash()]);
        assert_eq!(pool.pending().len(), 1);

        // Committed evidence is still known, so it does not requeue.
        assert!(!pool.add_evidence(ev).expect("re-add"));
        assert_eq!(pool.pending().len(), 1);
    }
}
