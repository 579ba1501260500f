use crate::domain::crypto::new_hash;
use crate::domain::snapshot::{RoundLink, Snapshot};
use crate::foundation::constants::SNAPSHOT_ROUND_GAP;
use crate::foundation::{KernelError, NodeId, Result, RoundHash};
use serde::{Deserialize, Serialize};

/// A round as read back from the persistent store.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Round {
    pub node_id: NodeId,
    pub number: u64,
    pub timestamp: u64,
    pub references: RoundLink,
}

/// The open head of a node's chain, accumulating snapshots until sealed.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CacheRound {
    pub node_id: NodeId,
    pub number: u64,
    pub timestamp: u64,
    pub references: Option<RoundLink>,
    pub snapshots: Vec<Snapshot>,
}

/// A sealed round; the hash covers the ordered snapshot hashes.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct FinalRound {
    pub node_id: NodeId,
    pub number: u64,
    pub hash: RoundHash,
    pub start: u64,
    pub end: u64,
}

#[derive(Serialize)]
struct FinalRoundSeal<'a> {
    node_id: &'a NodeId,
    number: u64,
    start: u64,
    end: u64,
    snapshots: Vec<&'a crate::foundation::SnapshotHash>,
}

impl CacheRound {
    pub fn new(node_id: NodeId, number: u64, timestamp: u64, references: Option<RoundLink>) -> Self {
        Self { node_id, number, timestamp, references, snapshots: Vec::new() }
    }

    /// Timestamp window spanned by the collected snapshots. An empty round
    /// yields `(u64::MAX, 0)` so gap comparisons fail closed.
    pub fn gap(&self) -> (u64, u64) {
        let mut start = u64::MAX;
        let mut end = 0u64;
        for snapshot in &self.snapshots {
            start = start.min(snapshot.timestamp);
            end = end.max(snapshot.timestamp);
        }
        (start, end)
    }

    /// Seal the collected snapshots into a `FinalRound`. `None` while the
    /// round has nothing to seal.
    pub fn as_final(&self) -> Option<FinalRound> {
        if self.snapshots.is_empty() {
            return None;
        }
        let (start, end) = self.gap();
        let seal = FinalRoundSeal {
            node_id: &self.node_id,
            number: self.number,
            start,
            end,
            snapshots: self.snapshots.iter().map(|s| &s.hash).collect(),
        };
        let bytes = bincode::serialize(&seal).expect("round seal serialization is infallible");
        Some(FinalRound { node_id: self.node_id, number: self.number, hash: RoundHash::new(new_hash(&bytes)), start, end })
    }

    /// Check a snapshot against this round's window and references. With
    /// `finalized` the snapshot is also appended to the round.
    pub fn validate_snapshot(&mut self, s: &Snapshot, finalized: bool) -> Result<()> {
        if s.node_id != self.node_id {
            return Err(KernelError::invalid_snapshot(format!("node {} does not own round of {}", s.node_id, self.node_id)));
        }
        if s.round_number != self.number {
            return Err(KernelError::invalid_snapshot(format!("round number {} outside head round {}", s.round_number, self.number)));
        }
        if !s.references_equal(&self.references) {
            return Err(KernelError::invalid_snapshot("references do not match head round".to_string()));
        }
        if self.snapshots.iter().any(|existing| existing.hash == s.hash) {
            return Err(KernelError::invalid_snapshot(format!("snapshot {} already collected", s.hash)));
        }
        if let Some(first) = self.snapshots.first() {
            if s.timestamp < first.timestamp || s.timestamp >= first.timestamp + SNAPSHOT_ROUND_GAP {
                return Err(KernelError::invalid_snapshot(format!(
                    "timestamp {} outside round window starting {}",
                    s.timestamp, first.timestamp
                )));
            }
        }
        if finalized {
            self.snapshots.push(s.clone());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::foundation::TxHash;

    fn snapshot_at(node: NodeId, round: u64, refs: Option<RoundLink>, timestamp: u64) -> Snapshot {
        let mut s = Snapshot::new(1, node, TxHash::new([timestamp as u8; 32]));
        s.round_number = round;
        s.references = refs;
        s.timestamp = timestamp;
        s.hash = s.payload_hash();
        s
    }

    fn refs() -> Option<RoundLink> {
        Some(RoundLink::new(RoundHash::new([1; 32]), RoundHash::new([2; 32])))
    }

    #[test]
    fn empty_round_gap_fails_closed() {
        let cache = CacheRound::new(NodeId::new([1; 32]), 3, 0, refs());
        assert_eq!(cache.gap(), (u64::MAX, 0));
        assert!(cache.as_final().is_none());
    }

    #[test]
    fn seal_covers_ordered_snapshots() {
        let node = NodeId::new([1; 32]);
        let mut cache = CacheRound::new(node, 3, 0, refs());
        cache.validate_snapshot(&snapshot_at(node, 3, refs(), 1_000), true).expect("first");
        cache.validate_snapshot(&snapshot_at(node, 3, refs(), 1_500), true).expect("second");

        let sealed = cache.as_final().expect("sealed");
        assert_eq!(sealed.number, 3);
        assert_eq!((sealed.start, sealed.end), (1_000, 1_500));

        let mut reordered = cache.clone();
        reordered.snapshots.reverse();
        assert_ne!(sealed.hash, reordered.as_final().expect("sealed").hash);
    }

    #[test]
    fn validate_snapshot_enforces_window_and_uniqueness() {
        let node = NodeId::new([1; 32]);
        let mut cache = CacheRound::new(node, 3, 0, refs());
        let first = snapshot_at(node, 3, refs(), 1_000);
        cache.validate_snapshot(&first, true).expect("first");

        // Duplicate hash.
        assert!(cache.validate_snapshot(&first, false).is_err());
        // Outside window.
        assert!(cache.validate_snapshot(&snapshot_at(node, 3, refs(), 1_000 + SNAPSHOT_ROUND_GAP), false).is_err());
        // Wrong round number.
        assert!(cache.validate_snapshot(&snapshot_at(node, 4, refs(), 1_100), false).is_err());
        // Mismatched references.
        assert!(cache.validate_snapshot(&snapshot_at(node, 3, None, 1_100), false).is_err());
        // In-window, distinct payload.
        assert!(cache.validate_snapshot(&snapshot_at(node, 3, refs(), 1_100), false).is_ok());
    }
}
