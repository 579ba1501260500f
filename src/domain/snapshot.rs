use crate::domain::crypto::{new_hash, Commitment, CosiSignature, Signature};
use crate::foundation::{NodeId, RoundHash, SnapshotHash, TxHash};
use serde::{Deserialize, Serialize};

/// The two round hashes a snapshot anchors itself to: the predecessor on
/// its own chain and a round on some other node's chain.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct RoundLink {
    pub self_ref: RoundHash,
    pub external: RoundHash,
}

impl RoundLink {
    pub const fn new(self_ref: RoundHash, external: RoundHash) -> Self {
        Self { self_ref, external }
    }
}

/// A proposed extension of one node's chain in the snapshot graph.
///
/// `commitment` and `signature` ride along the wire but never enter the
/// payload hash: `commitment` is populated when an announcement is
/// received, `signature` when the snapshot finalizes. `legacy_signatures`
/// exists only for version-0 snapshots which predate collective signing.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub version: u8,
    pub node_id: NodeId,
    pub round_number: u64,
    pub references: Option<RoundLink>,
    pub transaction: TxHash,
    pub timestamp: u64,
    #[serde(default)]
    pub commitment: Option<Commitment>,
    #[serde(default)]
    pub signature: Option<CosiSignature>,
    #[serde(default)]
    pub legacy_signatures: Option<Vec<Signature>>,
    #[serde(default)]
    pub hash: SnapshotHash,
}

#[derive(Serialize)]
struct SnapshotPayload<'a> {
    version: u8,
    node_id: &'a NodeId,
    round_number: u64,
    references: &'a Option<RoundLink>,
    transaction: &'a TxHash,
    timestamp: u64,
}

impl Snapshot {
    pub fn new(version: u8, node_id: NodeId, transaction: TxHash) -> Self {
        Self {
            version,
            node_id,
            round_number: 0,
            references: None,
            transaction,
            timestamp: 0,
            commitment: None,
            signature: None,
            legacy_signatures: None,
            hash: SnapshotHash::default(),
        }
    }

    /// Content hash over every non-signature field. Must be recomputed at
    /// each phase boundary; `hash` caches the result.
    pub fn payload_hash(&self) -> SnapshotHash {
        let payload = SnapshotPayload {
            version: self.version,
            node_id: &self.node_id,
            round_number: self.round_number,
            references: &self.references,
            transaction: &self.transaction,
            timestamp: self.timestamp,
        };
        let bytes = bincode::serialize(&payload).expect("snapshot payload serialization is infallible");
        SnapshotHash::new(new_hash(&bytes))
    }

    pub fn references_equal(&self, other: &Option<RoundLink>) -> bool {
        self.references == *other
    }
}

/// A finalized snapshot stamped with the process-wide write order.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SnapshotWithTopologicalOrder {
    pub snapshot: Snapshot,
    pub topological_order: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Snapshot {
        let mut s = Snapshot::new(1, NodeId::new([7; 32]), TxHash::new([9; 32]));
        s.round_number = 4;
        s.references = Some(RoundLink::new(RoundHash::new([1; 32]), RoundHash::new([2; 32])));
        s.timestamp = 1_700_000_000_000_000_000;
        s
    }

    #[test]
    fn payload_hash_ignores_signature_fields() {
        let mut s = sample();
        let base = s.payload_hash();

        s.commitment = Some(Commitment::from_bytes([3; 32]));
        s.signature = Some(CosiSignature::from_parts(Signature::from_parts(&[4; 32], &[5; 32]), 0b111));
        s.hash = s.payload_hash();
        assert_eq!(s.hash, base);
    }

    #[test]
    fn payload_hash_covers_ordering_fields() {
        let s = sample();
        let mut later = s.clone();
        later.timestamp += 1;
        assert_ne!(s.payload_hash(), later.payload_hash());

        let mut other_round = s.clone();
        other_round.round_number += 1;
        assert_ne!(s.payload_hash(), other_round.payload_hash());
    }
}
