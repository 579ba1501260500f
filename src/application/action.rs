use crate::domain::crypto::{Commitment, CosiSignature, Response};
use crate::domain::snapshot::Snapshot;
use crate::domain::transaction::Transaction;
use crate::foundation::{NodeId, SnapshotHash};

/// One event on the consensus action channel. The dispatcher consumes
/// these strictly in enqueue order; each variant carries exactly the
/// payload its handler needs.
#[derive(Clone, Debug)]
pub enum CosiAction {
    /// A locally produced snapshot awaiting announcement.
    SelfEmpty { peer_id: NodeId, snapshot: Snapshot },
    /// A peer's commitment for a snapshot we proposed.
    SelfCommitment { peer_id: NodeId, snapshot_hash: SnapshotHash, commitment: Commitment, want_tx: bool },
    /// A peer's response for a snapshot we proposed.
    SelfResponse { peer_id: NodeId, snapshot_hash: SnapshotHash, response: Response },
    /// Another node announcing a snapshot on its own chain.
    ExternalAnnouncement { peer_id: NodeId, snapshot: Snapshot, commitment: Commitment },
    /// The proposer's challenge for a snapshot we witnessed.
    ExternalChallenge { peer_id: NodeId, snapshot_hash: SnapshotHash, cosi: CosiSignature, transaction: Option<Transaction> },
    /// A finalized snapshot received from the network.
    Finalization { peer_id: NodeId, snapshot: Snapshot },
}

impl CosiAction {
    pub fn kind(&self) -> &'static str {
        match self {
            CosiAction::SelfEmpty { .. } => "self_empty",
            CosiAction::SelfCommitment { .. } => "self_commitment",
            CosiAction::SelfResponse { .. } => "self_response",
            CosiAction::ExternalAnnouncement { .. } => "external_announcement",
            CosiAction::ExternalChallenge { .. } => "external_challenge",
            CosiAction::Finalization { .. } => "finalization",
        }
    }

    pub fn peer_id(&self) -> NodeId {
        match self {
            CosiAction::SelfEmpty { peer_id, .. }
            | CosiAction::SelfCommitment { peer_id, .. }
            | CosiAction::SelfResponse { peer_id, .. }
            | CosiAction::ExternalAnnouncement { peer_id, .. }
            | CosiAction::ExternalChallenge { peer_id, .. }
            | CosiAction::Finalization { peer_id, .. } => *peer_id,
        }
    }
}
