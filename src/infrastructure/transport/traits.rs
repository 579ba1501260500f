use crate::domain::crypto::{Commitment, CosiSignature, Response};
use crate::domain::snapshot::Snapshot;
use crate::domain::transaction::Transaction;
use crate::foundation::{NodeId, Result, SnapshotHash};
use async_trait::async_trait;

/// Authenticated point-to-point messaging toward other consensus nodes.
/// Implementations must be safe to call from the dispatcher and from
/// ingress tasks concurrently.
#[async_trait]
pub trait Peer: Send + Sync {
    async fn send_snapshot_announcement(&self, peer_id: NodeId, snapshot: &Snapshot, commitment: Commitment) -> Result<()>;

    async fn send_snapshot_commitment(
        &self,
        peer_id: NodeId,
        snapshot_hash: SnapshotHash,
        commitment: Commitment,
        want_tx: bool,
    ) -> Result<()>;

    async fn send_transaction_challenge(
        &self,
        peer_id: NodeId,
        snapshot_hash: SnapshotHash,
        cosi: &CosiSignature,
        transaction: Option<&Transaction>,
    ) -> Result<()>;

    async fn send_snapshot_response(&self, peer_id: NodeId, snapshot_hash: SnapshotHash, response: Response) -> Result<()>;

    async fn send_snapshot_finalization(&self, peer_id: NodeId, snapshot: &Snapshot) -> Result<()>;

    async fn send_snapshot_confirm(&self, peer_id: NodeId, snapshot_hash: SnapshotHash) -> Result<()>;

    /// Mark the snapshot as confirmed for the peer's sync bookkeeping.
    async fn confirm_snapshot_for_peer(&self, peer_id: NodeId, snapshot_hash: SnapshotHash);

    async fn send_transaction(&self, peer_id: NodeId, transaction: &Transaction) -> Result<()>;
}
