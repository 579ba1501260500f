use crate::domain::crypto::{Commitment, CosiSignature, Response};
use crate::domain::snapshot::Snapshot;
use crate::domain::transaction::Transaction;
use crate::foundation::{KernelError, NodeId, Result, SnapshotHash};
use crate::infrastructure::transport::traits::Peer;
use async_trait::async_trait;
use std::sync::Mutex;

/// Everything a kernel pushed toward its peers, in send order.
#[derive(Clone, Debug, PartialEq)]
pub enum OutboundMessage {
    SnapshotAnnouncement { snapshot: Snapshot, commitment: Commitment },
    SnapshotCommitment { snapshot_hash: SnapshotHash, commitment: Commitment, want_tx: bool },
    TransactionChallenge { snapshot_hash: SnapshotHash, cosi: CosiSignature, transaction: Option<Transaction> },
    SnapshotResponse { snapshot_hash: SnapshotHash, response: Response },
    SnapshotFinalization { snapshot: Snapshot },
    SnapshotConfirm { snapshot_hash: SnapshotHash },
    PeerConfirmation { snapshot_hash: SnapshotHash },
    Transaction { transaction: Transaction },
}

/// Recording test double for the peer transport.
pub struct RecordingPeer {
    sent: Mutex<Vec<(NodeId, OutboundMessage)>>,
}

impl RecordingPeer {
    pub fn new() -> Self {
        Self { sent: Mutex::new(Vec::new()) }
    }

    pub fn sent(&self) -> Vec<(NodeId, OutboundMessage)> {
        self.sent.lock().expect("recording peer lock").clone()
    }

    pub fn drain(&self) -> Vec<(NodeId, OutboundMessage)> {
        std::mem::take(&mut *self.sent.lock().expect("recording peer lock"))
    }

    fn record(&self, peer_id: NodeId, message: OutboundMessage) -> Result<()> {
        self.sent
            .lock()
            .map_err(|_| KernelError::transport("record", "recording peer lock poisoned"))?
            .push((peer_id, message));
        Ok(())
    }
}

impl Default for RecordingPeer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Peer for RecordingPeer {
    async fn send_snapshot_announcement(&self, peer_id: NodeId, snapshot: &Snapshot, commitment: Commitment) -> Result<()> {
        self.record(peer_id, OutboundMessage::SnapshotAnnouncement { snapshot: snapshot.clone(), commitment })
    }

    async fn send_snapshot_commitment(
        &self,
        peer_id: NodeId,
        snapshot_hash: SnapshotHash,
        commitment: Commitment,
        want_tx: bool,
    ) -> Result<()> {
        self.record(peer_id, OutboundMessage::SnapshotCommitment { snapshot_hash, commitment, want_tx })
    }

    async fn send_transaction_challenge(
        &self,
        peer_id: NodeId,
        snapshot_hash: SnapshotHash,
        cosi: &CosiSignature,
        transaction: Option<&Transaction>,
    ) -> Result<()> {
        self.record(
            peer_id,
            OutboundMessage::TransactionChallenge { snapshot_hash, cosi: cosi.clone(), transaction: transaction.copied() },
        )
    }

    async fn send_snapshot_response(&self, peer_id: NodeId, snapshot_hash: SnapshotHash, response: Response) -> Result<()> {
        self.record(peer_id, OutboundMessage::SnapshotResponse { snapshot_hash, response })
    }

    async fn send_snapshot_finalization(&self, peer_id: NodeId, snapshot: &Snapshot) -> Result<()> {
        self.record(peer_id, OutboundMessage::SnapshotFinalization { snapshot: snapshot.clone() })
    }

    async fn send_snapshot_confirm(&self, peer_id: NodeId, snapshot_hash: SnapshotHash) -> Result<()> {
        self.record(peer_id, OutboundMessage::SnapshotConfirm { snapshot_hash })
    }

    async fn confirm_snapshot_for_peer(&self, peer_id: NodeId, snapshot_hash: SnapshotHash) {
        let _ = self.record(peer_id, OutboundMessage::PeerConfirmation { snapshot_hash });
    }

    async fn send_transaction(&self, peer_id: NodeId, transaction: &Transaction) -> Result<()> {
        self.record(peer_id, OutboundMessage::Transaction { transaction: *transaction })
    }
}
