use crate::domain::round::{CacheRound, FinalRound, Round};
use crate::domain::snapshot::{RoundLink, Snapshot, SnapshotWithTopologicalOrder};
use crate::domain::transaction::Transaction;
use crate::foundation::{NodeId, Result, RoundHash, TxHash};

/// A snapshot parked for retry once its prerequisites appear.
#[derive(Clone, Debug, PartialEq)]
pub struct QueuedSnapshot {
    pub peer_id: NodeId,
    pub snapshot: Snapshot,
    pub finalized: bool,
}

/// Durable storage contract the consensus core relies on. Implementations
/// provide their own synchronization; the kernel may call from the
/// dispatcher and from ingress tasks concurrently.
pub trait PersistStore: Send + Sync {
    fn read_round(&self, hash: &RoundHash) -> Result<Option<Round>>;

    /// Persist a finalized snapshot. Writing the same topological order
    /// twice is an invariant violation.
    fn write_snapshot(&self, snapshot: &SnapshotWithTopologicalOrder) -> Result<()>;

    fn start_new_round(&self, node_id: NodeId, number: u64, references: &RoundLink, final_start: u64) -> Result<()>;

    fn update_empty_head_round(&self, node_id: NodeId, number: u64, references: &RoundLink) -> Result<()>;

    /// Highest round of `to` already referenced by `from`'s chain.
    fn read_link(&self, from: NodeId, to: NodeId) -> Result<u64>;

    fn queue_append_snapshot(&self, peer_id: NodeId, snapshot: &Snapshot, finalized: bool) -> Result<()>;

    /// Pop up to `limit` queued snapshots for retry.
    fn poll_snapshot_queue(&self, limit: usize) -> Result<Vec<QueuedSnapshot>>;

    fn check_transaction_in_node(&self, node_id: NodeId, transaction: &TxHash) -> Result<bool>;

    /// Head rounds used to rebuild the in-memory graph at startup.
    fn read_round_heads(&self, node_id: NodeId) -> Result<Option<(CacheRound, FinalRound)>>;
}

/// The transaction pool surface the consensus core consumes. Payload
/// validation and execution live behind this trait.
pub trait TransactionStore: Send + Sync {
    /// Resolve a snapshot's transaction from the cache pool. Returns the
    /// transaction (if known) and whether the snapshot is already
    /// finalized for it.
    fn check_cache_snapshot_transaction(&self, snapshot: &Snapshot) -> Result<(Option<Transaction>, bool)>;

    /// Resolve the transaction behind a finalized snapshot received from a
    /// peer.
    fn check_final_snapshot_transaction(&self, snapshot: &Snapshot) -> Result<Option<Transaction>>;

    fn cache_put_transaction(&self, peer_id: NodeId, transaction: &Transaction) -> Result<()>;
}
