//! In-memory reference implementation of the storage contracts, used by the
//! test suites and development networks.

use crate::domain::round::{CacheRound, FinalRound, Round};
use crate::domain::snapshot::{RoundLink, Snapshot, SnapshotWithTopologicalOrder};
use crate::domain::transaction::Transaction;
use crate::foundation::{KernelError, NodeId, Result, RoundHash, TxHash};
use crate::infrastructure::storage::traits::{PersistStore, QueuedSnapshot, TransactionStore};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard};

#[derive(Default)]
struct MemoryInner {
    rounds: HashMap<RoundHash, Round>,
    heads: HashMap<NodeId, (u64, RoundLink)>,
    links: HashMap<(NodeId, NodeId), u64>,
    snapshots: Vec<SnapshotWithTopologicalOrder>,
    orders: HashSet<u64>,
    node_transactions: HashSet<(NodeId, TxHash)>,
    queue: VecDeque<QueuedSnapshot>,
    round_heads: HashMap<NodeId, (CacheRound, FinalRound)>,
}

pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self { inner: Mutex::new(MemoryInner::default()) }
    }

    fn lock_inner(&self) -> Result<MutexGuard<'_, MemoryInner>> {
        self.inner.lock().map_err(|_| KernelError::storage("memory", "store lock poisoned"))
    }

    /// Seed a round so `read_round` can resolve external references.
    pub fn insert_round(&self, hash: RoundHash, round: Round) -> Result<()> {
        self.lock_inner()?.rounds.insert(hash, round);
        Ok(())
    }

    pub fn set_link(&self, from: NodeId, to: NodeId, number: u64) -> Result<()> {
        self.lock_inner()?.links.insert((from, to), number);
        Ok(())
    }

    /// Seed the head rounds returned by `read_round_heads` at startup.
    pub fn seed_round_heads(&self, node_id: NodeId, cache: CacheRound, last_final: FinalRound) -> Result<()> {
        self.lock_inner()?.round_heads.insert(node_id, (cache, last_final));
        Ok(())
    }

    pub fn written_snapshots(&self) -> Result<Vec<SnapshotWithTopologicalOrder>> {
        Ok(self.lock_inner()?.snapshots.clone())
    }

    pub fn queued_snapshots(&self) -> Result<Vec<QueuedSnapshot>> {
        Ok(self.lock_inner()?.queue.iter().cloned().collect())
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl PersistStore for MemoryStore {
    fn read_round(&self, hash: &RoundHash) -> Result<Option<Round>> {
        Ok(self.lock_inner()?.rounds.get(hash).copied())
    }

    fn write_snapshot(&self, snapshot: &SnapshotWithTopologicalOrder) -> Result<()> {
        let mut inner = self.lock_inner()?;
        if !inner.orders.insert(snapshot.topological_order) {
            return Err(KernelError::invariant(format!(
                "topological order {} written twice",
                snapshot.topological_order
            )));
        }
        inner
            .node_transactions
            .insert((snapshot.snapshot.node_id, snapshot.snapshot.transaction));
        inner.snapshots.push(snapshot.clone());
        Ok(())
    }

    fn start_new_round(&self, node_id: NodeId, number: u64, references: &RoundLink, final_start: u64) -> Result<()> {
        let mut inner = self.lock_inner()?;
        // The sealed predecessor is addressable by the new head's self
        // reference from now on.
        inner.rounds.entry(references.self_ref).or_insert(Round {
            node_id,
            number: number.saturating_sub(1),
            timestamp: final_start,
            references: *references,
        });
        if let Some(external) = inner.rounds.get(&references.external).copied() {
            let link = inner.links.entry((node_id, external.node_id)).or_insert(0);
            *link = (*link).max(external.number);
        }
        inner.heads.insert(node_id, (number, *references));
        Ok(())
    }

    fn update_empty_head_round(&self, node_id: NodeId, number: u64, references: &RoundLink) -> Result<()> {
        let mut inner = self.lock_inner()?;
        if let Some(external) = inner.rounds.get(&references.external).copied() {
            let link = inner.links.entry((node_id, external.node_id)).or_insert(0);
            *link = (*link).max(external.number);
        }
        inner.heads.insert(node_id, (number, *references));
        Ok(())
    }

    fn read_link(&self, from: NodeId, to: NodeId) -> Result<u64> {
        Ok(self.lock_inner()?.links.get(&(from, to)).copied().unwrap_or(0))
    }

    fn queue_append_snapshot(&self, peer_id: NodeId, snapshot: &Snapshot, finalized: bool) -> Result<()> {
        self.lock_inner()?.queue.push_back(QueuedSnapshot { peer_id, snapshot: snapshot.clone(), finalized });
        Ok(())
    }

    fn poll_snapshot_queue(&self, limit: usize) -> Result<Vec<QueuedSnapshot>> {
        let mut inner = self.lock_inner()?;
        let take = limit.min(inner.queue.len());
        Ok(inner.queue.drain(..take).collect())
    }

    fn check_transaction_in_node(&self, node_id: NodeId, transaction: &TxHash) -> Result<bool> {
        Ok(self.lock_inner()?.node_transactions.contains(&(node_id, *transaction)))
    }

    fn read_round_heads(&self, node_id: NodeId) -> Result<Option<(CacheRound, FinalRound)>> {
        Ok(self.lock_inner()?.round_heads.get(&node_id).cloned())
    }
}

/// In-memory transaction pool: transactions are registered up front and a
/// snapshot resolves to whichever one it references.
pub struct MemoryTransactionStore {
    inner: Mutex<TransactionInner>,
}

#[derive(Default)]
struct TransactionInner {
    transactions: HashMap<TxHash, Transaction>,
    finalized: HashSet<(NodeId, TxHash)>,
}

impl MemoryTransactionStore {
    pub fn new() -> Self {
        Self { inner: Mutex::new(TransactionInner::default()) }
    }

    fn lock_inner(&self) -> Result<MutexGuard<'_, TransactionInner>> {
        self.inner.lock().map_err(|_| KernelError::storage("memory", "transaction pool lock poisoned"))
    }

    pub fn insert(&self, transaction: Transaction) -> Result<()> {
        self.lock_inner()?.transactions.insert(transaction.hash, transaction);
        Ok(())
    }

    pub fn mark_finalized(&self, node_id: NodeId, transaction: TxHash) -> Result<()> {
        self.lock_inner()?.finalized.insert((node_id, transaction));
        Ok(())
    }
}

impl Default for MemoryTransactionStore {
    fn default() -> Self {
        Self::new()
    }
}

impl TransactionStore for MemoryTransactionStore {
    fn check_cache_snapshot_transaction(&self, snapshot: &Snapshot) -> Result<(Option<Transaction>, bool)> {
        let inner = self.lock_inner()?;
        let transaction = inner.transactions.get(&snapshot.transaction).copied();
        let finalized = inner.finalized.contains(&(snapshot.node_id, snapshot.transaction));
        Ok((transaction, finalized))
    }

    fn check_final_snapshot_transaction(&self, snapshot: &Snapshot) -> Result<Option<Transaction>> {
        Ok(self.lock_inner()?.transactions.get(&snapshot.transaction).copied())
    }

    fn cache_put_transaction(&self, _peer_id: NodeId, transaction: &Transaction) -> Result<()> {
        self.insert(*transaction)
    }
}
