use crate::domain::crypto::{Commitment, PrivateKey, Response};
use crate::domain::snapshot::Snapshot;
use crate::domain::transaction::Transaction;
use crate::foundation::{NodeId, SnapshotHash};
use std::collections::{BTreeMap, HashMap, HashSet};
use tokio::sync::RwLock;

/// Proposer-side state for one in-flight snapshot. Created when the
/// announcement goes out, mutated only by the dispatcher, destroyed when
/// the snapshot finalizes or is rejected.
#[derive(Clone)]
pub struct CosiAggregator {
    pub snapshot: Snapshot,
    pub transaction: Transaction,
    pub want_txs: HashMap<NodeId, bool>,
    pub commitments: BTreeMap<usize, Commitment>,
    pub responses: BTreeMap<usize, Response>,
    pub committed: HashSet<NodeId>,
    pub responded: HashSet<NodeId>,
}

impl CosiAggregator {
    pub fn new(snapshot: Snapshot, transaction: Transaction) -> Self {
        Self {
            snapshot,
            transaction,
            want_txs: HashMap::new(),
            commitments: BTreeMap::new(),
            responses: BTreeMap::new(),
            committed: HashSet::new(),
            responded: HashSet::new(),
        }
    }
}

/// Signer-side state for one observed snapshot. The nonce is generated
/// fresh per snapshot and must never be reused or logged; `PrivateKey`
/// zeroizes on drop and has no `Debug`.
pub struct CosiVerifier {
    pub snapshot: Snapshot,
    pub random: PrivateKey,
}

impl CosiVerifier {
    pub fn new(snapshot: Snapshot, random: PrivateKey) -> Self {
        Self { snapshot, random }
    }
}

/// In-flight aggregators keyed by snapshot hash. Single writer (the
/// dispatcher), multiple readers (ingress validators take cloned
/// snapshots and cannot mutate dispatcher state).
pub struct AggregatorTable {
    inner: RwLock<HashMap<SnapshotHash, CosiAggregator>>,
}

impl AggregatorTable {
    pub fn new() -> Self {
        Self { inner: RwLock::new(HashMap::new()) }
    }

    pub async fn read(&self, hash: &SnapshotHash) -> Option<CosiAggregator> {
        self.inner.read().await.get(hash).cloned()
    }

    pub(crate) async fn write(&self) -> tokio::sync::RwLockWriteGuard<'_, HashMap<SnapshotHash, CosiAggregator>> {
        self.inner.write().await
    }

    pub async fn insert(&self, hash: SnapshotHash, aggregator: CosiAggregator) {
        self.inner.write().await.insert(hash, aggregator);
    }

    pub async fn remove(&self, hash: &SnapshotHash) {
        self.inner.write().await.remove(hash);
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.is_empty()
    }
}

impl Default for AggregatorTable {
    fn default() -> Self {
        Self::new()
    }
}
