//! Kernel state shared between the dispatcher and the networking-facing
//! ingress API.
//!
//! The `Kernel` handle is what the networking layer holds: every ingress
//! call validates its input against shared read-only state and enqueues a
//! `CosiAction`; all mutation of the round graph and signing state happens
//! on the dispatcher side of the channel.

use crate::application::action::CosiAction;
use crate::application::aggregator::AggregatorTable;
use crate::application::dispatcher::CosiDispatcher;
use crate::application::graph::load_round_graph;
use crate::domain::crypto::{Commitment, CosiSignature, PrivateKey, PublicKey, Response};
use crate::domain::node::{node_id_from_signer, ConsensusNode, NodeState};
use crate::domain::snapshot::Snapshot;
use crate::domain::transaction::Transaction;
use crate::foundation::constants::SNAPSHOT_VERSION;
use crate::foundation::{Clock, Hash32, KernelError, NodeId, Result, SnapshotHash, TxHash};
use crate::infrastructure::cache::{CacheStore, CacheVerifier};
use crate::infrastructure::config::KernelConfig;
use crate::infrastructure::storage::{PersistStore, TransactionStore};
use crate::infrastructure::transport::Peer;
use log::{debug, warn};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::{mpsc, watch};

pub(crate) struct ConsensusState {
    pub nodes: HashMap<NodeId, ConsensusNode>,
    pub sorted: Vec<NodeId>,
    pub pledging: Option<(NodeId, ConsensusNode)>,
    pub genesis: HashSet<NodeId>,
    pub removed: Vec<(NodeId, ConsensusNode)>,
    pub index: Option<usize>,
}

impl ConsensusState {
    pub(crate) fn rebuild(&mut self, self_id: NodeId) {
        let mut sorted: Vec<NodeId> = self.nodes.keys().copied().collect();
        sorted.sort();
        self.index = sorted.iter().position(|id| *id == self_id);
        self.sorted = sorted;
    }
}

pub(crate) struct SyncStatus {
    caught_up: AtomicBool,
    broadcasted: AtomicBool,
}

pub(crate) struct KernelShared {
    pub(crate) id: NodeId,
    pub(crate) network_id: Hash32,
    pub(crate) signer: PrivateKey,
    pub(crate) config: KernelConfig,
    pub(crate) persist: Arc<dyn PersistStore>,
    pub(crate) transactions: Arc<dyn TransactionStore>,
    pub(crate) peer: Arc<dyn Peer>,
    pub(crate) cache: Arc<CacheVerifier>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) aggregators: AggregatorTable,
    pub(crate) consensus: RwLock<ConsensusState>,
    pub(crate) sync: SyncStatus,
    topology: AtomicU64,
    actions: mpsc::UnboundedSender<CosiAction>,
}

impl KernelShared {
    pub(crate) fn now_nanos(&self) -> u64 {
        self.clock.now_nanos()
    }

    pub(crate) fn next_topological_order(&self) -> u64 {
        self.topology.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub(crate) fn send_action(&self, action: CosiAction) -> Result<()> {
        self.actions.send(action).map_err(|_| KernelError::ChannelClosed)
    }

    /// A poisoned consensus table means a writer died mid-update; treat
    /// it as the invariant violation it is instead of panicking here.
    fn with_consensus<T>(&self, read: impl FnOnce(&ConsensusState) -> T) -> Result<T> {
        let state = self
            .consensus
            .read()
            .map_err(|_| KernelError::invariant("consensus state lock poisoned"))?;
        Ok(read(&state))
    }

    pub(crate) fn sorted_consensus_nodes(&self) -> Result<Vec<NodeId>> {
        self.with_consensus(|state| state.sorted.clone())
    }

    pub(crate) fn consensus_index(&self) -> Result<Option<usize>> {
        self.with_consensus(|state| state.index)
    }

    /// 2f+1 supermajority over the consensus set active at `timestamp`.
    pub(crate) fn consensus_threshold(&self, _timestamp: u64) -> Result<usize> {
        self.with_consensus(|state| state.nodes.len() * 2 / 3 + 1)
    }

    /// Signer keys of the accepted nodes, in sorted node id order.
    pub(crate) fn consensus_keys(&self, _timestamp: u64) -> Result<Vec<PublicKey>> {
        self.with_consensus(|state| {
            state
                .sorted
                .iter()
                .filter_map(|id| state.nodes.get(id))
                .map(|node| node.signer)
                .collect()
        })
    }

    pub(crate) fn consensus_node(&self, peer_id: &NodeId) -> Result<Option<ConsensusNode>> {
        self.with_consensus(|state| state.nodes.get(peer_id).copied())
    }

    /// The pledging node answers for its own id before it is accepted.
    pub(crate) fn get_peer_consensus_node(&self, peer_id: &NodeId) -> Result<Option<ConsensusNode>> {
        self.with_consensus(|state| {
            if let Some((pledging_id, pledging)) = &state.pledging {
                if pledging_id == peer_id {
                    return Some(*pledging);
                }
            }
            state.nodes.get(peer_id).copied()
        })
    }

    pub(crate) fn pledging(&self) -> Result<Option<(NodeId, ConsensusNode)>> {
        self.with_consensus(|state| state.pledging)
    }

    pub(crate) fn is_genesis(&self, node_id: &NodeId) -> Result<bool> {
        self.with_consensus(|state| state.genesis.contains(node_id))
    }

    pub(crate) fn accepted_node_ids(&self) -> Result<HashSet<NodeId>> {
        self.with_consensus(|state| state.nodes.keys().copied().collect())
    }

    pub(crate) fn signer_index_of(&self, peer_id: &NodeId) -> Result<Option<usize>> {
        self.with_consensus(|state| state.sorted.iter().position(|id| id == peer_id))
    }

    pub(crate) fn consensus_removed_recently(&self, timestamp: u64) -> Result<Option<ConsensusNode>> {
        let grace = self.config.consensus.node_removal_grace_period;
        self.with_consensus(|state| {
            state
                .removed
                .iter()
                .find(|(_, node)| node.timestamp.saturating_add(grace) > timestamp)
                .map(|(_, node)| *node)
        })
    }

    /// Whether `s` could be the pledging node's bootstrap snapshot,
    /// without consulting its transaction.
    pub(crate) fn check_initial_accept_snapshot_weak(&self, s: &Snapshot) -> Result<bool> {
        self.with_consensus(|state| {
            let Some((pledging_id, _)) = &state.pledging else {
                return false;
            };
            if state.genesis.contains(&s.node_id) {
                return false;
            }
            s.node_id == *pledging_id && s.round_number == 0
        })
    }

    pub(crate) fn check_catch_up_with_peers(&self) -> bool {
        self.sync.caught_up.load(Ordering::SeqCst)
    }

    pub(crate) fn check_broadcasted_to_peers(&self) -> bool {
        self.sync.broadcasted.load(Ordering::SeqCst)
    }

    /// Resolve a snapshot's transaction from the pool, treating storage
    /// errors as "not available yet".
    pub(crate) fn cache_snapshot_transaction(&self, s: &Snapshot) -> Option<(Option<Transaction>, bool)> {
        match self.transactions.check_cache_snapshot_transaction(s) {
            Ok(result) => Some(result),
            Err(err) => {
                warn!("transaction lookup failed for snapshot {}: {}", s.hash, err);
                None
            }
        }
    }
}

pub struct KernelOptions {
    pub network_id: Hash32,
    pub signer: PrivateKey,
    pub config: KernelConfig,
    pub genesis: Vec<ConsensusNode>,
    pub pledging: Option<ConsensusNode>,
    pub persist: Arc<dyn PersistStore>,
    pub transactions: Arc<dyn TransactionStore>,
    pub peer: Arc<dyn Peer>,
    pub cache: Arc<dyn CacheStore>,
    pub clock: Arc<dyn Clock>,
}

/// Handle the networking layer uses to feed the consensus core.
#[derive(Clone)]
pub struct Kernel {
    pub(crate) shared: Arc<KernelShared>,
    shutdown: Arc<watch::Sender<bool>>,
}

impl Kernel {
    pub fn new(options: KernelOptions) -> Result<(Kernel, CosiDispatcher)> {
        options.config.validate()?;
        let self_id = node_id_from_signer(&options.signer.public(), &options.network_id);

        let mut nodes = HashMap::new();
        let mut genesis = HashSet::new();
        for node in options.genesis {
            let id = node.id_for_network(&options.network_id);
            genesis.insert(id);
            nodes.insert(id, node);
        }
        let pledging = options.pledging.map(|node| (node.id_for_network(&options.network_id), node));
        let mut consensus =
            ConsensusState { nodes, sorted: Vec::new(), pledging, genesis, removed: Vec::new(), index: None };
        consensus.rebuild(self_id);

        let mut graph_nodes: HashSet<NodeId> = consensus.nodes.keys().copied().collect();
        graph_nodes.insert(self_id);
        let graph = load_round_graph(&options.persist, graph_nodes)?;

        let (actions_tx, actions_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let shared = Arc::new(KernelShared {
            id: self_id,
            network_id: options.network_id,
            signer: options.signer,
            config: options.config,
            persist: options.persist,
            transactions: options.transactions,
            peer: options.peer,
            cache: Arc::new(CacheVerifier::new(options.cache)),
            clock: options.clock,
            aggregators: AggregatorTable::new(),
            consensus: RwLock::new(consensus),
            sync: SyncStatus { caught_up: AtomicBool::new(true), broadcasted: AtomicBool::new(true) },
            topology: AtomicU64::new(0),
            actions: actions_tx,
        });

        let dispatcher = CosiDispatcher::new(shared.clone(), graph, actions_rx, shutdown_rx);
        Ok((Kernel { shared, shutdown: Arc::new(shutdown_tx) }, dispatcher))
    }

    pub fn id(&self) -> NodeId {
        self.shared.id
    }

    pub fn network_id(&self) -> Hash32 {
        self.shared.network_id
    }

    pub fn cache_verifier(&self) -> Arc<CacheVerifier> {
        self.shared.cache.clone()
    }

    pub async fn aggregator_snapshot(&self, hash: &SnapshotHash) -> Option<crate::application::aggregator::CosiAggregator> {
        self.shared.aggregators.read(hash).await
    }

    pub fn consensus_node(&self, peer_id: &NodeId) -> Result<Option<ConsensusNode>> {
        self.shared.consensus_node(peer_id)
    }

    pub fn consensus_threshold(&self, timestamp: u64) -> Result<usize> {
        self.shared.consensus_threshold(timestamp)
    }

    pub fn consensus_keys(&self, timestamp: u64) -> Result<Vec<PublicKey>> {
        self.shared.consensus_keys(timestamp)
    }

    pub fn sorted_consensus_nodes(&self) -> Result<Vec<NodeId>> {
        self.shared.sorted_consensus_nodes()
    }

    /// Sync gates maintained by the (out of scope) peer sync subsystem.
    pub fn set_caught_up(&self, caught_up: bool) {
        self.shared.sync.caught_up.store(caught_up, Ordering::SeqCst);
    }

    pub fn set_broadcasted(&self, broadcasted: bool) {
        self.shared.sync.broadcasted.store(broadcasted, Ordering::SeqCst);
    }

    /// Signal the dispatcher (and any queue consumer) to stop.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }

    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    /// Park a locally produced transaction as a bare self snapshot; the
    /// queue consumer turns it into a `SelfEmpty` action.
    pub fn queue_transaction_snapshot(&self, transaction: TxHash) -> Result<()> {
        let snapshot = Snapshot::new(SNAPSHOT_VERSION, self.shared.id, transaction);
        self.shared.persist.queue_append_snapshot(self.shared.id, &snapshot, false)
    }

    /// Re-enqueue parked snapshots as actions. Returns how many were
    /// dispatched. This is the retry edge: snapshots deferred for missing
    /// prerequisites come back through here until they apply.
    pub fn drain_snapshot_queue(&self, limit: usize) -> Result<usize> {
        let entries = self.shared.persist.poll_snapshot_queue(limit)?;
        let mut dispatched = 0;
        for entry in entries {
            let snapshot = entry.snapshot;
            let action = if entry.finalized {
                CosiAction::Finalization { peer_id: entry.peer_id, snapshot }
            } else if snapshot.node_id == self.shared.id && snapshot.timestamp == 0 && snapshot.signature.is_none() {
                CosiAction::SelfEmpty { peer_id: self.shared.id, snapshot }
            } else if let Some(commitment) = snapshot.commitment {
                CosiAction::ExternalAnnouncement { peer_id: entry.peer_id, snapshot, commitment }
            } else {
                debug!("dropping queued snapshot {} without commitment", snapshot.hash);
                continue;
            };
            self.shared.send_action(action)?;
            dispatched += 1;
        }
        Ok(dispatched)
    }

    /// Periodically drain the snapshot queue until shutdown.
    pub async fn run_queue_consumer(&self, poll_interval: Duration) -> Result<()> {
        let mut shutdown = self.shutdown.subscribe();
        let mut ticker = tokio::time::interval(poll_interval);
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return Ok(());
                    }
                }
                _ = ticker.tick() => {
                    self.drain_snapshot_queue(64)?;
                }
            }
        }
    }

    /// Enqueue an `ExternalAnnouncement` if the peer is a consensus node
    /// and the snapshot shape is legal.
    pub fn cosi_queue_external_announcement(&self, peer_id: NodeId, mut snapshot: Snapshot, commitment: Commitment) -> Result<()> {
        if self.shared.get_peer_consensus_node(&peer_id)?.is_none() {
            return Ok(());
        }
        if snapshot.version != SNAPSHOT_VERSION {
            return Ok(());
        }
        if snapshot.node_id == self.shared.id || snapshot.node_id != peer_id {
            return Ok(());
        }
        if snapshot.signature.is_some() || snapshot.timestamp == 0 {
            return Ok(());
        }
        snapshot.hash = snapshot.payload_hash();
        snapshot.commitment = Some(commitment);
        self.shared.persist.queue_append_snapshot(peer_id, &snapshot, false)
    }

    pub fn cosi_aggregate_self_commitments(
        &self,
        peer_id: NodeId,
        snapshot_hash: SnapshotHash,
        commitment: Commitment,
        want_tx: bool,
    ) -> Result<()> {
        if self.shared.consensus_node(&peer_id)?.is_none() {
            return Ok(());
        }
        self.shared.send_action(CosiAction::SelfCommitment { peer_id, snapshot_hash, commitment, want_tx })
    }

    pub fn cosi_queue_external_challenge(
        &self,
        peer_id: NodeId,
        snapshot_hash: SnapshotHash,
        cosi: CosiSignature,
        transaction: Option<Transaction>,
    ) -> Result<()> {
        if self.shared.get_peer_consensus_node(&peer_id)?.is_none() {
            return Ok(());
        }
        self.shared.send_action(CosiAction::ExternalChallenge { peer_id, snapshot_hash, cosi, transaction })
    }

    /// Validate a peer's response against the stored commitment and the
    /// consensus keys before letting it onto the action channel. Invalid
    /// responses are dropped silently.
    pub async fn cosi_aggregate_self_responses(&self, peer_id: NodeId, snapshot_hash: SnapshotHash, response: Response) -> Result<()> {
        if self.shared.consensus_node(&peer_id)?.is_none() {
            return Ok(());
        }
        let Some(aggregator) = self.shared.aggregators.read(&snapshot_hash).await else {
            return Ok(());
        };

        let s = &aggregator.snapshot;
        let Some((Some(_), false)) = self.shared.cache_snapshot_transaction(s) else {
            return Ok(());
        };

        let Some(index) = self.shared.signer_index_of(&peer_id)? else {
            return Ok(());
        };
        let mut publics = self.shared.consensus_keys(s.timestamp)?;
        if self.shared.check_initial_accept_snapshot_weak(s)? {
            if let Some((_, pledging)) = self.shared.pledging()? {
                publics.push(pledging.signer);
            }
        }
        let Some(signature) = s.signature.as_ref() else {
            return Ok(());
        };
        let Ok(challenge) = signature.challenge(&publics, snapshot_hash.as_ref()) else {
            return Ok(());
        };

        let Some(commitment) = aggregator.commitments.get(&index) else {
            return Ok(());
        };
        let Ok(sig) = signature.load_response_signature(commitment, &response) else {
            return Ok(());
        };
        let Some(public) = publics.get(index) else {
            return Ok(());
        };
        if !public.verify_with_challenge(&sig, &challenge) {
            debug!("dropping invalid response for {} from {}", snapshot_hash, peer_id);
            return Ok(());
        }

        self.shared.send_action(CosiAction::SelfResponse { peer_id, snapshot_hash, response })
    }

    /// Pre-verify a finalized snapshot from the network, confirm it to the
    /// peer, and park it for the dispatcher.
    pub async fn verify_and_queue_append_snapshot_finalization(&self, peer_id: NodeId, mut snapshot: Snapshot) -> Result<()> {
        snapshot.hash = snapshot.payload_hash();
        debug!("finalization received from {} for {}", peer_id, snapshot.hash);
        if self.shared.config.node.consensus_only && self.shared.get_peer_consensus_node(&peer_id)?.is_none() {
            debug!("finalization from non-consensus peer {} dropped", peer_id);
            return Ok(());
        }

        self.shared.peer.confirm_snapshot_for_peer(peer_id, snapshot.hash).await;
        self.shared.peer.send_snapshot_confirm(peer_id, snapshot.hash).await?;

        if self.shared.persist.check_transaction_in_node(snapshot.node_id, &snapshot.transaction)? {
            debug!("snapshot {} already finalized in node {}", snapshot.hash, snapshot.node_id);
            return Ok(());
        }

        if snapshot.version == 0 {
            return self.legacy_append_finalization(peer_id, snapshot);
        }
        if !self.shared.verify_finalization(&snapshot)? {
            let threshold = self.shared.consensus_threshold(snapshot.timestamp)?;
            warn!("finalization verification failed for {} from {} threshold {}", snapshot.hash, peer_id, threshold);
            return Ok(());
        }

        self.shared.persist.queue_append_snapshot(peer_id, &snapshot, true)
    }

    /// Version-0 snapshots predate collective signing and carry a plain
    /// signature list; they only need a threshold count to queue.
    fn legacy_append_finalization(&self, peer_id: NodeId, snapshot: Snapshot) -> Result<()> {
        let count = snapshot.legacy_signatures.as_ref().map(Vec::len).unwrap_or(0);
        if count < self.shared.consensus_threshold(snapshot.timestamp)? {
            return Ok(());
        }
        self.shared.persist.queue_append_snapshot(peer_id, &snapshot, true)
    }
}

// Consensus table mutations driven by finalized lifecycle transactions.
impl KernelShared {
    fn with_consensus_mut(&self, write: impl FnOnce(&mut ConsensusState)) -> Result<()> {
        let mut state = self
            .consensus
            .write()
            .map_err(|_| KernelError::invariant("consensus state lock poisoned"))?;
        write(&mut state);
        Ok(())
    }

    pub(crate) fn accept_pledging_node(&self, node_id: NodeId, timestamp: u64) -> Result<()> {
        let self_id = self.id;
        self.with_consensus_mut(|state| {
            let Some((pledging_id, mut node)) = state.pledging.take() else {
                return;
            };
            if pledging_id != node_id {
                state.pledging = Some((pledging_id, node));
                return;
            }
            node.state = NodeState::Accepted;
            node.timestamp = timestamp;
            state.nodes.insert(node_id, node);
            state.rebuild(self_id);
        })
    }

    pub(crate) fn remove_consensus_node(&self, node_id: NodeId, timestamp: u64) -> Result<()> {
        let self_id = self.id;
        self.with_consensus_mut(|state| {
            let Some(mut node) = state.nodes.remove(&node_id) else {
                return;
            };
            node.state = NodeState::Removed;
            node.timestamp = timestamp;
            state.removed.push((node_id, node));
            state.rebuild(self_id);
        })
    }
}
