#![allow(dead_code)]

use chorus_core::application::{CosiDispatcher, Kernel, KernelOptions};
use chorus_core::domain::crypto::{Commitment, CosiSignature, PrivateKey, PublicKey};
use chorus_core::domain::{CacheRound, ConsensusNode, FinalRound, NodeState, RoundLink, Snapshot, Transaction, TransactionKind};
use chorus_core::foundation::constants::SNAPSHOT_VERSION;
use chorus_core::foundation::{Hash32, ManualClock, NodeId, RoundHash, SnapshotHash, TxHash};
use chorus_core::infrastructure::cache::MemoryCacheStore;
use chorus_core::infrastructure::config::KernelConfig;
use chorus_core::infrastructure::storage::{MemoryStore, MemoryTransactionStore};
use chorus_core::infrastructure::transport::{OutboundMessage, RecordingPeer};
use rand_chacha::rand_core::SeedableRng;
use rand_chacha::ChaCha20Rng;
use std::collections::BTreeMap;
use std::sync::Arc;

pub const NETWORK_ID: Hash32 = [42u8; 32];
pub const BASE_TIMESTAMP: u64 = 1_700_000_000_000_000_000;

pub struct Member {
    pub key: PrivateKey,
    pub node: ConsensusNode,
    pub id: NodeId,
}

pub fn make_members(rng: &mut ChaCha20Rng, count: usize) -> Vec<Member> {
    (0..count)
        .map(|i| {
            let key = PrivateKey::generate(rng);
            let node = ConsensusNode::new(key.public(), key.public(), NodeState::Accepted, 0, TxHash::new([i as u8; 32]));
            let id = node.id_for_network(&NETWORK_ID);
            Member { key, node, id }
        })
        .collect()
}

pub struct Harness {
    pub kernel: Kernel,
    pub dispatcher: CosiDispatcher,
    pub peer: Arc<RecordingPeer>,
    pub store: Arc<MemoryStore>,
    pub pool: Arc<MemoryTransactionStore>,
    pub clock: Arc<ManualClock>,
    pub members: Vec<Member>,
}

impl Harness {
    pub fn member_index(&self, member: &Member) -> usize {
        self.kernel
            .sorted_consensus_nodes()
            .expect("consensus nodes readable")
            .iter()
            .position(|id| *id == member.id)
            .expect("member in consensus set")
    }

    pub fn member_by_id(&self, id: NodeId) -> &Member {
        self.members.iter().find(|member| member.id == id).expect("member known")
    }
}

/// A cluster where this kernel is genesis member 0. `seed` runs against
/// the store before the kernel loads its round graph.
pub fn genesis_harness(count: usize, seed: impl FnOnce(&MemoryStore, &[Member])) -> Harness {
    let mut rng = ChaCha20Rng::seed_from_u64(0x5EED);
    let members = make_members(&mut rng, count);
    let store = Arc::new(MemoryStore::new());
    seed(&store, &members);

    let pool = Arc::new(MemoryTransactionStore::new());
    let peer = Arc::new(RecordingPeer::new());
    let clock = Arc::new(ManualClock::new(BASE_TIMESTAMP));

    let (kernel, dispatcher) = Kernel::new(KernelOptions {
        network_id: NETWORK_ID,
        signer: members[0].key.clone(),
        config: KernelConfig::default(),
        genesis: members.iter().map(|member| member.node).collect(),
        pledging: None,
        persist: store.clone(),
        transactions: pool.clone(),
        peer: peer.clone(),
        cache: Arc::new(MemoryCacheStore::new()),
        clock: clock.clone(),
    })
    .expect("kernel construction");

    Harness { kernel, dispatcher, peer, store, pool, clock, members }
}

/// A cluster where this kernel is a pledging node outside the genesis
/// consensus set. Returns the harness plus the pledger member.
pub fn pledging_harness(genesis_count: usize) -> (Harness, Member) {
    let mut rng = ChaCha20Rng::seed_from_u64(0xACCE);
    let members = make_members(&mut rng, genesis_count);

    let pledger_key = PrivateKey::generate(&mut rng);
    let pledger_node = ConsensusNode::new(
        pledger_key.public(),
        pledger_key.public(),
        NodeState::Pledging,
        0,
        TxHash::new([0xEE; 32]),
    );
    let pledger = Member { key: pledger_key.clone(), node: pledger_node, id: pledger_node.id_for_network(&NETWORK_ID) };

    let store = Arc::new(MemoryStore::new());
    let pool = Arc::new(MemoryTransactionStore::new());
    let peer = Arc::new(RecordingPeer::new());
    let clock = Arc::new(ManualClock::new(BASE_TIMESTAMP));

    let (kernel, dispatcher) = Kernel::new(KernelOptions {
        network_id: NETWORK_ID,
        signer: pledger_key,
        config: KernelConfig::default(),
        genesis: members.iter().map(|member| member.node).collect(),
        pledging: Some(pledger_node),
        persist: store.clone(),
        transactions: pool.clone(),
        peer: peer.clone(),
        cache: Arc::new(MemoryCacheStore::new()),
        clock: clock.clone(),
    })
    .expect("kernel construction");

    (Harness { kernel, dispatcher, peer, store, pool, clock, members }, pledger)
}

pub fn transfer_transaction(seed: u8) -> Transaction {
    Transaction::new(TxHash::new([seed; 32]), TransactionKind::Transfer)
}

pub fn snapshot_on(node: NodeId, round: u64, references: Option<RoundLink>, timestamp: u64, transaction: TxHash) -> Snapshot {
    let mut snapshot = Snapshot::new(SNAPSHOT_VERSION, node, transaction);
    snapshot.round_number = round;
    snapshot.references = references;
    snapshot.timestamp = timestamp;
    snapshot.hash = snapshot.payload_hash();
    snapshot
}

/// A head round pre-filled with snapshots at the given timestamps.
pub fn seeded_cache_round(node: NodeId, number: u64, references: Option<RoundLink>, timestamps: &[u64]) -> CacheRound {
    let mut cache = CacheRound::new(node, number, timestamps.iter().copied().max().unwrap_or(0), references);
    for (i, &timestamp) in timestamps.iter().enumerate() {
        cache
            .snapshots
            .push(snapshot_on(node, number, references, timestamp, TxHash::new([0xA0 + i as u8; 32])));
    }
    cache
}

pub fn final_round_at(node: NodeId, number: u64, hash_seed: u8, start: u64) -> FinalRound {
    FinalRound { node_id: node, number, hash: RoundHash::new([hash_seed; 32]), start, end: start + 200_000_000 }
}

/// Run the full co-signing ceremony off-line: aggregate commitments from
/// the given signers, derive the challenge, and fold in every response.
pub fn cosign(
    hash: &SnapshotHash,
    signers: &[(usize, &PrivateKey)],
    publics: &[PublicKey],
    rng: &mut ChaCha20Rng,
) -> CosiSignature {
    let nonces: Vec<(usize, PrivateKey)> = signers.iter().map(|(index, _)| (*index, PrivateKey::generate(rng))).collect();
    let commitments: BTreeMap<usize, Commitment> =
        nonces.iter().map(|(index, nonce)| (*index, Commitment::from(nonce.public()))).collect();
    let mut cosi = CosiSignature::aggregate_commitments(&commitments).expect("aggregate commitments");
    let challenge = cosi.challenge(publics, hash.as_ref()).expect("challenge");
    for ((index, key), (_, nonce)) in signers.iter().zip(nonces.iter()) {
        let signature = key.sign_with_challenge(nonce, &challenge);
        cosi.aggregate_signature(*index, &signature).expect("aggregate response");
    }
    cosi
}

pub fn announcements_of(peer: &RecordingPeer) -> Vec<(NodeId, Snapshot, Commitment)> {
    peer.sent()
        .into_iter()
        .filter_map(|(id, message)| match message {
            OutboundMessage::SnapshotAnnouncement { snapshot, commitment } => Some((id, snapshot, commitment)),
            _ => None,
        })
        .collect()
}

pub fn challenges_of(peer: &RecordingPeer) -> Vec<(NodeId, SnapshotHash, CosiSignature, Option<Transaction>)> {
    peer.sent()
        .into_iter()
        .filter_map(|(id, message)| match message {
            OutboundMessage::TransactionChallenge { snapshot_hash, cosi, transaction } => {
                Some((id, snapshot_hash, cosi, transaction))
            }
            _ => None,
        })
        .collect()
}

pub fn commitments_of(peer: &RecordingPeer) -> Vec<(NodeId, SnapshotHash, Commitment, bool)> {
    peer.sent()
        .into_iter()
        .filter_map(|(id, message)| match message {
            OutboundMessage::SnapshotCommitment { snapshot_hash, commitment, want_tx } => {
                Some((id, snapshot_hash, commitment, want_tx))
            }
            _ => None,
        })
        .collect()
}

pub fn finalizations_of(peer: &RecordingPeer) -> Vec<(NodeId, Snapshot)> {
    peer.sent()
        .into_iter()
        .filter_map(|(id, message)| match message {
            OutboundMessage::SnapshotFinalization { snapshot } => Some((id, snapshot)),
            _ => None,
        })
        .collect()
}
