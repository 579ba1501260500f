use crate::domain::crypto::{new_hash, PublicKey};
use crate::foundation::{Hash32, NodeId, TxHash};
use serde::{Deserialize, Serialize};

/// Lifecycle of a consensus node.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeState {
    Pledging,
    Accepted,
    Removed,
}

/// A node participating (or pledging to participate) in consensus.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConsensusNode {
    pub signer: PublicKey,
    pub payee: PublicKey,
    pub state: NodeState,
    pub timestamp: u64,
    pub transaction: TxHash,
}

impl ConsensusNode {
    pub fn new(signer: PublicKey, payee: PublicKey, state: NodeState, timestamp: u64, transaction: TxHash) -> Self {
        Self { signer, payee, state, timestamp, transaction }
    }

    /// Network-scoped node identity: the same signer key yields different
    /// ids on different networks.
    pub fn id_for_network(&self, network_id: &Hash32) -> NodeId {
        node_id_from_signer(&self.signer, network_id)
    }
}

/// Identity of a signer key on a given network.
pub fn node_id_from_signer(signer: &PublicKey, network_id: &Hash32) -> NodeId {
    let mut data = Vec::with_capacity(64);
    data.extend_from_slice(network_id);
    data.extend_from_slice(signer.as_bytes());
    NodeId::new(new_hash(&data))
}
