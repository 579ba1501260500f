use crate::foundation::TxHash;
use serde::{Deserialize, Serialize};

/// The payload classes the consensus core distinguishes. Execution
/// semantics live outside the kernel; only node lifecycle transactions
/// change consensus behavior here.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionKind {
    Transfer,
    NodePledge,
    NodeAccept,
    NodeRemove,
}

/// The kernel's view of a transaction: a content hash plus its kind.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub hash: TxHash,
    pub kind: TransactionKind,
}

impl Transaction {
    pub const fn new(hash: TxHash, kind: TransactionKind) -> Self {
        Self { hash, kind }
    }

    pub fn is_node_accept(&self) -> bool {
        self.kind == TransactionKind::NodeAccept
    }
}
