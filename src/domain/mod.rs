pub mod crypto;
pub mod node;
pub mod round;
pub mod snapshot;
pub mod transaction;

pub use node::{node_id_from_signer, ConsensusNode, NodeState};
pub use round::{CacheRound, FinalRound, Round};
pub use snapshot::{RoundLink, Snapshot, SnapshotWithTopologicalOrder};
pub use transaction::{Transaction, TransactionKind};
