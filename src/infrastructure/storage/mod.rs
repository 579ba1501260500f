pub mod memory;
pub mod traits;

pub use memory::{MemoryStore, MemoryTransactionStore};
pub use traits::{PersistStore, QueuedSnapshot, TransactionStore};
