pub mod clock;
pub mod constants;
pub mod error;
pub mod types;
pub mod util;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{ErrorCode, KernelError, Result};
pub use types::{Hash32, NodeId, RoundHash, SnapshotHash, TxHash};
pub use util::time::now_nanos;
