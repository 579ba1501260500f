//! System-wide constants for the chorus consensus kernel.

/// Nanoseconds per second (10^9).
pub const NANOS_PER_SECOND: u64 = 1_000_000_000;

/// Nanoseconds per hour.
pub const NANOS_PER_HOUR: u64 = 60 * 60 * NANOS_PER_SECOND;

/// Snapshot version produced by this kernel. Version 0 snapshots take the
/// legacy multi-signature finalization path.
pub const SNAPSHOT_VERSION: u8 = 1;

/// Target duration of one round on a node's chain (3 seconds).
pub const SNAPSHOT_ROUND_GAP: u64 = 3 * NANOS_PER_SECOND;

/// How many rounds an external reference may lag behind the referenced
/// node's head, and the multiplier in the reference freshness windows.
pub const SNAPSHOT_REFERENCE_THRESHOLD: u64 = 10;

/// Maximum round distance between a referenced external round and the
/// referenced node's finalized head.
pub const SNAPSHOT_SYNC_ROUND_THRESHOLD: u64 = 100;

/// Minimum age of a consensus node before its snapshots are accepted
/// (12 hours). Genesis nodes are exempt.
pub const NODE_ACCEPT_PERIOD_MINIMUM: u64 = 12 * NANOS_PER_HOUR;

/// A non-genesis chain must reach this many rounds past the reference
/// threshold before other chains may reference it.
pub const ROUND_LIVENESS_FLOOR: u64 = 7;

/// How long a removed node's key keeps satisfying finalization
/// verification through single-position re-insertion.
pub const NODE_REMOVAL_GRACE_PERIOD: u64 = 12 * NANOS_PER_HOUR;

/// Poll slice while a self announcement waits for its timestamp to pass
/// the cache round head (100 milliseconds).
pub const TIMESTAMP_ADVANCE_SLICE_MS: u64 = 100;

/// A self snapshot may not land later than this fraction of the round gap
/// past the round's first snapshot: gap * 4 / 5.
pub const ROUND_GAP_LATE_NUMERATOR: u64 = 4;
pub const ROUND_GAP_LATE_DENOMINATOR: u64 = 5;

/// Signer mask width; consensus sets beyond this cannot be represented.
pub const COSI_MASK_BITS: usize = 64;
