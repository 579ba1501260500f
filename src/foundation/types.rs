use crate::foundation::util::encoding::parse_hex_32bytes;
use crate::foundation::KernelError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub type Hash32 = [u8; 32];

/// 32-byte content-hash identifier.
///
/// All ids serialize as the raw hash (32 bytes under bincode) and render
/// as lowercase hex; `FromStr` accepts the hex back, with or without a
/// `0x` prefix. `Debug` includes the type name so log lines stay
/// distinguishable.
macro_rules! define_hash_id {
    ($name:ident) => {
        #[derive(Clone, Copy, Default, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Hash32);

        impl $name {
            pub const fn new(value: Hash32) -> Self {
                Self(value)
            }

            pub const fn as_hash(&self) -> &Hash32 {
                &self.0
            }
        }

        impl AsRef<[u8]> for $name {
            fn as_ref(&self) -> &[u8] {
                &self.0
            }
        }

        impl From<Hash32> for $name {
            fn from(value: Hash32) -> Self {
                Self(value)
            }
        }

        impl FromStr for $name {
            type Err = KernelError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                parse_hex_32bytes(s).map(Self)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&hex::encode(self.0))
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!(stringify!($name), "({})"), self)
            }
        }
    };
}

define_hash_id!(NodeId);
define_hash_id!(SnapshotHash);
define_hash_id!(RoundHash);
define_hash_id!(TxHash);
