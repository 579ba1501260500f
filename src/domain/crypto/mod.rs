pub mod cosi;
pub mod hash;
pub mod keys;

pub use cosi::{Commitment, CosiSignature, Response};
pub use hash::new_hash;
pub use keys::{challenge_hash, PrivateKey, PublicKey, Signature};
