//! Schnorr keys and signatures over the ed25519 group.
//!
//! The collective-signing protocol needs raw access to the group: nonce
//! commitments are curve points, responses are scalars, and the aggregated
//! challenge binds all participants. Scalar and point arithmetic comes from
//! `curve25519-dalek`; hashing is wide BLAKE3 output reduced to a scalar.

use curve25519_dalek::edwards::{CompressedEdwardsY, EdwardsPoint};
use curve25519_dalek::scalar::Scalar;
use rand::{CryptoRng, RngCore};
use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Domain tag for Schnorr challenge derivation.
const CHALLENGE_DOMAIN: &[u8] = b"chorus.schnorr.challenge.v1";

/// Domain tag for deterministic nonce derivation in plain signing.
const NONCE_DOMAIN: &[u8] = b"chorus.schnorr.nonce.v1";

pub const PUBLIC_KEY_SIZE: usize = 32;
pub const SIGNATURE_SIZE: usize = 64;

fn wide_hash_to_scalar(domain: &[u8], parts: &[&[u8]]) -> Scalar {
    let mut hasher = blake3::Hasher::new();
    hasher.update(domain);
    for part in parts {
        hasher.update(part);
    }
    let mut wide = [0u8; 64];
    hasher.finalize_xof().fill(&mut wide);
    Scalar::from_bytes_mod_order_wide(&wide)
}

/// Schnorr challenge `c = H(R || P || message)`, where `P` is a single key
/// or an aggregated one depending on the caller.
pub fn challenge_hash(commitment: &[u8; 32], public: &[u8; 32], message: &[u8]) -> Scalar {
    wide_hash_to_scalar(CHALLENGE_DOMAIN, &[commitment.as_slice(), public.as_slice(), message])
}

/// Private scalar. Zeroized on drop; deliberately has no `Debug`, `Serialize`
/// or `Deserialize` so nonces and spend keys cannot leak through logging or
/// persistence.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct PrivateKey(Scalar);

impl PrivateKey {
    pub fn generate<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        Self(Scalar::random(rng))
    }

    pub fn public(&self) -> PublicKey {
        PublicKey(EdwardsPoint::mul_base(&self.0).compress().to_bytes())
    }

    /// Plain Schnorr signature with a deterministic nonce.
    pub fn sign(&self, message: &[u8]) -> Signature {
        let nonce = wide_hash_to_scalar(NONCE_DOMAIN, &[self.0.to_bytes().as_slice(), message]);
        let commitment = EdwardsPoint::mul_base(&nonce).compress().to_bytes();
        let challenge = challenge_hash(&commitment, self.public().as_bytes(), message);
        let s = nonce + challenge * self.0;
        Signature::from_parts(&commitment, &s.to_bytes())
    }

    /// Schnorr response under an externally derived challenge:
    /// `s = nonce + c * priv`, `R = nonce * G`.
    pub fn sign_with_challenge(&self, nonce: &PrivateKey, challenge: &Scalar) -> Signature {
        let commitment = EdwardsPoint::mul_base(&nonce.0).compress().to_bytes();
        let s = nonce.0 + challenge * self.0;
        Signature::from_parts(&commitment, &s.to_bytes())
    }
}

/// Compressed ed25519 point.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq, Serialize, Deserialize)]
pub struct PublicKey([u8; PUBLIC_KEY_SIZE]);

impl PublicKey {
    pub const fn from_bytes(bytes: [u8; PUBLIC_KEY_SIZE]) -> Self {
        Self(bytes)
    }

    pub const fn as_bytes(&self) -> &[u8; PUBLIC_KEY_SIZE] {
        &self.0
    }

    pub(crate) fn point(&self) -> Option<EdwardsPoint> {
        CompressedEdwardsY(self.0).decompress()
    }

    pub fn verify(&self, message: &[u8], sig: &Signature) -> bool {
        let challenge = challenge_hash(sig.commitment_part(), &self.0, message);
        self.verify_with_challenge(sig, &challenge)
    }

    /// Verify `s * G == R + c * P` for a precomputed challenge.
    pub fn verify_with_challenge(&self, sig: &Signature, challenge: &Scalar) -> bool {
        let Some(public) = self.point() else {
            return false;
        };
        let Some(commitment) = CompressedEdwardsY(*sig.commitment_part()).decompress() else {
            return false;
        };
        let Some(s) = Option::<Scalar>::from(Scalar::from_canonical_bytes(*sig.response_part())) else {
            return false;
        };
        EdwardsPoint::mul_base(&s) == commitment + challenge * public
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

/// `R || s` Schnorr signature.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Signature([u8; SIGNATURE_SIZE]);

impl Signature {
    pub const fn from_bytes(bytes: [u8; SIGNATURE_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn from_parts(commitment: &[u8; 32], response: &[u8; 32]) -> Self {
        let mut bytes = [0u8; SIGNATURE_SIZE];
        bytes[..32].copy_from_slice(commitment);
        bytes[32..].copy_from_slice(response);
        Self(bytes)
    }

    pub const fn as_bytes(&self) -> &[u8; SIGNATURE_SIZE] {
        &self.0
    }

    pub fn commitment_part(&self) -> &[u8; 32] {
        self.0[..32].try_into().expect("signature commitment is 32 bytes")
    }

    pub fn response_part(&self) -> &[u8; 32] {
        self.0[32..].try_into().expect("signature response is 32 bytes")
    }

    /// Replace the commitment half. Challenge messages carry only the
    /// response scalar; the receiver restores `R` from the announcement.
    pub fn with_commitment(&mut self, commitment: &[u8; 32]) {
        self.0[..32].copy_from_slice(commitment);
    }
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Signature({})", hex::encode(self.0))
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl Serialize for Signature {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_bytes(&self.0)
    }
}

impl<'de> Deserialize<'de> for Signature {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct SignatureVisitor;

        impl<'de> Visitor<'de> for SignatureVisitor {
            type Value = Signature;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str("64 bytes for Signature")
            }

            fn visit_bytes<E>(self, v: &[u8]) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                if v.len() != SIGNATURE_SIZE {
                    return Err(E::invalid_length(v.len(), &self));
                }
                let mut bytes = [0u8; SIGNATURE_SIZE];
                bytes.copy_from_slice(v);
                Ok(Signature(bytes))
            }

            fn visit_seq<A>(self, mut seq: A) -> Result<Self::Value, A::Error>
            where
                A: de::SeqAccess<'de>,
            {
                let mut bytes = [0u8; SIGNATURE_SIZE];
                for (i, byte) in bytes.iter_mut().enumerate() {
                    *byte = seq.next_element()?.ok_or_else(|| de::Error::invalid_length(i, &self))?;
                }
                Ok(Signature(bytes))
            }
        }

        deserializer.deserialize_bytes(SignatureVisitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand_chacha::rand_core::SeedableRng;
    use rand_chacha::ChaCha20Rng;

    #[test]
    fn sign_and_verify_roundtrip() {
        let mut rng = ChaCha20Rng::seed_from_u64(7);
        let key = PrivateKey::generate(&mut rng);
        let sig = key.sign(b"snapshot payload");
        assert!(key.public().verify(b"snapshot payload", &sig));
        assert!(!key.public().verify(b"another payload", &sig));

        let other = PrivateKey::generate(&mut rng);
        assert!(!other.public().verify(b"snapshot payload", &sig));
    }

    #[test]
    fn sign_with_challenge_verifies_under_same_challenge() {
        let mut rng = ChaCha20Rng::seed_from_u64(8);
        let key = PrivateKey::generate(&mut rng);
        let nonce = PrivateKey::generate(&mut rng);
        let challenge = challenge_hash(&[1u8; 32], key.public().as_bytes(), b"msg");
        let sig = key.sign_with_challenge(&nonce, &challenge);
        assert!(key.public().verify_with_challenge(&sig, &challenge));

        let wrong = challenge_hash(&[2u8; 32], key.public().as_bytes(), b"msg");
        assert!(!key.public().verify_with_challenge(&sig, &wrong));
    }

    #[test]
    fn signature_serde_is_stable() {
        let sig = Signature::from_parts(&[3u8; 32], &[4u8; 32]);
        let bytes = bincode::serialize(&sig).expect("serialize");
        let decoded: Signature = bincode::deserialize(&bytes).expect("deserialize");
        assert_eq!(sig, decoded);
    }
}
