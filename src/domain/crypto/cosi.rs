//! Collective Schnorr signature aggregation.
//!
//! A `CosiSignature` starts life on the proposer as an aggregated nonce
//! commitment plus a signer mask, accumulates per-signer responses as the
//! round progresses, and ends as a single 64-byte signature verifiable
//! against the aggregated public key of the masked participants.

use crate::domain::crypto::keys::{challenge_hash, PublicKey, Signature};
use crate::foundation::constants::COSI_MASK_BITS;
use crate::foundation::{KernelError, Result};
use curve25519_dalek::edwards::{CompressedEdwardsY, EdwardsPoint};
use curve25519_dalek::scalar::Scalar;
use curve25519_dalek::traits::Identity;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// A signer's public nonce contribution `R_i = r_i * G`.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq, Serialize, Deserialize)]
pub struct Commitment([u8; 32]);

impl Commitment {
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    fn point(&self) -> Option<EdwardsPoint> {
        CompressedEdwardsY(self.0).decompress()
    }
}

impl From<PublicKey> for Commitment {
    fn from(key: PublicKey) -> Self {
        Self(*key.as_bytes())
    }
}

impl fmt::Display for Commitment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

/// A signer's response scalar `s_i = r_i + c * x_i`.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
pub struct Response([u8; 32]);

impl Response {
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    fn scalar(&self) -> Option<Scalar> {
        Option::<Scalar>::from(Scalar::from_canonical_bytes(self.0))
    }
}

/// Aggregated collective signature with a bitmask of participant indices.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct CosiSignature {
    signature: Signature,
    mask: u64,
    responses: BTreeMap<u8, Response>,
}

impl CosiSignature {
    /// Aggregate nonce commitments into the starting signature object:
    /// `R = Σ R_i`, response half zero, mask covering the given indices.
    pub fn aggregate_commitments(commitments: &BTreeMap<usize, Commitment>) -> Result<Self> {
        let mut mask = 0u64;
        let mut aggregated = EdwardsPoint::identity();
        for (&index, commitment) in commitments {
            if index >= COSI_MASK_BITS {
                return Err(KernelError::MaskOverflow { index });
            }
            let point = commitment
                .point()
                .ok_or_else(|| KernelError::crypto("aggregate commitments", format!("invalid commitment point at index {}", index)))?;
            aggregated += point;
            mask |= 1u64 << index;
        }
        if mask == 0 {
            return Err(KernelError::crypto("aggregate commitments", "no commitments to aggregate"));
        }
        Ok(Self {
            signature: Signature::from_parts(&aggregated.compress().to_bytes(), &Scalar::ZERO.to_bytes()),
            mask,
            responses: BTreeMap::new(),
        })
    }

    /// Reconstruct a received or stored aggregate from its raw form.
    pub fn from_parts(signature: Signature, mask: u64) -> Self {
        Self { signature, mask, responses: BTreeMap::new() }
    }

    pub fn signature(&self) -> &Signature {
        &self.signature
    }

    pub fn mask(&self) -> u64 {
        self.mask
    }

    /// Aggregated nonce commitment `R`.
    pub fn commitment(&self) -> Commitment {
        Commitment(*self.signature.commitment_part())
    }

    /// Participant indices in ascending order.
    pub fn signers(&self) -> Vec<usize> {
        (0..COSI_MASK_BITS).filter(|i| self.mask & (1u64 << i) != 0).collect()
    }

    pub fn mask_contains(&self, index: usize) -> bool {
        index < COSI_MASK_BITS && self.mask & (1u64 << index) != 0
    }

    /// Per-signer responses collected so far.
    pub fn responses(&self) -> &BTreeMap<u8, Response> {
        &self.responses
    }

    fn aggregated_public(&self, publics: &[PublicKey]) -> Result<EdwardsPoint> {
        let mut aggregated = EdwardsPoint::identity();
        for index in self.signers() {
            let public = publics
                .get(index)
                .ok_or(KernelError::InvalidSignerIndex { index, max: publics.len() })?;
            let point = public
                .point()
                .ok_or_else(|| KernelError::crypto("aggregate publics", format!("invalid public key at index {}", index)))?;
            aggregated += point;
        }
        Ok(aggregated)
    }

    /// Domain-separated challenge binding the aggregated commitment, the
    /// aggregated public key of the masked participants, and the message.
    pub fn challenge(&self, publics: &[PublicKey], message: &[u8]) -> Result<Scalar> {
        let aggregated = self.aggregated_public(publics)?;
        Ok(challenge_hash(self.signature.commitment_part(), &aggregated.compress().to_bytes(), message))
    }

    /// Record signer `index`'s response and fold its scalar into the
    /// aggregate. Rejects indices outside the mask and duplicates.
    pub fn aggregate_signature(&mut self, index: usize, sig: &Signature) -> Result<()> {
        if !self.mask_contains(index) {
            return Err(KernelError::SignerNotInMask { index });
        }
        if self.responses.contains_key(&(index as u8)) {
            return Err(KernelError::ResponseAlreadyRecorded { index });
        }
        let response = Response(*sig.response_part());
        let scalar = response
            .scalar()
            .ok_or_else(|| KernelError::crypto("aggregate signature", format!("non-canonical response at index {}", index)))?;
        let current = Option::<Scalar>::from(Scalar::from_canonical_bytes(*self.signature.response_part()))
            .ok_or_else(|| KernelError::crypto("aggregate signature", "corrupt aggregate response"))?;
        let folded = current + scalar;
        let commitment = *self.signature.commitment_part();
        self.signature = Signature::from_parts(&commitment, &folded.to_bytes());
        self.responses.insert(index as u8, response);
        Ok(())
    }

    /// Extract the bare response scalar for the wire.
    pub fn dump_signature_response(sig: &Signature) -> Response {
        Response(*sig.response_part())
    }

    /// Rebuild a per-signer `(R_i, s_i)` signature for membership checks.
    pub fn load_response_signature(&self, commitment: &Commitment, response: &Response) -> Result<Signature> {
        response
            .scalar()
            .ok_or_else(|| KernelError::crypto("load response", "non-canonical response scalar"))?;
        Ok(Signature::from_parts(commitment.as_bytes(), response.as_bytes()))
    }

    /// Verify the aggregated signature: the mask must cover at least
    /// `threshold` signers, every signer must exist in `publics`, and
    /// `s * G == R + c * P_agg` must hold.
    pub fn full_verify(&self, publics: &[PublicKey], threshold: usize, message: &[u8]) -> bool {
        if (self.mask.count_ones() as usize) < threshold {
            return false;
        }
        if self.signers().into_iter().any(|index| index >= publics.len()) {
            return false;
        }
        let Ok(challenge) = self.challenge(publics, message) else {
            return false;
        };
        let Ok(aggregated) = self.aggregated_public(publics) else {
            return false;
        };
        let Some(commitment) = CompressedEdwardsY(*self.signature.commitment_part()).decompress() else {
            return false;
        };
        let Some(s) = Option::<Scalar>::from(Scalar::from_canonical_bytes(*self.signature.response_part())) else {
            return false;
        };
        EdwardsPoint::mul_base(&s) == commitment + challenge * aggregated
    }
}

impl fmt::Display for CosiSignature {
    /// Aggregated signature followed by the big-endian mask, both hex.
    /// Chain replay relies on this exact rendering.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", hex::encode(self.signature.as_bytes()), hex::encode(self.mask.to_be_bytes()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::crypto::keys::PrivateKey;
    use rand_chacha::rand_core::SeedableRng;
    use rand_chacha::ChaCha20Rng;

    fn cosign(
        signers: &[(usize, &PrivateKey)],
        publics: &[PublicKey],
        message: &[u8],
        rng: &mut ChaCha20Rng,
    ) -> CosiSignature {
        let nonces: Vec<(usize, PrivateKey)> = signers.iter().map(|(i, _)| (*i, PrivateKey::generate(rng))).collect();
        let commitments: BTreeMap<usize, Commitment> =
            nonces.iter().map(|(i, nonce)| (*i, Commitment::from(nonce.public()))).collect();
        let mut cosi = CosiSignature::aggregate_commitments(&commitments).expect("aggregate commitments");
        let challenge = cosi.challenge(publics, message).expect("challenge");
        for ((index, key), (_, nonce)) in signers.iter().zip(nonces.iter()) {
            let sig = key.sign_with_challenge(nonce, &challenge);
            cosi.aggregate_signature(*index, &sig).expect("aggregate signature");
        }
        cosi
    }

    #[test]
    fn threshold_aggregation_roundtrip() {
        let mut rng = ChaCha20Rng::seed_from_u64(42);
        for (n_signers, threshold) in [(3usize, 2usize), (5, 4), (7, 5)] {
            let keys: Vec<PrivateKey> = (0..n_signers).map(|_| PrivateKey::generate(&mut rng)).collect();
            let publics: Vec<PublicKey> = keys.iter().map(PrivateKey::public).collect();
            let participants: Vec<(usize, &PrivateKey)> = keys.iter().take(threshold).enumerate().collect();
            let cosi = cosign(&participants, &publics, b"round message", &mut rng);
            assert!(cosi.full_verify(&publics, threshold, b"round message"));
            assert!(!cosi.full_verify(&publics, threshold + 1, b"round message"));
            assert!(!cosi.full_verify(&publics, threshold, b"other message"));
        }
    }

    #[test]
    fn aggregate_signature_rejects_duplicates_and_foreign_indices() {
        let mut rng = ChaCha20Rng::seed_from_u64(43);
        let keys: Vec<PrivateKey> = (0..3).map(|_| PrivateKey::generate(&mut rng)).collect();
        let publics: Vec<PublicKey> = keys.iter().map(PrivateKey::public).collect();

        let nonce = PrivateKey::generate(&mut rng);
        let commitments: BTreeMap<usize, Commitment> = [(0usize, Commitment::from(nonce.public()))].into();
        let mut cosi = CosiSignature::aggregate_commitments(&commitments).expect("aggregate");
        let challenge = cosi.challenge(&publics, b"m").expect("challenge");
        let sig = keys[0].sign_with_challenge(&nonce, &challenge);

        cosi.aggregate_signature(0, &sig).expect("first response");
        assert!(matches!(cosi.aggregate_signature(0, &sig), Err(KernelError::ResponseAlreadyRecorded { index: 0 })));
        assert!(matches!(cosi.aggregate_signature(1, &sig), Err(KernelError::SignerNotInMask { index: 1 })));
    }

    #[test]
    fn mask_overflow_is_rejected() {
        let mut rng = ChaCha20Rng::seed_from_u64(44);
        let nonce = PrivateKey::generate(&mut rng);
        let commitments: BTreeMap<usize, Commitment> = [(64usize, Commitment::from(nonce.public()))].into();
        assert!(matches!(
            CosiSignature::aggregate_commitments(&commitments),
            Err(KernelError::MaskOverflow { index: 64 })
        ));
    }

    #[test]
    fn display_renders_signature_then_mask() {
        let sig = Signature::from_parts(&[0xAB; 32], &[0xCD; 32]);
        let cosi = CosiSignature::from_parts(sig, 0x3fdf_e712);
        let rendered = cosi.to_string();
        assert_eq!(rendered.len(), 144);
        assert!(rendered.starts_with(&"ab".repeat(32)));
        assert!(rendered.ends_with("000000003fdfe712"));
    }

    #[test]
    fn response_roundtrip_through_dump_and_load() {
        let mut rng = ChaCha20Rng::seed_from_u64(45);
        let key = PrivateKey::generate(&mut rng);
        let nonce = PrivateKey::generate(&mut rng);
        let publics = vec![key.public()];
        let commitments: BTreeMap<usize, Commitment> = [(0usize, Commitment::from(nonce.public()))].into();
        let cosi = CosiSignature::aggregate_commitments(&commitments).expect("aggregate");
        let challenge = cosi.challenge(&publics, b"m").expect("challenge");
        let sig = key.sign_with_challenge(&nonce, &challenge);

        let response = CosiSignature::dump_signature_response(&sig);
        let restored = cosi
            .load_response_signature(&Commitment::from(nonce.public()), &response)
            .expect("load response signature");
        assert_eq!(restored, sig);
        assert!(publics[0].verify_with_challenge(&restored, &challenge));
    }
}
