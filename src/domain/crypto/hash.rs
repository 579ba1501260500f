use crate::foundation::Hash32;

/// Domain tag for kernel content hashes.
const CONTENT_HASH_DOMAIN: &[u8] = b"chorus.hash.v1";

/// Domain-separated content hash used for snapshot payloads, round seals,
/// node identities, and signature cache keys.
pub fn new_hash(data: &[u8]) -> Hash32 {
    let mut hasher = blake3::Hasher::new();
    hasher.update(CONTENT_HASH_DOMAIN);
    hasher.update(data);
    *hasher.finalize().as_bytes()
}
