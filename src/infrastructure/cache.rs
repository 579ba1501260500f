//! Memoised signature verification.
//!
//! Finalized snapshots are gossiped repeatedly, so verification verdicts
//! are keyed by a hash of all verification inputs and stored as a single
//! byte in a best-effort KV cache. Correctness never depends on a cache
//! hit.

use crate::domain::crypto::{new_hash, CosiSignature, PublicKey, Signature};
use crate::foundation::{Result, SnapshotHash};
use log::debug;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

const SIGNATURE_CACHE_PREFIX: &str = "KERNEL:SIGNATURE:";
const COSI_CACHE_PREFIX: &str = "KERNEL:COSISIGNATURE:";

/// A recorded consensus exception kept for chain replay: one finalized
/// snapshot whose signature predates a rule fix around a node-removal
/// round gap and a bare final round reference. This list must never grow
/// without governance-level justification.
const REPLAY_EXCEPTION_SNAPSHOT: &str = "b3ea56de6124ad2f3ad1d48f2aff8338b761e62bcde6f2f0acba63a32dd8eecc";
const REPLAY_EXCEPTION_SIGNATURE: &str =
    "dbb0347be24ecb8de3d66631d347fde724ff92e22e1f45deeb8b5d843fd62da39ca8e39de9f35f1e0f7336d4686917983470c098edc91f456d577fb18069620f000000003fdfe712";

/// Byte KV cache with its own synchronization.
pub trait CacheStore: Send + Sync {
    fn get(&self, key: &[u8]) -> Option<Vec<u8>>;
    fn set(&self, key: &[u8], value: &[u8]);
}

pub struct MemoryCacheStore {
    inner: Mutex<HashMap<Vec<u8>, Vec<u8>>>,
}

impl MemoryCacheStore {
    pub fn new() -> Self {
        Self { inner: Mutex::new(HashMap::new()) }
    }
}

impl Default for MemoryCacheStore {
    fn default() -> Self {
        Self::new()
    }
}

impl CacheStore for MemoryCacheStore {
    fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.inner.lock().ok()?.get(key).cloned()
    }

    fn set(&self, key: &[u8], value: &[u8]) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.insert(key.to_vec(), value.to_vec());
        }
    }
}

pub struct CacheVerifier {
    store: Arc<dyn CacheStore>,
    verifications: AtomicU64,
}

impl CacheVerifier {
    pub fn new(store: Arc<dyn CacheStore>) -> Self {
        Self { store, verifications: AtomicU64::new(0) }
    }

    /// Number of underlying curve verifications performed (cache misses).
    pub fn verifications(&self) -> u64 {
        self.verifications.load(Ordering::SeqCst)
    }

    fn lookup(&self, key: &[u8]) -> Option<bool> {
        let value = self.store.get(key)?;
        if value.len() == 1 {
            Some(value[0] == 1)
        } else {
            None
        }
    }

    fn record(&self, key: &[u8], valid: bool) {
        self.store.set(key, &[u8::from(valid)]);
    }

    /// Memoised single-key Schnorr verification.
    pub fn verify(&self, snapshot: &SnapshotHash, signature: &Signature, public: &PublicKey) -> bool {
        let mut data = Vec::with_capacity(32 + 64 + 32);
        data.extend_from_slice(snapshot.as_ref());
        data.extend_from_slice(signature.as_bytes());
        data.extend_from_slice(public.as_bytes());
        let key = format!("{}{}", SIGNATURE_CACHE_PREFIX, hex::encode(new_hash(&data)));

        if let Some(valid) = self.lookup(key.as_bytes()) {
            return valid;
        }
        self.verifications.fetch_add(1, Ordering::SeqCst);
        let valid = public.verify(snapshot.as_ref(), signature);
        self.record(key.as_bytes(), valid);
        valid
    }

    /// Memoised collective-signature verification.
    pub fn verify_cosi(&self, snapshot: &SnapshotHash, signature: &CosiSignature, publics: &[PublicKey], threshold: usize) -> bool {
        if snapshot.to_string() == REPLAY_EXCEPTION_SNAPSHOT && signature.to_string() == REPLAY_EXCEPTION_SIGNATURE {
            return true;
        }
        let key = match self.cosi_cache_key(snapshot, signature, publics, threshold) {
            Ok(key) => key,
            Err(err) => {
                debug!("verify_cosi cache key failed for {}: {}", snapshot, err);
                return false;
            }
        };

        if let Some(valid) = self.lookup(key.as_bytes()) {
            return valid;
        }
        self.verifications.fetch_add(1, Ordering::SeqCst);
        let valid = signature.full_verify(publics, threshold, snapshot.as_ref());
        if !valid {
            debug!("verify_cosi({}, {}, {}) failed", snapshot, publics.len(), threshold);
        }
        self.record(key.as_bytes(), valid);
        valid
    }

    fn cosi_cache_key(&self, snapshot: &SnapshotHash, signature: &CosiSignature, publics: &[PublicKey], threshold: usize) -> Result<String> {
        let serialized = bincode::serialize(signature)?;
        let mut data = Vec::with_capacity(32 + serialized.len() + publics.len() * 32 + 8);
        data.extend_from_slice(snapshot.as_ref());
        data.extend_from_slice(&serialized);
        for public in publics {
            data.extend_from_slice(public.as_bytes());
        }
        data.extend_from_slice(&(threshold as u64).to_be_bytes());
        Ok(format!("{}{}", COSI_CACHE_PREFIX, hex::encode(new_hash(&data))))
    }
}
