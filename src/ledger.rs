//! Hash-to-signature map filled by ceremonies and read by codec finalize.
//!
//! Writes are set-once per hash. A repeated identical write is an
//! idempotent no-op; a different signature for the same hash is rejected.

use std::collections::HashMap;
use std::sync::RwLock;

use crate::codec::PreSignHash;
use crate::error::{KeysignError, KeysignResult};
use crate::signature::SignaturePackage;

/// Set-once signature store keyed by lowercase hash hex.
#[derive(Debug, Default)]
pub struct SignatureLedger {
    entries: RwLock<HashMap<String, SignaturePackage>>,
}

impl SignatureLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a signature. Returns `true` if this call inserted it.
    pub fn put(&self, hash: &PreSignHash, signature: SignaturePackage) -> KeysignResult<bool> {
        let key = hash.to_hex();
        let mut entries = self
            .entries
            .write()
            .map_err(|_| KeysignError::Internal("Signature ledger lock poisoned".to_string()))?;

        match entries.get(&key) {
            Some(existing) if *existing == signature => Ok(false),
            Some(_) => {
                tracing::warn!(hash = %key, "Rejected conflicting signature");
                Err(KeysignError::SignatureConflict { hash: key })
            }
            None => {
                entries.insert(key.clone(), signature);
                tracing::debug!(hash = %key, "Recorded signature");
                Ok(true)
            }
        }
    }

    /// Fetch the signature for a hash.
    pub fn get(&self, hash: &PreSignHash) -> KeysignResult<SignaturePackage> {
        let key = hash.to_hex();
        let entries = self
            .entries
            .read()
            .map_err(|_| KeysignError::Internal("Signature ledger lock poisoned".to_string()))?;
        entries
            .get(&key)
            .cloned()
            .ok_or(KeysignError::SignatureNotFound { hash: key })
    }

    pub fn contains(&self, hash: &PreSignHash) -> bool {
        self.entries
            .read()
            .is_ok_and(|entries| entries.contains_key(&hash.to_hex()))
    }

    /// Hex of every hash in `required` that has no entry yet, in order.
    pub fn missing(&self, required: &[PreSignHash]) -> Vec<String> {
        required
            .iter()
            .filter(|hash| !self.contains(hash))
            .map(PreSignHash::to_hex)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.read().map_or(0, |entries| entries.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::signature::test_keys::{ecdsa_sign, eddsa_sign};

    #[test]
    fn test_put_then_get() {
        let ledger = SignatureLedger::new();
        let hash = PreSignHash::new(vec![1u8; 32]);
        let sig = ecdsa_sign(hash.as_bytes());

        assert!(ledger.put(&hash, sig.clone()).unwrap());
        assert_eq!(ledger.get(&hash).unwrap(), sig);
    }

    #[test]
    fn test_identical_write_is_noop() {
        let ledger = SignatureLedger::new();
        let hash = PreSignHash::new(vec![2u8; 32]);
        let sig = ecdsa_sign(hash.as_bytes());

        assert!(ledger.put(&hash, sig.clone()).unwrap());
        assert!(!ledger.put(&hash, sig).unwrap());
        assert_eq!(ledger.len(), 1);
    }

    #[test]
    fn test_conflicting_write_is_rejected_and_original_kept() {
        let ledger = SignatureLedger::new();
        let hash = PreSignHash::new(vec![3u8; 32]);
        let first = ecdsa_sign(hash.as_bytes());
        let second = eddsa_sign(hash.as_bytes());

        ledger.put(&hash, first.clone()).unwrap();
        let result = ledger.put(&hash, second);
        assert!(matches!(
            result,
            Err(KeysignError::SignatureConflict { .. })
        ));
        assert_eq!(ledger.get(&hash).unwrap(), first);
    }

    #[test]
    fn test_missing_hash_is_not_found() {
        let ledger = SignatureLedger::new();
        let hash = PreSignHash::new(vec![4u8; 32]);
        assert!(matches!(
            ledger.get(&hash),
            Err(KeysignError::SignatureNotFound { hash: h }) if h == hash.to_hex()
        ));
    }

    #[test]
    fn test_missing_lists_in_order() {
        let ledger = SignatureLedger::new();
        let hashes: Vec<PreSignHash> = (5u8..8).map(|b| PreSignHash::new(vec![b; 32])).collect();
        ledger
            .put(&hashes[1], ecdsa_sign(hashes[1].as_bytes()))
            .unwrap();

        assert_eq!(
            ledger.missing(&hashes),
            vec![hashes[0].to_hex(), hashes[2].to_hex()]
        );
    }

    #[test]
    fn test_concurrent_readers_and_writers() {
        let ledger = Arc::new(SignatureLedger::new());
        let hashes: Vec<PreSignHash> = (0u8..16).map(|b| PreSignHash::new(vec![b; 32])).collect();

        let writers: Vec<_> = hashes
            .iter()
            .cloned()
            .map(|hash| {
                let ledger = Arc::clone(&ledger);
                std::thread::spawn(move || {
                    let sig = ecdsa_sign(hash.as_bytes());
                    ledger.put(&hash, sig).unwrap();
                })
            })
            .collect();
        for writer in writers {
            writer.join().unwrap();
        }

        assert!(ledger.missing(&hashes).is_empty());
        assert_eq!(ledger.len(), 16);
    }
}
