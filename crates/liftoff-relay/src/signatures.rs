//! Thought-signature cache.
//!
//! The upstream attaches an opaque signature blob to function-call turns;
//! echoing a signature back on the next turn is what keeps thinking mode
//! usable across tool calls. Signatures live only in memory, capped by LRU —
//! a restart simply means the next thinking request starts cold.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};

/// Anything shorter is indistinguishable from noise.
const MIN_SIGNATURE_LEN: usize = 10;

/// Default LRU capacity.
const DEFAULT_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub struct SignatureEntry {
    pub turn_fingerprint: String,
    pub signature_blob: String,
    pub created_at: DateTime<Utc>,
}

/// True iff `sig` is worth storing or echoing.
pub fn is_valid_signature(sig: &str) -> bool {
    let trimmed = sig.trim();
    !trimmed.is_empty() && trimmed.len() >= MIN_SIGNATURE_LEN
}

/// Fingerprint used as the cache key: SHA-256 hex of the blob itself, so
/// arbitrarily large opaque signatures never end up in the key set.
pub fn fingerprint(sig: &str) -> String {
    hex::encode(Sha256::digest(sig.as_bytes()))
}

struct Inner {
    entries: HashMap<String, SignatureEntry>,
    /// Access order, least recent first.
    order: VecDeque<String>,
    capacity: usize,
}

/// Process-wide, thread-safe signature cache. The lock only covers the
/// in-memory map update.
pub struct SignatureStore {
    inner: Mutex<Inner>,
}

impl SignatureStore {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                order: VecDeque::new(),
                capacity: capacity.max(1),
            }),
        }
    }

    /// Record a signature. Invalid blobs are ignored.
    pub fn store(&self, sig: &str) {
        if !is_valid_signature(sig) {
            return;
        }
        let key = fingerprint(sig);
        let mut inner = self.inner.lock().expect("signature store lock");
        if inner.entries.contains_key(&key) {
            inner.order.retain(|k| k != &key);
        } else if inner.entries.len() >= inner.capacity {
            if let Some(evicted) = inner.order.pop_front() {
                inner.entries.remove(&evicted);
            }
        }
        inner.order.push_back(key.clone());
        inner.entries.insert(
            key.clone(),
            SignatureEntry {
                turn_fingerprint: key,
                signature_blob: sig.to_string(),
                created_at: Utc::now(),
            },
        );
    }

    pub fn has(&self, sig: &str) -> bool {
        let key = fingerprint(sig);
        self.inner
            .lock()
            .expect("signature store lock")
            .entries
            .contains_key(&key)
    }

    /// True when at least one valid signature is cached — the gate for the
    /// thinking-safety rule.
    pub fn has_valid(&self) -> bool {
        self.inner
            .lock()
            .expect("signature store lock")
            .entries
            .values()
            .any(|e| is_valid_signature(&e.signature_blob))
    }

    pub fn lookup(&self, turn_fingerprint: &str) -> Option<String> {
        let mut inner = self.inner.lock().expect("signature store lock");
        if !inner.entries.contains_key(turn_fingerprint) {
            return None;
        }
        // Refresh recency on hit.
        inner.order.retain(|k| k != turn_fingerprint);
        inner.order.push_back(turn_fingerprint.to_string());
        inner
            .entries
            .get(turn_fingerprint)
            .map(|e| e.signature_blob.clone())
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock().expect("signature store lock");
        inner.entries.clear();
        inner.order.clear();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("signature store lock").entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for SignatureStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validity_requires_ten_chars() {
        assert!(!is_valid_signature(""));
        assert!(!is_valid_signature("   "));
        assert!(!is_valid_signature("short"));
        assert!(!is_valid_signature("123456789"));
        assert!(is_valid_signature("1234567890"));
        assert!(is_valid_signature("valid_signature_string_longer_than_10_chars"));
    }

    #[test]
    fn store_and_lookup_by_fingerprint() {
        let store = SignatureStore::new();
        let sig = "opaque-signature-blob-aaaa";
        store.store(sig);
        assert!(store.has(sig));
        assert!(store.has_valid());
        assert_eq!(store.lookup(&fingerprint(sig)), Some(sig.to_string()));
        assert_eq!(store.lookup("unknown-fingerprint"), None);
    }

    #[test]
    fn invalid_blobs_are_not_stored() {
        let store = SignatureStore::new();
        store.store("short");
        assert!(store.is_empty());
        assert!(!store.has_valid());
    }

    #[test]
    fn lru_evicts_oldest_at_capacity() {
        let store = SignatureStore::with_capacity(3);
        let sigs: Vec<String> = (0..4).map(|i| format!("signature-number-{i}")).collect();
        for sig in &sigs[..3] {
            store.store(sig);
        }
        // Touch the oldest so it survives the next eviction.
        assert!(store.lookup(&fingerprint(&sigs[0])).is_some());
        store.store(&sigs[3]);

        assert_eq!(store.len(), 3);
        assert!(store.has(&sigs[0]));
        assert!(!store.has(&sigs[1]));
        assert!(store.has(&sigs[2]));
        assert!(store.has(&sigs[3]));
    }

    #[test]
    fn re_storing_refreshes_instead_of_duplicating() {
        let store = SignatureStore::with_capacity(2);
        store.store("signature-aaaaaa");
        store.store("signature-aaaaaa");
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn clear_empties_the_store() {
        let store = SignatureStore::new();
        store.store("signature-aaaaaa");
        store.clear();
        assert!(store.is_empty());
        assert!(!store.has_valid());
    }
}
