//! The in-memory ephemeron table: a thread-safe multiset of short
//! hashes held live by currently-open transactions.
//!
//! A resource with a zero persistent refcount may still be reachable
//! from a transaction that has read or stowed it but not yet
//! committed. The ephemeron table is what stops the writer's GC pass
//! from collecting it out from under that transaction.

use std::collections::HashMap;

use parking_lot::Mutex;

use crate::hash::{Hash, SHORT_HASH_LEN};

type ShortHash = [u8; SHORT_HASH_LEN];

fn short_key(h: &Hash) -> ShortHash {
    let mut key = [0u8; SHORT_HASH_LEN];
    key.copy_from_slice(h.short());
    key
}

/// A volatile multiset of short hashes, one count per distinct hold.
#[derive(Default)]
pub struct Ephemerons {
    counts: Mutex<HashMap<ShortHash, usize>>,
}

impl Ephemerons {
    pub fn new() -> Self {
        Self::default()
    }

    /// Increments the hold count for each hash in `hashes`.
    pub fn add<'a>(&self, hashes: impl IntoIterator<Item = &'a Hash>) {
        let mut counts = self.counts.lock();
        for h in hashes {
            *counts.entry(short_key(h)).or_insert(0) += 1;
        }
    }

    /// Decrements the hold count for each hash in `hashes`, dropping
    /// the entry once its count reaches zero.
    pub fn release<'a>(&self, hashes: impl IntoIterator<Item = &'a Hash>) {
        let mut counts = self.counts.lock();
        for h in hashes {
            let key = short_key(h);
            if let Some(n) = counts.get_mut(&key) {
                *n -= 1;
                if *n == 0 {
                    counts.remove(&key);
                }
            }
        }
    }

    /// True if `short_hash` is held by at least one live transaction.
    /// `short_hash` must be exactly [`SHORT_HASH_LEN`] bytes; anything
    /// else is reported as not contained.
    pub fn contains(&self, short_hash: &[u8]) -> bool {
        if short_hash.len() != SHORT_HASH_LEN {
            return false;
        }
        let mut key = [0u8; SHORT_HASH_LEN];
        key.copy_from_slice(short_hash);
        self.counts.lock().contains_key(&key)
    }

    /// Number of live transactions currently holding `short_hash`.
    pub fn count(&self, short_hash: &[u8]) -> usize {
        if short_hash.len() != SHORT_HASH_LEN {
            return 0;
        }
        let mut key = [0u8; SHORT_HASH_LEN];
        key.copy_from_slice(short_hash);
        self.counts.lock().get(&key).copied().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash;

    #[test]
    fn add_then_contains() {
        let eph = Ephemerons::new();
        let h = hash::hash(b"resource");
        eph.add([&h]);
        assert!(eph.contains(h.short()));
    }

    #[test]
    fn release_drops_to_zero() {
        let eph = Ephemerons::new();
        let h = hash::hash(b"resource");
        eph.add([&h]);
        eph.release([&h]);
        assert!(!eph.contains(h.short()));
    }

    #[test]
    fn multiple_holders_require_multiple_releases() {
        let eph = Ephemerons::new();
        let h = hash::hash(b"resource");
        eph.add([&h]);
        eph.add([&h]);
        assert_eq!(eph.count(h.short()), 2);
        eph.release([&h]);
        assert!(eph.contains(h.short()));
        eph.release([&h]);
        assert!(!eph.contains(h.short()));
    }

    #[test]
    fn unknown_hash_is_absent() {
        let eph = Ephemerons::new();
        let h = hash::hash(b"never added");
        assert!(!eph.contains(h.short()));
    }
}
