//! Faulting call site -> pristine target memo.
//!
//! Open addressing over a table allocated once up front. Lookups and inserts
//! are a handful of atomic operations, so both are usable from the `SIGSEGV`
//! handler on the faulting thread: no allocation, no locks, no waiting.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// Fibonacci hashing of an address onto `mask + 1` buckets.
#[inline]
pub(crate) fn home_slot(key: usize, mask: usize) -> usize {
    (key >> 2).wrapping_mul(0x9E37_79B9_7F4A_7C15_u64 as usize).rotate_left(17) & mask
}

struct Entry {
    key: AtomicUsize,
    value: AtomicUsize,
    ready: AtomicBool,
}

pub struct RedirectionCache {
    entries: Box<[Entry]>,
    mask: usize,
    len: AtomicUsize,
}

impl RedirectionCache {
    /// `capacity` is rounded up to a power of two.
    pub fn with_capacity(capacity: usize) -> Self {
        let size = capacity.max(2).next_power_of_two();
        let entries = (0..size)
            .map(|_| Entry {
                key: AtomicUsize::new(0),
                value: AtomicUsize::new(0),
                ready: AtomicBool::new(false),
            })
            .collect();
        Self {
            entries,
            mask: size - 1,
            len: AtomicUsize::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.len.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn lookup(&self, address: usize) -> Option<usize> {
        if address == 0 {
            return None;
        }
        let start = home_slot(address, self.mask);
        for i in 0..self.entries.len() {
            let entry = &self.entries[(start + i) & self.mask];
            match entry.key.load(Ordering::Acquire) {
                0 => return None,
                k if k == address => {
                    // Claimed but not yet published reads as a miss.
                    return entry
                        .ready
                        .load(Ordering::Acquire)
                        .then(|| entry.value.load(Ordering::Acquire));
                }
                _ => {}
            }
        }
        None
    }

    /// Remember `address -> resolved`. Returns `false` when the table is
    /// full; the next fault at `address` then simply resolves again.
    ///
    /// Address 0 is the empty-slot marker and is never stored.
    pub fn insert(&self, address: usize, resolved: usize) -> bool {
        if address == 0 {
            return false;
        }
        let start = home_slot(address, self.mask);
        for i in 0..self.entries.len() {
            let entry = &self.entries[(start + i) & self.mask];
            let claimed = match entry.key.load(Ordering::Acquire) {
                k if k == address => true,
                0 => match entry
                    .key
                    .compare_exchange(0, address, Ordering::AcqRel, Ordering::Acquire)
                {
                    Ok(_) => {
                        self.len.fetch_add(1, Ordering::Relaxed);
                        true
                    }
                    Err(actual) => actual == address,
                },
                _ => false,
            };
            if claimed {
                entry.value.store(resolved, Ordering::Release);
                entry.ready.store(true, Ordering::Release);
                return true;
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn lookup_after_insert() {
        let cache = RedirectionCache::with_capacity(16);
        assert_eq!(cache.lookup(0x7000_1000), None);
        assert!(cache.insert(0x7000_1000, 0x5555_0000));
        assert_eq!(cache.lookup(0x7000_1000), Some(0x5555_0000));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn reinsert_overwrites_without_growing() {
        let cache = RedirectionCache::with_capacity(16);
        cache.insert(0x10, 1);
        cache.insert(0x10, 2);
        assert_eq!(cache.lookup(0x10), Some(2));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn zero_key_is_never_stored() {
        let cache = RedirectionCache::with_capacity(4);
        assert!(!cache.insert(0, 42));
        assert_eq!(cache.lookup(0), None);
        assert!(cache.is_empty());
    }

    #[test]
    fn full_cache_rejects_new_keys_but_keeps_old_ones() {
        let cache = RedirectionCache::with_capacity(4);
        for k in 1..=4 {
            assert!(cache.insert(k * 0x100, k));
        }
        assert!(!cache.insert(0x9999, 9));
        assert_eq!(cache.lookup(0x9999), None);
        for k in 1..=4 {
            assert_eq!(cache.lookup(k * 0x100), Some(k));
        }
    }

    #[test]
    fn capacity_rounds_up_to_power_of_two() {
        assert_eq!(RedirectionCache::with_capacity(1000).capacity(), 1024);
        assert_eq!(RedirectionCache::with_capacity(0).capacity(), 2);
    }

    #[test]
    fn concurrent_inserts_of_same_key_agree() {
        let cache = Arc::new(RedirectionCache::with_capacity(64));
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let cache = Arc::clone(&cache);
                std::thread::spawn(move || {
                    for k in 1..32usize {
                        cache.insert(k * 0x40, k * 3);
                        if t % 2 == 0 {
                            let _ = cache.lookup(k * 0x40);
                        }
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(cache.len(), 31);
        for k in 1..32usize {
            assert_eq!(cache.lookup(k * 0x40), Some(k * 3));
        }
    }
}
