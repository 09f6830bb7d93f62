//! Keyed mutual exclusion.
//!
//! Template creation must serialize concurrent attempts for the same
//! (owner, list, title) tuple. The trait is the abstract requirement
//! (mutual exclusion per logical key, released even across panics) and
//! `NamedLocks` is the in-process implementation. A distributed backend
//! (advisory database lock, TTL lock) plugs in behind the same trait.

use std::collections::HashMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex, MutexGuard};

pub trait KeyedLock {
    /// Run `f` while holding mutual exclusion on `key`. The key is released
    /// when `f` returns or panics.
    fn with_lock<T>(&self, key: u64, f: impl FnOnce() -> T) -> T;
}

/// Hash a composite logical key into the lock keyspace.
pub fn lock_key(parts: &[&str]) -> u64 {
    let mut hasher = DefaultHasher::new();
    for part in parts {
        part.hash(&mut hasher);
    }
    hasher.finish()
}

/// In-process lock table: one mutex per key, created on demand.
#[derive(Debug, Default)]
pub struct NamedLocks {
    table: Mutex<HashMap<u64, Arc<Mutex<()>>>>,
}

impl NamedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, key: u64) -> Arc<Mutex<()>> {
        let mut table = lock_unpoisoned(&self.table);
        table.entry(key).or_default().clone()
    }
}

impl KeyedLock for NamedLocks {
    fn with_lock<T>(&self, key: u64, f: impl FnOnce() -> T) -> T {
        let slot = self.slot(key);
        let _guard = lock_unpoisoned(&slot);
        f()
    }
}

/// Recover the guard from a poisoned mutex; a previous holder panicking must
/// not wedge the key forever.
pub(crate) fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn same_parts_same_key_different_parts_different_key() {
        let a = lock_key(&["u1", "l1", "water plants"]);
        let b = lock_key(&["u1", "l1", "water plants"]);
        let c = lock_key(&["u1", "l2", "water plants"]);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn with_lock_serializes_a_key_across_threads() {
        let locks = Arc::new(NamedLocks::new());
        let in_section = Arc::new(AtomicU32::new(0));
        let max_seen = Arc::new(AtomicU32::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let locks = Arc::clone(&locks);
            let in_section = Arc::clone(&in_section);
            let max_seen = Arc::clone(&max_seen);
            handles.push(std::thread::spawn(move || {
                locks.with_lock(42, || {
                    let depth = in_section.fetch_add(1, Ordering::SeqCst) + 1;
                    max_seen.fetch_max(depth, Ordering::SeqCst);
                    std::thread::sleep(std::time::Duration::from_millis(2));
                    in_section.fetch_sub(1, Ordering::SeqCst);
                });
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn key_survives_a_panicking_holder() {
        let locks = Arc::new(NamedLocks::new());
        let locks2 = Arc::clone(&locks);
        let _ = std::thread::spawn(move || {
            locks2.with_lock(7, || panic!("holder died"));
        })
        .join();

        // The key is free again.
        let ran = locks.with_lock(7, || true);
        assert!(ran);
    }
}
