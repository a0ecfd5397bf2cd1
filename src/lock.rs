//! Per-bucket spinlocks and the scoped guards which release them on every
//! exit path.

use crossbeam_utils::CachePadded;
use std::sync::atomic::{AtomicBool, Ordering};

/// A spinlock guarding a single bucket.
///
/// Bucket critical sections are a handful of tag compares and at most one
/// cell move, so a spin is cheaper than parking the thread. The lock is
/// padded to a cache line by the owning [`LockArray`] so that contended
/// neighbours do not false-share.
pub(crate) struct BucketLock {
    locked: AtomicBool,
}

impl BucketLock {
    pub fn new() -> BucketLock {
        BucketLock {
            locked: AtomicBool::new(false),
        }
    }

    /// Spins until the lock is acquired.
    pub fn lock(&self) {
        while self
            .locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            // Spin on a plain load so the cache line stays shared until the
            // holder releases it.
            while self.locked.load(Ordering::Relaxed) {
                std::hint::spin_loop();
            }
        }
    }

    /// Releases the lock. Must only be called by the current holder.
    pub fn unlock(&self) {
        debug_assert!(self.locked.load(Ordering::Relaxed));
        self.locked.store(false, Ordering::Release);
    }
}

/// One spinlock per bucket of a table generation.
///
/// The array is reallocated together with its table when the map grows, so
/// a lock index is only meaningful against the generation it was created
/// for. Callers re-validate the generation after acquiring.
pub(crate) struct LockArray {
    locks: Box<[CachePadded<BucketLock>]>,
}

impl LockArray {
    /// Creates locks for `count` buckets, all unlocked.
    pub fn new(count: usize) -> LockArray {
        let locks = (0..count)
            .map(|_| CachePadded::new(BucketLock::new()))
            .collect();
        LockArray { locks }
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    /// Locks the single bucket `index`.
    pub fn lock_one(&self, index: usize) -> BucketGuard<'_> {
        self.locks[index].lock();
        BucketGuard { locks: self, index }
    }

    /// Locks the buckets `first` and `second` in ascending index order,
    /// which is the canonical order for every multi-bucket acquisition.
    /// When both indices name the same bucket only one lock is taken.
    pub fn lock_pair(&self, first: usize, second: usize) -> PairGuard<'_> {
        let (low, high) = if first <= second {
            (first, second)
        } else {
            (second, first)
        };
        self.locks[low].lock();
        if low == high {
            return PairGuard {
                locks: self,
                low,
                high: None,
            };
        }
        self.locks[high].lock();
        PairGuard {
            locks: self,
            low,
            high: Some(high),
        }
    }

    /// Locks every bucket in ascending index order. Only the resizer does
    /// this, serialized by the resize mutex.
    pub fn lock_all(&self) -> AllGuard<'_> {
        for lock in self.locks.iter() {
            lock.lock();
        }
        AllGuard { locks: self }
    }

    #[cfg(test)]
    fn is_locked(&self, index: usize) -> bool {
        self.locks[index].locked.load(Ordering::Relaxed)
    }
}

/// Holds a single bucket lock, releasing it on drop.
pub(crate) struct BucketGuard<'a> {
    locks: &'a LockArray,
    index: usize,
}

impl Drop for BucketGuard<'_> {
    fn drop(&mut self) {
        self.locks.locks[self.index].unlock();
    }
}

/// Holds one or two bucket locks, releasing them on drop.
pub(crate) struct PairGuard<'a> {
    locks: &'a LockArray,
    low: usize,
    high: Option<usize>,
}

impl Drop for PairGuard<'_> {
    fn drop(&mut self) {
        if let Some(high) = self.high {
            self.locks.locks[high].unlock();
        }
        self.locks.locks[self.low].unlock();
    }
}

/// Holds every bucket lock of one table generation.
pub(crate) struct AllGuard<'a> {
    locks: &'a LockArray,
}

impl Drop for AllGuard<'_> {
    fn drop(&mut self) {
        for lock in self.locks.locks.iter() {
            lock.unlock();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pair_guard_orders_and_releases() {
        let locks = LockArray::new(8);
        {
            let _guard = locks.lock_pair(5, 2);
            assert!(locks.is_locked(2));
            assert!(locks.is_locked(5));
            assert!(!locks.is_locked(3));
        }
        assert!(!locks.is_locked(2));
        assert!(!locks.is_locked(5));
    }

    #[test]
    fn pair_guard_same_index() {
        let locks = LockArray::new(4);
        {
            let _guard = locks.lock_pair(1, 1);
            assert!(locks.is_locked(1));
        }
        assert!(!locks.is_locked(1));
    }

    #[test]
    fn all_guard_covers_every_bucket() {
        let locks = LockArray::new(16);
        {
            let _guard = locks.lock_all();
            for index in 0..locks.len() {
                assert!(locks.is_locked(index));
            }
        }
        for index in 0..locks.len() {
            assert!(!locks.is_locked(index));
        }
    }

    #[test]
    fn contended_lock_hands_over() {
        use std::sync::Arc;

        let locks = Arc::new(LockArray::new(1));
        let guard = locks.lock_one(0);

        let contender = {
            let locks = Arc::clone(&locks);
            std::thread::spawn(move || {
                let _guard = locks.lock_one(0);
            })
        };

        std::thread::sleep(std::time::Duration::from_millis(10));
        drop(guard);
        contender.join().unwrap();
    }
}
