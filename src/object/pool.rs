// Copyright 2025 The Rustux Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Object pool
//!
//! Badge-indexed registry of the objects an entrypoint serves. Each entry
//! carries its own [`ObjectLock`] so that at most one thread dispatches into
//! an object at a time, while the pool-wide map lock is only held for the
//! duration of a map operation.
//!
//! # Dissolution
//!
//! [`ObjectPool::remove`] unlinks an entry and marks it dissolved. A lookup
//! that was already waiting for the entry's lock sees the mark after it
//! acquires the lock and backs off, so no dispatch can start on a removed
//! object.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::ops::Deref;
use core::sync::atomic::{AtomicBool, Ordering};

use super::badge::Badge;
use super::capability::Capability;
use crate::sync::ObjectLock;

/// One managed object
pub struct PoolEntry<T: ?Sized> {
    cap: Capability,
    lock: ObjectLock,
    dissolved: AtomicBool,
    object: Arc<T>,
}

impl<T: ?Sized> PoolEntry<T> {
    /// Badge the entry is registered under
    pub fn badge(&self) -> Badge {
        self.cap.badge()
    }

    /// Capability the entry was managed with
    pub fn cap(&self) -> &Capability {
        &self.cap
    }

    /// The managed object
    pub fn object(&self) -> &Arc<T> {
        &self.object
    }

    /// Check if the entry has been removed from its pool
    pub fn is_dissolved(&self) -> bool {
        self.dissolved.load(Ordering::Acquire)
    }

    /// Check if a thread currently holds the entry
    pub fn is_locked(&self) -> bool {
        self.lock.is_locked()
    }
}

/// Exclusive access to one pool entry
///
/// The entry lock is released when the guard is dropped.
pub struct PoolGuard<T: ?Sized> {
    entry: Arc<PoolEntry<T>>,
}

impl<T: ?Sized> PoolGuard<T> {
    /// Lock `entry`, spinning while another thread holds it
    pub fn acquire(entry: Arc<PoolEntry<T>>) -> Self {
        entry.lock.lock();
        Self { entry }
    }

    /// Lock `entry` if it is free
    pub fn try_acquire(entry: &Arc<PoolEntry<T>>) -> Option<Self> {
        if entry.lock.try_lock() {
            Some(Self {
                entry: entry.clone(),
            })
        } else {
            None
        }
    }

    /// The guarded entry
    pub fn entry(&self) -> &Arc<PoolEntry<T>> {
        &self.entry
    }

    /// Badge of the guarded entry
    pub fn badge(&self) -> Badge {
        self.entry.badge()
    }
}

impl<T: ?Sized> Deref for PoolGuard<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.entry.object
    }
}

impl<T: ?Sized> Drop for PoolGuard<T> {
    fn drop(&mut self) {
        self.entry.lock.unlock();
    }
}

/// Badge-indexed object registry
pub struct ObjectPool<T: ?Sized> {
    entries: spin::Mutex<BTreeMap<Badge, Arc<PoolEntry<T>>>>,
}

impl<T: ?Sized> ObjectPool<T> {
    /// Create an empty pool
    pub const fn new() -> Self {
        Self {
            entries: spin::Mutex::new(BTreeMap::new()),
        }
    }

    /// Register `object` under the badge of `cap`
    ///
    /// # Panics
    ///
    /// Panics if `cap` is invalid or its badge is already registered.
    pub fn insert(&self, cap: Capability, object: Arc<T>) {
        let badge = cap.badge();
        assert!(badge.is_valid(), "object pool: insert with invalid capability");

        let mut entries = self.entries.lock();
        if entries.contains_key(&badge) {
            panic!("object pool: badge {} inserted twice", badge);
        }
        entries.insert(
            badge,
            Arc::new(PoolEntry {
                cap,
                lock: ObjectLock::new(),
                dissolved: AtomicBool::new(false),
                object,
            }),
        );
    }

    /// Find the object registered under `badge` and lock it
    ///
    /// Waits while another thread holds the entry. Returns `None` if no
    /// object is registered or it was removed while waiting.
    pub fn lookup_and_lock(&self, badge: Badge) -> Option<PoolGuard<T>> {
        let entry = self.entries.lock().get(&badge).cloned()?;
        let guard = PoolGuard::acquire(entry);
        if guard.entry.is_dissolved() {
            return None;
        }
        Some(guard)
    }

    /// Unlink the entry registered under `badge`
    ///
    /// The entry is marked dissolved before it is returned; the caller may
    /// still have to wait for an ongoing dispatch to release it.
    pub fn remove(&self, badge: Badge) -> Option<Arc<PoolEntry<T>>> {
        let entry = self.entries.lock().remove(&badge)?;
        entry.dissolved.store(true, Ordering::Release);
        Some(entry)
    }

    /// Unlink every entry
    pub fn remove_all(&self) -> Vec<Arc<PoolEntry<T>>> {
        let entries = core::mem::take(&mut *self.entries.lock());
        entries
            .into_values()
            .inspect(|entry| entry.dissolved.store(true, Ordering::Release))
            .collect()
    }

    /// Check if an object is registered under `badge`
    pub fn contains(&self, badge: Badge) -> bool {
        self.entries.lock().contains_key(&badge)
    }

    /// Number of registered objects
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Check if the pool is empty
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl<T: ?Sized> Default for ObjectPool<T> {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::{ReleasePolicy, Selector, SelectorRelease};
    use std::sync::atomic::AtomicUsize;
    use std::thread;
    use std::time::Duration;

    struct NoRelease;

    impl SelectorRelease for NoRelease {
        fn release(&self, _selector: Selector) {}
    }

    fn cap(badge: u64) -> Capability {
        Capability::new(
            Badge::new(badge),
            Selector::new(badge as u32),
            Arc::new(NoRelease),
            ReleasePolicy::Immediate,
        )
    }

    #[test]
    fn test_insert_lookup_remove() {
        let pool: ObjectPool<AtomicUsize> = ObjectPool::new();
        pool.insert(cap(7), Arc::new(AtomicUsize::new(42)));
        assert!(pool.contains(Badge::new(7)));
        assert_eq!(pool.len(), 1);

        {
            let guard = pool.lookup_and_lock(Badge::new(7)).unwrap();
            assert_eq!(guard.load(Ordering::SeqCst), 42);
            assert!(guard.entry().is_locked());
        }
        assert!(pool.lookup_and_lock(Badge::new(8)).is_none());

        let entry = pool.remove(Badge::new(7)).unwrap();
        assert!(entry.is_dissolved());
        assert!(!entry.is_locked());
        assert!(pool.is_empty());
        assert!(pool.lookup_and_lock(Badge::new(7)).is_none());
    }

    #[test]
    #[should_panic(expected = "inserted twice")]
    fn test_duplicate_badge_panics() {
        let pool: ObjectPool<AtomicUsize> = ObjectPool::new();
        pool.insert(cap(3), Arc::new(AtomicUsize::new(0)));
        pool.insert(cap(3), Arc::new(AtomicUsize::new(1)));
    }

    #[test]
    fn test_lookup_waits_for_holder() {
        let pool: Arc<ObjectPool<AtomicUsize>> = Arc::new(ObjectPool::new());
        pool.insert(cap(7), Arc::new(AtomicUsize::new(0)));

        let first = pool.lookup_and_lock(Badge::new(7)).unwrap();
        let holder_done = Arc::new(AtomicBool::new(false));

        let waiter = {
            let pool = pool.clone();
            let holder_done = holder_done.clone();
            thread::spawn(move || {
                let guard = pool.lookup_and_lock(Badge::new(7)).unwrap();
                assert!(holder_done.load(Ordering::SeqCst));
                guard.fetch_add(1, Ordering::SeqCst);
            })
        };

        thread::sleep(Duration::from_millis(50));
        first.fetch_add(1, Ordering::SeqCst);
        holder_done.store(true, Ordering::SeqCst);
        drop(first);

        waiter.join().unwrap();
        let guard = pool.lookup_and_lock(Badge::new(7)).unwrap();
        assert_eq!(guard.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_waiting_lookup_fails_after_remove() {
        let pool: Arc<ObjectPool<AtomicUsize>> = Arc::new(ObjectPool::new());
        pool.insert(cap(5), Arc::new(AtomicUsize::new(0)));

        let first = pool.lookup_and_lock(Badge::new(5)).unwrap();
        let waiter = {
            let pool = pool.clone();
            thread::spawn(move || pool.lookup_and_lock(Badge::new(5)).is_some())
        };

        thread::sleep(Duration::from_millis(50));
        let entry = pool.remove(Badge::new(5)).unwrap();
        drop(first);

        assert!(!waiter.join().unwrap());
        assert!(!entry.is_locked());
    }

    #[test]
    fn test_remove_all_marks_entries() {
        let pool: ObjectPool<AtomicUsize> = ObjectPool::new();
        pool.insert(cap(1), Arc::new(AtomicUsize::new(0)));
        pool.insert(cap(2), Arc::new(AtomicUsize::new(0)));

        let entries = pool.remove_all();
        assert_eq!(entries.len(), 2);
        assert!(entries.iter().all(|entry| entry.is_dissolved()));
        assert!(pool.is_empty());
    }
}
