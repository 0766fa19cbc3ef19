// Copyright 2025 The Rustux Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Object lock
//!
//! The mutual-exclusion flag carried by every object-pool entry. It guards
//! no data of its own: holding it means "a thread is dispatching into this
//! object". Ownership is tracked by the pool's guards, not by this type, so
//! acquisition and release are separate calls.

use core::sync::atomic::{AtomicBool, Ordering};

/// Mutually exclusive access flag
#[derive(Debug, Default)]
pub struct ObjectLock {
    locked: AtomicBool,
}

impl ObjectLock {
    /// Create an unlocked flag
    pub const fn new() -> Self {
        Self {
            locked: AtomicBool::new(false),
        }
    }

    /// Acquire the lock, spinning until it becomes available
    pub fn lock(&self) {
        while self
            .locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            // Spin on a plain load to keep the cache line shared
            while self.locked.load(Ordering::Relaxed) {
                core::hint::spin_loop();
            }
        }
    }

    /// Try to acquire the lock without spinning
    pub fn try_lock(&self) -> bool {
        self.locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    /// Release the lock
    ///
    /// Must only be called by the party that acquired it.
    pub fn unlock(&self) {
        self.locked.store(false, Ordering::Release);
    }

    /// Check if the lock is currently held
    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Relaxed)
    }
}

// ============================================================================
// Tests
// ============================================================================
