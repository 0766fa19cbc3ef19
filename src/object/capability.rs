// Copyright 2025 The Rustux Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Reference-counted capabilities
//!
//! A [`Capability`] is the user-level handle on an RPC object. Copies share
//! one reference count; when the last copy is dropped the underlying kernel
//! selector is handed back to its [`SelectorRelease`] exactly once (unless
//! the capability was created with [`ReleasePolicy::Retain`]).
//!
//! # Usage
//!
//! ```rust,ignore
//! let cap = port.alloc_rpc_cap()?;
//! let copy = cap.clone();
//! assert_eq!(cap.ref_count(), 2);
//! drop(copy);
//! drop(cap); // selector released here
//! ```

use alloc::sync::Arc;
use core::fmt;

use super::badge::{Badge, Selector};

/// Owner of a capability space that takes back released selectors
pub trait SelectorRelease: Send + Sync {
    /// Return `selector` to the capability space
    fn release(&self, selector: Selector);
}

/// What happens to a selector when its last capability is dropped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReleasePolicy {
    /// Hand the selector back right away
    #[default]
    Immediate,
    /// Keep the selector allocated for the lifetime of the capability space
    Retain,
}

struct CapInner {
    badge: Badge,
    selector: Selector,
    space: Arc<dyn SelectorRelease>,
    policy: ReleasePolicy,
}

impl Drop for CapInner {
    fn drop(&mut self) {
        if self.policy == ReleasePolicy::Immediate && self.selector.is_valid() {
            log::trace!("capability {}: releasing {}", self.badge, self.selector);
            self.space.release(self.selector);
        }
    }
}

/// Shared handle on an RPC object
///
/// The default value is the invalid capability. The only meaningful
/// operation on an invalid capability is [`Capability::valid`].
#[derive(Clone, Default)]
pub struct Capability {
    inner: Option<Arc<CapInner>>,
}

impl Capability {
    /// Wrap a freshly allocated selector
    pub fn new(
        badge: Badge,
        selector: Selector,
        space: Arc<dyn SelectorRelease>,
        policy: ReleasePolicy,
    ) -> Self {
        Self {
            inner: Some(Arc::new(CapInner {
                badge,
                selector,
                space,
                policy,
            })),
        }
    }

    /// The invalid capability
    pub const fn invalid() -> Self {
        Self { inner: None }
    }

    /// Check if this capability refers to an object
    pub fn valid(&self) -> bool {
        self.inner
            .as_ref()
            .is_some_and(|inner| inner.badge.is_valid() && inner.selector.is_valid())
    }

    /// Badge of the referenced object, [`Badge::NONE`] if invalid
    pub fn badge(&self) -> Badge {
        self.inner.as_ref().map_or(Badge::NONE, |inner| inner.badge)
    }

    /// Kernel selector, [`Selector::INVALID`] if invalid
    pub fn selector(&self) -> Selector {
        self.inner.as_ref().map_or(Selector::INVALID, |inner| inner.selector)
    }

    /// Number of live copies sharing this capability
    pub fn ref_count(&self) -> usize {
        self.inner.as_ref().map_or(0, Arc::strong_count)
    }
}

impl PartialEq for Capability {
    fn eq(&self, other: &Self) -> bool {
        self.badge() == other.badge()
    }
}

impl Eq for Capability {}

impl fmt::Debug for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.inner {
            Some(inner) => f
                .debug_struct("Capability")
                .field("badge", &inner.badge)
                .field("selector", &inner.selector)
                .field("refs", &Arc::strong_count(inner))
                .finish(),
            None => f.write_str("Capability(invalid)"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use spin::Mutex;
    use std::vec::Vec;

    #[derive(Default)]
    struct Space {
        released: Mutex<Vec<Selector>>,
    }

    impl SelectorRelease for Space {
        fn release(&self, selector: Selector) {
            self.released.lock().push(selector);
        }
    }

    #[test]
    fn test_invalid_capability() {
        let cap = Capability::invalid();
        assert!(!cap.valid());
        assert_eq!(cap.badge(), Badge::NONE);
        assert_eq!(cap.ref_count(), 0);
        assert_eq!(cap, Capability::default());
    }

    #[test]
    fn test_release_once_on_last_drop() {
        let space = Arc::new(Space::default());
        let cap = Capability::new(Badge::new(9), Selector::new(4), space.clone(), ReleasePolicy::Immediate);
        let a = cap.clone();
        let b = a.clone();
        assert_eq!(cap.ref_count(), 3);
        assert_eq!(a, cap);

        drop(cap);
        drop(a);
        assert!(space.released.lock().is_empty());
        assert_eq!(b.ref_count(), 1);

        drop(b);
        assert_eq!(*space.released.lock(), [Selector::new(4)]);
    }

    #[test]
    fn test_retain_policy_keeps_selector() {
        let space = Arc::new(Space::default());
        let cap = Capability::new(Badge::new(1), Selector::new(2), space.clone(), ReleasePolicy::Retain);
        drop(cap);
        assert!(space.released.lock().is_empty());
    }
}
