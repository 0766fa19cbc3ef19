// Copyright 2025 The Rustux Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Badges and selectors
//!
//! A [`Badge`] is the kernel-assigned, unforgeable value identifying one RPC
//! object. The kernel hands it to the server together with every request
//! that arrives through a capability to that object.
//!
//! A [`Selector`] names a slot in a protection domain's capability space.
//! Selectors are local to their domain and carry no authority on their own.

use core::fmt;

/// Kernel-assigned object identity
///
/// Zero is reserved as "no object".
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Badge(u64);

impl Badge {
    /// The invalid badge
    pub const NONE: Self = Self(0);

    /// Create a badge from its raw value
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Get raw value
    pub const fn into_raw(self) -> u64 {
        self.0
    }

    /// Check if this badge names an object
    pub const fn is_valid(self) -> bool {
        self.0 != 0
    }
}

impl fmt::Display for Badge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{:x}", self.0)
    }
}

/// Capability-space slot of one protection domain
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Selector(u32);

impl Selector {
    /// The invalid selector
    pub const INVALID: Self = Self(0);

    /// Create a selector from its raw value
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    /// Get raw value
    pub const fn into_raw(self) -> u32 {
        self.0
    }

    /// Check if this selector names a slot
    pub const fn is_valid(self) -> bool {
        self.0 != 0
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sel:{}", self.0)
    }
}
