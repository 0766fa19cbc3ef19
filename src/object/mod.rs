// Copyright 2025 The Rustux Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Object identity, capabilities and the object pool
//!
//! # Design
//!
//! - **Badges**: kernel-assigned, unforgeable object identities
//! - **Capabilities**: reference-counted handles that release their kernel
//!   selector when the last copy goes away
//! - **Object pool**: badge-indexed registry with per-object locking
//!
//! # Modules
//!
//! - [`badge`] - Badges and capability selectors
//! - [`capability`] - Reference-counted capabilities
//! - [`pool`] - Object pool

pub mod badge;
pub mod capability;
pub mod pool;

// Re-exports
pub use badge::{Badge, Selector};
pub use capability::{Capability, ReleasePolicy, SelectorRelease};
pub use pool::{ObjectPool, PoolEntry, PoolGuard};
