// Copyright 2025 The Rustux Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Synchronization Primitives
//!
//! Data locks come from the `spin` crate. This module only adds the
//! guard-less [`ObjectLock`] that the object pool uses to serialize
//! dispatch into one server object.

pub mod object_lock;

pub use object_lock::ObjectLock;
