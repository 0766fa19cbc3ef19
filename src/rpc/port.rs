// Copyright 2025 The Rustux Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! IPC port abstraction
//!
//! An [`IpcPort`] is the user-level view of one kernel thread's IPC
//! operations. The entrypoint is written against this trait only; the
//! kernel binding lives in [`super::hosted`].

use crate::kernel::ReplyCap;
use crate::object::{Badge, Capability};

use super::msgbuf::MsgBuf;
use super::IpcError;

/// A received request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Incoming {
    /// Badge of the invoked capability, as delivered by the kernel
    pub badge: Badge,
    /// Token for answering this request
    pub reply_cap: ReplyCap,
    pub msg: MsgBuf,
}

/// Synchronous IPC operations of one thread
pub trait IpcPort: Send + Sync {
    /// Send `reply` to the request in service, if any, and wait for the next
    ///
    /// Requests that do not decode are answered with
    /// [`ExceptionCode::INVALID_OBJECT`](super::ExceptionCode::INVALID_OBJECT)
    /// by the port itself and never returned.
    fn reply_wait(&self, reply: Option<&MsgBuf>) -> Result<Incoming, IpcError>;

    /// Answer the request identified by `dst`
    ///
    /// Returns false if its caller no longer waits.
    fn reply(&self, dst: ReplyCap, msg: &MsgBuf) -> Result<bool, IpcError>;

    /// Call the object behind `dst` and wait for its reply
    ///
    /// A message without a local name is stamped with the badge of `dst`.
    fn call(&self, dst: &Capability, msg: &MsgBuf) -> Result<MsgBuf, IpcError>;

    /// Abort the blocking operation the port's thread is in
    ///
    /// May be called from any thread. Returns false if nothing was blocked.
    fn cancel_blocking(&self) -> Result<bool, IpcError>;

    /// Allocate a capability whose requests arrive at this port
    fn alloc_rpc_cap(&self) -> Result<Capability, IpcError>;

    /// Largest encoded message the port can send
    fn max_message_len(&self) -> usize;
}
