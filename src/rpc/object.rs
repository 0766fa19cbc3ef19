// Copyright 2025 The Rustux Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Server objects and the dispatch context

use crate::kernel::ReplyCap;
use crate::object::{Badge, Capability};

use super::msgbuf::{ExceptionCode, MsgBuf, Opcode};
use super::port::IpcPort;
use super::IpcError;

/// An object served by an [`RpcEntrypoint`](super::RpcEntrypoint)
///
/// The entrypoint never dispatches into the same object from two threads
/// at once.
pub trait RpcObject: Send + Sync {
    /// Execute function `opcode`
    ///
    /// Results go into `output`; the returned code becomes the reply's
    /// exception code. `Err(IpcError::BlockingCanceled)` aborts the call
    /// with [`ExceptionCode::INVALID_OBJECT`] and keeps the entrypoint
    /// serving.
    fn dispatch(
        &self,
        ctx: &mut Dispatch<'_>,
        opcode: Opcode,
        input: &MsgBuf,
        output: &mut MsgBuf,
    ) -> Result<ExceptionCode, IpcError>;
}

/// Per-request context handed to [`RpcObject::dispatch`]
pub struct Dispatch<'a> {
    port: &'a dyn IpcPort,
    badge: Badge,
    reply_dst: ReplyCap,
    omit_reply: bool,
    dissolve: bool,
}

impl<'a> Dispatch<'a> {
    pub(crate) fn new(port: &'a dyn IpcPort, badge: Badge, reply_dst: ReplyCap) -> Self {
        Self {
            port,
            badge,
            reply_dst,
            omit_reply: false,
            dissolve: false,
        }
    }

    /// Badge the request arrived through
    pub fn badge(&self) -> Badge {
        self.badge
    }

    /// Token for answering the current request later
    pub fn reply_dst(&self) -> ReplyCap {
        self.reply_dst
    }

    /// Leave the current request unanswered
    ///
    /// The caller stays blocked until someone replies to [`Self::reply_dst`].
    pub fn omit_reply(&mut self) {
        self.omit_reply = true;
    }

    pub fn reply_omitted(&self) -> bool {
        self.omit_reply
    }

    /// Withdraw the object being dispatched into once this dispatch returns
    ///
    /// The counterpart of [`RpcEntrypoint::dissolve`](super::RpcEntrypoint::dissolve)
    /// for use from within the object itself.
    pub fn dissolve(&mut self) {
        self.dissolve = true;
    }

    pub fn dissolve_requested(&self) -> bool {
        self.dissolve
    }

    /// Answer a previously deferred request
    ///
    /// Returns false if its caller no longer waits.
    pub fn reply(&self, dst: ReplyCap, code: ExceptionCode, msg: &MsgBuf) -> Result<bool, IpcError> {
        let mut reply = msg.clone();
        reply.set_exception(code);
        self.port.reply(dst, &reply)
    }

    /// Call another object from within the dispatch
    ///
    /// Fails with [`IpcError::BlockingCanceled`] when the object is
    /// dissolved while the call is outstanding.
    pub fn call(&self, dst: &Capability, msg: &MsgBuf) -> Result<MsgBuf, IpcError> {
        self.port.call(dst, msg)
    }
}
