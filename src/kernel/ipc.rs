// Copyright 2025 The Rustux Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Synchronous IPC state of a thread
//!
//! Every thread carries a [`Utcb`] (its message buffer) and an [`IpcNode`]
//! (its position in the request/reply protocol). A thread can be a caller
//! and a server at the same time: it may serve one request while requests
//! from other callers queue up on it, and it may issue a nested request of
//! its own while serving.
//!
//! The protocol operations that touch two threads at once live on the
//! [`Kernel`](super::Kernel); this module only holds the per-thread state.

use alloc::collections::VecDeque;
use alloc::vec::Vec;

use crate::object::{Badge, Selector};
use crate::sched::{ThreadRef, ThreadState};

use super::error::KernelError;
use super::signal::Signal;
use super::Kernel;

/// Outcome of the last blocking IPC or signal operation of a thread
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IpcStatus {
    /// No operation issued yet
    #[default]
    Idle,
    /// Blocked, waiting for completion
    Pending,
    /// Completed; the UTCB holds the received message
    Ok,
    /// Aborted by `cancel_blocking`
    Canceled,
    /// The peer vanished before completing the operation
    Failed,
}

/// User-level thread control block: the message buffer of a thread
#[derive(Debug, Clone)]
pub struct Utcb {
    data: Vec<u8>,
    capacity: usize,
    badge: Badge,
    status: IpcStatus,
    signal: Option<Signal>,
}

impl Utcb {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            data: Vec::new(),
            capacity,
            badge: Badge::NONE,
            status: IpcStatus::Idle,
            signal: None,
        }
    }

    /// Current message
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Replace the message
    pub fn write(&mut self, bytes: &[u8]) -> Result<(), KernelError> {
        if bytes.len() > self.capacity {
            return Err(KernelError::MessageTooLarge(bytes.len()));
        }
        self.data.clear();
        self.data.extend_from_slice(bytes);
        Ok(())
    }

    /// Buffer size
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Badge of the capability the last request arrived through
    pub fn badge(&self) -> Badge {
        self.badge
    }

    /// Outcome of the last blocking operation
    pub fn status(&self) -> IpcStatus {
        self.status
    }

    /// Take the last delivered signal
    pub fn take_signal(&mut self) -> Option<Signal> {
        self.signal.take()
    }

    /// Copy an incoming message; the sender's buffer is never larger
    pub(crate) fn receive(&mut self, bytes: &[u8], badge: Badge) {
        self.data.clear();
        self.data.extend_from_slice(bytes);
        self.badge = badge;
    }

    pub(crate) fn set_status(&mut self, status: IpcStatus) {
        self.status = status;
    }

    pub(crate) fn set_signal(&mut self, signal: Signal) {
        self.signal = Some(signal);
    }
}

/// Token that entitles its holder to answer one particular request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplyCap {
    /// Thread waiting for the reply
    pub caller: ThreadRef,
    /// Kernel-wide sequence number of the request
    pub seq: u64,
}

/// A request queued at a busy server
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct PendingRequest {
    pub caller: ThreadRef,
    pub badge: Badge,
}

/// Per-thread IPC protocol state
#[derive(Debug, Default)]
pub struct IpcNode {
    /// Blocked in `await_request`
    pub(crate) awaiting_request: bool,
    /// Server of the outstanding request, while waiting for its reply
    pub(crate) reply_from: Option<ThreadRef>,
    /// Sequence number of the last request sent
    pub(crate) call_seq: u64,
    /// Request currently in service
    pub(crate) caller: Option<ReplyCap>,
    /// Requests waiting to be received
    pub(crate) queue: VecDeque<PendingRequest>,
}

impl IpcNode {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Check if the thread waits for an incoming request
    pub fn awaiting_request(&self) -> bool {
        self.awaiting_request
    }

    /// Server the thread waits for a reply from
    pub fn awaiting_reply_from(&self) -> Option<ThreadRef> {
        self.reply_from
    }

    /// Reply token of the request in service
    pub fn caller(&self) -> Option<ReplyCap> {
        self.caller
    }

    /// Number of queued requests
    pub fn pending_requests(&self) -> usize {
        self.queue.len()
    }

    pub(crate) fn withdraw(&mut self, caller: ThreadRef) -> bool {
        let before = self.queue.len();
        self.queue.retain(|req| req.caller != caller);
        before != self.queue.len()
    }
}

// ============================================================================
// Request/reply operations
// ============================================================================

impl Kernel {
    /// Message buffer of `thread`
    pub fn utcb(&self, thread: ThreadRef) -> Result<&Utcb, KernelError> {
        Ok(&self.thread(thread)?.utcb)
    }

    /// Fill the message buffer of `thread` before a request or reply
    pub fn write_utcb(&mut self, thread: ThreadRef, bytes: &[u8]) -> Result<(), KernelError> {
        self.thread_mut(thread)?.utcb.write(bytes)
    }

    /// Send the message in the caller's UTCB through `selector` and block
    ///
    /// The request is handed over at once if the server waits for one,
    /// otherwise it queues at the server. Fails without blocking if the
    /// selector is unknown or the server can never answer.
    pub fn send_request(&mut self, caller: ThreadRef, selector: Selector) -> Result<(), KernelError> {
        self.require_state(caller, ThreadState::Runnable)?;
        let entry = self.pd(caller.pd)?.cap(selector).copied();
        let unreachable = match entry.map(|e| self.thread_state(e.target)) {
            None | Some(Err(_)) => Some(KernelError::InvalidCapability(selector)),
            Some(Ok(state)) if state.is_dead() => Some(KernelError::InvalidState(state)),
            Some(Ok(_)) => None,
        };
        let Some(entry) = entry.filter(|_| unreachable.is_none()) else {
            log::warn!("{}: request through {} has no recipient", caller, selector);
            self.thread_mut(caller)?.utcb.set_status(IpcStatus::Failed);
            return Err(unreachable.unwrap_or(KernelError::InvalidCapability(selector)));
        };

        let seq = self.next_call_seq;
        self.next_call_seq += 1;
        let t = self.thread_mut(caller)?;
        t.ipc.call_seq = seq;
        t.ipc.reply_from = Some(entry.target);
        t.utcb.set_status(IpcStatus::Pending);
        self.block(caller, ThreadState::BlockedOnIpc)?;

        let server = self.thread_mut(entry.target)?;
        if server.ipc.awaiting_request {
            self.deliver_request(entry.target, caller, entry.badge)
        } else {
            server.ipc.queue.push_back(PendingRequest {
                caller,
                badge: entry.badge,
            });
            Ok(())
        }
    }

    /// Wait for the next request
    ///
    /// Any request still in service is left unanswered; its caller keeps
    /// waiting for a reply through a saved [`ReplyCap`]. Returns true if a
    /// queued request was received without blocking.
    pub fn await_request(&mut self, server: ThreadRef) -> Result<bool, KernelError> {
        self.require_state(server, ThreadState::Runnable)?;

        let t = self.thread_mut(server)?;
        t.ipc.caller = None;
        if let Some(request) = t.ipc.queue.pop_front() {
            self.deliver_request(server, request.caller, request.badge)?;
            return Ok(true);
        }

        t.ipc.awaiting_request = true;
        t.utcb.set_status(IpcStatus::Pending);
        self.block(server, ThreadState::BlockedOnIpc)?;
        Ok(false)
    }

    /// Answer the request in service with the server's UTCB
    ///
    /// With `await_next` the server then waits for the next request, see
    /// [`Kernel::await_request`].
    pub fn send_reply(&mut self, server: ThreadRef, await_next: bool) -> Result<bool, KernelError> {
        self.require_state(server, ThreadState::Runnable)?;

        if let Some(reply) = self.thread_mut(server)?.ipc.caller.take() {
            self.deliver_reply(server, reply)?;
        }
        if await_next {
            self.await_request(server)
        } else {
            Ok(false)
        }
    }

    /// Answer the request identified by `reply` out of order
    ///
    /// Any thread of the domain that received the request may answer it.
    /// The request in service is left untouched. Returns false if the
    /// caller no longer waits for this reply.
    pub fn reply_to(&mut self, replier: ThreadRef, reply: ReplyCap) -> Result<bool, KernelError> {
        self.require_state(replier, ThreadState::Runnable)?;
        self.deliver_reply(replier, reply)
    }

    /// Abort the blocking IPC or signal wait of `thread`
    ///
    /// The thread becomes runnable with [`IpcStatus::Canceled`]. Returns
    /// false if it was not blocked in a cancelable operation.
    pub fn cancel_blocking(&mut self, thread: ThreadRef) -> Result<bool, KernelError> {
        match self.thread_state(thread)? {
            ThreadState::BlockedOnIpc => {
                self.withdraw_request(thread)?;
                self.thread_mut(thread)?.ipc.awaiting_request = false;
            }
            ThreadState::AwaitsSignal => {
                let ctx = self.thread_mut(thread)?.waiting_signal.take();
                if let Some(ctx) = ctx.and_then(|id| self.signals.get_mut(&id)) {
                    ctx.waiter = None;
                }
            }
            _ => return Ok(false),
        }

        self.thread_mut(thread)?.utcb.set_status(IpcStatus::Canceled);
        self.activate(thread)?;
        log::trace!("{}: blocking canceled", thread);
        Ok(true)
    }

    fn deliver_request(&mut self, server: ThreadRef, caller: ThreadRef, badge: Badge) -> Result<(), KernelError> {
        let t = self.thread(caller)?;
        let (data, seq) = (t.utcb.data.clone(), t.ipc.call_seq);

        let s = self.thread_mut(server)?;
        s.utcb.receive(&data, badge);
        s.utcb.set_status(IpcStatus::Ok);
        s.ipc.caller = Some(ReplyCap { caller, seq });
        if core::mem::take(&mut s.ipc.awaiting_request) {
            self.activate(server)?;
        }
        Ok(())
    }

    fn deliver_reply(&mut self, replier: ThreadRef, reply: ReplyCap) -> Result<bool, KernelError> {
        let data = self.thread(replier)?.utcb.data.clone();

        let Ok(caller) = self.thread_mut(reply.caller) else {
            log::trace!("{}: reply to vanished caller {}", replier, reply.caller);
            return Ok(false);
        };
        let expected = caller.state == ThreadState::BlockedOnIpc
            && caller.ipc.call_seq == reply.seq
            && caller.ipc.reply_from.is_some_and(|server| server.pd == replier.pd);
        if !expected {
            log::trace!("{}: stale reply to {} dropped", replier, reply.caller);
            return Ok(false);
        }

        caller.ipc.reply_from = None;
        caller.utcb.receive(&data, Badge::NONE);
        caller.utcb.set_status(IpcStatus::Ok);
        self.activate(reply.caller)?;
        Ok(true)
    }

    /// Take `caller`'s outstanding request back from its server
    pub(crate) fn withdraw_request(&mut self, caller: ThreadRef) -> Result<(), KernelError> {
        if let Some(server) = self.thread_mut(caller)?.ipc.reply_from.take() {
            if let Ok(s) = self.thread_mut(server) {
                s.ipc.withdraw(caller);
            }
        }
        Ok(())
    }

    /// Fail every caller waiting for `server` to answer
    pub(crate) fn fail_waiters(&mut self, server: ThreadRef) -> Result<(), KernelError> {
        let waiters: Vec<ThreadRef> = self
            .all_threads()
            .into_iter()
            .filter(|t| {
                self.thread(*t).is_ok_and(|t| {
                    t.state == ThreadState::BlockedOnIpc && t.ipc.reply_from == Some(server)
                })
            })
            .collect();

        let s = self.thread_mut(server)?;
        s.ipc.queue.clear();
        s.ipc.caller = None;

        for waiter in waiters {
            let t = self.thread_mut(waiter)?;
            t.ipc.reply_from = None;
            t.utcb.set_status(IpcStatus::Failed);
            self.activate(waiter)?;
            log::debug!("{}: request to {} failed", waiter, server);
        }
        Ok(())
    }
}
