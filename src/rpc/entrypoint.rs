// Copyright 2025 The Rustux Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! RPC entrypoint
//!
//! The entrypoint thread runs [`RpcEntrypoint::serve`]: it replies to the
//! previous request and waits for the next one in a single port operation,
//! checks the badge, locks the addressed object through the pool and
//! dispatches into it.
//!
//! [`RpcEntrypoint::dissolve`] may be called from any thread. It unlinks the
//! object first, cancels the entrypoint's blocking operation while the
//! object is being dispatched into, and returns only after it could take
//! the object lock itself. No dispatch into the object starts after that.

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crate::object::{Badge, Capability, ObjectPool, PoolEntry, PoolGuard};

use super::msgbuf::{ExceptionCode, MsgBuf};
use super::object::{Dispatch, RpcObject};
use super::port::{Incoming, IpcPort};
use super::IpcError;

/// Server thread dispatching requests to managed objects
pub struct RpcEntrypoint<P: IpcPort> {
    name: String,
    port: P,
    pool: ObjectPool<dyn RpcObject>,
    /// Badge being dispatched into, zero while none
    current: AtomicU64,
    active: AtomicBool,
    serving: AtomicBool,
    exit: AtomicBool,
    exited: AtomicBool,
}

impl<P: IpcPort> RpcEntrypoint<P> {
    /// Create an entrypoint on `port`
    ///
    /// Without `start_on_construction` the serve loop waits for
    /// [`Self::activate`] before receiving the first request.
    pub fn new(name: &str, port: P, start_on_construction: bool) -> Self {
        Self {
            name: String::from(name),
            port,
            pool: ObjectPool::new(),
            current: AtomicU64::new(0),
            active: AtomicBool::new(start_on_construction),
            serving: AtomicBool::new(false),
            exit: AtomicBool::new(false),
            exited: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn port(&self) -> &P {
        &self.port
    }

    /// Start serving after deferred construction
    pub fn activate(&self) {
        self.active.store(true, Ordering::Release);
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Register `object` and hand out its capability
    pub fn manage(&self, object: Arc<dyn RpcObject>) -> Result<Capability, IpcError> {
        let cap = self.port.alloc_rpc_cap()?;
        self.pool.insert(cap.clone(), object);
        log::debug!("{}: managing {}", self.name, cap.badge());
        Ok(cap)
    }

    /// Withdraw the object behind `cap`
    ///
    /// Returns false if it was not managed by this entrypoint.
    ///
    /// # Deadlocks
    ///
    /// Waits for any dispatch into the object to finish, so a dispatch must
    /// not dissolve its own object this way. It calls
    /// [`Dispatch::dissolve`] instead.
    pub fn dissolve(&self, cap: &Capability) -> bool {
        let Some(entry) = self.pool.remove(cap.badge()) else {
            return false;
        };
        self.quiesce(&entry);
        log::debug!("{}: dissolved {}", self.name, cap.badge());
        true
    }

    /// Withdraw every managed object
    pub fn dissolve_all(&self) -> usize {
        let entries: Vec<_> = self.pool.remove_all();
        for entry in &entries {
            self.quiesce(entry);
        }
        entries.len()
    }

    /// Wait until no dispatch into `entry` is in flight
    fn quiesce(&self, entry: &Arc<PoolEntry<dyn RpcObject>>) {
        let badge = entry.badge().into_raw();
        loop {
            if let Some(guard) = PoolGuard::try_acquire(entry) {
                drop(guard);
                return;
            }
            if self.current.load(Ordering::Acquire) == badge {
                if let Err(err) = self.port.cancel_blocking() {
                    log::warn!("{}: cancel blocking failed: {}", self.name, err);
                }
            }
            core::hint::spin_loop();
        }
    }

    /// Check if an object is registered under `badge`
    pub fn manages(&self, badge: Badge) -> bool {
        self.pool.contains(badge)
    }

    /// Badge currently dispatched into
    pub fn current(&self) -> Badge {
        Badge::new(self.current.load(Ordering::Acquire))
    }

    /// Serve requests until [`Self::request_exit`] is called
    ///
    /// Runs on the thread the port is bound to.
    pub fn serve(&self) {
        self.serving.store(true, Ordering::Release);
        while !self.is_active() && !self.exit.load(Ordering::Acquire) {
            core::hint::spin_loop();
        }

        log::debug!("{}: serving", self.name);
        let mut reply: Option<MsgBuf> = None;
        while !self.exit.load(Ordering::Acquire) {
            let incoming = match self.port.reply_wait(reply.take().as_ref()) {
                Ok(incoming) => incoming,
                Err(IpcError::BlockingCanceled) => continue,
                Err(err) if err.is_fatal() => {
                    log::error!("{}: receiving failed: {}", self.name, err);
                    break;
                }
                Err(err) => {
                    log::warn!("{}: receiving failed: {}", self.name, err);
                    core::hint::spin_loop();
                    continue;
                }
            };
            reply = self.handle(incoming);
        }

        log::debug!("{}: exited", self.name);
        self.exited.store(true, Ordering::Release);
    }

    /// Dispatch one request; returns the reply unless it was omitted
    fn handle(&self, incoming: Incoming) -> Option<MsgBuf> {
        let Incoming { badge, reply_cap, msg } = incoming;
        let mut output = MsgBuf::new();
        output.set_exception(ExceptionCode::INVALID_OBJECT);

        if msg.local_name() != badge {
            log::warn!(
                "{}: request for {} arrived through {}, dropped",
                self.name,
                msg.local_name(),
                badge
            );
            return Some(output);
        }
        let Some(object) = self.pool.lookup_and_lock(badge) else {
            log::debug!("{}: no object at {}", self.name, badge);
            return Some(output);
        };

        self.current.store(badge.into_raw(), Ordering::Release);
        let mut ctx = Dispatch::new(&self.port, badge, reply_cap);
        let result = object.dispatch(&mut ctx, msg.opcode(), &msg, &mut output);
        if ctx.dissolve_requested() && self.pool.remove(badge).is_some() {
            log::debug!("{}: {} dissolved itself", self.name, badge);
        }
        self.current.store(0, Ordering::Release);
        drop(object);

        match result {
            Ok(code) => output.set_exception(code),
            Err(err) => {
                if err == IpcError::BlockingCanceled {
                    log::debug!("{}: dispatch at {} canceled", self.name, badge);
                } else {
                    log::warn!("{}: dispatch at {} failed: {}", self.name, badge, err);
                }
                output.clear_payload();
                output.set_exception(ExceptionCode::INVALID_OBJECT);
            }
        }
        if ctx.reply_omitted() {
            return None;
        }

        let limit = self.port.max_message_len();
        if output.encoded_len() > limit {
            log::warn!(
                "{}: reply of {} bytes from {} exceeds {} bytes, dropped",
                self.name,
                output.encoded_len(),
                badge,
                limit
            );
            output.clear_payload();
            output.set_exception(ExceptionCode::INVALID_OBJECT);
        }
        Some(output)
    }

    /// Stop the serve loop and wait for it to finish
    ///
    /// Must not be called from the entrypoint thread.
    pub fn request_exit(&self) {
        self.exit.store(true, Ordering::Release);
        while self.serving.load(Ordering::Acquire) && !self.has_exited() {
            if let Err(err) = self.port.cancel_blocking() {
                log::warn!("{}: cancel blocking failed: {}", self.name, err);
                return;
            }
            core::hint::spin_loop();
        }
    }

    pub fn has_exited(&self) -> bool {
        self.exited.load(Ordering::Acquire)
    }
}
