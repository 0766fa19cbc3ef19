// Copyright 2025 The Rustux Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Asynchronous signals
//!
//! A signal context accumulates submissions until a thread waits on it.
//! Each delivery hands over the context's imprint together with the number
//! of submissions since the last delivery. Page faults and expired thread
//! timeouts are reported through signal contexts as well.

use core::fmt;

use crate::sched::{ThreadRef, ThreadState};

use super::error::KernelError;
use super::ipc::IpcStatus;
use super::pd::PdId;
use super::timer::TimeoutOwner;
use super::{CpuId, Kernel};

/// Kernel name of a signal context
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SignalContextId(pub u32);

impl fmt::Display for SignalContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sig:{}", self.0)
    }
}

/// A delivered signal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Signal {
    /// User-chosen value identifying the context
    pub imprint: u64,
    /// Submissions since the previous delivery
    pub count: u32,
}

/// Signal context
#[derive(Debug)]
pub struct SignalContext {
    pub(crate) pd: PdId,
    pub(crate) imprint: u64,
    pub(crate) pending: u32,
    pub(crate) waiter: Option<ThreadRef>,
}

impl SignalContext {
    pub(crate) fn new(pd: PdId, imprint: u64) -> Self {
        Self {
            pd,
            imprint,
            pending: 0,
            waiter: None,
        }
    }

    pub(crate) fn submit(&mut self, count: u32) {
        self.pending = self.pending.saturating_add(count);
    }

    /// Collect all pending submissions, if any
    pub(crate) fn take(&mut self) -> Option<Signal> {
        if self.pending == 0 {
            return None;
        }
        let count = core::mem::take(&mut self.pending);
        Some(Signal {
            imprint: self.imprint,
            count,
        })
    }

    /// Domain the context belongs to
    pub fn pd(&self) -> PdId {
        self.pd
    }

    /// Submissions not yet delivered
    pub fn pending(&self) -> u32 {
        self.pending
    }

    /// Thread waiting on the context
    pub fn waiter(&self) -> Option<ThreadRef> {
        self.waiter
    }
}

// ============================================================================
// Signal and timeout operations
// ============================================================================

impl Kernel {
    /// Create a signal context owned by `pd`
    pub fn new_signal_context(&mut self, pd: PdId, imprint: u64) -> Result<SignalContextId, KernelError> {
        self.pd(pd)?;
        let id = SignalContextId(self.next_signal);
        self.next_signal += 1;
        self.signals.insert(id, SignalContext::new(pd, imprint));
        Ok(id)
    }

    /// Destroy a signal context; a thread waiting on it fails
    pub fn delete_signal_context(&mut self, id: SignalContextId) -> Result<(), KernelError> {
        let ctx = self.signals.remove(&id).ok_or(KernelError::InvalidSignalContext(id))?;

        for thread in self.all_threads() {
            let t = self.thread_mut(thread)?;
            if t.pager == Some(id) {
                t.pager = None;
            }
            if t.timeout_signal == Some(id) {
                t.timeout_signal = None;
            }
        }
        if let Some(waiter) = ctx.waiter {
            let t = self.thread_mut(waiter)?;
            t.waiting_signal = None;
            t.utcb.set_status(IpcStatus::Failed);
            self.activate(waiter)?;
        }
        Ok(())
    }

    pub fn signal_context(&self, id: SignalContextId) -> Result<&SignalContext, KernelError> {
        self.signals.get(&id).ok_or(KernelError::InvalidSignalContext(id))
    }

    /// Submit `count` signals; wakes the thread waiting on the context
    pub fn submit_signal(&mut self, id: SignalContextId, count: u32) -> Result<(), KernelError> {
        let ctx = self.signals.get_mut(&id).ok_or(KernelError::InvalidSignalContext(id))?;
        ctx.submit(count);

        let Some(waiter) = ctx.waiter else {
            return Ok(());
        };
        let Some(signal) = ctx.take() else {
            return Ok(());
        };
        ctx.waiter = None;

        let t = self.thread_mut(waiter)?;
        t.waiting_signal = None;
        t.utcb.set_signal(signal);
        t.utcb.set_status(IpcStatus::Ok);
        self.activate(waiter)
    }

    /// Wait for a signal at `id`
    ///
    /// Returns pending signals right away; otherwise blocks the thread and
    /// returns `None`. The signal is then found in the thread's UTCB.
    pub fn await_signal(&mut self, thread: ThreadRef, id: SignalContextId) -> Result<Option<Signal>, KernelError> {
        self.require_state(thread, ThreadState::Runnable)?;
        let ctx = self.signals.get_mut(&id).ok_or(KernelError::InvalidSignalContext(id))?;
        if ctx.waiter.is_some() {
            return Err(KernelError::InvalidState(ThreadState::AwaitsSignal));
        }

        if let Some(signal) = ctx.take() {
            self.thread_mut(thread)?.utcb.set_status(IpcStatus::Ok);
            return Ok(Some(signal));
        }

        ctx.waiter = Some(thread);
        let t = self.thread_mut(thread)?;
        t.waiting_signal = Some(id);
        t.utcb.set_status(IpcStatus::Pending);
        self.block(thread, ThreadState::AwaitsSignal)?;
        Ok(None)
    }

    /// Take the signal delivered to `thread` while it was blocked
    pub fn take_signal(&mut self, thread: ThreadRef) -> Result<Option<Signal>, KernelError> {
        Ok(self.thread_mut(thread)?.utcb.take_signal())
    }

    /// Arm the timeout of `thread`: `ctx` is signaled after `duration_us`
    ///
    /// Re-arming replaces a pending timeout.
    pub fn timeout(&mut self, thread: ThreadRef, duration_us: u64, ctx: SignalContextId) -> Result<(), KernelError> {
        self.signal_context(ctx)?;
        let t = self.thread_mut(thread)?;
        if t.state == ThreadState::AwaitStart || t.state.is_dead() {
            return Err(KernelError::InvalidState(t.state));
        }
        t.timeout_signal = Some(ctx);
        let cpu = t.cpu;

        let ticks = self.time_base.us_to_ticks(duration_us);
        self.cpu_mut(cpu)?
            .timer_mut()
            .set_timeout(TimeoutOwner::Thread(thread), ticks);
        Ok(())
    }

    /// Microseconds since the pending timeout of `thread` was armed
    ///
    /// Zero if no timeout is pending.
    pub fn timeout_age_us(&mut self, thread: ThreadRef) -> Result<u64, KernelError> {
        let cpu = self.thread(thread)?.cpu;
        let time_base = self.time_base;
        let age = self
            .cpu_mut(cpu)?
            .timer_mut()
            .timeout_age(TimeoutOwner::Thread(thread))
            .unwrap_or(0);
        Ok(time_base.ticks_to_us(age))
    }

    /// Longest timeout `cpu` can program in one go, in microseconds
    pub fn timeout_max_us(&self, cpu: CpuId) -> Result<u64, KernelError> {
        Ok(self.cpu(cpu)?.timer().timeout_max_us())
    }

    pub(crate) fn timeout_triggered(&mut self, thread: ThreadRef) {
        let Ok(t) = self.thread(thread) else {
            return;
        };
        if let Some(ctx) = t.timeout_signal {
            if let Err(err) = self.submit_signal(ctx, 1) {
                log::warn!("{}: timeout signal lost: {}", thread, err);
            }
        }
    }
}
