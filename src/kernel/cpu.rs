// Copyright 2025 The Rustux Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Per-CPU state
//!
//! Each CPU owns a scheduler, a timer and an idle thread. Exactly one thread
//! is current per CPU: the scheduler's head as of the last
//! [`Cpu::schedule`] call, which falls back to the idle thread.

use crate::sched::{Scheduler, ThreadRef};

use super::timer::{TimeoutOwner, Timer};

/// CPU index
pub type CpuId = usize;

/// Outcome of one scheduling decision
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Switch {
    /// Thread that ran before
    pub prev: ThreadRef,
    /// Thread that runs now
    pub next: ThreadRef,
    /// Ticks `prev` ran since the last decision
    pub consumed: u64,
}

/// One CPU
pub struct Cpu {
    id: CpuId,
    scheduler: Scheduler,
    timer: Timer,
    current: ThreadRef,
    last_time: u64,
    ipi_pending: bool,
}

impl Cpu {
    pub(crate) fn new(id: CpuId, idle: ThreadRef, mut timer: Timer, super_period: u64, time_slice: u64) -> Self {
        let last_time = timer.time();
        Self {
            id,
            scheduler: Scheduler::new(idle, super_period, time_slice),
            timer,
            current: idle,
            last_time,
            ipi_pending: false,
        }
    }

    /// Pick the thread to run next and arm the quantum timeout for it
    pub(crate) fn schedule(&mut self) -> Switch {
        let now = self.timer.time();
        let consumed = now.saturating_sub(self.last_time);
        self.last_time = now;

        self.scheduler.update(consumed);
        let prev = self.current;
        self.current = self.scheduler.head();

        let quota = self.scheduler.head_quota().max(1);
        self.timer.set_timeout(TimeoutOwner::Quantum, quota);

        Switch {
            prev,
            next: self.current,
            consumed,
        }
    }

    pub fn id(&self) -> CpuId {
        self.id
    }

    /// Thread currently dispatched on this CPU
    pub fn current(&self) -> ThreadRef {
        self.current
    }

    pub fn idle(&self) -> ThreadRef {
        self.scheduler.idle()
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub(crate) fn scheduler_mut(&mut self) -> &mut Scheduler {
        &mut self.scheduler
    }

    pub fn timer(&self) -> &Timer {
        &self.timer
    }

    pub(crate) fn timer_mut(&mut self) -> &mut Timer {
        &mut self.timer
    }

    /// Check if an IPI was sent to this CPU and not handled yet
    pub fn ipi_pending(&self) -> bool {
        self.ipi_pending
    }

    /// Record an outgoing IPI; returns false if one is already in flight
    pub(crate) fn trigger_ipi(&mut self) -> bool {
        !core::mem::replace(&mut self.ipi_pending, true)
    }

    pub(crate) fn clear_ipi(&mut self) {
        self.ipi_pending = false;
    }
}
