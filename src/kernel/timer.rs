// Copyright 2025 The Rustux Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Per-CPU timer and timeout list
//!
//! The timer extends the hardware's free-running counter into a monotonic
//! 64-bit tick count and keeps the timeouts of its CPU sorted by deadline.
//! The one-shot comparator is always programmed for the earliest deadline,
//! or for the longest representable duration when nothing is pending, so
//! that counter wrap-arounds are observed in time.

use alloc::boxed::Box;
use alloc::vec::Vec;

use crate::sched::ThreadRef;
use crate::traits::TimerDriver;

use super::error::TimerError;

/// Conversion between timer ticks and wall-clock time
///
/// All conversions round down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeBase {
    ticks_per_ms: u64,
}

impl TimeBase {
    /// Create a time base, rejecting rates coarser than one tick per microsecond
    pub fn new(ticks_per_ms: u64) -> Result<Self, TimerError> {
        if ticks_per_ms < 1_000 {
            return Err(TimerError::InconsistentTimeBase { ticks_per_ms });
        }
        Ok(Self { ticks_per_ms })
    }

    /// Timer ticks per millisecond
    pub fn ticks_per_ms(&self) -> u64 {
        self.ticks_per_ms
    }

    pub fn us_to_ticks(&self, us: u64) -> u64 {
        let ticks = u128::from(us) * u128::from(self.ticks_per_ms) / 1_000;
        u64::try_from(ticks).unwrap_or(u64::MAX)
    }

    pub fn ticks_to_us(&self, ticks: u64) -> u64 {
        let us = u128::from(ticks) * 1_000 / u128::from(self.ticks_per_ms);
        u64::try_from(us).unwrap_or(u64::MAX)
    }

    pub fn ms_to_ticks(&self, ms: u64) -> u64 {
        ms.saturating_mul(self.ticks_per_ms)
    }
}

/// Who is notified when a timeout expires
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutOwner {
    /// End of the current scheduling quantum of the CPU
    Quantum,
    /// A thread's user-requested timeout
    Thread(ThreadRef),
}

#[derive(Debug, Clone, Copy)]
struct Timeout {
    start: u64,
    deadline: u64,
    owner: TimeoutOwner,
}

/// Per-CPU timer
pub struct Timer {
    driver: Box<dyn TimerDriver>,
    time_base: TimeBase,
    /// Sorted by deadline, equal deadlines in insertion order
    timeouts: Vec<Timeout>,
    time: u64,
    last_counter: u64,
    wraps: u64,
    max_value: u64,
    programmed: u64,
}

impl Timer {
    /// Take over `driver`; the counter must hold at least `min_ticks`
    pub fn new(driver: Box<dyn TimerDriver>, time_base: TimeBase, min_ticks: u64) -> Result<Self, TimerError> {
        let bits = driver.counter_bits();
        let max_value = driver.max_value();
        if bits == 0 || max_value < min_ticks {
            return Err(TimerError::CounterTooNarrow { bits });
        }
        let last_counter = driver.counter() & max_value;
        Ok(Self {
            driver,
            time_base,
            timeouts: Vec::new(),
            time: 0,
            last_counter,
            wraps: 0,
            max_value,
            programmed: 0,
        })
    }

    fn advance(&mut self) {
        let counter = self.driver.counter() & self.max_value;
        if counter < self.last_counter {
            self.wraps += 1;
        }
        let delta = counter.wrapping_sub(self.last_counter) & self.max_value;
        self.time = self.time.wrapping_add(delta);
        self.last_counter = counter;
    }

    /// Ticks since the timer was taken over
    pub fn time(&mut self) -> u64 {
        self.advance();
        self.time
    }

    /// Register or re-arm the timeout of `owner`, `duration` ticks from now
    pub fn set_timeout(&mut self, owner: TimeoutOwner, duration: u64) {
        let was_first = self.unlink(owner) == Some(0);

        let start = self.time();
        let timeout = Timeout {
            start,
            deadline: start.saturating_add(duration),
            owner,
        };
        let index = self.timeouts.partition_point(|t| t.deadline <= timeout.deadline);
        self.timeouts.insert(index, timeout);

        if index == 0 || was_first {
            self.schedule_timeout();
        }
    }

    /// Drop the timeout of `owner`; returns whether one was pending
    pub fn cancel_timeout(&mut self, owner: TimeoutOwner) -> bool {
        match self.unlink(owner) {
            Some(0) => {
                self.schedule_timeout();
                true
            }
            Some(_) => true,
            None => false,
        }
    }

    fn unlink(&mut self, owner: TimeoutOwner) -> Option<usize> {
        let index = self.timeouts.iter().position(|t| t.owner == owner)?;
        self.timeouts.remove(index);
        Some(index)
    }

    /// Expire every timeout whose deadline has passed
    ///
    /// Returns the owners in deadline order and reprograms the comparator.
    pub fn process_timeouts(&mut self) -> Vec<TimeoutOwner> {
        let now = self.time();
        let expired = self.timeouts.partition_point(|t| t.deadline <= now);
        let fired = self.timeouts.drain(..expired).map(|t| t.owner).collect();
        self.schedule_timeout();
        fired
    }

    fn schedule_timeout(&mut self) {
        let now = self.time();
        let duration = match self.timeouts.first() {
            Some(next) if next.deadline > now => (next.deadline - now).min(self.max_value),
            Some(_) => 1,
            None => self.max_value,
        };
        self.programmed = duration;
        self.driver.start_one_shot(duration);
    }

    /// Check if `owner` has a pending timeout
    pub fn is_pending(&self, owner: TimeoutOwner) -> bool {
        self.timeouts.iter().any(|t| t.owner == owner)
    }

    /// Deadline of the pending timeout of `owner`
    pub fn deadline(&self, owner: TimeoutOwner) -> Option<u64> {
        self.timeouts.iter().find(|t| t.owner == owner).map(|t| t.deadline)
    }

    /// Ticks since the timeout of `owner` was set
    pub fn timeout_age(&mut self, owner: TimeoutOwner) -> Option<u64> {
        let now = self.time();
        let start = self.timeouts.iter().find(|t| t.owner == owner)?.start;
        Some(now.saturating_sub(start))
    }

    /// Longest duration the comparator can be programmed for, in microseconds
    pub fn timeout_max_us(&self) -> u64 {
        self.time_base.ticks_to_us(self.max_value)
    }

    /// Duration of the last one-shot programming
    pub fn programmed(&self) -> u64 {
        self.programmed
    }

    /// Number of counter wrap-arounds observed
    pub fn wraps(&self) -> u64 {
        self.wraps
    }

    /// Number of pending timeouts
    pub fn pending(&self) -> usize {
        self.timeouts.len()
    }

    pub fn time_base(&self) -> TimeBase {
        self.time_base
    }

    /// IRQ of the comparator
    pub fn irq(&self) -> u32 {
        self.driver.irq()
    }
}
