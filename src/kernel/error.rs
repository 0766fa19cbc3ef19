// Copyright 2025 The Rustux Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Kernel error types

use crate::object::Selector;
use crate::sched::{ThreadRef, ThreadState};

use super::cpu::CpuId;
use super::pd::PdId;
use super::signal::SignalContextId;

/// Errors reported by the timer at initialization
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum TimerError {
    /// The tick rate cannot express one microsecond
    #[error("time base of {ticks_per_ms} ticks/ms cannot represent microseconds")]
    InconsistentTimeBase { ticks_per_ms: u64 },

    /// The counter cannot hold a single time slice
    #[error("timer counter of {bits} bits is too narrow")]
    CounterTooNarrow { bits: u32 },
}

/// Errors returned by kernel operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum KernelError {
    #[error("invalid CPU {0}")]
    InvalidCpu(CpuId),

    #[error("invalid thread {0}")]
    InvalidThread(ThreadRef),

    #[error("invalid protection domain {0}")]
    InvalidPd(PdId),

    #[error("no protection domain slot left")]
    PdExhausted,

    #[error("thread slots of protection domain {0} exhausted")]
    SlotExhausted(PdId),

    #[error("invalid capability {0}")]
    InvalidCapability(Selector),

    #[error("operation not permitted in thread state {0:?}")]
    InvalidState(ThreadState),

    #[error("message of {0} bytes exceeds the UTCB")]
    MessageTooLarge(usize),

    #[error("unknown signal context {0}")]
    InvalidSignalContext(SignalContextId),

    #[error("translation rejected by the page table")]
    TranslationRejected,

    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),

    #[error(transparent)]
    Timer(#[from] TimerError),
}
