// Copyright 2025 The Rustux Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Thread state and priority definitions

/// Thread state
///
/// Only `Runnable` threads take part in scheduling. A runnable thread is
/// *running* while it is the current thread of its CPU.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    /// Created, not yet started
    AwaitStart,
    /// Ready to run (or running)
    Runnable,
    /// Waiting for a request, or for the reply to an outstanding request
    BlockedOnIpc,
    /// Paused, or faulted and waiting for its pager
    AwaitsResume,
    /// Waiting for a signal to arrive at a signal context
    AwaitsSignal,
    /// Stopped for good after an unresolvable fault
    Stopped,
    /// Torn down
    Destroyed,
}

impl ThreadState {
    /// Check if the thread takes part in scheduling
    pub const fn is_runnable(self) -> bool {
        matches!(self, Self::Runnable)
    }

    /// Check if the thread waits for an event that can be canceled
    pub const fn is_blocked(self) -> bool {
        matches!(self, Self::BlockedOnIpc | Self::AwaitsResume | Self::AwaitsSignal)
    }

    /// Check if the thread can never run again
    pub const fn is_dead(self) -> bool {
        matches!(self, Self::Stopped | Self::Destroyed)
    }
}

/// Number of priority levels
pub const PRIORITY_LEVELS: usize = 5;

/// Thread priority levels
///
/// Priorities only order threads that still hold CPU quota. Threads without
/// quota share the remaining time round robin regardless of priority.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum ThreadPriority {
    /// Idle priority (lowest)
    Idle = 0,
    /// Low priority
    Low = 1,
    /// Normal priority (default)
    #[default]
    Normal = 2,
    /// High priority
    High = 3,
    /// Real-time priority (highest)
    Realtime = 4,
}

impl ThreadPriority {
    /// All levels from highest to lowest
    pub const DESCENDING: [Self; PRIORITY_LEVELS] =
        [Self::Realtime, Self::High, Self::Normal, Self::Low, Self::Idle];

    /// Convert a raw level, saturating at [`ThreadPriority::Realtime`]
    pub const fn from_raw(raw: u8) -> Self {
        match raw {
            0 => Self::Idle,
            1 => Self::Low,
            2 => Self::Normal,
            3 => Self::High,
            _ => Self::Realtime,
        }
    }

    /// Index into per-priority tables
    pub const fn index(self) -> usize {
        self as usize
    }
}
