// Copyright 2025 The Rustux Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Scheduler and thread management
//!
//! This module provides the kernel thread type and the per-CPU
//! claims/fills scheduler.
//!
//! # Example
//! ```ignore
//! use rustux_core::sched::{Scheduler, ThreadPriority, ThreadRef};
//!
//! let mut scheduler = Scheduler::new(idle, super_period, time_slice);
//! scheduler.insert(thread, ThreadPriority::High, quota);
//! scheduler.ready(thread);
//! scheduler.update(consumed);
//! let next = scheduler.head();
//! ```

pub mod thread;
pub mod scheduler;
pub mod state;

pub use thread::{
    FaultDescriptor, RegisterContext, StartKind, Thread, ThreadId, ThreadParams, ThreadRef, ThreadStats,
};
pub use scheduler::Scheduler;
pub use state::{ThreadPriority, ThreadState, PRIORITY_LEVELS};
