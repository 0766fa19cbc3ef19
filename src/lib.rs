// Copyright 2025 The Rustux Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! # Rustux Core - Scheduling, IPC and RPC dispatch
//!
//! The trust and dispatch core of a capability-based microkernel:
//!
//! - **Kernel**: threads, per-CPU claims/fills scheduling, timeouts,
//!   synchronous request/reply IPC, signals, page-fault forwarding and
//!   cross-CPU domain updates
//! - **Capabilities**: reference-counted handles that release their kernel
//!   selector when the last copy goes away
//! - **RPC**: an entrypoint that authenticates requests by badge, locks the
//!   target object through an object pool and dispatches into it
//!
//! ## Architecture
//!
//! ```text
//! src/
//! ├── config.rs          # Kernel tunables
//! ├── traits.rs          # Hardware collaborators (PIC, timer, page table, TLB)
//! ├── sync/              # Per-object lock
//! ├── object/            # Badges, capabilities, object pool
//! ├── sched/             # Thread state machine and per-CPU scheduler
//! ├── kernel/            # Kernel context: CPUs, domains, IPC, signals, timers
//! └── rpc/               # Message buffers, IPC ports, RPC entrypoint
//! ```
//!
//! ## Driving the kernel
//!
//! The kernel is a plain context object; the architecture layer owns it and
//! forwards hardware events:
//!
//! ```ignore
//! use rustux_core::{Kernel, KernelConfig, Platform};
//!
//! let mut kernel = Kernel::new(KernelConfig::with_cpus(4), platform)?;
//! let next = kernel.handle_interrupt(cpu, irq)?;
//! ```

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod config;
pub mod kernel;
pub mod object;
pub mod rpc;
pub mod sched;
pub mod sync;
pub mod traits;

#[cfg(test)]
pub mod testing;

#[cfg(test)]
mod tests;

pub use config::KernelConfig;
pub use kernel::{Exception, Kernel, KernelError, Platform};
pub use object::{Badge, Capability, ObjectPool, ReleasePolicy, Selector};
pub use rpc::{HostedPort, IpcError, IpcPort, MsgBuf, RpcEntrypoint, RpcObject};
pub use sched::{ThreadParams, ThreadPriority, ThreadRef, ThreadState};
