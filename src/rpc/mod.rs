// Copyright 2025 The Rustux Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! User-level RPC
//!
//! Turns the kernel's synchronous IPC into dispatch onto server objects.
//!
//! # Modules
//!
//! - [`msgbuf`] - Message layout, opcodes and exception codes
//! - [`port`] - IPC operations of one thread
//! - [`hosted`] - Port implementation on top of the in-crate kernel
//! - [`object`] - Server object trait and dispatch context
//! - [`entrypoint`] - Serve loop, object management and dissolve

pub mod entrypoint;
pub mod hosted;
pub mod msgbuf;
pub mod object;
pub mod port;

use crate::kernel::KernelError;

pub use entrypoint::RpcEntrypoint;
pub use hosted::{HostedPort, SharedKernel};
pub use msgbuf::{ExceptionCode, MsgBuf, MsgReader, Opcode};
pub use object::{Dispatch, RpcObject};
pub use port::{Incoming, IpcPort};

/// User-level IPC error
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum IpcError {
    /// The blocking operation was aborted by `cancel_blocking`
    #[error("blocking canceled")]
    BlockingCanceled,
    #[error("invalid capability")]
    InvalidCapability,
    /// The server vanished before replying
    #[error("call failed")]
    CallFailed,
    #[error("malformed message")]
    MalformedMessage,
    #[error(transparent)]
    Kernel(#[from] KernelError),
}

impl IpcError {
    /// Check if the port's own thread can no longer take part in IPC
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::Kernel(KernelError::InvalidThread(_) | KernelError::InvalidPd(_)) => true,
            Self::Kernel(KernelError::InvalidState(state)) => state.is_dead(),
            _ => false,
        }
    }
}
