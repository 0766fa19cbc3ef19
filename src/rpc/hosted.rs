// Copyright 2025 The Rustux Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! IPC port backed by the in-crate kernel
//!
//! A [`HostedPort`] binds a host execution context to one kernel thread.
//! Every operation is a kernel call on the shared [`Kernel`]; blocking
//! operations release the kernel lock and poll the thread state until the
//! kernel makes the thread runnable again.
//!
//! Capabilities hold a reference to the kernel for releasing their
//! selectors. Never drop one while holding the kernel lock.

use alloc::sync::Arc;

use x86_64::VirtAddr;

use crate::kernel::{CpuId, IpcStatus, Kernel, KernelError, PdId, ReplyCap};
use crate::object::{Capability, ReleasePolicy, Selector, SelectorRelease};
use crate::sched::{StartKind, ThreadParams, ThreadRef, ThreadState};

use super::msgbuf::{ExceptionCode, MsgBuf};
use super::port::{Incoming, IpcPort};
use super::IpcError;

/// Kernel shared between all ports
pub type SharedKernel = Arc<spin::Mutex<Kernel>>;

/// Entry address recorded for hosted threads, which never run kernel-side code
const HOSTED_ENTRY: u64 = 0x1000;

/// Capability space of one protection domain
struct CapSpace {
    kernel: SharedKernel,
    pd: PdId,
}

impl SelectorRelease for CapSpace {
    fn release(&self, selector: Selector) {
        if let Err(err) = self.kernel.lock().delete_cap(self.pd, selector) {
            log::warn!("{}: releasing {} failed: {}", self.pd, selector, err);
        }
    }
}

/// IPC port of one kernel thread
pub struct HostedPort {
    kernel: SharedKernel,
    thread: ThreadRef,
    space: Arc<CapSpace>,
    policy: ReleasePolicy,
}

impl HostedPort {
    /// Bind to the existing kernel thread `thread`
    pub fn new(kernel: SharedKernel, thread: ThreadRef) -> Self {
        let space = Arc::new(CapSpace {
            kernel: kernel.clone(),
            pd: thread.pd,
        });
        Self {
            kernel,
            thread,
            space,
            policy: ReleasePolicy::Immediate,
        }
    }

    /// Create and start a kernel thread in `pd` on `cpu` and bind to it
    pub fn spawn(kernel: &SharedKernel, pd: PdId, params: ThreadParams, cpu: CpuId) -> Result<Self, IpcError> {
        let thread = {
            let mut k = kernel.lock();
            let thread = k.new_thread(pd, params)?;
            let entry = VirtAddr::new(HOSTED_ENTRY);
            k.start_thread(thread, entry, entry, cpu, StartKind::Thread)?;
            thread
        };
        Ok(Self::new(kernel.clone(), thread))
    }

    /// Selector reclamation of capabilities allocated from now on
    pub fn with_policy(mut self, policy: ReleasePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn thread(&self) -> ThreadRef {
        self.thread
    }

    pub fn kernel(&self) -> &SharedKernel {
        &self.kernel
    }

    /// Copy `cap` into the domain of `to`
    pub fn delegate(&self, cap: &Capability, to: &HostedPort) -> Result<Capability, IpcError> {
        if !cap.valid() {
            return Err(IpcError::InvalidCapability);
        }
        let selector = self
            .kernel
            .lock()
            .copy_cap(self.thread.pd, cap.selector(), to.thread.pd)
            .map_err(|_| IpcError::InvalidCapability)?;
        Ok(Capability::new(cap.badge(), selector, to.space.clone(), to.policy))
    }

    /// Poll until the kernel lets the thread run again
    fn wait(&self) -> Result<(), IpcError> {
        loop {
            {
                let k = self.kernel.lock();
                match k.thread_state(self.thread)? {
                    ThreadState::Runnable => {
                        return match k.utcb(self.thread)?.status() {
                            IpcStatus::Canceled => Err(IpcError::BlockingCanceled),
                            IpcStatus::Failed => Err(IpcError::CallFailed),
                            _ => Ok(()),
                        };
                    }
                    state if !state.is_blocked() => {
                        return Err(IpcError::Kernel(KernelError::InvalidState(state)));
                    }
                    _ => {}
                }
            }
            core::hint::spin_loop();
        }
    }
}

impl IpcPort for HostedPort {
    fn reply_wait(&self, reply: Option<&MsgBuf>) -> Result<Incoming, IpcError> {
        {
            let mut k = self.kernel.lock();
            match reply {
                Some(msg) => {
                    k.write_utcb(self.thread, &msg.encode())?;
                    k.send_reply(self.thread, true)?;
                }
                None => {
                    k.await_request(self.thread)?;
                }
            }
        }

        loop {
            self.wait()?;

            let mut k = self.kernel.lock();
            let thread = k.thread(self.thread)?;
            let reply_cap = thread
                .ipc()
                .caller()
                .ok_or(IpcError::Kernel(KernelError::InvalidState(thread.state())))?;
            let badge = thread.utcb().badge();
            let decoded = MsgBuf::decode(thread.utcb().data());
            match decoded {
                Ok(msg) => return Ok(Incoming { badge, reply_cap, msg }),
                Err(err) => {
                    log::warn!("{}: request through {} rejected: {}", self.thread, badge, err);
                    let mut rejection = MsgBuf::new();
                    rejection.set_exception(ExceptionCode::INVALID_OBJECT);
                    k.write_utcb(self.thread, &rejection.encode())?;
                    k.send_reply(self.thread, true)?;
                }
            }
        }
    }

    fn reply(&self, dst: ReplyCap, msg: &MsgBuf) -> Result<bool, IpcError> {
        let mut k = self.kernel.lock();
        k.write_utcb(self.thread, &msg.encode())?;
        Ok(k.reply_to(self.thread, dst)?)
    }

    fn call(&self, dst: &Capability, msg: &MsgBuf) -> Result<MsgBuf, IpcError> {
        if !dst.valid() {
            return Err(IpcError::InvalidCapability);
        }
        let mut request = msg.clone();
        if !request.local_name().is_valid() {
            request.set_local_name(dst.badge());
        }

        {
            let mut k = self.kernel.lock();
            k.write_utcb(self.thread, &request.encode())?;
            match k.send_request(self.thread, dst.selector()) {
                Ok(()) => {}
                Err(KernelError::InvalidCapability(_)) => return Err(IpcError::InvalidCapability),
                Err(KernelError::InvalidState(state)) if state.is_dead() => return Err(IpcError::CallFailed),
                Err(err) => return Err(err.into()),
            }
        }
        self.wait()?;

        let k = self.kernel.lock();
        MsgBuf::decode(k.utcb(self.thread)?.data())
    }

    fn cancel_blocking(&self) -> Result<bool, IpcError> {
        Ok(self.kernel.lock().cancel_blocking(self.thread)?)
    }

    fn alloc_rpc_cap(&self) -> Result<Capability, IpcError> {
        let (selector, badge) = self.kernel.lock().new_rpc_cap(self.thread.pd, self.thread)?;
        Ok(Capability::new(badge, selector, self.space.clone(), self.policy))
    }

    fn max_message_len(&self) -> usize {
        self.kernel.lock().utcb(self.thread).map_or(0, |utcb| utcb.capacity())
    }
}
