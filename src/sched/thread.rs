// Copyright 2025 The Rustux Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Thread representation
//!
//! Defines the kernel [`Thread`] and the types it is built from. Threads
//! live in the thread arena of their protection domain and are named by a
//! [`ThreadRef`] (domain plus slot), never by pointer.

use alloc::string::String;
use core::fmt;

use x86_64::registers::rflags::RFlags;
use x86_64::structures::idt::PageFaultErrorCode;
use x86_64::VirtAddr;

use super::state::{ThreadPriority, ThreadState};
use crate::kernel::ipc::{IpcNode, Utcb};
use crate::kernel::{CpuId, PdId, SignalContextId};

/// Kernel-global thread ID
pub type ThreadId = u64;

/// Name of a thread: its protection domain and arena slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ThreadRef {
    /// Owning protection domain
    pub pd: PdId,
    /// Slot in the domain's thread arena (process-local thread ID)
    pub slot: u16,
}

impl ThreadRef {
    /// Create a thread reference
    pub const fn new(pd: PdId, slot: u16) -> Self {
        Self { pd, slot }
    }
}

impl fmt::Display for ThreadRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.pd, self.slot)
    }
}

// ============================================================================
// Register Context
// ============================================================================

/// User code segment selector (GDT index 3, RPL 3)
pub const USER_CODE_SELECTOR: u64 = 0x1B;

/// User data segment selector (GDT index 4, RPL 3)
pub const USER_DATA_SELECTOR: u64 = 0x23;

/// Kernel code segment selector
pub const KERNEL_CODE_SELECTOR: u64 = 0x08;

/// Kernel data segment selector
pub const KERNEL_DATA_SELECTOR: u64 = 0x10;

/// Bit 1 of RFLAGS is reserved and always set
const RFLAGS_RESERVED: u64 = 0x2;

/// Saved user-visible CPU registers of a thread
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegisterContext {
    pub rax: u64,
    pub rbx: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub rbp: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    /// Instruction pointer
    pub rip: u64,
    /// Stack pointer
    pub rsp: u64,
    pub rflags: u64,
    pub cs: u64,
    pub ss: u64,
}

impl RegisterContext {
    /// Initial context of an ordinary user thread
    pub fn init_thread(&mut self, ip: VirtAddr, sp: VirtAddr) {
        *self = Self {
            rip: ip.as_u64(),
            rsp: sp.as_u64(),
            rflags: RFlags::INTERRUPT_FLAG.bits() | RFLAGS_RESERVED,
            cs: USER_CODE_SELECTOR,
            ss: USER_DATA_SELECTOR,
            ..Self::default()
        };
    }

    /// Initial context of the first thread of a protection domain
    ///
    /// The main thread finds its UTCB through `rdi`.
    pub fn init_main_thread(&mut self, ip: VirtAddr, sp: VirtAddr, utcb: VirtAddr) {
        self.init_thread(ip, sp);
        self.rdi = utcb.as_u64();
    }

    /// Initial context of the core main thread (and the idle threads)
    pub fn init_core_thread(&mut self, ip: VirtAddr, sp: VirtAddr) {
        *self = Self {
            rip: ip.as_u64(),
            rsp: sp.as_u64(),
            rflags: RFlags::INTERRUPT_FLAG.bits() | RFLAGS_RESERVED,
            cs: KERNEL_CODE_SELECTOR,
            ss: KERNEL_DATA_SELECTOR,
            ..Self::default()
        };
    }

    /// Check if the context executes in user mode
    pub fn is_user(&self) -> bool {
        self.cs & 0x3 == 0x3
    }
}

impl fmt::Display for RegisterContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "rip={:#018x} rsp={:#018x} rflags={:#x}", self.rip, self.rsp, self.rflags)?;
        writeln!(f, "rax={:#018x} rbx={:#018x} rcx={:#018x} rdx={:#018x}", self.rax, self.rbx, self.rcx, self.rdx)?;
        writeln!(f, "rsi={:#018x} rdi={:#018x} rbp={:#018x}", self.rsi, self.rdi, self.rbp)?;
        write!(f, "cs={:#x} ss={:#x}", self.cs, self.ss)
    }
}

/// How a thread's initial register context is set up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartKind {
    /// Additional thread of a user domain
    Thread,
    /// First thread of a user domain
    MainThread {
        /// Where the UTCB is mapped in the domain
        utcb: VirtAddr,
    },
    /// Core main thread or idle thread
    Core,
}

/// Description of the last page fault of a thread
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FaultDescriptor {
    /// Faulting address
    pub addr: VirtAddr,
    /// Hardware error code
    pub error: PageFaultErrorCode,
    /// Instruction pointer at the time of the fault
    pub ip: VirtAddr,
}

impl FaultDescriptor {
    /// Check if the fault was caused by a write access
    pub fn write(&self) -> bool {
        self.error.contains(PageFaultErrorCode::CAUSED_BY_WRITE)
    }

    /// Check if the fault was caused by an instruction fetch
    pub fn exec(&self) -> bool {
        self.error.contains(PageFaultErrorCode::INSTRUCTION_FETCH)
    }
}

/// Thread statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ThreadStats {
    /// Total CPU time consumed (in timer ticks)
    pub cpu_time: u64,
    /// Number of times this thread has been scheduled
    pub schedule_count: u64,
    /// Number of voluntary context switches (yields and blocking calls)
    pub voluntary_switches: u64,
    /// Number of page faults raised
    pub faults: u64,
}

/// Creation parameters of a thread
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadParams {
    /// Human-readable name, used in diagnostics only
    pub label: String,
    /// Priority of the thread's CPU claim
    pub priority: ThreadPriority,
    /// Guaranteed CPU time per super period
    pub quota_us: u64,
}

impl ThreadParams {
    /// Parameters for a thread without CPU quota
    pub fn new(label: &str) -> Self {
        Self {
            label: String::from(label),
            priority: ThreadPriority::default(),
            quota_us: 0,
        }
    }

    /// Set priority and quota
    pub fn with_claim(mut self, priority: ThreadPriority, quota_us: u64) -> Self {
        self.priority = priority;
        self.quota_us = quota_us;
        self
    }
}

// ============================================================================
// Thread
// ============================================================================

/// Kernel thread
#[derive(Debug)]
pub struct Thread {
    pub(crate) id: ThreadId,
    pub(crate) label: String,
    pub(crate) state: ThreadState,
    pub(crate) priority: ThreadPriority,
    /// CPU quota in ticks per super period
    pub(crate) quota: u64,
    pub(crate) cpu: CpuId,
    pub(crate) regs: RegisterContext,
    pub(crate) utcb: Utcb,
    pub(crate) ipc: IpcNode,
    pub(crate) fault: Option<FaultDescriptor>,
    pub(crate) pager: Option<SignalContextId>,
    pub(crate) timeout_signal: Option<SignalContextId>,
    pub(crate) waiting_signal: Option<SignalContextId>,
    pub(crate) stats: ThreadStats,
}

impl Thread {
    pub(crate) fn new(id: ThreadId, params: ThreadParams, quota: u64, utcb_size: usize) -> Self {
        Self {
            id,
            label: params.label,
            state: ThreadState::AwaitStart,
            priority: params.priority,
            quota,
            cpu: 0,
            regs: RegisterContext::default(),
            utcb: Utcb::new(utcb_size),
            ipc: IpcNode::new(),
            fault: None,
            pager: None,
            timeout_signal: None,
            waiting_signal: None,
            stats: ThreadStats::default(),
        }
    }

    /// Set up the initial register context and make the thread runnable
    ///
    /// # Panics
    ///
    /// Panics if the thread was already started.
    pub(crate) fn prepare_to_start(&mut self, ip: VirtAddr, sp: VirtAddr, cpu: CpuId, kind: StartKind) {
        assert!(
            self.state == ThreadState::AwaitStart,
            "thread '{}' started twice (state {:?})",
            self.label,
            self.state
        );

        match kind {
            StartKind::Thread => self.regs.init_thread(ip, sp),
            StartKind::MainThread { utcb } => self.regs.init_main_thread(ip, sp, utcb),
            StartKind::Core => self.regs.init_core_thread(ip, sp),
        }
        self.cpu = cpu;
        self.state = ThreadState::Runnable;
    }

    /// Kernel-global thread ID
    pub fn id(&self) -> ThreadId {
        self.id
    }

    /// Thread label
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Current state
    pub fn state(&self) -> ThreadState {
        self.state
    }

    /// Priority
    pub fn priority(&self) -> ThreadPriority {
        self.priority
    }

    /// CPU the thread is bound to
    pub fn cpu(&self) -> CpuId {
        self.cpu
    }

    /// Saved registers
    pub fn regs(&self) -> &RegisterContext {
        &self.regs
    }

    /// Message buffer
    pub fn utcb(&self) -> &Utcb {
        &self.utcb
    }

    /// IPC bookkeeping
    pub fn ipc(&self) -> &IpcNode {
        &self.ipc
    }

    /// Pending page fault, if the thread waits for its pager
    pub fn fault(&self) -> Option<&FaultDescriptor> {
        self.fault.as_ref()
    }

    /// Statistics
    pub fn stats(&self) -> &ThreadStats {
        &self.stats
    }
}
