// Copyright 2025 The Rustux Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Kernel core
//!
//! The [`Kernel`] is one explicit context object holding every CPU,
//! protection domain, signal context and outstanding domain update. The
//! embedding architecture layer owns it (typically behind a `spin::Mutex`)
//! and calls into it on every kernel entry: system calls map to the public
//! methods, hardware events to [`Kernel::handle_interrupt`] and
//! [`Kernel::handle_exception`].
//!
//! # Modules
//!
//! - [`cpu`] - Per-CPU scheduler, timer and current thread
//! - [`timer`] - Timeout list on top of a free-running counter
//! - [`ipc`] - Synchronous request/reply between threads
//! - [`signal`] - Asynchronous signals and thread timeouts
//! - [`pd`] - Protection domains and their capability spaces
//! - [`domain_update`] - Cross-CPU TLB invalidation
//!
//! # Blocking
//!
//! A thread that blocks leaves its CPU's scheduler at once. If it was the
//! CPU's current thread, the CPU reschedules before the call returns.
//! Threads that become runnable only compete again; the embedding layer
//! calls [`Kernel::schedule`] on kernel exit to let them preempt.

pub mod cpu;
pub mod domain_update;
pub mod error;
pub mod ipc;
pub mod pd;
pub mod signal;
pub mod timer;

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::vec::Vec;

use x86_64::structures::idt::PageFaultErrorCode;
use x86_64::structures::paging::PageTableFlags;
use x86_64::{PhysAddr, VirtAddr};

use crate::config::KernelConfig;
use crate::sched::{
    FaultDescriptor, RegisterContext, StartKind, Thread, ThreadId, ThreadParams, ThreadRef, ThreadState,
};
use crate::traits::{InterruptController, TimerDriver, TlbMaintenance, TranslationTable};

pub use cpu::{Cpu, CpuId, Switch};
pub use domain_update::{CpuMask, DomainUpdate, DomainUpdates};
pub use error::{KernelError, TimerError};
pub use ipc::{IpcNode, IpcStatus, ReplyCap, Utcb};
pub use pd::{CapEntry, Pd, PdId};
pub use signal::{Signal, SignalContext, SignalContextId};
pub use timer::{TimeBase, TimeoutOwner, Timer};

use timer::TimeoutOwner as Owner;

/// Hardware collaborators handed to the kernel at boot
pub struct Platform {
    pub pic: Box<dyn InterruptController>,
    pub tlb: Box<dyn TlbMaintenance>,
    /// One timer per CPU, indexed by CPU ID
    pub timers: Vec<Box<dyn TimerDriver>>,
    /// Translation table of the core domain
    pub core_translation_table: Box<dyn TranslationTable>,
}

/// CPU exception raised while a thread was current
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exception {
    /// Hardware interrupt
    Interrupt(u32),
    /// Page fault
    PageFault {
        addr: VirtAddr,
        error: PageFaultErrorCode,
    },
    /// Any other trap the thread cannot recover from
    Undefined { vector: u8 },
}

/// The kernel
pub struct Kernel {
    config: KernelConfig,
    time_base: TimeBase,
    cpus: Vec<Cpu>,
    pds: Vec<Option<Pd>>,
    signals: BTreeMap<SignalContextId, SignalContext>,
    domain_updates: DomainUpdates,
    pic: Box<dyn InterruptController>,
    tlb: Box<dyn TlbMaintenance>,
    next_thread_id: ThreadId,
    next_badge: u64,
    next_call_seq: u64,
    next_signal: u32,
}

impl Kernel {
    /// Bring up the kernel on `config.cpus` CPUs
    ///
    /// Creates the core domain with one idle thread per CPU, unmasks the
    /// timer and IPI interrupts and makes the first scheduling decision on
    /// every CPU.
    pub fn new(config: KernelConfig, platform: Platform) -> Result<Self, KernelError> {
        config.validate()?;
        if platform.timers.len() != config.cpus {
            return Err(KernelError::InvalidConfig("one timer per cpu required"));
        }
        if config.max_threads_per_pd < config.cpus {
            return Err(KernelError::InvalidConfig("core domain cannot hold the idle threads"));
        }

        let time_base = TimeBase::new(config.ticks_per_ms)?;
        let time_slice = time_base.ms_to_ticks(config.time_slice_ms);
        let super_period = time_base.us_to_ticks(config.super_period_us);

        let mut core = Pd::new(
            PdId::CORE,
            "core",
            config.max_threads_per_pd,
            platform.core_translation_table,
        );
        let mut next_thread_id = 1;
        let mut cpus = Vec::with_capacity(config.cpus);
        for (id, driver) in platform.timers.into_iter().enumerate() {
            let slot = core.alloc_slot()?;
            let mut idle = Thread::new(next_thread_id, ThreadParams::new("idle"), 0, config.utcb_size);
            next_thread_id += 1;
            // Idle threads never leave the kernel, their entry is a placeholder
            idle.prepare_to_start(VirtAddr::zero(), VirtAddr::zero(), id, StartKind::Core);
            core.install(slot, idle);

            let timer = Timer::new(driver, time_base, time_slice)?;
            cpus.push(Cpu::new(id, ThreadRef::new(PdId::CORE, slot), timer, super_period, time_slice));
        }

        let mut pds = Vec::new();
        pds.push(Some(core));

        let mut kernel = Self {
            config,
            time_base,
            cpus,
            pds,
            signals: BTreeMap::new(),
            domain_updates: DomainUpdates::new(),
            pic: platform.pic,
            tlb: platform.tlb,
            next_thread_id,
            next_badge: 1,
            next_call_seq: 1,
            next_signal: 1,
        };

        let ipi_irq = kernel.pic.ipi_irq();
        for cpu in 0..kernel.cpus.len() {
            let timer_irq = kernel.cpus[cpu].timer().irq();
            kernel.pic.unmask(timer_irq, cpu);
            kernel.pic.unmask(ipi_irq, cpu);
            kernel.schedule(cpu)?;
        }

        log::info!(
            "kernel: {} cpu(s), {} ticks/ms, time slice {} ticks, super period {} ticks",
            config.cpus,
            config.ticks_per_ms,
            time_slice,
            super_period
        );
        Ok(kernel)
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    pub fn time_base(&self) -> TimeBase {
        self.time_base
    }

    pub fn cpu_count(&self) -> usize {
        self.cpus.len()
    }

    pub fn cpu(&self, cpu: CpuId) -> Result<&Cpu, KernelError> {
        self.cpus.get(cpu).ok_or(KernelError::InvalidCpu(cpu))
    }

    fn cpu_mut(&mut self, cpu: CpuId) -> Result<&mut Cpu, KernelError> {
        self.cpus.get_mut(cpu).ok_or(KernelError::InvalidCpu(cpu))
    }

    /// Thread currently dispatched on `cpu`
    pub fn current(&self, cpu: CpuId) -> Result<ThreadRef, KernelError> {
        Ok(self.cpu(cpu)?.current())
    }

    pub fn pd(&self, pd: PdId) -> Result<&Pd, KernelError> {
        self.pds
            .get(usize::from(pd.into_raw()))
            .and_then(Option::as_ref)
            .ok_or(KernelError::InvalidPd(pd))
    }

    fn pd_mut(&mut self, pd: PdId) -> Result<&mut Pd, KernelError> {
        self.pds
            .get_mut(usize::from(pd.into_raw()))
            .and_then(Option::as_mut)
            .ok_or(KernelError::InvalidPd(pd))
    }

    pub fn thread(&self, thread: ThreadRef) -> Result<&Thread, KernelError> {
        self.pd(thread.pd)
            .ok()
            .and_then(|pd| pd.thread(thread.slot))
            .ok_or(KernelError::InvalidThread(thread))
    }

    pub(crate) fn thread_mut(&mut self, thread: ThreadRef) -> Result<&mut Thread, KernelError> {
        self.pd_mut(thread.pd)
            .ok()
            .and_then(|pd| pd.thread_mut(thread.slot))
            .ok_or(KernelError::InvalidThread(thread))
    }

    pub fn thread_state(&self, thread: ThreadRef) -> Result<ThreadState, KernelError> {
        Ok(self.thread(thread)?.state)
    }

    pub fn domain_updates(&self) -> &DomainUpdates {
        &self.domain_updates
    }

    /// Every live thread of every domain
    fn all_threads(&self) -> Vec<ThreadRef> {
        self.pds.iter().flatten().flat_map(Pd::thread_refs).collect()
    }

    fn is_idle(&self, thread: ThreadRef) -> bool {
        self.cpus.iter().any(|cpu| cpu.idle() == thread)
    }

    fn require_state(&self, thread: ThreadRef, expected: ThreadState) -> Result<(), KernelError> {
        match self.thread_state(thread)? {
            state if state == expected => Ok(()),
            state => Err(KernelError::InvalidState(state)),
        }
    }

    // ========================================================================
    // Scheduling
    // ========================================================================

    /// Take `thread` out of scheduling and put it into `state`
    pub(crate) fn block(&mut self, thread: ThreadRef, state: ThreadState) -> Result<(), KernelError> {
        let t = self.thread_mut(thread)?;
        t.state = state;
        t.stats.voluntary_switches += 1;
        let cpu = t.cpu;

        let core = self.cpu_mut(cpu)?;
        core.scheduler_mut().unready(thread);
        if core.current() == thread {
            self.schedule(cpu)?;
        }
        Ok(())
    }

    /// Make `thread` runnable and let it compete for its CPU
    pub(crate) fn activate(&mut self, thread: ThreadRef) -> Result<(), KernelError> {
        let t = self.thread_mut(thread)?;
        t.state = ThreadState::Runnable;
        let cpu = t.cpu;
        self.cpu_mut(cpu)?.scheduler_mut().ready(thread);
        Ok(())
    }

    /// Account the time of the current thread of `cpu` and pick the next one
    pub fn schedule(&mut self, cpu: CpuId) -> Result<ThreadRef, KernelError> {
        let switch = self.cpu_mut(cpu)?.schedule();

        if let Ok(prev) = self.thread_mut(switch.prev) {
            prev.stats.cpu_time += switch.consumed;
        }
        if switch.next != switch.prev {
            if let Ok(next) = self.thread_mut(switch.next) {
                next.stats.schedule_count += 1;
            }
            log::trace!("cpu{}: switch {} -> {}", cpu, switch.prev, switch.next);
        }
        Ok(switch.next)
    }

    // ========================================================================
    // Protection domains and threads
    // ========================================================================

    /// Create a protection domain
    pub fn new_pd(&mut self, label: &str, translation_table: Box<dyn TranslationTable>) -> Result<PdId, KernelError> {
        let index = match self.pds.iter().position(Option::is_none) {
            Some(index) => index,
            None if self.pds.len() <= usize::from(u16::MAX) => {
                self.pds.push(None);
                self.pds.len() - 1
            }
            None => return Err(KernelError::PdExhausted),
        };
        let id = PdId::new(index as u16);
        self.pds[index] = Some(Pd::new(id, label, self.config.max_threads_per_pd, translation_table));
        log::debug!("{}: created '{}'", id, label);
        Ok(id)
    }

    /// Tear down a protection domain with all its threads and signal contexts
    pub fn delete_pd(&mut self, pd: PdId) -> Result<(), KernelError> {
        if pd == PdId::CORE {
            return Err(KernelError::InvalidPd(pd));
        }
        let threads: Vec<ThreadRef> = self.pd(pd)?.thread_refs().collect();
        for thread in threads {
            self.delete_thread(thread)?;
        }

        let contexts: Vec<SignalContextId> = self
            .signals
            .iter()
            .filter(|(_, ctx)| ctx.pd == pd)
            .map(|(id, _)| *id)
            .collect();
        for ctx in contexts {
            self.delete_signal_context(ctx)?;
        }

        self.pds[usize::from(pd.into_raw())] = None;
        log::debug!("{}: destroyed", pd);
        Ok(())
    }

    /// Create a thread in `pd`; it awaits start
    pub fn new_thread(&mut self, pd: PdId, params: ThreadParams) -> Result<ThreadRef, KernelError> {
        let id = self.next_thread_id;
        let quota = self.time_base.us_to_ticks(params.quota_us);
        let utcb_size = self.config.utcb_size;

        let domain = self.pd_mut(pd)?;
        let slot = domain.alloc_slot()?;
        domain.install(slot, Thread::new(id, params, quota, utcb_size));
        self.next_thread_id += 1;

        Ok(ThreadRef::new(pd, slot))
    }

    /// Start `thread` at `ip` with stack `sp` on `cpu`
    ///
    /// # Panics
    ///
    /// Panics if the thread was started before.
    pub fn start_thread(
        &mut self,
        thread: ThreadRef,
        ip: VirtAddr,
        sp: VirtAddr,
        cpu: CpuId,
        kind: StartKind,
    ) -> Result<(), KernelError> {
        self.cpu(cpu)?;
        if kind == StartKind::Core && thread.pd != PdId::CORE {
            return Err(KernelError::InvalidPd(thread.pd));
        }

        let t = self.thread_mut(thread)?;
        t.prepare_to_start(ip, sp, cpu, kind);
        let (priority, quota) = (t.priority, t.quota);
        log::debug!("{}: '{}' started on cpu{} at {:#x}", thread, t.label, cpu, ip.as_u64());

        let scheduler = self.cpu_mut(cpu)?.scheduler_mut();
        scheduler.insert(thread, priority, quota);
        scheduler.ready(thread);
        Ok(())
    }

    /// Stop `thread` until it is resumed
    pub fn pause_thread(&mut self, thread: ThreadRef) -> Result<(), KernelError> {
        match self.thread_state(thread)? {
            ThreadState::Runnable => self.block(thread, ThreadState::AwaitsResume),
            ThreadState::AwaitsResume => Ok(()),
            state => Err(KernelError::InvalidState(state)),
        }
    }

    /// Continue a paused or faulted thread
    ///
    /// Returns false if the thread was not waiting for resumption.
    pub fn resume_thread(&mut self, thread: ThreadRef) -> Result<bool, KernelError> {
        if self.thread_state(thread)? != ThreadState::AwaitsResume {
            return Ok(false);
        }
        self.thread_mut(thread)?.fault = None;
        self.domain_updates.drop_requester(thread);
        self.activate(thread)?;
        Ok(true)
    }

    /// Give up the rest of the current time slice
    pub fn yield_thread(&mut self, thread: ThreadRef) -> Result<(), KernelError> {
        let t = self.thread_mut(thread)?;
        t.stats.voluntary_switches += 1;
        let cpu = t.cpu;

        let core = self.cpu_mut(cpu)?;
        if core.current() != thread {
            return Ok(());
        }
        core.scheduler_mut().yield_head();
        self.schedule(cpu)?;
        Ok(())
    }

    pub fn read_registers(&self, thread: ThreadRef) -> Result<RegisterContext, KernelError> {
        Ok(self.thread(thread)?.regs)
    }

    pub fn write_registers(&mut self, thread: ThreadRef, regs: &RegisterContext) -> Result<(), KernelError> {
        self.thread_mut(thread)?.regs = *regs;
        Ok(())
    }

    /// Route the page faults of `thread` to `pager`
    pub fn set_pager(&mut self, thread: ThreadRef, pager: Option<SignalContextId>) -> Result<(), KernelError> {
        if let Some(ctx) = pager {
            if !self.signals.contains_key(&ctx) {
                return Err(KernelError::InvalidSignalContext(ctx));
            }
        }
        self.thread_mut(thread)?.pager = pager;
        Ok(())
    }

    /// Destroy `thread` and return its final state
    ///
    /// Requests queued at the thread, the request in service and any
    /// deferred callers fail; its own outstanding request is withdrawn.
    pub fn delete_thread(&mut self, thread: ThreadRef) -> Result<Thread, KernelError> {
        if self.is_idle(thread) {
            return Err(KernelError::InvalidThread(thread));
        }
        let t = self.thread_mut(thread)?;
        let (cpu, started, waiting_signal) = (t.cpu, t.state != ThreadState::AwaitStart, t.waiting_signal.take());

        self.withdraw_request(thread)?;
        self.fail_waiters(thread)?;
        if let Some(ctx) = waiting_signal.and_then(|id| self.signals.get_mut(&id)) {
            ctx.waiter = None;
        }
        if started {
            let cpu = self.cpu_mut(cpu)?;
            cpu.timer_mut().cancel_timeout(Owner::Thread(thread));
            cpu.scheduler_mut().remove(thread);
        }
        self.domain_updates.drop_requester(thread);
        for pd in self.pds.iter_mut().flatten() {
            pd.revoke_target(thread);
        }

        let mut destroyed = self
            .pd_mut(thread.pd)?
            .take(thread.slot)
            .ok_or(KernelError::InvalidThread(thread))?;
        destroyed.state = ThreadState::Destroyed;

        if started && self.cpu(cpu)?.current() == thread {
            self.schedule(cpu)?;
        }
        log::debug!("{}: '{}' destroyed", thread, destroyed.label);
        Ok(destroyed)
    }

    /// Stop `thread` for good after an unrecoverable exception
    fn stop_thread(&mut self, thread: ThreadRef) -> Result<(), KernelError> {
        self.block(thread, ThreadState::Stopped)?;
        self.fail_waiters(thread)
    }

    // ========================================================================
    // Exceptions and interrupts
    // ========================================================================

    /// Handle an exception raised on `cpu`; returns the thread to run next
    pub fn handle_exception(&mut self, cpu: CpuId, exception: Exception) -> Result<ThreadRef, KernelError> {
        let current = self.current(cpu)?;
        match exception {
            Exception::Interrupt(irq) => return self.handle_interrupt(cpu, irq),
            _ if self.is_idle(current) => {
                log::error!("cpu{}: {:?} in idle thread", cpu, exception);
            }
            Exception::PageFault { addr, error } => self.page_fault(current, addr, error)?,
            Exception::Undefined { vector } => {
                let t = self.thread(current)?;
                log::error!("{}: '{}' raised exception {}\n{}", current, t.label, vector, t.regs);
                self.stop_thread(current)?;
            }
        }
        self.schedule(cpu)
    }

    /// Suspend `thread` on a page fault and notify its pager
    ///
    /// Threads without a pager, and faults the domain's translation table
    /// rejects, stop the thread instead.
    pub fn page_fault(&mut self, thread: ThreadRef, addr: VirtAddr, error: PageFaultErrorCode) -> Result<(), KernelError> {
        let resolvable = self.pd(thread.pd)?.translation_table().resolvable(addr, error);
        let t = self.thread_mut(thread)?;
        t.stats.faults += 1;
        let fault = FaultDescriptor {
            addr,
            error,
            ip: VirtAddr::new_truncate(t.regs.rip),
        };

        match t.pager {
            Some(pager) if resolvable => {
                t.fault = Some(fault);
                log::debug!("{}: page fault at {:#x} ({:?})", thread, addr.as_u64(), error);
                self.block(thread, ThreadState::AwaitsResume)?;
                self.submit_signal(pager, 1)
            }
            _ => {
                log::error!(
                    "{}: '{}' unresolvable page fault at {:#x} ({:?})\n{}",
                    thread,
                    t.label,
                    addr.as_u64(),
                    error,
                    t.regs
                );
                t.fault = Some(fault);
                self.stop_thread(thread)
            }
        }
    }

    /// Map the page `thread` faulted on and resume it
    pub fn resolve_fault(
        &mut self,
        thread: ThreadRef,
        phys: PhysAddr,
        size: usize,
        flags: PageTableFlags,
    ) -> Result<(), KernelError> {
        let t = self.thread(thread)?;
        let fault = t.fault.ok_or(KernelError::InvalidState(t.state))?;
        if t.state != ThreadState::AwaitsResume {
            return Err(KernelError::InvalidState(t.state));
        }
        if !size.is_power_of_two() {
            return Err(KernelError::TranslationRejected);
        }

        let base = VirtAddr::new_truncate(fault.addr.as_u64() & !(size as u64 - 1));
        self.pd_mut(thread.pd)?
            .translation_table_mut()
            .insert_translation(base, phys, size, flags)?;
        self.resume_thread(thread)?;
        Ok(())
    }

    /// Remove a region of `pd` and flush it from every CPU's TLB
    ///
    /// Returns true if `requester` blocks until all CPUs are done.
    pub fn unmap(
        &mut self,
        requester: ThreadRef,
        pd: PdId,
        virt: VirtAddr,
        size: usize,
        blocking: bool,
    ) -> Result<bool, KernelError> {
        self.pd_mut(pd)?.translation_table_mut().remove_region(virt, size);
        self.update_domain(requester, pd, blocking)
    }

    /// Invalidate the translations of `domain` on every CPU
    ///
    /// The CPU of `requester` does its part immediately. Other CPUs are
    /// sent an IPI; with `blocking` the requester waits until the last one
    /// has acknowledged. Returns true if the requester blocked.
    pub fn update_domain(&mut self, requester: ThreadRef, domain: PdId, blocking: bool) -> Result<bool, KernelError> {
        let cpu = self.thread(requester)?.cpu;
        self.pd(domain)?;

        self.tlb.invalidate_domain(cpu, domain);
        let others = CpuMask::first(self.cpus.len()) - CpuMask::cpu(cpu);
        if others.is_empty() {
            return Ok(false);
        }

        self.domain_updates.push(DomainUpdate {
            domain,
            pending: others,
            requester: blocking.then_some(requester),
        });
        for other in 0..self.cpus.len() {
            if others.has(other) && self.cpus[other].trigger_ipi() {
                self.pic.send_ipi(other);
            }
        }

        if blocking {
            self.block(requester, ThreadState::AwaitsResume)?;
        }
        Ok(blocking)
    }

    fn handle_ipi(&mut self, cpu: CpuId) -> Result<(), KernelError> {
        self.cpu_mut(cpu)?.clear_ipi();
        let tlb = &mut self.tlb;
        let finished = self
            .domain_updates
            .acknowledge(cpu, |domain| tlb.invalidate_domain(cpu, domain));
        for requester in finished {
            if self.thread_state(requester) == Ok(ThreadState::AwaitsResume) {
                self.activate(requester)?;
            }
        }
        Ok(())
    }

    /// Handle `irq` on `cpu`; returns the thread to run next
    pub fn handle_interrupt(&mut self, cpu: CpuId, irq: u32) -> Result<ThreadRef, KernelError> {
        if irq == self.cpu(cpu)?.timer().irq() {
            let fired = self.cpu_mut(cpu)?.timer_mut().process_timeouts();
            for owner in fired {
                if let Owner::Thread(thread) = owner {
                    self.timeout_triggered(thread);
                }
            }
        } else if irq == self.pic.ipi_irq() {
            self.handle_ipi(cpu)?;
        } else {
            log::warn!("cpu{}: unexpected irq {}", cpu, irq);
        }
        self.pic.ack(irq);
        self.schedule(cpu)
    }
}
