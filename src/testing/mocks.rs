// Copyright 2025 The Rustux Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Mock hardware collaborators
//!
//! Every mock is a cheap handle on shared state: hand one clone to the
//! kernel and keep another to drive or inspect the hardware from the test.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::vec::Vec;

use spin::Mutex;
use x86_64::structures::paging::PageTableFlags;
use x86_64::{PhysAddr, VirtAddr};

use crate::kernel::{CpuId, KernelError, PdId};
use crate::traits::{InterruptController, TimerDriver, TlbMaintenance, TranslationTable};

/// IRQ the mock interrupt controller delivers IPIs on
pub const IPI_IRQ: u32 = 0xFD;

/// IRQ of every mock timer
pub const TIMER_IRQ: u32 = 32;

struct TimerState {
    counter: AtomicU64,
    bits: u32,
    irq: u32,
    one_shots: Mutex<Vec<u64>>,
}

/// Timer whose counter only moves when the test says so
#[derive(Clone)]
pub struct MockTimer {
    state: Arc<TimerState>,
}

impl MockTimer {
    pub fn new(bits: u32, irq: u32) -> Self {
        Self {
            state: Arc::new(TimerState {
                counter: AtomicU64::new(0),
                bits,
                irq,
                one_shots: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn set_counter(&self, value: u64) {
        self.state.counter.store(value, Ordering::SeqCst);
    }

    /// Move the counter forward, wrapping at the counter width
    pub fn advance(&self, ticks: u64) {
        let max = self.max_value();
        let next = self.state.counter.load(Ordering::SeqCst).wrapping_add(ticks) & max;
        self.set_counter(next);
    }

    pub fn last_one_shot(&self) -> Option<u64> {
        self.state.one_shots.lock().last().copied()
    }

    pub fn one_shots(&self) -> Vec<u64> {
        self.state.one_shots.lock().clone()
    }
}

impl TimerDriver for MockTimer {
    fn start_one_shot(&mut self, ticks: u64) {
        self.state.one_shots.lock().push(ticks);
    }

    fn counter(&self) -> u64 {
        self.state.counter.load(Ordering::SeqCst)
    }

    fn counter_bits(&self) -> u32 {
        self.state.bits
    }

    fn irq(&self) -> u32 {
        self.state.irq
    }
}

#[derive(Default)]
struct PicState {
    unmasked: Vec<(u32, CpuId)>,
    masked: Vec<u32>,
    acked: Vec<u32>,
    ipis: Vec<CpuId>,
}

/// Interrupt controller recording every request
#[derive(Clone, Default)]
pub struct MockPic {
    state: Arc<Mutex<PicState>>,
}

impl MockPic {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ipis(&self) -> Vec<CpuId> {
        self.state.lock().ipis.clone()
    }

    pub fn acked(&self) -> Vec<u32> {
        self.state.lock().acked.clone()
    }

    pub fn unmasked(&self) -> Vec<(u32, CpuId)> {
        self.state.lock().unmasked.clone()
    }
}

impl InterruptController for MockPic {
    fn unmask(&mut self, irq: u32, cpu: CpuId) {
        self.state.lock().unmasked.push((irq, cpu));
    }

    fn mask(&mut self, irq: u32) {
        self.state.lock().masked.push(irq);
    }

    fn ack(&mut self, irq: u32) {
        self.state.lock().acked.push(irq);
    }

    fn send_ipi(&mut self, cpu: CpuId) {
        self.state.lock().ipis.push(cpu);
    }

    fn ipi_irq(&self) -> u32 {
        IPI_IRQ
    }
}

/// Installed translation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mapping {
    pub virt: VirtAddr,
    pub phys: PhysAddr,
    pub size: usize,
    pub flags: PageTableFlags,
}

/// Page table keeping a flat list of mappings
#[derive(Clone, Default)]
pub struct MockTranslationTable {
    mappings: Arc<Mutex<Vec<Mapping>>>,
}

impl MockTranslationTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mappings(&self) -> Vec<Mapping> {
        self.mappings.lock().clone()
    }
}

impl TranslationTable for MockTranslationTable {
    fn insert_translation(
        &mut self,
        virt: VirtAddr,
        phys: PhysAddr,
        size: usize,
        flags: PageTableFlags,
    ) -> Result<(), KernelError> {
        if !flags.contains(PageTableFlags::PRESENT) {
            return Err(KernelError::TranslationRejected);
        }
        self.mappings.lock().push(Mapping { virt, phys, size, flags });
        Ok(())
    }

    fn remove_region(&mut self, virt: VirtAddr, size: usize) {
        let end = virt.as_u64() + size as u64;
        self.mappings
            .lock()
            .retain(|m| m.virt.as_u64() < virt.as_u64() || m.virt.as_u64() >= end);
    }
}

/// TLB recording every invalidation
#[derive(Clone, Default)]
pub struct MockTlb {
    invalidations: Arc<Mutex<Vec<(CpuId, PdId)>>>,
}

impl MockTlb {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn invalidations(&self) -> Vec<(CpuId, PdId)> {
        self.invalidations.lock().clone()
    }
}

impl TlbMaintenance for MockTlb {
    fn invalidate_domain(&mut self, cpu: CpuId, domain: PdId) {
        self.invalidations.lock().push((cpu, domain));
    }
}
