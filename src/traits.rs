// Copyright 2025 The Rustux Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Hardware collaborator traits
//!
//! The kernel core never touches hardware directly. Each architecture or
//! board back end implements these traits and passes the implementations to
//! [`Kernel::new`](crate::kernel::Kernel::new) through a
//! [`Platform`](crate::kernel::Platform):
//!
//! - [`InterruptController`]: per-IRQ masking/acknowledgement and IPIs
//! - [`TimerDriver`]: one free-running counter plus a one-shot comparator per CPU
//! - [`TranslationTable`]: the page table of one protection domain
//! - [`TlbMaintenance`]: per-CPU invalidation of a domain's cached translations

use x86_64::structures::idt::PageFaultErrorCode;
use x86_64::structures::paging::PageTableFlags;
use x86_64::{PhysAddr, VirtAddr};

use crate::kernel::{CpuId, KernelError, PdId};

/// Trait for interrupt controller operations
///
/// - x86_64: Local APIC + I/O APIC
/// - ARM64: GIC
/// - RISC-V: PLIC
pub trait InterruptController: Send {
    /// Route `irq` to `cpu` and unmask it
    fn unmask(&mut self, irq: u32, cpu: CpuId);

    /// Mask `irq`
    fn mask(&mut self, irq: u32);

    /// Signal end of interrupt for `irq`
    fn ack(&mut self, irq: u32);

    /// Send an inter-processor interrupt to `cpu`
    fn send_ipi(&mut self, cpu: CpuId);

    /// IRQ number under which IPIs are delivered
    fn ipi_irq(&self) -> u32;
}

/// Per-CPU hardware timer
///
/// The counter is free running and `counter_bits()` wide; it wraps to zero
/// after reaching its maximum. The one-shot comparator raises `irq()` once
/// `ticks` have elapsed after `start_one_shot(ticks)`.
pub trait TimerDriver: Send {
    /// Program the one-shot interrupt `ticks` from now
    fn start_one_shot(&mut self, ticks: u64);

    /// Raw counter value
    fn counter(&self) -> u64;

    /// Counter width in bits (1..=64)
    fn counter_bits(&self) -> u32;

    /// IRQ raised by the one-shot comparator
    fn irq(&self) -> u32;

    /// Largest tick value the counter can represent
    fn max_value(&self) -> u64 {
        match self.counter_bits() {
            bits if bits >= 64 => u64::MAX,
            bits => (1u64 << bits) - 1,
        }
    }
}

/// Translation table of one protection domain
pub trait TranslationTable: Send {
    /// Install a translation of `size` bytes at `virt` to `phys`
    fn insert_translation(
        &mut self,
        virt: VirtAddr,
        phys: PhysAddr,
        size: usize,
        flags: PageTableFlags,
    ) -> Result<(), KernelError>;

    /// Remove every translation within `[virt, virt + size)`
    fn remove_region(&mut self, virt: VirtAddr, size: usize);

    /// Whether a fault at `addr` with `error` can be resolved by a pager
    ///
    /// The default accepts user-half addresses whose fault was not caused by
    /// a malformed table entry.
    fn resolvable(&self, addr: VirtAddr, error: PageFaultErrorCode) -> bool {
        is_user_address(addr) && !error.contains(PageFaultErrorCode::MALFORMED_TABLE)
    }
}

/// Per-CPU TLB maintenance
pub trait TlbMaintenance: Send {
    /// Drop every cached translation of `domain` on `cpu`
    fn invalidate_domain(&mut self, cpu: CpuId, domain: PdId);
}

/// Check if an address lies in the user half of the address space
///
/// User addresses are in the canonical lower half
/// (0x0000_0000_0000_0000 - 0x0000_7FFF_FFFF_FFFF).
pub fn is_user_address(addr: VirtAddr) -> bool {
    addr.as_u64() < 0x0000_8000_0000_0000
}
