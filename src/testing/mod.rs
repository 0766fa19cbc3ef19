// Copyright 2025 The Rustux Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Testing infrastructure
//!
//! Mock hardware and a boot helper for exercising the kernel on the host.
//!
//! # Usage
//! ```ignore
//! use rustux_core::testing::{boot, TestBoard};
//!
//! let (mut kernel, board) = boot(KernelConfig::with_cpus(2));
//! board.timers[0].set_counter(1_000);
//! kernel.handle_interrupt(0, TIMER_IRQ)?;
//! ```

pub mod mocks;

use std::boxed::Box;
use std::vec::Vec;

use crate::config::KernelConfig;
use crate::kernel::{Kernel, Platform};
use crate::traits::TimerDriver;

pub use mocks::{Mapping, MockPic, MockTimer, MockTlb, MockTranslationTable, IPI_IRQ, TIMER_IRQ};

/// Test-side handles on the hardware a kernel was booted with
pub struct TestBoard {
    pub timers: Vec<MockTimer>,
    pub pic: MockPic,
    pub tlb: MockTlb,
    pub core_table: MockTranslationTable,
}

/// Boot a kernel on mock hardware with 32-bit timers
///
/// # Panics
///
/// Panics if the configuration is rejected.
pub fn boot(config: KernelConfig) -> (Kernel, TestBoard) {
    let timers: Vec<MockTimer> = (0..config.cpus).map(|_| MockTimer::new(32, TIMER_IRQ)).collect();
    let board = TestBoard {
        timers: timers.clone(),
        pic: MockPic::new(),
        tlb: MockTlb::new(),
        core_table: MockTranslationTable::new(),
    };

    let platform = Platform {
        pic: Box::new(board.pic.clone()),
        tlb: Box::new(board.tlb.clone()),
        timers: timers
            .into_iter()
            .map(|t| Box::new(t) as Box<dyn TimerDriver>)
            .collect(),
        core_translation_table: Box::new(board.core_table.clone()),
    };
    let kernel = Kernel::new(config, platform).expect("boot failed");
    (kernel, board)
}
