// Copyright 2025 The Rustux Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Cross-CPU domain updates
//!
//! Changing a translation table requires every CPU to drop its cached
//! translations of that domain. The requesting CPU does its own part at
//! once; the others are sent an IPI and acknowledge the update when they
//! handle it. An update completes when the last CPU has acknowledged it.

use alloc::collections::VecDeque;
use alloc::vec::Vec;

use bitflags::bitflags;

use crate::sched::ThreadRef;

use super::cpu::CpuId;
use super::pd::PdId;

bitflags! {
    /// Set of CPUs, one bit per CPU ID
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct CpuMask: u64 {
        const _ = !0;
    }
}

impl CpuMask {
    /// Mask holding only `cpu`
    pub const fn cpu(cpu: CpuId) -> Self {
        Self::from_bits_retain(1 << cpu)
    }

    /// Mask of the first `count` CPUs
    pub const fn first(count: usize) -> Self {
        if count >= 64 {
            Self::from_bits_retain(u64::MAX)
        } else {
            Self::from_bits_retain((1 << count) - 1)
        }
    }

    /// Check if `cpu` is in the set
    pub const fn has(self, cpu: CpuId) -> bool {
        self.bits() & (1 << cpu) != 0
    }
}

/// One outstanding update
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DomainUpdate {
    /// Domain whose translations are invalidated
    pub domain: PdId,
    /// CPUs that still have to do their part
    pub pending: CpuMask,
    /// Thread blocked until the update completes
    pub requester: Option<ThreadRef>,
}

/// Outstanding updates, oldest first
#[derive(Debug, Default)]
pub struct DomainUpdates {
    list: VecDeque<DomainUpdate>,
}

impl DomainUpdates {
    pub const fn new() -> Self {
        Self { list: VecDeque::new() }
    }

    pub(crate) fn push(&mut self, update: DomainUpdate) {
        self.list.push_back(update);
    }

    /// Do the part of `cpu` for every update it still owes
    ///
    /// Calls `invalidate` once per affected domain and returns the
    /// requesters of updates that completed.
    pub(crate) fn acknowledge(&mut self, cpu: CpuId, mut invalidate: impl FnMut(PdId)) -> Vec<ThreadRef> {
        let mut unblocked = Vec::new();
        for update in self.list.iter_mut().filter(|u| u.pending.has(cpu)) {
            invalidate(update.domain);
            update.pending.remove(CpuMask::cpu(cpu));
            if update.pending.is_empty() {
                unblocked.extend(update.requester);
            }
        }
        self.list.retain(|u| !u.pending.is_empty());
        unblocked
    }

    /// Forget `thread` as requester, it will not wait for completion
    pub(crate) fn drop_requester(&mut self, thread: ThreadRef) {
        for update in self.list.iter_mut().filter(|u| u.requester == Some(thread)) {
            update.requester = None;
        }
    }

    /// Number of outstanding updates
    pub fn len(&self) -> usize {
        self.list.len()
    }

    pub fn is_empty(&self) -> bool {
        self.list.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &DomainUpdate> {
        self.list.iter()
    }
}
