// Copyright 2025 The Rustux Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Protection domains
//!
//! A protection domain owns a translation table, a bounded arena of thread
//! slots and a capability space. Its ID doubles as the address-space
//! identifier used for TLB maintenance.

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::vec::Vec;
use core::fmt;

use crate::object::{Badge, Selector};
use crate::sched::{Thread, ThreadRef};
use crate::traits::TranslationTable;

use super::error::KernelError;
use super::Kernel;

/// Protection domain ID
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PdId(u16);

impl PdId {
    /// The core domain, created at boot
    pub const CORE: Self = Self(0);

    pub const fn new(raw: u16) -> Self {
        Self(raw)
    }

    pub const fn into_raw(self) -> u16 {
        self.0
    }
}

impl fmt::Display for PdId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pd{}", self.0)
    }
}

/// Capability-space entry: an IPC destination with its badge
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CapEntry {
    /// Thread requests are delivered to
    pub target: ThreadRef,
    /// Identity handed to the server with each request
    pub badge: Badge,
}

/// State of an allocated selector
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CapSlot {
    Live(CapEntry),
    /// Target vanished; the selector stays allocated until its holder frees it
    Revoked,
}

/// Protection domain
pub struct Pd {
    id: PdId,
    label: String,
    threads: Vec<Option<Thread>>,
    translation_table: Box<dyn TranslationTable>,
    caps: BTreeMap<Selector, CapSlot>,
    next_selector: u32,
    free_selectors: Vec<Selector>,
}

impl Pd {
    pub(crate) fn new(
        id: PdId,
        label: &str,
        max_threads: usize,
        translation_table: Box<dyn TranslationTable>,
    ) -> Self {
        let mut threads = Vec::with_capacity(max_threads);
        threads.resize_with(max_threads, || None);
        Self {
            id,
            label: String::from(label),
            threads,
            translation_table,
            caps: BTreeMap::new(),
            next_selector: 1,
            free_selectors: Vec::new(),
        }
    }

    pub fn id(&self) -> PdId {
        self.id
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    // Thread arena

    pub(crate) fn alloc_slot(&mut self) -> Result<u16, KernelError> {
        let slot = self
            .threads
            .iter()
            .position(Option::is_none)
            .ok_or(KernelError::SlotExhausted(self.id))?;
        // Slot count is bounded by u16::MAX at configuration time
        Ok(slot as u16)
    }

    pub(crate) fn install(&mut self, slot: u16, thread: Thread) {
        self.threads[usize::from(slot)] = Some(thread);
    }

    pub(crate) fn take(&mut self, slot: u16) -> Option<Thread> {
        self.threads.get_mut(usize::from(slot))?.take()
    }

    pub fn thread(&self, slot: u16) -> Option<&Thread> {
        self.threads.get(usize::from(slot))?.as_ref()
    }

    pub(crate) fn thread_mut(&mut self, slot: u16) -> Option<&mut Thread> {
        self.threads.get_mut(usize::from(slot))?.as_mut()
    }

    /// References to every live thread of the domain
    pub fn thread_refs(&self) -> impl Iterator<Item = ThreadRef> + '_ {
        self.threads
            .iter()
            .enumerate()
            .filter(|(_, t)| t.is_some())
            .map(move |(slot, _)| ThreadRef::new(self.id, slot as u16))
    }

    pub fn thread_count(&self) -> usize {
        self.threads.iter().filter(|t| t.is_some()).count()
    }

    // Capability space

    pub(crate) fn insert_cap(&mut self, entry: CapEntry) -> Selector {
        let selector = self.free_selectors.pop().unwrap_or_else(|| {
            let selector = Selector::new(self.next_selector);
            self.next_selector += 1;
            selector
        });
        self.caps.insert(selector, CapSlot::Live(entry));
        selector
    }

    /// Free `selector`, live or revoked; returns whether it was allocated
    pub(crate) fn remove_cap(&mut self, selector: Selector) -> bool {
        if self.caps.remove(&selector).is_none() {
            return false;
        }
        self.free_selectors.push(selector);
        true
    }

    /// Revoke every capability that targets `thread`
    ///
    /// Revoked selectors are not handed out again before [`Self::remove_cap`]
    /// frees them, so a late release by their holder cannot hit a newer
    /// capability.
    pub(crate) fn revoke_target(&mut self, thread: ThreadRef) {
        for slot in self.caps.values_mut() {
            if matches!(slot, CapSlot::Live(entry) if entry.target == thread) {
                *slot = CapSlot::Revoked;
            }
        }
    }

    /// Live capability at `selector`
    pub fn cap(&self, selector: Selector) -> Option<&CapEntry> {
        match self.caps.get(&selector)? {
            CapSlot::Live(entry) => Some(entry),
            CapSlot::Revoked => None,
        }
    }

    /// Check if `selector` is allocated, possibly to a revoked capability
    pub fn is_allocated(&self, selector: Selector) -> bool {
        self.caps.contains_key(&selector)
    }

    /// Number of live capabilities
    pub fn cap_count(&self) -> usize {
        self.caps.values().filter(|slot| matches!(slot, CapSlot::Live(_))).count()
    }

    // Address space

    pub fn translation_table(&self) -> &dyn TranslationTable {
        self.translation_table.as_ref()
    }

    pub(crate) fn translation_table_mut(&mut self) -> &mut dyn TranslationTable {
        self.translation_table.as_mut()
    }
}

impl fmt::Debug for Pd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pd")
            .field("id", &self.id)
            .field("label", &self.label)
            .field("threads", &self.thread_count())
            .field("caps", &self.cap_count())
            .finish()
    }
}

// ============================================================================
// Capability-space operations
// ============================================================================

impl Kernel {
    /// Create a new RPC capability in `pd` whose requests go to `target`
    ///
    /// Every capability gets a fresh badge.
    pub fn new_rpc_cap(&mut self, pd: PdId, target: ThreadRef) -> Result<(Selector, Badge), KernelError> {
        self.thread(target)?;
        let badge = Badge::new(self.next_badge);
        let selector = self.pd_mut(pd)?.insert_cap(CapEntry { target, badge });
        self.next_badge += 1;
        log::trace!("{}: {} -> {} badge {}", pd, selector, target, badge);
        Ok((selector, badge))
    }

    /// Copy the capability at `selector` of `from` into `to`
    pub fn copy_cap(&mut self, from: PdId, selector: Selector, to: PdId) -> Result<Selector, KernelError> {
        let entry = *self
            .pd(from)?
            .cap(selector)
            .ok_or(KernelError::InvalidCapability(selector))?;
        Ok(self.pd_mut(to)?.insert_cap(entry))
    }

    /// Free `selector` in `pd`
    ///
    /// Also frees selectors whose capability was revoked.
    pub fn delete_cap(&mut self, pd: PdId, selector: Selector) -> Result<(), KernelError> {
        if !self.pd_mut(pd)?.remove_cap(selector) {
            return Err(KernelError::InvalidCapability(selector));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sched::ThreadParams;
    use crate::testing::MockTranslationTable;

    fn pd(slots: usize) -> Pd {
        Pd::new(PdId::new(3), "test", slots, Box::new(MockTranslationTable::new()))
    }

    #[test]
    fn test_slot_exhaustion() {
        let mut pd = pd(2);
        for id in 0..2 {
            let slot = pd.alloc_slot().unwrap();
            pd.install(slot, Thread::new(id, ThreadParams::new("t"), 0, 64));
        }
        assert_eq!(pd.alloc_slot(), Err(KernelError::SlotExhausted(PdId::new(3))));

        assert!(pd.take(0).is_some());
        assert_eq!(pd.alloc_slot(), Ok(0));
        assert_eq!(pd.thread_count(), 1);
    }

    #[test]
    fn test_selector_reuse() {
        let mut pd = pd(1);
        let target = ThreadRef::new(PdId::new(3), 0);
        let a = pd.insert_cap(CapEntry { target, badge: Badge::new(1) });
        let b = pd.insert_cap(CapEntry { target, badge: Badge::new(2) });
        assert_ne!(a, b);
        assert!(a.is_valid());

        assert!(pd.remove_cap(a));
        assert!(!pd.remove_cap(a));
        let c = pd.insert_cap(CapEntry { target, badge: Badge::new(3) });
        assert_eq!(c, a);
    }

    #[test]
    fn test_revoked_selector_not_reused() {
        let mut pd = pd(2);
        let gone = ThreadRef::new(PdId::new(3), 0);
        let other = ThreadRef::new(PdId::new(3), 1);
        let stale = pd.insert_cap(CapEntry { target: gone, badge: Badge::new(1) });
        let kept = pd.insert_cap(CapEntry { target: other, badge: Badge::new(2) });

        pd.revoke_target(gone);
        assert!(pd.cap(stale).is_none());
        assert!(pd.is_allocated(stale));
        assert_eq!(pd.cap_count(), 1);

        let fresh = pd.insert_cap(CapEntry { target: other, badge: Badge::new(3) });
        assert_ne!(fresh, stale);
        assert_ne!(fresh, kept);

        assert!(pd.remove_cap(stale));
        assert!(!pd.is_allocated(stale));
        assert_eq!(pd.cap(fresh).map(|e| e.badge), Some(Badge::new(3)));
        assert_eq!(pd.insert_cap(CapEntry { target: other, badge: Badge::new(4) }), stale);
    }
}
