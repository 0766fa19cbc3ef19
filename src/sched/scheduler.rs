// Copyright 2025 The Rustux Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Claims/fills CPU scheduler
//!
//! One scheduler runs per CPU. Every thread on the CPU owns a *share*:
//!
//! - A share with quota holds a **claim**: up to `quota` ticks of CPU time
//!   per super period, handed out strictly by priority. Claims of equal
//!   priority rotate when one is exhausted.
//! - Every ready share is also a **fill**: leftover time is distributed
//!   round robin in slices of `fill_quantum` ticks, ignoring priority.
//! - With nothing ready, the CPU's idle thread is the head.
//!
//! At the end of each super period all claims are refilled.
//!
//! The scheduler only decides; the CPU calls [`Scheduler::update`] with the
//! ticks the previous head consumed and then dispatches [`Scheduler::head`]
//! for at most [`Scheduler::head_quota`] ticks.

use alloc::collections::{BTreeMap, VecDeque};

use super::state::{ThreadPriority, PRIORITY_LEVELS};
use super::thread::ThreadRef;

#[derive(Debug, Clone, Copy)]
struct Share {
    priority: ThreadPriority,
    quota: u64,
    claim: u64,
    fill: u64,
    ready: bool,
}

/// Per-CPU scheduler
#[derive(Debug)]
pub struct Scheduler {
    idle: ThreadRef,
    shares: BTreeMap<ThreadRef, Share>,
    /// Ready shares with quota, per priority
    claims: [VecDeque<ThreadRef>; PRIORITY_LEVELS],
    /// All ready shares
    fills: VecDeque<ThreadRef>,
    head: ThreadRef,
    head_claims: bool,
    head_quota: u64,
    head_yields: bool,
    super_period: u64,
    residual: u64,
    fill_quantum: u64,
    need_to_schedule: bool,
}

impl Scheduler {
    /// Create a scheduler whose fallback is `idle`
    pub fn new(idle: ThreadRef, super_period: u64, fill_quantum: u64) -> Self {
        Self {
            idle,
            shares: BTreeMap::new(),
            claims: Default::default(),
            fills: VecDeque::new(),
            head: idle,
            head_claims: false,
            head_quota: fill_quantum.min(super_period),
            head_yields: false,
            super_period,
            residual: super_period,
            fill_quantum,
            need_to_schedule: true,
        }
    }

    /// Register a share for `thread`; it starts out unready
    pub fn insert(&mut self, thread: ThreadRef, priority: ThreadPriority, quota: u64) {
        assert!(thread != self.idle, "scheduler: idle thread cannot hold a share");
        if self.shares.contains_key(&thread) {
            self.remove(thread);
        }
        self.shares.insert(
            thread,
            Share {
                priority,
                quota,
                claim: quota,
                fill: self.fill_quantum,
                ready: false,
            },
        );
    }

    /// Drop the share of `thread`
    pub fn remove(&mut self, thread: ThreadRef) {
        self.unready(thread);
        self.shares.remove(&thread);
    }

    /// Let `thread` compete for the CPU
    pub fn ready(&mut self, thread: ThreadRef) {
        let Some(share) = self.shares.get_mut(&thread) else {
            return;
        };
        if share.ready {
            return;
        }
        share.ready = true;

        if share.quota > 0 {
            let claims = &mut self.claims[share.priority.index()];
            if share.claim > 0 {
                claims.push_front(thread);
            } else {
                claims.push_back(thread);
            }
        }
        self.fills.push_back(thread);
        self.need_to_schedule = true;
    }

    /// Withdraw `thread` from competition
    pub fn unready(&mut self, thread: ThreadRef) {
        let Some(share) = self.shares.get_mut(&thread) else {
            return;
        };
        if !share.ready {
            return;
        }
        share.ready = false;

        let priority = share.priority.index();
        self.claims[priority].retain(|t| *t != thread);
        self.fills.retain(|t| *t != thread);
        if self.head == thread {
            self.need_to_schedule = true;
        }
    }

    /// Give up the rest of the current head's time
    pub fn yield_head(&mut self) {
        self.head_yields = true;
        self.need_to_schedule = true;
    }

    /// Account `consumed` ticks to the current head and choose the next one
    pub fn update(&mut self, consumed: u64) {
        self.account(consumed);
        self.advance_period(consumed);
        self.choose_head();
        self.head_yields = false;
        self.need_to_schedule = false;
    }

    fn account(&mut self, consumed: u64) {
        if self.head == self.idle {
            return;
        }
        let head = self.head;
        let fill_quantum = self.fill_quantum;
        let Some(share) = self.shares.get_mut(&head) else {
            return;
        };

        let mut rotate_claim = false;
        let mut rotate_fill = false;
        if self.head_claims {
            share.claim = share.claim.saturating_sub(consumed);
            if self.head_yields {
                share.claim = 0;
                share.fill = fill_quantum;
                rotate_fill = true;
            }
            rotate_claim = share.claim == 0;
        } else {
            share.fill = share.fill.saturating_sub(consumed);
            if self.head_yields || share.fill == 0 {
                share.fill = fill_quantum;
                rotate_fill = true;
            }
        }

        if !share.ready {
            return;
        }
        if rotate_claim {
            let claims = &mut self.claims[share.priority.index()];
            claims.retain(|t| *t != head);
            claims.push_back(head);
        }
        if rotate_fill {
            self.fills.retain(|t| *t != head);
            self.fills.push_back(head);
        }
    }

    fn advance_period(&mut self, consumed: u64) {
        if consumed < self.residual {
            self.residual -= consumed;
            return;
        }
        self.residual = self.super_period;
        for share in self.shares.values_mut() {
            share.claim = share.quota;
        }
    }

    fn choose_head(&mut self) {
        for priority in ThreadPriority::DESCENDING {
            let shares = &self.shares;
            let claimant = self.claims[priority.index()]
                .iter()
                .copied()
                .find(|t| shares.get(t).is_some_and(|s| s.claim > 0));
            if let Some(thread) = claimant {
                let claim = shares.get(&thread).map_or(0, |s| s.claim);
                self.set_head(thread, true, claim);
                return;
            }
        }

        match self.fills.front().copied() {
            Some(thread) => {
                let fill = self.shares.get(&thread).map_or(self.fill_quantum, |s| s.fill);
                self.set_head(thread, false, fill);
            }
            None => self.set_head(self.idle, false, self.fill_quantum),
        }
    }

    fn set_head(&mut self, thread: ThreadRef, claims: bool, budget: u64) {
        self.head = thread;
        self.head_claims = claims;
        self.head_quota = budget.min(self.residual);
    }

    /// Thread that should run now
    pub fn head(&self) -> ThreadRef {
        self.head
    }

    /// Ticks the head may run before the scheduler must be consulted again
    pub fn head_quota(&self) -> u64 {
        self.head_quota
    }

    /// Check if the head runs on its claim rather than as a fill
    pub fn head_claims(&self) -> bool {
        self.head_claims
    }

    /// Check if readiness changed since the last update
    pub fn need_to_schedule(&self) -> bool {
        self.need_to_schedule
    }

    /// The idle thread of this scheduler
    pub fn idle(&self) -> ThreadRef {
        self.idle
    }

    /// Check if `thread` holds a share
    pub fn contains(&self, thread: ThreadRef) -> bool {
        self.shares.contains_key(&thread)
    }

    /// Check if `thread` currently competes for the CPU
    pub fn is_ready(&self, thread: ThreadRef) -> bool {
        self.shares.get(&thread).is_some_and(|s| s.ready)
    }

    /// Change the quota of `thread`; takes effect with the next refill
    pub fn set_quota(&mut self, thread: ThreadRef, quota: u64) {
        if let Some(share) = self.shares.get_mut(&thread) {
            share.quota = quota;
            share.claim = share.claim.min(quota);
        }
    }

    /// Ticks left in the current super period
    pub fn residual(&self) -> u64 {
        self.residual
    }
}

// ============================================================================
// Tests
// ============================================================================
