// Copyright 2025 The Rustux Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! RPC Integration Tests
//!
//! Entrypoints and clients run on host threads, each bound to a kernel
//! thread of a shared kernel through a [`HostedPort`].

use std::boxed::Box;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::vec::Vec;

use crate::config::KernelConfig;
use crate::kernel::{PdId, ReplyCap};
use crate::object::{Capability, ReleasePolicy};
use crate::rpc::{
    Dispatch, ExceptionCode, HostedPort, IpcError, IpcPort, MsgBuf, Opcode, RpcEntrypoint, RpcObject,
    SharedKernel,
};
use crate::sched::{ThreadParams, ThreadState};
use crate::testing::{boot, MockTranslationTable};

const OP_ADD: Opcode = 1;
const OP_WAIT: Opcode = 2;
const OP_RELEASE: Opcode = 3;
const OP_FORWARD: Opcode = 4;
const OP_FLOOD: Opcode = 5;
const OP_RETIRE: Opcode = 6;

/// Adds its argument to a running total
#[derive(Default)]
struct Counter {
    total: AtomicU64,
    dispatches: AtomicU64,
}

impl RpcObject for Counter {
    fn dispatch(
        &self,
        _ctx: &mut Dispatch<'_>,
        opcode: Opcode,
        input: &MsgBuf,
        output: &mut MsgBuf,
    ) -> Result<ExceptionCode, IpcError> {
        self.dispatches.fetch_add(1, Ordering::SeqCst);
        match opcode {
            OP_ADD => {
                let value = input.reader().get_u64()?;
                let total = self.total.fetch_add(value, Ordering::SeqCst) + value;
                output.put_u64(total);
                Ok(ExceptionCode::SUCCESS)
            }
            _ => Ok(ExceptionCode::INVALID_OPCODE),
        }
    }
}

/// Parks callers until someone releases them
#[derive(Default)]
struct Barrier {
    waiters: spin::Mutex<Vec<ReplyCap>>,
}

impl RpcObject for Barrier {
    fn dispatch(
        &self,
        ctx: &mut Dispatch<'_>,
        opcode: Opcode,
        _input: &MsgBuf,
        output: &mut MsgBuf,
    ) -> Result<ExceptionCode, IpcError> {
        match opcode {
            OP_WAIT => {
                ctx.omit_reply();
                self.waiters.lock().push(ctx.reply_dst());
                Ok(ExceptionCode::SUCCESS)
            }
            OP_RELEASE => {
                let waiters = core::mem::take(&mut *self.waiters.lock());
                let mut released = 0;
                for dst in waiters {
                    if ctx.reply(dst, ExceptionCode::SUCCESS, &MsgBuf::new())? {
                        released += 1;
                    }
                }
                output.put_u64(released);
                Ok(ExceptionCode::SUCCESS)
            }
            _ => Ok(ExceptionCode::INVALID_OPCODE),
        }
    }
}

/// Forwards every request to a backend and blocks on it
struct Forwarder {
    backend: Capability,
    dispatches: AtomicU64,
}

impl RpcObject for Forwarder {
    fn dispatch(
        &self,
        ctx: &mut Dispatch<'_>,
        opcode: Opcode,
        _input: &MsgBuf,
        output: &mut MsgBuf,
    ) -> Result<ExceptionCode, IpcError> {
        self.dispatches.fetch_add(1, Ordering::SeqCst);
        if opcode != OP_FORWARD {
            return Ok(ExceptionCode::INVALID_OPCODE);
        }
        let reply = ctx.call(&self.backend, &MsgBuf::request(OP_ADD))?;
        output.put_u64(reply.exception().0 as u64);
        Ok(ExceptionCode::SUCCESS)
    }
}

/// Answers with more data than any UTCB holds, or retires itself
#[derive(Default)]
struct Oversized {
    dispatches: AtomicU64,
}

impl RpcObject for Oversized {
    fn dispatch(
        &self,
        ctx: &mut Dispatch<'_>,
        opcode: Opcode,
        _input: &MsgBuf,
        output: &mut MsgBuf,
    ) -> Result<ExceptionCode, IpcError> {
        self.dispatches.fetch_add(1, Ordering::SeqCst);
        match opcode {
            OP_FLOOD => {
                output.put_bytes(&vec![0xab; 8192]);
                Ok(ExceptionCode::SUCCESS)
            }
            OP_RETIRE => {
                ctx.dissolve();
                output.put_u64(1);
                Ok(ExceptionCode::SUCCESS)
            }
            _ => Ok(ExceptionCode::INVALID_OPCODE),
        }
    }
}

struct Setup {
    kernel: SharedKernel,
    pd: PdId,
}

impl Setup {
    fn new() -> Self {
        let (mut kernel, _board) = boot(KernelConfig::default());
        let pd = kernel
            .new_pd("server", Box::new(MockTranslationTable::new()))
            .unwrap();
        Self {
            kernel: Arc::new(spin::Mutex::new(kernel)),
            pd,
        }
    }

    fn port(&self, label: &str) -> HostedPort {
        HostedPort::spawn(&self.kernel, self.pd, ThreadParams::new(label), 0).unwrap()
    }

    fn entrypoint(&self, start: bool) -> (Arc<RpcEntrypoint<HostedPort>>, JoinHandle<()>) {
        let ep = Arc::new(RpcEntrypoint::new("ep", self.port("ep"), start));
        let server = ep.clone();
        let handle = thread::spawn(move || server.serve());
        (ep, handle)
    }
}

fn add(client: &HostedPort, cap: &Capability, value: u64) -> Result<MsgBuf, IpcError> {
    let mut msg = MsgBuf::request(OP_ADD);
    msg.put_u64(value);
    client.call(cap, &msg)
}

fn stop(ep: Arc<RpcEntrypoint<HostedPort>>, handle: JoinHandle<()>) {
    ep.request_exit();
    handle.join().unwrap();
    assert!(ep.has_exited());
}

fn wait_until(mut condition: impl FnMut() -> bool) {
    while !condition() {
        thread::yield_now();
    }
}

/// A call reaches the managed object and returns its result
#[test]
fn test_call_roundtrip() {
    let setup = Setup::new();
    let (ep, handle) = setup.entrypoint(true);
    let counter = Arc::new(Counter::default());
    let cap = ep.manage(counter.clone()).unwrap();
    let client = setup.port("client");

    let reply = add(&client, &cap, 5).unwrap();
    assert_eq!(reply.exception(), ExceptionCode::SUCCESS);
    assert_eq!(reply.reader().get_u64(), Ok(5));

    let reply = add(&client, &cap, 3).unwrap();
    assert_eq!(reply.reader().get_u64(), Ok(8));

    let reply = client.call(&cap, &MsgBuf::request(99)).unwrap();
    assert_eq!(reply.exception(), ExceptionCode::INVALID_OPCODE);

    stop(ep, handle);
}

/// A malformed request fails with the fail-safe default code
#[test]
fn test_dispatch_error_yields_invalid_object() {
    let setup = Setup::new();
    let (ep, handle) = setup.entrypoint(true);
    let counter = Arc::new(Counter::default());
    let cap = ep.manage(counter.clone()).unwrap();
    let client = setup.port("client");

    // OP_ADD without an argument
    let reply = client.call(&cap, &MsgBuf::request(OP_ADD)).unwrap();
    assert_eq!(reply.exception(), ExceptionCode::INVALID_OBJECT);
    assert!(reply.payload().is_empty());
    assert_eq!(counter.dispatches.load(Ordering::SeqCst), 1);

    stop(ep, handle);
}

/// A request naming another object than the one it was sent through is dropped
#[test]
fn test_forged_badge_rejected() {
    let setup = Setup::new();
    let (ep, handle) = setup.entrypoint(true);
    let target = Arc::new(Counter::default());
    let decoy = Arc::new(Counter::default());
    let target_cap = ep.manage(target.clone()).unwrap();
    let decoy_cap = ep.manage(decoy.clone()).unwrap();
    let client = setup.port("client");

    let mut forged = MsgBuf::request(OP_ADD);
    forged.set_local_name(target_cap.badge());
    forged.put_u64(1);
    let reply = client.call(&decoy_cap, &forged).unwrap();

    assert_eq!(reply.exception(), ExceptionCode::INVALID_OBJECT);
    assert_eq!(target.dispatches.load(Ordering::SeqCst), 0);
    assert_eq!(decoy.dispatches.load(Ordering::SeqCst), 0);

    stop(ep, handle);
}

/// A request too short to carry a header is rejected and the entrypoint keeps serving
#[test]
fn test_truncated_request_rejected() {
    let setup = Setup::new();
    let (ep, handle) = setup.entrypoint(true);
    let counter = Arc::new(Counter::default());
    let cap = ep.manage(counter.clone()).unwrap();

    let raw = setup.port("raw");
    {
        let mut k = setup.kernel.lock();
        k.write_utcb(raw.thread(), &[1, 2, 3]).unwrap();
        k.send_request(raw.thread(), cap.selector()).unwrap();
    }
    wait_until(|| setup.kernel.lock().thread_state(raw.thread()) == Ok(ThreadState::Runnable));
    let reply = MsgBuf::decode(setup.kernel.lock().utcb(raw.thread()).unwrap().data()).unwrap();
    assert_eq!(reply.exception(), ExceptionCode::INVALID_OBJECT);
    assert!(reply.payload().is_empty());
    assert_eq!(counter.dispatches.load(Ordering::SeqCst), 0);

    let client = setup.port("client");
    assert_eq!(add(&client, &cap, 7).unwrap().reader().get_u64(), Ok(7));
    assert!(!ep.has_exited());

    stop(ep, handle);
}

/// A reply that does not fit the UTCB turns into the fail-safe default code
#[test]
fn test_oversized_reply_replaced() {
    let setup = Setup::new();
    let (ep, handle) = setup.entrypoint(true);
    let object = Arc::new(Oversized::default());
    let cap = ep.manage(object.clone()).unwrap();
    let client = setup.port("client");

    let reply = client.call(&cap, &MsgBuf::request(OP_FLOOD)).unwrap();
    assert_eq!(reply.exception(), ExceptionCode::INVALID_OBJECT);
    assert!(reply.payload().is_empty());

    let reply = client.call(&cap, &MsgBuf::request(99)).unwrap();
    assert_eq!(reply.exception(), ExceptionCode::INVALID_OPCODE);
    assert_eq!(object.dispatches.load(Ordering::SeqCst), 2);
    assert!(!ep.has_exited());

    stop(ep, handle);
}

/// Calling an invalid capability fails without entering the kernel
#[test]
fn test_call_invalid_capability() {
    let setup = Setup::new();
    let client = setup.port("client");
    assert_eq!(
        client.call(&Capability::invalid(), &MsgBuf::request(OP_ADD)),
        Err(IpcError::InvalidCapability)
    );
}

/// After dissolve, requests to the object fail and its selector is released
#[test]
fn test_dissolve_idle_object() {
    let setup = Setup::new();
    let (ep, handle) = setup.entrypoint(true);
    let counter = Arc::new(Counter::default());
    let cap = ep.manage(counter.clone()).unwrap();
    let client = setup.port("client");
    add(&client, &cap, 1).unwrap();

    assert_eq!(cap.ref_count(), 2);
    assert!(ep.dissolve(&cap));
    assert!(!ep.manages(cap.badge()));
    assert_eq!(cap.ref_count(), 1);
    assert!(!ep.dissolve(&cap));

    let reply = add(&client, &cap, 1).unwrap();
    assert_eq!(reply.exception(), ExceptionCode::INVALID_OBJECT);
    assert_eq!(counter.dispatches.load(Ordering::SeqCst), 1);

    let selector = cap.selector();
    drop(cap);
    assert!(setup.kernel.lock().pd(setup.pd).unwrap().cap(selector).is_none());

    stop(ep, handle);
}

/// Dissolving an object blocked in a nested call cancels the call
#[test]
fn test_dissolve_cancels_blocked_dispatch() {
    let setup = Setup::new();
    let (ep, handle) = setup.entrypoint(true);

    // Never serves, so every request to it blocks
    let backend = setup.port("backend");
    let forwarder = Arc::new(Forwarder {
        backend: backend.alloc_rpc_cap().unwrap(),
        dispatches: AtomicU64::new(0),
    });
    let cap = ep.manage(forwarder.clone()).unwrap();

    let client = setup.port("client");
    let client_cap = cap.clone();
    let caller = thread::spawn(move || client.call(&client_cap, &MsgBuf::request(OP_FORWARD)));

    wait_until(|| ep.current() == cap.badge());
    assert!(ep.dissolve(&cap));
    assert_ne!(ep.current(), cap.badge());

    let reply = caller.join().unwrap().unwrap();
    assert_eq!(reply.exception(), ExceptionCode::INVALID_OBJECT);
    assert_eq!(forwarder.dispatches.load(Ordering::SeqCst), 1);

    // The entrypoint survived the cancellation
    let counter = Arc::new(Counter::default());
    let counter_cap = ep.manage(counter).unwrap();
    let client = setup.port("late client");
    assert_eq!(add(&client, &counter_cap, 2).unwrap().reader().get_u64(), Ok(2));

    let reply = client.call(&cap, &MsgBuf::request(OP_FORWARD)).unwrap();
    assert_eq!(reply.exception(), ExceptionCode::INVALID_OBJECT);
    assert_eq!(forwarder.dispatches.load(Ordering::SeqCst), 1);

    stop(ep, handle);
}

/// An object can dissolve itself from within its own dispatch
#[test]
fn test_dissolve_from_own_dispatch() {
    let setup = Setup::new();
    let (ep, handle) = setup.entrypoint(true);
    let object = Arc::new(Oversized::default());
    let cap = ep.manage(object.clone()).unwrap();
    let client = setup.port("client");

    let reply = client.call(&cap, &MsgBuf::request(OP_RETIRE)).unwrap();
    assert_eq!(reply.exception(), ExceptionCode::SUCCESS);
    assert_eq!(reply.reader().get_u64(), Ok(1));
    assert!(!ep.manages(cap.badge()));
    assert_eq!(cap.ref_count(), 1);

    let reply = client.call(&cap, &MsgBuf::request(OP_RETIRE)).unwrap();
    assert_eq!(reply.exception(), ExceptionCode::INVALID_OBJECT);
    assert_eq!(object.dispatches.load(Ordering::SeqCst), 1);
    assert!(!ep.dissolve(&cap));

    stop(ep, handle);
}

/// Canceling the wait of an idle entrypoint does not stop it
#[test]
fn test_cancel_idle_entrypoint() {
    let setup = Setup::new();
    let (ep, handle) = setup.entrypoint(true);
    let cap = ep.manage(Arc::new(Counter::default())).unwrap();
    let server = ep.port().thread();

    wait_until(|| {
        let k = setup.kernel.lock();
        k.thread(server).is_ok_and(|t| t.ipc().awaiting_request())
    });
    assert_eq!(ep.port().cancel_blocking(), Ok(true));

    let client = setup.port("client");
    assert_eq!(add(&client, &cap, 3).unwrap().reader().get_u64(), Ok(3));
    assert!(!ep.has_exited());

    stop(ep, handle);
}

/// Deferred requests are answered later from another dispatch
#[test]
fn test_deferred_reply() {
    let setup = Setup::new();
    let (ep, handle) = setup.entrypoint(true);
    let barrier = Arc::new(Barrier::default());
    let cap = ep.manage(barrier.clone()).unwrap();

    let waiter = setup.port("waiter");
    let waiter_cap = cap.clone();
    let parked = thread::spawn(move || waiter.call(&waiter_cap, &MsgBuf::request(OP_WAIT)));
    wait_until(|| barrier.waiters.lock().len() == 1);

    let releaser = setup.port("releaser");
    let reply = releaser.call(&cap, &MsgBuf::request(OP_RELEASE)).unwrap();
    assert_eq!(reply.exception(), ExceptionCode::SUCCESS);
    assert_eq!(reply.reader().get_u64(), Ok(1));

    let woken = parked.join().unwrap().unwrap();
    assert_eq!(woken.exception(), ExceptionCode::SUCCESS);

    stop(ep, handle);
}

/// An entrypoint constructed inactive serves only after activation
#[test]
fn test_deferred_activation() {
    let setup = Setup::new();
    let (ep, handle) = setup.entrypoint(false);
    let cap = ep.manage(Arc::new(Counter::default())).unwrap();
    assert!(!ep.is_active());

    let client = setup.port("client");
    let call_cap = cap.clone();
    let call = thread::spawn(move || add(&client, &call_cap, 4));

    ep.activate();
    let reply = call.join().unwrap().unwrap();
    assert_eq!(reply.reader().get_u64(), Ok(4));

    stop(ep, handle);
}

/// Capabilities delegated to another domain dispatch to the same object
#[test]
fn test_delegated_capability() {
    let setup = Setup::new();
    let (ep, handle) = setup.entrypoint(true);
    let cap = ep.manage(Arc::new(Counter::default())).unwrap();

    let other_pd = setup
        .kernel
        .lock()
        .new_pd("client", Box::new(MockTranslationTable::new()))
        .unwrap();
    let client = HostedPort::spawn(&setup.kernel, other_pd, ThreadParams::new("client"), 0).unwrap();
    let delegated = ep.port().delegate(&cap, &client).unwrap();
    assert_eq!(delegated, cap);

    assert_eq!(add(&client, &delegated, 6).unwrap().reader().get_u64(), Ok(6));

    let selector = delegated.selector();
    drop(delegated);
    assert!(setup.kernel.lock().pd(other_pd).unwrap().cap(selector).is_none());

    stop(ep, handle);
}

/// Retained selectors survive their last capability
#[test]
fn test_release_policy() {
    let setup = Setup::new();
    let retaining = setup.port("retaining").with_policy(ReleasePolicy::Retain);
    let releasing = setup.port("releasing");

    let kept = retaining.alloc_rpc_cap().unwrap();
    let freed = releasing.alloc_rpc_cap().unwrap();
    let (kept_sel, freed_sel) = (kept.selector(), freed.selector());
    drop(kept);
    drop(freed);

    let kernel = setup.kernel.lock();
    let pd = kernel.pd(setup.pd).unwrap();
    assert!(pd.cap(kept_sel).is_some());
    assert!(pd.cap(freed_sel).is_none());
}

/// Releasing a capability revoked with its server leaves newer capabilities intact
#[test]
fn test_stale_capability_release() {
    let setup = Setup::new();
    let gone = setup.port("gone");
    let live = setup.port("live");

    let stale = gone.alloc_rpc_cap().unwrap();
    setup.kernel.lock().delete_thread(gone.thread()).unwrap();
    let fresh = live.alloc_rpc_cap().unwrap();
    assert_ne!(fresh.selector(), stale.selector());

    let stale_sel = stale.selector();
    drop(stale);
    let kernel = setup.kernel.lock();
    let pd = kernel.pd(setup.pd).unwrap();
    assert!(!pd.is_allocated(stale_sel));
    assert_eq!(pd.cap(fresh.selector()).map(|e| e.badge), Some(fresh.badge()));
    drop(kernel);
}

/// Objects still managed at shutdown are dissolved in one go
#[test]
fn test_dissolve_all() {
    let setup = Setup::new();
    let (ep, handle) = setup.entrypoint(true);
    let caps: Vec<Capability> = (0..3)
        .map(|_| ep.manage(Arc::new(Counter::default())).unwrap())
        .collect();

    stop(ep.clone(), handle);
    assert_eq!(ep.dissolve_all(), 3);
    assert!(caps.iter().all(|cap| !ep.manages(cap.badge())));
    assert!(caps.iter().all(|cap| cap.ref_count() == 1));
}
