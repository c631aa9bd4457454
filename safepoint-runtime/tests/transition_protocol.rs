//! Integration tests for the mutator/collector mode protocol.
//!
//! Single-threaded tests drive the transitions against a store with a
//! counting waiter; multi-threaded tests run real workers against
//! `suspend_all`.

use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use safepoint_runtime::{
    CollectionWaiter, ExecutionContext, FastReentry, ReentryPolicy, ReverseTransitionFrame,
    RuntimeConfig, StackBounds, SuspensionSignal, ThreadMode, ThreadStore, TransitionFrame,
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Ends every collection immediately and counts how often it was asked to.
#[derive(Default)]
struct CountingWaiter {
    calls: AtomicUsize,
}

impl CollectionWaiter for CountingWaiter {
    fn block_until_resumed(&self, signal: &SuspensionSignal) {
        self.calls.fetch_add(1, Ordering::SeqCst);
        signal.clear();
    }
}

fn counting_store(policy: ReentryPolicy) -> (Arc<ThreadStore>, Arc<CountingWaiter>) {
    let config = RuntimeConfig::builder()
        .reentry_policy(policy)
        .build()
        .unwrap();
    let waiter = Arc::new(CountingWaiter::default());
    (ThreadStore::with_waiter(config, waiter.clone()), waiter)
}

#[test]
fn trap_before_return_waits_exactly_once() {
    init_tracing();
    let (store, waiter) = counting_store(ReentryPolicy::default());
    let ctx = store.attach_current_thread().unwrap();

    let mut frame = TransitionFrame::new(0);
    let frame_ptr = NonNull::from(&mut frame);
    unsafe { ctx.enter_preemptive(frame_ptr) };
    assert_eq!(ctx.mode(), ThreadMode::Preemptive);

    store.signal().request();
    unsafe { ctx.return_from_preemptive(frame_ptr) };

    assert_eq!(waiter.calls.load(Ordering::SeqCst), 1);
    assert_eq!(ctx.mode(), ThreadMode::Cooperative);
}

#[test]
fn unattached_thread_reports_not_attached() {
    let (store, _) = counting_store(ReentryPolicy::default());
    let ctx = ExecutionContext::new(store, StackBounds::UNSET);
    let before = ctx.record().transition_frame();

    let mut reverse = ReverseTransitionFrame::new();
    assert_eq!(ctx.try_fast_reenter_cooperative(&mut reverse), FastReentry::NotAttached);
    assert_eq!(ctx.mode(), ThreadMode::Preemptive);
    assert_eq!(ctx.record().transition_frame(), before);
}

#[test]
fn exempt_thread_reenters_under_trap() {
    let (store, waiter) = counting_store(ReentryPolicy::default());
    let ctx = store.attach_current_thread().unwrap();
    ctx.set_do_not_trigger_gc(true);
    store.signal().request();

    let before = ctx.record().transition_frame();
    let mut reverse = ReverseTransitionFrame::new();
    assert_eq!(ctx.try_fast_reenter_cooperative(&mut reverse), FastReentry::Entered);
    assert_eq!(ctx.record().transition_frame(), before);

    // Nested forward frames are allowed while exempt.
    let mut a = TransitionFrame::new(0);
    let mut b = TransitionFrame::new(0);
    let a_ptr = NonNull::from(&mut a);
    let b_ptr = NonNull::from(&mut b);
    unsafe {
        ctx.enter_preemptive(a_ptr);
        ctx.enter_preemptive(b_ptr);
        assert_eq!(b.saved_frame(), a_ptr.as_ptr());
        ctx.return_from_preemptive(b_ptr);
        assert_eq!(ctx.mode(), ThreadMode::Preemptive);
        ctx.return_from_preemptive(a_ptr);
    }
    assert_eq!(ctx.mode(), ThreadMode::Cooperative);
    assert_eq!(waiter.calls.load(Ordering::SeqCst), 0);
    store.signal().clear();
}

#[test]
fn rolled_back_reentry_restores_frame() {
    let (store, _) = counting_store(ReentryPolicy::default());
    let ctx = store.attach_current_thread().unwrap();

    let mut outer = TransitionFrame::new(0);
    let outer_ptr = NonNull::from(&mut outer);
    unsafe { ctx.enter_preemptive(outer_ptr) };

    store.signal().request();
    let mut reverse = ReverseTransitionFrame::new();
    let result = ctx.try_fast_reenter_cooperative(&mut reverse);
    assert_eq!(result, FastReentry::TrapRequested);
    assert_eq!(ctx.record().transition_frame(), outer_ptr.as_ptr());

    store.signal().clear();
    unsafe { ctx.return_from_preemptive(outer_ptr) };
}

#[test]
fn retry_policy_parks_then_retries_fast_path() {
    let (store, waiter) = counting_store(ReentryPolicy::RetryFastPath { max_attempts: 3 });
    let ctx = store.attach_current_thread().unwrap();

    ctx.with_preemptive(|| {
        store.signal().request();
        let value = ctx.reverse_call(|| ctx.mode()).unwrap();
        assert_eq!(value, ThreadMode::Cooperative);
    });

    assert_eq!(waiter.calls.load(Ordering::SeqCst), 1);
    let stats = store.stats();
    // once in the caller's fast path, once in the slow path's first attempt
    assert_eq!(stats.reentry_rollbacks, 2);
    assert_eq!(stats.waits, 0);
}

#[test]
fn block_policy_uses_wait_for_collection() {
    let (store, waiter) = counting_store(ReentryPolicy::AlwaysBlock);
    let ctx = store.attach_current_thread().unwrap();

    ctx.with_preemptive(|| {
        store.signal().request();
        ctx.reverse_call(|| assert!(ctx.is_cooperative())).unwrap();
        assert_eq!(ctx.mode(), ThreadMode::Preemptive);
    });

    assert_eq!(waiter.calls.load(Ordering::SeqCst), 1);
    assert_eq!(store.stats().waits, 1);
}

#[test]
fn poll_safepoint_without_trap_is_free() {
    let (store, waiter) = counting_store(ReentryPolicy::default());
    let ctx = store.attach_current_thread().unwrap();
    for _ in 0..100 {
        ctx.poll_safepoint();
    }
    assert_eq!(waiter.calls.load(Ordering::SeqCst), 0);
    assert_eq!(store.stats(), Default::default());
}

/// Workers alternate between managed work (counted in `in_managed`),
/// native calls and reverse calls. While the world is stopped no worker may
/// be in managed code.
#[test]
fn suspend_all_stops_every_worker() {
    init_tracing();
    const WORKERS: usize = 4;
    const ROUNDS: usize = 50;

    let store = ThreadStore::new(RuntimeConfig::default());
    let in_managed = Arc::new(AtomicUsize::new(0));
    let stop = Arc::new(AtomicBool::new(false));
    let ready = Arc::new(Barrier::new(WORKERS + 1));

    let handles: Vec<_> = (0..WORKERS)
        .map(|_| {
            let store = Arc::clone(&store);
            let in_managed = Arc::clone(&in_managed);
            let stop = Arc::clone(&stop);
            let ready = Arc::clone(&ready);
            thread::spawn(move || {
                let ctx = store.attach_current_thread().unwrap();
                ready.wait();
                let mut iterations = 0u64;
                while !stop.load(Ordering::Relaxed) {
                    in_managed.fetch_add(1, Ordering::SeqCst);
                    std::hint::black_box(iterations);
                    in_managed.fetch_sub(1, Ordering::SeqCst);

                    ctx.with_preemptive(|| {
                        ctx.reverse_call(|| {
                            in_managed.fetch_add(1, Ordering::SeqCst);
                            iterations += 1;
                            in_managed.fetch_sub(1, Ordering::SeqCst);
                        })
                        .unwrap();
                    });

                    ctx.poll_safepoint();
                }
                iterations
            })
        })
        .collect();

    ready.wait();
    for _ in 0..ROUNDS {
        let guard = store.suspend_all_timeout(Duration::from_secs(10)).unwrap();
        assert_eq!(guard.threads().len(), WORKERS);
        for _ in 0..3 {
            assert_eq!(in_managed.load(Ordering::SeqCst), 0);
            for t in guard.threads() {
                assert_eq!(t.mode(), ThreadMode::Preemptive);
            }
            thread::yield_now();
        }
        drop(guard);
        thread::sleep(Duration::from_micros(200));
    }

    stop.store(true, Ordering::Relaxed);
    let total: u64 = handles.into_iter().map(|h| h.join().unwrap()).sum();
    assert!(total > 0);
    assert_eq!(store.stats().suspensions, ROUNDS as u64);
    assert_eq!(store.thread_count(), 0);
}

#[test]
fn threads_attaching_during_suspension_wait() {
    let store = ThreadStore::new(RuntimeConfig::default());
    let attached = Arc::new(AtomicBool::new(false));

    let guard = store.suspend_all().unwrap();
    let worker = {
        let store = Arc::clone(&store);
        let attached = Arc::clone(&attached);
        thread::spawn(move || {
            let ctx = store.attach_current_thread().unwrap();
            attached.store(true, Ordering::SeqCst);
            assert!(ctx.is_cooperative());
        })
    };

    thread::sleep(Duration::from_millis(50));
    assert!(!attached.load(Ordering::SeqCst));
    drop(guard);

    worker.join().unwrap();
    assert!(attached.load(Ordering::SeqCst));
}
