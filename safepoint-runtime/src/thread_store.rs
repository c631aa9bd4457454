//! # Thread Store
//!
//! Registry of attached threads plus the collector side of the mode protocol.
//!
//! ## Design
//!
//! The store owns the process-wide [`SuspensionSignal`] (the "trap" flag).
//! Stopping the world is:
//!
//! 1. set the signal
//! 2. full fence
//! 3. wait until no registered thread is Cooperative
//!
//! Threads that try to become Cooperative while the signal is set park in
//! [`ThreadStore::wait_for_collection`] (or roll back and park, on the reverse
//! fast path) until the collector releases them. Dropping the
//! [`SuspendGuard`] returned by [`ThreadStore::suspend_all`] clears the signal
//! and wakes every parked thread.

use std::fmt;
use std::ptr;
use std::sync::atomic::{fence, AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, MutexGuard, RwLock};
use thiserror::Error;

use crate::alloc_context::GcAllocContext;
use crate::config::RuntimeConfig;
use crate::frame::{ReverseTransitionFrame, TransitionFrame};
use crate::thread::{ExecutionContext, StackBounds, ThreadRecord};

/// Error attaching a thread to a store.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AttachError {
    /// The store no longer accepts threads.
    #[error("thread store is shutting down")]
    ShuttingDown,
    /// The thread was detached earlier and cannot come back.
    #[error("thread {0} was already detached")]
    Detached(u64),
}

/// Error stopping the world.
#[derive(Debug, Clone, Error)]
pub enum SuspendError {
    /// Some threads stayed Cooperative for longer than the timeout.
    #[error("timed out after {waited:?} waiting for {pending} thread(s) to leave cooperative mode")]
    Timeout {
        /// Threads still Cooperative when the wait gave up.
        pending: usize,
        /// Time spent waiting.
        waited: Duration,
    },
}

/// The process-wide "collection pending" flag.
///
/// Mutators read it with relaxed ordering after a full fence; the collector
/// sets it before its own full fence.
#[derive(Debug, Default)]
pub struct SuspensionSignal {
    trap_requested: AtomicBool,
}

impl SuspensionSignal {
    /// Returns `true` while a collection is pending.
    #[inline]
    pub fn is_trap_requested(&self) -> bool {
        self.trap_requested.load(Ordering::Relaxed)
    }

    /// Ask threads to stop at their next transition.
    pub fn request(&self) {
        self.trap_requested.store(true, Ordering::Relaxed);
    }

    /// End the pending collection.
    pub fn clear(&self) {
        self.trap_requested.store(false, Ordering::Release);
    }
}

/// How a thread parks while a collection is pending.
///
/// The default implementation waits on a condition variable until the signal
/// clears. Embedders can plug in their own (for example to run work while
/// parked). Implementations return once the collection has ended; returning
/// early is allowed, the caller re-checks the signal.
///
/// The collector calls [`on_resumed`](Self::on_resumed) after clearing the
/// signal, both when a stopped world resumes and when a stop times out.
pub trait CollectionWaiter: Send + Sync {
    /// Park the calling thread until `signal` is no longer set.
    fn block_until_resumed(&self, signal: &SuspensionSignal);

    /// The pending collection ended and `signal` is clear. Wake whatever is
    /// parked in [`block_until_resumed`](Self::block_until_resumed).
    ///
    /// The default does nothing, for waiters that never block.
    fn on_resumed(&self, _signal: &SuspensionSignal) {}
}

/// Default waiter: a mutex/condvar pair released by the collector.
#[derive(Default)]
struct GcGate {
    lock: Mutex<()>,
    resumed: Condvar,
}

impl GcGate {
    fn release(&self, signal: &SuspensionSignal) {
        let _guard = self.lock.lock();
        signal.clear();
        self.resumed.notify_all();
    }
}

impl CollectionWaiter for GcGate {
    fn block_until_resumed(&self, signal: &SuspensionSignal) {
        let mut guard = self.lock.lock();
        while signal.is_trap_requested() {
            self.resumed.wait(&mut guard);
        }
    }
}

/// Counters for suspension activity.
#[derive(Debug, Default)]
struct SuspensionCounters {
    suspensions: AtomicU64,
    waits: AtomicU64,
    reentry_rollbacks: AtomicU64,
    timeouts: AtomicU64,
}

/// Point-in-time copy of the store's suspension counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SuspensionStats {
    /// Completed world stops.
    pub suspensions: u64,
    /// Calls into the wait-for-collection helper.
    pub waits: u64,
    /// Reverse fast paths rolled back because a collection was pending.
    pub reentry_rollbacks: u64,
    /// World stops that gave up waiting.
    pub timeouts: u64,
}

/// Registry of threads and owner of the suspension signal.
pub struct ThreadStore {
    signal: SuspensionSignal,
    gate: GcGate,
    waiter: Option<Arc<dyn CollectionWaiter>>,
    threads: Mutex<Vec<Arc<ThreadRecord>>>,
    hijack_stubs: RwLock<Vec<usize>>,
    retired_ranges: Mutex<Vec<GcAllocContext>>,
    suspension_lock: Mutex<()>,
    shutting_down: AtomicBool,
    config: RuntimeConfig,
    counters: SuspensionCounters,
}

impl ThreadStore {
    /// Create a store with the default waiter.
    pub fn new(config: RuntimeConfig) -> Arc<Self> {
        Arc::new(Self::build(config, None))
    }

    /// Create a store whose threads park through `waiter`.
    pub fn with_waiter(config: RuntimeConfig, waiter: Arc<dyn CollectionWaiter>) -> Arc<Self> {
        Arc::new(Self::build(config, Some(waiter)))
    }

    fn build(config: RuntimeConfig, waiter: Option<Arc<dyn CollectionWaiter>>) -> Self {
        Self {
            signal: SuspensionSignal::default(),
            gate: GcGate::default(),
            waiter,
            threads: Mutex::new(Vec::new()),
            hijack_stubs: RwLock::new(Vec::new()),
            retired_ranges: Mutex::new(Vec::new()),
            suspension_lock: Mutex::new(()),
            shutting_down: AtomicBool::new(false),
            config,
            counters: SuspensionCounters::default(),
        }
    }

    /// The store's configuration.
    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// The suspension signal.
    pub fn signal(&self) -> &SuspensionSignal {
        &self.signal
    }

    // ------------------------------------------------------------------------
    // Thread registry
    // ------------------------------------------------------------------------

    /// Attach the calling thread and put it in Cooperative mode.
    pub fn attach_current_thread(self: &Arc<Self>) -> Result<ExecutionContext, AttachError> {
        let stack = StackBounds::current().unwrap_or_else(|| {
            tracing::debug!("stack bounds unavailable on this platform");
            StackBounds::UNSET
        });
        self.attach_current_thread_with_stack(stack)
    }

    /// Attach the calling thread with explicitly supplied stack bounds.
    pub fn attach_current_thread_with_stack(
        self: &Arc<Self>,
        stack: StackBounds,
    ) -> Result<ExecutionContext, AttachError> {
        let ctx = ExecutionContext::new(Arc::clone(self), stack);
        ctx.attach()?;

        // Enter managed code for the first time. The saved frame is the
        // top-of-stack marker, restored when the context is dropped.
        let mut frame = ReverseTransitionFrame::new();
        if !ctx.try_fast_reenter_cooperative(&mut frame).is_entered() {
            ctx.reenter_cooperative(&mut frame).map_err(|e| match e {
                crate::thread::ReentryError::Attach(err) => err,
            })?;
        }
        Ok(ctx)
    }

    pub(crate) fn register(&self, record: Arc<ThreadRecord>) -> Result<(), AttachError> {
        if self.is_shutting_down() {
            return Err(AttachError::ShuttingDown);
        }
        let mut threads = self.threads.lock();
        tracing::trace!(thread = record.id(), count = threads.len() + 1, "registering thread");
        threads.push(record);
        Ok(())
    }

    pub(crate) fn unregister(&self, record: &ThreadRecord) {
        let mut threads = self.threads.lock();
        threads.retain(|t| !ptr::eq(Arc::as_ptr(t), record));
    }

    /// Number of attached threads.
    pub fn thread_count(&self) -> usize {
        self.threads.lock().len()
    }

    /// Snapshot of the attached threads.
    pub fn threads(&self) -> Vec<Arc<ThreadRecord>> {
        self.threads.lock().clone()
    }

    /// Stop accepting new threads.
    pub fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::Release);
        tracing::debug!("thread store shutting down");
    }

    /// Returns `true` once [`shutdown`](Self::shutdown) was called.
    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    // ------------------------------------------------------------------------
    // Hijack stubs
    // ------------------------------------------------------------------------

    /// Register the address of a return-address hijack stub.
    pub fn register_hijack_stub(&self, address: usize) {
        let mut stubs = self.hijack_stubs.write();
        if !stubs.contains(&address) {
            stubs.push(address);
        }
    }

    /// Returns `true` if `address` is a registered hijack stub.
    pub fn is_hijack_target(&self, address: usize) -> bool {
        address != 0 && self.hijack_stubs.read().contains(&address)
    }

    // ------------------------------------------------------------------------
    // Retired allocation ranges
    // ------------------------------------------------------------------------

    /// Take back the unused tail of a departing thread's allocation range.
    pub(crate) fn return_alloc_range(&self, thread: u64, range: GcAllocContext) {
        if range.alloc_ptr >= range.alloc_limit {
            return;
        }
        tracing::trace!(
            thread,
            bytes = range.alloc_limit - range.alloc_ptr,
            "allocation range returned"
        );
        self.retired_ranges.lock().push(range);
    }

    /// Drain the allocation ranges handed back by detached threads.
    ///
    /// Each entry is the `[alloc_ptr, alloc_limit)` tail its thread never
    /// used; the collector may fill it or grant it to another thread.
    pub fn take_retired_ranges(&self) -> Vec<GcAllocContext> {
        std::mem::take(&mut *self.retired_ranges.lock())
    }

    // ------------------------------------------------------------------------
    // Mutator side
    // ------------------------------------------------------------------------

    /// Park a thread until the pending collection ends, leaving it
    /// Cooperative.
    ///
    /// `frame` is published while the thread is parked so the collector can
    /// scan it. Threads exempt from suspension return immediately.
    pub(crate) fn wait_for_collection(&self, thread: &ThreadRecord, frame: *mut TransitionFrame) {
        if thread.is_do_not_trigger_gc() {
            return;
        }

        self.counters.waits.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(thread = thread.id(), "waiting for collection");

        // preemptive while parked
        thread.publish_frame(frame, Ordering::Release);
        loop {
            self.block_until_resumed();
            if self.signal.is_trap_requested() {
                continue;
            }

            thread.publish_frame(ptr::null_mut(), Ordering::Relaxed);
            fence(Ordering::SeqCst);
            if !self.signal.is_trap_requested() {
                break;
            }
            thread.publish_frame(frame, Ordering::Release);
        }

        tracing::trace!(thread = thread.id(), "resumed after collection");
    }

    pub(crate) fn block_until_resumed(&self) {
        match &self.waiter {
            Some(waiter) => waiter.block_until_resumed(&self.signal),
            None => self.gate.block_until_resumed(&self.signal),
        }
    }

    /// Clear the signal and wake parked threads, whichever waiter they use.
    fn end_collection(&self) {
        self.gate.release(&self.signal);
        if let Some(waiter) = &self.waiter {
            waiter.on_resumed(&self.signal);
        }
    }

    pub(crate) fn record_rollback(&self) {
        self.counters
            .reentry_rollbacks
            .fetch_add(1, Ordering::Relaxed);
    }

    // ------------------------------------------------------------------------
    // Collector side
    // ------------------------------------------------------------------------

    /// Stop the world using the configured timeout.
    pub fn suspend_all(&self) -> Result<SuspendGuard<'_>, SuspendError> {
        self.suspend_all_timeout(self.config.suspension.suspend_timeout)
    }

    /// Stop the world: wait until no attached thread (other than the caller)
    /// is Cooperative.
    ///
    /// The world stays stopped until the returned guard is dropped. On
    /// timeout the signal is cleared again and parked threads are released.
    pub fn suspend_all_timeout(&self, timeout: Duration) -> Result<SuspendGuard<'_>, SuspendError> {
        let exclusive = self.suspension_lock.lock();
        let started = Instant::now();
        let me = std::thread::current().id();

        self.signal.request();
        fence(Ordering::SeqCst);

        let threads = self.threads();
        tracing::debug!(threads = threads.len(), "suspending threads");

        let mut spins = 0u32;
        loop {
            let pending = threads
                .iter()
                .filter(|t| t.os_thread() != me && t.blocks_suspension())
                .count();
            if pending == 0 {
                break;
            }

            let waited = started.elapsed();
            if waited >= timeout {
                self.end_collection();
                self.counters.timeouts.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(pending, ?waited, "thread suspension timed out");
                return Err(SuspendError::Timeout { pending, waited });
            }

            backoff(&mut spins);
        }

        self.counters.suspensions.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(elapsed = ?started.elapsed(), "world stopped");

        Ok(SuspendGuard {
            store: self,
            threads,
            started,
            _exclusive: exclusive,
        })
    }

    /// Current suspension counters.
    pub fn stats(&self) -> SuspensionStats {
        SuspensionStats {
            suspensions: self.counters.suspensions.load(Ordering::Relaxed),
            waits: self.counters.waits.load(Ordering::Relaxed),
            reentry_rollbacks: self.counters.reentry_rollbacks.load(Ordering::Relaxed),
            timeouts: self.counters.timeouts.load(Ordering::Relaxed),
        }
    }
}

impl fmt::Debug for ThreadStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadStore")
            .field("threads", &self.thread_count())
            .field("trap_requested", &self.signal.is_trap_requested())
            .field("shutting_down", &self.is_shutting_down())
            .field("stats", &self.stats())
            .finish()
    }
}

fn backoff(spins: &mut u32) {
    if *spins < 64 {
        std::hint::spin_loop();
    } else if *spins < 128 {
        std::thread::yield_now();
    } else {
        std::thread::sleep(Duration::from_micros(50));
    }
    *spins = spins.saturating_add(1);
}

/// Proof that the world is stopped.
///
/// Every thread in [`threads`](Self::threads) is Preemptive (or exempt) and
/// stays so until the guard is dropped.
#[must_use = "the world resumes as soon as the guard is dropped"]
pub struct SuspendGuard<'a> {
    store: &'a ThreadStore,
    threads: Vec<Arc<ThreadRecord>>,
    started: Instant,
    _exclusive: MutexGuard<'a, ()>,
}

impl SuspendGuard<'_> {
    /// Threads that were attached when the world stopped.
    pub fn threads(&self) -> &[Arc<ThreadRecord>] {
        &self.threads
    }

    /// Time since suspension began.
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Resume the world.
    pub fn resume(self) {}
}

impl Drop for SuspendGuard<'_> {
    fn drop(&mut self) {
        self.store.end_collection();
        tracing::debug!(paused = ?self.started.elapsed(), "world resumed");
    }
}

impl fmt::Debug for SuspendGuard<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SuspendGuard")
            .field("threads", &self.threads.len())
            .field("elapsed", &self.elapsed())
            .finish()
    }
}
