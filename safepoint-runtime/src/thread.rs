//! # Thread Mode Controller
//!
//! Per-thread cooperative/preemptive state machine.
//!
//! ## Design
//!
//! A thread is **Cooperative** while it runs managed code: the collector must
//! wait for it to reach a safepoint before scanning it. It is **Preemptive**
//! while it runs native code: the collector may scan it at any time and the
//! thread must not touch managed state.
//!
//! The mode is not a separate bit. A thread is Preemptive exactly when its
//! transition frame pointer is non-null:
//!
//! ```text
//!            enter_preemptive (Release store, no fence)
//!   Cooperative ─────────────────────────────────────▶ Preemptive
//!   frame = null ◀───────────────────────────────────── frame = &f
//!            return_from_preemptive (store, SeqCst fence, load trap)
//! ```
//!
//! Leaving Cooperative never races with the collector, so it is a plain
//! release store. Re-entering Cooperative is a store followed by a full fence
//! and a load of the suspension signal; the collector does the mirror image
//! (store signal, fence, load frames). With both fences in place at least one
//! side always observes the other.
//!
//! The state is split in two:
//!
//! - [`ThreadRecord`]: the part the collector may read from another thread.
//! - [`ExecutionContext`]: the owner-only handle (`!Send`, `!Sync`) that
//!   performs transitions and owns the allocation context.

use std::fmt;
use std::marker::PhantomData;
use std::ptr::{self, NonNull};
use std::sync::atomic::{fence, AtomicPtr, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::ThreadId;

use bitflags::bitflags;
use rand::SeedableRng;
use thiserror::Error;

use crate::alloc_context::{is_randomized_sampling_enabled, SamplingAllocationContext};
use crate::config::ReentryPolicy;
use crate::frame::{
    GcFrameHandle, GcFrameRegistration, ReverseTransitionFrame, TransitionFrame,
    TOP_OF_STACK_MARKER,
};
use crate::random::PerThreadRandom;
use crate::thread_store::{AttachError, ThreadStore};

bitflags! {
    /// Thread state flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ThreadStateFlags: u32 {
        /// The thread completed one-time initialization with its store.
        const ATTACHED = 1 << 0;
        /// The thread has been detached and must not run managed code again.
        const DETACHED = 1 << 1;
        /// The thread is collector infrastructure.
        const GC_SPECIAL = 1 << 2;
        /// The thread is never asked to cooperate with a collection.
        const DO_NOT_TRIGGER_GC = 1 << 3;
    }
}

/// Execution mode, derived from the transition frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ThreadMode {
    /// Running managed code; the collector must wait for a safepoint.
    Cooperative,
    /// Running native code; the collector may scan at any time.
    Preemptive,
}

/// Outcome of the reverse-transition fast path.
///
/// Every variant other than `Entered` sends the caller to
/// [`ExecutionContext::reenter_cooperative`].
#[must_use]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FastReentry {
    /// The thread is now Cooperative (or is exempt from the protocol).
    Entered = 0,
    /// The thread has not been attached yet.
    NotAttached = 1,
    /// The thread is already Cooperative; reentry is not allowed.
    BadTransition = 2,
    /// A collection is pending; the transition was rolled back.
    TrapRequested = 3,
}

impl FastReentry {
    /// Returns `true` if the thread entered managed code.
    pub fn is_entered(self) -> bool {
        self == FastReentry::Entered
    }
}

/// Error from the slow reverse-transition path.
#[derive(Debug, Clone, Error)]
pub enum ReentryError {
    /// The thread could not be attached.
    #[error("cannot attach thread for reverse call: {0}")]
    Attach(#[from] AttachError),
}

/// Bounds of a thread's native stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StackBounds {
    low: usize,
    high: usize,
}

impl StackBounds {
    /// Bounds that have not been determined.
    pub const UNSET: StackBounds = StackBounds { low: 0, high: 0 };

    /// Create bounds covering `[low, high)`.
    ///
    /// # Panics
    ///
    /// Panics if `low >= high` or `low` is zero.
    pub fn new(low: usize, high: usize) -> Self {
        assert!(low != 0 && low < high, "invalid stack bounds [{low:#x}, {high:#x})");
        Self { low, high }
    }

    /// Query the calling thread's stack from the OS.
    #[cfg(target_os = "linux")]
    pub fn current() -> Option<Self> {
        unsafe {
            let mut attr: libc::pthread_attr_t = std::mem::zeroed();
            if libc::pthread_getattr_np(libc::pthread_self(), &mut attr) != 0 {
                return None;
            }
            let mut addr: *mut libc::c_void = ptr::null_mut();
            let mut size: libc::size_t = 0;
            let rc = libc::pthread_attr_getstack(&attr, &mut addr, &mut size);
            libc::pthread_attr_destroy(&mut attr);
            if rc != 0 || addr.is_null() || size == 0 {
                return None;
            }
            let low = addr as usize;
            Some(Self::new(low, low + size))
        }
    }

    /// Query the calling thread's stack from the OS.
    #[cfg(target_os = "macos")]
    pub fn current() -> Option<Self> {
        unsafe {
            let this = libc::pthread_self();
            let high = libc::pthread_get_stackaddr_np(this) as usize;
            let size = libc::pthread_get_stacksize_np(this);
            if high == 0 || size == 0 || size > high {
                return None;
            }
            Some(Self::new(high - size, high))
        }
    }

    /// Query the calling thread's stack from the OS.
    #[cfg(not(any(target_os = "linux", target_os = "macos")))]
    pub fn current() -> Option<Self> {
        None
    }

    /// Returns `true` once the bounds have been determined.
    pub fn is_set(&self) -> bool {
        self.low != 0 && self.high != 0
    }

    /// Lowest stack address.
    pub fn low(&self) -> usize {
        self.low
    }

    /// One past the highest stack address.
    pub fn high(&self) -> usize {
        self.high
    }

    /// Returns `true` if `p` lies in `[low, high)`.
    pub fn contains(&self, p: usize) -> bool {
        self.low <= p && p < self.high
    }
}

/// Global thread ID counter.
static NEXT_THREAD_ID: AtomicU64 = AtomicU64::new(1);

/// The collector-visible half of a thread.
pub struct ThreadRecord {
    id: u64,
    os_thread: ThreadId,
    /// Null when Cooperative. Written only by the owning thread.
    transition_frame: AtomicPtr<TransitionFrame>,
    /// Owner-only scratch slot for allocation helpers.
    deferred_transition_frame: AtomicPtr<TransitionFrame>,
    /// Head of the extra-root list. Owner-written, read while stopped.
    gc_frame_registrations: AtomicPtr<GcFrameRegistration>,
    state: AtomicU32,
    stack: StackBounds,
}

impl ThreadRecord {
    fn new(stack: StackBounds) -> Self {
        Self {
            id: NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed),
            os_thread: std::thread::current().id(),
            transition_frame: AtomicPtr::new(TOP_OF_STACK_MARKER),
            deferred_transition_frame: AtomicPtr::new(ptr::null_mut()),
            gc_frame_registrations: AtomicPtr::new(ptr::null_mut()),
            state: AtomicU32::new(0),
            stack,
        }
    }

    /// Runtime-assigned thread ID.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The OS thread that owns this record.
    pub fn os_thread(&self) -> ThreadId {
        self.os_thread
    }

    /// Current raw transition frame (null, a frame, or [`TOP_OF_STACK_MARKER`]).
    #[inline]
    pub fn transition_frame(&self) -> *mut TransitionFrame {
        self.transition_frame.load(Ordering::Acquire)
    }

    /// The published frame, if the thread is in a native call.
    pub fn active_transition_frame(&self) -> Option<NonNull<TransitionFrame>> {
        let frame = self.transition_frame();
        if frame == TOP_OF_STACK_MARKER {
            None
        } else {
            NonNull::new(frame)
        }
    }

    /// Current mode as observed from any thread.
    #[inline]
    pub fn mode(&self) -> ThreadMode {
        if self.transition_frame().is_null() {
            ThreadMode::Cooperative
        } else {
            ThreadMode::Preemptive
        }
    }

    /// Returns `true` if the thread is running managed code.
    #[inline]
    pub fn is_cooperative(&self) -> bool {
        self.mode() == ThreadMode::Cooperative
    }

    /// Frame recorded by an allocation helper, or null.
    pub fn deferred_transition_frame(&self) -> *mut TransitionFrame {
        self.deferred_transition_frame.load(Ordering::Acquire)
    }

    /// Current state flags.
    pub fn state(&self) -> ThreadStateFlags {
        ThreadStateFlags::from_bits_retain(self.state.load(Ordering::Acquire))
    }

    /// Returns `true` if every flag in `flags` is set.
    #[inline]
    pub fn is_state_set(&self, flags: ThreadStateFlags) -> bool {
        self.state().contains(flags)
    }

    /// Returns `true` if the thread is exempt from suspension.
    #[inline]
    pub fn is_do_not_trigger_gc(&self) -> bool {
        self.is_state_set(ThreadStateFlags::DO_NOT_TRIGGER_GC)
    }

    /// Returns `true` once the thread is attached.
    #[inline]
    pub fn is_attached(&self) -> bool {
        self.is_state_set(ThreadStateFlags::ATTACHED)
    }

    /// The thread's stack bounds.
    ///
    /// # Panics
    ///
    /// Panics if the bounds were never set.
    pub fn stack_bounds(&self) -> StackBounds {
        assert!(self.stack.is_set(), "thread {} has no stack bounds", self.id);
        self.stack
    }

    /// Returns `true` if `p` points into this thread's stack.
    ///
    /// # Panics
    ///
    /// Panics if the bounds were never set.
    pub fn is_within_stack_bounds(&self, p: usize) -> bool {
        self.stack_bounds().contains(p)
    }

    /// Visit the thread's GC frame registrations, most recent first.
    ///
    /// # Safety
    ///
    /// The thread must be stopped (Preemptive and unable to return) so the
    /// list cannot change during the walk.
    pub unsafe fn for_each_gc_frame(&self, mut f: impl FnMut(&GcFrameRegistration)) {
        let mut current = self.gc_frame_registrations.load(Ordering::Acquire);
        while let Some(node) = current.as_ref() {
            f(node);
            current = node.next;
        }
    }

    pub(crate) fn publish_frame(&self, frame: *mut TransitionFrame, order: Ordering) {
        self.transition_frame.store(frame, order);
    }

    pub(crate) fn set_state(&self, flags: ThreadStateFlags) {
        self.state.fetch_or(flags.bits(), Ordering::AcqRel);
    }

    pub(crate) fn clear_state(&self, flags: ThreadStateFlags) {
        self.state.fetch_and(!flags.bits(), Ordering::AcqRel);
    }

    /// Whether the collector has to wait for this thread before the world
    /// counts as stopped.
    pub(crate) fn blocks_suspension(&self) -> bool {
        !self.is_do_not_trigger_gc() && self.is_cooperative()
    }
}

impl fmt::Debug for ThreadRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadRecord")
            .field("id", &self.id)
            .field("mode", &self.mode())
            .field("state", &self.state())
            .field("stack", &self.stack)
            .finish()
    }
}

/// A thread's execution context.
///
/// Created on, and confined to, the OS thread it describes.
pub struct ExecutionContext {
    record: Arc<ThreadRecord>,
    store: Arc<ThreadStore>,
    alloc_context: SamplingAllocationContext,
    _not_send: PhantomData<*const ()>,
}

impl ExecutionContext {
    /// Create an unattached context for the calling thread.
    ///
    /// The thread starts Preemptive and must attach (or go through
    /// [`reenter_cooperative`](Self::reenter_cooperative)) before running
    /// managed code.
    pub fn new(store: Arc<ThreadStore>, stack: StackBounds) -> Self {
        let record = Arc::new(ThreadRecord::new(stack));
        let sampling = &store.config().sampling;
        let random = match sampling.seed {
            Some(seed) => PerThreadRandom::seed_from_u64(seed.wrapping_add(record.id())),
            None => PerThreadRandom::from_os_entropy(),
        };
        let alloc_context = SamplingAllocationContext::new(random, sampling.mean_bytes);

        Self {
            record,
            store,
            alloc_context,
            _not_send: PhantomData,
        }
    }

    /// The collector-visible record.
    pub fn record(&self) -> &Arc<ThreadRecord> {
        &self.record
    }

    /// The store this thread belongs to.
    pub fn store(&self) -> &Arc<ThreadStore> {
        &self.store
    }

    /// Runtime-assigned thread ID.
    pub fn id(&self) -> u64 {
        self.record.id()
    }

    /// Register with the store and mark the thread attached.
    ///
    /// Attaching does not change the mode. Attaching twice is a no-op.
    pub fn attach(&self) -> Result<(), AttachError> {
        if self.record.is_attached() {
            return Ok(());
        }
        if self.record.is_state_set(ThreadStateFlags::DETACHED) {
            return Err(AttachError::Detached(self.id()));
        }
        self.store.register(Arc::clone(&self.record))?;
        self.record.set_state(ThreadStateFlags::ATTACHED);
        tracing::debug!(thread = self.id(), "thread attached");
        Ok(())
    }

    /// Current mode.
    #[inline]
    pub fn mode(&self) -> ThreadMode {
        self.debug_assert_owner();
        if self.record.transition_frame.load(Ordering::Relaxed).is_null() {
            ThreadMode::Cooperative
        } else {
            ThreadMode::Preemptive
        }
    }

    /// Returns `true` if the thread is running managed code.
    #[inline]
    pub fn is_cooperative(&self) -> bool {
        self.mode() == ThreadMode::Cooperative
    }

    /// Mark or unmark the thread as exempt from suspension.
    pub fn set_do_not_trigger_gc(&self, enabled: bool) {
        if enabled {
            self.record.set_state(ThreadStateFlags::DO_NOT_TRIGGER_GC);
        } else {
            self.record.clear_state(ThreadStateFlags::DO_NOT_TRIGGER_GC);
        }
    }

    /// Mark the thread as collector infrastructure.
    pub fn mark_gc_special(&self) {
        self.record.set_state(ThreadStateFlags::GC_SPECIAL);
    }

    // ------------------------------------------------------------------------
    // Forward transition (managed -> native -> managed)
    // ------------------------------------------------------------------------

    /// Switch to Preemptive before calling native code.
    ///
    /// # Safety
    ///
    /// `frame` must point to a `TransitionFrame` that stays valid and does not
    /// move until the matching [`return_from_preemptive`](Self::return_from_preemptive).
    ///
    /// # Panics
    ///
    /// Panics if the thread is already Preemptive and not exempt from
    /// suspension.
    #[inline]
    pub unsafe fn enter_preemptive(&self, frame: NonNull<TransitionFrame>) {
        self.debug_assert_owner();
        let current = self.record.transition_frame.load(Ordering::Relaxed);
        let exempt = self.record.is_do_not_trigger_gc();
        assert!(
            current.is_null() || exempt,
            "thread {} entered preemptive mode twice",
            self.id()
        );
        debug_assert!(!exempt || self.store.signal().is_trap_requested());

        let frame = frame.as_ptr();
        debug_assert!(
            !self.store.is_hijack_target((*frame).return_address),
            "transition frame returns into a hijack stub"
        );
        (*frame).thread = Arc::as_ptr(&self.record);
        (*frame).saved_frame = current;

        // set our mode to preemptive
        self.record.transition_frame.store(frame, Ordering::Release);
    }

    /// Switch back to Cooperative after a native call returns.
    ///
    /// Blocks in the store's wait-for-collection helper if a collection is
    /// pending.
    ///
    /// # Safety
    ///
    /// `frame` must be the frame passed to the matching `enter_preemptive`.
    #[inline]
    pub unsafe fn return_from_preemptive(&self, frame: NonNull<TransitionFrame>) {
        self.debug_assert_owner();
        let frame = frame.as_ptr();
        debug_assert_eq!(self.record.transition_frame.load(Ordering::Relaxed), frame);

        let saved = (*frame).saved_frame;
        self.record.transition_frame.store(saved, Ordering::Relaxed);
        if !saved.is_null() {
            // Popped a nested frame; still Preemptive.
            return;
        }

        // must be in cooperative mode when checking the trap flag
        fence(Ordering::SeqCst);
        if self.store.signal().is_trap_requested() {
            self.store.wait_for_collection(&self.record, frame);
        }
    }

    /// Run `f` in Preemptive mode, as a native call.
    ///
    /// `f` must not touch managed state.
    pub fn with_preemptive<R>(&self, f: impl FnOnce() -> R) -> R {
        struct Return<'a> {
            ctx: &'a ExecutionContext,
            frame: NonNull<TransitionFrame>,
        }

        impl Drop for Return<'_> {
            fn drop(&mut self) {
                unsafe { self.ctx.return_from_preemptive(self.frame) }
            }
        }

        let mut frame = TransitionFrame::new(0);
        let frame = NonNull::from(&mut frame);
        unsafe { self.enter_preemptive(frame) };
        let _return = Return { ctx: self, frame };
        f()
    }

    // ------------------------------------------------------------------------
    // Reverse transition (native -> managed -> native)
    // ------------------------------------------------------------------------

    /// Fast path for native code calling into managed code.
    ///
    /// Never blocks. On any result other than [`FastReentry::Entered`] the
    /// thread's mode and transition frame are exactly as they were on entry.
    ///
    /// # Panics
    ///
    /// In debug builds, if the thread is exempt from suspension
    /// ([`set_do_not_trigger_gc`](Self::set_do_not_trigger_gc)) and no
    /// collection is pending. Exempt threads only call back into managed code
    /// while the collector holds the world stopped.
    #[inline]
    pub fn try_fast_reenter_cooperative(&self, frame: &mut ReverseTransitionFrame) -> FastReentry {
        self.debug_assert_owner();
        let current = self.record.transition_frame.load(Ordering::Relaxed);
        // restored when we return to native code
        frame.saved_frame = current;

        if self.record.is_do_not_trigger_gc() {
            debug_assert!(
                self.store.signal().is_trap_requested(),
                "exempt thread re-entered without a pending collection"
            );
            return FastReentry::Entered;
        }

        if !self.record.is_attached() {
            return FastReentry::NotAttached;
        }

        if current.is_null() {
            return FastReentry::BadTransition;
        }

        debug_assert!(!self.record.is_state_set(ThreadStateFlags::GC_SPECIAL));

        // must be in cooperative mode when checking the trap flag
        self.record.transition_frame.store(ptr::null_mut(), Ordering::Relaxed);
        fence(Ordering::SeqCst);

        if self.store.signal().is_trap_requested() {
            // put the previous frame back (sets us back to preemptive mode)
            self.record.transition_frame.store(current, Ordering::Release);
            self.store.record_rollback();
            return FastReentry::TrapRequested;
        }

        FastReentry::Entered
    }

    /// Slow path for native code calling into managed code.
    ///
    /// Attaches the thread if needed and waits out any pending collection.
    /// On `Ok` the thread is Cooperative and `frame` holds the frame to
    /// restore on the way back out.
    ///
    /// # Panics
    ///
    /// Panics if the thread is already Cooperative and not exempt.
    pub fn reenter_cooperative(&self, frame: &mut ReverseTransitionFrame) -> Result<(), ReentryError> {
        let policy = self.store.config().suspension.reentry_policy;
        let mut attempts = 0u32;

        loop {
            match self.try_fast_reenter_cooperative(frame) {
                FastReentry::Entered => return Ok(()),
                FastReentry::NotAttached => {
                    self.attach()?;
                }
                FastReentry::BadTransition => {
                    panic!(
                        "thread {} called into managed code while already in cooperative mode",
                        self.id()
                    );
                }
                FastReentry::TrapRequested => {
                    attempts += 1;
                    match policy {
                        ReentryPolicy::RetryFastPath { max_attempts } if attempts < max_attempts => {
                            tracing::trace!(thread = self.id(), attempts, "reverse call parked for collection");
                            self.store.block_until_resumed();
                        }
                        _ => {
                            tracing::trace!(thread = self.id(), attempts, "reverse call blocking for collection");
                            self.store.wait_for_collection(&self.record, frame.saved_frame);
                            return Ok(());
                        }
                    }
                }
            }
        }
    }

    /// Restore the frame saved by a reverse transition on the way back to
    /// native code. The thread becomes Preemptive again (unless it was
    /// Cooperative at entry).
    ///
    /// # Safety
    ///
    /// `frame` must have been filled by a successful reverse transition on
    /// this thread, and the frame it saved must still be alive.
    #[inline]
    pub unsafe fn return_to_native(&self, frame: &ReverseTransitionFrame) {
        self.debug_assert_owner();
        // set our mode to preemptive
        self.record
            .transition_frame
            .store(frame.saved_frame, Ordering::Release);
    }

    /// Run `f` as managed code called from native code.
    pub fn reverse_call<R>(&self, f: impl FnOnce() -> R) -> Result<R, ReentryError> {
        struct Restore<'a> {
            ctx: &'a ExecutionContext,
            frame: ReverseTransitionFrame,
        }

        impl Drop for Restore<'_> {
            fn drop(&mut self) {
                unsafe { self.ctx.return_to_native(&self.frame) }
            }
        }

        let mut frame = ReverseTransitionFrame::new();
        if !self.try_fast_reenter_cooperative(&mut frame).is_entered() {
            self.reenter_cooperative(&mut frame)?;
        }
        let _restore = Restore { ctx: self, frame };
        Ok(f())
    }

    /// Safepoint poll for managed code.
    ///
    /// If a collection is pending, parks the thread until it completes.
    pub fn poll_safepoint(&self) {
        if !self.store.signal().is_trap_requested() || self.record.is_do_not_trigger_gc() {
            return;
        }
        assert!(
            self.is_cooperative(),
            "thread {} polled for a safepoint outside managed code",
            self.id()
        );
        let mut frame = TransitionFrame::new(0);
        let frame = NonNull::from(&mut frame);
        unsafe {
            self.enter_preemptive(frame);
            self.return_from_preemptive(frame);
        }
    }

    // ------------------------------------------------------------------------
    // Deferred transition frame
    // ------------------------------------------------------------------------

    /// Record a frame built by an allocation helper. Only valid in
    /// Cooperative mode.
    ///
    /// # Safety
    ///
    /// `frame` must stay valid until it is replaced or the helper returns.
    pub unsafe fn set_deferred_transition_frame(&self, frame: NonNull<TransitionFrame>) {
        assert!(self.is_cooperative(), "deferred frame set outside cooperative mode");
        debug_assert!(
            !self.store.is_hijack_target(frame.as_ref().return_address),
            "transition frame returns into a hijack stub"
        );
        self.record
            .deferred_transition_frame
            .store(frame.as_ptr(), Ordering::Release);
    }

    /// Use the current transition frame as the deferred frame. Only valid in
    /// Preemptive mode.
    pub fn defer_transition_frame(&self) {
        assert!(!self.is_cooperative(), "deferring a frame in cooperative mode");
        let current = self.record.transition_frame.load(Ordering::Relaxed);
        self.record
            .deferred_transition_frame
            .store(current, Ordering::Release);
    }

    /// The deferred frame, or null.
    pub fn deferred_transition_frame(&self) -> *mut TransitionFrame {
        self.record.deferred_transition_frame()
    }

    // ------------------------------------------------------------------------
    // GC frame registrations
    // ------------------------------------------------------------------------

    /// Push an extra-root registration.
    ///
    /// # Safety
    ///
    /// `registration` and its root slots must stay valid until the returned
    /// handle is passed to [`pop_gc_frame_registration`](Self::pop_gc_frame_registration).
    pub unsafe fn push_gc_frame_registration(
        &self,
        registration: NonNull<GcFrameRegistration>,
    ) -> GcFrameHandle {
        let head = self.record.gc_frame_registrations.load(Ordering::Relaxed);
        (*registration.as_ptr()).next = head;
        self.record
            .gc_frame_registrations
            .store(registration.as_ptr(), Ordering::Release);
        GcFrameHandle::new(registration)
    }

    /// Pop the most recent registration.
    ///
    /// Registrations must be popped in LIFO order; debug builds check it.
    pub fn pop_gc_frame_registration(&self, handle: GcFrameHandle) {
        let head = self.record.gc_frame_registrations.load(Ordering::Relaxed);
        debug_assert_eq!(
            head,
            handle.as_ptr(),
            "GC frame registrations popped out of order"
        );
        let next = unsafe { (*handle.as_ptr()).next };
        self.record
            .gc_frame_registrations
            .store(next, Ordering::Release);
    }

    /// Run `f` with `roots` registered as extra GC roots.
    pub fn with_gc_frame<R>(&self, roots: &mut [usize], maybe_interior: bool, f: impl FnOnce() -> R) -> R {
        struct Pop<'a> {
            ctx: &'a ExecutionContext,
            handle: Option<GcFrameHandle>,
        }

        impl Drop for Pop<'_> {
            fn drop(&mut self) {
                if let Some(handle) = self.handle.take() {
                    self.ctx.pop_gc_frame_registration(handle);
                }
            }
        }

        let mut registration = GcFrameRegistration::new(roots, maybe_interior);
        let handle = unsafe { self.push_gc_frame_registration(NonNull::from(&mut registration)) };
        let _pop = Pop {
            ctx: self,
            handle: Some(handle),
        };
        f()
    }

    /// Number of registrations currently pushed.
    pub fn gc_frame_depth(&self) -> usize {
        let mut depth = 0;
        // Safety: the owning thread is the only writer and it is us.
        unsafe { self.record.for_each_gc_frame(|_| depth += 1) };
        depth
    }

    // ------------------------------------------------------------------------
    // Allocation
    // ------------------------------------------------------------------------

    /// The thread's allocation context.
    pub fn alloc_context(&self) -> &SamplingAllocationContext {
        &self.alloc_context
    }

    /// Mutable access to the allocation context.
    pub fn alloc_context_mut(&mut self) -> &mut SamplingAllocationContext {
        &mut self.alloc_context
    }

    /// Install a range granted by the collector.
    pub fn refill_allocation_context(&mut self, alloc_ptr: usize, alloc_limit: usize) {
        let sampling = is_randomized_sampling_enabled();
        self.alloc_context.refill(alloc_ptr, alloc_limit, sampling);
        tracing::trace!(
            thread = self.record.id(),
            size = alloc_limit - alloc_ptr,
            sampling,
            "allocation context refilled"
        );
    }

    /// Recompute the sampling limit, e.g. after the sampling switch changed.
    pub fn update_combined_limit(&mut self) {
        self.alloc_context
            .update_combined_limit(is_randomized_sampling_enabled());
    }

    #[inline]
    fn debug_assert_owner(&self) {
        debug_assert_eq!(
            std::thread::current().id(),
            self.record.os_thread,
            "execution context used from a foreign thread"
        );
    }
}

impl Drop for ExecutionContext {
    fn drop(&mut self) {
        let frame = self.record.transition_frame.load(Ordering::Relaxed);
        if !frame.is_null() && frame != TOP_OF_STACK_MARKER {
            tracing::warn!(thread = self.record.id(), "thread detached inside a native call");
        }

        // A detached thread looks Preemptive to any collector still holding it.
        self.record
            .transition_frame
            .store(TOP_OF_STACK_MARKER, Ordering::Release);

        if self.record.is_attached() {
            self.store.unregister(&self.record);
            self.record.clear_state(ThreadStateFlags::ATTACHED);
            self.record.set_state(ThreadStateFlags::DETACHED);
            tracing::debug!(thread = self.record.id(), "thread detached");
        }

        let retired = self.alloc_context.retire();
        self.store.return_alloc_range(self.record.id(), retired);
    }
}

impl fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("record", &self.record)
            .field("alloc_context", &self.alloc_context)
            .finish()
    }
}
