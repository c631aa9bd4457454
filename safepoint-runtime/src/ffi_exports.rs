//! # FFI Exports
//!
//! C-compatible exports for generated code and native hosts.
//!
//! ## Design
//!
//! Generated code brackets every native call with
//! `safepoint_inline_pinvoke` / `safepoint_inline_pinvoke_return`, and every
//! reverse call with `safepoint_try_fast_reverse_pinvoke` (falling back to
//! `safepoint_reverse_pinvoke_slow`) / `safepoint_reverse_pinvoke_return`.
//! Frames live in the caller's stack frame; the runtime only links them.
//!
//! The allocation fast path is inlined by the code generator using the
//! exported field offsets of [`SamplingAllocationContext`].
//!
//! Handles are raw pointers: a store is an `Arc<ThreadStore>` turned into a
//! raw pointer, a thread is a boxed [`ExecutionContext`] owned by the thread
//! that attached it. Null handles are fatal; a panic inside these functions
//! aborts the process.
//!
//! ## Usage
//!
//! Build as a staticlib:
//! ```toml
//! [lib]
//! crate-type = ["rlib", "staticlib"]
//! ```
//!
//! Then link with `-lsafepoint_runtime`.

use std::ffi::c_int;
use std::ptr::NonNull;
use std::sync::Arc;

use crate::alloc_context::{
    set_randomized_sampling_enabled, SamplingAllocationContext, SlowPathReason,
    ALLOC_LIMIT_OFFSET, ALLOC_PTR_OFFSET, COMBINED_LIMIT_OFFSET,
};
use crate::frame::{GcFrameRegistration, ReverseTransitionFrame, TransitionFrame};
use crate::thread::ExecutionContext;
use crate::thread_store::ThreadStore;

// ============================================================================
// Layout
// ============================================================================

/// Byte offset of `alloc_ptr` in the allocation context.
#[no_mangle]
pub static SAFEPOINT_ALLOC_PTR_OFFSET: usize = ALLOC_PTR_OFFSET;

/// Byte offset of `combined_limit` in the allocation context.
#[no_mangle]
pub static SAFEPOINT_COMBINED_LIMIT_OFFSET: usize = COMBINED_LIMIT_OFFSET;

/// Byte offset of `alloc_limit` in the allocation context.
#[no_mangle]
pub static SAFEPOINT_ALLOC_LIMIT_OFFSET: usize = ALLOC_LIMIT_OFFSET;

// ============================================================================
// Runtime and Thread Lifetime
// ============================================================================

/// Initialize the runtime from `SAFEPOINT_*` environment variables.
///
/// Returns a store handle, released with `safepoint_runtime_shutdown`.
#[no_mangle]
pub extern "C" fn safepoint_runtime_init() -> *const ThreadStore {
    Arc::into_raw(crate::init_from_env())
}

/// Stop accepting threads and release the store handle.
///
/// # Safety
///
/// `store` must come from `safepoint_runtime_init` and must not be used
/// afterwards.
#[no_mangle]
pub unsafe extern "C" fn safepoint_runtime_shutdown(store: *const ThreadStore) {
    assert!(!store.is_null(), "null thread store");
    let store = Arc::from_raw(store);
    store.shutdown();
}

/// Attach the calling thread and enter cooperative mode.
///
/// Returns null if the store is shutting down.
///
/// # Safety
///
/// `store` must be a live handle from `safepoint_runtime_init`.
#[no_mangle]
pub unsafe extern "C" fn safepoint_thread_attach(store: *const ThreadStore) -> *mut ExecutionContext {
    assert!(!store.is_null(), "null thread store");
    Arc::increment_strong_count(store);
    let store = Arc::from_raw(store);
    match store.attach_current_thread() {
        Ok(ctx) => Box::into_raw(Box::new(ctx)),
        Err(err) => {
            tracing::warn!(%err, "thread attach failed");
            std::ptr::null_mut()
        }
    }
}

/// Detach the calling thread.
///
/// # Safety
///
/// `thread` must come from `safepoint_thread_attach` on this OS thread and
/// must not be used afterwards.
#[no_mangle]
pub unsafe extern "C" fn safepoint_thread_detach(thread: *mut ExecutionContext) {
    assert!(!thread.is_null(), "null thread handle");
    drop(Box::from_raw(thread));
}

// ============================================================================
// Forward Transitions
// ============================================================================

/// Enter preemptive mode before a native call.
///
/// # Safety
///
/// `thread` must be the calling thread's handle. `frame` must stay valid
/// until the matching `safepoint_inline_pinvoke_return`.
#[no_mangle]
pub unsafe extern "C" fn safepoint_inline_pinvoke(
    thread: *const ExecutionContext,
    frame: *mut TransitionFrame,
) {
    let frame = non_null(frame, "transition frame");
    context(thread).enter_preemptive(frame);
}

/// Return to cooperative mode after a native call, waiting out a pending
/// collection.
///
/// # Safety
///
/// `frame` must be the frame passed to the matching `safepoint_inline_pinvoke`.
#[no_mangle]
pub unsafe extern "C" fn safepoint_inline_pinvoke_return(
    thread: *const ExecutionContext,
    frame: *mut TransitionFrame,
) {
    let frame = non_null(frame, "transition frame");
    context(thread).return_from_preemptive(frame);
}

// ============================================================================
// Reverse Transitions
// ============================================================================

/// Fast path of a reverse call. Returns `true` if the thread entered
/// cooperative mode; otherwise the caller must use
/// `safepoint_reverse_pinvoke_slow`.
///
/// # Safety
///
/// `thread` must be the calling thread's handle and `frame` a writable frame.
#[no_mangle]
pub unsafe extern "C" fn safepoint_try_fast_reverse_pinvoke(
    thread: *const ExecutionContext,
    frame: *mut ReverseTransitionFrame,
) -> bool {
    let frame = &mut *non_null(frame, "reverse transition frame").as_ptr();
    context(thread).try_fast_reenter_cooperative(frame).is_entered()
}

/// Slow path of a reverse call.
///
/// Returns 0 once the thread is cooperative, -1 if it could not be attached.
///
/// # Safety
///
/// `thread` must be the calling thread's handle and `frame` a writable frame.
#[no_mangle]
pub unsafe extern "C" fn safepoint_reverse_pinvoke_slow(
    thread: *const ExecutionContext,
    frame: *mut ReverseTransitionFrame,
) -> c_int {
    let frame = &mut *non_null(frame, "reverse transition frame").as_ptr();
    match context(thread).reenter_cooperative(frame) {
        Ok(()) => 0,
        Err(err) => {
            tracing::error!(%err, "reverse call rejected");
            -1
        }
    }
}

/// Leave a reverse call, restoring the frame saved at entry.
///
/// # Safety
///
/// `frame` must have been filled by a successful reverse transition.
#[no_mangle]
pub unsafe extern "C" fn safepoint_reverse_pinvoke_return(
    thread: *const ExecutionContext,
    frame: *const ReverseTransitionFrame,
) {
    let frame = &*non_null(frame.cast_mut(), "reverse transition frame").as_ptr();
    context(thread).return_to_native(frame);
}

/// Safepoint poll.
///
/// # Safety
///
/// `thread` must be the calling thread's handle.
#[no_mangle]
pub unsafe extern "C" fn safepoint_gc_poll(thread: *const ExecutionContext) {
    context(thread).poll_safepoint();
}

// ============================================================================
// GC Frame Registrations
// ============================================================================

/// Push an extra-root registration.
///
/// # Safety
///
/// `registration` must stay valid until the matching `safepoint_pop_gc_frame`.
#[no_mangle]
pub unsafe extern "C" fn safepoint_push_gc_frame(
    thread: *const ExecutionContext,
    registration: *mut GcFrameRegistration,
) {
    let registration = non_null(registration, "GC frame registration");
    // The handle is rebuilt on pop from the same pointer.
    let _ = context(thread).push_gc_frame_registration(registration);
}

/// Pop the most recent extra-root registration.
///
/// # Safety
///
/// `registration` must be the most recently pushed registration.
#[no_mangle]
pub unsafe extern "C" fn safepoint_pop_gc_frame(
    thread: *const ExecutionContext,
    registration: *mut GcFrameRegistration,
) {
    let registration = non_null(registration, "GC frame registration");
    let ctx = context(thread);
    ctx.pop_gc_frame_registration(crate::frame::GcFrameHandle::new(registration));
}

// ============================================================================
// Allocation
// ============================================================================

/// The calling thread's allocation context, for the inlined fast path.
///
/// # Safety
///
/// `thread` must be the calling thread's handle. The returned pointer is
/// valid until the thread detaches.
#[no_mangle]
pub unsafe extern "C" fn safepoint_alloc_context(
    thread: *mut ExecutionContext,
) -> *mut SamplingAllocationContext {
    assert!(!thread.is_null(), "null thread handle");
    (*thread).alloc_context_mut()
}

/// Install a fresh allocation range.
///
/// # Safety
///
/// `thread` must be the calling thread's handle.
#[no_mangle]
pub unsafe extern "C" fn safepoint_refill_alloc_context(
    thread: *mut ExecutionContext,
    alloc_ptr: usize,
    alloc_limit: usize,
) {
    assert!(!thread.is_null(), "null thread handle");
    (*thread).refill_allocation_context(alloc_ptr, alloc_limit);
}

/// Why an allocation of `size` bytes missed the fast path: 0 for a sampling
/// boundary, 1 for an exhausted range.
///
/// # Safety
///
/// `thread` must be the calling thread's handle.
#[no_mangle]
pub unsafe extern "C" fn safepoint_classify_alloc_overflow(
    thread: *const ExecutionContext,
    size: usize,
) -> c_int {
    match context(thread).alloc_context().classify_overflow(size) {
        SlowPathReason::SamplingBoundary => 0,
        SlowPathReason::Exhausted => 1,
    }
}

/// Turn randomized allocation sampling on or off.
#[no_mangle]
pub extern "C" fn safepoint_set_sampling_enabled(enabled: bool) {
    set_randomized_sampling_enabled(enabled);
}

fn non_null<T>(p: *mut T, what: &str) -> NonNull<T> {
    match NonNull::new(p) {
        Some(p) => p,
        None => panic!("null {what}"),
    }
}

unsafe fn context<'a>(thread: *const ExecutionContext) -> &'a ExecutionContext {
    assert!(!thread.is_null(), "null thread handle");
    &*thread
}

// ============================================================================
// Tests
// ============================================================================
