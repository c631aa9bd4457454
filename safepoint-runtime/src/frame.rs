//! # Transition Frames
//!
//! Passive records exchanged at managed/native boundaries.
//!
//! - [`TransitionFrame`]: pushed by a thread before it calls native code
//!   (forward transition). While published, the thread is Preemptive.
//! - [`ReverseTransitionFrame`]: filled in when native code calls back into
//!   managed code (reverse transition).
//! - [`GcFrameRegistration`]: extra roots contributed by a native frame that
//!   holds managed references outside the scanned stack range.
//!
//! All of these live on the stack of the code that uses them, for exactly one
//! call. None of them own anything.

use std::fmt;
use std::marker::PhantomData;
use std::ptr::{self, NonNull};

use crate::thread::ThreadRecord;

/// Sentinel transition frame of a thread that has never entered managed code.
///
/// A thread in this state is Preemptive. The marker is never dereferenced.
pub const TOP_OF_STACK_MARKER: *mut TransitionFrame = usize::MAX as *mut TransitionFrame;

/// Forward transition frame.
#[derive(Debug)]
#[repr(C)]
pub struct TransitionFrame {
    /// Return address of the native call site; checked against hijack stubs.
    pub(crate) return_address: usize,
    /// Owning thread, written by `enter_preemptive`.
    pub(crate) thread: *const ThreadRecord,
    /// Transition frame that was active when this one was pushed.
    pub(crate) saved_frame: *mut TransitionFrame,
}

impl TransitionFrame {
    /// Create a frame for a native call returning to `return_address`.
    pub const fn new(return_address: usize) -> Self {
        Self {
            return_address,
            thread: ptr::null(),
            saved_frame: ptr::null_mut(),
        }
    }

    /// Return address recorded for this call.
    pub fn return_address(&self) -> usize {
        self.return_address
    }

    /// The thread that published this frame, or null before publication.
    pub fn thread(&self) -> *const ThreadRecord {
        self.thread
    }

    /// The frame restored when this one is popped.
    pub fn saved_frame(&self) -> *mut TransitionFrame {
        self.saved_frame
    }
}

impl Default for TransitionFrame {
    fn default() -> Self {
        Self::new(0)
    }
}

/// Reverse transition frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct ReverseTransitionFrame {
    /// Transition frame active at entry; restored on every exit path.
    pub(crate) saved_frame: *mut TransitionFrame,
}

impl ReverseTransitionFrame {
    /// Create an empty reverse frame.
    pub const fn new() -> Self {
        Self {
            saved_frame: ptr::null_mut(),
        }
    }

    /// The transition frame saved at entry.
    pub fn saved_frame(&self) -> *mut TransitionFrame {
        self.saved_frame
    }
}

impl Default for ReverseTransitionFrame {
    fn default() -> Self {
        Self::new()
    }
}

/// A node in a thread's list of extra GC roots.
///
/// The node and the root slots it points at must outlive the push/pop pair.
#[repr(C)]
pub struct GcFrameRegistration {
    pub(crate) next: *mut GcFrameRegistration,
    roots: *mut usize,
    count: usize,
    maybe_interior: bool,
}

impl GcFrameRegistration {
    /// Describe the root slots in `roots`.
    ///
    /// `maybe_interior` tells the collector the slots may point into the
    /// middle of objects.
    pub fn new(roots: &mut [usize], maybe_interior: bool) -> Self {
        Self {
            next: ptr::null_mut(),
            roots: roots.as_mut_ptr(),
            count: roots.len(),
            maybe_interior,
        }
    }

    /// Number of root slots.
    pub fn len(&self) -> usize {
        self.count
    }

    /// Returns `true` if no slots are registered.
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Whether slots may hold interior pointers.
    pub fn maybe_interior(&self) -> bool {
        self.maybe_interior
    }

    /// The registered root slots.
    ///
    /// # Safety
    ///
    /// The slice passed to [`GcFrameRegistration::new`] must still be alive
    /// and must not be mutated for the lifetime of the returned borrow.
    /// Collectors call this only while the owning thread is stopped.
    pub unsafe fn roots(&self) -> &[usize] {
        if self.count == 0 {
            return &[];
        }
        std::slice::from_raw_parts(self.roots, self.count)
    }
}

impl fmt::Debug for GcFrameRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GcFrameRegistration")
            .field("roots", &format_args!("{:p}", self.roots))
            .field("count", &self.count)
            .field("maybe_interior", &self.maybe_interior)
            .finish()
    }
}

/// Proof that a registration is on top of its thread's list.
///
/// Returned by a push and consumed by the matching pop.
#[must_use = "a pushed GC frame registration must be popped"]
#[derive(Debug)]
pub struct GcFrameHandle {
    pub(crate) node: NonNull<GcFrameRegistration>,
    _not_send: PhantomData<*const ()>,
}

impl GcFrameHandle {
    pub(crate) fn new(node: NonNull<GcFrameRegistration>) -> Self {
        Self {
            node,
            _not_send: PhantomData,
        }
    }

    /// Address of the registration node.
    pub fn as_ptr(&self) -> *mut GcFrameRegistration {
        self.node.as_ptr()
    }
}
