//! # Sampling Allocation Context
//!
//! Per-thread bump allocation range combined with randomized allocation
//! sampling.
//!
//! ## Design
//!
//! The collector grants each thread a raw range `[alloc_ptr, alloc_limit)`.
//! Generated code allocates by bumping `alloc_ptr`, but compares against
//! `combined_limit` instead of `alloc_limit`:
//!
//! ```text
//!   alloc_ptr            combined_limit               alloc_limit
//!       |----------------------|---------------------------|
//!       <- geometric budget -->
//! ```
//!
//! When sampling is enabled, `combined_limit` is placed at the next sampled
//! byte, drawn from an exponential distribution with a fixed mean. Crossing it
//! sends the thread to the collector's refill routine, which then tells a
//! sampling boundary apart from real exhaustion via
//! [`SamplingAllocationContext::classify_overflow`].
//!
//! Invariant, after every limit update: `alloc_ptr <= combined_limit <= alloc_limit`.

use std::mem::offset_of;
use std::sync::atomic::{AtomicBool, Ordering};

use rand::SeedableRng;

use crate::random::PerThreadRandom;

/// Default mean distance, in bytes, between two sampled allocations.
pub const SAMPLING_DISTRIBUTION_MEAN: usize = 100 * 1024;

/// Process-wide "randomized allocation sampling enabled" switch.
static RANDOMIZED_SAMPLING: AtomicBool = AtomicBool::new(false);

/// Returns whether the allocation-sampling event provider is enabled.
#[inline]
pub fn is_randomized_sampling_enabled() -> bool {
    RANDOMIZED_SAMPLING.load(Ordering::Relaxed)
}

/// Enable or disable randomized allocation sampling.
///
/// Threads pick up the new value the next time their limit is recomputed.
pub fn set_randomized_sampling_enabled(enabled: bool) {
    RANDOMIZED_SAMPLING.store(enabled, Ordering::Relaxed);
}

/// Serializes unit tests that flip or depend on the process-wide switch.
#[cfg(test)]
pub(crate) static SAMPLING_SWITCH_LOCK: parking_lot::Mutex<()> = parking_lot::const_mutex(());

/// The raw range owned by the collector.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct GcAllocContext {
    /// Next free byte.
    pub alloc_ptr: usize,
    /// End of the granted range (exclusive).
    pub alloc_limit: usize,
}

/// Why generated code left the allocation fast path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlowPathReason {
    /// The request fits in the granted range; only the sampling limit was hit.
    SamplingBoundary,
    /// The granted range is exhausted.
    Exhausted,
}

/// Per-thread allocation context with a sampling-adjusted limit.
///
/// The layout is `#[repr(C)]`; generated code reads `alloc_ptr` and
/// `combined_limit` at [`ALLOC_PTR_OFFSET`] and [`COMBINED_LIMIT_OFFSET`].
#[derive(Debug)]
#[repr(C)]
pub struct SamplingAllocationContext {
    combined_limit: usize,
    gc: GcAllocContext,
    random: PerThreadRandom,
    mean: usize,
}

/// Offset of the limit generated code compares against.
pub const COMBINED_LIMIT_OFFSET: usize = offset_of!(SamplingAllocationContext, combined_limit);

/// Offset of the bump pointer.
pub const ALLOC_PTR_OFFSET: usize =
    offset_of!(SamplingAllocationContext, gc) + offset_of!(GcAllocContext, alloc_ptr);

/// Offset of the true end of the granted range.
pub const ALLOC_LIMIT_OFFSET: usize =
    offset_of!(SamplingAllocationContext, gc) + offset_of!(GcAllocContext, alloc_limit);

impl SamplingAllocationContext {
    /// Create an empty context with the given random source and sampling mean.
    ///
    /// # Panics
    ///
    /// Panics if `mean` is zero.
    pub fn new(random: PerThreadRandom, mean: usize) -> Self {
        assert!(mean > 0, "sampling mean must be positive");
        Self {
            combined_limit: 0,
            gc: GcAllocContext::default(),
            random,
            mean,
        }
    }

    /// Create an empty context with a deterministic seed.
    pub fn with_seed(seed: u64, mean: usize) -> Self {
        Self::new(PerThreadRandom::seed_from_u64(seed), mean)
    }

    /// Current bump pointer.
    #[inline]
    pub fn alloc_ptr(&self) -> usize {
        self.gc.alloc_ptr
    }

    /// True end of the granted range.
    #[inline]
    pub fn alloc_limit(&self) -> usize {
        self.gc.alloc_limit
    }

    /// The limit generated code compares against.
    #[inline]
    pub fn combined_limit(&self) -> usize {
        self.combined_limit
    }

    /// The collector-owned part of the context.
    pub fn gc_alloc_context(&self) -> &GcAllocContext {
        &self.gc
    }

    /// Mean sampling distance in bytes.
    pub fn sampling_mean(&self) -> usize {
        self.mean
    }

    /// Bytes left before the true limit.
    pub fn remaining(&self) -> usize {
        self.gc.alloc_limit - self.gc.alloc_ptr
    }

    /// Recompute `combined_limit` for the current range.
    pub fn update_combined_limit(&mut self, sampling_enabled: bool) {
        if !sampling_enabled {
            self.combined_limit = self.gc.alloc_limit;
            return;
        }

        let budget = self.compute_geometric_random();
        // min() before the add so that alloc_ptr + budget cannot overflow.
        let size = self.gc.alloc_limit - self.gc.alloc_ptr;
        self.combined_limit = self.gc.alloc_ptr + budget.min(size);
    }

    /// Draw the number of bytes until the next sampled allocation.
    ///
    /// Inverse-CDF sample of an exponential distribution with the configured
    /// mean. Draws too large to represent clamp to `usize::MAX`.
    pub fn compute_geometric_random(&mut self) -> usize {
        let probability = self.random.next_f64();
        let threshold = (-(1.0 - probability).ln() * self.mean as f64).ceil();

        if threshold.is_finite() && threshold < usize::MAX as f64 {
            // -0.0 and 0.0 both land here as 0
            threshold.max(0.0) as usize
        } else {
            usize::MAX
        }
    }

    /// Install a fresh range granted by the collector and recompute the limit.
    ///
    /// # Panics
    ///
    /// Panics if `alloc_ptr > alloc_limit`.
    pub fn refill(&mut self, alloc_ptr: usize, alloc_limit: usize, sampling_enabled: bool) {
        assert!(
            alloc_ptr <= alloc_limit,
            "allocation range is inverted: {alloc_ptr:#x} > {alloc_limit:#x}"
        );
        self.gc = GcAllocContext {
            alloc_ptr,
            alloc_limit,
        };
        self.update_combined_limit(sampling_enabled);
    }

    /// Give the range back to the collector, leaving the context empty.
    ///
    /// Returns the unused tail `[alloc_ptr, alloc_limit)`.
    pub fn retire(&mut self) -> GcAllocContext {
        let retired = self.gc;
        self.gc = GcAllocContext::default();
        self.combined_limit = 0;
        retired
    }

    /// The inlined fast path: bump `alloc_ptr` by `size` if the result stays
    /// within `combined_limit`.
    ///
    /// Returns the address of the new object, or `None` if the caller must
    /// take the slow path.
    #[inline]
    pub fn try_allocate(&mut self, size: usize) -> Option<usize> {
        let object = self.gc.alloc_ptr;
        let end = object.checked_add(size)?;
        if end > self.combined_limit {
            return None;
        }
        self.gc.alloc_ptr = end;
        Some(object)
    }

    /// Why an allocation of `size` bytes missed the fast path.
    pub fn classify_overflow(&self, size: usize) -> SlowPathReason {
        match self.gc.alloc_ptr.checked_add(size) {
            Some(end) if end > self.combined_limit && end <= self.gc.alloc_limit => {
                SlowPathReason::SamplingBoundary
            }
            _ => SlowPathReason::Exhausted,
        }
    }

    /// Returns `true` if the limit invariant holds.
    pub fn is_consistent(&self) -> bool {
        self.gc.alloc_ptr <= self.combined_limit && self.combined_limit <= self.gc.alloc_limit
    }
}

impl Default for SamplingAllocationContext {
    fn default() -> Self {
        Self::new(PerThreadRandom::from_os_entropy(), SAMPLING_DISTRIBUTION_MEAN)
    }
}
