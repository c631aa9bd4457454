//! Property-based tests for the safepoint runtime.
//!
//! Uses proptest to generate random inputs and verify invariants hold.

use std::ptr::NonNull;

use proptest::prelude::*;
use safepoint_runtime::{
    ExecutionContext, FastReentry, ReverseTransitionFrame, RuntimeConfig, SamplingAllocationContext,
    SlowPathReason, ThreadMode, ThreadStore, TransitionFrame, SAMPLING_DISTRIBUTION_MEAN,
};

/// Strategy for allocation ranges `(alloc_ptr, alloc_limit)`, including
/// ranges ending at the top of the address space.
fn alloc_range() -> impl Strategy<Value = (usize, usize)> {
    prop_oneof![
        (0usize..=usize::MAX / 2, 0usize..=1 << 32).prop_map(|(p, len)| (p, p + len)),
        (0usize..=1 << 20).prop_map(|len| (usize::MAX - len, usize::MAX)),
        (1usize..=usize::MAX / 2).prop_map(|p| (p, p)),
    ]
}

/// Strategy for sampling means.
fn sampling_mean() -> impl Strategy<Value = usize> {
    prop_oneof![
        Just(SAMPLING_DISTRIBUTION_MEAN),
        1usize..=64,
        1usize..=1 << 30,
    ]
}

/// A step in a transition sequence.
#[derive(Debug, Clone, Copy)]
enum Step {
    NativeCall,
    ReverseCall,
    Poll,
}

fn step() -> impl Strategy<Value = Step> {
    prop_oneof![Just(Step::NativeCall), Just(Step::ReverseCall), Just(Step::Poll)]
}

fn run_steps(ctx: &ExecutionContext, steps: &[Step]) {
    let Some((first, rest)) = steps.split_first() else {
        return;
    };
    match first {
        Step::NativeCall => {
            let mut frame = TransitionFrame::new(0);
            let frame_ptr = NonNull::from(&mut frame);
            unsafe { ctx.enter_preemptive(frame_ptr) };
            assert_eq!(ctx.mode(), ThreadMode::Preemptive);
            assert_eq!(ctx.record().transition_frame(), frame_ptr.as_ptr());

            // Native code may call back into managed code.
            let mut reverse = ReverseTransitionFrame::new();
            assert_eq!(ctx.try_fast_reenter_cooperative(&mut reverse), FastReentry::Entered);
            run_steps(ctx, rest);
            unsafe { ctx.return_to_native(&reverse) };
            assert_eq!(ctx.mode(), ThreadMode::Preemptive);

            unsafe { ctx.return_from_preemptive(frame_ptr) };
        }
        Step::ReverseCall => {
            let value = ctx.with_preemptive(|| ctx.reverse_call(|| ctx.mode()).unwrap());
            assert_eq!(value, ThreadMode::Cooperative);
            run_steps(ctx, rest);
        }
        Step::Poll => {
            ctx.poll_safepoint();
            run_steps(ctx, rest);
        }
    }
    assert_eq!(ctx.mode(), ThreadMode::Cooperative);
    assert!(ctx.record().transition_frame().is_null());
}

proptest! {
    /// The limit invariant holds after every recompute
    #[test]
    fn combined_limit_within_range(
        (ptr, limit) in alloc_range(),
        mean in sampling_mean(),
        seed in any::<u64>(),
        enabled in any::<bool>(),
    ) {
        let mut ctx = SamplingAllocationContext::with_seed(seed, mean);
        ctx.refill(ptr, limit, enabled);
        prop_assert!(ctx.alloc_ptr() <= ctx.combined_limit());
        prop_assert!(ctx.combined_limit() <= ctx.alloc_limit());
        prop_assert!(ctx.is_consistent());

        for _ in 0..8 {
            ctx.update_combined_limit(enabled);
            prop_assert!(ctx.is_consistent());
        }
    }

    /// Sampling disabled leaves the effective limit at the real limit
    #[test]
    fn disabled_sampling_uses_alloc_limit((ptr, limit) in alloc_range(), seed in any::<u64>()) {
        let mut ctx = SamplingAllocationContext::with_seed(seed, SAMPLING_DISTRIBUTION_MEAN);
        ctx.refill(ptr, limit, false);
        prop_assert_eq!(ctx.combined_limit(), limit);
    }

    /// The effective limit is alloc_ptr plus the smaller of budget and remaining
    #[test]
    fn enabled_sampling_clamps_budget(
        (ptr, limit) in alloc_range(),
        mean in sampling_mean(),
        seed in any::<u64>(),
    ) {
        let mut expected_source = SamplingAllocationContext::with_seed(seed, mean);
        let budget = expected_source.compute_geometric_random();

        let mut ctx = SamplingAllocationContext::with_seed(seed, mean);
        ctx.refill(ptr, limit, true);
        prop_assert_eq!(ctx.combined_limit(), ptr + budget.min(limit - ptr));
    }

    /// Bump allocation never crosses the effective limit, and a miss inside
    /// the real range is a sampling boundary
    #[test]
    fn bump_allocation_respects_limit(
        base in 0x1000usize..=0x1_0000_0000,
        len in 0usize..=1 << 20,
        sizes in prop::collection::vec(1usize..=4096, 1..64),
        seed in any::<u64>(),
    ) {
        let mut ctx = SamplingAllocationContext::with_seed(seed, 8 * 1024);
        ctx.refill(base, base + len, true);

        let mut last = base;
        for size in sizes {
            match ctx.try_allocate(size) {
                Some(object) => {
                    prop_assert_eq!(object, last);
                    last = object + size;
                    prop_assert!(ctx.alloc_ptr() <= ctx.combined_limit());
                }
                None => {
                    let reason = ctx.classify_overflow(size);
                    if ctx.alloc_ptr() + size <= ctx.alloc_limit() {
                        prop_assert_eq!(reason, SlowPathReason::SamplingBoundary);
                    } else {
                        prop_assert_eq!(reason, SlowPathReason::Exhausted);
                    }
                    break;
                }
            }
        }
    }

    /// Any nesting of native calls, reverse calls and polls keeps the mode
    /// and the transition frame in lockstep
    #[test]
    fn transitions_alternate(steps in prop::collection::vec(step(), 0..16)) {
        let store = ThreadStore::new(RuntimeConfig::default());
        let ctx = store.attach_current_thread().unwrap();
        run_steps(&ctx, &steps);
        prop_assert_eq!(ctx.mode(), ThreadMode::Cooperative);
        prop_assert_eq!(store.stats().waits, 0);
    }
}

#[test]
fn one_megabyte_remaining_without_sampling() {
    let mut ctx = SamplingAllocationContext::with_seed(5, SAMPLING_DISTRIBUTION_MEAN);
    ctx.refill(0x4000_0000, 0x4000_0000 + 1_000_000, false);
    assert_eq!(ctx.combined_limit(), 0x4000_0000 + 1_000_000);
}
