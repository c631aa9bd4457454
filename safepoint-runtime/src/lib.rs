//! # Safepoint Runtime
//!
//! Thread-mode protocol and allocation context for a garbage-collected
//! runtime:
//!
//! - **Mode Transitions**: cooperative/preemptive switching around native
//!   calls and reverse calls, synchronized with the collector
//! - **Thread Store**: thread registry, suspension signal and world-stop
//! - **Sampling Allocation**: bump allocation context whose effective limit
//!   is shortened to a randomly chosen sampling point
//! - **FFI Support**: C ABI entry points for generated code
//!
//! ## Technical Standards
//!
//! - **Memory Ordering**: store / `SeqCst` fence / load on both sides of the
//!   mutator-collector handshake, per the
//!   [C++ memory model](https://en.cppreference.com/w/cpp/atomic/memory_order)
//! - **PRNG**: xoshiro128++ per [prng.di.unimi.it](https://prng.di.unimi.it/)
//! - **Sampling**: geometric inter-sample distances (exponential with mean
//!   100 KiB)
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                      SAFEPOINT RUNTIME                           │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                                                                  │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────┐          │
//! │  │  Execution   │  │    Thread    │  │    Frames    │          │
//! │  │   Context    │──│    Store     │  │  (frame.rs)  │          │
//! │  │ (thread.rs)  │  │(thread_store)│  └──────────────┘          │
//! │  └──────────────┘  └──────────────┘                            │
//! │         │                                                       │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────┐          │
//! │  │  Allocation  │  │    Random    │  │     FFI      │          │
//! │  │   Context    │──│ (random.rs)  │  │(ffi_exports) │          │
//! │  └──────────────┘  └──────────────┘  └──────────────┘          │
//! │                                                                  │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod alloc_context;
pub mod config;
pub mod ffi_exports;
pub mod frame;
pub mod random;
pub mod thread;
pub mod thread_store;

use std::sync::{Arc, OnceLock};

// Re-exports
pub use alloc_context::{
    is_randomized_sampling_enabled, set_randomized_sampling_enabled, GcAllocContext,
    SamplingAllocationContext, SlowPathReason, SAMPLING_DISTRIBUTION_MEAN,
};
pub use config::{ConfigError, LogLevel, ReentryPolicy, RuntimeConfig, RuntimeConfigBuilder};
pub use frame::{
    GcFrameHandle, GcFrameRegistration, ReverseTransitionFrame, TransitionFrame,
    TOP_OF_STACK_MARKER,
};
pub use random::PerThreadRandom;
pub use thread::{
    ExecutionContext, FastReentry, ReentryError, StackBounds, ThreadMode, ThreadRecord,
    ThreadStateFlags,
};
pub use thread_store::{
    AttachError, CollectionWaiter, SuspendError, SuspendGuard, SuspensionSignal,
    SuspensionStats, ThreadStore,
};

/// Runtime version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Global runtime configuration.
static RUNTIME_CONFIG: OnceLock<RuntimeConfig> = OnceLock::new();

/// Initialize the runtime with default configuration.
pub fn init() -> Arc<ThreadStore> {
    init_with_runtime_config(RuntimeConfig::default())
}

/// Initialize the runtime with full runtime configuration.
///
/// Applies the sampling switch and returns a fresh thread store.
///
/// # Example
///
/// ```rust,ignore
/// use safepoint_runtime::{init_with_runtime_config, RuntimeConfig};
///
/// let config = RuntimeConfig::builder()
///     .sampling_enabled(true)
///     .build()
///     .unwrap();
///
/// let store = init_with_runtime_config(config);
/// let ctx = store.attach_current_thread()?;
/// ```
pub fn init_with_runtime_config(config: RuntimeConfig) -> Arc<ThreadStore> {
    // Store the runtime config globally for other components to access
    if RUNTIME_CONFIG.set(config.clone()).is_err() {
        tracing::debug!("runtime configuration already set; keeping the first one");
    }

    set_randomized_sampling_enabled(config.sampling.enabled);
    tracing::debug!(
        sampling = config.sampling.enabled,
        mean = config.sampling.mean_bytes,
        policy = ?config.suspension.reentry_policy,
        "runtime initialized"
    );

    ThreadStore::new(config)
}

/// Initialize the runtime from environment variables.
///
/// Reads configuration from `SAFEPOINT_*` environment variables.
/// See `RuntimeConfig::from_env()` for the full list of supported variables.
pub fn init_from_env() -> Arc<ThreadStore> {
    init_with_runtime_config(RuntimeConfig::from_env())
}

/// Get the current runtime configuration.
///
/// Returns `None` if the runtime was not initialized.
pub fn runtime_config() -> Option<&'static RuntimeConfig> {
    RUNTIME_CONFIG.get()
}
