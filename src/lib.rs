//! # byte-throttle - Shared Byte-Rate Throttle
//!
//! A lock-free token bucket that lets many concurrent streams (parallel
//! downloads, copy workers, socket writers) share one bandwidth budget
//! expressed in bytes per second, with an optional burst allowance.
//!
//! ## How It Works
//!
//! ```text
//!     stream A ──┐
//!     stream B ──┼──► account_or_wait(state, n) ──► admitted
//!     stream C ──┘            │
//!                             │ bucket short
//!                             ▼
//!                   NativeDelay: sleep ceil(deficit / rate), retry
//! ```
//!
//! - **Rate**: bytes per second refilled into every [`ThrottleState`]; `0`
//!   disables throttling.
//! - **Burst**: the most bytes a state can bank; defaults to the rate.
//! - **State**: a 16-byte balance the caller owns. One state per budget.
//!
//! ## Features
//!
//! - **Lock-free**: refills are claimed with a CAS on the refill tick, debits
//!   are CAS loops; no stream ever blocks another.
//! - **Async waits without threads**: a waiting stream holds no OS thread.
//! - **High-resolution timers** (`high-resolution` feature, on by default):
//!   `timerfd` on Linux, high-resolution waitable timers on Windows.
//! - **C ABI**: foreign callers drive the same engine through raw pointers
//!   and OS event handles (see [`ffi`]).
//!
//! ## Quick Start
//!
//! ```rust
//! use byte_throttle::Throttle;
//! use tokio_util::sync::CancellationToken;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> byte_throttle::Result<()> {
//! // 8 MiB/s sustained, 16 MiB burst.
//! let throttle = Throttle::builder()
//!     .rate(8 << 20)
//!     .burst(16 << 20)
//!     .build()?;
//!
//! let state = throttle.new_state();
//! let cancel = CancellationToken::new();
//!
//! for chunk in [64 * 1024; 4] {
//!     // ... read `chunk` bytes from the network ...
//!     throttle.account_or_wait(&state, chunk, &cancel).await?;
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ### Process-wide Budget
//!
//! ```rust
//! use byte_throttle::{configure, read_config};
//!
//! configure(1_000_000, Some(2_000_000)).unwrap();
//! assert_eq!(read_config().capacity_bytes, 2_000_000);
//!
//! // Negative rates are rejected and leave the old configuration in place.
//! assert!(configure(-1, None).is_err());
//! # configure(0, None).unwrap();
//! ```
//!
//! ## Thread Safety
//!
//! [`Throttle`] and [`ThrottleState`] are `Send + Sync`. Share a
//! `&ThrottleState` between tasks to make them share its budget.
//!
//! ## Logging
//!
//! The crate emits [`tracing`] events (configuration changes at `info`,
//! delays at `trace`, failures at `warn`) and installs no subscriber.
//!
//! ## Safety
//!
//! `unsafe` is confined to the platform layer (OS handles and syscalls) and
//! the C ABI.

#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(
    missing_docs,
    rust_2018_idioms,
    unreachable_pub,
    missing_debug_implementations
)]
#![forbid(unsafe_op_in_unsafe_fn)]

mod delay;
mod error;
mod throttle;

#[cfg(any(windows, target_os = "linux", target_os = "android"))]
mod registry;
#[cfg(any(windows, target_os = "linux", target_os = "android"))]
mod sys;

#[cfg(any(windows, target_os = "linux", target_os = "android"))]
#[cfg_attr(
    docsrs,
    doc(cfg(any(windows, target_os = "linux", target_os = "android")))
)]
pub mod ffi;

pub use delay::{DelayKind, NativeDelay, Wait};
pub use error::{status, Result, ThrottleError};
#[cfg(any(windows, target_os = "linux", target_os = "android"))]
pub use sys::{is_valid_handle, OsEvent, OsHandle, NO_HANDLE};
pub use throttle::{
    cpu_relax, monotonic_nanos, Clock, ManualClock, MonotonicClock, SharedThrottleConfig,
    Throttle, ThrottleConfig, ThrottleMetrics, ThrottleState, NANOS_PER_SEC,
};

use tokio_util::sync::CancellationToken;

/// Version information for the crate.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Replaces the process-wide rate and burst. `burst_bytes` defaults to the
/// rate.
///
/// # Errors
///
/// [`ThrottleError::InvalidArgument`] for a negative rate or burst, or a zero
/// burst with a positive rate. The previous configuration is kept.
pub fn configure(rate_bytes_per_sec: i64, burst_bytes: Option<i64>) -> Result<()> {
    Throttle::shared().configure(rate_bytes_per_sec, burst_bytes)
}

/// Snapshot of the process-wide configuration.
pub fn read_config() -> ThrottleConfig {
    Throttle::shared().read_config()
}

/// Throttles `amount_bytes` against `state` using the process-wide engine.
///
/// See [`Throttle::account_or_wait`].
pub async fn account_or_wait(
    state: &ThrottleState,
    amount_bytes: i64,
    cancel: &CancellationToken,
) -> Result<()> {
    Throttle::shared()
        .account_or_wait(state, amount_bytes, cancel)
        .await
}

/// Prelude module for convenient imports.
pub mod prelude {
    //! Common imports for typical throttling code.
    //!
    //! # Example
    //! ```rust
    //! use byte_throttle::prelude::*;
    //!
    //! let throttle: Throttle = ThrottleBuilder::new().rate(1024).build().unwrap();
    //! let state: ThrottleState = throttle.new_state();
    //! let _kind = DelayKind::Portable;
    //! ```

    pub use crate::{
        DelayKind, NativeDelay, Result, Throttle, ThrottleBuilder, ThrottleConfig, ThrottleError,
        ThrottleMetrics, ThrottleState,
    };
    pub use tokio_util::sync::CancellationToken;
}

/// Builder for engines with their own configuration, clock or delay kind.
///
/// # Example
///
/// ```rust
/// use byte_throttle::{DelayKind, ManualClock, ThrottleBuilder};
/// use std::sync::Arc;
///
/// let clock = Arc::new(ManualClock::new());
/// let throttle = ThrottleBuilder::new()
///     .rate(1000)                    // bytes per second
///     .burst(4000)                   // bank up to 4 seconds
///     .delay_kind(DelayKind::Portable)
///     .clock(Arc::clone(&clock))
///     .build()
///     .unwrap();
///
/// assert_eq!(throttle.new_state().available_tokens(), 4000);
///
/// // Invalid settings are reported, not panicked on.
/// assert!(ThrottleBuilder::new().rate(-5).build().is_err());
/// ```
#[derive(Debug, Clone)]
pub struct ThrottleBuilder<C = MonotonicClock> {
    rate_bytes_per_sec: i64,
    burst_bytes: Option<i64>,
    delay_kind: DelayKind,
    clock: C,
}

impl ThrottleBuilder<MonotonicClock> {
    /// Creates a builder with throttling disabled, the monotonic clock and
    /// the default delay kind.
    pub fn new() -> Self {
        Self {
            rate_bytes_per_sec: 0,
            burst_bytes: None,
            delay_kind: DelayKind::default(),
            clock: MonotonicClock,
        }
    }
}

impl<C: Clock> ThrottleBuilder<C> {
    /// Sets the sustained rate in bytes per second. `0` disables throttling.
    pub fn rate(mut self, rate_bytes_per_sec: i64) -> Self {
        self.rate_bytes_per_sec = rate_bytes_per_sec;
        self
    }

    /// Sets the burst capacity in bytes. Defaults to the rate.
    pub fn burst(mut self, burst_bytes: i64) -> Self {
        self.burst_bytes = Some(burst_bytes);
        self
    }

    /// Chooses the timer backing delays.
    pub fn delay_kind(mut self, kind: DelayKind) -> Self {
        self.delay_kind = kind;
        self
    }

    /// Replaces the clock.
    pub fn clock<D: Clock>(self, clock: D) -> ThrottleBuilder<D> {
        ThrottleBuilder {
            rate_bytes_per_sec: self.rate_bytes_per_sec,
            burst_bytes: self.burst_bytes,
            delay_kind: self.delay_kind,
            clock,
        }
    }

    /// Validates the settings and builds the engine.
    ///
    /// # Errors
    ///
    /// See [`ThrottleConfig::validate`].
    pub fn build(self) -> Result<Throttle<C>> {
        let config = ThrottleConfig::from_parts(self.rate_bytes_per_sec, self.burst_bytes);
        config.validate()?;
        Ok(Throttle::from_parts(config, self.clock, self.delay_kind))
    }
}

impl Default for ThrottleBuilder<MonotonicClock> {
    fn default() -> Self {
        Self::new()
    }
}
