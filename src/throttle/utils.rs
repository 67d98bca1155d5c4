//! # Utility Functions (utils.rs)
//!
//! Clock sources and spin helpers for the throttle engine.
//!
//! ## Clock Sources
//!
//! ```text
//!     Clock trait
//!     ├─ MonotonicClock   nanoseconds since a process-local epoch
//!     │                   (frequency 1_000_000_000)
//!     └─ ManualClock      caller-driven ticks, any frequency
//! ```
//!
//! The engine only ever subtracts two readings of the same clock, so the
//! epoch is irrelevant; what matters is that readings never go backwards.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::OnceLock;
use std::time::{Duration, Instant};

/// Ticks per second of [`MonotonicClock`].
pub const NANOS_PER_SEC: i64 = 1_000_000_000;

static MONOTONIC_EPOCH: OnceLock<Instant> = OnceLock::new();

/// A monotonic, non-decreasing tick counter with a known frequency.
///
/// Implementations must never return a smaller value than a previous call
/// within the same process.
pub trait Clock: Send + Sync {
    /// Current reading in ticks.
    fn now(&self) -> i64;

    /// Number of ticks per second.
    fn frequency(&self) -> i64;
}

impl<C: Clock + ?Sized> Clock for &C {
    fn now(&self) -> i64 {
        (**self).now()
    }

    fn frequency(&self) -> i64 {
        (**self).frequency()
    }
}

impl<C: Clock + ?Sized> Clock for std::sync::Arc<C> {
    fn now(&self) -> i64 {
        (**self).now()
    }

    fn frequency(&self) -> i64 {
        (**self).frequency()
    }
}

/// The default clock: nanoseconds elapsed since the first reading in this
/// process.
///
/// # Example
///
/// ```rust
/// use byte_throttle::{Clock, MonotonicClock};
///
/// let clock = MonotonicClock;
/// let a = clock.now();
/// let b = clock.now();
/// assert!(b >= a);
/// assert_eq!(clock.frequency(), 1_000_000_000);
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MonotonicClock;

impl Clock for MonotonicClock {
    #[inline(always)]
    fn now(&self) -> i64 {
        monotonic_nanos()
    }

    #[inline(always)]
    fn frequency(&self) -> i64 {
        NANOS_PER_SEC
    }
}

/// Returns the nanoseconds elapsed since the process-local epoch.
///
/// Saturates at `i64::MAX`, roughly 292 years after the first call.
#[inline(always)]
pub fn monotonic_nanos() -> i64 {
    let epoch = MONOTONIC_EPOCH.get_or_init(Instant::now);
    i64::try_from(epoch.elapsed().as_nanos()).unwrap_or(i64::MAX)
}

/// A clock that only moves when told to.
///
/// Useful for driving the engine deterministically: refills happen exactly
/// when [`ManualClock::advance`] says time passed.
///
/// # Example
///
/// ```rust
/// use byte_throttle::{Clock, ManualClock};
/// use std::time::Duration;
///
/// let clock = ManualClock::new();
/// clock.advance(Duration::from_millis(250));
/// assert_eq!(clock.now(), 250_000_000);
/// ```
#[derive(Debug)]
pub struct ManualClock {
    ticks: AtomicI64,
    frequency: i64,
}

impl ManualClock {
    /// Creates a nanosecond-resolution manual clock starting at zero.
    pub const fn new() -> Self {
        Self::with_frequency(NANOS_PER_SEC)
    }

    /// Creates a manual clock ticking `frequency` times per second.
    ///
    /// # Panics
    ///
    /// Panics if `frequency` is not positive.
    pub const fn with_frequency(frequency: i64) -> Self {
        assert!(frequency > 0, "clock frequency must be positive");
        Self {
            ticks: AtomicI64::new(0),
            frequency,
        }
    }

    /// Moves the clock forward by `by`, rounded down to whole ticks.
    pub fn advance(&self, by: Duration) {
        let ticks = by.as_nanos() * self.frequency as u128 / NANOS_PER_SEC as u128;
        self.advance_ticks(i64::try_from(ticks).unwrap_or(i64::MAX));
    }

    /// Moves the clock forward by a raw tick count. Negative values are ignored.
    pub fn advance_ticks(&self, ticks: i64) {
        if ticks > 0 {
            let _ = self
                .ticks
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |t| {
                    Some(t.saturating_add(ticks))
                });
        }
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> i64 {
        self.ticks.load(Ordering::Acquire)
    }

    fn frequency(&self) -> i64 {
        self.frequency
    }
}

/// CPU relaxation hint for spin loops.
///
/// - **x86_64**: PAUSE
/// - **ARM64**: YIELD (ISB on some targets)
/// - **Others**: whatever `spin_loop` lowers to, possibly nothing
#[inline(always)]
pub fn cpu_relax() {
    std::hint::spin_loop();
}

/// Exponential backoff for lost debit races.
///
/// ```text
///     Attempt 1..=6: spin 1, 2, 4 .. 32 times with cpu_relax()
///     Attempt 7+:    caller yields to the async scheduler
/// ```
#[derive(Debug, Clone, Default)]
pub(crate) struct Backoff {
    step: u32,
}

impl Backoff {
    /// Number of spin rounds before asking the caller to yield.
    const SPIN_LIMIT: u32 = 6;

    pub(crate) fn new() -> Self {
        Self { step: 0 }
    }

    /// Spins for the current step. Returns `true` once spinning is exhausted
    /// and the caller should yield to its scheduler instead.
    #[inline]
    pub(crate) fn snooze(&mut self) -> bool {
        if self.step < Self::SPIN_LIMIT {
            for _ in 0..(1u32 << self.step) {
                cpu_relax();
            }
            self.step += 1;
            false
        } else {
            true
        }
    }

    #[inline]
    pub(crate) fn reset(&mut self) {
        self.step = 0;
    }
}
