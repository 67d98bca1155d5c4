//! # Core Throttle Implementation
//!
//! This module implements the byte-rate engine: a lock-free token bucket
//! whose balance lives in caller-owned memory ([`ThrottleState`]) and whose
//! rate comes from one shared configuration.
//!
//! ## The Token Bucket
//!
//! ```text
//!     capacity ┬─────────────────────────────┐
//!              │░░░░░░░░░░░░                 │ ◄── refill: elapsed × rate
//!              │░░░░░░░░░░░░░░░░░░░          │
//!            0 ┴─────────────────────────────┘
//!                           │
//!                           └──► debit: amount_bytes
//! ```
//!
//! ## One Iteration of `account_or_wait`
//!
//! ```text
//!     cancelled? ──yes──► Err(Cancelled)
//!         │
//!     now > last_refill_tick?
//!         │ yes
//!         ▼
//!     CAS last_refill_tick: last ─► now   (claim the elapsed window)
//!         │ lost ──► retry
//!         ▼ won
//!     tokens = min(capacity, tokens + refill)
//!         │
//!     tokens >= amount?
//!         ├─ yes ─► CAS tokens: t ─► t - amount ─► admitted
//!         │                     lost ─► backoff, retry
//!         └─ no ──► wait ceil(deficit × 1000 / rate) ms, retry
//! ```
//!
//! The claim step makes sure exactly one caller credits a given elapsed
//! window, so concurrent callers never double-refill the bucket.

use super::{
    config::{SharedThrottleConfig, ThrottleConfig},
    metrics::{ThrottleCounters, ThrottleMetrics},
    utils::{cpu_relax, Backoff, Clock, MonotonicClock},
};
use crate::delay::{DelayKind, NativeDelay};
use crate::error::{Result, ThrottleError};
use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::OnceLock;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// Maximum number of CAS attempts [`Throttle::try_account`] makes before
/// reporting the bucket as unavailable.
const MAX_CAS_RETRIES: usize = 16;

/// Shortest delay ever scheduled, so a deficit that rounds to nothing still
/// yields instead of spinning.
const MIN_DELAY_MS: u64 = 1;

/// Per-stream token balance.
///
/// The layout is fixed: two naturally aligned 64-bit integers,
/// `available_tokens` then `last_refill_tick`, 16 bytes in total. Foreign
/// callers may allocate it themselves and pass its address across the C ABI.
///
/// ```text
///     offset 0  ┌──────────────────────────┐
///               │ available_tokens  : i64  │
///     offset 8  ├──────────────────────────┤
///               │ last_refill_tick  : i64  │
///     offset 16 └──────────────────────────┘
/// ```
///
/// A state is one budget. Sharing a `&ThrottleState` between tasks makes them
/// share that budget; separate states are independent.
#[repr(C, align(8))]
pub struct ThrottleState {
    available_tokens: AtomicI64,
    last_refill_tick: AtomicI64,
}

const _: () = {
    assert!(std::mem::size_of::<ThrottleState>() == 16);
    assert!(std::mem::align_of::<ThrottleState>() == 8);
    assert!(std::mem::offset_of!(ThrottleState, available_tokens) == 0);
    assert!(std::mem::offset_of!(ThrottleState, last_refill_tick) == 8);
};

impl ThrottleState {
    /// Creates a state holding a full burst, last refilled at `now`.
    pub const fn new(capacity_bytes: i64, now: i64) -> Self {
        Self {
            available_tokens: AtomicI64::new(capacity_bytes),
            last_refill_tick: AtomicI64::new(now),
        }
    }

    /// An empty state at tick zero. It fills at the configured rate from the
    /// first call onward.
    pub const fn zeroed() -> Self {
        Self::new(0, 0)
    }

    /// Banked bytes at this instant.
    #[inline]
    pub fn available_tokens(&self) -> i64 {
        self.available_tokens.load(Ordering::Acquire)
    }

    /// Clock reading of the last refill.
    #[inline]
    pub fn last_refill_tick(&self) -> i64 {
        self.last_refill_tick.load(Ordering::Acquire)
    }

    /// Overwrites both fields. Not atomic as a pair; only use it while no
    /// other call is driving this state.
    pub fn reset(&self, capacity_bytes: i64, now: i64) {
        self.last_refill_tick.store(now, Ordering::Release);
        self.available_tokens.store(capacity_bytes, Ordering::Release);
    }
}

impl Default for ThrottleState {
    fn default() -> Self {
        Self::zeroed()
    }
}

impl fmt::Debug for ThrottleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThrottleState")
            .field("available_tokens", &self.available_tokens())
            .field("last_refill_tick", &self.last_refill_tick())
            .finish()
    }
}

/// Outcome of a single refill-and-debit pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Debit {
    Admitted,
    /// Lost a CAS to another caller; try again right away.
    Contended,
    Insufficient {
        available: i64,
    },
}

/// Bytes earned over `elapsed_ticks`, rounded down.
#[inline]
pub(crate) fn refill_for_elapsed(
    elapsed_ticks: i64,
    rate_bytes_per_sec: i64,
    frequency: i64,
) -> i64 {
    if elapsed_ticks <= 0 || rate_bytes_per_sec <= 0 || frequency <= 0 {
        return 0;
    }
    let refill = elapsed_ticks as i128 * rate_bytes_per_sec as i128 / frequency as i128;
    refill.min(i64::MAX as i128) as i64
}

/// Milliseconds until `deficit_bytes` have accrued, rounded up, at least
/// [`MIN_DELAY_MS`].
#[inline]
pub(crate) fn delay_for_deficit(deficit_bytes: i64, rate_bytes_per_sec: i64) -> u64 {
    let rate = rate_bytes_per_sec.max(1) as i128;
    let deficit = deficit_bytes.max(0) as i128;
    let millis = (deficit * 1000 + rate - 1) / rate;
    millis.clamp(MIN_DELAY_MS as i128, u64::MAX as i128) as u64
}

/// The byte-rate engine.
///
/// Holds the rate configuration, the clock and the delay flavor. It holds no
/// token balances: those live in [`ThrottleState`]s the caller owns.
///
/// Most programs use the process-wide instance from [`Throttle::shared`];
/// [`Throttle::builder`] makes isolated engines.
///
/// ## Example
///
/// ```rust
/// use byte_throttle::Throttle;
/// use tokio_util::sync::CancellationToken;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> byte_throttle::Result<()> {
/// let throttle = Throttle::builder()
///     .rate(1_000_000)
///     .burst(2_000_000)
///     .build()?;
/// let state = throttle.new_state();
/// let cancel = CancellationToken::new();
///
/// // Within the burst: admitted without waiting.
/// throttle.account_or_wait(&state, 1_500_000, &cancel).await?;
/// assert_eq!(state.available_tokens(), 500_000);
/// # Ok(())
/// # }
/// ```
pub struct Throttle<C = MonotonicClock> {
    config: SharedThrottleConfig,
    clock: C,
    delay_kind: DelayKind,
    counters: ThrottleCounters,
}

static SHARED: OnceLock<Throttle> = OnceLock::new();

impl Throttle<MonotonicClock> {
    /// Creates an engine with throttling disabled, the monotonic clock and
    /// the default delay kind.
    pub fn new() -> Self {
        Self::from_parts(ThrottleConfig::disabled(), MonotonicClock, DelayKind::default())
    }

    /// Starts building an engine.
    pub fn builder() -> crate::ThrottleBuilder {
        crate::ThrottleBuilder::new()
    }

    /// The process-wide engine used by the free functions and the C ABI.
    ///
    /// Throttling is disabled until someone configures a rate.
    pub fn shared() -> &'static Throttle {
        SHARED.get_or_init(Throttle::new)
    }
}

impl Default for Throttle<MonotonicClock> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: Clock> Throttle<C> {
    /// Assembles an engine from an already validated configuration.
    pub(crate) fn from_parts(config: ThrottleConfig, clock: C, delay_kind: DelayKind) -> Self {
        Self {
            config: SharedThrottleConfig::with_config(config),
            clock,
            delay_kind: delay_kind.effective(),
            counters: ThrottleCounters::default(),
        }
    }

    /// Replaces the rate and burst. `burst_bytes` defaults to the rate.
    ///
    /// # Errors
    ///
    /// [`ThrottleError::InvalidArgument`] for a negative rate or burst, or a
    /// zero burst with a positive rate.
    pub fn configure(&self, rate_bytes_per_sec: i64, burst_bytes: Option<i64>) -> Result<()> {
        self.config.configure(rate_bytes_per_sec, burst_bytes)
    }

    /// Snapshot of the current rate and capacity.
    #[inline]
    pub fn read_config(&self) -> ThrottleConfig {
        self.config.snapshot()
    }

    /// The configuration store backing this engine.
    pub fn config(&self) -> &SharedThrottleConfig {
        &self.config
    }

    /// The clock refills are measured against.
    pub fn clock(&self) -> &C {
        &self.clock
    }

    /// The timer used when a caller has to wait.
    pub fn delay_kind(&self) -> DelayKind {
        self.delay_kind
    }

    /// A fresh state holding a full burst.
    pub fn new_state(&self) -> ThrottleState {
        ThrottleState::new(self.config.capacity_bytes(), self.clock.now())
    }

    /// Refills `state` to a full burst as of now.
    pub fn reset_state(&self, state: &ThrottleState) {
        state.reset(self.config.capacity_bytes(), self.clock.now());
    }

    /// Snapshot of this engine's counters.
    pub fn metrics(&self) -> ThrottleMetrics {
        self.counters.snapshot()
    }

    /// Zeroes the counters.
    pub fn reset_metrics(&self) {
        self.counters.reset();
    }

    /// Waits until `amount_bytes` can be debited from `state`, then debits
    /// them.
    ///
    /// Returns immediately, touching nothing, if `amount_bytes <= 0` or the
    /// rate is zero. A request larger than the burst capacity is admitted in
    /// capacity-sized pieces.
    ///
    /// There is no timeout: the call waits at the configured rate until it is
    /// admitted or `cancel` fires. Cancellation is checked before every
    /// attempt and during every wait; once seen, nothing more is debited.
    ///
    /// # Errors
    ///
    /// - [`ThrottleError::Cancelled`] if `cancel` fired first.
    /// - [`ThrottleError::PlatformResourceExhausted`] if a high-resolution
    ///   delay could not create its OS objects.
    /// - [`ThrottleError::UnexpectedFailure`] for delay misuse, such as a
    ///   portable delay outside a Tokio runtime.
    pub async fn account_or_wait(
        &self,
        state: &ThrottleState,
        amount_bytes: i64,
        cancel: &CancellationToken,
    ) -> Result<()> {
        if amount_bytes <= 0 || self.config.rate_bytes_per_sec() == 0 {
            return Ok(());
        }

        let mut remaining = amount_bytes;
        let mut backoff = Backoff::new();
        let mut delay: Option<NativeDelay> = None;

        loop {
            if cancel.is_cancelled() {
                self.counters.on_cancelled();
                debug!(remaining, "throttled request cancelled");
                return Err(ThrottleError::Cancelled);
            }

            let config = self.config.snapshot();
            if config.is_disabled() {
                return Ok(());
            }

            let chunk = remaining.min(config.capacity_bytes.max(1));
            match self.try_debit(state, chunk, config) {
                Debit::Admitted => {
                    self.counters.on_admitted(chunk);
                    remaining -= chunk;
                    if remaining == 0 {
                        return Ok(());
                    }
                    backoff.reset();
                }
                Debit::Contended => {
                    self.counters.on_contention();
                    if backoff.snooze() {
                        tokio::task::yield_now().await;
                    }
                }
                Debit::Insufficient { available } => {
                    let wait_ms = delay_for_deficit(chunk - available, config.rate_bytes_per_sec);
                    self.counters.on_wait(wait_ms);
                    trace!(chunk, available, wait_ms, "bucket short, delaying");

                    let delay = delay.get_or_insert_with(|| NativeDelay::new(self.delay_kind));
                    let outcome = match delay.wait(Duration::from_millis(wait_ms), cancel) {
                        Ok(wait) => wait.await,
                        Err(err) => Err(err),
                    };
                    if let Err(err) = outcome {
                        if err.is_cancelled() {
                            self.counters.on_cancelled();
                            debug!(remaining, "throttled request cancelled during delay");
                        } else {
                            warn!(%err, "throttle delay failed");
                        }
                        return Err(err);
                    }
                    backoff.reset();
                }
            }
        }
    }

    /// Debits `amount_bytes` if they are available right now.
    ///
    /// Never waits. Returns `true` without touching `state` when
    /// `amount_bytes <= 0` or throttling is disabled, and `false` for a request
    /// larger than the burst capacity.
    ///
    /// # Example
    ///
    /// ```rust
    /// use byte_throttle::Throttle;
    ///
    /// let throttle = Throttle::builder().rate(1000).build().unwrap();
    /// let state = throttle.new_state();
    ///
    /// assert!(throttle.try_account(&state, 600));
    /// assert!(!throttle.try_account(&state, 600));
    /// ```
    pub fn try_account(&self, state: &ThrottleState, amount_bytes: i64) -> bool {
        if amount_bytes <= 0 {
            return true;
        }

        for _ in 0..MAX_CAS_RETRIES {
            let config = self.config.snapshot();
            if config.is_disabled() {
                return true;
            }
            match self.try_debit(state, amount_bytes, config) {
                Debit::Admitted => {
                    self.counters.on_admitted(amount_bytes);
                    return true;
                }
                Debit::Insufficient { .. } => return false,
                Debit::Contended => {
                    self.counters.on_contention();
                    cpu_relax();
                }
            }
        }

        warn!("try_account CAS retry limit reached");
        false
    }

    /// One refill-then-debit pass.
    fn try_debit(&self, state: &ThrottleState, amount: i64, config: ThrottleConfig) -> Debit {
        let capacity = config.capacity_bytes;
        let now = self.clock.now();
        let last = state.last_refill_tick.load(Ordering::Acquire);

        if now > last {
            let refill = refill_for_elapsed(
                now - last,
                config.rate_bytes_per_sec,
                self.clock.frequency(),
            );
            // Leave the tick alone until a whole byte has accrued, so slow
            // rates keep their fractional credit.
            if refill > 0 {
                if state
                    .last_refill_tick
                    .compare_exchange(last, now, Ordering::AcqRel, Ordering::Acquire)
                    .is_err()
                {
                    return Debit::Contended;
                }
                let _ = state
                    .available_tokens
                    .fetch_update(Ordering::AcqRel, Ordering::Acquire, |tokens| {
                        Some(tokens.saturating_add(refill).min(capacity))
                    });
            }
        }

        let mut available = state.available_tokens.load(Ordering::Acquire);
        if available > capacity {
            // The capacity was lowered since this state last refilled.
            if state
                .available_tokens
                .compare_exchange(available, capacity, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                return Debit::Contended;
            }
            available = capacity;
        }

        if available < amount {
            return Debit::Insufficient {
                available: available.max(0),
            };
        }

        match state.available_tokens.compare_exchange(
            available,
            available - amount,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => Debit::Admitted,
            Err(_) => Debit::Contended,
        }
    }
}

impl<C> fmt::Debug for Throttle<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Throttle")
            .field("config", &self.config.snapshot())
            .field("delay_kind", &self.delay_kind)
            .finish_non_exhaustive()
    }
}
