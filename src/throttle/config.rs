//! # Throttle Configuration
//!
//! The rate configuration is one process-wide value shared by every stream.
//! It is stored as two atomics that are each replaced whole, never mutated in
//! place:
//!
//! ```text
//!     SharedThrottleConfig
//!     ┌──────────────────────────────┐
//!     │ rate_bytes_per_sec : i64     │ ← 0 disables throttling
//!     │ capacity_bytes     : i64     │ ← burst; defaults to the rate
//!     └──────────────────────────────┘
//!              ▲             │
//!     configure()            └──► snapshot() (non-blocking)
//! ```
//!
//! Readers never see a torn value of a single field. A reader racing a
//! `configure` call may pair the new rate with the old capacity (or the
//! reverse); the next snapshot converges.

use crate::error::{Result, ThrottleError};
use std::sync::atomic::{AtomicI64, Ordering};
use tracing::info;

/// A consistent-per-field snapshot of the throttle configuration.
///
/// # Example
///
/// ```rust
/// use byte_throttle::ThrottleConfig;
///
/// // 1 MiB/s sustained, 4 MiB burst.
/// let config = ThrottleConfig::per_second(1 << 20).with_burst(4 << 20);
/// assert!(config.validate().is_ok());
/// assert_eq!(config.capacity_bytes, 4 << 20);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ThrottleConfig {
    /// Sustained rate in bytes per second. `0` disables throttling.
    pub rate_bytes_per_sec: i64,

    /// Maximum number of banked bytes (burst allowance).
    pub capacity_bytes: i64,
}

impl ThrottleConfig {
    /// A configuration that lets everything through.
    pub const fn disabled() -> Self {
        Self {
            rate_bytes_per_sec: 0,
            capacity_bytes: 0,
        }
    }

    /// Throttles to `rate_bytes_per_sec` with a burst equal to one second of
    /// traffic.
    pub const fn per_second(rate_bytes_per_sec: i64) -> Self {
        Self {
            rate_bytes_per_sec,
            capacity_bytes: rate_bytes_per_sec,
        }
    }

    /// Builds a configuration from the boundary-style arguments: the burst
    /// defaults to the rate when absent.
    pub const fn from_parts(rate_bytes_per_sec: i64, burst_bytes: Option<i64>) -> Self {
        let capacity_bytes = match burst_bytes {
            Some(burst) => burst,
            None => rate_bytes_per_sec,
        };
        Self {
            rate_bytes_per_sec,
            capacity_bytes,
        }
    }

    /// Overrides the burst capacity.
    pub const fn with_burst(mut self, burst_bytes: i64) -> Self {
        self.capacity_bytes = burst_bytes;
        self
    }

    /// Returns `true` if throttling is turned off.
    #[inline]
    pub const fn is_disabled(&self) -> bool {
        self.rate_bytes_per_sec == 0
    }

    /// Checks the configuration for values the engine cannot honor.
    ///
    /// # Errors
    ///
    /// Returns [`ThrottleError::InvalidArgument`] if:
    /// - the rate is negative
    /// - the burst is negative
    /// - the burst is zero while throttling is enabled (nothing could ever be
    ///   admitted)
    ///
    /// # Example
    ///
    /// ```rust
    /// use byte_throttle::ThrottleConfig;
    ///
    /// assert!(ThrottleConfig::per_second(-1).validate().is_err());
    /// assert!(ThrottleConfig::disabled().validate().is_ok());
    /// ```
    pub fn validate(&self) -> Result<()> {
        if self.rate_bytes_per_sec < 0 {
            return Err(ThrottleError::invalid(
                "rate_bytes_per_sec",
                "must not be negative",
            ));
        }
        if self.capacity_bytes < 0 {
            return Err(ThrottleError::invalid("burst_bytes", "must not be negative"));
        }
        if self.rate_bytes_per_sec > 0 && self.capacity_bytes == 0 {
            return Err(ThrottleError::invalid(
                "burst_bytes",
                "must be positive while throttling is enabled",
            ));
        }
        Ok(())
    }
}

/// The atomically replaced store behind [`ThrottleConfig`].
///
/// One instance lives for the whole process behind
/// [`Throttle::shared`](crate::Throttle::shared); private engines own their
/// own.
#[derive(Debug, Default)]
pub struct SharedThrottleConfig {
    rate_bytes_per_sec: AtomicI64,
    capacity_bytes: AtomicI64,
}

impl SharedThrottleConfig {
    /// Creates a store with throttling disabled.
    pub const fn new() -> Self {
        Self {
            rate_bytes_per_sec: AtomicI64::new(0),
            capacity_bytes: AtomicI64::new(0),
        }
    }

    /// Creates a store holding `config` without validating it.
    pub(crate) const fn with_config(config: ThrottleConfig) -> Self {
        Self {
            rate_bytes_per_sec: AtomicI64::new(config.rate_bytes_per_sec),
            capacity_bytes: AtomicI64::new(config.capacity_bytes),
        }
    }

    /// Replaces the rate and capacity.
    ///
    /// In-flight operations pick the new values up on their next iteration.
    ///
    /// # Errors
    ///
    /// See [`ThrottleConfig::validate`]. A rejected configuration leaves the
    /// previous one in place.
    pub fn configure(&self, rate_bytes_per_sec: i64, burst_bytes: Option<i64>) -> Result<()> {
        self.store(ThrottleConfig::from_parts(rate_bytes_per_sec, burst_bytes))
    }

    /// Validates and stores a whole configuration.
    pub fn store(&self, config: ThrottleConfig) -> Result<()> {
        config.validate()?;

        self.rate_bytes_per_sec
            .swap(config.rate_bytes_per_sec, Ordering::AcqRel);
        self.capacity_bytes
            .swap(config.capacity_bytes, Ordering::AcqRel);

        info!(
            rate_bytes_per_sec = config.rate_bytes_per_sec,
            capacity_bytes = config.capacity_bytes,
            "throttle configuration replaced"
        );
        Ok(())
    }

    /// Non-blocking snapshot of the current values.
    #[inline]
    pub fn snapshot(&self) -> ThrottleConfig {
        ThrottleConfig {
            rate_bytes_per_sec: self.rate_bytes_per_sec.load(Ordering::Acquire),
            capacity_bytes: self.capacity_bytes.load(Ordering::Acquire),
        }
    }

    /// Current rate in bytes per second.
    #[inline]
    pub fn rate_bytes_per_sec(&self) -> i64 {
        self.rate_bytes_per_sec.load(Ordering::Acquire)
    }

    /// Current burst capacity in bytes.
    #[inline]
    pub fn capacity_bytes(&self) -> i64 {
        self.capacity_bytes.load(Ordering::Acquire)
    }
}
