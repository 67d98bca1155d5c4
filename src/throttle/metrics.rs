//! Counters describing how hard an engine is throttling.
//!
//! ```text
//!     Throttle Metrics:
//!     ┌─────────────────────────────────────┐
//!     │  Admitted: 512.0 MiB in 16384 calls │
//!     │  Waits: 230 (avg 41.7ms)            │
//!     │  Cancelled: 2                       │
//!     │  Contended retries: 12              │
//!     └─────────────────────────────────────┘
//! ```

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Live counters owned by an engine. Relaxed ordering throughout: these are
/// statistics, never used for admission decisions.
#[derive(Debug, Default)]
pub(crate) struct ThrottleCounters {
    admitted_bytes: AtomicU64,
    admissions: AtomicU64,
    waits: AtomicU64,
    delay_ms: AtomicU64,
    cancellations: AtomicU64,
    contended_retries: AtomicU64,
}

impl ThrottleCounters {
    #[inline]
    pub(crate) fn on_admitted(&self, bytes: i64) {
        self.admitted_bytes
            .fetch_add(bytes.max(0) as u64, Ordering::Relaxed);
        self.admissions.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn on_wait(&self, delay_ms: u64) {
        self.waits.fetch_add(1, Ordering::Relaxed);
        self.delay_ms.fetch_add(delay_ms, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn on_cancelled(&self) {
        self.cancellations.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn on_contention(&self) {
        self.contended_retries.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> ThrottleMetrics {
        ThrottleMetrics {
            admitted_bytes: self.admitted_bytes.load(Ordering::Relaxed),
            admissions: self.admissions.load(Ordering::Relaxed),
            waits: self.waits.load(Ordering::Relaxed),
            delay_ms: self.delay_ms.load(Ordering::Relaxed),
            cancellations: self.cancellations.load(Ordering::Relaxed),
            contended_retries: self.contended_retries.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn reset(&self) {
        self.admitted_bytes.store(0, Ordering::Relaxed);
        self.admissions.store(0, Ordering::Relaxed);
        self.waits.store(0, Ordering::Relaxed);
        self.delay_ms.store(0, Ordering::Relaxed);
        self.cancellations.store(0, Ordering::Relaxed);
        self.contended_retries.store(0, Ordering::Relaxed);
    }
}

/// Point-in-time view of an engine's counters.
///
/// ## Example
///
/// ```rust
/// use byte_throttle::Throttle;
///
/// let throttle = Throttle::builder().rate(1 << 20).build().unwrap();
/// let metrics = throttle.metrics();
/// assert_eq!(metrics.admitted_bytes, 0);
/// println!("{}", metrics.summary());
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ThrottleMetrics {
    /// Bytes admitted by throttled calls. Calls made while throttling was
    /// disabled are not counted.
    pub admitted_bytes: u64,

    /// Number of successful debits. A request larger than the burst capacity
    /// is admitted in several debits.
    pub admissions: u64,

    /// Number of delays scheduled because the bucket ran short.
    pub waits: u64,

    /// Sum of the scheduled delays in milliseconds.
    pub delay_ms: u64,

    /// Calls that ended with a cancellation.
    pub cancellations: u64,

    /// Refill claims or debits lost to a concurrent caller and retried.
    pub contended_retries: u64,
}

impl ThrottleMetrics {
    /// Mean scheduled delay per wait, in milliseconds.
    #[inline]
    pub fn average_delay_ms(&self) -> f64 {
        if self.waits == 0 {
            0.0
        } else {
            self.delay_ms as f64 / self.waits as f64
        }
    }

    /// Lost races per successful debit.
    #[inline]
    pub fn contention_ratio(&self) -> f64 {
        if self.admissions == 0 {
            0.0
        } else {
            self.contended_retries as f64 / self.admissions as f64
        }
    }

    /// Returns `true` once any caller had to wait.
    #[inline]
    pub fn is_throttling(&self) -> bool {
        self.waits > 0
    }

    /// Human-readable multi-line report.
    pub fn summary(&self) -> String {
        format!(
            "Throttle Metrics:\n\
             ├─ Admitted: {} bytes in {} debits\n\
             ├─ Waits: {} (avg {:.1}ms, total {}ms)\n\
             ├─ Cancelled: {}\n\
             └─ Contended retries: {} ({:.3} per debit)",
            self.admitted_bytes,
            self.admissions,
            self.waits,
            self.average_delay_ms(),
            self.delay_ms,
            self.cancellations,
            self.contended_retries,
            self.contention_ratio(),
        )
    }
}

impl fmt::Display for ThrottleMetrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.summary())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_snapshot_and_reset() {
        let counters = ThrottleCounters::default();
        counters.on_admitted(100);
        counters.on_admitted(50);
        counters.on_wait(10);
        counters.on_wait(30);
        counters.on_cancelled();
        counters.on_contention();

        let metrics = counters.snapshot();
        assert_eq!(metrics.admitted_bytes, 150);
        assert_eq!(metrics.admissions, 2);
        assert_eq!(metrics.waits, 2);
        assert_eq!(metrics.delay_ms, 40);
        assert_eq!(metrics.cancellations, 1);
        assert_eq!(metrics.contended_retries, 1);
        assert_eq!(metrics.average_delay_ms(), 20.0);
        assert_eq!(metrics.contention_ratio(), 0.5);
        assert!(metrics.is_throttling());

        counters.reset();
        assert_eq!(counters.snapshot(), ThrottleMetrics::default());
    }

    #[test]
    fn test_empty_ratios() {
        let metrics = ThrottleMetrics::default();
        assert_eq!(metrics.average_delay_ms(), 0.0);
        assert_eq!(metrics.contention_ratio(), 0.0);
        assert!(!metrics.is_throttling());
    }

    #[test]
    fn test_summary_format() {
        let metrics = ThrottleMetrics {
            admitted_bytes: 4096,
            admissions: 4,
            waits: 1,
            delay_ms: 12,
            cancellations: 0,
            contended_retries: 0,
        };
        let summary = metrics.to_string();
        assert!(summary.contains("Admitted: 4096 bytes in 4 debits"));
        assert!(summary.contains("avg 12.0ms"));
    }
}
