//! # Throttle Module
//!
//! Internal implementation of the byte-rate engine.
//!
//! ## Module Structure
//!
//! ```text
//!     throttle/
//!     ├── mod.rs          (module organization)
//!     ├── config.rs       (rate and burst, atomically replaced)
//!     ├── core.rs         (token bucket engine and per-stream state)
//!     ├── metrics.rs      (admission and delay counters)
//!     └── utils.rs        (clocks and spin helpers)
//! ```
//!
//! ## Architecture Flow
//!
//! ```text
//!     account_or_wait(state, n)
//!          │
//!          ▼
//!     ┌──────────┐
//!     │  Config  │ ◄── rate / capacity snapshot
//!     └────┬─────┘
//!          ▼
//!     ┌──────────┐
//!     │   Core   │ ◄── refill claim, debit CAS
//!     └────┬─────┘
//!          │ short?
//!          ▼
//!     ┌──────────┐
//!     │  Delay   │ ◄── crate::delay
//!     └──────────┘
//! ```

mod config;
mod core;
mod metrics;
mod utils;

pub use self::config::{SharedThrottleConfig, ThrottleConfig};
pub use self::core::{Throttle, ThrottleState};
pub use self::metrics::ThrottleMetrics;
pub use self::utils::{
    cpu_relax, monotonic_nanos, Clock, ManualClock, MonotonicClock, NANOS_PER_SEC,
};
