//! OS handles, events, timers and wait registrations.
//!
//! Each platform exposes the same surface:
//!
//! | Item               | Linux / Android          | Windows                    |
//! |--------------------|--------------------------|----------------------------|
//! | [`OsEvent`]        | `eventfd`                | manual-reset event         |
//! | `HighResTimer`     | `timerfd` (monotonic)    | high-resolution waitable   |
//! | `WaitRegistration` | epoll wait-pool thread   | thread-pool wait           |

#[cfg(any(target_os = "linux", target_os = "android"))]
mod linux;
#[cfg(any(target_os = "linux", target_os = "android"))]
use self::linux as imp;

#[cfg(windows)]
mod windows;
#[cfg(windows)]
use self::windows as imp;

pub use self::imp::OsEvent;
#[cfg(feature = "high-resolution")]
pub(crate) use self::imp::{is_handle_exhaustion, HighResTimer};
pub(crate) use self::imp::{signal_raw, WaitRegistration};

/// A pointer-sized native handle: a `HANDLE` on Windows, a file descriptor
/// elsewhere.
pub type OsHandle = isize;

/// The "no handle" value callers pass when they have nothing to hand over.
#[cfg(windows)]
pub const NO_HANDLE: OsHandle = 0;

/// The "no handle" value callers pass when they have nothing to hand over.
#[cfg(not(windows))]
pub const NO_HANDLE: OsHandle = -1;

/// Returns `true` if `handle` could name an open object.
#[inline]
pub fn is_valid_handle(handle: OsHandle) -> bool {
    if cfg!(windows) {
        handle != 0 && handle != -1
    } else {
        (0..=i32::MAX as OsHandle).contains(&handle)
    }
}
