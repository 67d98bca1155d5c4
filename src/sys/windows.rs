//! Windows primitives.
//!
//! ```text
//!     OsEvent          manual-reset event (CreateEventW)
//!     HighResTimer     waitable timer, high-resolution when the OS has it
//!     WaitRegistration thread-pool wait (CreateThreadpoolWait)
//! ```
//!
//! Thread-pool waits carry the registry token as their context, never a
//! pointer.

use super::OsHandle;
use crate::registry;
use std::ffi::c_void;
use std::io;
use std::ptr;
use std::time::Duration;
use windows_sys::Win32::Foundation::{
    CloseHandle, ERROR_NOT_ENOUGH_MEMORY, ERROR_NO_SYSTEM_RESOURCES, ERROR_TOO_MANY_OPEN_FILES,
    FALSE, HANDLE, TRUE, WAIT_FAILED, WAIT_OBJECT_0, WAIT_TIMEOUT,
};
use windows_sys::Win32::System::Threading::{
    CloseThreadpoolWait, CreateEventW, CreateThreadpoolWait, SetEvent, SetThreadpoolWait,
    WaitForSingleObject, WaitForThreadpoolWaitCallbacks, INFINITE, PTP_CALLBACK_INSTANCE,
    PTP_WAIT,
};

#[inline]
fn to_handle(handle: OsHandle) -> HANDLE {
    handle as HANDLE
}

#[inline]
fn is_null(handle: HANDLE) -> bool {
    handle as isize == 0
}

/// Signals a raw event handle.
///
/// # Safety
///
/// `handle` must be an open event handle.
pub(crate) unsafe fn signal_raw(handle: OsHandle) -> io::Result<()> {
    // SAFETY: forwarded to the caller.
    if unsafe { SetEvent(to_handle(handle)) } == 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// A manual-reset event: once set, it stays signaled.
#[derive(Debug)]
pub struct OsEvent {
    handle: HANDLE,
}

// SAFETY: event handles may be used and closed from any thread.
unsafe impl Send for OsEvent {}
// SAFETY: every operation on the handle is thread-safe in the kernel.
unsafe impl Sync for OsEvent {}

impl OsEvent {
    /// Creates an unsignaled event.
    pub fn new() -> io::Result<Self> {
        // SAFETY: null attributes and name are allowed.
        let handle = unsafe { CreateEventW(ptr::null(), TRUE, FALSE, ptr::null()) };
        if is_null(handle) {
            return Err(io::Error::last_os_error());
        }
        Ok(Self { handle })
    }

    /// Signals the event. Setting an already signaled event is a no-op.
    pub fn set(&self) -> io::Result<()> {
        // SAFETY: the handle is open for the lifetime of `self`.
        unsafe { signal_raw(self.as_raw()) }
    }

    /// Waits up to `timeout` for the event. Returns `true` if it is signaled.
    pub fn wait_timeout(&self, timeout: Duration) -> io::Result<bool> {
        let millis = u32::try_from(timeout.as_nanos().div_ceil(1_000_000))
            .unwrap_or(INFINITE - 1);
        // SAFETY: the handle is open for the lifetime of `self`.
        match unsafe { WaitForSingleObject(self.handle, millis) } {
            WAIT_OBJECT_0 => Ok(true),
            WAIT_TIMEOUT => Ok(false),
            WAIT_FAILED => Err(io::Error::last_os_error()),
            other => Err(io::Error::other(format!("unexpected wait result {other:#x}"))),
        }
    }

    /// Returns `true` if the event is signaled, without blocking.
    pub fn is_set(&self) -> io::Result<bool> {
        self.wait_timeout(Duration::ZERO)
    }

    /// Borrows the raw handle.
    pub fn as_raw(&self) -> OsHandle {
        self.handle as OsHandle
    }

    /// Gives up ownership of the handle. The caller must close it.
    pub fn into_raw(self) -> OsHandle {
        let handle = self.as_raw();
        std::mem::forget(self);
        handle
    }

    /// Takes ownership of a raw event handle.
    ///
    /// # Safety
    ///
    /// `handle` must be an open event handle that nothing else will close.
    pub unsafe fn from_raw(handle: OsHandle) -> Self {
        Self {
            handle: to_handle(handle),
        }
    }
}

impl Drop for OsEvent {
    fn drop(&mut self) {
        // SAFETY: owned handle, closed exactly once.
        unsafe { CloseHandle(self.handle) };
    }
}

#[cfg(feature = "high-resolution")]
pub(crate) use self::timer::HighResTimer;

#[cfg(feature = "high-resolution")]
mod timer {
    use super::*;
    use windows_sys::Win32::Foundation::ERROR_INVALID_PARAMETER;
    use windows_sys::Win32::System::Threading::{
        CancelWaitableTimer, CreateWaitableTimerExW, SetWaitableTimer,
        CREATE_WAITABLE_TIMER_HIGH_RESOLUTION, TIMER_ALL_ACCESS,
    };

    /// One-shot waitable timer.
    #[derive(Debug)]
    pub(crate) struct HighResTimer {
        handle: HANDLE,
    }

    // SAFETY: timer handles may be used and closed from any thread.
    unsafe impl Send for HighResTimer {}
    // SAFETY: every operation on the handle is thread-safe in the kernel.
    unsafe impl Sync for HighResTimer {}

    impl HighResTimer {
        /// Prefers a high-resolution timer; older systems reject the flag with
        /// `ERROR_INVALID_PARAMETER` and get a regular one.
        pub(crate) fn new() -> io::Result<Self> {
            match Self::create(CREATE_WAITABLE_TIMER_HIGH_RESOLUTION) {
                Err(err) if err.raw_os_error() == Some(ERROR_INVALID_PARAMETER as i32) => {
                    Self::create(0)
                }
                created => created,
            }
        }

        fn create(flags: u32) -> io::Result<Self> {
            // SAFETY: null attributes and name are allowed.
            let handle =
                unsafe { CreateWaitableTimerExW(ptr::null(), ptr::null(), flags, TIMER_ALL_ACCESS) };
            if is_null(handle) {
                return Err(io::Error::last_os_error());
            }
            Ok(Self { handle })
        }

        /// Sets the timer to fire once after `after`, in 100ns units, at least
        /// one unit.
        pub(crate) fn arm(&self, after: Duration) -> io::Result<()> {
            let units = i64::try_from(after.as_nanos().div_ceil(100))
                .unwrap_or(i64::MAX)
                .max(1);
            // Negative due time means relative.
            let due = -units;
            // SAFETY: the handle is open; `due` outlives the call.
            let ok = unsafe { SetWaitableTimer(self.handle, &due, 0, None, ptr::null(), FALSE) };
            if ok == 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        }

        pub(crate) fn cancel(&self) -> io::Result<()> {
            // SAFETY: the handle is open for the lifetime of `self`.
            if unsafe { CancelWaitableTimer(self.handle) } == 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        }

        pub(crate) fn as_raw(&self) -> OsHandle {
            self.handle as OsHandle
        }
    }

    impl Drop for HighResTimer {
        fn drop(&mut self) {
            // SAFETY: owned handle, closed exactly once.
            unsafe { CloseHandle(self.handle) };
        }
    }
}

unsafe extern "system" fn wait_callback(
    _instance: PTP_CALLBACK_INSTANCE,
    context: *mut c_void,
    _wait: PTP_WAIT,
    _result: u32,
) {
    registry::dispatch(context as usize as u64);
}

/// Runs the callback pinned under `token` once `handle` is signaled.
///
/// Dropping the registration unhooks the wait and blocks until any callback
/// already running has returned.
#[derive(Debug)]
pub(crate) struct WaitRegistration {
    wait: PTP_WAIT,
}

// SAFETY: thread-pool wait objects may be closed from any thread.
unsafe impl Send for WaitRegistration {}
// SAFETY: the registration exposes no shared-access operations.
unsafe impl Sync for WaitRegistration {}

impl WaitRegistration {
    pub(crate) fn new(handle: OsHandle, token: u64) -> io::Result<Self> {
        // SAFETY: the callback only reads the context as an integer.
        let wait = unsafe {
            CreateThreadpoolWait(Some(wait_callback), token as usize as *mut c_void, ptr::null())
        };
        if wait as usize == 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: `wait` was just created; a null timeout waits forever.
        unsafe { SetThreadpoolWait(wait, to_handle(handle), ptr::null()) };
        Ok(Self { wait })
    }

    /// Same as [`WaitRegistration::new`]; thread-pool waits never duplicate
    /// the handle.
    ///
    /// # Safety
    ///
    /// `handle` must stay open until the registration is dropped.
    #[cfg_attr(not(feature = "high-resolution"), allow(dead_code))]
    pub(crate) unsafe fn borrowed(handle: OsHandle, token: u64) -> io::Result<Self> {
        Self::new(handle, token)
    }
}

/// Returns `true` if `err` means the process ran out of handles or the
/// kernel objects behind them.
#[cfg_attr(not(feature = "high-resolution"), allow(dead_code))]
pub(crate) fn is_handle_exhaustion(err: &io::Error) -> bool {
    matches!(
        err.raw_os_error().map(|code| code as u32),
        Some(ERROR_TOO_MANY_OPEN_FILES | ERROR_NO_SYSTEM_RESOURCES | ERROR_NOT_ENOUGH_MEMORY)
    )
}

impl Drop for WaitRegistration {
    fn drop(&mut self) {
        // SAFETY: the wait object is owned and closed exactly once, after
        // being unhooked and drained.
        unsafe {
            SetThreadpoolWait(self.wait, 0 as HANDLE, ptr::null());
            WaitForThreadpoolWaitCallbacks(self.wait, TRUE);
            CloseThreadpoolWait(self.wait);
        }
    }
}
