//! Linux and Android primitives.
//!
//! ```text
//!     OsEvent          eventfd, signaled once its counter is non-zero
//!     HighResTimer     timerfd on CLOCK_MONOTONIC, one-shot
//!     WaitRegistration fd (own or dup'd) in the process-wide epoll wait pool
//!
//!     throttle-wait-pool thread
//!     ┌──────────────────────────────────────────────┐
//!     │ loop { epoll_wait ─► registry::dispatch(tok) }│
//!     └──────────────────────────────────────────────┘
//! ```
//!
//! Registrations are one-shot (`EPOLLONESHOT`): a handle fires its callback at
//! most once per registration, like a thread-pool wait on Windows.

use super::OsHandle;
use crate::registry;
use std::io;
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, IntoRawFd, OwnedFd, RawFd};
use std::sync::OnceLock;
use std::thread;
use std::time::Duration;
use tracing::{debug, error};

fn cvt(ret: libc::c_int) -> io::Result<libc::c_int> {
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret)
    }
}

fn raw_fd(handle: OsHandle) -> io::Result<RawFd> {
    RawFd::try_from(handle)
        .ok()
        .filter(|fd| *fd >= 0)
        .ok_or_else(|| io::Error::from_raw_os_error(libc::EBADF))
}

fn write_one(fd: RawFd) -> io::Result<()> {
    let one: u64 = 1;
    loop {
        // SAFETY: writes 8 bytes from a live u64.
        let n = unsafe {
            libc::write(
                fd,
                (&one as *const u64).cast::<libc::c_void>(),
                std::mem::size_of::<u64>(),
            )
        };
        if n == std::mem::size_of::<u64>() as isize {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        if n < 0 && err.kind() == io::ErrorKind::Interrupted {
            continue;
        }
        return Err(if n < 0 {
            err
        } else {
            io::Error::new(io::ErrorKind::WriteZero, "short eventfd write")
        });
    }
}

fn poll_readable(fd: RawFd, timeout: Duration) -> io::Result<bool> {
    let mut pfd = libc::pollfd {
        fd,
        events: libc::POLLIN,
        revents: 0,
    };
    let millis = timeout.as_nanos().div_ceil(1_000_000);
    let millis = libc::c_int::try_from(millis).unwrap_or(libc::c_int::MAX);
    loop {
        // SAFETY: `pfd` is a single valid pollfd.
        let ready = unsafe { libc::poll(&mut pfd, 1, millis) };
        if ready < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(err);
        }
        return Ok(ready > 0 && pfd.revents & libc::POLLIN != 0);
    }
}

/// Signals a raw event handle.
///
/// # Safety
///
/// `handle` must be an open eventfd (or any fd that accepts an 8-byte write).
pub(crate) unsafe fn signal_raw(handle: OsHandle) -> io::Result<()> {
    write_one(raw_fd(handle)?)
}

/// A manual-reset event: once set, it stays signaled.
///
/// Backed by an `eventfd`; "signaled" means readable.
#[derive(Debug)]
pub struct OsEvent {
    fd: OwnedFd,
}

impl OsEvent {
    /// Creates an unsignaled event.
    pub fn new() -> io::Result<Self> {
        // SAFETY: plain syscall; the result is checked before use.
        let fd = cvt(unsafe { libc::eventfd(0, libc::EFD_CLOEXEC) })?;
        // SAFETY: `fd` was just created and is owned by nobody else.
        Ok(Self {
            fd: unsafe { OwnedFd::from_raw_fd(fd) },
        })
    }

    /// Signals the event. Setting an already signaled event is a no-op.
    pub fn set(&self) -> io::Result<()> {
        write_one(self.fd.as_raw_fd())
    }

    /// Waits up to `timeout` for the event. Returns `true` if it is signaled.
    pub fn wait_timeout(&self, timeout: Duration) -> io::Result<bool> {
        poll_readable(self.fd.as_raw_fd(), timeout)
    }

    /// Returns `true` if the event is signaled, without blocking.
    pub fn is_set(&self) -> io::Result<bool> {
        self.wait_timeout(Duration::ZERO)
    }

    /// Borrows the raw handle.
    pub fn as_raw(&self) -> OsHandle {
        self.fd.as_raw_fd() as OsHandle
    }

    /// Gives up ownership of the handle. The caller must close it.
    pub fn into_raw(self) -> OsHandle {
        self.fd.into_raw_fd() as OsHandle
    }

    /// Takes ownership of a raw event handle.
    ///
    /// # Safety
    ///
    /// `handle` must be an open eventfd that nothing else will close.
    pub unsafe fn from_raw(handle: OsHandle) -> Self {
        Self {
            // SAFETY: forwarded to the caller.
            fd: unsafe { OwnedFd::from_raw_fd(handle as RawFd) },
        }
    }
}

/// One-shot monotonic timer.
#[cfg(feature = "high-resolution")]
#[derive(Debug)]
pub(crate) struct HighResTimer {
    fd: OwnedFd,
}

#[cfg(feature = "high-resolution")]
impl HighResTimer {
    pub(crate) fn new() -> io::Result<Self> {
        // SAFETY: plain syscall; the result is checked before use.
        let fd = cvt(unsafe {
            libc::timerfd_create(libc::CLOCK_MONOTONIC, libc::TFD_CLOEXEC | libc::TFD_NONBLOCK)
        })?;
        // SAFETY: `fd` was just created and is owned by nobody else.
        Ok(Self {
            fd: unsafe { OwnedFd::from_raw_fd(fd) },
        })
    }

    /// Sets the timer to fire once after `after`. An all-zero due time would
    /// disarm a timerfd, so it is raised to one nanosecond.
    pub(crate) fn arm(&self, after: Duration) -> io::Result<()> {
        let after = after.max(Duration::from_nanos(1));
        // SAFETY: itimerspec is plain old data; zero is a valid value.
        let mut spec: libc::itimerspec = unsafe { std::mem::zeroed() };
        spec.it_value.tv_sec = libc::time_t::try_from(after.as_secs()).unwrap_or(libc::time_t::MAX);
        spec.it_value.tv_nsec = after.subsec_nanos() as _;
        self.settime(&spec)
    }

    /// Disarms the timer. A timer that already fired stays readable.
    pub(crate) fn cancel(&self) -> io::Result<()> {
        // SAFETY: itimerspec is plain old data; zero disarms.
        let spec: libc::itimerspec = unsafe { std::mem::zeroed() };
        self.settime(&spec)
    }

    fn settime(&self, spec: &libc::itimerspec) -> io::Result<()> {
        // SAFETY: `spec` is valid for reads; the old value is not requested.
        cvt(unsafe { libc::timerfd_settime(self.fd.as_raw_fd(), 0, spec, std::ptr::null_mut()) })?;
        Ok(())
    }

    pub(crate) fn as_raw(&self) -> OsHandle {
        self.fd.as_raw_fd() as OsHandle
    }
}

/// Process-wide epoll instance and the thread draining it.
struct WaitPool {
    epoll: OwnedFd,
}

static WAIT_POOL: OnceLock<Result<WaitPool, i32>> = OnceLock::new();

impl WaitPool {
    const MAX_EVENTS: usize = 64;

    fn get() -> io::Result<&'static WaitPool> {
        match WAIT_POOL.get_or_init(Self::start) {
            Ok(pool) => Ok(pool),
            Err(code) => Err(io::Error::from_raw_os_error(*code)),
        }
    }

    fn start() -> Result<WaitPool, i32> {
        let errno = |err: io::Error| err.raw_os_error().unwrap_or(libc::ENOMEM);

        // SAFETY: plain syscall; the result is checked before use.
        let epfd = cvt(unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) }).map_err(errno)?;
        // SAFETY: `epfd` was just created and is owned by nobody else.
        let epoll = unsafe { OwnedFd::from_raw_fd(epfd) };

        // The pool lives in a static, so the fd outlives the thread.
        thread::Builder::new()
            .name("throttle-wait-pool".into())
            .spawn(move || Self::run(epfd))
            .map_err(errno)?;

        debug!(epfd, "started throttle wait pool");
        Ok(WaitPool { epoll })
    }

    fn run(epfd: RawFd) {
        let mut events = [libc::epoll_event { events: 0, u64: 0 }; Self::MAX_EVENTS];
        loop {
            // SAFETY: `events` has room for MAX_EVENTS entries.
            let ready = unsafe {
                libc::epoll_wait(epfd, events.as_mut_ptr(), Self::MAX_EVENTS as libc::c_int, -1)
            };
            if ready < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                error!(%err, "throttle wait pool stopped");
                return;
            }
            for event in &events[..ready as usize] {
                let token = event.u64;
                registry::dispatch(token);
            }
        }
    }
}

/// Returns `true` if `err` means the process or system ran out of fds.
#[cfg_attr(not(feature = "high-resolution"), allow(dead_code))]
pub(crate) fn is_handle_exhaustion(err: &io::Error) -> bool {
    matches!(err.raw_os_error(), Some(libc::EMFILE | libc::ENFILE))
}

/// The fd a registration keeps in the epoll set.
#[derive(Debug)]
enum Watched {
    /// A private duplicate, for handles the caller may close at any time.
    Owned(OwnedFd),
    /// The caller's own fd, which outlives the registration.
    Borrowed(RawFd),
}

impl Watched {
    fn raw(&self) -> RawFd {
        match self {
            Self::Owned(fd) => fd.as_raw_fd(),
            Self::Borrowed(fd) => *fd,
        }
    }
}

/// Runs the callback pinned under `token` once `handle` becomes readable.
///
/// Dropping the registration removes it from the pool; a callback that
/// already started may still be running at that point, which the registry's
/// token check makes harmless.
#[derive(Debug)]
pub(crate) struct WaitRegistration {
    fd: Watched,
    epoll: RawFd,
}

impl WaitRegistration {
    /// Watches a duplicate of `handle`, so the caller may close its own copy
    /// at any time.
    pub(crate) fn new(handle: OsHandle, token: u64) -> io::Result<Self> {
        // SAFETY: the fd is only borrowed long enough to duplicate it.
        let fd = unsafe { BorrowedFd::borrow_raw(raw_fd(handle)?) }.try_clone_to_owned()?;
        Self::register(Watched::Owned(fd), token)
    }

    /// Watches `handle` itself. Costs no extra fd.
    ///
    /// # Safety
    ///
    /// `handle` must stay open until the registration is dropped.
    #[cfg_attr(not(feature = "high-resolution"), allow(dead_code))]
    pub(crate) unsafe fn borrowed(handle: OsHandle, token: u64) -> io::Result<Self> {
        Self::register(Watched::Borrowed(raw_fd(handle)?), token)
    }

    fn register(fd: Watched, token: u64) -> io::Result<Self> {
        let pool = WaitPool::get()?;
        let mut event = libc::epoll_event {
            events: (libc::EPOLLIN | libc::EPOLLONESHOT) as u32,
            u64: token,
        };
        let epoll = pool.epoll.as_raw_fd();
        // SAFETY: both fds are open; `event` is valid for reads.
        cvt(unsafe { libc::epoll_ctl(epoll, libc::EPOLL_CTL_ADD, fd.raw(), &mut event) })?;

        Ok(Self { fd, epoll })
    }

    #[cfg(test)]
    pub(crate) fn watched(&self) -> OsHandle {
        self.fd.raw() as OsHandle
    }
}

impl Drop for WaitRegistration {
    fn drop(&mut self) {
        // SAFETY: both fds are still open; a null event is allowed for DEL.
        let removed = cvt(unsafe {
            libc::epoll_ctl(
                self.epoll,
                libc::EPOLL_CTL_DEL,
                self.fd.raw(),
                std::ptr::null_mut(),
            )
        });
        if let Err(err) = removed {
            debug!(%err, "wait registration already gone");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Pinned;
    use std::sync::mpsc;

    #[test]
    fn test_event_set_and_wait() {
        let event = OsEvent::new().unwrap();
        assert!(!event.is_set().unwrap());
        assert!(!event.wait_timeout(Duration::from_millis(5)).unwrap());

        event.set().unwrap();
        event.set().unwrap();
        assert!(event.is_set().unwrap());
        // Stays signaled.
        assert!(event.wait_timeout(Duration::from_millis(5)).unwrap());
    }

    #[test]
    fn test_event_raw_round_trip() {
        let event = OsEvent::new().unwrap();
        let raw = event.into_raw();
        // SAFETY: `raw` came from `into_raw` and is closed exactly once.
        unsafe { signal_raw(raw).unwrap() };
        let event = unsafe { OsEvent::from_raw(raw) };
        assert!(event.is_set().unwrap());
    }

    #[test]
    fn test_registration_fires_once_signaled() {
        let (tx, rx) = mpsc::channel();
        let pinned = Pinned::new(move || {
            let _ = tx.send(());
        });
        let event = OsEvent::new().unwrap();
        let _registration = WaitRegistration::new(event.as_raw(), pinned.token()).unwrap();

        assert!(rx.recv_timeout(Duration::from_millis(20)).is_err());
        event.set().unwrap();
        rx.recv_timeout(Duration::from_secs(2)).unwrap();
    }

    #[test]
    fn test_dropped_registration_never_fires() {
        let (tx, rx) = mpsc::channel();
        let pinned = Pinned::new(move || {
            let _ = tx.send(());
        });
        let event = OsEvent::new().unwrap();
        drop(WaitRegistration::new(event.as_raw(), pinned.token()).unwrap());

        event.set().unwrap();
        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
    }

    #[test]
    fn test_invalid_handle_rejected() {
        assert!(WaitRegistration::new(-1, 1).is_err());
        assert!(unsafe { WaitRegistration::borrowed(-1, 1) }.is_err());
    }

    #[test]
    fn test_borrowed_registration_watches_the_same_fd() {
        let (tx, rx) = mpsc::channel();
        let pinned = Pinned::new(move || {
            let _ = tx.send(());
        });
        let event = OsEvent::new().unwrap();

        let duplicated = WaitRegistration::new(event.as_raw(), pinned.token()).unwrap();
        assert_ne!(duplicated.watched(), event.as_raw());
        drop(duplicated);

        // SAFETY: `event` outlives the registration.
        let registration =
            unsafe { WaitRegistration::borrowed(event.as_raw(), pinned.token()) }.unwrap();
        assert_eq!(registration.watched(), event.as_raw());

        event.set().unwrap();
        rx.recv_timeout(Duration::from_secs(2)).unwrap();
    }

    #[test]
    fn test_handle_exhaustion_errors() {
        assert!(is_handle_exhaustion(&io::Error::from_raw_os_error(libc::EMFILE)));
        assert!(is_handle_exhaustion(&io::Error::from_raw_os_error(libc::ENFILE)));
        assert!(!is_handle_exhaustion(&io::Error::from_raw_os_error(libc::EBADF)));
        assert!(!is_handle_exhaustion(&io::Error::new(io::ErrorKind::Other, "other")));
    }

    #[cfg(feature = "high-resolution")]
    #[test]
    fn test_timer_fires() {
        let timer = HighResTimer::new().unwrap();
        timer.arm(Duration::from_millis(2)).unwrap();
        assert!(poll_readable(timer.fd.as_raw_fd(), Duration::from_secs(2)).unwrap());
    }

    #[cfg(feature = "high-resolution")]
    #[test]
    fn test_cancelled_timer_stays_quiet() {
        let timer = HighResTimer::new().unwrap();
        timer.arm(Duration::from_millis(30)).unwrap();
        timer.cancel().unwrap();
        assert!(!poll_readable(timer.fd.as_raw_fd(), Duration::from_millis(60)).unwrap());
    }
}
