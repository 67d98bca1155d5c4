//! # C ABI
//!
//! Lets foreign code drive the process-wide engine through raw pointers and
//! OS handles.
//!
//! ```text
//!     int32_t throttle_set_shared_rate(int64_t rate, const int64_t *burst);
//!     void    throttle_get_shared_rate(int64_t *rate_out, int64_t *burst_out);
//!     int32_t throttle_state_init(ThrottleState *state);
//!     /* cancel_handle: NULL on Windows, -1 on Linux for "none".
//!        0 is a real fd (stdin) on Linux, not "none". */
//!     int32_t throttle_account_or_wait(const ThrottleState *state,
//!                                      int64_t amount_bytes,
//!                                      intptr_t cancel_handle,
//!                                      intptr_t *completion_handle_out);
//! ```
//!
//! `throttle_account_or_wait` returns at once. The throttled work runs on a
//! process-wide Tokio runtime and, whatever its outcome, signals the event
//! written to `completion_handle_out`:
//!
//! ```text
//!     caller ──► validate ──► create event ──► *completion_handle_out
//!                   │                                  ▲
//!                   └─► spawn ─► account_or_wait ─► release watcher ─► set event
//!
//!     cancel_handle signaled ─► wait pool ─► CancellationToken::cancel()
//! ```
//!
//! The caller owns the returned event and must close it (`CloseHandle` on
//! Windows, `close` elsewhere). The `ThrottleState` must stay valid until the
//! event is signaled.
//!
//! Status codes are listed in [`crate::status`].

use crate::error::{status, Result, ThrottleError};
use crate::registry::Pinned;
use crate::sys::{self, OsEvent, OsHandle, WaitRegistration};
use crate::{Throttle, ThrottleState};
use futures::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::ptr::NonNull;
use std::sync::OnceLock;
use tokio::runtime::{Builder, Runtime};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

static RUNTIME: OnceLock<std::result::Result<Runtime, Option<i32>>> = OnceLock::new();

fn runtime() -> Result<&'static Runtime> {
    let built = RUNTIME.get_or_init(|| {
        Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("throttle-worker")
            .enable_time()
            .build()
            .map_err(|err| {
                error!(%err, "failed to start the throttle runtime");
                err.raw_os_error()
            })
    });
    match built {
        Ok(runtime) => Ok(runtime),
        Err(code) => Err(ThrottleError::UnexpectedFailure {
            message: "throttle runtime unavailable".into(),
            status: code.map(status::from_os_error),
        }),
    }
}

/// Sets the process-wide rate. `burst_bytes` may be null, meaning "same as
/// the rate".
///
/// Returns `0`, or `E_ARGUMENT_OUT_OF_RANGE` for a negative rate or an
/// unusable burst (the previous configuration is kept).
///
/// # Safety
///
/// `burst_bytes` must be null or point to a readable `i64`.
#[no_mangle]
pub unsafe extern "C" fn throttle_set_shared_rate(
    rate_bytes_per_sec: i64,
    burst_bytes: *const i64,
) -> i32 {
    // SAFETY: null or readable, per the contract above.
    let burst = unsafe { burst_bytes.as_ref() }.copied();
    match Throttle::shared().configure(rate_bytes_per_sec, burst) {
        Ok(()) => status::OK,
        Err(err) => {
            warn!(%err, rate_bytes_per_sec, ?burst, "rejected shared rate");
            err.status_code()
        }
    }
}

/// Reads the process-wide rate and burst. Null outputs are skipped.
///
/// # Safety
///
/// Each pointer must be null or point to a writable `i64`.
#[no_mangle]
pub unsafe extern "C" fn throttle_get_shared_rate(rate_out: *mut i64, burst_out: *mut i64) {
    let config = Throttle::shared().read_config();
    if !rate_out.is_null() {
        // SAFETY: non-null and writable, per the contract above.
        unsafe { rate_out.write(config.rate_bytes_per_sec) };
    }
    if !burst_out.is_null() {
        // SAFETY: non-null and writable, per the contract above.
        unsafe { burst_out.write(config.capacity_bytes) };
    }
}

/// Initializes caller-allocated state with a full burst at the current
/// configuration.
///
/// A zero-filled state is also valid; it starts empty and fills at the rate.
///
/// # Safety
///
/// `state` must be null or point to 16 writable bytes aligned to 8, not in use
/// by a pending `throttle_account_or_wait`.
#[no_mangle]
pub unsafe extern "C" fn throttle_state_init(state: *mut ThrottleState) -> i32 {
    if state.is_null() {
        return status::E_POINTER;
    }
    // SAFETY: non-null, writable and aligned, per the contract above.
    unsafe { state.write(Throttle::shared().new_state()) };
    status::OK
}

/// Throttles `amount_bytes` against `state` in the background.
///
/// On `0`, `*completion_handle_out` holds a fresh event that is signaled
/// exactly once when the operation ends, whether admitted, cancelled or
/// failed. On any other status nothing was started and nothing is written.
///
/// `cancel_handle` is optional: pass [`crate::NO_HANDLE`] (`0` on Windows,
/// `-1` on Linux) for none. On Linux `0` is stdin and gets watched like any
/// other fd. Once the handle becomes signaled the operation is cancelled.
///
/// # Safety
///
/// - `state` must be null or point to a valid `ThrottleState` that outlives
///   the operation (until the completion event is signaled).
/// - `completion_handle_out` must be null or writable.
/// - `cancel_handle`, if given, must stay open until this call returns.
#[no_mangle]
pub unsafe extern "C" fn throttle_account_or_wait(
    state: *const ThrottleState,
    amount_bytes: i64,
    cancel_handle: OsHandle,
    completion_handle_out: *mut OsHandle,
) -> i32 {
    // SAFETY: forwarded to the caller.
    match unsafe { start(state, amount_bytes, cancel_handle, completion_handle_out) } {
        Ok(()) => status::OK,
        Err(err) => {
            warn!(%err, amount_bytes, "throttle_account_or_wait rejected");
            err.status_code()
        }
    }
}

unsafe fn start(
    state: *const ThrottleState,
    amount_bytes: i64,
    cancel_handle: OsHandle,
    completion_handle_out: *mut OsHandle,
) -> Result<()> {
    let state = NonNull::new(state.cast_mut()).ok_or(ThrottleError::NullPointer("state"))?;
    if completion_handle_out.is_null() {
        return Err(ThrottleError::NullPointer("completion_handle_out"));
    }

    let runtime = runtime()?;
    let cancel = CancellationToken::new();
    let watcher = if sys::is_valid_handle(cancel_handle) {
        Some(CancelWatcher::watch(cancel_handle, cancel.clone())?)
    } else {
        None
    };
    let completion = OsEvent::new()
        .map_err(|err| ThrottleError::platform("completion event", err))?
        .into_raw();

    // SAFETY: non-null and writable, per the caller's contract.
    unsafe { completion_handle_out.write(completion) };

    runtime.spawn(drive(ForeignState(state), amount_bytes, cancel, watcher, completion));
    Ok(())
}

/// Foreign memory borrowed for the duration of one operation.
struct ForeignState(NonNull<ThrottleState>);

// SAFETY: ThrottleState is only touched through atomics, and the caller keeps
// it alive until the completion event is signaled.
unsafe impl Send for ForeignState {}

async fn drive(
    state: ForeignState,
    amount_bytes: i64,
    cancel: CancellationToken,
    watcher: Option<CancelWatcher>,
    completion: OsHandle,
) {
    // SAFETY: see ForeignState.
    let state = unsafe { state.0.as_ref() };
    let work = Throttle::shared().account_or_wait(state, amount_bytes, &cancel);
    // SAFETY: the event was created by `start` and only the caller closes it,
    // after it is signaled.
    unsafe { finish(work, amount_bytes, watcher, completion) }.await;
}

/// Awaits `work`, releases the watcher, then signals `completion` whatever
/// the outcome, panics included.
///
/// # Safety
///
/// `completion` must be an open event that stays open until it is signaled.
async unsafe fn finish<F>(
    work: F,
    amount_bytes: i64,
    watcher: Option<CancelWatcher>,
    completion: OsHandle,
) where
    F: Future<Output = Result<()>>,
{
    let outcome = AssertUnwindSafe(work).catch_unwind().await;

    match outcome {
        Ok(Ok(())) => trace!(amount_bytes, "foreign request admitted"),
        Ok(Err(err)) if err.is_cancelled() => debug!(amount_bytes, "foreign request cancelled"),
        Ok(Err(err)) => warn!(%err, code = err.status_code(), "foreign request failed"),
        Err(_) => error!(amount_bytes, "foreign request panicked"),
    }

    drop(watcher);

    // SAFETY: forwarded to the caller.
    if let Err(err) = unsafe { sys::signal_raw(completion) } {
        error!(%err, "failed to signal completion event");
    }
}

/// Cancels a token once a foreign handle becomes signaled.
///
/// Drop order is field order: the OS registration goes first, then the
/// pinned callback.
struct CancelWatcher {
    _registration: WaitRegistration,
    _pin: Pinned,
}

impl CancelWatcher {
    fn watch(handle: OsHandle, token: CancellationToken) -> Result<Self> {
        let pin = Pinned::new(move || token.cancel());
        let registration = WaitRegistration::new(handle, pin.token())
            .map_err(|err| ThrottleError::platform("cancellation watcher", err))?;
        Ok(Self {
            _registration: registration,
            _pin: pin,
        })
    }
}
