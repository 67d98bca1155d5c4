//! High-resolution path: an OS timer whose expiry is delivered by the wait
//! pool straight into the [`Completion`].
//!
//! ```text
//!     ArmedTimer
//!     ├─ registration : WaitRegistration  (timer handle ─► wait pool)
//!     ├─ timer        : HighResTimer
//!     └─ pin          : Pinned            (token ─► completion.complete(gen))
//! ```
//!
//! Release order is the field order: the wait registration is unhooked before
//! the timer handle closes, and the completion stays pinned until both are
//! gone. The registration watches the timer handle itself, so a pending wait
//! costs one OS handle.

use super::completion::Completion;
use crate::error::{Result, ThrottleError};
use crate::registry::Pinned;
use crate::sys::{is_handle_exhaustion, HighResTimer, WaitRegistration};
use std::sync::Arc;
use std::time::Duration;
use tracing::{trace, warn};

#[derive(Debug)]
pub(crate) struct ArmedTimer {
    registration: Option<WaitRegistration>,
    timer: Option<HighResTimer>,
    pin: Pinned,
}

impl ArmedTimer {
    /// Creates a timer due after `duration` that completes `generation`.
    pub(crate) fn arm(
        completion: &Arc<Completion>,
        generation: u32,
        duration: Duration,
    ) -> Result<Self> {
        let target = Arc::clone(completion);
        let pin = Pinned::new(move || {
            target.complete(generation);
        });

        let timer = HighResTimer::new()
            .map_err(|err| ThrottleError::platform("high-resolution timer", err))?;
        timer
            .arm(duration)
            .map_err(|err| ThrottleError::platform("timer due time", err))?;
        // SAFETY: the registration is always released before the timer, see
        // `release_os` and the field order.
        let registration = unsafe { WaitRegistration::borrowed(timer.as_raw(), pin.token()) }
            .map_err(|err| ThrottleError::platform("timer wait registration", err))?;

        trace!(generation, ?duration, "armed high-resolution timer");
        Ok(Self {
            registration: Some(registration),
            timer: Some(timer),
            pin,
        })
    }

    /// Whether `err` came from the process running out of OS handles, as
    /// opposed to a broken timer.
    pub(crate) fn is_exhaustion(err: &ThrottleError) -> bool {
        matches!(
            err,
            ThrottleError::PlatformResourceExhausted { source, .. } if is_handle_exhaustion(source)
        )
    }

    /// Stops the timer from firing. The completion is left alone.
    pub(crate) fn cancel(&self) {
        if let Some(timer) = &self.timer {
            if let Err(err) = timer.cancel() {
                warn!(%err, "failed to cancel high-resolution timer");
            }
        }
    }

    /// Unhooks the wait registration, then closes the timer handle.
    pub(crate) fn release_os(&mut self) {
        drop(self.registration.take());
        drop(self.timer.take());
    }

    /// Drops the pinned completion callback.
    pub(crate) fn unpin(&mut self) {
        self.pin.release();
    }
}

impl Drop for ArmedTimer {
    fn drop(&mut self) {
        self.release_os();
        self.unpin();
    }
}
