//! # Native Delay
//!
//! Suspends a task for a duration without tying up an OS thread, resuming it
//! early if a [`CancellationToken`] fires.
//!
//! ```text
//!     NativeDelay::wait(d, cancel) ──► Wait<'_>  (single use)
//!
//!     Portable        tokio Sleep polled inline by the future
//!     HighResolution  OS timer ─► wait pool thread ─► Completion::complete
//!
//!     Either way the outcome lands in one reusable Completion:
//!         Idle ─► Armed(g) ─► Completed(g) | Cancelled(g)
//! ```
//!
//! ## Teardown
//!
//! Whether a wait completes, is cancelled, or is dropped while pending, its
//! resources are released exactly once, in this order:
//!
//! 1. the OS wait registration
//! 2. the OS timer handle
//! 3. the cancellation registration
//! 4. the pinned completion callback
//!
//! ## Example
//!
//! ```rust
//! use byte_throttle::{DelayKind, NativeDelay};
//! use std::time::Duration;
//! use tokio_util::sync::CancellationToken;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> byte_throttle::Result<()> {
//! let mut delay = NativeDelay::new(DelayKind::Portable);
//! let cancel = CancellationToken::new();
//!
//! delay.wait(Duration::from_millis(5), &cancel)?.await?;
//! delay.wait(Duration::from_millis(5), &cancel)?.await?;
//! # Ok(())
//! # }
//! ```

mod completion;

#[cfg(all(
    feature = "high-resolution",
    any(windows, target_os = "linux", target_os = "android")
))]
mod hires;

#[cfg(not(all(
    feature = "high-resolution",
    any(windows, target_os = "linux", target_os = "android")
)))]
mod hires {
    use super::completion::Completion;
    use crate::error::{Result, ThrottleError};
    use std::sync::Arc;
    use std::time::Duration;

    /// Uninhabited where no OS timer is compiled in.
    #[derive(Debug)]
    pub(crate) enum ArmedTimer {}

    impl ArmedTimer {
        pub(crate) fn arm(_: &Arc<Completion>, _: u32, _: Duration) -> Result<Self> {
            Err(ThrottleError::unexpected(
                "high-resolution delays are not compiled in",
            ))
        }

        pub(crate) fn is_exhaustion(_: &ThrottleError) -> bool {
            false
        }

        pub(crate) fn cancel(&self) {
            match *self {}
        }

        pub(crate) fn release_os(&mut self) {
            match *self {}
        }

        pub(crate) fn unpin(&mut self) {
            match *self {}
        }
    }
}

use self::completion::Completion;
use self::hires::ArmedTimer;
use crate::error::{Result, ThrottleError};
use pin_project_lite::pin_project;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::time::Sleep;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use tracing::{debug, trace, warn};

/// Which timer backs a [`NativeDelay`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DelayKind {
    /// Tokio's timer wheel; millisecond granularity. Needs a Tokio runtime
    /// with the time driver enabled.
    Portable,

    /// A dedicated OS timer per wait, woken from an OS wait thread.
    /// Sub-millisecond due times and no dependency on the caller's executor.
    HighResolution,
}

impl DelayKind {
    /// Whether this kind is usable in the current build and platform.
    pub const fn is_available(self) -> bool {
        match self {
            Self::Portable => true,
            Self::HighResolution => cfg!(all(
                feature = "high-resolution",
                any(windows, target_os = "linux", target_os = "android")
            )),
        }
    }

    /// The kind a [`NativeDelay`] actually uses when asked for `self`.
    pub const fn effective(self) -> Self {
        if self.is_available() {
            self
        } else {
            Self::Portable
        }
    }
}

impl Default for DelayKind {
    fn default() -> Self {
        Self::HighResolution.effective()
    }
}

/// A reusable delay: one [`Wait`] at a time, any number of waits in sequence.
pub struct NativeDelay {
    completion: Arc<Completion>,
    kind: DelayKind,
}

impl NativeDelay {
    /// Creates a delay backed by `kind`, falling back to
    /// [`DelayKind::Portable`] if `kind` is unavailable here.
    pub fn new(kind: DelayKind) -> Self {
        let effective = kind.effective();
        if effective != kind {
            warn!(
                requested = ?kind,
                "high-resolution delays unavailable, using the portable timer"
            );
        }
        Self {
            completion: Arc::new(Completion::new()),
            kind: effective,
        }
    }

    /// The timer kind in use.
    pub fn kind(&self) -> DelayKind {
        self.kind
    }

    /// Generation of the most recent wait; `0` before the first one.
    pub fn generation(&self) -> u32 {
        self.completion.generation()
    }

    /// Arms a wait of `duration` that ends early with
    /// [`ThrottleError::Cancelled`] once `cancel` fires.
    ///
    /// The exclusive borrow means a new wait can only be armed once the
    /// previous [`Wait`] is gone.
    ///
    /// # Errors
    ///
    /// - [`ThrottleError::PlatformResourceExhausted`] if the OS timer or its
    ///   wait registration cannot be created. Nothing is left allocated.
    ///   When the process is merely out of handles and a Tokio runtime is
    ///   present, the wait uses the portable timer instead of failing.
    /// - [`ThrottleError::UnexpectedFailure`] if the portable timer is asked
    ///   for outside a Tokio runtime.
    pub fn wait<'a>(
        &'a mut self,
        duration: Duration,
        cancel: &'a CancellationToken,
    ) -> Result<Wait<'a>> {
        if self.kind == DelayKind::Portable && tokio::runtime::Handle::try_current().is_err() {
            return Err(ThrottleError::unexpected(
                "portable delay polled outside a Tokio runtime",
            ));
        }

        let generation = self.completion.arm()?;
        let (sleep, timer) = match self.kind {
            DelayKind::Portable => (Some(tokio::time::sleep(duration)), None),
            DelayKind::HighResolution => {
                match ArmedTimer::arm(&self.completion, generation, duration) {
                    Ok(timer) => (None, Some(timer)),
                    Err(err)
                        if ArmedTimer::is_exhaustion(&err)
                            && tokio::runtime::Handle::try_current().is_ok() =>
                    {
                        debug!(%err, "out of OS handles, using the portable timer for this wait");
                        (Some(tokio::time::sleep(duration)), None)
                    }
                    Err(err) => {
                        // Leave the completion terminal so the delay can be
                        // armed again.
                        self.completion.cancel(generation);
                        return Err(err);
                    }
                }
            }
        };

        trace!(generation, ?duration, kind = ?self.kind, "delay armed");
        Ok(Wait {
            completion: &self.completion,
            generation,
            sleep,
            timer,
            cancelled: Some(cancel.cancelled()),
            finished: false,
        })
    }
}

impl Default for NativeDelay {
    fn default() -> Self {
        Self::new(DelayKind::default())
    }
}

impl fmt::Debug for NativeDelay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativeDelay")
            .field("kind", &self.kind)
            .field("generation", &self.completion.generation())
            .finish()
    }
}

pin_project! {
    /// A single pending delay returned by [`NativeDelay::wait`].
    ///
    /// Resolves to `Ok(())` once the duration elapses or
    /// `Err(ThrottleError::Cancelled)` if cancellation wins. Dropping it early
    /// cancels the timer and releases everything it holds.
    #[must_use = "futures do nothing unless polled"]
    pub struct Wait<'a> {
        completion: &'a Completion,
        generation: u32,
        #[pin]
        sleep: Option<Sleep>,
        timer: Option<ArmedTimer>,
        #[pin]
        cancelled: Option<WaitForCancellationFuture<'a>>,
        finished: bool,
    }

    impl<'a> PinnedDrop for Wait<'a> {
        fn drop(this: Pin<&mut Self>) {
            let mut this = this.project();
            if !*this.finished {
                if let Some(timer) = this.timer.as_ref() {
                    timer.cancel();
                }
                this.completion.cancel(*this.generation);
                teardown(this.timer, this.sleep.as_mut(), this.cancelled.as_mut());
            }
        }
    }
}

fn teardown(
    timer: &mut Option<ArmedTimer>,
    mut sleep: Pin<&mut Option<Sleep>>,
    mut cancelled: Pin<&mut Option<WaitForCancellationFuture<'_>>>,
) {
    if let Some(timer) = timer.as_mut() {
        timer.release_os();
    }
    sleep.set(None);
    cancelled.set(None);
    if let Some(mut timer) = timer.take() {
        timer.unpin();
    }
}

impl Future for Wait<'_> {
    type Output = Result<()>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut this = self.project();
        if *this.finished {
            return Poll::Ready(Err(ThrottleError::unexpected(
                "delay polled after completion",
            )));
        }

        if let Some(cancelled) = this.cancelled.as_mut().as_pin_mut() {
            if cancelled.poll(cx).is_ready() {
                if let Some(timer) = this.timer.as_ref() {
                    timer.cancel();
                }
                this.completion.cancel(*this.generation);
            }
        }

        if let Some(sleep) = this.sleep.as_mut().as_pin_mut() {
            if sleep.poll(cx).is_ready() {
                this.completion.complete(*this.generation);
            }
        }

        match this.completion.poll_wait(*this.generation, cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(outcome) => {
                teardown(this.timer, this.sleep.as_mut(), this.cancelled.as_mut());
                *this.finished = true;
                trace!(generation = *this.generation, ok = outcome.is_ok(), "delay finished");
                Poll::Ready(outcome)
            }
        }
    }
}

impl fmt::Debug for Wait<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Wait")
            .field("generation", &self.generation)
            .field("portable", &self.sleep.is_some())
            .field("finished", &self.finished)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn kinds() -> Vec<DelayKind> {
        let mut kinds = vec![DelayKind::Portable];
        if DelayKind::HighResolution.is_available() {
            kinds.push(DelayKind::HighResolution);
        }
        kinds
    }

    #[tokio::test]
    async fn test_wait_elapses() {
        for kind in kinds() {
            let mut delay = NativeDelay::new(kind);
            let cancel = CancellationToken::new();

            let start = Instant::now();
            delay
                .wait(Duration::from_millis(20), &cancel)
                .unwrap()
                .await
                .unwrap();
            assert!(start.elapsed() >= Duration::from_millis(19), "{kind:?}");
        }
    }

    #[tokio::test]
    async fn test_rearm_bumps_generation() {
        for kind in kinds() {
            let mut delay = NativeDelay::new(kind);
            let cancel = CancellationToken::new();
            assert_eq!(delay.generation(), 0);

            delay.wait(Duration::from_millis(1), &cancel).unwrap().await.unwrap();
            delay.wait(Duration::from_millis(1), &cancel).unwrap().await.unwrap();
            assert_eq!(delay.generation(), 2);
        }
    }

    #[tokio::test]
    async fn test_cancel_before_expiry() {
        for kind in kinds() {
            let mut delay = NativeDelay::new(kind);
            let cancel = CancellationToken::new();

            let trigger = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                trigger.cancel();
            });

            let start = Instant::now();
            let err = delay
                .wait(Duration::from_secs(10), &cancel)
                .unwrap()
                .await
                .unwrap_err();
            assert!(err.is_cancelled(), "{kind:?}");
            assert!(start.elapsed() < Duration::from_secs(5));
        }
    }

    #[tokio::test]
    async fn test_already_cancelled() {
        for kind in kinds() {
            let mut delay = NativeDelay::new(kind);
            let cancel = CancellationToken::new();
            cancel.cancel();

            let err = delay
                .wait(Duration::from_secs(10), &cancel)
                .unwrap()
                .await
                .unwrap_err();
            assert!(err.is_cancelled());
        }
    }

    #[tokio::test]
    async fn test_dropped_wait_allows_rearm() {
        for kind in kinds() {
            let mut delay = NativeDelay::new(kind);
            let cancel = CancellationToken::new();

            let pending = delay.wait(Duration::from_secs(10), &cancel).unwrap();
            drop(pending);

            delay.wait(Duration::from_millis(1), &cancel).unwrap().await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_dropped_wait_after_first_poll() {
        for kind in kinds() {
            let mut delay = NativeDelay::new(kind);
            let cancel = CancellationToken::new();

            let outcome = tokio::time::timeout(
                Duration::from_millis(5),
                delay.wait(Duration::from_secs(10), &cancel).unwrap(),
            )
            .await;
            assert!(outcome.is_err());

            delay.wait(Duration::from_millis(1), &cancel).unwrap().await.unwrap();
        }
    }

    #[test]
    fn test_portable_outside_runtime_fails() {
        let mut delay = NativeDelay::new(DelayKind::Portable);
        let cancel = CancellationToken::new();
        let err = delay.wait(Duration::from_millis(1), &cancel).unwrap_err();
        assert!(matches!(err, ThrottleError::UnexpectedFailure { .. }));
        // The failed call must not leave the delay armed.
        assert_eq!(delay.generation(), 0);
    }

    #[cfg(all(
        feature = "high-resolution",
        any(windows, target_os = "linux", target_os = "android")
    ))]
    #[test]
    fn test_high_resolution_without_tokio() {
        let mut delay = NativeDelay::new(DelayKind::HighResolution);
        let cancel = CancellationToken::new();
        futures::executor::block_on(async {
            delay.wait(Duration::from_millis(2), &cancel).unwrap().await.unwrap();
        });
    }

    #[test]
    fn test_kind_fallback() {
        assert_eq!(DelayKind::Portable.effective(), DelayKind::Portable);
        assert!(DelayKind::default().is_available());
    }
}
