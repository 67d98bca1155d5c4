//! Reusable, generation-tagged completion slot.
//!
//! One `Completion` backs every wait a [`NativeDelay`](super::NativeDelay)
//! ever issues. Each arm bumps the generation; a completion or cancellation
//! only lands if it names the generation that is currently armed.
//!
//! ```text
//!     state: AtomicU64
//!     ┌────────────────────────┬──────────────┐
//!     │ generation (u32)       │ status (u8)  │
//!     └────────────────────────┴──────────────┘
//!
//!     Idle ──arm()──► Armed(g) ──complete(g)──► Completed(g)
//!                        │
//!                        └─────cancel(g)──────► Cancelled(g)
//! ```
//!
//! `complete(g - 1)` arriving late from an earlier wait finds `Armed(g)` and
//! does nothing, so a stale OS callback can never finish a newer wait.

use crate::error::{Result, ThrottleError};
use futures::task::AtomicWaker;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};

const STATUS_MASK: u64 = 0xFF;

/// Where a wait is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum WaitStatus {
    Idle = 0,
    Armed = 1,
    Completed = 2,
    Cancelled = 3,
}

impl WaitStatus {
    fn from_bits(bits: u64) -> Self {
        match bits & STATUS_MASK {
            1 => Self::Armed,
            2 => Self::Completed,
            3 => Self::Cancelled,
            _ => Self::Idle,
        }
    }

    pub(crate) fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled)
    }
}

#[inline(always)]
fn pack(generation: u32, status: WaitStatus) -> u64 {
    ((generation as u64) << 32) | status as u64
}

#[inline(always)]
fn unpack(state: u64) -> (u32, WaitStatus) {
    ((state >> 32) as u32, WaitStatus::from_bits(state))
}

#[derive(Debug)]
pub(crate) struct Completion {
    state: AtomicU64,
    waker: AtomicWaker,
}

impl Completion {
    pub(crate) const fn new() -> Self {
        Self {
            state: AtomicU64::new(0),
            waker: AtomicWaker::new(),
        }
    }

    /// Starts a new wait and returns its generation.
    ///
    /// Fails if the previous wait has not reached a terminal state: one wait
    /// per arm.
    pub(crate) fn arm(&self) -> Result<u32> {
        let current = self.state.load(Ordering::Acquire);
        let (generation, status) = unpack(current);
        if status == WaitStatus::Armed {
            return Err(ThrottleError::unexpected(
                "delay re-armed while a wait is still pending",
            ));
        }

        let next = generation.wrapping_add(1);
        self.state
            .compare_exchange(
                current,
                pack(next, WaitStatus::Armed),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .map_err(|_| ThrottleError::unexpected("delay state changed while arming"))?;

        // A waker left over from the previous generation must not be woken
        // for this one.
        drop(self.waker.take());
        Ok(next)
    }

    /// Marks `generation` as elapsed. Returns `false` if it was not the armed
    /// generation or had already finished.
    pub(crate) fn complete(&self, generation: u32) -> bool {
        self.finish(generation, WaitStatus::Completed)
    }

    /// Marks `generation` as cancelled. Returns `false` if it was not the
    /// armed generation or had already finished.
    pub(crate) fn cancel(&self, generation: u32) -> bool {
        self.finish(generation, WaitStatus::Cancelled)
    }

    fn finish(&self, generation: u32, status: WaitStatus) -> bool {
        let finished = self
            .state
            .compare_exchange(
                pack(generation, WaitStatus::Armed),
                pack(generation, status),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok();
        if finished {
            self.waker.wake();
        }
        finished
    }

    /// Status of `generation`, or `None` if another generation is current.
    pub(crate) fn status(&self, generation: u32) -> Option<WaitStatus> {
        let (current, status) = unpack(self.state.load(Ordering::Acquire));
        (current == generation).then_some(status)
    }

    pub(crate) fn generation(&self) -> u32 {
        unpack(self.state.load(Ordering::Acquire)).0
    }

    pub(crate) fn poll_wait(&self, generation: u32, cx: &mut Context<'_>) -> Poll<Result<()>> {
        if let Some(outcome) = self.outcome(generation) {
            return Poll::Ready(outcome);
        }

        self.waker.register(cx.waker());

        // Re-check: the completion may have landed between the first load and
        // the registration.
        match self.outcome(generation) {
            Some(outcome) => Poll::Ready(outcome),
            None => Poll::Pending,
        }
    }

    fn outcome(&self, generation: u32) -> Option<Result<()>> {
        match self.status(generation) {
            Some(WaitStatus::Armed) => None,
            Some(WaitStatus::Completed) => Some(Ok(())),
            Some(WaitStatus::Cancelled) => Some(Err(ThrottleError::Cancelled)),
            Some(WaitStatus::Idle) | None => Some(Err(ThrottleError::unexpected(
                "wait observed a stale delay generation",
            ))),
        }
    }
}

impl Default for Completion {
    fn default() -> Self {
        Self::new()
    }
}
