//! Token table for callbacks invoked from OS wait threads.
//!
//! OS wait APIs carry a single pointer-sized context value. Instead of handing
//! them a raw pointer to Rust state, the callback is parked here under an
//! integer token and the token travels through the OS. A token that is no
//! longer in the table is ignored, so a late OS callback after teardown is a
//! no-op rather than a use-after-free.
//!
//! ```text
//!     Pinned::new(cb) ──► CALLBACKS[token] = cb
//!                              ▲
//!     OS wait thread ──dispatch(token)
//!                              │
//!     Pinned::release() ──► remove(token)
//! ```

use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use tracing::trace;

type Callback = Arc<dyn Fn() + Send + Sync>;

static CALLBACKS: OnceLock<DashMap<u64, Callback>> = OnceLock::new();

// Token 0 is never handed out so a zeroed OS context can't match.
static NEXT_TOKEN: AtomicU64 = AtomicU64::new(1);

fn callbacks() -> &'static DashMap<u64, Callback> {
    CALLBACKS.get_or_init(DashMap::new)
}

/// Keeps a callback reachable from OS threads until released.
#[derive(Debug)]
pub(crate) struct Pinned {
    token: u64,
    released: bool,
}

impl Pinned {
    pub(crate) fn new(callback: impl Fn() + Send + Sync + 'static) -> Self {
        let token = NEXT_TOKEN.fetch_add(1, Ordering::Relaxed);
        callbacks().insert(token, Arc::new(callback));
        Self {
            token,
            released: false,
        }
    }

    pub(crate) fn token(&self) -> u64 {
        self.token
    }

    /// Drops the callback. Idempotent.
    pub(crate) fn release(&mut self) {
        if !self.released {
            callbacks().remove(&self.token);
            self.released = true;
        }
    }
}

impl Drop for Pinned {
    fn drop(&mut self) {
        self.release();
    }
}

/// Runs the callback registered under `token`, if it is still pinned.
///
/// The callback is cloned out of the table first so no shard lock is held
/// while it runs.
pub(crate) fn dispatch(token: u64) -> bool {
    let callback = callbacks()
        .get(&token)
        .map(|entry| Arc::clone(entry.value()));
    match callback {
        Some(callback) => {
            callback();
            true
        }
        None => {
            trace!(token, "callback token already released");
            false
        }
    }
}

#[cfg(test)]
pub(crate) fn is_pinned(token: u64) -> bool {
    callbacks().contains_key(&token)
}
