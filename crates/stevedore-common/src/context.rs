//! Cancellation context for blocking operations.
//!
//! A [`Context`] is a cheap, cloneable handle. Long-running operations call
//! [`Context::check`] between remote calls and use [`Context::sleep`] for
//! waits, so that cancelling from another thread (e.g. a Ctrl-C handler)
//! stops them promptly with [`StevedoreError::Cancelled`].

use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

use crate::error::{Result, StevedoreError};

#[derive(Debug, Default)]
struct Inner {
    cancelled: Mutex<bool>,
    wake: Condvar,
}

/// Cancellation handle shared between a caller and an operation.
#[derive(Debug, Clone, Default)]
pub struct Context {
    inner: Arc<Inner>,
}

impl Context {
    /// Creates a context that has not been cancelled.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancels the context and wakes every sleeper.
    pub fn cancel(&self) {
        let mut cancelled = self
            .inner
            .cancelled
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        *cancelled = true;
        self.inner.wake.notify_all();
    }

    /// Returns whether [`Context::cancel`] has been called.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        *self
            .inner
            .cancelled
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Fails with `Cancelled` once the context is cancelled.
    ///
    /// # Errors
    ///
    /// Returns `StevedoreError::Cancelled` if the context was cancelled.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            return Err(StevedoreError::Cancelled);
        }
        Ok(())
    }

    /// Blocks the calling thread for `duration` or until cancelled.
    ///
    /// # Errors
    ///
    /// Returns `StevedoreError::Cancelled` if the context is cancelled
    /// before or during the wait.
    pub fn sleep(&self, duration: Duration) -> Result<()> {
        // A deadline past the end of `Instant` means waiting for cancellation.
        let deadline = Instant::now().checked_add(duration);
        let mut cancelled = self
            .inner
            .cancelled
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        loop {
            if *cancelled {
                return Err(StevedoreError::Cancelled);
            }
            let Some(deadline) = deadline else {
                cancelled = self
                    .inner
                    .wake
                    .wait(cancelled)
                    .unwrap_or_else(PoisonError::into_inner);
                continue;
            };
            let now = Instant::now();
            if now >= deadline {
                return Ok(());
            }
            cancelled = self
                .inner
                .wake
                .wait_timeout(cancelled, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }
}
