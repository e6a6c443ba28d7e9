//! Lifetime protocol for objects referenced by in-flight callbacks.
//!
//! A strong reference is taken before an asynchronous operation starts and moved into its
//! callback. On entry the callback calls [`InFlight::enter`], which releases the reference
//! before any field access when the callback was the last holder or the target is already
//! shut down. A `None` from `enter` means: return immediately, touch nothing.

use std::sync::Arc;

/// Objects that can be shut down while callbacks are still in flight.
pub trait Lifecycle: Send + Sync {
    fn is_shut_down(&self) -> bool;
}

/// Reference held by a pending callback.
pub struct InFlight<T: Lifecycle + ?Sized> {
    target: Arc<T>,
}

impl<T: Lifecycle + ?Sized> InFlight<T> {
    /// Take a reference before starting the asynchronous operation.
    pub fn acquire(target: &Arc<T>) -> Self {
        Self {
            target: target.clone(),
        }
    }

    /// Release the reference on callback entry.
    ///
    /// Returns the target only when someone else still owns it and it has not been shut
    /// down.
    pub fn enter(self) -> Option<Arc<T>> {
        if Arc::strong_count(&self.target) == 1 {
            tracing::trace!("callback held the last reference; dropping");
            return None;
        }
        if self.target.is_shut_down() {
            return None;
        }
        Some(self.target)
    }
}
