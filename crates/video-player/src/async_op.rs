//! Exactly-once asynchronous operations with cancellation.
//!
//! An operation ends in one of three ways: completed with a value, completed with an
//! error, or canceled. Whichever happens first wins and runs the completion callback; every
//! later attempt is rejected. Cancellation never runs the callback inline: the `Canceled`
//! delivery is posted to the work queue so a canceller holding a lock cannot re-enter it.

use std::sync::{Arc, Mutex, MutexGuard};

use crate::error::{EngineError, Result};
use crate::media::WorkQueue;

/// Best-effort hook that tells the underlying facility to stop working.
pub type CancelHook = Box<dyn FnOnce() + Send + 'static>;

type DoneFn<T> = Box<dyn FnOnce(Result<T>) + Send + 'static>;

/// Terminal phase of an operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    Pending,
    Completed,
    Canceled,
}

struct OpState<T> {
    phase: Phase,
    on_done: Option<DoneFn<T>>,
    hook: Option<CancelHook>,
    /// `start` has not returned yet.
    starting: bool,
    /// The completer was dropped while `starting`.
    abandoned: bool,
}

struct Shared<T> {
    queue: Arc<dyn WorkQueue>,
    state: Mutex<OpState<T>>,
}

impl<T: Send + 'static> Shared<T> {
    fn lock(&self) -> MutexGuard<'_, OpState<T>> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Move to `Completed` and hand back the callback, or give the result back.
    fn claim(&self, result: Result<T>) -> std::result::Result<(DoneFn<T>, Result<T>), Result<T>> {
        let mut state = self.lock();
        if state.phase != Phase::Pending {
            return Err(result);
        }
        state.phase = Phase::Completed;
        state.hook = None;
        match state.on_done.take() {
            Some(on_done) => Ok((on_done, result)),
            None => Err(result),
        }
    }

    fn post_completion(&self, result: Result<T>) {
        if let Ok((on_done, result)) = self.claim(result) {
            self.queue.post(Box::new(move || on_done(result)));
        }
    }
}

trait Cancel: Send + Sync {
    fn cancel(&self) -> bool;
    fn phase(&self) -> Phase;
}

impl<T: Send + 'static> Cancel for Shared<T> {
    fn cancel(&self) -> bool {
        let (on_done, hook) = {
            let mut state = self.lock();
            if state.phase != Phase::Pending {
                return false;
            }
            state.phase = Phase::Canceled;
            (state.on_done.take(), state.hook.take())
        };
        if let Some(hook) = hook {
            hook();
        }
        if let Some(on_done) = on_done {
            self.queue
                .post(Box::new(move || on_done(Err(EngineError::Canceled))));
        }
        true
    }

    fn phase(&self) -> Phase {
        self.lock().phase
    }
}

/// Write side of an operation, handed to the code that produces the result.
pub struct Completer<T: Send + 'static> {
    shared: Arc<Shared<T>>,
}

impl<T: Send + 'static> Completer<T> {
    /// Deliver the terminal result inline. Returns `false` when the operation already
    /// ended (typically canceled), in which case `result` is dropped.
    pub fn complete(self, result: Result<T>) -> bool {
        self.try_complete(result).is_ok()
    }

    /// Like [`Completer::complete`] but hands a rejected result back to the caller so
    /// resources inside it can be released.
    pub fn try_complete(self, result: Result<T>) -> std::result::Result<(), Result<T>> {
        let (on_done, result) = self.shared.claim(result)?;
        on_done(result);
        Ok(())
    }
}

fn abandoned() -> EngineError {
    EngineError::Subsystem(anyhow::anyhow!(
        "asynchronous operation abandoned without a result"
    ))
}

impl<T: Send + 'static> Drop for Completer<T> {
    fn drop(&mut self) {
        {
            let mut state = self.shared.lock();
            if state.phase != Phase::Pending {
                return;
            }
            // Decided by `start` once `work` returns.
            if state.starting {
                state.abandoned = true;
                return;
            }
        }
        self.shared.post_completion(Err(abandoned()));
    }
}

/// Cancels a pending operation. Cheap to clone; stays valid (inert) after the operation ends.
#[derive(Clone)]
pub struct CancelToken {
    op: Arc<dyn Cancel>,
}

impl CancelToken {
    /// Cancel the operation. Returns `true` when this call ended it.
    pub fn cancel(&self) -> bool {
        self.op.cancel()
    }

    pub fn phase(&self) -> Phase {
        self.op.phase()
    }

    /// `true` once the operation completed or was canceled.
    pub fn is_finished(&self) -> bool {
        self.phase() != Phase::Pending
    }
}

impl std::fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelToken")
            .field("phase", &self.phase())
            .finish()
    }
}

/// Starts exactly-once operations.
pub struct CancelableAsyncOp;

impl CancelableAsyncOp {
    /// Start an operation.
    ///
    /// `work` runs synchronously and kicks off the asynchronous part, handing the
    /// [`Completer`] to whatever will produce the result. It may return a [`CancelHook`];
    /// the hook runs exactly once if the operation is canceled, even when cancellation
    /// races ahead of this function returning. If `work` fails synchronously the error is
    /// delivered to `on_done` through the queue.
    pub fn start<T, Q, F, W>(queue: Arc<Q>, on_done: F, work: W) -> CancelToken
    where
        T: Send + 'static,
        Q: WorkQueue + ?Sized + 'static,
        F: FnOnce(Result<T>) + Send + 'static,
        W: FnOnce(Completer<T>) -> Result<Option<CancelHook>>,
    {
        let queue: Arc<dyn WorkQueue> = Arc::new(queue);
        let shared = Arc::new(Shared {
            queue,
            state: Mutex::new(OpState {
                phase: Phase::Pending,
                on_done: Some(Box::new(on_done)),
                hook: None,
                starting: true,
                abandoned: false,
            }),
        });
        let token = CancelToken { op: shared.clone() };

        let started = work(Completer {
            shared: shared.clone(),
        });
        let (run_now, abandoned_early, failed) = {
            let mut state = shared.lock();
            state.starting = false;
            let abandoned_early = std::mem::take(&mut state.abandoned);
            match started {
                Ok(Some(hook)) => match state.phase {
                    Phase::Pending => {
                        state.hook = Some(hook);
                        (None, abandoned_early, None)
                    }
                    Phase::Canceled => (Some(hook), false, None),
                    Phase::Completed => (None, false, None),
                },
                Ok(None) => (None, abandoned_early, None),
                Err(err) => (None, false, Some(err)),
            }
        };
        if let Some(hook) = run_now {
            hook();
        }
        if let Some(err) = failed {
            tracing::debug!(error = %err, "asynchronous operation failed to start");
            shared.post_completion(Err(err));
        }
        if abandoned_early {
            shared.post_completion(Err(abandoned()));
        }
        token
    }
}
