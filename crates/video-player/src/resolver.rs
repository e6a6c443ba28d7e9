//! Asynchronous source resolution.

use std::sync::{Arc, Mutex, MutexGuard};

use crate::async_op::{CancelHook, CancelToken, CancelableAsyncOp, Completer};
use crate::error::{EngineError, Result};
use crate::media::{MediaLocator, MediaSource, MediaSubsystem, ResolvedObject};

pub type ResolveResult = Result<Arc<dyn MediaSource>>;

/// Resolves locators into [`MediaSource`]s, one request at a time.
pub struct SourceResolver {
    subsystem: Arc<dyn MediaSubsystem>,
    pending: Mutex<Option<CancelToken>>,
}

impl SourceResolver {
    pub fn new(subsystem: Arc<dyn MediaSubsystem>) -> Self {
        Self {
            subsystem,
            pending: Mutex::new(None),
        }
    }

    fn lock_pending(&self) -> MutexGuard<'_, Option<CancelToken>> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Resolve `locator`; `on_result` fires exactly once, off the caller's thread.
    ///
    /// A request still pending from an earlier call is canceled first.
    pub fn resolve_async<F>(&self, locator: &MediaLocator, on_result: F)
    where
        F: FnOnce(ResolveResult) + Send + 'static,
    {
        let mut pending = self.lock_pending();
        if let Some(previous) = pending.take() {
            if previous.cancel() {
                tracing::debug!("previous resolution superseded");
            }
        }

        let subsystem = self.subsystem.clone();
        let locator = locator.clone();
        let token = CancelableAsyncOp::start(
            self.subsystem.clone(),
            on_result,
            move |completer: Completer<Arc<dyn MediaSource>>| {
                tracing::debug!(locator = %locator, "resolving source");
                let cookie = subsystem
                    .begin_resolve(
                        &locator,
                        Box::new(move |resolved| deliver(completer, resolved)),
                    )
                    .map_err(|e| EngineError::ResolutionFailed(format!("{e:#}")))?;
                let hook: CancelHook = Box::new(move || subsystem.cancel_resolve(cookie));
                Ok(Some(hook))
            },
        );
        *pending = Some(token);
    }

    /// Cancel the outstanding request, if any. Safe to call repeatedly.
    pub fn cancel_pending(&self) {
        if let Some(token) = self.lock_pending().take() {
            if token.cancel() {
                tracing::debug!("pending resolution canceled");
            }
        }
    }

    pub fn has_pending(&self) -> bool {
        self.lock_pending()
            .as_ref()
            .is_some_and(|token| !token.is_finished())
    }
}

/// Validate the resolved object and complete the operation.
fn deliver(
    completer: Completer<Arc<dyn MediaSource>>,
    resolved: anyhow::Result<ResolvedObject>,
) {
    let result = match resolved {
        Ok(ResolvedObject::MediaSource(source)) => Ok(source),
        Ok(ResolvedObject::Other(kind)) => Err(EngineError::CapabilityMismatch(kind)),
        Err(err) => Err(EngineError::ResolutionFailed(format!("{err:#}"))),
    };
    if let Err(Ok(late)) = completer.try_complete(result) {
        tracing::debug!("source arrived after cancellation; shutting it down");
        if let Err(e) = late.shutdown() {
            tracing::warn!(error = %format!("{e:#}"), "late source shutdown failed");
        }
    }
}
