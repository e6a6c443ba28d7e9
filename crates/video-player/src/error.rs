//! Engine error taxonomy.

/// Errors surfaced by the playback engine.
///
/// Resolution and construction failures abort `open`; `NotReady` is returned synchronously
/// by transport commands; `Fatal` is only ever observed through the error state.
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum EngineError {
    /// The locator could not be resolved (bad locator, I/O, unsupported format).
    #[error("source resolution failed: {0}")]
    ResolutionFailed(String),

    /// The resolved object does not expose the media-source capability.
    #[error("resolved object is not a media source: {0}")]
    CapabilityMismatch(String),

    /// Stream enumeration or wiring failed.
    #[error("pipeline construction failed: {0}")]
    PipelineConstructionFailed(String),

    /// A command was issued without an active pipeline.
    #[error("no active pipeline")]
    NotReady,

    /// The operation was superseded by cancellation or shutdown.
    #[error("operation canceled")]
    Canceled,

    /// Unrecoverable playback error reported by the event stream.
    #[error("fatal playback error: {0}")]
    Fatal(String),

    /// The media subsystem rejected a command.
    #[error(transparent)]
    Subsystem(#[from] anyhow::Error),
}

impl EngineError {
    /// `true` for both resolution failure kinds.
    pub fn is_resolution_failure(&self) -> bool {
        matches!(
            self,
            EngineError::ResolutionFailed(_) | EngineError::CapabilityMismatch(_)
        )
    }

    pub(crate) fn construction(err: anyhow::Error) -> Self {
        EngineError::PipelineConstructionFailed(format!("{err:#}"))
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
