//! Boundary to the external media subsystem.
//!
//! The engine owns pipeline wiring, state transitions, lifetimes and frame post-processing.
//! Everything else (source resolution, demuxing, decoding, clocks, rendering, endpoint
//! volume) is reached through the traits below. Collaborator failures are opaque
//! `anyhow` errors; the engine attaches context at the call site.
//!
//! Asynchronous entry points (`begin_resolve`, `begin_get_event`) must never invoke their
//! callback synchronously, since callers may hold locks that the callback needs.

use std::fmt;
use std::sync::Arc;

use crate::pipeline::PipelineGraph;

/// Unit of work posted to a [`WorkQueue`].
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Asynchronous work queue owned by the media subsystem.
pub trait WorkQueue: Send + Sync {
    /// Run `job` on one of the queue's worker threads. Never runs it inline.
    fn post(&self, job: Job);
}

impl<Q: WorkQueue + ?Sized> WorkQueue for Arc<Q> {
    fn post(&self, job: Job) {
        (**self).post(job)
    }
}

/// Opaque source locator (path or URI).
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct MediaLocator(String);

impl MediaLocator {
    pub fn new(locator: impl Into<String>) -> Self {
        Self(locator.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MediaLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for MediaLocator {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for MediaLocator {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Opaque native render target (window or surface handle).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct RenderTarget(pub u64);

/// Correlates an outstanding resolution with [`MediaSubsystem::cancel_resolve`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ResolveCookie(pub u64);

/// Object produced by a resolution.
pub enum ResolvedObject {
    /// A playable source.
    MediaSource(Arc<dyn MediaSource>),
    /// Something else (byte stream, scheme handler, ...), named by kind.
    Other(String),
}

impl fmt::Debug for ResolvedObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResolvedObject::MediaSource(_) => f.write_str("MediaSource"),
            ResolvedObject::Other(kind) => f.debug_tuple("Other").field(kind).finish(),
        }
    }
}

pub type ResolveCallback = Box<dyn FnOnce(anyhow::Result<ResolvedObject>) + Send + 'static>;
pub type EventCallback = Box<dyn FnOnce(anyhow::Result<MediaEvent>) + Send + 'static>;

/// Entry point of the media subsystem.
pub trait MediaSubsystem: WorkQueue {
    /// Start resolving `locator`. `callback` fires once with the outcome unless the
    /// resolution is canceled first, in which case it may be dropped without running.
    fn begin_resolve(
        &self,
        locator: &MediaLocator,
        callback: ResolveCallback,
    ) -> anyhow::Result<ResolveCookie>;

    /// Best-effort cancellation of an outstanding resolution.
    fn cancel_resolve(&self, cookie: ResolveCookie);

    /// Create an empty media pipeline.
    fn create_pipeline(&self) -> anyhow::Result<Arc<dyn MediaPipeline>>;

    /// Endpoint volume control, if the platform exposes one.
    fn audio_volume(&self) -> Option<Arc<dyn AudioVolume>>;
}

/// Resolved, playable source.
pub trait MediaSource: Send + Sync {
    /// Fresh presentation descriptor listing the source's streams.
    fn presentation(&self) -> anyhow::Result<Box<dyn PresentationDescriptor>>;

    /// Named source attribute, when the source carries one.
    fn attribute(&self, _key: &str) -> Option<String> {
        None
    }

    /// Release the source's resources.
    fn shutdown(&self) -> anyhow::Result<()>;
}

/// Stream listing of one presentation.
pub trait PresentationDescriptor: Send {
    fn stream_count(&self) -> anyhow::Result<usize>;
    fn stream(&self, index: usize) -> anyhow::Result<StreamDescriptor>;
    /// Exclude a stream from decoding.
    fn deselect_stream(&mut self, index: usize) -> anyhow::Result<()>;
    /// Total duration in ticks, if the source reports one.
    fn duration_ticks(&self) -> Option<i64>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MajorType {
    Video,
    Audio,
    Other,
}

/// Format subtype of a stream or sink.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Subtype {
    /// 4:2:0 planar luma + interleaved chroma.
    Nv12,
    /// Packed 32-bit RGB.
    Rgb32,
    /// Linear PCM audio.
    Pcm,
    Other(String),
}

/// Current media type of one stream.
#[derive(Clone, Debug, PartialEq)]
pub struct MediaFormat {
    pub subtype: Subtype,
    /// Frame width and height for video streams.
    pub frame_size: Option<(u32, u32)>,
    /// Nominal frames per second for video streams.
    pub frame_rate: Option<u32>,
}

/// Per-stream metadata.
#[derive(Clone, Debug, PartialEq)]
pub struct StreamDescriptor {
    pub index: usize,
    pub major_type: MajorType,
    pub selected: bool,
    pub current_format: Option<MediaFormat>,
}

/// Video geometry established while building the pipeline.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct VideoFormat {
    pub width: u32,
    pub height: u32,
    pub layout: Subtype,
}

/// Events delivered by [`MediaPipeline::begin_get_event`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MediaEvent {
    BufferingStarted,
    BufferingStopped,
    SessionStarted,
    SessionPaused,
    SessionStopped,
    SessionClosed,
    SessionEnded,
    Error(String),
    /// Any event type the engine does not react to.
    Other(u32),
}

/// Media session driving one topology.
///
/// `begin_get_event` holds its callback until the next event; `shutdown` drops any pending
/// callback (or completes it asynchronously with an error).
pub trait MediaPipeline: Send + Sync {
    fn set_topology(&self, graph: &PipelineGraph) -> anyhow::Result<()>;
    /// Start from `position_ticks`, or resume from the current position.
    fn start(&self, position_ticks: Option<i64>) -> anyhow::Result<()>;
    fn pause(&self) -> anyhow::Result<()>;
    fn stop(&self) -> anyhow::Result<()>;
    fn close(&self) -> anyhow::Result<()>;
    fn shutdown(&self) -> anyhow::Result<()>;
    fn clock(&self) -> Option<Arc<dyn PresentationClock>>;
    fn rate_control(&self) -> Option<Arc<dyn RateControl>>;
    fn begin_get_event(&self, callback: EventCallback) -> anyhow::Result<()>;
}

pub trait PresentationClock: Send + Sync {
    /// Current presentation time in ticks.
    fn time_ticks(&self) -> anyhow::Result<i64>;
}

pub trait RateControl: Send + Sync {
    fn set_rate(&self, rate: f32) -> anyhow::Result<()>;
}

/// Endpoint volume in `0.0..=1.0` plus mute.
pub trait AudioVolume: Send + Sync {
    fn master_volume(&self) -> anyhow::Result<f32>;
    fn set_master_volume(&self, volume: f32) -> anyhow::Result<()>;
    fn is_muted(&self) -> anyhow::Result<bool>;
    fn set_mute(&self, muted: bool) -> anyhow::Result<()>;
}

/// Receives decoded samples from a frame-grabbing video sink.
pub trait SampleCallback: Send + Sync {
    /// One decoded sample. Times are in ticks.
    fn on_process_sample(&self, sample: &[u8], sample_time: i64, sample_duration: i64);
    /// The sink is being torn down; no further samples follow.
    fn on_shutdown(&self);
}
