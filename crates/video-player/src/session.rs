//! Playback session: asynchronous open, transport controls, event-driven state machine and
//! ordered teardown.
//!
//! All mutable session state sits behind one mutex. Callbacks from the media subsystem
//! (resolution, pipeline events) carry an [`InFlight`] reference and re-check the shut-down
//! flag under that mutex before touching anything. Lock order is session, then pipeline:
//! the pipeline never calls back synchronously, so commands may hold the session lock
//! while talking to it.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use video_bridge_types::{PlaybackState, SessionStatus, StateChangeEvent};

use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::events;
use crate::lifetime::{InFlight, Lifecycle};
use crate::media::{
    AudioVolume, MediaEvent, MediaLocator, MediaPipeline, MediaSource, MediaSubsystem,
    PresentationClock, RateControl, RenderTarget, VideoFormat,
};
use crate::pipeline::{BuiltPipeline, PipelineBuilder, PipelineGraph, VideoOutput};
use crate::resolver::{ResolveResult, SourceResolver};
use crate::sample_sink::{FrameConsumer, FrameSampleSink, FrameSlot};
use crate::status::SessionStatusState;
use crate::time;

pub type SessionId = i64;

static NEXT_SESSION_ID: AtomicI64 = AtomicI64::new(1);

/// Receives state-change notifications.
///
/// Called with the session lock held: implementations must not block and must not call
/// back into the session.
pub trait StateObserver: Send + Sync {
    fn on_state_changed(&self, event: StateChangeEvent);
}

impl<F> StateObserver for F
where
    F: Fn(StateChangeEvent) + Send + Sync,
{
    fn on_state_changed(&self, event: StateChangeEvent) {
        self(event)
    }
}

/// Optional collaborators supplied at open time.
#[derive(Clone, Default)]
pub struct OpenOptions {
    /// Id to assign; a process-unique id is generated when absent.
    pub session_id: Option<SessionId>,
    /// Pull-model consumer for converted frames. Selects the frame-grabbing video sink.
    pub consumer: Option<Arc<dyn FrameConsumer>>,
    /// Native render target, used when no frame consumer is given.
    pub render_target: Option<RenderTarget>,
    pub observer: Option<Arc<dyn StateObserver>>,
}

/// Result of a successful open.
#[derive(Clone, Debug, PartialEq)]
pub struct OpenInfo {
    /// Duration in milliseconds, `-1` when unknown.
    pub duration_ms: i64,
    /// Frame width (0 without video).
    pub width: u32,
    /// Frame height (0 without video).
    pub height: u32,
    /// Current endpoint volume.
    pub volume: f32,
}

struct ActivePipeline {
    backend: Arc<dyn MediaPipeline>,
    graph: PipelineGraph,
    clock: Option<Arc<dyn PresentationClock>>,
    rate: Option<Arc<dyn RateControl>>,
}

struct SessionState {
    playback: PlaybackState,
    source: Option<Arc<dyn MediaSource>>,
    pipeline: Option<ActivePipeline>,
    duration_ticks: Option<i64>,
    video_format: Option<VideoFormat>,
    last_error: Option<String>,
    rate: f32,
}

impl Default for SessionState {
    fn default() -> Self {
        Self {
            playback: PlaybackState::Idle,
            source: None,
            pipeline: None,
            duration_ticks: None,
            video_format: None,
            last_error: None,
            rate: 1.0,
        }
    }
}

struct SessionInner {
    id: SessionId,
    subsystem: Arc<dyn MediaSubsystem>,
    config: EngineConfig,
    observer: Option<Arc<dyn StateObserver>>,
    render_target: Option<RenderTarget>,
    sink: Option<Arc<FrameSampleSink>>,
    volume: Option<Arc<dyn AudioVolume>>,
    resolver: SourceResolver,
    shut_down: AtomicBool,
    state: Mutex<SessionState>,
}

impl Lifecycle for SessionInner {
    fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }
}

/// Owning handle of one playback session. Dropping it shuts the session down.
pub struct PlaybackSession {
    inner: Arc<SessionInner>,
}

impl PlaybackSession {
    /// Start opening `locator`.
    ///
    /// Returns immediately; `on_opened` fires exactly once from a subsystem thread with the
    /// open outcome. Shutting the session down before resolution completes yields
    /// `Err(Canceled)`.
    pub fn open<F>(
        subsystem: Arc<dyn MediaSubsystem>,
        config: EngineConfig,
        locator: MediaLocator,
        options: OpenOptions,
        on_opened: F,
    ) -> Self
    where
        F: FnOnce(Result<OpenInfo>) + Send + 'static,
    {
        let id = options
            .session_id
            .unwrap_or_else(|| NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed));
        let sink = options
            .consumer
            .map(|consumer| Arc::new(FrameSampleSink::new(config.clone(), Some(consumer))));
        let inner = Arc::new(SessionInner {
            id,
            volume: subsystem.audio_volume(),
            resolver: SourceResolver::new(subsystem.clone()),
            subsystem,
            config,
            observer: options.observer,
            render_target: options.render_target,
            sink,
            shut_down: AtomicBool::new(false),
            state: Mutex::new(SessionState::default()),
        });

        tracing::info!(session_id = id, locator = %locator, "opening media");
        let guard = InFlight::acquire(&inner);
        inner.resolver.resolve_async(&locator, move |result| {
            let Some(inner) = guard.enter() else {
                on_opened(Err(EngineError::Canceled));
                return;
            };
            on_opened(inner.finish_open(result));
        });

        Self { inner }
    }

    pub fn id(&self) -> SessionId {
        self.inner.id
    }

    /// Start playback, seeking first when `position_ms` is non-negative.
    pub fn play(&self, position_ms: Option<i64>) -> Result<()> {
        match position_ms {
            Some(ms) if ms >= 0 => self.seek(ms),
            _ => self
                .inner
                .with_pipeline("start", |active| active.backend.start(None)),
        }
    }

    pub fn pause(&self) -> Result<()> {
        self.inner
            .with_pipeline("pause", |active| active.backend.pause())
    }

    /// Restart the clock at `position_ms`.
    ///
    /// Negative positions start from zero. Positions past the end of media go to the
    /// pipeline unchanged; how it treats them is up to the pipeline.
    pub fn seek(&self, position_ms: i64) -> Result<()> {
        let ticks = time::ms_to_ticks(position_ms.max(0));
        self.inner
            .with_pipeline("seek", |active| active.backend.start(Some(ticks)))
    }

    /// Presentation position in milliseconds, `-1` without a clock.
    pub fn position_ms(&self) -> i64 {
        let state = self.inner.lock_state();
        self.inner
            .position_ticks(&state)
            .map(time::ticks_to_ms)
            .unwrap_or(time::UNKNOWN_MS)
    }

    /// Media duration in milliseconds, `-1` without a pipeline.
    pub fn duration_ms(&self) -> i64 {
        let state = self.inner.lock_state();
        if self.inner.is_shut_down() || state.pipeline.is_none() {
            return time::UNKNOWN_MS;
        }
        state
            .duration_ticks
            .map(time::ticks_to_ms)
            .unwrap_or(time::UNKNOWN_MS)
    }

    pub fn set_rate(&self, rate: f32) -> Result<()> {
        let mut state = self.inner.lock_state();
        if self.inner.is_shut_down() {
            return Err(EngineError::NotReady);
        }
        let control = state
            .pipeline
            .as_ref()
            .and_then(|active| active.rate.clone())
            .ok_or(EngineError::NotReady)?;
        control.set_rate(rate).map_err(|err| {
            tracing::warn!(session_id = self.inner.id, rate, "set rate failed: {err:#}");
            EngineError::Subsystem(err)
        })?;
        state.rate = rate;
        Ok(())
    }

    pub fn volume(&self) -> Result<f32> {
        self.inner.with_volume("get volume", |volume| volume.master_volume())
    }

    /// Set the endpoint volume; values are clamped to `0.0..=1.0`.
    pub fn set_volume(&self, volume: f32) -> Result<()> {
        if !volume.is_finite() {
            return Err(EngineError::Subsystem(anyhow::anyhow!(
                "volume must be finite, got {volume}"
            )));
        }
        let volume = volume.clamp(0.0, 1.0);
        self.inner
            .with_volume("set volume", |control| control.set_master_volume(volume))
    }

    pub fn set_mute(&self, muted: bool) -> Result<()> {
        self.inner
            .with_volume("set mute", |control| control.set_mute(muted))
    }

    /// Tear the session down. Idempotent.
    pub fn shutdown(&self) {
        self.inner.shutdown();
    }

    /// Stop delivering frames to the consumer without tearing down playback.
    pub fn detach_consumer(&self) {
        if let Some(sink) = &self.inner.sink {
            sink.detach_consumer();
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.is_shut_down()
    }

    pub fn state(&self) -> PlaybackState {
        self.inner.lock_state().playback
    }

    /// Frame size established at open.
    pub fn video_size(&self) -> Option<(u32, u32)> {
        self.inner
            .lock_state()
            .video_format
            .as_ref()
            .map(|format| (format.width, format.height))
    }

    /// Shared frame buffer, when the session was opened with a frame consumer.
    pub fn frame_slot(&self) -> Option<Arc<FrameSlot>> {
        self.inner.sink.as_ref().map(|sink| sink.slot())
    }

    /// The fatal error that drove the session into the error state, if any.
    pub fn last_error(&self) -> Option<EngineError> {
        self.inner
            .lock_state()
            .last_error
            .clone()
            .map(EngineError::Fatal)
    }

    pub fn status(&self) -> SessionStatus {
        self.inner.status()
    }
}

impl Drop for PlaybackSession {
    fn drop(&mut self) {
        self.inner.shutdown();
    }
}

impl SessionInner {
    fn lock_state(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn video_output(&self) -> VideoOutput {
        match (&self.sink, self.render_target) {
            (Some(sink), _) => VideoOutput::Frames(sink.clone()),
            (None, Some(target)) => VideoOutput::Renderer(target),
            (None, None) => VideoOutput::Disabled,
        }
    }

    /// Resolution completed: build and arm the pipeline.
    fn finish_open(self: &Arc<Self>, result: ResolveResult) -> Result<OpenInfo> {
        let source = match result {
            Ok(source) => source,
            Err(err) => {
                tracing::warn!(session_id = self.id, "open failed: {err}");
                self.shutdown();
                return Err(err);
            }
        };

        let mut state = self.lock_state();
        if self.is_shut_down() {
            if let Err(e) = source.shutdown() {
                tracing::warn!(session_id = self.id, "source shutdown failed: {e:#}");
            }
            return Err(EngineError::Canceled);
        }

        if let Err(err) = self.install_pipeline(&mut state, source) {
            tracing::warn!(session_id = self.id, "open failed: {err}");
            self.shutdown_locked(&mut state);
            return Err(err);
        }

        let (width, height) = state
            .video_format
            .as_ref()
            .map(|format| (format.width, format.height))
            .unwrap_or((0, 0));
        let info = OpenInfo {
            duration_ms: state
                .duration_ticks
                .map(time::ticks_to_ms)
                .unwrap_or(time::UNKNOWN_MS),
            width,
            height,
            volume: self.current_volume(),
        };
        tracing::info!(
            session_id = self.id,
            duration_ms = info.duration_ms,
            width,
            height,
            "media opened"
        );
        Ok(info)
    }

    fn install_pipeline(
        self: &Arc<Self>,
        state: &mut SessionState,
        source: Arc<dyn MediaSource>,
    ) -> Result<()> {
        state.source = Some(source.clone());

        let BuiltPipeline {
            graph,
            video_format,
            duration_ticks,
        } = PipelineBuilder::new(self.video_output()).build(&source)?;
        let backend = self
            .subsystem
            .create_pipeline()
            .map_err(EngineError::construction)?;

        let active = state.pipeline.insert(ActivePipeline {
            backend: backend.clone(),
            graph,
            clock: None,
            rate: None,
        });
        backend
            .set_topology(&active.graph)
            .map_err(EngineError::construction)?;
        active.clock = backend.clock();
        active.rate = backend.rate_control();

        if let (Some(sink), Some(format)) = (&self.sink, video_format.clone()) {
            sink.set_format(format);
        }
        state.duration_ticks = duration_ticks;
        state.video_format = video_format;

        self.arm_events(&backend)
            .map_err(|err| EngineError::construction(err.context("request pipeline events")))
    }

    /// Register for the next pipeline event.
    fn arm_events(self: &Arc<Self>, backend: &Arc<dyn MediaPipeline>) -> anyhow::Result<()> {
        let guard = InFlight::acquire(self);
        backend.begin_get_event(Box::new(move |event| {
            if let Some(inner) = guard.enter() {
                inner.on_event(event);
            }
        }))
    }

    fn on_event(self: &Arc<Self>, event: anyhow::Result<MediaEvent>) {
        let mut state = self.lock_state();
        if self.is_shut_down() {
            return;
        }
        let event = match event {
            Ok(event) => event,
            Err(err) => {
                tracing::warn!(session_id = self.id, "event stream ended: {err:#}");
                return;
            }
        };

        if let Some(active) = state.pipeline.as_ref() {
            if let Err(err) = self.arm_events(&active.backend) {
                tracing::warn!(session_id = self.id, "re-arming events failed: {err:#}");
            }
        }

        let Some(next) = events::map_event(&event) else {
            tracing::trace!(session_id = self.id, ?event, "ignoring pipeline event");
            return;
        };
        if let Some(msg) = events::error_message(&event) {
            tracing::error!(session_id = self.id, error = msg, "playback error");
            state.last_error = Some(msg.to_string());
        }
        self.transition(&mut state, next);
    }

    fn transition(&self, state: &mut SessionState, next: PlaybackState) {
        let previous = std::mem::replace(&mut state.playback, next);
        tracing::info!(session_id = self.id, from = ?previous, to = ?next, "playback state changed");
        if let Some(observer) = &self.observer {
            let error = match next {
                PlaybackState::Error => state.last_error.clone(),
                _ => None,
            };
            observer.on_state_changed(StateChangeEvent {
                session_id: self.id,
                state: next,
                error,
            });
        }
    }

    fn with_pipeline<R>(
        &self,
        op: &'static str,
        f: impl FnOnce(&ActivePipeline) -> anyhow::Result<R>,
    ) -> Result<R> {
        let state = self.lock_state();
        if self.is_shut_down() {
            return Err(EngineError::NotReady);
        }
        let active = state.pipeline.as_ref().ok_or(EngineError::NotReady)?;
        tracing::debug!(session_id = self.id, op, "pipeline command");
        f(active).map_err(|err| {
            tracing::warn!(session_id = self.id, op, "pipeline command failed: {err:#}");
            EngineError::Subsystem(err)
        })
    }

    fn with_volume<R>(
        &self,
        op: &'static str,
        f: impl FnOnce(&dyn AudioVolume) -> anyhow::Result<R>,
    ) -> Result<R> {
        let state = self.lock_state();
        if self.is_shut_down() || state.pipeline.is_none() {
            return Err(EngineError::NotReady);
        }
        let control = self.volume.as_deref().ok_or(EngineError::NotReady)?;
        f(control).map_err(|err| {
            tracing::warn!(session_id = self.id, op, "volume control failed: {err:#}");
            EngineError::Subsystem(err)
        })
    }

    fn current_volume(&self) -> f32 {
        self.volume
            .as_ref()
            .and_then(|control| control.master_volume().ok())
            .unwrap_or(self.config.default_volume)
    }

    fn position_ticks(&self, state: &SessionState) -> Option<i64> {
        if self.is_shut_down() {
            return None;
        }
        let clock = state.pipeline.as_ref()?.clock.as_ref()?;
        clock.time_ticks().ok()
    }

    fn status(&self) -> SessionStatus {
        let state = self.lock_state();
        let live = !self.is_shut_down() && state.pipeline.is_some();
        let control = self.volume.as_ref().filter(|_| live);
        SessionStatusState {
            state: state.playback,
            duration_ticks: state.duration_ticks.filter(|_| live),
            position_ticks: self.position_ticks(&state),
            video: state.video_format.clone(),
            volume: control.and_then(|c| c.master_volume().ok()),
            muted: control.and_then(|c| c.is_muted().ok()),
            rate: state.rate,
            frames: self
                .sink
                .as_ref()
                .map(|sink| sink.counters())
                .unwrap_or_default(),
            last_error: state.last_error.clone(),
            shut_down: self.is_shut_down(),
        }
        .snapshot(self.id)
    }

    fn shutdown(&self) {
        let mut state = self.lock_state();
        self.shutdown_locked(&mut state);
    }

    /// Teardown in order: flag, pending resolution, pipeline stop/close, resource release.
    fn shutdown_locked(&self, state: &mut SessionState) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::info!(session_id = self.id, "shutting down session");
        self.resolver.cancel_pending();

        let active = state.pipeline.take();
        if let Some(active) = &active {
            log_step(self.id, "stop pipeline", active.backend.stop());
            log_step(self.id, "close pipeline", active.backend.close());
            // Drops the pending event registration and with it the session reference.
            log_step(self.id, "shut down pipeline", active.backend.shutdown());
        }
        if let Some(source) = state.source.take() {
            log_step(self.id, "shut down source", source.shutdown());
        }
        if let Some(active) = active {
            active.graph.shutdown_sinks();
        }
        if let Some(sink) = &self.sink {
            sink.detach_consumer();
        }
        state.duration_ticks = None;
    }
}

fn log_step(session_id: SessionId, step: &'static str, result: anyhow::Result<()>) {
    if let Err(e) = result {
        tracing::warn!(session_id, step, "teardown step failed: {e:#}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::{
        EventCallback, Job, MajorType, MediaFormat, PresentationDescriptor, ResolveCallback,
        ResolveCookie, ResolvedObject, SampleCallback, StreamDescriptor, Subtype, WorkQueue,
    };
    use crate::synthetic::{SyntheticConfig, SyntheticSubsystem};
    use crossbeam_channel::{Receiver, unbounded};
    use std::collections::HashMap;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    const WAIT: Duration = Duration::from_secs(10);

    fn subsystem() -> Arc<dyn MediaSubsystem> {
        SyntheticSubsystem::new(SyntheticConfig::default()).expect("subsystem")
    }

    struct Harness {
        session: PlaybackSession,
        opened: Receiver<Result<OpenInfo>>,
        events: Receiver<StateChangeEvent>,
    }

    fn open_with(locator: &str, consumer: Option<Arc<dyn FrameConsumer>>) -> Harness {
        let (open_tx, opened) = unbounded();
        let (event_tx, events) = unbounded();
        let observer: Arc<dyn StateObserver> = Arc::new(move |event: StateChangeEvent| {
            let _ = event_tx.send(event);
        });
        let session = PlaybackSession::open(
            subsystem(),
            EngineConfig::default(),
            MediaLocator::from(locator),
            OpenOptions {
                consumer,
                observer: Some(observer),
                ..OpenOptions::default()
            },
            move |result| {
                let _ = open_tx.send(result);
            },
        );
        Harness {
            session,
            opened,
            events,
        }
    }

    fn wait_for(events: &Receiver<StateChangeEvent>, state: PlaybackState) -> StateChangeEvent {
        loop {
            let event = events.recv_timeout(WAIT).expect("state change");
            if event.state == state {
                return event;
            }
        }
    }

    #[test]
    fn open_reports_media_info() {
        let h = open_with(
            "synthetic://clip?width=320&height=180&duration_ms=3000&resolve_delay_ms=1",
            None,
        );
        let info = h.opened.recv_timeout(WAIT).unwrap().expect("opened");
        assert_eq!(info.duration_ms, 3000);
        // no consumer and no render target: video is not wired
        assert_eq!((info.width, info.height), (0, 0));
        assert_eq!(info.volume, 1.0);
        assert_eq!(h.session.duration_ms(), 3000);
        assert_eq!(h.session.state(), PlaybackState::Idle);
    }

    #[test]
    fn commands_before_open_completes_are_not_ready() {
        let h = open_with("synthetic://clip?resolve_delay_ms=200", None);
        assert!(matches!(h.session.play(None), Err(EngineError::NotReady)));
        assert!(matches!(h.session.pause(), Err(EngineError::NotReady)));
        assert!(matches!(h.session.set_rate(2.0), Err(EngineError::NotReady)));
        assert!(matches!(h.session.volume(), Err(EngineError::NotReady)));
        assert_eq!(h.session.position_ms(), -1);
        assert_eq!(h.session.duration_ms(), -1);
    }

    #[test]
    fn play_pause_drive_state_machine() {
        let h = open_with("synthetic://clip?duration_ms=10000&resolve_delay_ms=1", None);
        h.opened.recv_timeout(WAIT).unwrap().expect("opened");
        h.session.play(None).unwrap();
        let started = wait_for(&h.events, PlaybackState::Started);
        assert_eq!(started.session_id, h.session.id());
        h.session.pause().unwrap();
        wait_for(&h.events, PlaybackState::Paused);
        assert_eq!(h.session.state(), PlaybackState::Paused);
        h.session.set_rate(2.0).unwrap();
        assert_eq!(h.session.status().rate, 2.0);
    }

    #[test]
    fn seek_then_position_reports_at_least_target() {
        let h = open_with("synthetic://clip?duration_ms=10000&resolve_delay_ms=1", None);
        h.opened.recv_timeout(WAIT).unwrap().expect("opened");
        h.session.play(None).unwrap();
        wait_for(&h.events, PlaybackState::Started);
        h.session.seek(4000).unwrap();
        assert!(h.session.position_ms() >= 4000);
        h.session.play(Some(6000)).unwrap();
        assert!(h.session.position_ms() >= 6000);
    }

    #[test]
    fn seek_past_the_end_ends_playback() {
        let h = open_with("synthetic://clip?duration_ms=1000&resolve_delay_ms=1", None);
        h.opened.recv_timeout(WAIT).unwrap().expect("opened");
        h.session.play(None).unwrap();
        wait_for(&h.events, PlaybackState::Started);
        h.session.seek(60_000).unwrap();
        wait_for(&h.events, PlaybackState::Ended);
        assert_eq!(h.session.position_ms(), 1000);
    }

    #[test]
    fn natural_end_and_restart() {
        let h = open_with("synthetic://clip?duration_ms=150&resolve_delay_ms=1", None);
        h.opened.recv_timeout(WAIT).unwrap().expect("opened");
        h.session.play(None).unwrap();
        wait_for(&h.events, PlaybackState::Ended);
        h.session.play(None).unwrap();
        wait_for(&h.events, PlaybackState::Started);
    }

    #[test]
    fn fatal_error_surfaces_as_state() {
        let h = open_with(
            "synthetic://clip?duration_ms=10000&error_at_ms=50&resolve_delay_ms=1",
            None,
        );
        h.opened.recv_timeout(WAIT).unwrap().expect("opened");
        h.session.play(None).unwrap();
        let event = wait_for(&h.events, PlaybackState::Error);
        assert!(event.error.is_some());
        assert!(matches!(h.session.last_error(), Some(EngineError::Fatal(_))));
        assert!(!h.session.is_shut_down());
        // Error is recoverable through an explicit play.
        h.session.play(None).unwrap();
        wait_for(&h.events, PlaybackState::Started);
    }

    #[test]
    fn no_commands_or_notifications_after_shutdown() {
        let h = open_with("synthetic://clip?duration_ms=10000&resolve_delay_ms=1", None);
        h.opened.recv_timeout(WAIT).unwrap().expect("opened");
        h.session.play(None).unwrap();
        wait_for(&h.events, PlaybackState::Started);

        h.session.shutdown();
        h.session.shutdown();
        let _ = h.events.try_iter().count();

        assert!(h.session.is_shut_down());
        assert!(matches!(h.session.play(None), Err(EngineError::NotReady)));
        assert!(matches!(h.session.pause(), Err(EngineError::NotReady)));
        assert!(matches!(h.session.seek(10), Err(EngineError::NotReady)));
        assert!(matches!(h.session.set_rate(1.0), Err(EngineError::NotReady)));
        assert!(matches!(h.session.set_volume(0.5), Err(EngineError::NotReady)));
        assert!(matches!(h.session.set_mute(true), Err(EngineError::NotReady)));
        assert_eq!(h.session.position_ms(), -1);
        assert_eq!(h.session.duration_ms(), -1);
        assert!(h.session.status().shut_down);
        assert!(h.events.recv_timeout(Duration::from_millis(200)).is_err());
    }

    #[test]
    fn shutdown_during_resolution_reports_canceled() {
        let h = open_with("synthetic://clip?resolve_delay_ms=100", None);
        h.session.shutdown();
        assert!(matches!(
            h.opened.recv_timeout(WAIT).unwrap(),
            Err(EngineError::Canceled)
        ));
        assert!(h.opened.recv_timeout(Duration::from_millis(300)).is_err());
    }

    #[test]
    fn dropping_the_handle_cancels_open() {
        let h = open_with("synthetic://clip?resolve_delay_ms=100", None);
        let Harness { session, opened, .. } = h;
        drop(session);
        assert!(opened.recv_timeout(WAIT).unwrap().is_err());
    }

    #[test]
    fn failed_resolution_fails_open() {
        let h = open_with("synthetic://clip?fail=resolve&resolve_delay_ms=1", None);
        let err = h.opened.recv_timeout(WAIT).unwrap().unwrap_err();
        assert!(err.is_resolution_failure());
        assert!(matches!(h.session.play(None), Err(EngineError::NotReady)));
    }

    #[test]
    fn construction_failure_fails_open() {
        for fail in ["streams", "topology"] {
            let h = open_with(
                &format!("synthetic://clip?fail={fail}&resolve_delay_ms=1"),
                None,
            );
            let err = h.opened.recv_timeout(WAIT).unwrap().unwrap_err();
            assert!(
                matches!(err, EngineError::PipelineConstructionFailed(_)),
                "{fail}: {err:?}"
            );
            assert!(h.session.is_shut_down());
        }
    }

    #[derive(Default)]
    struct Frames {
        hits: AtomicUsize,
    }

    impl FrameConsumer for Frames {
        fn frame_available(&self) {
            self.hits.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn frames_reach_consumer_as_rgba() {
        let frames = Arc::new(Frames::default());
        let consumer: Arc<dyn FrameConsumer> = frames.clone();
        let h = open_with(
            "synthetic://clip?width=64&height=36&duration_ms=10000&resolve_delay_ms=1",
            Some(consumer),
        );
        let info = h.opened.recv_timeout(WAIT).unwrap().expect("opened");
        assert_eq!((info.width, info.height), (64, 36));
        assert_eq!(h.session.video_size(), Some((64, 36)));
        h.session.play(None).unwrap();

        let slot = h.session.frame_slot().expect("slot");
        let deadline = std::time::Instant::now() + WAIT;
        let mut seen = None;
        while seen.is_none() && std::time::Instant::now() < deadline {
            seen = slot.read(|view| (view.width, view.height, view.data.len()));
            std::thread::sleep(Duration::from_millis(10));
        }
        let (w, h_px, len) = seen.expect("frame delivered");
        assert_eq!((w, h_px), (64, 36));
        assert_eq!(len, crate::convert::rgba_len(64, 36, 10));
        assert!(frames.hits.load(Ordering::SeqCst) >= 1);

        h.session.shutdown();
        let delivered = h.session.status().frames_delivered;
        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(h.session.status().frames_delivered, delivered);
    }

    #[test]
    fn volume_controls_pass_through() {
        let h = open_with("synthetic://clip?resolve_delay_ms=1", None);
        h.opened.recv_timeout(WAIT).unwrap().expect("opened");
        h.session.set_volume(0.25).unwrap();
        assert_eq!(h.session.volume().unwrap(), 0.25);
        h.session.set_volume(3.0).unwrap();
        assert_eq!(h.session.volume().unwrap(), 1.0);
        h.session.set_mute(true).unwrap();
        assert_eq!(h.session.status().muted, Some(true));
        assert!(h.session.set_volume(f32::NAN).is_err());
    }

    #[test]
    fn shutting_down_half_of_many_pending_opens() {
        let subsystem = subsystem();
        let (tx, rx) = unbounded();
        let sessions: Vec<PlaybackSession> = (0..100)
            .map(|i| {
                let tx = tx.clone();
                PlaybackSession::open(
                    subsystem.clone(),
                    EngineConfig::default(),
                    MediaLocator::from("synthetic://many?resolve_delay_ms=300"),
                    OpenOptions {
                        session_id: Some(10_000 + i),
                        ..OpenOptions::default()
                    },
                    move |result| {
                        let _ = tx.send((10_000 + i, result.is_ok()));
                    },
                )
            })
            .collect();
        for session in sessions.iter().filter(|s| s.id() % 2 == 0) {
            session.shutdown();
        }

        let mut outcomes = HashMap::new();
        for _ in 0..100 {
            let (id, ok) = rx.recv_timeout(WAIT).expect("open outcome");
            assert!(outcomes.insert(id, ok).is_none(), "duplicate outcome for {id}");
        }
        assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
        for (id, ok) in outcomes {
            assert_eq!(ok, id % 2 == 1, "session {id}");
        }
        drop(sessions);
    }

    type Log = Arc<Mutex<Vec<&'static str>>>;

    fn record(log: &Log, step: &'static str) {
        log.lock().unwrap().push(step);
    }

    struct OneVideoStream;

    impl PresentationDescriptor for OneVideoStream {
        fn stream_count(&self) -> anyhow::Result<usize> {
            Ok(1)
        }

        fn stream(&self, index: usize) -> anyhow::Result<StreamDescriptor> {
            Ok(StreamDescriptor {
                index,
                major_type: MajorType::Video,
                selected: true,
                current_format: Some(MediaFormat {
                    subtype: Subtype::Nv12,
                    frame_size: Some((32, 16)),
                    frame_rate: Some(30),
                }),
            })
        }

        fn deselect_stream(&mut self, _index: usize) -> anyhow::Result<()> {
            Ok(())
        }

        fn duration_ticks(&self) -> Option<i64> {
            Some(time::ms_to_ticks(5000))
        }
    }

    struct RecordingSource {
        log: Log,
    }

    impl MediaSource for RecordingSource {
        fn presentation(&self) -> anyhow::Result<Box<dyn PresentationDescriptor>> {
            Ok(Box::new(OneVideoStream))
        }

        fn shutdown(&self) -> anyhow::Result<()> {
            record(&self.log, "source shutdown");
            Ok(())
        }
    }

    /// Pipeline that logs teardown calls, fails `stop`, and lets the test emit events.
    #[derive(Default)]
    struct RecordingPipeline {
        log: Log,
        waiter: Mutex<Option<EventCallback>>,
        frames: Mutex<Option<Arc<dyn SampleCallback>>>,
    }

    impl RecordingPipeline {
        fn is_armed(&self) -> bool {
            self.waiter.lock().unwrap().is_some()
        }

        fn emit(&self, event: MediaEvent) {
            let waiter = self.waiter.lock().unwrap().take().expect("event registration");
            waiter(Ok(event));
        }
    }

    impl MediaPipeline for RecordingPipeline {
        fn set_topology(&self, graph: &PipelineGraph) -> anyhow::Result<()> {
            *self.frames.lock().unwrap() = graph.frame_callback();
            Ok(())
        }

        fn start(&self, _position_ticks: Option<i64>) -> anyhow::Result<()> {
            Ok(())
        }

        fn pause(&self) -> anyhow::Result<()> {
            Ok(())
        }

        fn stop(&self) -> anyhow::Result<()> {
            record(&self.log, "stop");
            anyhow::bail!("device lost")
        }

        fn close(&self) -> anyhow::Result<()> {
            record(&self.log, "close");
            Ok(())
        }

        fn shutdown(&self) -> anyhow::Result<()> {
            record(&self.log, "pipeline shutdown");
            let pending = self.waiter.lock().unwrap().take();
            drop(pending);
            Ok(())
        }

        fn clock(&self) -> Option<Arc<dyn PresentationClock>> {
            None
        }

        fn rate_control(&self) -> Option<Arc<dyn RateControl>> {
            None
        }

        fn begin_get_event(&self, callback: EventCallback) -> anyhow::Result<()> {
            *self.waiter.lock().unwrap() = Some(callback);
            Ok(())
        }
    }

    struct RecordingSubsystem {
        log: Log,
        pipeline: Arc<RecordingPipeline>,
        /// Keep resolutions outstanding instead of completing them.
        hold: bool,
        held: Mutex<Vec<ResolveCallback>>,
    }

    impl RecordingSubsystem {
        fn new(hold: bool) -> Arc<Self> {
            let log = Log::default();
            Arc::new(Self {
                pipeline: Arc::new(RecordingPipeline {
                    log: log.clone(),
                    ..RecordingPipeline::default()
                }),
                log,
                hold,
                held: Mutex::new(Vec::new()),
            })
        }

        fn steps(&self) -> Vec<&'static str> {
            self.log.lock().unwrap().clone()
        }
    }

    impl WorkQueue for RecordingSubsystem {
        fn post(&self, job: Job) {
            std::thread::spawn(job);
        }
    }

    impl MediaSubsystem for RecordingSubsystem {
        fn begin_resolve(
            &self,
            _locator: &MediaLocator,
            callback: ResolveCallback,
        ) -> anyhow::Result<ResolveCookie> {
            if self.hold {
                self.held.lock().unwrap().push(callback);
            } else {
                let source: Arc<dyn MediaSource> = Arc::new(RecordingSource {
                    log: self.log.clone(),
                });
                std::thread::spawn(move || callback(Ok(ResolvedObject::MediaSource(source))));
            }
            Ok(ResolveCookie(1))
        }

        fn cancel_resolve(&self, _cookie: ResolveCookie) {
            record(&self.log, "cancel resolve");
        }

        fn create_pipeline(&self) -> anyhow::Result<Arc<dyn MediaPipeline>> {
            let pipeline: Arc<dyn MediaPipeline> = self.pipeline.clone();
            Ok(pipeline)
        }

        fn audio_volume(&self) -> Option<Arc<dyn AudioVolume>> {
            None
        }
    }

    fn open_recording(
        subsystem: &Arc<RecordingSubsystem>,
        consumer: Option<Arc<dyn FrameConsumer>>,
        observer: Option<Arc<dyn StateObserver>>,
    ) -> (PlaybackSession, Receiver<Result<OpenInfo>>) {
        let (open_tx, opened) = unbounded();
        let session = PlaybackSession::open(
            subsystem.clone(),
            EngineConfig::default(),
            MediaLocator::from("recording://clip"),
            OpenOptions {
                consumer,
                observer,
                ..OpenOptions::default()
            },
            move |result| {
                let _ = open_tx.send(result);
            },
        );
        (session, opened)
    }

    #[test]
    fn teardown_runs_in_order_and_survives_failed_steps() {
        let subsystem = RecordingSubsystem::new(false);
        let frames = Arc::new(Frames::default());
        let consumer: Arc<dyn FrameConsumer> = frames.clone();
        let (session, opened) = open_recording(&subsystem, Some(consumer), None);
        let info = opened.recv_timeout(WAIT).unwrap().expect("opened");
        assert_eq!((info.width, info.height), (32, 16));

        let sink = subsystem
            .pipeline
            .frames
            .lock()
            .unwrap()
            .clone()
            .expect("frame sink wired");
        let sample = vec![128u8; 32 * 16 * 3 / 2];
        sink.on_process_sample(&sample, 0, 0);
        assert_eq!(frames.hits.load(Ordering::SeqCst), 1);

        session.shutdown();
        assert_eq!(
            subsystem.steps(),
            vec!["stop", "close", "pipeline shutdown", "source shutdown"]
        );
        assert!(!subsystem.pipeline.is_armed());

        // The failed stop did not keep the sinks alive.
        session.frame_slot().expect("slot").read(|_| ());
        sink.on_process_sample(&sample, 400_000, 0);
        assert_eq!(frames.hits.load(Ordering::SeqCst), 1);

        session.shutdown();
        assert_eq!(subsystem.steps().len(), 4);
    }

    #[test]
    fn teardown_cancels_pending_resolution_first() {
        let subsystem = RecordingSubsystem::new(true);
        let (session, opened) = open_recording(&subsystem, None, None);
        let deadline = std::time::Instant::now() + WAIT;
        while subsystem.held.lock().unwrap().is_empty() && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }

        session.shutdown();
        assert_eq!(subsystem.steps(), vec!["cancel resolve"]);
        assert!(matches!(
            opened.recv_timeout(WAIT).unwrap(),
            Err(EngineError::Canceled)
        ));
    }

    #[test]
    fn events_re_arm_before_reacting_and_unmapped_ones_are_ignored() {
        let subsystem = RecordingSubsystem::new(false);
        let pipeline = subsystem.pipeline.clone();
        let (tx, seen) = unbounded();
        let observer: Arc<dyn StateObserver> = {
            let pipeline = pipeline.clone();
            Arc::new(move |event: StateChangeEvent| {
                let _ = tx.send((event.state, pipeline.is_armed()));
            })
        };
        let (session, opened) = open_recording(&subsystem, None, Some(observer));
        opened.recv_timeout(WAIT).unwrap().expect("opened");
        assert!(pipeline.is_armed());

        pipeline.emit(MediaEvent::Other(0x7f));
        assert!(pipeline.is_armed());
        assert_eq!(session.state(), PlaybackState::Idle);
        assert!(seen.try_recv().is_err());

        pipeline.emit(MediaEvent::BufferingStarted);
        assert_eq!(seen.try_recv().unwrap(), (PlaybackState::BufferingStart, true));

        pipeline.emit(MediaEvent::SessionStarted);
        assert_eq!(seen.try_recv().unwrap(), (PlaybackState::Started, true));
        assert_eq!(session.state(), PlaybackState::Started);

        pipeline.emit(MediaEvent::Error("decoder reset".into()));
        assert_eq!(seen.try_recv().unwrap(), (PlaybackState::Error, true));
        assert_eq!(session.status().last_error.as_deref(), Some("decoder reset"));
    }
}
