//! Synthetic media session: presentation clock, event queue and frame generator.
//!
//! One worker thread per pipeline advances the clock, emits end-of-media and injected
//! errors, hands queued events to the armed event callback and renders 4:2:0 frames into
//! the frame-grabbing sink while started. Callbacks always run on the worker thread with
//! the pipeline lock released.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, bail};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError};

use super::source::{ATTR_ERROR_AT_MS, ATTR_REJECT_TOPOLOGY};
use crate::convert::PlaneLayout;
use crate::media::{
    EventCallback, MajorType, MediaEvent, MediaPipeline, PresentationClock, RateControl,
    SampleCallback, VideoFormat,
};
use crate::pipeline::PipelineGraph;
use crate::time;

const IDLE_POLL: Duration = Duration::from_millis(100);
const STARTED_POLL: Duration = Duration::from_millis(10);
const PLANE_ALIGNMENT: usize = 16;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Transport {
    Stopped,
    Started,
    Paused,
}

struct Topology {
    frames: Option<Arc<dyn SampleCallback>>,
    video: Option<VideoFormat>,
    fps: u32,
    duration_ticks: i64,
    error_at_ticks: Option<i64>,
}

struct PipelineState {
    topology: Option<Topology>,
    transport: Transport,
    base_ticks: i64,
    anchor: Option<Instant>,
    rate: f32,
    ended: bool,
    error_emitted: bool,
    last_frame: Option<Instant>,
    frame_index: u64,
    events: VecDeque<MediaEvent>,
    waiter: Option<EventCallback>,
    closed: bool,
    shut_down: bool,
}

impl Default for PipelineState {
    fn default() -> Self {
        Self {
            topology: None,
            transport: Transport::Stopped,
            base_ticks: 0,
            anchor: None,
            rate: 1.0,
            ended: false,
            error_emitted: false,
            last_frame: None,
            frame_index: 0,
            events: VecDeque::new(),
            waiter: None,
            closed: false,
            shut_down: false,
        }
    }
}

struct RenderedFrame {
    sink: Arc<dyn SampleCallback>,
    data: Vec<u8>,
    time: i64,
    duration: i64,
}

impl PipelineState {
    fn ensure_usable(&self) -> anyhow::Result<()> {
        if self.shut_down {
            bail!("pipeline is shut down");
        }
        if self.closed {
            bail!("pipeline is closed");
        }
        Ok(())
    }

    fn duration_ticks(&self) -> anyhow::Result<i64> {
        self.topology
            .as_ref()
            .map(|t| t.duration_ticks)
            .context("no topology set")
    }

    fn position(&self, now: Instant) -> i64 {
        let position = match self.anchor {
            Some(anchor) => {
                let elapsed = now.saturating_duration_since(anchor).as_nanos() / 100;
                let scaled = elapsed as f64 * f64::from(self.rate);
                self.base_ticks.saturating_add(scaled as i64)
            }
            None => self.base_ticks,
        };
        match &self.topology {
            Some(t) => position.min(t.duration_ticks),
            None => position,
        }
    }

    fn freeze(&mut self, now: Instant) {
        self.base_ticks = self.position(now);
        self.anchor = None;
    }

    /// Emit end-of-media and injected errors.
    fn advance(&mut self, now: Instant) {
        if self.transport != Transport::Started {
            return;
        }
        let (duration, error_at) = match &self.topology {
            Some(t) => (t.duration_ticks, t.error_at_ticks),
            None => return,
        };
        let position = self.position(now);

        if let Some(error_at) = error_at {
            if !self.error_emitted && position >= error_at {
                self.error_emitted = true;
                self.freeze(now);
                self.transport = Transport::Paused;
                self.events.push_back(MediaEvent::Error(format!(
                    "decode failure at {} ms",
                    time::ticks_to_ms(error_at)
                )));
                return;
            }
        }
        if position >= duration {
            self.base_ticks = duration;
            self.anchor = None;
            self.transport = Transport::Stopped;
            self.ended = true;
            self.events.push_back(MediaEvent::SessionEnded);
        }
    }

    fn take_dispatch(&mut self) -> Option<(EventCallback, MediaEvent)> {
        if self.waiter.is_none() {
            return None;
        }
        let event = self.events.pop_front()?;
        let waiter = self.waiter.take()?;
        Some((waiter, event))
    }

    fn render(&mut self, now: Instant) -> Option<RenderedFrame> {
        if self.transport != Transport::Started {
            return None;
        }
        let (sink, width, height, fps) = {
            let topology = self.topology.as_ref()?;
            let video = topology.video.as_ref()?;
            (topology.frames.clone()?, video.width, video.height, topology.fps)
        };
        let interval = Duration::from_millis(1000 / u64::from(fps.max(1)));
        if let Some(last) = self.last_frame {
            if now.saturating_duration_since(last) < interval {
                return None;
            }
        }
        self.last_frame = Some(now);
        self.frame_index += 1;
        Some(RenderedFrame {
            sink,
            data: test_pattern(width as usize, height as usize, self.frame_index),
            time: self.position(now),
            duration: time::ms_to_ticks(interval.as_millis() as i64),
        })
    }

    fn poll_interval(&self) -> Duration {
        match self.transport {
            Transport::Started => STARTED_POLL,
            _ => IDLE_POLL,
        }
    }
}

/// Moving diagonal luma ramp over slowly cycling chroma, 16-aligned planes.
fn test_pattern(width: usize, height: usize, frame: u64) -> Vec<u8> {
    let layout = PlaneLayout::aligned(width, height, PLANE_ALIGNMENT);
    let mut data = vec![0u8; layout.planar_len()];
    let shift = (frame * 4) as usize;
    for y in 0..height {
        let row = &mut data[y * layout.stride_width..y * layout.stride_width + width];
        for (x, px) in row.iter_mut().enumerate() {
            *px = (16 + (x + y + shift) % 220) as u8;
        }
    }
    let u = (64 + frame % 128) as u8;
    let chroma = &mut data[layout.chroma_offset()..];
    for pair in chroma.chunks_exact_mut(2) {
        pair[0] = u;
        pair[1] = 128;
    }
    data
}

struct Shared {
    state: Mutex<PipelineState>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, PipelineState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Synthetic implementation of [`MediaPipeline`].
pub struct SyntheticPipeline {
    shared: Arc<Shared>,
    wake: Sender<()>,
}

impl SyntheticPipeline {
    /// Create the pipeline and its worker thread.
    pub fn spawn() -> anyhow::Result<Arc<Self>> {
        let shared = Arc::new(Shared {
            state: Mutex::new(PipelineState::default()),
        });
        let (wake, wake_rx) = crossbeam_channel::bounded(1);
        let worker = shared.clone();
        thread::Builder::new()
            .name("synthetic-pipeline".into())
            .spawn(move || run(worker, wake_rx))
            .context("spawn pipeline worker")?;
        Ok(Arc::new(Self { shared, wake }))
    }

    fn wake(&self) {
        match self.wake.try_send(()) {
            Ok(()) | Err(TrySendError::Full(())) => {}
            Err(TrySendError::Disconnected(())) => {
                tracing::trace!("pipeline worker gone");
            }
        }
    }

    fn push_event(&self, mut state: MutexGuard<'_, PipelineState>, event: MediaEvent) {
        state.events.push_back(event);
        drop(state);
        self.wake();
    }
}

fn run(shared: Arc<Shared>, wake: Receiver<()>) {
    loop {
        let timeout = shared.lock().poll_interval();
        match wake.recv_timeout(timeout) {
            Ok(()) | Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
        let now = Instant::now();
        let (dispatch, frame) = {
            let mut state = shared.lock();
            if state.shut_down {
                break;
            }
            state.advance(now);
            (state.take_dispatch(), state.render(now))
        };
        if let Some((callback, event)) = dispatch {
            callback(Ok(event));
        }
        if let Some(frame) = frame {
            frame
                .sink
                .on_process_sample(&frame.data, frame.time, frame.duration);
        }
    }
    tracing::trace!("synthetic pipeline worker exiting");
}

impl MediaPipeline for SyntheticPipeline {
    fn set_topology(&self, graph: &PipelineGraph) -> anyhow::Result<()> {
        let mut state = self.shared.lock();
        state.ensure_usable()?;
        if graph.source().attribute(ATTR_REJECT_TOPOLOGY).is_some() {
            bail!("topology rejected: no decoder for stream");
        }
        let fps = graph
            .source_nodes()
            .filter(|stream| stream.major_type == MajorType::Video)
            .find_map(|stream| stream.current_format.as_ref()?.frame_rate)
            .unwrap_or(30);
        let error_at_ticks = graph
            .source()
            .attribute(ATTR_ERROR_AT_MS)
            .map(|ms| ms.parse::<i64>())
            .transpose()
            .context("parse injected error position")?
            .map(time::ms_to_ticks);

        state.topology = Some(Topology {
            frames: graph.frame_callback(),
            video: graph.video_format().cloned(),
            fps,
            duration_ticks: graph.duration_ticks().unwrap_or(i64::MAX),
            error_at_ticks,
        });
        tracing::debug!(fps, edges = graph.edges().len(), "synthetic topology set");
        Ok(())
    }

    /// Positions past the end park the clock at the duration; the next tick reports end
    /// of media.
    fn start(&self, position_ticks: Option<i64>) -> anyhow::Result<()> {
        let mut state = self.shared.lock();
        state.ensure_usable()?;
        let duration = state.duration_ticks()?;
        let now = Instant::now();

        match position_ticks {
            Some(ticks) => {
                state.base_ticks = ticks.clamp(0, duration);
                state.ended = false;
            }
            None if state.ended => {
                state.base_ticks = 0;
                state.ended = false;
            }
            None => state.freeze(now),
        }
        let error_at = state.topology.as_ref().and_then(|t| t.error_at_ticks);
        if error_at.is_some_and(|at| state.base_ticks < at) {
            state.error_emitted = false;
        }
        state.anchor = Some(now);
        state.transport = Transport::Started;
        state.last_frame = None;
        self.push_event(state, MediaEvent::SessionStarted);
        Ok(())
    }

    fn pause(&self) -> anyhow::Result<()> {
        let mut state = self.shared.lock();
        state.ensure_usable()?;
        if state.transport == Transport::Stopped {
            bail!("cannot pause a stopped session");
        }
        state.freeze(Instant::now());
        state.transport = Transport::Paused;
        self.push_event(state, MediaEvent::SessionPaused);
        Ok(())
    }

    fn stop(&self) -> anyhow::Result<()> {
        let mut state = self.shared.lock();
        state.ensure_usable()?;
        state.base_ticks = 0;
        state.anchor = None;
        state.transport = Transport::Stopped;
        self.push_event(state, MediaEvent::SessionStopped);
        Ok(())
    }

    fn close(&self) -> anyhow::Result<()> {
        let mut state = self.shared.lock();
        if state.shut_down {
            bail!("pipeline is shut down");
        }
        state.closed = true;
        state.anchor = None;
        state.transport = Transport::Stopped;
        self.push_event(state, MediaEvent::SessionClosed);
        Ok(())
    }

    fn shutdown(&self) -> anyhow::Result<()> {
        let (waiter, topology) = {
            let mut state = self.shared.lock();
            state.shut_down = true;
            state.events.clear();
            (state.waiter.take(), state.topology.take())
        };
        // Dropped outside the lock: the waiter may own the last reference to its session.
        drop(waiter);
        drop(topology);
        self.wake();
        Ok(())
    }

    fn clock(&self) -> Option<Arc<dyn PresentationClock>> {
        Some(Arc::new(SyntheticClock {
            shared: self.shared.clone(),
        }))
    }

    fn rate_control(&self) -> Option<Arc<dyn RateControl>> {
        Some(Arc::new(SyntheticRate {
            shared: self.shared.clone(),
        }))
    }

    fn begin_get_event(&self, callback: EventCallback) -> anyhow::Result<()> {
        let mut state = self.shared.lock();
        if state.shut_down {
            bail!("pipeline is shut down");
        }
        if state.waiter.is_some() {
            bail!("an event request is already pending");
        }
        state.waiter = Some(callback);
        drop(state);
        self.wake();
        Ok(())
    }
}

struct SyntheticClock {
    shared: Arc<Shared>,
}

impl PresentationClock for SyntheticClock {
    fn time_ticks(&self) -> anyhow::Result<i64> {
        let state = self.shared.lock();
        if state.shut_down {
            bail!("clock is shut down");
        }
        Ok(state.position(Instant::now()))
    }
}

struct SyntheticRate {
    shared: Arc<Shared>,
}

impl RateControl for SyntheticRate {
    fn set_rate(&self, rate: f32) -> anyhow::Result<()> {
        if !rate.is_finite() || rate <= 0.0 {
            bail!("unsupported rate {rate}");
        }
        let mut state = self.shared.lock();
        state.ensure_usable()?;
        if state.anchor.is_some() {
            let now = Instant::now();
            state.base_ticks = state.position(now);
            state.anchor = Some(now);
        }
        state.rate = rate;
        Ok(())
    }
}
