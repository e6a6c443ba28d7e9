//! Frame delivery from the video sink to a pull-model consumer.
//!
//! The sink converts each accepted 4:2:0 sample into the shared [`FrameSlot`] and signals
//! the consumer. The consumer reads the slot on its own schedule; at most one
//! "frame available" notification is outstanding at any time.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use crate::config::EngineConfig;
use crate::convert::{self, PlaneLayout};
use crate::media::{SampleCallback, VideoFormat};

/// Receives "new frame ready" notifications.
///
/// Called with the sink's consumer lock held: implementations must not block and must not
/// detach themselves.
pub trait FrameConsumer: Send + Sync {
    fn frame_available(&self);
}

/// Borrowed view of the latest converted frame.
#[derive(Debug)]
pub struct FrameView<'a> {
    pub width: u32,
    pub height: u32,
    /// Packed RGBA, `width * 4` bytes per row, followed by slack.
    pub data: &'a [u8],
}

#[derive(Default)]
struct FrameBuffer {
    width: u32,
    height: u32,
    data: Vec<u8>,
    /// Byte size of the sample the buffer was sized for.
    sample_len: usize,
    ready: bool,
}

/// Latest converted frame, shared between the sink and its consumer.
#[derive(Default)]
pub struct FrameSlot {
    buffer: Mutex<FrameBuffer>,
    pending: AtomicBool,
}

impl FrameSlot {
    fn lock(&self) -> MutexGuard<'_, FrameBuffer> {
        self.buffer.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Run `f` on the current frame and acknowledge the pending notification.
    ///
    /// Returns `None` before the first frame was delivered.
    pub fn read<R>(&self, f: impl FnOnce(FrameView<'_>) -> R) -> Option<R> {
        let buffer = self.lock();
        self.pending.store(false, Ordering::Release);
        if !buffer.ready {
            return None;
        }
        Some(f(FrameView {
            width: buffer.width,
            height: buffer.height,
            data: &buffer.data,
        }))
    }

    /// `true` while a notification has not been acknowledged by [`FrameSlot::read`].
    pub fn has_pending(&self) -> bool {
        self.pending.load(Ordering::Acquire)
    }
}

/// Delivery counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FrameCounters {
    pub delivered: u64,
    pub dropped: u64,
    pub reallocations: u64,
}

#[derive(Default)]
struct SinkState {
    format: Option<VideoFormat>,
    last_delivery: Option<Instant>,
}

/// Rate-limited frame converter attached to the pipeline's frame-grabbing sink.
pub struct FrameSampleSink {
    config: EngineConfig,
    state: Mutex<SinkState>,
    consumer: Mutex<Option<Arc<dyn FrameConsumer>>>,
    slot: Arc<FrameSlot>,
    delivered: AtomicU64,
    dropped: AtomicU64,
    reallocations: AtomicU64,
}

impl FrameSampleSink {
    pub fn new(config: EngineConfig, consumer: Option<Arc<dyn FrameConsumer>>) -> Self {
        Self {
            config,
            state: Mutex::new(SinkState::default()),
            consumer: Mutex::new(consumer),
            slot: Arc::new(FrameSlot::default()),
            delivered: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            reallocations: AtomicU64::new(0),
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, SinkState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_consumer(&self) -> MutexGuard<'_, Option<Arc<dyn FrameConsumer>>> {
        self.consumer.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Set the geometry of incoming samples.
    pub fn set_format(&self, format: VideoFormat) {
        tracing::debug!(width = format.width, height = format.height, "frame sink format");
        self.lock_state().format = Some(format);
    }

    /// Stop delivering frames; later samples are ignored.
    ///
    /// Once this returns the consumer receives no further notifications.
    pub fn detach_consumer(&self) {
        let previous = self.lock_consumer().take();
        if previous.is_some() {
            tracing::debug!("frame consumer detached");
        }
    }

    pub fn slot(&self) -> Arc<FrameSlot> {
        self.slot.clone()
    }

    pub fn counters(&self) -> FrameCounters {
        FrameCounters {
            delivered: self.delivered.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            reallocations: self.reallocations.load(Ordering::Relaxed),
        }
    }

    /// Handle one sample arriving at `now`. Returns `true` when a frame was delivered.
    pub fn on_sample_at(&self, sample: &[u8], now: Instant) -> bool {
        if self.lock_consumer().is_none() {
            return false;
        }

        let format = {
            let mut state = self.lock_state();
            let Some(format) = state.format.clone() else {
                tracing::trace!("sample before format; ignoring");
                return false;
            };
            if let Some(last) = state.last_delivery {
                if now.saturating_duration_since(last) < self.config.min_frame_interval() {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    return false;
                }
            }
            state.last_delivery = Some(now);
            format
        };

        self.convert_sample(sample, &format);

        // Held across the notification so a concurrent detach waits for it.
        let guard = self.lock_consumer();
        let Some(consumer) = guard.as_ref() else {
            tracing::trace!("consumer detached during conversion");
            return false;
        };
        self.delivered.fetch_add(1, Ordering::Relaxed);
        if !self.slot.pending.swap(true, Ordering::AcqRel) {
            consumer.frame_available();
        }
        true
    }

    fn convert_sample(&self, sample: &[u8], format: &VideoFormat) {
        let width = format.width as usize;
        let height = format.height as usize;
        let required = convert::rgba_len(width, height, self.config.buffer_margin);

        let mut buffer = self.slot.lock();
        if buffer.sample_len != sample.len() || buffer.data.is_empty() {
            tracing::debug!(
                sample_len = sample.len(),
                width,
                height,
                "reallocating frame buffer"
            );
            buffer.data = convert::opaque_buffer(required);
            buffer.sample_len = sample.len();
            buffer.width = format.width;
            buffer.height = format.height;
            self.reallocations.fetch_add(1, Ordering::Relaxed);
        } else if buffer.width != format.width {
            // Same byte count, rotated geometry.
            tracing::debug!(width, height, "frame geometry changed; resyncing");
            buffer.width = format.width;
            buffer.height = format.height;
            if buffer.data.len() < required {
                buffer.data = convert::opaque_buffer(required);
                self.reallocations.fetch_add(1, Ordering::Relaxed);
            }
        }

        let layout = PlaneLayout::for_sample(width, height, sample.len(), &self.config);
        convert::convert_into(sample, width, height, layout, &mut buffer.data);
        buffer.ready = true;
    }
}

impl SampleCallback for FrameSampleSink {
    fn on_process_sample(&self, sample: &[u8], sample_time: i64, _sample_duration: i64) {
        if !self.on_sample_at(sample, Instant::now()) {
            tracing::trace!(sample_time, "sample not delivered");
        }
    }

    fn on_shutdown(&self) {
        self.detach_consumer();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::Subtype;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[derive(Default)]
    struct CountingConsumer {
        hits: AtomicUsize,
    }

    impl FrameConsumer for CountingConsumer {
        fn frame_available(&self) {
            self.hits.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn format(width: u32, height: u32) -> VideoFormat {
        VideoFormat {
            width,
            height,
            layout: Subtype::Nv12,
        }
    }

    fn sample(width: usize, height: usize, luma: u8) -> Vec<u8> {
        let layout = PlaneLayout::aligned(width, height, 16);
        let mut buf = vec![luma; layout.chroma_offset()];
        buf.resize(layout.planar_len(), 128);
        buf
    }

    fn sink(consumer: &Arc<CountingConsumer>) -> FrameSampleSink {
        let consumer: Arc<dyn FrameConsumer> = consumer.clone();
        let sink = FrameSampleSink::new(EngineConfig::default(), Some(consumer));
        sink.set_format(format(32, 16));
        sink
    }

    #[test]
    fn samples_10ms_apart_deliver_one_frame() {
        let consumer = Arc::new(CountingConsumer::default());
        let sink = sink(&consumer);
        let frame = sample(32, 16, 100);
        let t0 = Instant::now();
        assert!(sink.on_sample_at(&frame, t0));
        assert!(!sink.on_sample_at(&frame, t0 + Duration::from_millis(10)));
        let counters = sink.counters();
        assert_eq!(counters.delivered, 1);
        assert_eq!(counters.dropped, 1);
    }

    #[test]
    fn samples_40ms_apart_deliver_two_frames() {
        let consumer = Arc::new(CountingConsumer::default());
        let sink = sink(&consumer);
        let frame = sample(32, 16, 100);
        let t0 = Instant::now();
        assert!(sink.on_sample_at(&frame, t0));
        assert!(sink.on_sample_at(&frame, t0 + Duration::from_millis(40)));
        assert_eq!(sink.counters().delivered, 2);
    }

    #[test]
    fn at_most_one_notification_outstanding() {
        let consumer = Arc::new(CountingConsumer::default());
        let sink = sink(&consumer);
        let frame = sample(32, 16, 100);
        let t0 = Instant::now();
        sink.on_sample_at(&frame, t0);
        sink.on_sample_at(&frame, t0 + Duration::from_millis(40));
        assert_eq!(consumer.hits.load(Ordering::SeqCst), 1);

        let slot = sink.slot();
        assert!(slot.has_pending());
        let first = slot.read(|view| (view.width, view.height, view.data[0]));
        assert_eq!(first, Some((32, 16, 100)));
        assert!(!slot.has_pending());

        sink.on_sample_at(&frame, t0 + Duration::from_millis(80));
        assert_eq!(consumer.hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn slot_is_empty_before_first_frame() {
        let consumer = Arc::new(CountingConsumer::default());
        let sink = sink(&consumer);
        assert!(sink.slot().read(|_| ()).is_none());
    }

    #[test]
    fn reallocates_only_when_sample_size_changes() {
        let consumer = Arc::new(CountingConsumer::default());
        let sink = sink(&consumer);
        let t0 = Instant::now();
        let step = Duration::from_millis(50);

        sink.on_sample_at(&sample(32, 16, 10), t0);
        sink.on_sample_at(&sample(32, 16, 20), t0 + step);
        assert_eq!(sink.counters().reallocations, 1);

        sink.set_format(format(64, 32));
        sink.on_sample_at(&sample(64, 32, 30), t0 + step * 2);
        assert_eq!(sink.counters().reallocations, 2);
        assert_eq!(sink.slot().read(|view| (view.width, view.height)), Some((64, 32)));
    }

    #[test]
    fn width_change_with_same_size_resyncs_geometry() {
        let consumer = Arc::new(CountingConsumer::default());
        let sink = sink(&consumer);
        let t0 = Instant::now();
        // 32x16 and 16x32 have identical aligned sample sizes
        let frame = sample(32, 16, 60);
        sink.on_sample_at(&frame, t0);
        sink.set_format(format(16, 32));
        sink.on_sample_at(&frame, t0 + Duration::from_millis(50));
        assert_eq!(sink.slot().read(|view| (view.width, view.height)), Some((16, 32)));
        assert_eq!(sink.counters().reallocations, 1);
        let len = sink.slot().read(|view| view.data.len()).unwrap();
        assert!(len >= convert::rgba_len(16, 32, 10));
    }

    #[test]
    fn detached_consumer_stops_delivery() {
        let consumer = Arc::new(CountingConsumer::default());
        let sink = sink(&consumer);
        sink.on_shutdown();
        assert!(!sink.on_sample_at(&sample(32, 16, 1), Instant::now()));
        assert_eq!(consumer.hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn no_notification_after_detach_returns() {
        let consumer = Arc::new(CountingConsumer::default());
        let sink = Arc::new(sink(&consumer));
        let running = Arc::new(AtomicBool::new(true));

        let worker = {
            let sink = sink.clone();
            let running = running.clone();
            std::thread::spawn(move || {
                let frame = sample(32, 16, 100);
                let t0 = Instant::now();
                let mut step = 0u32;
                while running.load(Ordering::SeqCst) {
                    sink.on_sample_at(&frame, t0 + Duration::from_millis(50) * step);
                    sink.slot().read(|_| ());
                    step += 1;
                }
            })
        };

        while consumer.hits.load(Ordering::SeqCst) < 3 {
            std::thread::yield_now();
        }
        sink.detach_consumer();
        let at_detach = consumer.hits.load(Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(20));
        running.store(false, Ordering::SeqCst);
        worker.join().unwrap();
        assert_eq!(consumer.hits.load(Ordering::SeqCst), at_detach);
    }

    #[test]
    fn samples_before_format_are_ignored() {
        let consumer: Arc<dyn FrameConsumer> = Arc::new(CountingConsumer::default());
        let sink = FrameSampleSink::new(EngineConfig::default(), Some(consumer));
        assert!(!sink.on_sample_at(&sample(32, 16, 1), Instant::now()));
        assert_eq!(sink.counters(), FrameCounters::default());
    }
}
