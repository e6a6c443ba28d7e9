//! Pixel-buffer texture backing one player.
//!
//! The engine writes converted RGBA frames into a shared slot and pokes the texture; the
//! texture forwards a `FrameAvailable` event and the host copies the frame on its own
//! schedule.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use video_player::sample_sink::{FrameConsumer, FrameSlot};

use crate::events::{HostEvent, HostEvents};

/// Frame copied out for the host.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PixelBuffer {
    pub width: u32,
    pub height: u32,
    /// RGBA, `width * height * 4` bytes.
    pub data: Vec<u8>,
}

pub struct PixelBufferTexture {
    id: i64,
    events: HostEvents,
    slot: Mutex<Option<Arc<FrameSlot>>>,
    notified: AtomicU64,
}

impl PixelBufferTexture {
    pub fn new(id: i64, events: HostEvents) -> Self {
        Self {
            id,
            events,
            slot: Mutex::new(None),
            notified: AtomicU64::new(0),
        }
    }

    pub fn id(&self) -> i64 {
        self.id
    }

    /// Bind the session's frame slot.
    pub fn attach(&self, slot: Arc<FrameSlot>) {
        *self.slot.lock().unwrap_or_else(|e| e.into_inner()) = Some(slot);
    }

    /// Number of frame-available notifications sent.
    pub fn notifications(&self) -> u64 {
        self.notified.load(Ordering::Relaxed)
    }

    /// Copy the current frame, trimmed to `width * height * 4`.
    ///
    /// `None` before the first frame or when no slot is attached.
    pub fn copy_pixel_buffer(&self) -> Option<PixelBuffer> {
        let slot = self.slot.lock().unwrap_or_else(|e| e.into_inner()).clone()?;
        slot.read(|frame| {
            let len = (frame.width as usize * frame.height as usize * 4).min(frame.data.len());
            PixelBuffer {
                width: frame.width,
                height: frame.height,
                data: frame.data[..len].to_vec(),
            }
        })
    }
}

impl FrameConsumer for PixelBufferTexture {
    fn frame_available(&self) {
        self.notified.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(texture_id = self.id, "frame available");
        self.events
            .publish(HostEvent::FrameAvailable { texture_id: self.id });
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use super::*;
    use video_player::config::EngineConfig;
    use video_player::media::{Subtype, VideoFormat};
    use video_player::sample_sink::FrameSampleSink;

    #[test]
    fn forwards_notifications_and_copies_frames() {
        let (events, rx) = HostEvents::channel();
        let texture = Arc::new(PixelBufferTexture::new(9, events));
        assert!(texture.copy_pixel_buffer().is_none());

        let consumer: Arc<dyn FrameConsumer> = texture.clone();
        let sink = FrameSampleSink::new(EngineConfig::default(), Some(consumer));
        sink.set_format(VideoFormat {
            width: 16,
            height: 16,
            layout: Subtype::Nv12,
        });
        texture.attach(sink.slot());
        assert!(texture.copy_pixel_buffer().is_none());

        let sample = vec![128u8; 16 * 16 * 3 / 2];
        assert!(sink.on_sample_at(&sample, Instant::now()));
        assert_eq!(
            rx.try_recv().unwrap(),
            HostEvent::FrameAvailable { texture_id: 9 }
        );
        assert_eq!(texture.notifications(), 1);

        let frame = texture.copy_pixel_buffer().unwrap();
        assert_eq!((frame.width, frame.height), (16, 16));
        assert_eq!(frame.data.len(), 16 * 16 * 4);
        assert_eq!(frame.data[3], 255);
    }
}
