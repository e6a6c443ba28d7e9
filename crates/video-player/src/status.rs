use video_bridge_types::{PlaybackState, SessionStatus};

use crate::media::VideoFormat;
use crate::sample_sink::FrameCounters;
use crate::time;

/// Raw session fields gathered for a status snapshot.
#[derive(Debug, Default)]
pub struct SessionStatusState {
    /// Current playback state.
    pub state: PlaybackState,
    /// Media duration in ticks when known.
    pub duration_ticks: Option<i64>,
    /// Presentation clock reading in ticks.
    pub position_ticks: Option<i64>,
    /// Geometry established at open.
    pub video: Option<VideoFormat>,
    /// Endpoint volume when a control is available.
    pub volume: Option<f32>,
    pub muted: Option<bool>,
    /// Last rate accepted by the rate control.
    pub rate: f32,
    /// Frame sink counters (zero without a sink).
    pub frames: FrameCounters,
    /// Error that drove the session into the error state.
    pub last_error: Option<String>,
    pub shut_down: bool,
}

impl SessionStatusState {
    /// Return a snapshot suitable for the host layer.
    pub fn snapshot(&self, session_id: i64) -> SessionStatus {
        let (width, height) = self
            .video
            .as_ref()
            .map(|v| (v.width, v.height))
            .unwrap_or((0, 0));
        SessionStatus {
            session_id,
            state: self.state,
            duration_ms: self
                .duration_ticks
                .map(time::ticks_to_ms)
                .unwrap_or(time::UNKNOWN_MS),
            position_ms: self
                .position_ticks
                .map(time::ticks_to_ms)
                .unwrap_or(time::UNKNOWN_MS),
            width,
            height,
            volume: self.volume,
            muted: self.muted,
            rate: self.rate,
            frames_delivered: self.frames.delivered,
            frames_dropped: self.frames.dropped,
            last_error: self.last_error.clone(),
            shut_down: self.shut_down,
        }
    }
}
