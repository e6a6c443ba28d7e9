use serde::{Deserialize, Serialize};

/// Playback state published by a session.
///
/// The numeric codes are part of the host protocol and must stay stable.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PlaybackState {
    /// No media loaded, or the media session was closed.
    #[default]
    Idle,
    /// The pipeline started buffering.
    BufferingStart,
    /// The pipeline finished buffering.
    BufferingEnd,
    /// Playback is running.
    Started,
    /// Playback is paused at the current position.
    Paused,
    /// Playback was stopped.
    Stopped,
    /// Natural end of media.
    Ended,
    /// Unrecoverable playback error.
    Error,
}

impl PlaybackState {
    /// Stable integer code sent to the host.
    pub fn code(self) -> i32 {
        match self {
            PlaybackState::Idle => 0,
            PlaybackState::BufferingStart => 1,
            PlaybackState::BufferingEnd => 2,
            PlaybackState::Started => 3,
            PlaybackState::Paused => 4,
            PlaybackState::Stopped => 5,
            PlaybackState::Ended => 6,
            PlaybackState::Error => 7,
        }
    }

    /// Inverse of [`PlaybackState::code`].
    pub fn from_code(code: i32) -> Option<Self> {
        Some(match code {
            0 => PlaybackState::Idle,
            1 => PlaybackState::BufferingStart,
            2 => PlaybackState::BufferingEnd,
            3 => PlaybackState::Started,
            4 => PlaybackState::Paused,
            5 => PlaybackState::Stopped,
            6 => PlaybackState::Ended,
            7 => PlaybackState::Error,
            _ => return None,
        })
    }
}

/// Outbound notification emitted on every mapped session event.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct StateChangeEvent {
    /// Session (texture) id the event belongs to.
    pub session_id: i64,
    /// New playback state.
    pub state: PlaybackState,
    /// Error text when `state` is [`PlaybackState::Error`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Reply to an `openVideo` request.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OpenResponse {
    /// `true` when the source was resolved and the pipeline built.
    pub result: bool,
    /// Session id assigned to the player.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub texture_id: Option<i64>,
    /// Media duration in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<i64>,
    /// Video frame width in pixels (0 without video).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub video_width: Option<u32>,
    /// Video frame height in pixels (0 without video).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub video_height: Option<u32>,
    /// Current master volume in `0.0..=1.0`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume: Option<f64>,
}

impl OpenResponse {
    /// Reply used for every failed or abandoned open.
    pub fn failed() -> Self {
        Self {
            result: false,
            ..Self::default()
        }
    }
}

/// Point-in-time view of a playback session.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct SessionStatus {
    /// Session id.
    pub session_id: i64,
    /// Current playback state.
    pub state: PlaybackState,
    /// Media duration in milliseconds, `-1` when unknown.
    pub duration_ms: i64,
    /// Presentation clock position in milliseconds, `-1` when unknown.
    pub position_ms: i64,
    /// Video frame width in pixels.
    pub width: u32,
    /// Video frame height in pixels.
    pub height: u32,
    /// Master volume, when a volume control is available.
    pub volume: Option<f32>,
    /// Mute flag, when a volume control is available.
    pub muted: Option<bool>,
    /// Last rate requested through `set_rate`.
    pub rate: f32,
    /// Frames converted and handed to the consumer.
    pub frames_delivered: u64,
    /// Frames dropped by the rate limiter.
    pub frames_dropped: u64,
    /// Error text that drove the session into the error state.
    pub last_error: Option<String>,
    /// `true` once `shutdown` has run.
    pub shut_down: bool,
}
