//! Mapping from pipeline events to playback states.

use video_bridge_types::PlaybackState;

use crate::media::MediaEvent;

/// State transition driven by `event`, or `None` for events the session ignores.
pub fn map_event(event: &MediaEvent) -> Option<PlaybackState> {
    let state = match event {
        MediaEvent::BufferingStarted => PlaybackState::BufferingStart,
        MediaEvent::BufferingStopped => PlaybackState::BufferingEnd,
        MediaEvent::SessionStarted => PlaybackState::Started,
        MediaEvent::SessionPaused => PlaybackState::Paused,
        MediaEvent::SessionStopped => PlaybackState::Stopped,
        MediaEvent::SessionClosed => PlaybackState::Idle,
        MediaEvent::SessionEnded => PlaybackState::Ended,
        MediaEvent::Error(_) => PlaybackState::Error,
        MediaEvent::Other(_) => return None,
    };
    Some(state)
}

/// Error text carried by an event, if any.
pub fn error_message(event: &MediaEvent) -> Option<&str> {
    match event {
        MediaEvent::Error(msg) => Some(msg),
        _ => None,
    }
}
