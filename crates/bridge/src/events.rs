//! Outbound notifications to the host.
//!
//! Sessions and textures publish onto a crossbeam channel; the host side drains it.

use crossbeam_channel::{Receiver, Sender};
use serde::Serialize;

use video_bridge_types::StateChangeEvent;

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "method", content = "args")]
pub enum HostEvent {
    /// Playback state change for one texture.
    #[serde(rename = "OnPlaybackEvent", rename_all = "camelCase")]
    Playback {
        texture_id: i64,
        state: i32,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    /// A new frame is ready to be copied.
    #[serde(rename = "OnFrameAvailable", rename_all = "camelCase")]
    FrameAvailable { texture_id: i64 },
}

impl From<StateChangeEvent> for HostEvent {
    fn from(event: StateChangeEvent) -> Self {
        HostEvent::Playback {
            texture_id: event.session_id,
            state: event.state.code(),
            error: event.error,
        }
    }
}

/// Cloneable publisher half of the host event channel.
#[derive(Clone, Debug)]
pub struct HostEvents {
    tx: Sender<HostEvent>,
}

impl HostEvents {
    pub fn channel() -> (Self, Receiver<HostEvent>) {
        let (tx, rx) = crossbeam_channel::unbounded();
        (Self { tx }, rx)
    }

    /// Publish without blocking. Events are dropped once the host side is gone.
    pub fn publish(&self, event: HostEvent) {
        if self.tx.send(event).is_err() {
            tracing::trace!("host event receiver closed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use video_bridge_types::PlaybackState;

    #[test]
    fn playback_event_serializes_like_the_host_channel() {
        let event = HostEvent::from(StateChangeEvent {
            session_id: 3,
            state: PlaybackState::Paused,
            error: None,
        });
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"method": "OnPlaybackEvent", "args": {"textureId": 3, "state": 4}})
        );
    }

    #[test]
    fn publish_after_receiver_drop_is_silent() {
        let (events, rx) = HostEvents::channel();
        drop(rx);
        events.publish(HostEvent::FrameAvailable { texture_id: 1 });
    }
}
