use std::time::Duration;

use serde::Deserialize;

/// Engine tuning parameters shared by the session, the sample sink and the converter.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    /// Minimum gap between two delivered frames (milliseconds).
    pub min_frame_interval_ms: u64,
    /// Row/plane alignment of decoded 4:2:0 samples.
    pub plane_alignment: usize,
    /// Extra bytes appended to every RGBA buffer.
    pub buffer_margin: usize,
    /// Fall back to the unaligned height for the chroma offset when the aligned plane
    /// size does not fit in the sample.
    pub unaligned_height_fallback: bool,
    /// Volume reported by `open` when no volume control is available.
    pub default_volume: f32,
}

impl Default for EngineConfig {
    /// Defaults match a ~30fps presentation surface and 16-byte aligned decoder output.
    fn default() -> Self {
        Self {
            min_frame_interval_ms: 33,
            plane_alignment: 16,
            buffer_margin: 10,
            unaligned_height_fallback: true,
            default_volume: 1.0,
        }
    }
}

impl EngineConfig {
    /// Rate-limit interval as a [`Duration`].
    pub fn min_frame_interval(&self) -> Duration {
        Duration::from_millis(self.min_frame_interval_ms)
    }

    /// Alignment clamped to a usable value (`0` behaves like `1`).
    pub fn alignment(&self) -> usize {
        self.plane_alignment.max(1)
    }
}
