use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{anyhow, bail};

use super::{FailurePoint, SyntheticSpec};
use crate::media::{
    MajorType, MediaFormat, MediaSource, PresentationDescriptor, StreamDescriptor, Subtype,
};
use crate::time;

/// Source attribute carrying the injected error position in milliseconds.
pub(crate) const ATTR_ERROR_AT_MS: &str = "synthetic.error_at_ms";
/// Source attribute present when the pipeline must reject the topology.
pub(crate) const ATTR_REJECT_TOPOLOGY: &str = "synthetic.reject_topology";

/// Source with one video stream, an optional audio stream and a metadata stream.
pub struct SyntheticSource {
    spec: SyntheticSpec,
    shut_down: AtomicBool,
}

impl SyntheticSource {
    pub fn new(spec: SyntheticSpec) -> Self {
        Self {
            spec,
            shut_down: AtomicBool::new(false),
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }
}

impl MediaSource for SyntheticSource {
    fn presentation(&self) -> anyhow::Result<Box<dyn PresentationDescriptor>> {
        if self.is_shut_down() {
            bail!("source {:?} is shut down", self.spec.name);
        }
        Ok(Box::new(SyntheticPresentation::new(&self.spec)))
    }

    fn attribute(&self, key: &str) -> Option<String> {
        match key {
            ATTR_ERROR_AT_MS => self.spec.error_at_ms.map(|ms| ms.to_string()),
            ATTR_REJECT_TOPOLOGY => {
                (self.spec.fail == Some(FailurePoint::Topology)).then(|| "1".to_string())
            }
            _ => None,
        }
    }

    fn shutdown(&self) -> anyhow::Result<()> {
        if !self.shut_down.swap(true, Ordering::AcqRel) {
            tracing::debug!(name = %self.spec.name, "synthetic source shut down");
        }
        Ok(())
    }
}

struct SyntheticPresentation {
    streams: Vec<StreamDescriptor>,
    unreadable: Option<usize>,
    duration_ticks: i64,
}

impl SyntheticPresentation {
    fn new(spec: &SyntheticSpec) -> Self {
        let mut streams = vec![StreamDescriptor {
            index: 0,
            major_type: MajorType::Video,
            selected: true,
            current_format: Some(MediaFormat {
                subtype: Subtype::Nv12,
                frame_size: Some((spec.width, spec.height)),
                frame_rate: Some(spec.fps),
            }),
        }];
        if spec.audio {
            streams.push(StreamDescriptor {
                index: streams.len(),
                major_type: MajorType::Audio,
                selected: true,
                current_format: Some(MediaFormat {
                    subtype: Subtype::Pcm,
                    frame_size: None,
                    frame_rate: None,
                }),
            });
        }
        streams.push(StreamDescriptor {
            index: streams.len(),
            major_type: MajorType::Other,
            selected: true,
            current_format: None,
        });
        let unreadable = (spec.fail == Some(FailurePoint::Streams)).then(|| streams.len() - 1);
        let duration_ms = i64::try_from(spec.duration_ms).unwrap_or(i64::MAX);
        Self {
            streams,
            unreadable,
            duration_ticks: time::ms_to_ticks(duration_ms),
        }
    }
}

impl PresentationDescriptor for SyntheticPresentation {
    fn stream_count(&self) -> anyhow::Result<usize> {
        Ok(self.streams.len())
    }

    fn stream(&self, index: usize) -> anyhow::Result<StreamDescriptor> {
        if self.unreadable == Some(index) {
            bail!("stream {index} descriptor is corrupt");
        }
        self.streams
            .get(index)
            .cloned()
            .ok_or_else(|| anyhow!("no stream {index}"))
    }

    fn deselect_stream(&mut self, index: usize) -> anyhow::Result<()> {
        let stream = self
            .streams
            .get_mut(index)
            .ok_or_else(|| anyhow!("no stream {index}"))?;
        stream.selected = false;
        Ok(())
    }

    fn duration_ticks(&self) -> Option<i64> {
        Some(self.duration_ticks)
    }
}
