//! Pipeline construction: source streams wired to video/audio sinks.
//!
//! One source node per selected stream. Video streams share a single video sink, every
//! audio stream gets its own audio renderer, and everything else is deselected so the
//! subsystem does not decode it. The first wired video stream establishes the
//! [`VideoFormat`]; the presentation's duration is read once.

use std::fmt;
use std::sync::Arc;

use anyhow::{Context, bail};

use crate::error::{EngineError, Result};
use crate::media::{
    MajorType, MediaSource, RenderTarget, SampleCallback, StreamDescriptor, Subtype, VideoFormat,
};
use crate::sample_sink::FrameSampleSink;
use crate::time;

pub type NodeId = usize;

/// Where decoded video goes.
#[derive(Clone)]
pub enum VideoOutput {
    /// Frame-grabbing sink requesting 4:2:0 samples, delivered to a [`FrameSampleSink`].
    Frames(Arc<FrameSampleSink>),
    /// Native renderer presenting into an external target.
    Renderer(RenderTarget),
    /// No video sink; video streams are deselected.
    Disabled,
}

/// Video sink flavor attached to the graph.
#[derive(Clone)]
pub enum VideoSink {
    Frames {
        callback: Arc<dyn SampleCallback>,
        subtype: Subtype,
    },
    Renderer(RenderTarget),
}

#[derive(Clone)]
pub enum SinkNode {
    Video(VideoSink),
    /// Audio renderer fed by the stream with this index.
    Audio { stream_index: usize },
}

#[derive(Clone)]
pub enum GraphNode {
    Source(StreamDescriptor),
    Sink(SinkNode),
}

impl fmt::Debug for GraphNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GraphNode::Source(stream) => f
                .debug_struct("Source")
                .field("index", &stream.index)
                .field("major_type", &stream.major_type)
                .finish(),
            GraphNode::Sink(SinkNode::Video(VideoSink::Frames { subtype, .. })) => {
                f.debug_struct("FrameSink").field("subtype", subtype).finish()
            }
            GraphNode::Sink(SinkNode::Video(VideoSink::Renderer(target))) => {
                f.debug_tuple("VideoRenderer").field(target).finish()
            }
            GraphNode::Sink(SinkNode::Audio { stream_index }) => f
                .debug_struct("AudioRenderer")
                .field("stream_index", stream_index)
                .finish(),
        }
    }
}

/// Directed edge from a source node to a sink node.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Edge {
    pub from: NodeId,
    pub to: NodeId,
}

/// Nodes and edges of one topology.
pub struct PipelineGraph {
    source: Arc<dyn MediaSource>,
    nodes: Vec<GraphNode>,
    edges: Vec<Edge>,
    video_format: Option<VideoFormat>,
    duration_ticks: Option<i64>,
}

impl PipelineGraph {
    fn new(source: Arc<dyn MediaSource>) -> Self {
        Self {
            source,
            nodes: Vec::new(),
            edges: Vec::new(),
            video_format: None,
            duration_ticks: None,
        }
    }

    fn add_node(&mut self, node: GraphNode) -> NodeId {
        self.nodes.push(node);
        self.nodes.len() - 1
    }

    fn connect(&mut self, from: NodeId, to: NodeId) {
        self.edges.push(Edge { from, to });
    }

    pub fn source(&self) -> &Arc<dyn MediaSource> {
        &self.source
    }

    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    pub fn source_nodes(&self) -> impl Iterator<Item = &StreamDescriptor> {
        self.nodes.iter().filter_map(|node| match node {
            GraphNode::Source(stream) => Some(stream),
            GraphNode::Sink(_) => None,
        })
    }

    pub fn sink_nodes(&self) -> impl Iterator<Item = &SinkNode> {
        self.nodes.iter().filter_map(|node| match node {
            GraphNode::Sink(sink) => Some(sink),
            GraphNode::Source(_) => None,
        })
    }

    /// The frame-grabbing sink callback, if the graph has one.
    pub fn frame_callback(&self) -> Option<Arc<dyn SampleCallback>> {
        self.sink_nodes().find_map(|sink| match sink {
            SinkNode::Video(VideoSink::Frames { callback, .. }) => Some(callback.clone()),
            _ => None,
        })
    }

    pub fn video_format(&self) -> Option<&VideoFormat> {
        self.video_format.as_ref()
    }

    pub fn duration_ticks(&self) -> Option<i64> {
        self.duration_ticks
    }

    /// Tell every sink that it is being torn down.
    pub fn shutdown_sinks(&self) {
        for sink in self.sink_nodes() {
            if let SinkNode::Video(VideoSink::Frames { callback, .. }) = sink {
                callback.on_shutdown();
            }
        }
    }
}

impl fmt::Debug for PipelineGraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineGraph")
            .field("nodes", &self.nodes)
            .field("edges", &self.edges)
            .field("video_format", &self.video_format)
            .field("duration_ticks", &self.duration_ticks)
            .finish()
    }
}

/// Output of [`PipelineBuilder::build`].
#[derive(Debug)]
pub struct BuiltPipeline {
    pub graph: PipelineGraph,
    pub video_format: Option<VideoFormat>,
    pub duration_ticks: Option<i64>,
}

impl BuiltPipeline {
    /// Duration in milliseconds, `-1` when unknown.
    pub fn duration_ms(&self) -> i64 {
        self.duration_ticks
            .map(time::ticks_to_ms)
            .unwrap_or(time::UNKNOWN_MS)
    }
}

pub struct PipelineBuilder {
    video: VideoOutput,
}

impl PipelineBuilder {
    pub fn new(video: VideoOutput) -> Self {
        Self { video }
    }

    /// Build the topology for `source`. Any descriptor failure discards the partial graph.
    pub fn build(&self, source: &Arc<dyn MediaSource>) -> Result<BuiltPipeline> {
        self.try_build(source).map_err(EngineError::construction)
    }

    fn try_build(&self, source: &Arc<dyn MediaSource>) -> anyhow::Result<BuiltPipeline> {
        let mut presentation = source
            .presentation()
            .context("create presentation descriptor")?;
        let count = presentation.stream_count().context("count streams")?;

        let mut graph = PipelineGraph::new(source.clone());
        let mut video_sink: Option<NodeId> = None;

        for index in 0..count {
            let stream = presentation
                .stream(index)
                .with_context(|| format!("read stream descriptor {index}"))?;

            let sink = match (stream.major_type, stream.selected) {
                (MajorType::Video, true) => match self.video_sink() {
                    Some(node) => Some(*video_sink.get_or_insert_with(|| graph.add_node(node))),
                    None => None,
                },
                (MajorType::Audio, true) => Some(graph.add_node(GraphNode::Sink(SinkNode::Audio {
                    stream_index: index,
                }))),
                _ => None,
            };

            let Some(sink) = sink else {
                tracing::debug!(index, major_type = ?stream.major_type, "deselecting stream");
                presentation
                    .deselect_stream(index)
                    .with_context(|| format!("deselect stream {index}"))?;
                continue;
            };

            if stream.major_type == MajorType::Video && graph.video_format.is_none() {
                graph.video_format = self.video_format_of(&stream);
            }
            let node = graph.add_node(GraphNode::Source(stream));
            graph.connect(node, sink);
        }

        if count > 0 && graph.edges.is_empty() {
            bail!("none of {count} streams could be wired");
        }

        graph.duration_ticks = presentation.duration_ticks();
        tracing::debug!(
            streams = count,
            edges = graph.edges.len(),
            video = ?graph.video_format,
            duration_ticks = ?graph.duration_ticks,
            "pipeline graph built"
        );

        Ok(BuiltPipeline {
            video_format: graph.video_format.clone(),
            duration_ticks: graph.duration_ticks,
            graph,
        })
    }

    fn video_sink(&self) -> Option<GraphNode> {
        let sink = match &self.video {
            VideoOutput::Frames(sink) => VideoSink::Frames {
                callback: sink.clone(),
                subtype: Subtype::Nv12,
            },
            VideoOutput::Renderer(target) => VideoSink::Renderer(*target),
            VideoOutput::Disabled => return None,
        };
        Some(GraphNode::Sink(SinkNode::Video(sink)))
    }

    fn video_format_of(&self, stream: &StreamDescriptor) -> Option<VideoFormat> {
        let format = stream.current_format.as_ref();
        let Some((width, height)) = format.and_then(|f| f.frame_size) else {
            tracing::warn!(index = stream.index, "video stream has no frame size");
            return None;
        };
        let layout = match &self.video {
            VideoOutput::Frames(_) => Subtype::Nv12,
            _ => format.map(|f| f.subtype.clone()).unwrap_or(Subtype::Nv12),
        };
        Some(VideoFormat {
            width,
            height,
            layout,
        })
    }
}
