//! Video playback engine core.
//!
//! Resolves a source locator asynchronously, wires its streams into a sink graph, runs the
//! session state machine off the media subsystem's event stream, and converts delivered
//! 4:2:0 frames into RGBA for a pull-model consumer.
//!
//! Demuxing, decoding, clocks and rendering belong to the external media subsystem; see
//! [`media`] for the boundary and [`synthetic`] for the in-process implementation.

pub mod async_op;
pub mod config;
pub mod convert;
pub mod error;
pub mod events;
pub mod lifetime;
pub mod media;
pub mod pipeline;
pub mod resolver;
pub mod sample_sink;
pub mod session;
pub mod status;
pub mod synthetic;
pub mod time;

pub use error::{EngineError, Result};
pub use session::{OpenInfo, OpenOptions, PlaybackSession, SessionId, StateObserver};
pub use video_bridge_types::{PlaybackState, StateChangeEvent};
