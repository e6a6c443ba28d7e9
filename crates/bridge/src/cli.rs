use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::config::ConfigOverrides;

#[derive(Parser, Debug)]
#[command(name = "video-bridge", version)]
pub struct Args {
    #[command(subcommand)]
    pub cmd: Command,

    /// TOML config file with [engine] and [synthetic] tables
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Minimum gap between delivered frames in milliseconds (overrides config)
    #[arg(long, global = true)]
    pub frame_interval_ms: Option<u64>,

    /// Media subsystem worker threads (overrides config)
    #[arg(long, global = true)]
    pub workers: Option<usize>,
}

impl Args {
    pub fn overrides(&self) -> ConfigOverrides {
        ConfigOverrides {
            frame_interval_ms: self.frame_interval_ms,
            workers: self.workers,
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Open a locator and play it until it ends
    Play {
        /// Media locator, e.g. synthetic://demo?duration_ms=3000
        locator: String,

        /// Start position in milliseconds
        #[arg(long)]
        seek_ms: Option<i64>,

        /// Playback rate (1.0 = normal speed)
        #[arg(long)]
        rate: Option<f32>,

        /// Endpoint volume in 0.0..=1.0
        #[arg(long)]
        volume: Option<f32>,

        /// Mute audio
        #[arg(long)]
        mute: bool,

        /// Stop after this many seconds
        #[arg(long)]
        max_secs: Option<f64>,
    },

    /// Open a locator, print its media info as JSON, and exit
    Probe {
        /// Media locator
        locator: String,
    },

    /// Serve host method calls as JSON lines on stdin; replies and events go to stdout
    Serve {
        /// Write the reply/event stream to this file instead of stdout
        #[arg(long)]
        transcript: Option<PathBuf>,
    },
}
