//! Video Bridge: host-side bridge and CLI for the video playback engine.
//!
//! ## Commands
//! - `play`: open a locator, play it to the end (or `--max-secs`), copying frames out of a
//!   pixel-buffer texture the way a host would.
//! - `probe`: open a locator and print its media info as JSON.
//! - `serve`: run the host method dispatcher over JSON lines on stdin.
//!
//! Media is provided by the in-process synthetic subsystem (`synthetic://` locators).

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use video_bridge::cli::{Args, Command};
use video_bridge::config::{BridgeConfig, BridgePlayConfig, BridgeProbeConfig, BridgeServeConfig};
use video_bridge::runtime;

fn main() -> Result<()> {
    let args = Args::parse();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new("info,video_bridge=info,video_player=info")
        }))
        .with_writer(std::io::stderr)
        .init();

    let bridge = BridgeConfig::load_or_default(args.config.as_deref())?
        .with_overrides(&args.overrides());

    match args.cmd {
        Command::Play {
            locator,
            seek_ms,
            rate,
            volume,
            mute,
            max_secs,
        } => {
            let stop = runtime::interrupt_channel(true);
            let summary = runtime::run_play(
                BridgePlayConfig {
                    locator,
                    seek_ms,
                    rate,
                    volume,
                    mute,
                    max_secs,
                    bridge,
                },
                stop,
            )?;
            tracing::info!(
                state = ?summary.final_state,
                frames = summary.frames_copied,
                delivered = summary.status.frames_delivered,
                dropped = summary.status.frames_dropped,
                "playback finished"
            );
            if let Some(error) = summary.status.last_error {
                anyhow::bail!("playback failed: {error}");
            }
        }
        Command::Probe { locator } => {
            let stop = runtime::interrupt_channel(true);
            let response = runtime::run_probe(BridgeProbeConfig { locator, bridge }, stop)?;
            let json = serde_json::to_string_pretty(&response).context("encode probe result")?;
            println!("{json}");
            if !response.result {
                std::process::exit(1);
            }
        }
        Command::Serve { transcript } => {
            runtime::run_serve(BridgeServeConfig { bridge, transcript }, true)?;
        }
    }

    Ok(())
}
