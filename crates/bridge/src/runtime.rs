//! Bridge runtime helpers.
//!
//! Drives the engine against the synthetic media subsystem: local playback, probing, and
//! a JSON-lines host loop around the method dispatcher.

use std::io::{BufRead, Write};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use crossbeam_channel::{Receiver, Sender};
use serde::{Deserialize, Serialize};

use video_bridge_types::{OpenResponse, PlaybackState, SessionStatus, StateChangeEvent};
use video_player::media::MediaLocator;
use video_player::sample_sink::FrameConsumer;
use video_player::synthetic::SyntheticSubsystem;
use video_player::{OpenInfo, OpenOptions, PlaybackSession, StateObserver};

use crate::config::{BridgePlayConfig, BridgeProbeConfig, BridgeServeConfig};
use crate::dispatch::{Bridge, MethodCall, MethodReply};
use crate::events::{HostEvent, HostEvents};
use crate::registry::PlayerRegistry;
use crate::texture::PixelBufferTexture;

const OPEN_TIMEOUT: Duration = Duration::from_secs(30);
const REPLY_TIMEOUT: Duration = Duration::from_secs(30);
const PROGRESS_INTERVAL: Duration = Duration::from_secs(1);
const CLI_TEXTURE_ID: i64 = 1;

/// Outcome of a `play` run.
#[derive(Clone, Debug)]
pub struct PlaySummary {
    pub info: OpenInfo,
    pub final_state: PlaybackState,
    /// Frames copied out of the texture.
    pub frames_copied: u64,
    pub status: SessionStatus,
}

/// Install a Ctrl-C handler that signals the returned receiver.
pub fn interrupt_channel(install_ctrlc: bool) -> Receiver<()> {
    let (tx, rx) = crossbeam_channel::bounded(1);
    if install_ctrlc {
        if let Err(e) = ctrlc::set_handler(move || {
            let _ = tx.try_send(());
        }) {
            tracing::warn!("ctrl-c handler not installed: {e}");
        }
    }
    rx
}

fn observer(events: &HostEvents) -> Arc<dyn StateObserver> {
    let events = events.clone();
    Arc::new(move |event: StateChangeEvent| events.publish(HostEvent::from(event)))
}

fn wait_open(
    session: &PlaybackSession,
    open_rx: &Receiver<video_player::Result<OpenInfo>>,
    stop: &Receiver<()>,
) -> Result<OpenInfo> {
    crossbeam_channel::select! {
        recv(open_rx) -> msg => {
            let result = msg.context("open callback dropped")?;
            Ok(result.context("open media")?)
        }
        recv(stop) -> _ => {
            session.shutdown();
            bail!("interrupted while opening");
        }
        default(OPEN_TIMEOUT) => {
            session.shutdown();
            bail!("timed out opening media");
        }
    }
}

/// Open `locator`, play it, and return once it ends, fails, hits `max_secs`, or `stop`
/// fires.
pub fn run_play(config: BridgePlayConfig, stop: Receiver<()>) -> Result<PlaySummary> {
    let subsystem = SyntheticSubsystem::new(config.bridge.synthetic.clone())
        .context("start media subsystem")?;
    let (events, event_rx) = HostEvents::channel();
    let texture = Arc::new(PixelBufferTexture::new(CLI_TEXTURE_ID, events.clone()));
    let (open_tx, open_rx) = crossbeam_channel::bounded(1);

    let session = PlaybackSession::open(
        subsystem,
        config.bridge.engine.clone(),
        MediaLocator::new(config.locator.clone()),
        OpenOptions {
            session_id: Some(CLI_TEXTURE_ID),
            consumer: Some(texture.clone() as Arc<dyn FrameConsumer>),
            render_target: None,
            observer: Some(observer(&events)),
        },
        move |result| {
            let _ = open_tx.send(result);
        },
    );
    if let Some(slot) = session.frame_slot() {
        texture.attach(slot);
    }

    let info = wait_open(&session, &open_rx, &stop)?;
    tracing::info!(
        locator = %config.locator,
        duration_ms = info.duration_ms,
        width = info.width,
        height = info.height,
        volume = info.volume,
        "media opened"
    );

    if let Some(volume) = config.volume {
        session.set_volume(volume).context("set volume")?;
    }
    if config.mute {
        session.set_mute(true).context("mute")?;
    }
    if let Some(rate) = config.rate {
        session.set_rate(rate).context("set rate")?;
    }
    session.play(config.seek_ms).context("start playback")?;

    let deadline = config
        .max_secs
        .filter(|secs| secs.is_finite() && *secs >= 0.0)
        .map(|secs| Instant::now() + Duration::from_secs_f64(secs));
    let mut frames_copied = 0u64;
    let mut last_progress = Instant::now();
    let mut final_state = session.state();

    loop {
        let now = Instant::now();
        let wait = match deadline {
            Some(deadline) if deadline <= now => {
                tracing::info!("play time limit reached");
                break;
            }
            Some(deadline) => (deadline - now).min(PROGRESS_INTERVAL),
            None => PROGRESS_INTERVAL,
        };
        crossbeam_channel::select! {
            recv(event_rx) -> msg => match msg {
                Ok(HostEvent::FrameAvailable { .. }) => {
                    if texture.copy_pixel_buffer().is_some() {
                        frames_copied += 1;
                    }
                }
                Ok(HostEvent::Playback { state, error, .. }) => {
                    let state = PlaybackState::from_code(state).unwrap_or_default();
                    final_state = state;
                    match state {
                        PlaybackState::Ended => {
                            tracing::info!("end of media");
                            break;
                        }
                        PlaybackState::Error => {
                            tracing::warn!(error = ?error, "playback error");
                            break;
                        }
                        other => tracing::debug!(state = ?other, "playback state"),
                    }
                }
                Err(_) => break,
            },
            recv(stop) -> _ => {
                tracing::info!("interrupted");
                break;
            }
            default(wait) => {}
        }
        if last_progress.elapsed() >= PROGRESS_INTERVAL {
            last_progress = Instant::now();
            tracing::info!(
                position_ms = session.position_ms(),
                duration_ms = session.duration_ms(),
                frames = frames_copied,
                "progress"
            );
        }
    }

    let status = session.status();
    session.shutdown();
    Ok(PlaySummary {
        info,
        final_state,
        frames_copied,
        status,
    })
}

/// Frame consumer for sessions nobody renders.
struct DiscardFrames;

impl FrameConsumer for DiscardFrames {
    fn frame_available(&self) {}
}

/// Open `locator` and report its media info.
///
/// The session gets a discarding frame consumer so the video stream is wired and its size
/// is known; it is never started.
pub fn run_probe(config: BridgeProbeConfig, stop: Receiver<()>) -> Result<OpenResponse> {
    let subsystem = SyntheticSubsystem::new(config.bridge.synthetic.clone())
        .context("start media subsystem")?;
    let (open_tx, open_rx) = crossbeam_channel::bounded(1);
    let session = PlaybackSession::open(
        subsystem,
        config.bridge.engine.clone(),
        MediaLocator::new(config.locator.clone()),
        OpenOptions {
            consumer: Some(Arc::new(DiscardFrames) as Arc<dyn FrameConsumer>),
            ..OpenOptions::default()
        },
        move |result| {
            let _ = open_tx.send(result);
        },
    );
    let response = match wait_open(&session, &open_rx, &stop) {
        Ok(info) => OpenResponse {
            result: true,
            texture_id: Some(session.id()),
            duration: Some(info.duration_ms),
            video_width: Some(info.width),
            video_height: Some(info.height),
            volume: Some(f64::from(info.volume)),
        },
        Err(e) => {
            tracing::warn!(locator = %config.locator, "probe failed: {e:#}");
            OpenResponse::failed()
        }
    };
    session.shutdown();
    Ok(response)
}

#[derive(Debug, Deserialize)]
struct Request {
    #[serde(default)]
    id: Option<u64>,
    #[serde(flatten)]
    call: MethodCall,
}

#[derive(Serialize)]
#[serde(untagged)]
enum Outbound<'a> {
    Reply {
        id: Option<u64>,
        reply: &'a MethodReply,
    },
    Event {
        event: &'a HostEvent,
    },
}

fn write_line<W: Write>(out: &Mutex<W>, message: &Outbound<'_>) -> Result<()> {
    let line = serde_json::to_string(message).context("encode message")?;
    let mut out = out.lock().unwrap_or_else(|e| e.into_inner());
    writeln!(out, "{line}").context("write message")?;
    out.flush().context("flush output")
}

/// Forward host events to `out` until every publisher is gone.
fn spawn_event_writer<W>(
    events: Receiver<HostEvent>,
    out: Arc<Mutex<W>>,
) -> Result<std::thread::JoinHandle<()>>
where
    W: Write + Send + 'static,
{
    std::thread::Builder::new()
        .name("host-events".into())
        .spawn(move || {
            for event in events.iter() {
                if let Err(e) = write_line(&out, &Outbound::Event { event: &event }) {
                    tracing::warn!("event write failed: {e:#}");
                    break;
                }
            }
        })
        .context("spawn event writer")
}

/// Serve one JSON request per input line, waiting for each reply before reading on.
///
/// Returns the number of requests handled. Every player is cleared at end of input.
pub fn serve_lines<R, W>(bridge: &Bridge, input: R, out: &Mutex<W>) -> Result<usize>
where
    R: BufRead,
    W: Write,
{
    let mut handled = 0;
    for line in input.lines() {
        let line = line.context("read request")?;
        if line.trim().is_empty() {
            continue;
        }
        let request = match serde_json::from_str::<Request>(&line) {
            Ok(request) => request,
            Err(e) => {
                tracing::warn!("bad request: {e}");
                let reply = MethodReply::Error {
                    code: "bad_request".to_string(),
                    message: e.to_string(),
                };
                write_line(out, &Outbound::Reply { id: None, reply: &reply })?;
                continue;
            }
        };
        let (tx, rx): (Sender<MethodReply>, _) = crossbeam_channel::bounded(1);
        bridge.handle(request.call, move |reply| {
            let _ = tx.send(reply);
        });
        let reply = rx.recv_timeout(REPLY_TIMEOUT).unwrap_or_else(|_| MethodReply::Error {
            code: "timeout".to_string(),
            message: "no reply".to_string(),
        });
        write_line(
            out,
            &Outbound::Reply {
                id: request.id,
                reply: &reply,
            },
        )?;
        handled += 1;
    }
    let cleared = bridge.registry().clear_all();
    tracing::info!(handled, cleared, "input closed");
    Ok(handled)
}

/// Run the JSON-lines host loop on stdin.
pub fn run_serve(config: BridgeServeConfig, install_ctrlc: bool) -> Result<()> {
    let subsystem = SyntheticSubsystem::new(config.bridge.synthetic.clone())
        .context("start media subsystem")?;
    let registry = Arc::new(PlayerRegistry::new());
    let (events, event_rx) = HostEvents::channel();
    let bridge = Bridge::new(subsystem, config.bridge.engine.clone(), registry.clone(), events);

    if install_ctrlc {
        let registry = registry.clone();
        if let Err(e) = ctrlc::set_handler(move || {
            registry.clear_all();
            std::process::exit(130);
        }) {
            tracing::warn!("ctrl-c handler not installed: {e}");
        }
    }

    let out: Arc<Mutex<Box<dyn Write + Send>>> = match &config.transcript {
        Some(path) => {
            let file = std::fs::File::create(path)
                .with_context(|| format!("create transcript {:?}", path))?;
            Arc::new(Mutex::new(Box::new(file)))
        }
        None => Arc::new(Mutex::new(Box::new(std::io::stdout()))),
    };
    let _events = spawn_event_writer(event_rx, out.clone())?;
    tracing::info!("serving host calls on stdin");
    let stdin = std::io::stdin();
    serve_lines(&bridge, stdin.lock(), &out)?;
    Ok(())
}
