//! Host method-call dispatch.
//!
//! Each call names a method and carries JSON arguments. Replies go through a one-shot
//! responder: synchronously for transport commands, from a subsystem thread for
//! `openVideo`.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use video_bridge_types::{OpenResponse, StateChangeEvent};
use video_player::config::EngineConfig;
use video_player::media::{MediaLocator, MediaSubsystem, RenderTarget};
use video_player::sample_sink::FrameConsumer;
use video_player::{EngineError, OpenInfo, OpenOptions, PlaybackSession, StateObserver};

use crate::events::{HostEvent, HostEvents};
use crate::registry::{PlayerEntry, PlayerRegistry};
use crate::texture::PixelBufferTexture;

/// One inbound host call.
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct MethodCall {
    pub method: String,
    #[serde(default)]
    pub args: Value,
}

impl MethodCall {
    pub fn new(method: impl Into<String>, args: Value) -> Self {
        Self {
            method: method.into(),
            args,
        }
    }
}

/// Reply to a host call.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "status", content = "value", rename_all = "snake_case")]
pub enum MethodReply {
    Success(Value),
    Error { code: String, message: String },
    NotImplemented,
}

impl MethodReply {
    fn error(code: &str, message: impl Into<String>) -> Self {
        MethodReply::Error {
            code: code.to_string(),
            message: message.into(),
        }
    }

    fn from_engine(err: &EngineError) -> Self {
        let code = match err {
            EngineError::NotReady => "not_ready",
            EngineError::Canceled => "canceled",
            _ => "engine_error",
        };
        Self::error(code, format!("{err:#}"))
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CallArgs {
    texture_id: Option<i64>,
    path: Option<String>,
    render_target: Option<u64>,
    position_ms: Option<i64>,
    ms: Option<i64>,
    speed: Option<f64>,
    volume: Option<f64>,
    muted: Option<bool>,
}

fn required<T>(value: Option<T>, name: &str) -> Result<T, MethodReply> {
    value.ok_or_else(|| MethodReply::error("bad_args", format!("missing argument {name:?}")))
}

/// Method dispatcher bound to one media subsystem.
pub struct Bridge {
    subsystem: Arc<dyn MediaSubsystem>,
    config: EngineConfig,
    registry: Arc<PlayerRegistry>,
    events: HostEvents,
}

impl Bridge {
    pub fn new(
        subsystem: Arc<dyn MediaSubsystem>,
        config: EngineConfig,
        registry: Arc<PlayerRegistry>,
        events: HostEvents,
    ) -> Self {
        Self {
            subsystem,
            config,
            registry,
            events,
        }
    }

    pub fn registry(&self) -> &Arc<PlayerRegistry> {
        &self.registry
    }

    /// Dispatch `call`; `reply` fires exactly once.
    pub fn handle<F>(&self, call: MethodCall, reply: F)
    where
        F: FnOnce(MethodReply) + Send + 'static,
    {
        tracing::debug!(method = %call.method, "host call");
        if call.method == "clearAll" {
            let removed = self.registry.clear_all();
            tracing::info!(removed, "cleared all players");
            reply(MethodReply::Success(Value::Null));
            return;
        }

        let args = if call.args.is_null() {
            CallArgs::default()
        } else {
            match serde_json::from_value::<CallArgs>(call.args) {
                Ok(args) => args,
                Err(e) => {
                    reply(MethodReply::error("bad_args", format!("{e:#}")));
                    return;
                }
            }
        };

        if call.method == "openVideo" {
            self.open_video(args, reply);
            return;
        }

        let Some(texture_id) = args.texture_id else {
            reply(MethodReply::Success(Value::Null));
            return;
        };
        let Some(player) = self.registry.get(texture_id) else {
            tracing::debug!(texture_id, method = %call.method, "no such player");
            reply(MethodReply::Success(Value::Null));
            return;
        };
        let outcome = self.command(&call.method, texture_id, &player, args);
        reply(outcome.unwrap_or_else(|err| err));
    }

    fn command(
        &self,
        method: &str,
        texture_id: i64,
        player: &PlayerEntry,
        args: CallArgs,
    ) -> Result<MethodReply, MethodReply> {
        let session = &player.session;
        let done = |result: video_player::Result<()>| match result {
            Ok(()) => Ok(MethodReply::Success(Value::Bool(true))),
            Err(err) => Err(MethodReply::from_engine(&err)),
        };
        match method {
            "play" => done(session.play(args.position_ms)),
            "pause" => done(session.pause()),
            "seekTo" => done(session.seek(required(args.ms, "ms")?)),
            "getCurrentPosition" => Ok(MethodReply::Success(json!(session.position_ms()))),
            "getDuration" => Ok(MethodReply::Success(json!(session.duration_ms()))),
            "setPlaybackSpeed" => done(session.set_rate(required(args.speed, "speed")? as f32)),
            "setVolume" => done(session.set_volume(required(args.volume, "volume")? as f32)),
            "getVolume" => match session.volume() {
                Ok(volume) => Ok(MethodReply::Success(json!(f64::from(volume)))),
                Err(err) => Err(MethodReply::from_engine(&err)),
            },
            "setMute" => done(session.set_mute(required(args.muted, "muted")?)),
            "shutdown" => {
                session.shutdown();
                Ok(MethodReply::Success(Value::Bool(true)))
            }
            "dispose" => {
                if let Some(entry) = self.registry.remove(texture_id) {
                    entry.session.detach_consumer();
                    entry.session.shutdown();
                }
                Ok(MethodReply::Success(Value::Bool(true)))
            }
            other => {
                tracing::debug!(method = other, "method not implemented");
                Ok(MethodReply::NotImplemented)
            }
        }
    }

    fn open_video<F>(&self, args: CallArgs, reply: F)
    where
        F: FnOnce(MethodReply) + Send + 'static,
    {
        let path = match required(args.path, "path") {
            Ok(path) => path,
            Err(err) => {
                reply(err);
                return;
            }
        };
        let render_target = args.render_target.map(RenderTarget);

        // `create` holds the registry lock until the entry is in place; the open
        // callback looks the player up again and so cannot observe a half-built entry.
        let registry = self.registry.clone();
        let created = self.registry.create(|id| {
            let texture = Arc::new(PixelBufferTexture::new(id, self.events.clone()));
            let events = self.events.clone();
            let observer: Arc<dyn StateObserver> =
                Arc::new(move |event: StateChangeEvent| events.publish(HostEvent::from(event)));
            let consumer: Option<Arc<dyn FrameConsumer>> = match render_target {
                Some(_) => None,
                None => Some(texture.clone() as Arc<dyn FrameConsumer>),
            };
            let session = PlaybackSession::open(
                self.subsystem.clone(),
                self.config.clone(),
                MediaLocator::new(path.clone()),
                OpenOptions {
                    session_id: Some(id),
                    consumer,
                    render_target,
                    observer: Some(observer),
                },
                move |result| finish_open(&registry, id, result, reply),
            );
            if let Some(slot) = session.frame_slot() {
                texture.attach(slot);
            }
            Ok(PlayerEntry {
                session: Arc::new(session),
                texture,
            })
        });
        if let Err(e) = created {
            tracing::warn!(path = %path, "create player failed: {e:#}");
        }
    }
}

fn finish_open<F>(
    registry: &PlayerRegistry,
    texture_id: i64,
    result: video_player::Result<OpenInfo>,
    reply: F,
) where
    F: FnOnce(MethodReply),
{
    let response = match result {
        Ok(info) if registry.contains(texture_id) => OpenResponse {
            result: true,
            texture_id: Some(texture_id),
            duration: Some(info.duration_ms),
            video_width: Some(info.width),
            video_height: Some(info.height),
            volume: Some(f64::from(info.volume)),
        },
        Ok(_) => {
            tracing::info!(texture_id, "player disposed while opening");
            OpenResponse::failed()
        }
        Err(err) => {
            tracing::warn!(texture_id, "open failed: {err:#}");
            if let Some(entry) = registry.remove(texture_id) {
                entry.session.shutdown();
            }
            OpenResponse::failed()
        }
    };
    match serde_json::to_value(&response) {
        Ok(value) => reply(MethodReply::Success(value)),
        Err(e) => reply(MethodReply::error("internal", format!("{e:#}"))),
    }
}
