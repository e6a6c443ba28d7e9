//! In-process media subsystem rendering test patterns.
//!
//! Locators look like
//! `synthetic://<name>?width=320&height=180&duration_ms=2000&fps=30&audio=true`
//! with optional `resolve_delay_ms`, `fail=resolve|capability|streams|topology` and
//! `error_at_ms`. Used by the CLI and by the engine's own tests.

mod pipeline;
mod source;

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use anyhow::{Context, anyhow, bail};
use crossbeam_channel::Sender;
use serde::Deserialize;

use crate::media::{
    AudioVolume, Job, MediaLocator, MediaPipeline, MediaSubsystem, ResolveCallback,
    ResolveCookie, ResolvedObject, WorkQueue,
};

pub use pipeline::SyntheticPipeline;
pub use source::SyntheticSource;

/// Subsystem knobs (the `[synthetic]` config table).
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct SyntheticConfig {
    /// Threads serving the work queue.
    pub workers: usize,
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        Self { workers: 2 }
    }
}

/// Injected failure.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailurePoint {
    /// Resolution reports an error.
    Resolve,
    /// Resolution yields something that is not a media source.
    Capability,
    /// A stream descriptor cannot be read.
    Streams,
    /// The pipeline rejects the topology.
    Topology,
}

impl FromStr for FailurePoint {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        Ok(match s {
            "resolve" => FailurePoint::Resolve,
            "capability" => FailurePoint::Capability,
            "streams" => FailurePoint::Streams,
            "topology" => FailurePoint::Topology,
            other => bail!("unknown failure point {other:?}"),
        })
    }
}

/// Parsed synthetic locator.
#[derive(Clone, Debug, PartialEq)]
pub struct SyntheticSpec {
    pub name: String,
    pub width: u32,
    pub height: u32,
    pub duration_ms: u64,
    pub fps: u32,
    pub audio: bool,
    pub resolve_delay_ms: u64,
    pub fail: Option<FailurePoint>,
    pub error_at_ms: Option<u64>,
}

impl Default for SyntheticSpec {
    fn default() -> Self {
        Self {
            name: String::new(),
            width: 320,
            height: 180,
            duration_ms: 2000,
            fps: 30,
            audio: true,
            resolve_delay_ms: 10,
            fail: None,
            error_at_ms: None,
        }
    }
}

impl SyntheticSpec {
    pub const SCHEME: &'static str = "synthetic://";

    pub fn parse(locator: &str) -> anyhow::Result<Self> {
        let rest = locator
            .strip_prefix(Self::SCHEME)
            .ok_or_else(|| anyhow!("unsupported locator {locator:?}"))?;
        let (name, query) = rest.split_once('?').unwrap_or((rest, ""));
        let mut spec = SyntheticSpec {
            name: name.to_string(),
            ..SyntheticSpec::default()
        };

        for pair in query.split('&').filter(|p| !p.is_empty()) {
            let (key, value) = pair
                .split_once('=')
                .ok_or_else(|| anyhow!("malformed query parameter {pair:?}"))?;
            let bad = || format!("invalid value for {key}: {value:?}");
            match key {
                "width" => spec.width = value.parse().with_context(bad)?,
                "height" => spec.height = value.parse().with_context(bad)?,
                "duration_ms" => spec.duration_ms = value.parse().with_context(bad)?,
                "fps" => spec.fps = value.parse().with_context(bad)?,
                "audio" => spec.audio = value.parse().with_context(bad)?,
                "resolve_delay_ms" => spec.resolve_delay_ms = value.parse().with_context(bad)?,
                "fail" => spec.fail = Some(value.parse()?),
                "error_at_ms" => spec.error_at_ms = Some(value.parse().with_context(bad)?),
                other => bail!("unknown query parameter {other:?}"),
            }
        }
        if spec.width == 0 || spec.height == 0 {
            bail!("frame size must be non-zero");
        }
        Ok(spec)
    }
}

/// In-memory endpoint volume.
pub struct SyntheticVolume {
    level: Mutex<f32>,
    muted: AtomicBool,
}

impl Default for SyntheticVolume {
    fn default() -> Self {
        Self {
            level: Mutex::new(1.0),
            muted: AtomicBool::new(false),
        }
    }
}

impl AudioVolume for SyntheticVolume {
    fn master_volume(&self) -> anyhow::Result<f32> {
        Ok(*self.level.lock().unwrap_or_else(|e| e.into_inner()))
    }

    fn set_master_volume(&self, volume: f32) -> anyhow::Result<()> {
        if !(0.0..=1.0).contains(&volume) {
            bail!("volume {volume} out of range");
        }
        *self.level.lock().unwrap_or_else(|e| e.into_inner()) = volume;
        Ok(())
    }

    fn is_muted(&self) -> anyhow::Result<bool> {
        Ok(self.muted.load(Ordering::Relaxed))
    }

    fn set_mute(&self, muted: bool) -> anyhow::Result<()> {
        self.muted.store(muted, Ordering::Relaxed);
        Ok(())
    }
}

type PendingResolutions = Arc<Mutex<HashMap<u64, Arc<AtomicBool>>>>;

/// Synthetic media subsystem.
pub struct SyntheticSubsystem {
    jobs: Sender<Job>,
    pending: PendingResolutions,
    next_cookie: AtomicU64,
    volume: Arc<SyntheticVolume>,
}

impl SyntheticSubsystem {
    /// Start the work-queue threads.
    pub fn new(config: SyntheticConfig) -> anyhow::Result<Arc<Self>> {
        let (jobs, rx) = crossbeam_channel::unbounded::<Job>();
        for i in 0..config.workers.max(1) {
            let rx = rx.clone();
            thread::Builder::new()
                .name(format!("synthetic-worker-{i}"))
                .spawn(move || {
                    while let Ok(job) = rx.recv() {
                        job();
                    }
                })
                .context("spawn synthetic worker")?;
        }
        tracing::debug!(workers = config.workers.max(1), "synthetic subsystem started");
        Ok(Arc::new(Self {
            jobs,
            pending: Arc::new(Mutex::new(HashMap::new())),
            next_cookie: AtomicU64::new(1),
            volume: Arc::new(SyntheticVolume::default()),
        }))
    }

    /// Resolutions that have neither completed nor been canceled.
    pub fn pending_resolutions(&self) -> usize {
        self.pending.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

impl WorkQueue for SyntheticSubsystem {
    fn post(&self, job: Job) {
        if self.jobs.send(job).is_err() {
            tracing::warn!("synthetic work queue closed; dropping job");
        }
    }
}

impl MediaSubsystem for SyntheticSubsystem {
    fn begin_resolve(
        &self,
        locator: &MediaLocator,
        callback: ResolveCallback,
    ) -> anyhow::Result<ResolveCookie> {
        let spec = SyntheticSpec::parse(locator.as_str())?;
        let cookie = self.next_cookie.fetch_add(1, Ordering::Relaxed);
        let canceled = Arc::new(AtomicBool::new(false));
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(cookie, canceled.clone());

        let pending = self.pending.clone();
        let spawned = thread::Builder::new()
            .name("synthetic-resolve".into())
            .spawn(move || {
                if spec.resolve_delay_ms > 0 {
                    thread::sleep(Duration::from_millis(spec.resolve_delay_ms));
                }
                let still_pending = pending
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .remove(&cookie)
                    .is_some();
                if !still_pending || canceled.load(Ordering::Acquire) {
                    tracing::trace!(cookie, "resolution canceled");
                    return;
                }
                let result = match spec.fail {
                    Some(FailurePoint::Resolve) => Err(anyhow!("cannot open {:?}", spec.name)),
                    Some(FailurePoint::Capability) => Ok(ResolvedObject::Other("byte-stream".into())),
                    _ => Ok(ResolvedObject::MediaSource(Arc::new(SyntheticSource::new(spec)))),
                };
                callback(result);
            });
        if let Err(e) = spawned {
            self.pending
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(&cookie);
            return Err(e).context("spawn resolver thread");
        }
        Ok(ResolveCookie(cookie))
    }

    fn cancel_resolve(&self, cookie: ResolveCookie) {
        let flag = self
            .pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&cookie.0);
        if let Some(flag) = flag {
            flag.store(true, Ordering::Release);
            tracing::trace!(cookie = cookie.0, "resolution cancel requested");
        }
    }

    fn create_pipeline(&self) -> anyhow::Result<Arc<dyn MediaPipeline>> {
        let pipeline: Arc<dyn MediaPipeline> = SyntheticPipeline::spawn()?;
        Ok(pipeline)
    }

    fn audio_volume(&self) -> Option<Arc<dyn AudioVolume>> {
        Some(self.volume.clone())
    }
}
