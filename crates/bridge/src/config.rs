//! Bridge configuration.
//!
//! An optional TOML file supplies engine tuning (`[engine]`) and synthetic subsystem
//! settings (`[synthetic]`); command-line flags override individual values.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

pub use video_player::config::EngineConfig;
pub use video_player::synthetic::SyntheticConfig;

/// Top-level bridge configuration loaded from TOML.
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct BridgeConfig {
    /// Engine tuning shared by every session.
    pub engine: EngineConfig,
    /// Reference media subsystem settings.
    pub synthetic: SyntheticConfig,
}

impl BridgeConfig {
    /// Load config from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let raw =
            std::fs::read_to_string(path).with_context(|| format!("read config {:?}", path))?;
        Self::parse(&raw).with_context(|| format!("parse config {:?}", path))
    }

    pub fn parse(raw: &str) -> Result<Self> {
        let cfg = toml::from_str::<BridgeConfig>(raw)?;
        if cfg.synthetic.workers == 0 {
            anyhow::bail!("synthetic.workers must be at least 1");
        }
        Ok(cfg)
    }

    /// Load `path` when given, defaults otherwise.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None => Ok(Self::default()),
        }
    }

    /// Apply command-line overrides.
    pub fn with_overrides(mut self, overrides: &ConfigOverrides) -> Self {
        if let Some(ms) = overrides.frame_interval_ms {
            self.engine.min_frame_interval_ms = ms;
        }
        if let Some(workers) = overrides.workers {
            self.synthetic.workers = workers.max(1);
        }
        self
    }
}

/// Values the command line may override.
#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    pub frame_interval_ms: Option<u64>,
    pub workers: Option<usize>,
}

/// Resolved settings for `play`.
#[derive(Clone, Debug)]
pub struct BridgePlayConfig {
    pub locator: String,
    pub seek_ms: Option<i64>,
    pub rate: Option<f32>,
    pub volume: Option<f32>,
    pub mute: bool,
    /// Stop after this many seconds of wall time.
    pub max_secs: Option<f64>,
    pub bridge: BridgeConfig,
}

/// Resolved settings for `probe`.
#[derive(Clone, Debug)]
pub struct BridgeProbeConfig {
    pub locator: String,
    pub bridge: BridgeConfig,
}

/// Resolved settings for `serve`.
#[derive(Clone, Debug)]
pub struct BridgeServeConfig {
    pub bridge: BridgeConfig,
    /// Optional file receiving the JSON-lines transcript instead of stdout.
    pub transcript: Option<PathBuf>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_uses_defaults() {
        let cfg = BridgeConfig::parse("").unwrap();
        assert_eq!(cfg, BridgeConfig::default());
        assert_eq!(cfg.engine.min_frame_interval_ms, 33);
        assert_eq!(cfg.synthetic.workers, 2);
    }

    #[test]
    fn tables_override_individual_fields() {
        let cfg = BridgeConfig::parse(
            r#"
            [engine]
            min_frame_interval_ms = 16
            unaligned_height_fallback = false

            [synthetic]
            workers = 4
            "#,
        )
        .unwrap();
        assert_eq!(cfg.engine.min_frame_interval_ms, 16);
        assert!(!cfg.engine.unaligned_height_fallback);
        assert_eq!(cfg.engine.plane_alignment, 16);
        assert_eq!(cfg.synthetic.workers, 4);
    }

    #[test]
    fn rejects_unknown_tables_and_zero_workers() {
        assert!(BridgeConfig::parse("[audio]\nrate = 1").is_err());
        assert!(BridgeConfig::parse("[synthetic]\nworkers = 0").is_err());
    }

    #[test]
    fn overrides_win_over_file_values() {
        let cfg = BridgeConfig::parse("[engine]\nmin_frame_interval_ms = 50")
            .unwrap()
            .with_overrides(&ConfigOverrides {
                frame_interval_ms: Some(20),
                workers: Some(0),
            });
        assert_eq!(cfg.engine.min_frame_interval_ms, 20);
        assert_eq!(cfg.synthetic.workers, 1);
    }

    #[test]
    fn missing_file_reports_path() {
        let err = BridgeConfig::load(Path::new("/nonexistent/video-bridge.toml")).unwrap_err();
        assert!(format!("{err:#}").contains("video-bridge.toml"));
    }
}
