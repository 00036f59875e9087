//! Persistent application configuration
//!
//! Stores device selection, timing, and latency overrides in a JSON file
//! at `<data_dir>/loopsync/config.json`.

use loopsync_core::audio::device::LatencyOverrides;
use loopsync_core::audio::render::DEFAULT_BLOCK_FRAMES;
use loopsync_core::RunConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

fn default_sample_rate() -> u32 {
    loopsync_core::DEFAULT_SAMPLE_RATE
}

fn default_startup_delay_secs() -> f64 {
    loopsync_core::DEFAULT_STARTUP_DELAY_SECS
}

fn default_capture_secs() -> f64 {
    2.0
}

fn default_render_block_frames() -> usize {
    DEFAULT_BLOCK_FRAMES
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("loopsync-out")
}

/// Persistent application configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    /// Output device name (None = host default output)
    #[serde(default)]
    pub device: Option<String>,
    /// Input device name (None = the output device if it records, else the
    /// host default input)
    #[serde(default)]
    pub input_device: Option<String>,
    /// Sample rate for a generated reference, in Hz
    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,
    /// Delay between device start and reference playback
    #[serde(default = "default_startup_delay_secs")]
    pub startup_delay_secs: f64,
    /// Capture length in seconds
    #[serde(default = "default_capture_secs")]
    pub capture_secs: f64,
    /// Offline render block size in frames
    #[serde(default = "default_render_block_frames")]
    pub render_block_frames: usize,
    /// Fixed hardware buffer size (None = device default)
    #[serde(default)]
    pub buffer_size_frames: Option<u32>,
    /// Reference stimulus (None = generated tone burst)
    #[serde(default)]
    pub reference_path: Option<PathBuf>,
    /// Directory for tap recordings, result, and report
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    /// Latency figures the host API cannot report
    #[serde(default)]
    pub latency: LatencyOverrides,
    /// Skip rendering when the latency figures are inconsistent
    #[serde(default)]
    pub abort_on_inconsistent: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            device: None,
            input_device: None,
            sample_rate: default_sample_rate(),
            startup_delay_secs: default_startup_delay_secs(),
            capture_secs: default_capture_secs(),
            render_block_frames: default_render_block_frames(),
            buffer_size_frames: None,
            reference_path: None,
            output_dir: default_output_dir(),
            latency: LatencyOverrides::default(),
            abort_on_inconsistent: false,
        }
    }
}

impl AppConfig {
    /// Config file path: `<data_dir>/loopsync/config.json`
    pub fn path() -> PathBuf {
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("loopsync")
            .join("config.json")
    }

    /// Load config from the default path, falling back to defaults on any error
    pub fn load() -> Self {
        Self::load_from(&Self::path())
    }

    /// Load config from `path`, falling back to defaults on any error
    pub fn load_from(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(contents) => match serde_json::from_str(&contents) {
                Ok(config) => {
                    tracing::info!(path = %path.display(), "Loaded config from disk");
                    config
                }
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Failed to parse config, using defaults");
                    Self::default()
                }
            },
            Err(_) => {
                tracing::info!(path = %path.display(), "No config file found, using defaults");
                Self::default()
            }
        }
    }

    /// Save config to disk, creating parent directories if needed
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        tracing::info!(path = %path.display(), "Config saved to disk");
        Ok(())
    }

    /// Pipeline parameters for one run
    pub fn run_config(&self) -> RunConfig {
        let mut run = RunConfig::new(&self.output_dir);
        // NaN falls to zero
        run.startup_delay_secs = self.startup_delay_secs.max(0.0);
        let capture_secs = if self.capture_secs.is_finite() {
            self.capture_secs.clamp(0.0, 3600.0)
        } else {
            default_capture_secs()
        };
        run.capture_duration = Duration::from_secs_f64(capture_secs);
        run.render_block_frames = self.render_block_frames.max(1);
        run.abort_on_inconsistent = self.abort_on_inconsistent;
        run
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.device, None);
        assert_eq!(config.input_device, None);
        assert_eq!(config.sample_rate, 48000);
        assert_eq!(config.startup_delay_secs, 0.1);
        assert_eq!(config.render_block_frames, 4096);
        assert_eq!(config.latency, LatencyOverrides::default());
    }

    #[test]
    fn test_round_trip() {
        let config = AppConfig {
            device: Some("MacBook Pro Speakers".to_string()),
            input_device: Some("MacBook Pro Microphone".to_string()),
            sample_rate: 44100,
            buffer_size_frames: Some(256),
            latency: LatencyOverrides {
                output_latency_frames: 32,
                input_latency_frames: 40,
                ..Default::default()
            },
            ..Default::default()
        };
        let json = serde_json::to_string(&config).unwrap();
        let loaded: AppConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_missing_fields_use_defaults() {
        let json = r#"{"device": "TestDevice", "latency": {"output_latency_frames": 12}}"#;
        let config: AppConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.device, Some("TestDevice".to_string()));
        assert_eq!(config.input_device, None);
        assert_eq!(config.sample_rate, 48000);
        assert_eq!(config.latency.output_latency_frames, 12);
        assert_eq!(config.latency.input_latency_frames, 0);
    }

    #[test]
    fn test_empty_json_uses_defaults() {
        let config: AppConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, AppConfig::default());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.json");

        let config = AppConfig {
            device: Some("Loopback".to_string()),
            capture_secs: 0.5,
            ..Default::default()
        };
        config.save(&path).unwrap();

        assert_eq!(AppConfig::load_from(&path), config);
    }

    #[test]
    fn test_corrupt_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert_eq!(AppConfig::load_from(&path), AppConfig::default());
    }

    #[test]
    fn test_run_config_clamps_values() {
        let config = AppConfig {
            startup_delay_secs: -1.0,
            capture_secs: 1.5,
            render_block_frames: 0,
            output_dir: PathBuf::from("runs"),
            ..Default::default()
        };
        let run = config.run_config();
        assert_eq!(run.startup_delay_secs, 0.0);
        assert_eq!(run.capture_duration, Duration::from_millis(1500));
        assert_eq!(run.render_block_frames, 1);
        assert_eq!(run.result_path(), PathBuf::from("runs").join("synchronized.wav"));
    }
}
