//! End-to-end latency run: capture → sync plan → synchronized render
//!
//! Writes three audio files into the output directory on every run, each
//! replacing the previous one:
//! - `output_tap.wav`: what was sent to the output device
//! - `input_tap.wav`: what the input device heard
//! - `synchronized.wav`: stereo result, reference and output tap on the left,
//!   input tap on the right, each at its planned offset
//!
//! plus a `report.json` summarising the run.

use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::audio::buffer::AudioStreamBuffer;
use crate::audio::capture::{CaptureConfig, CaptureOutcome, CaptureSession, TimingMarks};
use crate::audio::device::DuplexGraph;
use crate::audio::profile::{DeviceLatencyProfile, LatencyProfileSource};
use crate::audio::render::{OfflineMixRenderer, RenderResult, DEFAULT_BLOCK_FRAMES};
use crate::audio::sync::{compute_sync_plan, SyncPlan};
use crate::audio::wavio::read_audio_file;
use crate::error::{Result, SyncError};

/// Parameters for one latency run
#[derive(Debug, Clone)]
pub struct RunConfig {
    /// Directory receiving tap files, result, and report
    pub output_dir: PathBuf,
    /// Delay between device start and reference playback
    pub startup_delay_secs: f64,
    /// Maximum capture length
    pub capture_duration: Duration,
    /// Offline render block size in frames
    pub render_block_frames: usize,
    /// Seconds of audio each tap ring buffer can hold
    pub ring_secs: f64,
    /// Stop before rendering when the profile yields a negative input start
    pub abort_on_inconsistent: bool,
}

impl RunConfig {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
            startup_delay_secs: crate::DEFAULT_STARTUP_DELAY_SECS,
            capture_duration: Duration::from_secs(2),
            render_block_frames: DEFAULT_BLOCK_FRAMES,
            ring_secs: 2.0,
            abort_on_inconsistent: false,
        }
    }

    pub fn output_tap_path(&self) -> PathBuf {
        self.output_dir.join(crate::OUTPUT_TAP_FILE)
    }

    pub fn input_tap_path(&self) -> PathBuf {
        self.output_dir.join(crate::INPUT_TAP_FILE)
    }

    pub fn result_path(&self) -> PathBuf {
        self.output_dir.join(crate::RESULT_FILE)
    }

    pub fn report_path(&self) -> PathBuf {
        self.output_dir.join(crate::REPORT_FILE)
    }

    fn capture_config(&self) -> CaptureConfig {
        CaptureConfig {
            startup_delay_secs: self.startup_delay_secs,
            output_tap_path: self.output_tap_path(),
            input_tap_path: self.input_tap_path(),
            ring_secs: self.ring_secs,
        }
    }
}

/// Summary of a successful run
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub finished_at: DateTime<Utc>,
    pub result_path: PathBuf,
    pub output_tap_path: PathBuf,
    pub input_tap_path: PathBuf,
    pub sample_rate: u32,
    pub plan: SyncPlan,
    pub profile: DeviceLatencyProfile,
    pub timing: TimingMarks,
    /// Round trip implied by the profile, in milliseconds
    pub round_trip_ms: f64,
    /// Set when the profile produced a negative input start
    pub latency_warning: Option<String>,
    pub render: RenderResult,
}

impl RunReport {
    /// Write the report as pretty JSON
    pub fn write_json(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| SyncError::Io(format!("report serialization: {}", e)))?;
        std::fs::write(path, json).map_err(|e| SyncError::Io(format!("{}: {}", path.display(), e)))?;
        tracing::info!(path = %path.display(), "Run report written");
        Ok(())
    }
}

/// Load the reference stimulus, which every run depends on
pub fn load_reference(path: &Path) -> Result<Arc<AudioStreamBuffer>> {
    let missing = |reason: String| SyncError::MissingReferenceAsset {
        path: path.display().to_string(),
        reason,
    };

    let buffer = read_audio_file(path).map_err(|e| missing(e.to_string()))?;
    if buffer.is_empty() {
        return Err(missing("file contains no audio".to_string()));
    }

    tracing::info!(
        path = %path.display(),
        sample_rate = buffer.sample_rate(),
        channels = buffer.channels(),
        frames = buffer.frame_len(),
        "Reference loaded"
    );
    Ok(Arc::new(buffer))
}

/// Compute the sync plan for a completed capture session
///
/// Fails with a usage error when the session has not completed.
pub fn plan_for_session(session: &CaptureSession) -> Result<(Arc<CaptureOutcome>, SyncPlan)> {
    let outcome = session.outcome()?;
    let plan = plan_for_outcome(&outcome);
    Ok((outcome, plan))
}

/// Compute the sync plan for a capture outcome
pub fn plan_for_outcome(outcome: &CaptureOutcome) -> SyncPlan {
    compute_sync_plan(
        &outcome.profile,
        outcome.format.sample_rate,
        outcome.startup_delay_secs,
    )
}

/// Drives one capture → compute → render run
pub struct LatencyRun {
    config: RunConfig,
}

impl LatencyRun {
    pub fn new(config: RunConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    /// Run the whole pipeline on `graph`
    ///
    /// The latency profile is queried once, before capture starts. Setting
    /// `cancel` ends capture early; the run then continues with whatever
    /// was captured.
    pub fn run<G>(
        &self,
        graph: &mut G,
        reference: Arc<AudioStreamBuffer>,
        cancel: &AtomicBool,
    ) -> Result<RunReport>
    where
        G: DuplexGraph + LatencyProfileSource,
    {
        let profile = graph.query_latency_profile()?;
        tracing::info!(
            output_buffer = profile.output_buffer_size_frames,
            input_buffer = profile.input_buffer_size_frames,
            round_trip_frames = profile.round_trip_latency_frames(),
            "Latency profile queried"
        );

        let mut session = CaptureSession::new(self.config.capture_config());
        session.capture_for(
            graph,
            reference,
            profile,
            self.config.capture_duration,
            cancel,
        )?;

        let (outcome, plan) = plan_for_session(&session)?;
        self.finish_run(&outcome, &plan)
    }

    /// Check the plan, render, and write the report
    ///
    /// Safe to call again with the same outcome and plan after a render
    /// failure.
    pub fn finish_run(&self, outcome: &CaptureOutcome, plan: &SyncPlan) -> Result<RunReport> {
        let latency_warning = match plan.check_consistency() {
            Ok(()) => None,
            Err(e) if self.config.abort_on_inconsistent => {
                tracing::error!(error = %e, "Aborting before render");
                return Err(e);
            }
            Err(e) => {
                tracing::warn!(error = %e, "Rendering anyway so the offset is visible");
                Some(e.to_string())
            }
        };

        let render = self.render(outcome, plan)?;

        let report = RunReport {
            finished_at: Utc::now(),
            result_path: render.path.clone(),
            output_tap_path: self.config.output_tap_path(),
            input_tap_path: self.config.input_tap_path(),
            sample_rate: outcome.format.sample_rate,
            plan: *plan,
            profile: outcome.profile,
            timing: outcome.timing,
            round_trip_ms: plan.round_trip_ms(outcome.format.sample_rate),
            latency_warning,
            render,
        };
        report.write_json(&self.config.report_path())?;

        tracing::info!(result = %report.result_path.display(), "Latency run finished");
        Ok(report)
    }

    /// Render the synchronized result for a completed capture
    pub fn render(&self, outcome: &CaptureOutcome, plan: &SyncPlan) -> Result<RenderResult> {
        OfflineMixRenderer::with_block_size(self.config.render_block_frames).render(
            &outcome.reference,
            &outcome.output_tap,
            &outcome.input_tap,
            plan,
            &self.config.result_path(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::loopback::SimulatedLoopback;
    use crate::audio::wavio::write_audio_file;

    #[test]
    fn test_missing_reference_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_reference(&dir.path().join("reference.wav")).unwrap_err();
        assert!(matches!(err, SyncError::MissingReferenceAsset { .. }));
        assert!(err.to_string().contains("reference.wav"));
    }

    #[test]
    fn test_empty_reference_is_missing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.wav");
        write_audio_file(&path, &AudioStreamBuffer::new(48000, 1)).unwrap();
        assert!(matches!(
            load_reference(&path),
            Err(SyncError::MissingReferenceAsset { .. })
        ));
    }

    #[test]
    fn test_plan_requires_completed_session() {
        let dir = tempfile::tempdir().unwrap();
        let session = CaptureSession::new(CaptureConfig::in_dir(dir.path()));
        assert!(matches!(
            plan_for_session(&session),
            Err(SyncError::InvalidState { .. })
        ));
    }

    #[test]
    fn test_run_writes_all_outputs() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = RunConfig::new(dir.path());
        config.startup_delay_secs = 0.001;
        config.render_block_frames = 256;

        let mut graph = SimulatedLoopback::new(128)
            .with_loop_delay(40)
            .with_total_frames(2048);
        let reference = Arc::new(AudioStreamBuffer::mono(48000, &[0.5; 16]));
        let cancel = AtomicBool::new(false);

        let report = LatencyRun::new(config.clone())
            .run(&mut graph, reference, &cancel)
            .unwrap();

        assert!(config.output_tap_path().exists());
        assert!(config.input_tap_path().exists());
        assert!(config.result_path().exists());
        assert!(config.report_path().exists());
        assert_eq!(report.result_path, config.result_path());
        assert_eq!(report.plan.output_start_frame, 128);
        assert_eq!(report.plan.input_start_frame, 88);
        assert!(report.latency_warning.is_none());
        assert_eq!(report.render.frames_rendered, 2048);
    }

    #[test]
    fn test_inconsistent_profile_can_abort() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = RunConfig::new(dir.path());
        config.abort_on_inconsistent = true;
        config.startup_delay_secs = 0.0;

        let mut graph = SimulatedLoopback::new(64)
            .with_loop_delay(100)
            .with_total_frames(256);
        let reference = Arc::new(AudioStreamBuffer::mono(48000, &[0.5; 4]));
        let cancel = AtomicBool::new(false);

        let err = LatencyRun::new(config.clone())
            .run(&mut graph, reference, &cancel)
            .unwrap_err();

        assert_eq!(
            err,
            SyncError::InconsistentLatencyProfile {
                input_start_frame: -36
            }
        );
        assert!(!config.result_path().exists());
    }

    #[test]
    fn test_inconsistent_profile_renders_by_default() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = RunConfig::new(dir.path());
        config.startup_delay_secs = 0.0;

        let mut graph = SimulatedLoopback::new(64)
            .with_loop_delay(100)
            .with_total_frames(256);
        let reference = Arc::new(AudioStreamBuffer::mono(48000, &[0.5; 4]));
        let cancel = AtomicBool::new(false);

        let report = LatencyRun::new(config)
            .run(&mut graph, reference, &cancel)
            .unwrap();

        assert_eq!(report.plan.input_start_frame, -36);
        assert!(report.latency_warning.is_some());
    }
}
