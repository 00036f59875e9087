//! Live capture phase: play the reference, tap output and input
//!
//! A [`CaptureSession`] moves through
//!
//! ```text
//! Idle → Capturing → Completed | Failed
//! ```
//!
//! exactly once. The latency profile and the captured buffers are immutable
//! snapshots owned by the terminal state, so nothing can be read from a
//! session while it is still capturing. Stopping early is allowed and
//! completes the session with whatever frames arrived so far.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;

use super::buffer::AudioStreamBuffer;
use super::device::{DuplexGraph, StreamFormat};
use super::profile::DeviceLatencyProfile;
use super::recorder::{FirstCallbackLatch, RecorderHandle, TapRecorder, TapSpec};
use crate::error::{Result, SyncError};

/// Interval at which [`CaptureSession::capture_for`] checks on the capture
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Host-clock marks taken during capture
///
/// Diagnostic only: the sync plan is computed from frame counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TimingMarks {
    /// Host time at which the device was started, before any tap ran
    pub engine_started_at: Option<Duration>,
    /// Host time at which the reference was due to start playing
    pub playback_scheduled_at: Option<Duration>,
    /// Host time of the first input tap callback
    pub input_tap_first_callback_at: Option<Duration>,
    /// Host time of the first output tap callback
    pub output_tap_first_callback_at: Option<Duration>,
}

impl TimingMarks {
    /// Input tap's first callback relative to the output tap's, in seconds
    pub fn tap_skew_secs(&self) -> Option<f64> {
        let input = self.input_tap_first_callback_at?.as_secs_f64();
        let output = self.output_tap_first_callback_at?.as_secs_f64();
        Some(input - output)
    }
}

/// Capture parameters
#[derive(Debug, Clone)]
pub struct CaptureConfig {
    /// Delay between device start and reference playback
    pub startup_delay_secs: f64,
    /// File receiving the output tap
    pub output_tap_path: PathBuf,
    /// File receiving the input tap
    pub input_tap_path: PathBuf,
    /// Seconds of audio each tap ring buffer can hold
    pub ring_secs: f64,
}

impl CaptureConfig {
    /// Default delay and ring size, tap files inside `dir`
    pub fn in_dir(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        Self {
            startup_delay_secs: crate::DEFAULT_STARTUP_DELAY_SECS,
            output_tap_path: dir.join(crate::OUTPUT_TAP_FILE),
            input_tap_path: dir.join(crate::INPUT_TAP_FILE),
            ring_secs: 2.0,
        }
    }

    /// Startup delay in device frames at `sample_rate`
    pub fn startup_delay_frames(&self, sample_rate: u32) -> u64 {
        (sample_rate as f64 * self.startup_delay_secs.max(0.0)).round() as u64
    }
}

/// Everything a completed capture produced
#[derive(Debug, Clone)]
pub struct CaptureOutcome {
    /// The stimulus that was played
    pub reference: Arc<AudioStreamBuffer>,
    /// What was sent to the output device
    pub output_tap: AudioStreamBuffer,
    /// What the input device heard
    pub input_tap: AudioStreamBuffer,
    /// Timing marks, diagnostic only
    pub timing: TimingMarks,
    /// Profile the session was started with
    pub profile: DeviceLatencyProfile,
    /// Negotiated device format
    pub format: StreamFormat,
    /// Startup delay used when scheduling the reference
    pub startup_delay_secs: f64,
}

/// Capture session state
#[derive(Debug, Clone)]
pub enum CaptureState {
    Idle,
    Capturing,
    Completed(Arc<CaptureOutcome>),
    Failed(SyncError),
}

impl CaptureState {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Capturing => "capturing",
            Self::Completed(_) => "completed",
            Self::Failed(_) => "failed",
        }
    }
}

/// Resources held only while capturing
struct ActiveCapture {
    recorder: RecorderHandle,
    reference: Arc<AudioStreamBuffer>,
    profile: DeviceLatencyProfile,
    format: StreamFormat,
    engine_started_at: Duration,
    playback_scheduled_at: Duration,
    output_first_callback: Arc<FirstCallbackLatch>,
    input_first_callback: Arc<FirstCallbackLatch>,
}

/// One capture of the loop
pub struct CaptureSession {
    config: CaptureConfig,
    state: CaptureState,
    active: Option<ActiveCapture>,
}

impl CaptureSession {
    pub fn new(config: CaptureConfig) -> Self {
        Self {
            config,
            state: CaptureState::Idle,
            active: None,
        }
    }

    pub fn state(&self) -> &CaptureState {
        &self.state
    }

    pub fn config(&self) -> &CaptureConfig {
        &self.config
    }

    /// Open the device, install taps, schedule the reference, and start
    ///
    /// Only valid on an idle session. Any failure moves the session to
    /// `Failed` and is returned.
    pub fn begin<G: DuplexGraph>(
        &mut self,
        graph: &mut G,
        reference: Arc<AudioStreamBuffer>,
        profile: DeviceLatencyProfile,
    ) -> Result<()> {
        if !matches!(self.state, CaptureState::Idle) {
            return Err(SyncError::InvalidState {
                expected: "idle",
                actual: self.state.name(),
            });
        }

        match self.start_capture(graph, reference, profile) {
            Ok(active) => {
                self.active = Some(active);
                self.state = CaptureState::Capturing;
                Ok(())
            }
            Err(e) => {
                graph.stop();
                Err(self.fail(e))
            }
        }
    }

    fn start_capture<G: DuplexGraph>(
        &self,
        graph: &mut G,
        reference: Arc<AudioStreamBuffer>,
        profile: DeviceLatencyProfile,
    ) -> Result<ActiveCapture> {
        let sample_rate = reference.sample_rate();
        let format = graph.open(sample_rate)?;
        if format.sample_rate != sample_rate {
            return Err(SyncError::FormatMismatch(format!(
                "device opened at {} Hz, reference is {} Hz",
                format.sample_rate, sample_rate
            )));
        }

        let setup = TapRecorder::create(
            sample_rate,
            TapSpec {
                path: &self.config.output_tap_path,
                channels: format.output_channels,
            },
            TapSpec {
                path: &self.config.input_tap_path,
                channels: format.input_channels,
            },
            self.config.ring_secs,
        )?;

        let delay_frames = self.config.startup_delay_frames(sample_rate);
        graph.install_taps(
            setup.output_tap.into_callback(),
            setup.input_tap.into_callback(),
        )?;
        graph.schedule_buffer(Arc::clone(&reference), delay_frames)?;

        let recorder = setup.recorder.start()?;
        let started_at = graph.start()?;
        let playback_scheduled_at =
            started_at + Duration::from_secs_f64(self.config.startup_delay_secs.max(0.0));

        tracing::info!(
            sample_rate,
            delay_frames,
            reference_frames = reference.frame_len(),
            output_tap = %self.config.output_tap_path.display(),
            input_tap = %self.config.input_tap_path.display(),
            "Capture started"
        );

        Ok(ActiveCapture {
            recorder,
            reference,
            profile,
            format,
            engine_started_at: started_at,
            playback_scheduled_at,
            output_first_callback: setup.output_first_callback,
            input_first_callback: setup.input_first_callback,
        })
    }

    /// Check the device and recorder for faults while capturing
    pub fn poll<G: DuplexGraph>(&mut self, graph: &G) -> Result<()> {
        let Some(active) = self.active.as_mut() else {
            return Err(SyncError::InvalidState {
                expected: "capturing",
                actual: self.state.name(),
            });
        };

        if let Err(e) = graph.check_health() {
            return Err(self.fail(e));
        }

        if active.recorder.has_exited() {
            // The recorder only exits on its own when it failed
            let err = match active.recorder.stop() {
                Err(e) => e,
                Ok(_) => SyncError::Io("tap recorder exited early".into()),
            };
            return Err(self.fail(err));
        }

        Ok(())
    }

    /// Frames recorded so far as (output, input)
    pub fn frames_recorded(&self) -> (u64, u64) {
        self.active
            .as_ref()
            .map(|a| a.recorder.frames_recorded())
            .unwrap_or((0, 0))
    }

    /// Stop the device and complete the session
    ///
    /// Valid while capturing; the captured frames so far become the result.
    pub fn finish<G: DuplexGraph>(&mut self, graph: &mut G) -> Result<Arc<CaptureOutcome>> {
        let Some(mut active) = self.active.take() else {
            return Err(SyncError::InvalidState {
                expected: "capturing",
                actual: self.state.name(),
            });
        };

        graph.stop();
        let health = graph.check_health();

        let (output_tap, input_tap) = match health.and_then(|_| active.recorder.stop()) {
            Ok(buffers) => buffers,
            Err(e) => return Err(self.fail(e)),
        };

        let timing = TimingMarks {
            engine_started_at: Some(active.engine_started_at),
            playback_scheduled_at: Some(active.playback_scheduled_at),
            input_tap_first_callback_at: active.input_first_callback.get(),
            output_tap_first_callback_at: active.output_first_callback.get(),
        };

        let outcome = Arc::new(CaptureOutcome {
            reference: active.reference,
            output_tap,
            input_tap,
            timing,
            profile: with_delivered_buffers(active.profile, graph.delivered_buffer_frames()),
            format: active.format,
            startup_delay_secs: self.config.startup_delay_secs,
        });

        tracing::info!(
            output_frames = outcome.output_tap.frame_len(),
            input_frames = outcome.input_tap.frame_len(),
            tap_skew_secs = ?timing.tap_skew_secs(),
            "Capture completed"
        );

        self.state = CaptureState::Completed(Arc::clone(&outcome));
        Ok(outcome)
    }

    /// Run a whole capture: begin, wait, finish
    ///
    /// Waits until `duration` has passed, the device finishes on its own, or
    /// `cancel` is set, whichever comes first.
    pub fn capture_for<G: DuplexGraph>(
        &mut self,
        graph: &mut G,
        reference: Arc<AudioStreamBuffer>,
        profile: DeviceLatencyProfile,
        duration: Duration,
        cancel: &AtomicBool,
    ) -> Result<Arc<CaptureOutcome>> {
        self.begin(graph, reference, profile)?;

        let started = Instant::now();
        let mut last_report = Instant::now();
        loop {
            if let Err(e) = self.poll(graph) {
                graph.stop();
                return Err(e);
            }
            if graph.is_finished() || started.elapsed() >= duration {
                break;
            }
            if cancel.load(Ordering::Relaxed) {
                tracing::info!("Capture cancelled, keeping frames captured so far");
                break;
            }
            if last_report.elapsed() >= Duration::from_secs(1) {
                let (out, inp) = self.frames_recorded();
                tracing::debug!(output_frames = out, input_frames = inp, "Capturing");
                last_report = Instant::now();
            }
            std::thread::sleep(POLL_INTERVAL);
        }

        self.finish(graph)
    }

    /// The completed capture, or a usage error if not completed
    pub fn outcome(&self) -> Result<Arc<CaptureOutcome>> {
        match &self.state {
            CaptureState::Completed(outcome) => Ok(Arc::clone(outcome)),
            other => Err(SyncError::InvalidState {
                expected: "completed",
                actual: other.name(),
            }),
        }
    }

    fn fail(&mut self, err: SyncError) -> SyncError {
        tracing::error!(error = %err, "Capture session failed");
        self.active = None;
        self.state = CaptureState::Failed(err.clone());
        err
    }
}

/// Replace the profile's buffer sizes with the block sizes the device
/// actually delivered
///
/// Backends without a fixed buffer request often deliver larger blocks than
/// they report up front, and the output tap is primed with one delivered
/// block.
fn with_delivered_buffers(
    profile: DeviceLatencyProfile,
    delivered: Option<(u32, u32)>,
) -> DeviceLatencyProfile {
    let Some((output, input)) = delivered else {
        return profile;
    };
    if (output, input) != (profile.output_buffer_size_frames, profile.input_buffer_size_frames) {
        tracing::info!(
            reported_output = profile.output_buffer_size_frames,
            reported_input = profile.input_buffer_size_frames,
            delivered_output = output,
            delivered_input = input,
            "Using delivered buffer sizes"
        );
    }
    DeviceLatencyProfile {
        output_buffer_size_frames: output,
        input_buffer_size_frames: input,
        ..profile
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::loopback::SimulatedLoopback;
    use crate::audio::profile::LatencyProfileSource;
    use crate::audio::wavio::read_audio_file;

    fn reference() -> Arc<AudioStreamBuffer> {
        let mut samples = vec![0.0f32; 10];
        samples[0] = 0.9;
        Arc::new(AudioStreamBuffer::mono(48000, &samples))
    }

    fn config(dir: &std::path::Path) -> CaptureConfig {
        CaptureConfig {
            startup_delay_secs: 0.001, // 48 frames
            ..CaptureConfig::in_dir(dir)
        }
    }

    #[test]
    fn test_full_capture_through_loopback() {
        let dir = tempfile::tempdir().unwrap();
        let mut graph = SimulatedLoopback::new(64)
            .with_loop_delay(30)
            .with_total_frames(1024);
        let profile = graph.query_latency_profile().unwrap();
        let mut session = CaptureSession::new(config(dir.path()));
        let cancel = AtomicBool::new(false);

        let outcome = session
            .capture_for(&mut graph, reference(), profile, Duration::from_secs(10), &cancel)
            .unwrap();

        assert_eq!(session.state().name(), "completed");
        assert_eq!(outcome.output_tap.frame_len(), 1024);
        assert_eq!(outcome.input_tap.frame_len(), 1024);
        // priming buffer + startup delay
        let out_onset = outcome.output_tap.samples().iter().position(|&s| s != 0.0);
        let in_onset = outcome.input_tap.samples().iter().position(|&s| s != 0.0);
        assert_eq!(out_onset, Some(64 + 48));
        assert_eq!(in_onset, Some(64 + 48 + 30));

        let timing = outcome.timing;
        let started = timing.engine_started_at.unwrap();
        assert!(timing.output_tap_first_callback_at.unwrap() >= started);
        assert!(timing.input_tap_first_callback_at.unwrap() >= started);
        assert_eq!(
            timing.playback_scheduled_at,
            Some(started + Duration::from_secs_f64(0.001))
        );

        let on_disk = read_audio_file(&dir.path().join(crate::INPUT_TAP_FILE)).unwrap();
        assert_eq!(on_disk, outcome.input_tap);
    }

    #[test]
    fn test_outcome_requires_completed() {
        let dir = tempfile::tempdir().unwrap();
        let session = CaptureSession::new(config(dir.path()));
        assert_eq!(
            session.outcome().unwrap_err(),
            SyncError::InvalidState {
                expected: "completed",
                actual: "idle"
            }
        );
    }

    #[test]
    fn test_outcome_unavailable_while_capturing() {
        let dir = tempfile::tempdir().unwrap();
        let mut graph = SimulatedLoopback::new(64)
            .with_total_frames(u64::MAX)
            .with_pace(Duration::from_millis(1));
        let mut session = CaptureSession::new(config(dir.path()));

        session
            .begin(&mut graph, reference(), DeviceLatencyProfile::default())
            .unwrap();
        assert!(matches!(
            session.outcome(),
            Err(SyncError::InvalidState { actual: "capturing", .. })
        ));

        // Early stop completes with the frames captured so far
        let outcome = session.finish(&mut graph).unwrap();
        assert_eq!(outcome.output_tap.frame_len() % 64, 0);
        assert!(session.outcome().is_ok());
    }

    #[test]
    fn test_begin_twice_is_usage_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut graph = SimulatedLoopback::new(64).with_total_frames(128);
        let mut session = CaptureSession::new(config(dir.path()));
        let cancel = AtomicBool::new(false);

        session
            .capture_for(
                &mut graph,
                reference(),
                DeviceLatencyProfile::default(),
                Duration::from_secs(10),
                &cancel,
            )
            .unwrap();

        let err = session
            .begin(&mut graph, reference(), DeviceLatencyProfile::default())
            .unwrap_err();
        assert!(matches!(err, SyncError::InvalidState { expected: "idle", .. }));
    }

    #[test]
    fn test_unwritable_tap_file_fails_session() {
        let dir = tempfile::tempdir().unwrap();
        let blocked = dir.path().join(crate::OUTPUT_TAP_FILE);
        std::fs::create_dir(&blocked).unwrap();
        std::fs::write(blocked.join("keep"), b"x").unwrap();

        let mut graph = SimulatedLoopback::new(64).with_total_frames(128);
        let mut session = CaptureSession::new(config(dir.path()));

        let err = session
            .begin(&mut graph, reference(), DeviceLatencyProfile::default())
            .unwrap_err();

        assert!(matches!(err, SyncError::CaptureWriteFailure { .. }));
        assert!(err.to_string().contains(crate::OUTPUT_TAP_FILE));
        assert!(matches!(session.state(), CaptureState::Failed(_)));
    }

    #[test]
    fn test_overrun_fails_session() {
        let dir = tempfile::tempdir().unwrap();
        let mut graph = SimulatedLoopback::new(8192).with_total_frames(48000);
        let mut session = CaptureSession::new(CaptureConfig {
            ring_secs: 0.0, // clamped to 0.1s = 4800 frames, smaller than one block
            ..config(dir.path())
        });
        let cancel = AtomicBool::new(false);

        let err = session
            .capture_for(
                &mut graph,
                reference(),
                DeviceLatencyProfile::default(),
                Duration::from_secs(10),
                &cancel,
            )
            .unwrap_err();

        assert!(matches!(err, SyncError::CaptureWriteFailure { .. }));
        assert!(err.is_fatal_to_session());
        assert!(matches!(session.state(), CaptureState::Failed(_)));
    }

    #[test]
    fn test_cancel_completes_session() {
        let dir = tempfile::tempdir().unwrap();
        let mut graph = SimulatedLoopback::new(64)
            .with_total_frames(u64::MAX)
            .with_pace(Duration::from_millis(1));
        let mut session = CaptureSession::new(config(dir.path()));
        let cancel = AtomicBool::new(true);

        let outcome = session
            .capture_for(
                &mut graph,
                reference(),
                DeviceLatencyProfile::default(),
                Duration::from_secs(10),
                &cancel,
            )
            .unwrap();

        assert_eq!(session.state().name(), "completed");
        assert_eq!(outcome.input_tap.frame_len(), outcome.output_tap.frame_len());
    }

    #[test]
    fn test_tap_skew() {
        let marks = TimingMarks {
            engine_started_at: None,
            playback_scheduled_at: None,
            input_tap_first_callback_at: Some(Duration::from_millis(12)),
            output_tap_first_callback_at: Some(Duration::from_millis(10)),
        };
        assert!((marks.tap_skew_secs().unwrap() - 0.002).abs() < 1e-9);
        assert_eq!(TimingMarks::default().tap_skew_secs(), None);
    }

    #[test]
    fn test_profile_takes_delivered_buffer_sizes() {
        let dir = tempfile::tempdir().unwrap();
        // Device reports a 32-frame minimum but delivers 256-frame blocks
        let reported = DeviceLatencyProfile {
            output_latency_frames: 20,
            ..DeviceLatencyProfile::with_buffer_sizes(32, 32)
        };
        let mut graph = SimulatedLoopback::new(256)
            .with_total_frames(1024)
            .with_reported_profile(reported);
        let mut session = CaptureSession::new(config(dir.path()));
        let cancel = AtomicBool::new(false);

        let outcome = session
            .capture_for(&mut graph, reference(), reported, Duration::from_secs(10), &cancel)
            .unwrap();

        assert_eq!(outcome.profile.output_buffer_size_frames, 256);
        assert_eq!(outcome.profile.input_buffer_size_frames, 256);
        assert_eq!(outcome.profile.output_latency_frames, 20);
        // Output tap content starts one delivered block in
        let out_onset = outcome.output_tap.samples().iter().position(|&s| s != 0.0);
        assert_eq!(out_onset, Some(256 + 48));
    }

    #[test]
    fn test_delivered_sizes_absent_keeps_profile() {
        let profile = DeviceLatencyProfile::with_buffer_sizes(128, 64);
        assert_eq!(with_delivered_buffers(profile, None), profile);
        assert_eq!(
            with_delivered_buffers(profile, Some((512, 480))),
            DeviceLatencyProfile::with_buffer_sizes(512, 480)
        );
    }

    #[test]
    fn test_stereo_output_tap() {
        let dir = tempfile::tempdir().unwrap();
        let mut graph = SimulatedLoopback::new(64)
            .with_channels(2, 1)
            .with_loop_delay(10)
            .with_total_frames(512);
        let profile = graph.query_latency_profile().unwrap();
        let mut session = CaptureSession::new(config(dir.path()));
        let cancel = AtomicBool::new(false);

        let outcome = session
            .capture_for(&mut graph, reference(), profile, Duration::from_secs(10), &cancel)
            .unwrap();

        assert_eq!(outcome.format.output_channels, 2);
        assert_eq!(outcome.output_tap.channels(), 2);
        assert_eq!(outcome.input_tap.channels(), 1);
        assert_eq!(outcome.output_tap.frame_len(), 512);
        assert_eq!(outcome.input_tap.frame_len(), 512);
        assert_eq!(outcome.output_tap.frame(64 + 48), Some(&[0.9f32, 0.9][..]));
        assert_eq!(outcome.input_tap.mono_sample(64 + 48 + 10), 0.9);

        let on_disk = read_audio_file(&dir.path().join(crate::OUTPUT_TAP_FILE)).unwrap();
        assert_eq!(on_disk, outcome.output_tap);
    }
}
