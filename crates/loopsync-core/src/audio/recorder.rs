//! Tap recording: real-time producers and the non-real-time writer thread
//!
//! Tap callbacks only copy the delivered block into a lock-free ring buffer
//! and latch their first host timestamp. A dedicated `tap-recorder` thread
//! drains both rings every 10ms, appends to the growing capture buffers, and
//! streams each tap to its WAV file.
//!
//! A full ring drops the whole block and raises a fault through a bounded
//! crossbeam channel, so frames never go missing silently. Any fault or
//! write error ends the recording with [`SyncError::CaptureWriteFailure`]
//! naming the affected file.

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};
use ringbuf::traits::{Consumer, Observer, Producer, Split};
use ringbuf::{HeapCons, HeapProd, HeapRb};

use super::buffer::AudioStreamBuffer;
use super::device::TapCallback;
use super::sync::StreamRole;
use super::wavio::{delete_if_exists, WavFileWriter};
use crate::error::{Result, SyncError};

/// Interval between ring buffer drains
const DRAIN_INTERVAL: Duration = Duration::from_millis(10);

/// Capacity of the fault channel
const FAULT_CHANNEL_SIZE: usize = 8;

/// Problem detected on the audio thread
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TapFault {
    /// Ring buffer was full; a block of `dropped` samples was discarded
    Overrun { role: StreamRole, dropped: usize },
}

/// Host time latched by the first callback of a tap
///
/// Written once by the audio thread, read after capture.
#[derive(Debug)]
pub struct FirstCallbackLatch(AtomicU64);

impl FirstCallbackLatch {
    const UNSET: u64 = u64::MAX;

    pub fn new() -> Self {
        Self(AtomicU64::new(Self::UNSET))
    }

    /// Store `at` unless a time is already latched. Returns whether it stored.
    pub fn latch(&self, at: Duration) -> bool {
        let nanos = (at.as_nanos() as u64).min(Self::UNSET - 1);
        self.0
            .compare_exchange(Self::UNSET, nanos, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn get(&self) -> Option<Duration> {
        match self.0.load(Ordering::Acquire) {
            Self::UNSET => None,
            nanos => Some(Duration::from_nanos(nanos)),
        }
    }
}

impl Default for FirstCallbackLatch {
    fn default() -> Self {
        Self::new()
    }
}

/// Audio-thread half of a tap
pub struct TapWriter {
    role: StreamRole,
    channels: usize,
    producer: HeapProd<f32>,
    faults: Sender<TapFault>,
    first_callback: Arc<FirstCallbackLatch>,
    overrun_reported: bool,
}

impl TapWriter {
    /// Handle one delivered block
    pub fn on_block(&mut self, data: &[f32], host_time: Duration) {
        self.first_callback.latch(host_time);

        // Whole frames only, so the file and the buffer see the same samples
        let data = &data[..data.len() - data.len() % self.channels];

        // Whole blocks only, so interleaving never drifts
        if self.producer.vacant_len() < data.len() {
            if !self.overrun_reported {
                self.overrun_reported = true;
                let _ = self.faults.try_send(TapFault::Overrun {
                    role: self.role,
                    dropped: data.len(),
                });
            }
            return;
        }
        self.producer.push_slice(data);
    }

    /// Box this writer as a device tap callback
    pub fn into_callback(mut self) -> TapCallback {
        Box::new(move |data: &[f32], host_time: Duration| self.on_block(data, host_time))
    }
}

/// Non-real-time half of a tap
struct TapSink {
    role: StreamRole,
    consumer: HeapCons<f32>,
    writer: WavFileWriter,
    buffer: AudioStreamBuffer,
    scratch: Vec<f32>,
    frames: Arc<AtomicU64>,
}

impl TapSink {
    /// Move everything queued so far into the buffer and the file
    fn drain(&mut self) -> Result<()> {
        loop {
            let read = self.consumer.pop_slice(&mut self.scratch);
            if read == 0 {
                return Ok(());
            }
            let block = &self.scratch[..read];
            self.writer.write(block).map_err(|e| self.failure(e.to_string()))?;
            self.buffer.append_interleaved(block);
            self.frames
                .store(self.buffer.frame_len() as u64, Ordering::Relaxed);
        }
    }

    fn failure(&self, reason: String) -> SyncError {
        SyncError::CaptureWriteFailure {
            path: self.writer.path().display().to_string(),
            reason,
        }
    }

    fn finish(self) -> Result<AudioStreamBuffer> {
        let path = self.writer.path().display().to_string();
        let frames = self
            .writer
            .finalize()
            .map_err(|e| SyncError::CaptureWriteFailure {
                path: path.clone(),
                reason: e.to_string(),
            })?;
        tracing::info!(tap = self.role.as_str(), path = %path, frames, "Tap file finalized");
        Ok(self.buffer)
    }
}

/// Builds the ring buffers, writers, and tap files for one capture
pub struct TapRecorder {
    output: TapSink,
    input: TapSink,
    faults: Receiver<TapFault>,
}

/// Everything [`TapRecorder::create`] hands back
pub struct TapSetup {
    pub recorder: TapRecorder,
    pub output_tap: TapWriter,
    pub input_tap: TapWriter,
    pub output_first_callback: Arc<FirstCallbackLatch>,
    pub input_first_callback: Arc<FirstCallbackLatch>,
}

/// Per-tap parameters for [`TapRecorder::create`]
pub struct TapSpec<'a> {
    pub path: &'a Path,
    pub channels: u16,
}

impl TapRecorder {
    /// Replace both tap files and wire up the ring buffers
    ///
    /// Each ring holds `ring_secs` of audio at `sample_rate`.
    pub fn create(
        sample_rate: u32,
        output: TapSpec<'_>,
        input: TapSpec<'_>,
        ring_secs: f64,
    ) -> Result<TapSetup> {
        let (fault_tx, fault_rx) = crossbeam_channel::bounded::<TapFault>(FAULT_CHANNEL_SIZE);

        let (output_sink, output_tap, output_latch) =
            Self::tap(StreamRole::OutputTap, sample_rate, &output, ring_secs, fault_tx.clone())?;
        let (input_sink, input_tap, input_latch) =
            Self::tap(StreamRole::InputTap, sample_rate, &input, ring_secs, fault_tx)?;

        Ok(TapSetup {
            recorder: TapRecorder {
                output: output_sink,
                input: input_sink,
                faults: fault_rx,
            },
            output_tap,
            input_tap,
            output_first_callback: output_latch,
            input_first_callback: input_latch,
        })
    }

    fn tap(
        role: StreamRole,
        sample_rate: u32,
        spec: &TapSpec<'_>,
        ring_secs: f64,
        faults: Sender<TapFault>,
    ) -> Result<(TapSink, TapWriter, Arc<FirstCallbackLatch>)> {
        let channels = spec.channels.max(1) as usize;
        let write_failure = |reason: String| SyncError::CaptureWriteFailure {
            path: spec.path.display().to_string(),
            reason,
        };

        delete_if_exists(spec.path).map_err(|e| write_failure(e.to_string()))?;
        let writer = WavFileWriter::create(spec.path, sample_rate, spec.channels.max(1))
            .map_err(|e| write_failure(e.to_string()))?;

        let ring_frames = ((sample_rate as f64 * ring_secs.max(0.1)) as usize).max(1);
        let ring = HeapRb::<f32>::new(ring_frames * channels);
        let (producer, consumer) = ring.split();

        let latch = Arc::new(FirstCallbackLatch::new());
        let sink = TapSink {
            role,
            consumer,
            writer,
            buffer: AudioStreamBuffer::new(sample_rate, spec.channels.max(1)),
            scratch: vec![0.0; 4096 * channels],
            frames: Arc::new(AtomicU64::new(0)),
        };
        let tap = TapWriter {
            role,
            channels,
            producer,
            faults,
            first_callback: Arc::clone(&latch),
            overrun_reported: false,
        };

        tracing::debug!(
            tap = role.as_str(),
            path = %spec.path.display(),
            channels,
            ring_frames,
            "Tap prepared"
        );

        Ok((sink, tap, latch))
    }

    /// Spawn the recorder thread
    pub fn start(self) -> Result<RecorderHandle> {
        let stop_flag = Arc::new(AtomicBool::new(false));
        let flag_clone = Arc::clone(&stop_flag);
        let output_frames = Arc::clone(&self.output.frames);
        let input_frames = Arc::clone(&self.input.frames);

        let thread = std::thread::Builder::new()
            .name("tap-recorder".into())
            .spawn(move || self.recording_loop(&flag_clone))
            .map_err(|e| SyncError::Io(format!("failed to spawn tap recorder: {}", e)))?;

        Ok(RecorderHandle {
            stop_flag,
            output_frames,
            input_frames,
            thread: Some(thread),
        })
    }

    fn recording_loop(
        mut self,
        stop_flag: &AtomicBool,
    ) -> Result<(AudioStreamBuffer, AudioStreamBuffer)> {
        tracing::info!("Tap recorder thread running");

        loop {
            // Read the flag first so the final drain sees every block pushed
            // before stop was requested
            let stopping = stop_flag.load(Ordering::Acquire);

            if let Ok(fault) = self.faults.try_recv() {
                return Err(self.fault_error(fault));
            }

            if let Err(e) = self.output.drain().and_then(|_| self.input.drain()) {
                tracing::error!(error = %e, "Tap recorder failed");
                return Err(e);
            }

            if stopping {
                break;
            }
            std::thread::sleep(DRAIN_INTERVAL);
        }

        let output = self.output.finish()?;
        let input = self.input.finish()?;

        tracing::info!(
            output_frames = output.frame_len(),
            input_frames = input.frame_len(),
            "Tap recorder stopped"
        );

        Ok((output, input))
    }

    fn fault_error(&self, fault: TapFault) -> SyncError {
        match fault {
            TapFault::Overrun { role, dropped } => {
                let sink = match role {
                    StreamRole::InputTap => &self.input,
                    _ => &self.output,
                };
                tracing::error!(
                    tap = role.as_str(),
                    dropped,
                    "Ring buffer overrun on audio thread"
                );
                sink.failure(format!("ring buffer overrun, {} samples dropped", dropped))
            }
        }
    }
}

/// Handle returned by [`TapRecorder::start`]
pub struct RecorderHandle {
    stop_flag: Arc<AtomicBool>,
    output_frames: Arc<AtomicU64>,
    input_frames: Arc<AtomicU64>,
    thread: Option<JoinHandle<Result<(AudioStreamBuffer, AudioStreamBuffer)>>>,
}

impl RecorderHandle {
    /// Stop recording, finalize both files, and return (output, input) buffers
    pub fn stop(&mut self) -> Result<(AudioStreamBuffer, AudioStreamBuffer)> {
        self.stop_flag.store(true, Ordering::Release);
        let thread = self
            .thread
            .take()
            .ok_or_else(|| SyncError::Io("tap recorder already stopped".into()))?;
        match thread.join() {
            Ok(result) => result,
            Err(panic_info) => {
                let msg = if let Some(s) = panic_info.downcast_ref::<&str>() {
                    s.to_string()
                } else if let Some(s) = panic_info.downcast_ref::<String>() {
                    s.clone()
                } else {
                    "unknown panic".to_string()
                };
                tracing::error!(panic = %msg, "Tap recorder thread PANICKED");
                Err(SyncError::Io(format!("tap recorder panicked: {}", msg)))
            }
        }
    }

    /// True once the thread has exited, which before `stop` means it failed
    pub fn has_exited(&self) -> bool {
        self.thread
            .as_ref()
            .map(|h| h.is_finished())
            .unwrap_or(true)
    }

    /// Frames recorded so far as (output, input)
    pub fn frames_recorded(&self) -> (u64, u64) {
        (
            self.output_frames.load(Ordering::Relaxed),
            self.input_frames.load(Ordering::Relaxed),
        )
    }
}

impl Drop for RecorderHandle {
    fn drop(&mut self) {
        self.stop_flag.store(true, Ordering::Release);
        if let Some(h) = self.thread.take() {
            let _ = h.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::wavio::read_audio_file;

    #[test]
    fn test_latch_keeps_first_time() {
        let latch = FirstCallbackLatch::new();
        assert_eq!(latch.get(), None);
        assert!(latch.latch(Duration::from_millis(5)));
        assert!(!latch.latch(Duration::from_millis(9)));
        assert_eq!(latch.get(), Some(Duration::from_millis(5)));
    }

    #[test]
    fn test_records_blocks_to_buffers_and_files() {
        let dir = tempfile::tempdir().unwrap();
        let out_path = dir.path().join("output_tap.wav");
        let in_path = dir.path().join("input_tap.wav");

        let setup = TapRecorder::create(
            48000,
            TapSpec { path: &out_path, channels: 2 },
            TapSpec { path: &in_path, channels: 1 },
            1.0,
        )
        .unwrap();
        let mut output_tap = setup.output_tap;
        let mut input_tap = setup.input_tap;
        let mut handle = setup.recorder.start().unwrap();

        output_tap.on_block(&[0.1, 0.2, 0.3, 0.4], Duration::from_millis(1));
        input_tap.on_block(&[0.5, 0.6, 0.7], Duration::from_millis(2));
        input_tap.on_block(&[0.8], Duration::from_millis(3));

        let (output, input) = handle.stop().unwrap();
        assert_eq!(output.samples(), &[0.1, 0.2, 0.3, 0.4]);
        assert_eq!(input.samples(), &[0.5, 0.6, 0.7, 0.8]);
        assert_eq!(read_audio_file(&out_path).unwrap(), output);
        assert_eq!(read_audio_file(&in_path).unwrap(), input);

        assert_eq!(setup.output_first_callback.get(), Some(Duration::from_millis(1)));
        assert_eq!(setup.input_first_callback.get(), Some(Duration::from_millis(2)));
    }

    #[test]
    fn test_partial_frames_are_trimmed() {
        let dir = tempfile::tempdir().unwrap();
        let out_path = dir.path().join("output_tap.wav");
        let in_path = dir.path().join("input_tap.wav");

        let setup = TapRecorder::create(
            48000,
            TapSpec { path: &out_path, channels: 2 },
            TapSpec { path: &in_path, channels: 1 },
            1.0,
        )
        .unwrap();
        let mut output_tap = setup.output_tap;
        let mut handle = setup.recorder.start().unwrap();

        // Ragged block: two frames plus one stray sample
        output_tap.on_block(&[0.1, 0.2, 0.3, 0.4, 0.5], Duration::ZERO);
        output_tap.on_block(&[0.6, 0.7], Duration::ZERO);

        let (output, _) = handle.stop().unwrap();
        assert_eq!(output.samples(), &[0.1, 0.2, 0.3, 0.4, 0.6, 0.7]);
        assert_eq!(read_audio_file(&out_path).unwrap(), output);
    }

    #[test]
    fn test_overrun_fails_with_tap_path() {
        let dir = tempfile::tempdir().unwrap();
        let out_path = dir.path().join("output_tap.wav");
        let in_path = dir.path().join("input_tap.wav");

        // 0.1s minimum ring at 100 Hz = 10 frames
        let setup = TapRecorder::create(
            100,
            TapSpec { path: &out_path, channels: 1 },
            TapSpec { path: &in_path, channels: 1 },
            0.1,
        )
        .unwrap();
        let mut input_tap = setup.input_tap;
        input_tap.on_block(&[0.0; 11], Duration::ZERO);

        let mut handle = setup.recorder.start().unwrap();
        let err = handle.stop().unwrap_err();

        match err {
            SyncError::CaptureWriteFailure { path, reason } => {
                assert!(path.ends_with("input_tap.wav"));
                assert!(reason.contains("overrun"));
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_unwritable_tap_path_fails_at_create() {
        let dir = tempfile::tempdir().unwrap();
        let blocked = dir.path().join("blocked");
        std::fs::create_dir(&blocked).unwrap();
        std::fs::write(blocked.join("keep"), b"x").unwrap();
        let in_path = dir.path().join("input_tap.wav");

        let result = TapRecorder::create(
            48000,
            TapSpec { path: &blocked, channels: 1 },
            TapSpec { path: &in_path, channels: 1 },
            1.0,
        );
        assert!(matches!(
            result,
            Err(SyncError::CaptureWriteFailure { .. })
        ));
    }
}
