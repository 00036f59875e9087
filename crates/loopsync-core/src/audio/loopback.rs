//! Deterministic software loopback for exercising capture without hardware
//!
//! Behaves like a duplex device whose output is wired straight back into its
//! input:
//! - output and input are delivered in blocks of one hardware buffer,
//! - the first output block is priming silence, so real output frames begin
//!   one buffer into the output tap,
//! - the scheduled reference starts `start_frame` real frames after start,
//! - the input tap hears the output tap `loop_delay_frames` later.
//!
//! The device thread runs for a fixed number of frames, then reports itself
//! finished.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use super::buffer::AudioStreamBuffer;
use super::device::{DuplexGraph, HostClock, StreamFormat, TapCallback};
use super::profile::{DeviceLatencyProfile, LatencyProfileSource};
use crate::error::{Result, SyncError};

/// Software duplex device with a fixed loop delay
pub struct SimulatedLoopback {
    buffer_frames: u32,
    loop_delay_frames: u32,
    total_frames: u64,
    output_channels: u16,
    input_channels: u16,
    /// Time to sleep after each block; zero runs as fast as possible
    pace: Duration,
    reported: DeviceLatencyProfile,
    clock: HostClock,
    format: Option<StreamFormat>,
    scheduled: Option<(Arc<AudioStreamBuffer>, u64)>,
    taps: Option<(TapCallback, TapCallback)>,
    stop_flag: Arc<AtomicBool>,
    finished: Arc<AtomicBool>,
    /// Frames in the first delivered block (0 until seen)
    delivered_block: Arc<AtomicU32>,
    thread: Option<JoinHandle<()>>,
}

impl SimulatedLoopback {
    /// Loop with `buffer_frames` blocks, no delay, and one second of audio
    /// at 48kHz
    pub fn new(buffer_frames: u32) -> Self {
        let buffer_frames = buffer_frames.max(1);
        Self {
            buffer_frames,
            loop_delay_frames: 0,
            total_frames: 48000,
            output_channels: 1,
            input_channels: 1,
            pace: Duration::ZERO,
            reported: DeviceLatencyProfile::with_buffer_sizes(buffer_frames, buffer_frames),
            clock: HostClock::new(),
            format: None,
            scheduled: None,
            taps: None,
            stop_flag: Arc::new(AtomicBool::new(false)),
            finished: Arc::new(AtomicBool::new(false)),
            delivered_block: Arc::new(AtomicU32::new(0)),
            thread: None,
        }
    }

    /// Delay between the output tap and the input tap
    ///
    /// Also reported as the output latency unless a profile is set with
    /// [`with_reported_profile`](Self::with_reported_profile).
    pub fn with_loop_delay(mut self, frames: u32) -> Self {
        self.loop_delay_frames = frames;
        self.reported.output_latency_frames = frames;
        self
    }

    /// Frames each path delivers before the device finishes
    pub fn with_total_frames(mut self, frames: u64) -> Self {
        self.total_frames = frames;
        self
    }

    pub fn with_channels(mut self, output_channels: u16, input_channels: u16) -> Self {
        self.output_channels = output_channels.max(1);
        self.input_channels = input_channels.max(1);
        self
    }

    pub fn with_pace(mut self, pace: Duration) -> Self {
        self.pace = pace;
        self
    }

    /// Latency figures to report instead of the true loop delay
    pub fn with_reported_profile(mut self, profile: DeviceLatencyProfile) -> Self {
        self.reported = profile;
        self
    }
}

/// Device thread state
struct LoopbackRun {
    buffer_frames: usize,
    loop_delay: usize,
    total_frames: u64,
    output_channels: usize,
    input_channels: usize,
    pace: Duration,
    scheduled: Option<(Arc<AudioStreamBuffer>, u64)>,
    clock: HostClock,
}

impl LoopbackRun {
    /// Mono output-tap sample at tap frame `f`
    fn output_sample(&self, f: u64) -> f32 {
        // First block is priming silence
        let Some(real) = f.checked_sub(self.buffer_frames as u64) else {
            return 0.0;
        };
        match &self.scheduled {
            Some((buffer, start)) if real >= *start => buffer.mono_sample((real - start) as usize),
            _ => 0.0,
        }
    }

    fn run(
        self,
        mut output_tap: TapCallback,
        mut input_tap: TapCallback,
        stop_flag: &AtomicBool,
        delivered_block: &AtomicU32,
    ) {
        let mut out_block = vec![0.0f32; self.buffer_frames * self.output_channels];
        let mut in_block = vec![0.0f32; self.buffer_frames * self.input_channels];
        let mut position: u64 = 0;

        while position < self.total_frames && !stop_flag.load(Ordering::Acquire) {
            let frames = (self.total_frames - position).min(self.buffer_frames as u64) as usize;

            for i in 0..frames {
                let t = position + i as u64;
                let out = self.output_sample(t);
                out_block[i * self.output_channels..(i + 1) * self.output_channels].fill(out);

                let heard = t
                    .checked_sub(self.loop_delay as u64)
                    .map(|src| self.output_sample(src))
                    .unwrap_or(0.0);
                in_block[i * self.input_channels..(i + 1) * self.input_channels].fill(heard);
            }

            output_tap(&out_block[..frames * self.output_channels], self.clock.now());
            input_tap(&in_block[..frames * self.input_channels], self.clock.now());

            if position == 0 {
                delivered_block.store(frames as u32, Ordering::Relaxed);
            }
            position += frames as u64;
            if self.pace.is_zero() {
                std::thread::yield_now();
            } else {
                std::thread::sleep(self.pace);
            }
        }

        tracing::debug!(frames = position, "Simulated loopback finished");
    }
}

impl DuplexGraph for SimulatedLoopback {
    fn open(&mut self, sample_rate: u32) -> Result<StreamFormat> {
        let format = StreamFormat {
            sample_rate,
            output_channels: self.output_channels,
            input_channels: self.input_channels,
        };
        self.format = Some(format);
        Ok(format)
    }

    fn schedule_buffer(&mut self, buffer: Arc<AudioStreamBuffer>, start_frame: u64) -> Result<()> {
        self.scheduled = Some((buffer, start_frame));
        Ok(())
    }

    fn install_taps(&mut self, output_tap: TapCallback, input_tap: TapCallback) -> Result<()> {
        self.taps = Some((output_tap, input_tap));
        Ok(())
    }

    fn start(&mut self) -> Result<Duration> {
        let format = self
            .format
            .ok_or_else(|| SyncError::DeviceUnavailable("graph not opened".into()))?;
        let (output_tap, input_tap) = self
            .taps
            .take()
            .ok_or_else(|| SyncError::DeviceUnavailable("taps not installed".into()))?;

        let run = LoopbackRun {
            buffer_frames: self.buffer_frames as usize,
            loop_delay: self.loop_delay_frames as usize,
            total_frames: self.total_frames,
            output_channels: format.output_channels as usize,
            input_channels: format.input_channels as usize,
            pace: self.pace,
            scheduled: self.scheduled.take(),
            clock: self.clock,
        };

        self.stop_flag.store(false, Ordering::Release);
        self.finished.store(false, Ordering::Release);
        self.delivered_block.store(0, Ordering::Relaxed);
        let stop_flag = Arc::clone(&self.stop_flag);
        let finished = Arc::clone(&self.finished);
        let delivered_block = Arc::clone(&self.delivered_block);

        let started_at = self.clock.now();
        let thread = std::thread::Builder::new()
            .name("loopback-device".into())
            .spawn(move || {
                run.run(output_tap, input_tap, &stop_flag, &delivered_block);
                finished.store(true, Ordering::Release);
            })
            .map_err(|e| SyncError::DeviceUnavailable(format!("loopback thread: {}", e)))?;
        self.thread = Some(thread);

        Ok(started_at)
    }

    fn stop(&mut self) {
        self.stop_flag.store(true, Ordering::Release);
        if let Some(h) = self.thread.take() {
            let _ = h.join();
        }
    }

    fn delivered_buffer_frames(&self) -> Option<(u32, u32)> {
        match self.delivered_block.load(Ordering::Relaxed) {
            0 => None,
            frames => Some((frames, frames)),
        }
    }

    fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }
}

impl LatencyProfileSource for SimulatedLoopback {
    fn query_latency_profile(&self) -> Result<DeviceLatencyProfile> {
        Ok(self.reported)
    }
}

impl Drop for SimulatedLoopback {
    fn drop(&mut self) {
        self.stop();
    }
}
