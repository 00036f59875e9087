//! Duplex device graph: playback of the reference plus two taps
//!
//! The capture session only needs a device that can
//! - open input and output paths at one sample rate,
//! - play a scheduled buffer a fixed number of frames after start,
//! - hand every delivered output and input block to a tap callback together
//!   with a host timestamp.
//!
//! Output and input may live on different devices, as with a separate
//! speaker and microphone.
//!
//! [`CpalDuplexGraph`] does this on a real device. The hardware-free
//! [`SimulatedLoopback`](super::loopback::SimulatedLoopback) does it
//! deterministically for tests.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{BufferSize, Device, Host, SampleRate, Stream, StreamConfig, SupportedBufferSize};
use serde::{Deserialize, Serialize};

use super::buffer::AudioStreamBuffer;
use super::profile::{DeviceLatencyProfile, LatencyProfileSource};
use crate::error::{Result, SyncError};

/// Tap hook: receives each interleaved block and the host time it arrived
///
/// Runs on the audio thread. Must not block or allocate.
pub type TapCallback = Box<dyn FnMut(&[f32], Duration) + Send + 'static>;

/// Monotonic host clock shared by a graph and its taps
///
/// Times are reported as offsets from the clock's origin.
#[derive(Debug, Clone, Copy)]
pub struct HostClock {
    origin: Instant,
}

impl HostClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }

    /// Time elapsed since the clock was created
    pub fn now(&self) -> Duration {
        self.origin.elapsed()
    }
}

impl Default for HostClock {
    fn default() -> Self {
        Self::new()
    }
}

/// Format negotiated when a duplex graph is opened
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamFormat {
    /// Sample rate shared by both paths, in Hz
    pub sample_rate: u32,
    /// Interleaved channels on the output path
    pub output_channels: u16,
    /// Interleaved channels on the input path
    pub input_channels: u16,
}

/// A device that plays a buffer while tapping its output and input paths
pub trait DuplexGraph {
    /// Open both paths at `sample_rate` and report the negotiated format
    fn open(&mut self, sample_rate: u32) -> Result<StreamFormat>;

    /// Play `buffer` starting `start_frame` frames after [`start`](Self::start)
    fn schedule_buffer(&mut self, buffer: Arc<AudioStreamBuffer>, start_frame: u64) -> Result<()>;

    /// Install the output-path and input-path taps
    fn install_taps(&mut self, output_tap: TapCallback, input_tap: TapCallback) -> Result<()>;

    /// Start the device. Returns the host time at which it was started,
    /// taken before any tap can run.
    fn start(&mut self) -> Result<Duration>;

    /// Stop the device and release its streams
    fn stop(&mut self);

    /// Frames per block actually delivered as (output, input), once both
    /// paths have run
    fn delivered_buffer_frames(&self) -> Option<(u32, u32)> {
        None
    }

    /// Error raised by the device since it was started, if any
    fn check_health(&self) -> Result<()> {
        Ok(())
    }

    /// Whether the device has stopped producing audio on its own
    fn is_finished(&self) -> bool {
        false
    }
}

/// Audio device information
#[derive(Debug, Clone, Serialize)]
pub struct DeviceInfo {
    /// Device name
    pub name: String,
    /// Whether this is the default device
    pub is_default: bool,
    /// Supported sample rates
    pub sample_rates: Vec<u32>,
    /// Number of input channels
    pub input_channels: u16,
    /// Number of output channels
    pub output_channels: u16,
}

/// Latency figures the portable backend cannot query from the device
///
/// Supplied from configuration and merged with the negotiated buffer sizes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LatencyOverrides {
    pub output_safety_offset_frames: u32,
    pub input_safety_offset_frames: u32,
    pub output_latency_frames: u32,
    pub input_latency_frames: u32,
    pub output_stream_latency_frames: u32,
    pub input_stream_latency_frames: u32,
}

impl LatencyOverrides {
    /// Complete profile with the given hardware buffer sizes
    pub fn to_profile(&self, output_buffer_frames: u32, input_buffer_frames: u32) -> DeviceLatencyProfile {
        DeviceLatencyProfile {
            output_safety_offset_frames: self.output_safety_offset_frames,
            input_safety_offset_frames: self.input_safety_offset_frames,
            output_latency_frames: self.output_latency_frames,
            input_latency_frames: self.input_latency_frames,
            output_stream_latency_frames: self.output_stream_latency_frames,
            input_stream_latency_frames: self.input_stream_latency_frames,
            output_buffer_size_frames: output_buffer_frames,
            input_buffer_size_frames: input_buffer_frames,
        }
    }
}

/// Where the input path of a [`CpalDuplexGraph`] comes from
#[derive(Debug, Clone, PartialEq, Eq)]
enum InputSelection {
    /// Device with this exact name
    Named(String),
    /// The named output device, if it has an input path
    SameAsOutput,
    /// Host default input device
    HostDefault,
}

fn input_selection(output_name: Option<&str>, input_name: Option<&str>) -> InputSelection {
    match (output_name, input_name) {
        (_, Some(name)) => InputSelection::Named(name.to_string()),
        (Some(_), None) => InputSelection::SameAsOutput,
        (None, None) => InputSelection::HostDefault,
    }
}

fn find_device(host: &Host, name: &str) -> Result<Device> {
    host.devices()
        .map_err(|e| SyncError::DeviceUnavailable(e.to_string()))?
        .find(|d| d.name().map(|n| n == name).unwrap_or(false))
        .ok_or_else(|| SyncError::DeviceUnavailable(format!("device not found: {}", name)))
}

fn device_name(device: &Device) -> String {
    device.name().unwrap_or_else(|_| "Unknown".to_string())
}

/// Common sample rates checked when listing devices
const COMMON_RATES: [u32; 6] = [44100, 48000, 88200, 96000, 176400, 192000];

/// List the devices of the default host
pub fn list_devices() -> Result<Vec<DeviceInfo>> {
    let host = cpal::default_host();
    let mut devices = Vec::new();

    let default_input = host.default_input_device().and_then(|d| d.name().ok());
    let default_output = host.default_output_device().and_then(|d| d.name().ok());

    let all = host
        .devices()
        .map_err(|e| SyncError::DeviceUnavailable(e.to_string()))?;

    for device in all {
        let name = device.name().unwrap_or_else(|_| "Unknown".to_string());
        let is_default = default_input.as_deref() == Some(name.as_str())
            || default_output.as_deref() == Some(name.as_str());

        let input_channels = device
            .default_input_config()
            .map(|c| c.channels())
            .unwrap_or(0);
        let output_channels = device
            .default_output_config()
            .map(|c| c.channels())
            .unwrap_or(0);

        let mut sample_rates = Vec::new();
        if let Ok(configs) = device.supported_output_configs() {
            for config in configs {
                for &rate in &COMMON_RATES {
                    if (config.min_sample_rate().0..=config.max_sample_rate().0).contains(&rate)
                        && !sample_rates.contains(&rate)
                    {
                        sample_rates.push(rate);
                    }
                }
            }
        }
        sample_rates.sort();

        devices.push(DeviceInfo {
            name,
            is_default,
            sample_rates,
            input_channels,
            output_channels,
        });
    }

    Ok(devices)
}

/// Duplex graph on a cpal output device and input device
pub struct CpalDuplexGraph {
    output_device: Device,
    /// Separate input device, `None` when the output device records too
    input_device: Option<Device>,
    output_name: String,
    input_name: String,
    /// Fixed hardware buffer request, or the backend default
    buffer_size_frames: Option<u32>,
    overrides: LatencyOverrides,
    clock: HostClock,
    format: Option<StreamFormat>,
    scheduled: Option<(Arc<AudioStreamBuffer>, u64)>,
    taps: Option<(TapCallback, TapCallback)>,
    output_stream: Option<Stream>,
    input_stream: Option<Stream>,
    running: Arc<AtomicBool>,
    stream_failed: Arc<AtomicBool>,
    /// Frames in the first delivered block of each path (0 until seen)
    observed_output_block: Arc<AtomicU32>,
    observed_input_block: Arc<AtomicU32>,
}

impl CpalDuplexGraph {
    /// Use the named devices
    ///
    /// Without an output name the host default output is used. Without an
    /// input name the named output device records when it can, otherwise
    /// the host default input does.
    pub fn new(output_name: Option<&str>, input_name: Option<&str>) -> Result<Self> {
        let host: Host = cpal::default_host();

        let output_device = match output_name {
            Some(name) => find_device(&host, name)?,
            None => host
                .default_output_device()
                .ok_or_else(|| SyncError::DeviceUnavailable("no default output device".into()))?,
        };

        let input_device = match input_selection(output_name, input_name) {
            InputSelection::Named(name) => Some(find_device(&host, &name)?),
            InputSelection::SameAsOutput if output_device.default_input_config().is_ok() => None,
            InputSelection::SameAsOutput | InputSelection::HostDefault => Some(
                host.default_input_device()
                    .ok_or_else(|| SyncError::DeviceUnavailable("no default input device".into()))?,
            ),
        };

        let output_name = device_name(&output_device);
        let input_name = input_device
            .as_ref()
            .map(device_name)
            .unwrap_or_else(|| output_name.clone());

        tracing::info!(output = %output_name, input = %input_name, "Devices selected");

        Ok(Self {
            output_device,
            input_device,
            output_name,
            input_name,
            buffer_size_frames: None,
            overrides: LatencyOverrides::default(),
            clock: HostClock::new(),
            format: None,
            scheduled: None,
            taps: None,
            output_stream: None,
            input_stream: None,
            running: Arc::new(AtomicBool::new(false)),
            stream_failed: Arc::new(AtomicBool::new(false)),
            observed_output_block: Arc::new(AtomicU32::new(0)),
            observed_input_block: Arc::new(AtomicU32::new(0)),
        })
    }

    /// Request a fixed hardware buffer size
    pub fn with_buffer_size(mut self, frames: Option<u32>) -> Self {
        self.buffer_size_frames = frames;
        self
    }

    /// Latency figures to report alongside the buffer sizes
    pub fn with_latency_overrides(mut self, overrides: LatencyOverrides) -> Self {
        self.overrides = overrides;
        self
    }

    pub fn output_device_name(&self) -> &str {
        &self.output_name
    }

    pub fn input_device_name(&self) -> &str {
        &self.input_name
    }

    fn input_device(&self) -> &Device {
        self.input_device.as_ref().unwrap_or(&self.output_device)
    }

    fn stream_config(&self, channels: u16, sample_rate: u32) -> StreamConfig {
        StreamConfig {
            channels,
            sample_rate: SampleRate(sample_rate),
            buffer_size: match self.buffer_size_frames {
                Some(frames) => BufferSize::Fixed(frames),
                None => BufferSize::Default,
            },
        }
    }

    /// Best estimate of the hardware buffer size before the device runs
    fn expected_buffer_frames(&self, range: Option<&SupportedBufferSize>) -> u32 {
        if let Some(frames) = self.buffer_size_frames {
            return frames;
        }
        match range {
            Some(SupportedBufferSize::Range { min, .. }) => *min,
            _ => 0,
        }
    }
}

impl DuplexGraph for CpalDuplexGraph {
    fn open(&mut self, sample_rate: u32) -> Result<StreamFormat> {
        let output = self
            .output_device
            .default_output_config()
            .map_err(|e| {
                SyncError::DeviceUnavailable(format!("no output path on {}: {}", self.output_name, e))
            })?;
        let input = self
            .input_device()
            .default_input_config()
            .map_err(|e| {
                SyncError::DeviceUnavailable(format!("no input path on {}: {}", self.input_name, e))
            })?;

        if output.sample_rate().0 != sample_rate {
            tracing::info!(
                "Device default rate {} Hz differs from requested {} Hz",
                output.sample_rate().0,
                sample_rate
            );
        }

        let format = StreamFormat {
            sample_rate,
            output_channels: output.channels(),
            input_channels: input.channels(),
        };

        tracing::info!(
            output = %self.output_name,
            input = %self.input_name,
            sample_rate,
            output_channels = format.output_channels,
            input_channels = format.input_channels,
            buffer = ?self.buffer_size_frames,
            "Duplex graph opened"
        );

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
        let (mut output_tap, mut input_tap) = self
            .taps
            .take()
            .ok_or_else(|| SyncError::DeviceUnavailable("taps not installed".into()))?;
        let scheduled = self.scheduled.take();

        self.running.store(true, Ordering::Release);
        self.stream_failed.store(false, Ordering::Release);

        // Output stream: reference starts at its scheduled frame, silence elsewhere
        let output_running = Arc::clone(&self.running);
        let output_failed = Arc::clone(&self.stream_failed);
        let output_block = Arc::clone(&self.observed_output_block);
        let clock = self.clock;
        let num_output_channels = format.output_channels as usize;
        let mut frame_counter: u64 = 0;

        let output_stream = self
            .output_device
            .build_output_stream(
                &self.stream_config(format.output_channels, format.sample_rate),
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    if !output_running.load(Ordering::Relaxed) {
                        data.fill(0.0);
                        return;
                    }

                    let mut frames = 0u64;
                    for (i, frame) in data.chunks_mut(num_output_channels).enumerate() {
                        let t = frame_counter + i as u64;
                        let sample = match &scheduled {
                            Some((buffer, start)) if t >= *start => {
                                buffer.mono_sample((t - start) as usize)
                            }
                            _ => 0.0,
                        };
                        frame.fill(sample);
                        frames += 1;
                    }

                    if frame_counter == 0 {
                        output_block.store(frames as u32, Ordering::Relaxed);
                        tracing::info!(
                            "Output callback started: {} frames ({} channels)",
                            frames,
                            num_output_channels
                        );
                    }
                    frame_counter += frames;

                    output_tap(data, clock.now());
                },
                move |err| {
                    output_failed.store(true, Ordering::Release);
                    tracing::error!("Output stream error: {}", err);
                },
                None,
            )
            .map_err(|e| SyncError::DeviceUnavailable(format!("output stream: {}", e)))?;

        let input_running = Arc::clone(&self.running);
        let input_failed = Arc::clone(&self.stream_failed);
        let input_block = Arc::clone(&self.observed_input_block);
        let num_input_channels = format.input_channels as usize;
        let mut first_input = true;

        let input_stream = self
            .input_device()
            .build_input_stream(
                &self.stream_config(format.input_channels, format.sample_rate),
                move |data: &[f32], _: &cpal::InputCallbackInfo| {
                    if !input_running.load(Ordering::Relaxed) {
                        return;
                    }
                    if first_input {
                        first_input = false;
                        let frames = data.len() / num_input_channels.max(1);
                        input_block.store(frames as u32, Ordering::Relaxed);
                        tracing::info!(
                            "Input callback started: {} frames ({} channels)",
                            frames,
                            num_input_channels
                        );
                    }
                    input_tap(data, clock.now());
                },
                move |err| {
                    input_failed.store(true, Ordering::Release);
                    tracing::error!("Input stream error: {}", err);
                },
                None,
            )
            .map_err(|e| SyncError::DeviceUnavailable(format!("input stream: {}", e)))?;

        // Taken before play so every tap timestamp is at or after it
        let started_at = self.clock.now();
        input_stream
            .play()
            .map_err(|e| SyncError::DeviceUnavailable(format!("input stream: {}", e)))?;
        output_stream
            .play()
            .map_err(|e| SyncError::DeviceUnavailable(format!("output stream: {}", e)))?;

        self.output_stream = Some(output_stream);
        self.input_stream = Some(input_stream);

        tracing::info!(
            output = %self.output_name,
            input = %self.input_name,
            sample_rate = format.sample_rate,
            "Duplex graph started"
        );

        Ok(started_at)
    }

    fn stop(&mut self) {
        self.running.store(false, Ordering::Release);
        self.output_stream = None;
        self.input_stream = None;
        tracing::info!(output = %self.output_name, "Duplex graph stopped");
    }

    fn delivered_buffer_frames(&self) -> Option<(u32, u32)> {
        let output = self.observed_output_block.load(Ordering::Relaxed);
        let input = self.observed_input_block.load(Ordering::Relaxed);
        (output > 0 && input > 0).then_some((output, input))
    }

    fn check_health(&self) -> Result<()> {
        if self.stream_failed.load(Ordering::Acquire) {
            return Err(SyncError::DeviceUnavailable(format!(
                "stream error on {} / {}",
                self.output_name, self.input_name
            )));
        }
        Ok(())
    }
}

impl LatencyProfileSource for CpalDuplexGraph {
    fn query_latency_profile(&self) -> Result<DeviceLatencyProfile> {
        let output = self
            .output_device
            .default_output_config()
            .map_err(|e| SyncError::DeviceUnavailable(e.to_string()))?;
        let input = self
            .input_device()
            .default_input_config()
            .map_err(|e| SyncError::DeviceUnavailable(e.to_string()))?;

        let output_frames = self.expected_buffer_frames(Some(output.buffer_size()));
        let input_frames = self.expected_buffer_frames(Some(input.buffer_size()));
        if output_frames == 0 {
            tracing::warn!(
                output = %self.output_name,
                "Backend does not report a buffer size, using the delivered block size"
            );
        }

        Ok(self.overrides.to_profile(output_frames, input_frames))
    }
}

impl Drop for CpalDuplexGraph {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_clock_is_monotonic() {
        let clock = HostClock::new();
        let a = clock.now();
        let b = clock.now();
        assert!(b >= a);
    }

    #[test]
    fn test_overrides_fill_profile() {
        let overrides = LatencyOverrides {
            output_latency_frames: 10,
            input_safety_offset_frames: 4,
            ..LatencyOverrides::default()
        };
        let profile = overrides.to_profile(512, 256);
        assert_eq!(profile.output_latency_frames, 10);
        assert_eq!(profile.input_safety_offset_frames, 4);
        assert_eq!(profile.output_buffer_size_frames, 512);
        assert_eq!(profile.input_buffer_size_frames, 256);
    }

    #[test]
    fn test_overrides_missing_fields_default_to_zero() {
        let overrides: LatencyOverrides =
            serde_json::from_str(r#"{"input_latency_frames": 32}"#).unwrap();
        assert_eq!(overrides.input_latency_frames, 32);
        assert_eq!(overrides.output_latency_frames, 0);
    }

    #[test]
    fn test_input_device_selection() {
        assert_eq!(input_selection(None, None), InputSelection::HostDefault);
        assert_eq!(input_selection(Some("Interface"), None), InputSelection::SameAsOutput);
        assert_eq!(
            input_selection(None, Some("Built-in Microphone")),
            InputSelection::Named("Built-in Microphone".to_string())
        );
        assert_eq!(
            input_selection(Some("Speakers"), Some("Microphone")),
            InputSelection::Named("Microphone".to_string())
        );
    }

    #[test]
    fn test_list_devices() {
        // May find nothing on CI without audio hardware, but shouldn't panic
        match list_devices() {
            Ok(devices) => {
                for device in &devices {
                    println!(
                        "  - {} (in:{}, out:{})",
                        device.name, device.input_channels, device.output_channels
                    );
                }
            }
            Err(e) => println!("No audio devices available: {}", e),
        }
    }
}
