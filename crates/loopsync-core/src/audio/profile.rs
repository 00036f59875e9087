//! Hardware timing figures for one duplex device pair
//!
//! A [`DeviceLatencyProfile`] is queried once per session, before the sync
//! plan is computed, and never changes afterwards. Every figure is a frame
//! count at the session's single sample rate.

use crate::error::Result;
use serde::{Deserialize, Serialize};

/// Snapshot of the device timing figures the offset math needs
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceLatencyProfile {
    /// Extra buffering margin on the output path
    pub output_safety_offset_frames: u32,
    /// Extra buffering margin on the input path
    pub input_safety_offset_frames: u32,
    /// General output device latency
    pub output_latency_frames: u32,
    /// General input device latency
    pub input_latency_frames: u32,
    /// Latency intrinsic to the output stream
    pub output_stream_latency_frames: u32,
    /// Latency intrinsic to the input stream
    pub input_stream_latency_frames: u32,
    /// Hardware buffer size on the output path
    pub output_buffer_size_frames: u32,
    /// Hardware buffer size on the input path
    pub input_buffer_size_frames: u32,
}

impl DeviceLatencyProfile {
    /// Profile with the given buffer sizes and no reported latency
    pub fn with_buffer_sizes(output_buffer_size_frames: u32, input_buffer_size_frames: u32) -> Self {
        Self {
            output_buffer_size_frames,
            input_buffer_size_frames,
            ..Self::default()
        }
    }

    /// Sum of the six latency figures the signal crosses on its way from
    /// the output tap back to the input tap
    pub fn round_trip_latency_frames(&self) -> u64 {
        [
            self.output_latency_frames,
            self.output_stream_latency_frames,
            self.output_safety_offset_frames,
            self.input_safety_offset_frames,
            self.input_latency_frames,
            self.input_stream_latency_frames,
        ]
        .iter()
        .map(|&f| f as u64)
        .sum()
    }

    /// Round-trip latency in milliseconds at `sample_rate`
    pub fn round_trip_latency_ms(&self, sample_rate: u32) -> f64 {
        if sample_rate == 0 {
            return 0.0;
        }
        self.round_trip_latency_frames() as f64 / sample_rate as f64 * 1000.0
    }
}

/// Anything that can report a device's latency figures
///
/// Real backends query device properties; tests hand in a fixed profile.
pub trait LatencyProfileSource {
    fn query_latency_profile(&self) -> Result<DeviceLatencyProfile>;
}

impl LatencyProfileSource for DeviceLatencyProfile {
    fn query_latency_profile(&self) -> Result<DeviceLatencyProfile> {
        Ok(*self)
    }
}
