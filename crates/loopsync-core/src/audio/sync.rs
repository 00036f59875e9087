//! Frame-offset computation for the synchronized render
//!
//! Places the reference stimulus, the output tap, and the input tap on one
//! shared timeline using nothing but device frame counts. No wall-clock
//! deltas enter the math, so the plan is a pure function of its inputs.
//!
//! ```text
//! reference_start = round(sample_rate * startup_delay)
//! output_start    = output_buffer_size
//! input_start     = output_start - (output latency + output stream latency
//!                                   + output safety + input safety
//!                                   + input latency + input stream latency)
//! ```
//!
//! The output tap always begins with one hardware buffer of priming zeros,
//! which is why its first real frame sits one buffer into the timeline. The
//! input tap hears that frame only after the full round trip, so it is pulled
//! backward by the summed latency.
//!
//! The model is a heuristic tuned on real hardware: a device pair that
//! reports latencies larger than its output buffer yields a negative input
//! start. That value is kept as-is and flagged, not clamped.

use serde::{Deserialize, Serialize};

use super::profile::DeviceLatencyProfile;
use crate::error::{Result, SyncError};

/// The three streams placed on the render timeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StreamRole {
    /// Known stimulus played into the loop
    Reference,
    /// What was actually sent to the output device
    OutputTap,
    /// What the input device heard
    InputTap,
}

impl StreamRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Reference => "reference",
            Self::OutputTap => "output_tap",
            Self::InputTap => "input_tap",
        }
    }
}

/// Start frame of each stream on the shared render timeline
///
/// Each value means "sample 0 of this buffer lands at this timeline frame".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncPlan {
    pub reference_start_frame: i64,
    pub output_start_frame: i64,
    pub input_start_frame: i64,
}

impl SyncPlan {
    /// Start frame for `role`
    pub fn start_frame(&self, role: StreamRole) -> i64 {
        match role {
            StreamRole::Reference => self.reference_start_frame,
            StreamRole::OutputTap => self.output_start_frame,
            StreamRole::InputTap => self.input_start_frame,
        }
    }

    /// Frames the input tap was pulled back relative to the output tap
    pub fn round_trip_frames(&self) -> i64 {
        self.output_start_frame - self.input_start_frame
    }

    /// Round trip in milliseconds at `sample_rate`
    pub fn round_trip_ms(&self, sample_rate: u32) -> f64 {
        if sample_rate == 0 {
            return 0.0;
        }
        self.round_trip_frames() as f64 / sample_rate as f64 * 1000.0
    }

    /// False when the reported latencies push the input tap before frame 0
    pub fn is_consistent(&self) -> bool {
        self.input_start_frame >= 0
    }

    /// Report a negative input start as [`SyncError::InconsistentLatencyProfile`]
    ///
    /// The plan itself stays usable; callers decide whether to render anyway.
    pub fn check_consistency(&self) -> Result<()> {
        if self.is_consistent() {
            Ok(())
        } else {
            Err(SyncError::InconsistentLatencyProfile {
                input_start_frame: self.input_start_frame,
            })
        }
    }
}

/// Compute the start frame of each stream from the device profile
///
/// Negative or NaN startup delays are treated as zero.
///
/// # Example
/// ```
/// use loopsync_core::audio::profile::DeviceLatencyProfile;
/// use loopsync_core::audio::sync::compute_sync_plan;
///
/// let profile = DeviceLatencyProfile::with_buffer_sizes(512, 512);
/// let plan = compute_sync_plan(&profile, 48000, 0.1);
/// assert_eq!(plan.reference_start_frame, 4800);
/// assert_eq!(plan.output_start_frame, 512);
/// assert_eq!(plan.input_start_frame, 512);
/// ```
pub fn compute_sync_plan(
    profile: &DeviceLatencyProfile,
    sample_rate: u32,
    startup_delay_secs: f64,
) -> SyncPlan {
    let delay = startup_delay_secs.max(0.0);
    let reference_start_frame = (sample_rate as f64 * delay).round() as i64;

    let output_start_frame = profile.output_buffer_size_frames as i64;
    let input_start_frame = output_start_frame - profile.round_trip_latency_frames() as i64;

    let plan = SyncPlan {
        reference_start_frame,
        output_start_frame,
        input_start_frame,
    };

    tracing::debug!(
        sample_rate,
        startup_delay_secs = delay,
        reference_start = plan.reference_start_frame,
        output_start = plan.output_start_frame,
        input_start = plan.input_start_frame,
        "sync_plan_computed"
    );

    plan
}
