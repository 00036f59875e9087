//! Loopsync Core - Round-trip capture and synchronized rendering
//!
//! This library plays a reference stimulus through an audio device while
//! recording what leaves the output and what arrives at the input. From the
//! device's reported latency figures it computes where each recording belongs
//! on a shared timeline, then renders all three into one stereo file so the
//! remaining misalignment can be inspected by ear or eye.

pub mod audio;
pub mod error;
pub mod session;

pub use audio::{
    buffer::AudioStreamBuffer,
    capture::{CaptureSession, CaptureState, TimingMarks},
    device::{CpalDuplexGraph, DuplexGraph},
    loopback::SimulatedLoopback,
    profile::{DeviceLatencyProfile, LatencyProfileSource},
    render::OfflineMixRenderer,
    sync::{compute_sync_plan, SyncPlan},
};
pub use error::{Result, SyncError};
pub use session::{LatencyRun, RunConfig, RunReport};

/// Application version from Cargo.toml
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Build date set by build.rs
pub const BUILD_DATE: &str = env!("BUILD_DATE");

/// Default device sample rate
pub const DEFAULT_SAMPLE_RATE: u32 = 48000;

/// Default delay between device start and reference playback
pub const DEFAULT_STARTUP_DELAY_SECS: f64 = 0.1;

/// File name of the output tap recording
pub const OUTPUT_TAP_FILE: &str = "output_tap.wav";

/// File name of the input tap recording
pub const INPUT_TAP_FILE: &str = "input_tap.wav";

/// File name of the synchronized stereo result
pub const RESULT_FILE: &str = "synchronized.wav";

/// File name of the JSON run report
pub const REPORT_FILE: &str = "report.json";
