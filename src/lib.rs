//! Loopsync - round-trip audio capture with synchronized rendering
//!
//! This library re-exports the capture, sync, and render engine from
//! `loopsync-core` together with the application's persistent config.

pub mod config;

pub use loopsync_core::{audio, error, session};

pub use loopsync_core::{
    compute_sync_plan, AudioStreamBuffer, CaptureSession, DeviceLatencyProfile, LatencyRun,
    OfflineMixRenderer, RunConfig, RunReport, SyncError, SyncPlan,
};
pub use loopsync_core::{BUILD_DATE, DEFAULT_SAMPLE_RATE, VERSION};
