//! Error taxonomy for capture, offset computation, and rendering
//!
//! Capture-phase faults end the session that raised them. Render faults only
//! end the render attempt: the buffers and plan are untouched, so the caller
//! may render again with the same inputs.

use thiserror::Error;

/// Errors raised across the capture → sync → render pipeline
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    #[error("Audio device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("Failed to write capture file {path}: {reason}")]
    CaptureWriteFailure { path: String, reason: String },

    #[error("Reference asset {path} could not be loaded: {reason}")]
    MissingReferenceAsset { path: String, reason: String },

    #[error("Inconsistent latency profile: input tap would start at frame {input_start_frame}")]
    InconsistentLatencyProfile { input_start_frame: i64 },

    #[error("Failed to write render target {path}: {reason}")]
    RenderWriteFailure { path: String, reason: String },

    #[error("Session is {actual}, expected {expected}")]
    InvalidState {
        expected: &'static str,
        actual: &'static str,
    },

    #[error("Stream format mismatch: {0}")]
    FormatMismatch(String),

    #[error("Audio file error: {0}")]
    Io(String),
}

impl SyncError {
    /// Whether the same operation may simply be attempted again
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::RenderWriteFailure { .. })
    }

    /// Whether this fault ends the capture session that raised it
    pub fn is_fatal_to_session(&self) -> bool {
        matches!(
            self,
            Self::DeviceUnavailable(_) | Self::CaptureWriteFailure { .. }
        )
    }
}

/// Result alias used throughout the core crate
pub type Result<T> = std::result::Result<T, SyncError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_render_failures_are_retryable() {
        let render = SyncError::RenderWriteFailure {
            path: "out.wav".into(),
            reason: "disk full".into(),
        };
        let capture = SyncError::CaptureWriteFailure {
            path: "input_tap.wav".into(),
            reason: "disk full".into(),
        };
        assert!(render.is_retryable());
        assert!(!render.is_fatal_to_session());
        assert!(!capture.is_retryable());
        assert!(capture.is_fatal_to_session());
        assert!(SyncError::DeviceUnavailable("gone".into()).is_fatal_to_session());
    }

    #[test]
    fn test_messages_name_the_failing_file() {
        let err = SyncError::CaptureWriteFailure {
            path: "output_tap.wav".into(),
            reason: "permission denied".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("output_tap.wav"));
        assert!(msg.contains("permission denied"));
    }
}
