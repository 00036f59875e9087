//! E2E tests for latency-offset computation
//!
//! Covers the worked figures for the three start frames, the negative
//! input-start case, and how the plan follows a captured profile.

use loopsync::audio::profile::DeviceLatencyProfile;
use loopsync::audio::sync::StreamRole;
use loopsync::{compute_sync_plan, SyncError};

fn profile_with_latency(output_buffer: u32, each: [u32; 6]) -> DeviceLatencyProfile {
    DeviceLatencyProfile {
        output_safety_offset_frames: each[0],
        input_safety_offset_frames: each[1],
        output_latency_frames: each[2],
        input_latency_frames: each[3],
        output_stream_latency_frames: each[4],
        input_stream_latency_frames: each[5],
        ..DeviceLatencyProfile::with_buffer_sizes(output_buffer, output_buffer)
    }
}

#[test]
fn test_zero_latency_aligns_taps() {
    let plan = compute_sync_plan(&profile_with_latency(512, [0; 6]), 48000, 0.0);
    assert_eq!(plan.output_start_frame, 512);
    assert_eq!(plan.input_start_frame, 512);
    assert_eq!(plan.reference_start_frame, 0);
    assert!(plan.check_consistency().is_ok());
}

#[test]
fn test_latency_larger_than_buffer_goes_negative() {
    let profile = profile_with_latency(512, [100, 100, 100, 100, 100, 100]);
    assert_eq!(profile.round_trip_latency_frames(), 600);

    let plan = compute_sync_plan(&profile, 48000, 0.1);
    assert_eq!(plan.input_start_frame, -88);
    assert_eq!(
        plan.check_consistency(),
        Err(SyncError::InconsistentLatencyProfile {
            input_start_frame: -88
        })
    );
}

#[test]
fn test_startup_delay_sets_reference_start() {
    let plan = compute_sync_plan(&DeviceLatencyProfile::default(), 48000, 0.1);
    assert_eq!(plan.reference_start_frame, 4800);
    assert_eq!(plan.start_frame(StreamRole::Reference), 4800);
}

#[test]
fn test_startup_delay_rounds_to_nearest_frame() {
    let plan = compute_sync_plan(&DeviceLatencyProfile::default(), 44100, 0.0125);
    // 551.25 frames
    assert_eq!(plan.reference_start_frame, 551);
}

#[test]
fn test_input_buffer_size_does_not_shift_input() {
    let a = compute_sync_plan(&DeviceLatencyProfile::with_buffer_sizes(256, 64), 48000, 0.0);
    let b = compute_sync_plan(&DeviceLatencyProfile::with_buffer_sizes(256, 1024), 48000, 0.0);
    assert_eq!(a, b);
}

#[test]
fn test_round_trip_matches_profile() {
    let profile = profile_with_latency(480, [24, 24, 96, 96, 0, 0]);
    let plan = compute_sync_plan(&profile, 48000, 0.05);
    assert_eq!(plan.round_trip_frames(), 240);
    approx::assert_relative_eq!(plan.round_trip_ms(48000), 5.0);
    approx::assert_relative_eq!(profile.round_trip_latency_ms(48000), 5.0);
}
