//! Deterministic offline mixdown of the three loop streams
//!
//! Each stream is a mono source placed at its [`SyncPlan`] start frame and
//! panned to a fixed stereo position: reference and output tap hard left,
//! input tap hard right. Rendering pulls fixed-size blocks from the mix and
//! appends them to a stereo float WAV until the timeline position reaches
//! the input tap's length.
//!
//! Block size never depends on the live hardware buffer, and the loop has no
//! other inputs, so identical buffers, plan, and block size always produce a
//! byte-identical file.

use std::path::{Path, PathBuf};

use serde::Serialize;

use super::buffer::AudioStreamBuffer;
use super::sync::{StreamRole, SyncPlan};
use super::wavio::{delete_if_exists, WavFileWriter};
use crate::error::{Result, SyncError};

/// Default render block size in frames
pub const DEFAULT_BLOCK_FRAMES: usize = 4096;

/// Number of output channels in the rendered file
pub const OUTPUT_CHANNELS: u16 = 2;

/// Pan position of a source, -1.0 (hard left) to 1.0 (hard right)
pub fn pan_for(role: StreamRole) -> f32 {
    match role {
        StreamRole::Reference | StreamRole::OutputTap => -1.0,
        StreamRole::InputTap => 1.0,
    }
}

/// Left/right gains for a balance pan
///
/// Centre passes both channels at unity; hard left mutes the right.
pub fn pan_gains(pan: f32) -> (f32, f32) {
    let pan = pan.clamp(-1.0, 1.0);
    ((1.0 - pan).min(1.0), (1.0 + pan).min(1.0))
}

/// Outcome of a completed render
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RenderResult {
    /// File that was written
    pub path: PathBuf,
    /// Frames written, a whole number of blocks
    pub frames_rendered: u64,
    /// Blocks rendered
    pub blocks: u64,
    /// Output sample rate in Hz
    pub sample_rate: u32,
    /// Output channel count
    pub channels: u16,
}

/// One mono source on the render timeline
struct MixSource<'a> {
    role: StreamRole,
    buffer: &'a AudioStreamBuffer,
    start_frame: i64,
    gains: (f32, f32),
}

impl MixSource<'_> {
    /// Mono sample at timeline frame `t`, silent before the start frame and
    /// after the buffer ends
    fn sample_at(&self, t: i64) -> f32 {
        let offset = t - self.start_frame;
        if offset < 0 {
            return 0.0;
        }
        self.buffer.mono_sample(offset as usize)
    }
}

/// Fixed three-source stereo mix
struct MixGraph<'a> {
    sources: [MixSource<'a>; 3],
    position: i64,
}

impl<'a> MixGraph<'a> {
    fn new(
        reference: &'a AudioStreamBuffer,
        output_tap: &'a AudioStreamBuffer,
        input_tap: &'a AudioStreamBuffer,
        plan: &SyncPlan,
    ) -> Self {
        let source = |role: StreamRole, buffer: &'a AudioStreamBuffer| MixSource {
            role,
            buffer,
            start_frame: plan.start_frame(role),
            gains: pan_gains(pan_for(role)),
        };

        Self {
            sources: [
                source(StreamRole::Reference, reference),
                source(StreamRole::OutputTap, output_tap),
                source(StreamRole::InputTap, input_tap),
            ],
            position: 0,
        }
    }

    /// Fill `block` (interleaved stereo) and advance the timeline
    fn render_block(&mut self, block: &mut [f32]) {
        block.fill(0.0);
        for (i, frame) in block.chunks_exact_mut(OUTPUT_CHANNELS as usize).enumerate() {
            let t = self.position + i as i64;
            for source in &self.sources {
                let s = source.sample_at(t);
                frame[0] += s * source.gains.0;
                frame[1] += s * source.gains.1;
            }
        }
        self.position += (block.len() / OUTPUT_CHANNELS as usize) as i64;
    }
}

/// Renders the synchronized result file
#[derive(Debug, Clone)]
pub struct OfflineMixRenderer {
    block_frames: usize,
}

impl OfflineMixRenderer {
    /// Create a renderer with the default block size
    pub fn new() -> Self {
        Self::with_block_size(DEFAULT_BLOCK_FRAMES)
    }

    /// Create a renderer with a custom block size (at least one frame)
    pub fn with_block_size(block_frames: usize) -> Self {
        Self {
            block_frames: block_frames.max(1),
        }
    }

    /// Render the three streams at their planned offsets into `output_path`
    ///
    /// Any existing file at `output_path` is replaced. All buffers must share
    /// one sample rate. A write failure ends this attempt only; the inputs
    /// are borrowed read-only, so the call can simply be repeated.
    pub fn render(
        &self,
        reference: &AudioStreamBuffer,
        output_tap: &AudioStreamBuffer,
        input_tap: &AudioStreamBuffer,
        plan: &SyncPlan,
        output_path: &Path,
    ) -> Result<RenderResult> {
        let sample_rate = check_sample_rates(reference, output_tap, input_tap)?;

        if !plan.is_consistent() {
            tracing::warn!(
                input_start = plan.input_start_frame,
                "Rendering with negative input start, input tap head is cut off"
            );
        }

        let write_err = |e: hound::Error| SyncError::RenderWriteFailure {
            path: output_path.display().to_string(),
            reason: e.to_string(),
        };

        delete_if_exists(output_path).map_err(|e| SyncError::RenderWriteFailure {
            path: output_path.display().to_string(),
            reason: e.to_string(),
        })?;
        let mut writer =
            WavFileWriter::create(output_path, sample_rate, OUTPUT_CHANNELS).map_err(write_err)?;

        let mut graph = MixGraph::new(reference, output_tap, input_tap, plan);
        let mut block = vec![0.0f32; self.block_frames * OUTPUT_CHANNELS as usize];
        let end = input_tap.frame_len() as i64;
        let mut blocks = 0u64;

        tracing::info!(
            path = %output_path.display(),
            sample_rate,
            block_frames = self.block_frames,
            end_frame = end,
            reference_start = plan.reference_start_frame,
            output_start = plan.output_start_frame,
            input_start = plan.input_start_frame,
            "Offline render started"
        );

        while graph.position < end {
            graph.render_block(&mut block);
            writer.write(&block).map_err(write_err)?;
            blocks += 1;
            tracing::trace!(block = blocks, position = graph.position, "block_rendered");
        }

        let frames_rendered = writer.finalize().map_err(write_err)?;

        for source in &graph.sources {
            tracing::debug!(
                source = source.role.as_str(),
                start_frame = source.start_frame,
                frames = source.buffer.frame_len(),
                "Mixed source"
            );
        }

        tracing::info!(
            path = %output_path.display(),
            frames = frames_rendered,
            blocks,
            "Offline render finished"
        );

        Ok(RenderResult {
            path: output_path.to_path_buf(),
            frames_rendered,
            blocks,
            sample_rate,
            channels: OUTPUT_CHANNELS,
        })
    }
}

impl Default for OfflineMixRenderer {
    fn default() -> Self {
        Self::new()
    }
}

fn check_sample_rates(
    reference: &AudioStreamBuffer,
    output_tap: &AudioStreamBuffer,
    input_tap: &AudioStreamBuffer,
) -> Result<u32> {
    let rate = reference.sample_rate();
    for (role, buf) in [
        (StreamRole::OutputTap, output_tap),
        (StreamRole::InputTap, input_tap),
    ] {
        if buf.sample_rate() != rate {
            return Err(SyncError::FormatMismatch(format!(
                "{} is {} Hz but reference is {} Hz",
                role.as_str(),
                buf.sample_rate(),
                rate
            )));
        }
    }
    Ok(rate)
}
