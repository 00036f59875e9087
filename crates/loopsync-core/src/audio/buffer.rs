//! Decoded PCM buffers shared by capture and rendering
//!
//! Samples are stored interleaved as `f32` in the range -1.0..1.0.

use crate::error::{Result, SyncError};

/// A decoded, interleaved PCM buffer
#[derive(Debug, Clone, PartialEq)]
pub struct AudioStreamBuffer {
    /// Sample rate in Hz
    sample_rate: u32,
    /// Number of interleaved channels (always >= 1)
    channels: u16,
    /// Interleaved samples, `frame_len() * channels` long
    samples: Vec<f32>,
}

impl AudioStreamBuffer {
    /// Create an empty buffer with the given format
    pub fn new(sample_rate: u32, channels: u16) -> Self {
        Self {
            sample_rate,
            channels: channels.max(1),
            samples: Vec::new(),
        }
    }

    /// Wrap interleaved samples
    ///
    /// Trailing samples that do not make up a full frame are rejected.
    pub fn from_interleaved(sample_rate: u32, channels: u16, samples: Vec<f32>) -> Result<Self> {
        if channels == 0 {
            return Err(SyncError::FormatMismatch(
                "buffer must have at least one channel".to_string(),
            ));
        }
        if samples.len() % channels as usize != 0 {
            return Err(SyncError::FormatMismatch(format!(
                "{} samples do not divide into {} channels",
                samples.len(),
                channels
            )));
        }
        Ok(Self {
            sample_rate,
            channels,
            samples,
        })
    }

    /// Mono buffer from a slice of samples
    pub fn mono(sample_rate: u32, samples: &[f32]) -> Self {
        Self {
            sample_rate,
            channels: 1,
            samples: samples.to_vec(),
        }
    }

    /// Buffer of `frames` frames of silence
    pub fn silent(sample_rate: u32, channels: u16, frames: usize) -> Self {
        let channels = channels.max(1);
        Self {
            sample_rate,
            channels,
            samples: vec![0.0; frames * channels as usize],
        }
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }

    /// Number of frames (one sample instant across all channels)
    pub fn frame_len(&self) -> usize {
        self.samples.len() / self.channels as usize
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Length in seconds at the buffer's sample rate
    pub fn duration_secs(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.frame_len() as f64 / self.sample_rate as f64
    }

    /// Interleaved sample data
    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    /// All channels of frame `index`, if it exists
    pub fn frame(&self, index: usize) -> Option<&[f32]> {
        let ch = self.channels as usize;
        self.samples.get(index * ch..(index + 1) * ch)
    }

    /// Average of all channels at frame `index`, or silence past the end
    pub fn mono_sample(&self, index: usize) -> f32 {
        match self.frame(index) {
            Some(frame) => frame.iter().sum::<f32>() / frame.len() as f32,
            None => 0.0,
        }
    }

    /// Append interleaved samples delivered by a tap
    ///
    /// Partial trailing frames are dropped.
    pub fn append_interleaved(&mut self, data: &[f32]) {
        let ch = self.channels as usize;
        let whole = data.len() - data.len() % ch;
        self.samples.extend_from_slice(&data[..whole]);
    }
}
