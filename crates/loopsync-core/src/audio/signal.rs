//! Reference stimulus generation
//!
//! The loop is driven by a short sine burst surrounded by silence. Its sharp
//! onset makes the three streams easy to line up by eye in a waveform view.

use super::buffer::AudioStreamBuffer;

/// Default burst frequency in Hz
pub const DEFAULT_TONE_HZ: f32 = 1000.0;

/// Default burst amplitude (-6dB for headroom)
pub const DEFAULT_AMPLITUDE: f32 = 0.5;

/// Sine burst stimulus
///
/// Produces `lead_in` seconds of silence, `burst` seconds of tone with a
/// short raised-cosine fade at each edge, then `tail` seconds of silence.
///
/// # Example
/// ```
/// use loopsync_core::audio::signal::ToneBurst;
///
/// let reference = ToneBurst::new(48000).render();
/// assert_eq!(reference.sample_rate(), 48000);
/// assert_eq!(reference.channels(), 1);
/// ```
#[derive(Debug, Clone)]
pub struct ToneBurst {
    /// Sample rate in Hz
    sample_rate: u32,
    /// Tone frequency in Hz
    frequency: f32,
    /// Peak amplitude
    amplitude: f32,
    /// Silence before the burst, in seconds
    lead_in_secs: f64,
    /// Burst length, in seconds
    burst_secs: f64,
    /// Silence after the burst, in seconds
    tail_secs: f64,
    /// Fade length at each burst edge, in samples
    fade_samples: usize,
}

impl ToneBurst {
    /// 10ms burst of 1kHz, no lead-in, 0.5s tail
    pub fn new(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            frequency: DEFAULT_TONE_HZ,
            amplitude: DEFAULT_AMPLITUDE,
            lead_in_secs: 0.0,
            burst_secs: 0.010,
            tail_secs: 0.5,
            fade_samples: (sample_rate as usize / 2000).max(1), // 0.5ms
        }
    }

    pub fn frequency(mut self, hz: f32) -> Self {
        self.frequency = hz;
        self
    }

    pub fn amplitude(mut self, amplitude: f32) -> Self {
        self.amplitude = amplitude.clamp(0.0, 1.0);
        self
    }

    pub fn lead_in(mut self, secs: f64) -> Self {
        self.lead_in_secs = secs.max(0.0);
        self
    }

    pub fn burst(mut self, secs: f64) -> Self {
        self.burst_secs = secs.max(0.0);
        self
    }

    pub fn tail(mut self, secs: f64) -> Self {
        self.tail_secs = secs.max(0.0);
        self
    }

    /// Frame index of the first burst sample
    pub fn onset_frame(&self) -> usize {
        self.frames(self.lead_in_secs)
    }

    /// Number of burst frames
    pub fn burst_frames(&self) -> usize {
        self.frames(self.burst_secs)
    }

    fn frames(&self, secs: f64) -> usize {
        (self.sample_rate as f64 * secs).round() as usize
    }

    /// Render the stimulus as a mono buffer
    pub fn render(&self) -> AudioStreamBuffer {
        let onset = self.onset_frame();
        let burst = self.burst_frames();
        let total = onset + burst + self.frames(self.tail_secs);

        let mut samples = vec![0.0f32; total];
        let fade = self.fade_samples.min(burst / 2).max(1);
        let step = std::f32::consts::TAU * self.frequency / self.sample_rate.max(1) as f32;

        for i in 0..burst {
            let edge = i.min(burst - 1 - i);
            let gain = if edge < fade {
                0.5 - 0.5 * (std::f32::consts::PI * edge as f32 / fade as f32).cos()
            } else {
                1.0
            };
            samples[onset + i] = (step * i as f32).sin() * self.amplitude * gain;
        }

        AudioStreamBuffer::mono(self.sample_rate, &samples)
    }
}

/// First frame whose absolute mono level reaches `threshold`
///
/// Used to locate burst onsets in captured and rendered audio.
pub fn find_onset(buffer: &AudioStreamBuffer, threshold: f32) -> Option<usize> {
    (0..buffer.frame_len()).find(|&i| buffer.mono_sample(i).abs() >= threshold)
}

/// Same as [`find_onset`] but for one channel of an interleaved buffer
pub fn find_channel_onset(buffer: &AudioStreamBuffer, channel: usize, threshold: f32) -> Option<usize> {
    (0..buffer.frame_len()).find(|&i| {
        buffer
            .frame(i)
            .and_then(|f| f.get(channel))
            .map(|s| s.abs() >= threshold)
            .unwrap_or(false)
    })
}
