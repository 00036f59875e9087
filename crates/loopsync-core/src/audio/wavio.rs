//! WAV file I/O for the reference asset, tap captures, and render results
//!
//! Everything written here is 32-bit float WAV. Reading accepts integer PCM
//! of any bit depth hound supports, plus 32-bit float.

use std::fs::{self, File};
use std::io::BufWriter;
use std::path::{Path, PathBuf};

use super::buffer::AudioStreamBuffer;
use crate::error::{Result, SyncError};

/// Decode a WAV file into an interleaved f32 buffer
pub fn read_audio_file(path: &Path) -> Result<AudioStreamBuffer> {
    let io_err = |e: hound::Error| SyncError::Io(format!("{}: {}", path.display(), e));

    let mut reader = hound::WavReader::open(path).map_err(io_err)?;
    let spec = reader.spec();

    let samples: Vec<f32> = match (spec.sample_format, spec.bits_per_sample) {
        (hound::SampleFormat::Float, 32) => reader
            .samples::<f32>()
            .collect::<std::result::Result<_, _>>()
            .map_err(io_err)?,
        (hound::SampleFormat::Int, bits) if (1..=32).contains(&bits) => {
            let scale = (1u64 << (bits - 1)) as f32;
            reader
                .samples::<i32>()
                .map(|s| s.map(|v| v as f32 / scale))
                .collect::<std::result::Result<_, _>>()
                .map_err(io_err)?
        }
        (format, bits) => {
            return Err(SyncError::Io(format!(
                "{}: unsupported sample format {:?} at {} bits",
                path.display(),
                format,
                bits
            )))
        }
    };

    tracing::debug!(
        path = %path.display(),
        sample_rate = spec.sample_rate,
        channels = spec.channels,
        samples = samples.len(),
        "Decoded audio file"
    );

    AudioStreamBuffer::from_interleaved(spec.sample_rate, spec.channels, samples)
}

/// Write a buffer as 32-bit float WAV, replacing any existing file
pub fn write_audio_file(path: &Path, buffer: &AudioStreamBuffer) -> Result<()> {
    let io_err = |e: hound::Error| SyncError::Io(format!("{}: {}", path.display(), e));

    let mut writer =
        WavFileWriter::create(path, buffer.sample_rate(), buffer.channels()).map_err(io_err)?;
    writer.write(buffer.samples()).map_err(io_err)?;
    writer.finalize().map_err(io_err)?;
    Ok(())
}

/// Remove `path` if present. Returns whether a file was removed.
pub fn delete_if_exists(path: &Path) -> Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => {
            tracing::debug!(path = %path.display(), "Removed previous file");
            Ok(true)
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(SyncError::Io(format!("{}: {}", path.display(), e))),
    }
}

/// Incremental float WAV writer
///
/// Used by the capture recorder to stream tap data to disk and by the
/// renderer to append one block at a time.
pub struct WavFileWriter {
    path: PathBuf,
    channels: u16,
    writer: hound::WavWriter<BufWriter<File>>,
    frames_written: u64,
}

impl WavFileWriter {
    /// Create (or truncate) `path` with the given format
    pub fn create(path: &Path, sample_rate: u32, channels: u16) -> hound::Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let spec = hound::WavSpec {
            channels,
            sample_rate,
            bits_per_sample: 32,
            sample_format: hound::SampleFormat::Float,
        };
        let writer = hound::WavWriter::create(path, spec)?;

        Ok(Self {
            path: path.to_path_buf(),
            channels,
            writer,
            frames_written: 0,
        })
    }

    /// Append interleaved samples
    pub fn write(&mut self, samples: &[f32]) -> hound::Result<()> {
        for &sample in samples {
            self.writer.write_sample(sample)?;
        }
        self.frames_written += (samples.len() / self.channels.max(1) as usize) as u64;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn frames_written(&self) -> u64 {
        self.frames_written
    }

    /// Patch the header and flush. Returns the number of frames written.
    pub fn finalize(self) -> hound::Result<u64> {
        let frames = self.frames_written;
        self.writer.finalize()?;
        Ok(frames)
    }
}
