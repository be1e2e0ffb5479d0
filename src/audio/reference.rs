//! # Reference Signal
//!
//! The fixed audio asset every chunk is compared against. It is loaded exactly once
//! at process start and shared read-only (`Arc<ReferenceSignal>`) by all sessions.
//!
//! ## Loading Rules:
//! - **Sample rate**: Must equal the pipeline rate; there is no resampling
//! - **Channels**: Multi-channel files are down-mixed to mono by averaging frames
//! - **Sample format**: Integer samples are scaled by their own bit depth,
//!   32-bit float samples are taken as-is but must be finite (no NaN or ±inf)
//! - **Failure**: Any problem is a `ReferenceLoadError`, which aborts startup

use crate::analysis::waveform::Waveform;
use crate::audio::format::AudioFormat;
use crate::error::ReferenceLoadError;
use hound::{SampleFormat, WavReader};
use std::io::Read;
use std::path::Path;
use tracing::info;

/// Immutable reference waveform plus the rate it was recorded at.
#[derive(Debug)]
pub struct ReferenceSignal {
    waveform: Waveform,
    sample_rate: u32,
}

impl ReferenceSignal {
    /// Load the reference from a WAV file on disk.
    ///
    /// ## Parameters:
    /// - **path**: Location of the WAV asset
    /// - **format**: Pipeline format the reference must match
    pub fn load<P: AsRef<Path>>(path: P, format: &AudioFormat) -> Result<Self, ReferenceLoadError> {
        let path = path.as_ref();
        let reader = WavReader::open(path)?;
        let reference = Self::from_reader(reader, format)?;

        info!(
            path = %path.display(),
            samples = reference.waveform.len(),
            duration_s = format.duration_seconds(reference.waveform.len()),
            "Reference signal loaded"
        );

        Ok(reference)
    }

    /// Build a reference from any WAV byte source.
    pub fn from_reader<R: Read>(
        mut reader: WavReader<R>,
        format: &AudioFormat,
    ) -> Result<Self, ReferenceLoadError> {
        let spec = reader.spec();

        if spec.sample_rate != format.sample_rate {
            return Err(ReferenceLoadError::RateMismatch {
                found: spec.sample_rate,
                expected: format.sample_rate,
            });
        }

        if spec.channels == 0 {
            return Err(ReferenceLoadError::UnsupportedFormat("zero channels".to_string()));
        }

        let interleaved: Vec<f32> = match spec.sample_format {
            SampleFormat::Int => {
                if spec.bits_per_sample == 0 || spec.bits_per_sample > 32 {
                    return Err(ReferenceLoadError::UnsupportedFormat(format!(
                        "{}-bit integer samples",
                        spec.bits_per_sample
                    )));
                }
                let scale = (1u64 << (spec.bits_per_sample - 1)) as f32;
                reader
                    .samples::<i32>()
                    .map(|s| s.map(|v| v as f32 / scale))
                    .collect::<Result<_, _>>()?
            }
            SampleFormat::Float => {
                if spec.bits_per_sample != 32 {
                    return Err(ReferenceLoadError::UnsupportedFormat(format!(
                        "{}-bit float samples",
                        spec.bits_per_sample
                    )));
                }
                let samples: Vec<f32> = reader.samples::<f32>().collect::<Result<_, _>>()?;
                if let Some(index) = samples.iter().position(|s| !s.is_finite()) {
                    return Err(ReferenceLoadError::UnsupportedFormat(format!(
                        "non-finite float sample at index {}",
                        index
                    )));
                }
                samples
            }
        };

        let mono = downmix(&interleaved, spec.channels as usize);
        if mono.is_empty() {
            return Err(ReferenceLoadError::Empty);
        }

        Ok(Self::from_waveform(Waveform::new(mono), spec.sample_rate))
    }

    /// Wrap an already decoded waveform.
    pub fn from_waveform(waveform: Waveform, sample_rate: u32) -> Self {
        Self { waveform, sample_rate }
    }

    pub fn waveform(&self) -> &Waveform {
        &self.waveform
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }
}

/// Average interleaved frames into one channel. A trailing partial frame is dropped.
fn downmix(interleaved: &[f32], channels: usize) -> Vec<f32> {
    if channels == 1 {
        return interleaved.to_vec();
    }

    interleaved
        .chunks_exact(channels)
        .map(|frame| frame.iter().sum::<f32>() / channels as f32)
        .collect()
}
