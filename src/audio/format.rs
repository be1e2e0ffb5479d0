//! # Pipeline Audio Format
//!
//! Every chunk and the reference signal share one fixed format. It is modelled as
//! a single immutable value instead of literals scattered across the pipeline.
//!
//! ## Audio Format:
//! - **Sample Rate**: 16kHz (16,000 Hz)
//! - **Bit Depth**: 16-bit PCM, little-endian signed integers
//! - **Channels**: Mono (1 channel)

use serde::Serialize;

/// Format of the audio flowing through the analysis pipeline.
///
/// ## Rust Concepts:
/// - **Copy**: Three small integers, so the struct is passed by value
/// - **const**: `PIPELINE` is evaluated at compile time and never changes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AudioFormat {
    /// Samples per second
    pub sample_rate: u32,

    /// Number of interleaved channels
    pub channels: u16,

    /// Bits per sample
    pub bits_per_sample: u16,
}

impl AudioFormat {
    /// The format every sensor streams and the reference is stored in.
    pub const PIPELINE: AudioFormat = AudioFormat {
        sample_rate: 16000,
        channels: 1,
        bits_per_sample: 16,
    };

    /// Magnitude that maps to 1.0 when converting integer samples to floats.
    ///
    /// ## Example:
    /// 16-bit audio has a full scale of 32768, so `i16::MIN` becomes exactly -1.0.
    pub fn full_scale(&self) -> f32 {
        (1u32 << (self.bits_per_sample - 1)) as f32
    }

    /// Bytes occupied by one sample of one channel.
    pub fn bytes_per_sample(&self) -> usize {
        (self.bits_per_sample / 8) as usize
    }

    /// Duration in seconds of `samples` mono samples at this rate.
    pub fn duration_seconds(&self, samples: usize) -> f64 {
        samples as f64 / self.sample_rate as f64
    }
}

impl Default for AudioFormat {
    fn default() -> Self {
        Self::PIPELINE
    }
}
