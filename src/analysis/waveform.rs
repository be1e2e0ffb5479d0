//! Floating-point waveform shared by the normalizer and the correlation engine.

use crate::audio::format::AudioFormat;

/// Ordered floating-point samples, nominally in [-1.0, 1.0].
///
/// ## Ownership:
/// Candidate waveforms are built per chunk and dropped once the chunk is analyzed.
/// The reference waveform is built once at startup and only ever borrowed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Waveform {
    samples: Vec<f32>,
}

impl Waveform {
    pub fn new(samples: Vec<f32>) -> Self {
        Self { samples }
    }

    /// Scale integer PCM samples from the format's full range into [-1.0, 1.0].
    ///
    /// ## Conversion:
    /// For 16-bit audio every sample is divided by 32768.
    pub fn from_pcm(pcm: &[i16], format: &AudioFormat) -> Self {
        let scale = format.full_scale();
        Self {
            samples: pcm.iter().map(|&sample| sample as f32 / scale).collect(),
        }
    }

    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Largest absolute sample value, 0.0 for an empty waveform.
    pub fn peak(&self) -> f32 {
        self.samples.iter().fold(0.0f32, |peak, s| peak.max(s.abs()))
    }

    /// Euclidean (L2) norm, accumulated in f64.
    pub fn l2_norm(&self) -> f64 {
        self.samples
            .iter()
            .map(|&s| (s as f64) * (s as f64))
            .sum::<f64>()
            .sqrt()
    }
}

impl From<Vec<f32>> for Waveform {
    fn from(samples: Vec<f32>) -> Self {
        Self::new(samples)
    }
}
