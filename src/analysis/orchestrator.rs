//! # Analysis Orchestrator
//!
//! Turns one inbound chunk into one `AnalysisEvent`:
//!
//! 1. **Decode** the raw PCM bytes at the pipeline format
//! 2. **Check** that the decoded rate matches the reference rate
//! 3. **Correlate** the candidate against the shared reference
//! 4. **Re-encode** the *original* (not normalized) PCM as base64 WAV
//! 5. **Assemble** the event
//!
//! There is no retry logic here. A chunk that fails to decode or correlate will
//! fail the same way again, so the caller simply logs it and moves on.

use crate::analysis::correlation::correlate;
use crate::analysis::waveform::Waveform;
use crate::audio::codec::{decode_pcm, encode_wav_base64};
use crate::audio::format::AudioFormat;
use crate::audio::reference::ReferenceSignal;
use crate::error::AnalysisError;
use crate::publish::event::AnalysisEvent;
use std::sync::Arc;
use tracing::debug;

/// Raw sensor audio exactly as it arrived on the transport.
///
/// Owned by the call that received it and dropped after analysis.
#[derive(Debug, Clone, PartialEq)]
pub struct SampleBuffer {
    /// Opaque sensor identifier
    pub sensor_id: String,

    /// 16-bit little-endian mono PCM bytes
    pub pcm: Vec<u8>,
}

impl SampleBuffer {
    pub fn new(sensor_id: impl Into<String>, pcm: Vec<u8>) -> Self {
        Self {
            sensor_id: sensor_id.into(),
            pcm,
        }
    }
}

/// Per-chunk analysis against the process-wide reference.
///
/// ## Thread Safety:
/// Holds only immutable data, so one instance is shared by every session worker
/// through an `Arc` without locking.
#[derive(Debug, Clone)]
pub struct Analyzer {
    format: AudioFormat,
    reference: Arc<ReferenceSignal>,
}

impl Analyzer {
    pub fn new(format: AudioFormat, reference: Arc<ReferenceSignal>) -> Self {
        Self { format, reference }
    }

    pub fn format(&self) -> &AudioFormat {
        &self.format
    }

    pub fn reference(&self) -> &ReferenceSignal {
        &self.reference
    }

    /// Analyze one chunk.
    ///
    /// ## Returns:
    /// - **Ok(AnalysisEvent)**: Correlation result plus the encoded original audio
    /// - **Err(AnalysisError::Decode)**: The PCM bytes are not valid audio
    /// - **Err(AnalysisError::RateMismatch)**: Decoded rate differs from the reference
    /// - **Err(AnalysisError::Encode)**: The WAV copy could not be produced
    pub fn analyze(&self, buffer: SampleBuffer) -> Result<AnalysisEvent, AnalysisError> {
        let samples = decode_pcm(&buffer.pcm, &self.format)?;

        // Raw PCM carries no header, so the decode path yields the pipeline rate
        let decoded_rate = self.format.sample_rate;
        if decoded_rate != self.reference.sample_rate() {
            return Err(AnalysisError::RateMismatch {
                chunk: decoded_rate,
                reference: self.reference.sample_rate(),
            });
        }

        let candidate = Waveform::from_pcm(&samples, &self.format);
        let result = correlate(&candidate, self.reference.waveform());

        debug!(
            sensor_id = %buffer.sensor_id,
            samples = samples.len(),
            coefficient = result.coefficient,
            lag = result.lag,
            "Chunk correlated"
        );

        let encoded_waveform = encode_wav_base64(&samples, &self.format)?;

        Ok(AnalysisEvent {
            sensor_id: buffer.sensor_id,
            coefficient: result.coefficient,
            lag: result.lag,
            encoded_waveform,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use std::io::Cursor;

    fn tone(len: usize) -> Vec<i16> {
        // Frequency sweep so every alignment is distinct
        (0..len)
            .map(|i| {
                let t = i as f32 / 16000.0;
                ((2.0 * std::f32::consts::PI * (200.0 + 3000.0 * t) * t).sin() * 12000.0) as i16
            })
            .collect()
    }

    fn to_bytes(samples: &[i16]) -> Vec<u8> {
        samples.iter().flat_map(|s| s.to_le_bytes()).collect()
    }

    fn analyzer_for(reference: &[i16], sample_rate: u32) -> Analyzer {
        let format = AudioFormat::PIPELINE;
        let waveform = Waveform::from_pcm(reference, &format);
        Analyzer::new(format, Arc::new(ReferenceSignal::from_waveform(waveform, sample_rate)))
    }

    #[test]
    fn test_analyze_reports_delay() {
        let reference = tone(800);
        let analyzer = analyzer_for(&reference, 16000);

        let mut chunk = vec![0i16; 25];
        chunk.extend_from_slice(&reference);
        let event = analyzer.analyze(SampleBuffer::new("s1", to_bytes(&chunk))).unwrap();

        assert_eq!(event.sensor_id, "s1");
        assert_eq!(event.lag, 25);
        assert!(event.coefficient > 0.99, "coefficient {}", event.coefficient);
    }

    #[test]
    fn test_event_carries_original_pcm() {
        let reference = tone(400);
        let analyzer = analyzer_for(&reference, 16000);

        // Quiet chunk: normalization must not leak into the encoded copy
        let chunk: Vec<i16> = reference.iter().map(|s| s / 8).collect();
        let event = analyzer.analyze(SampleBuffer::new("s2", to_bytes(&chunk))).unwrap();

        let wav = STANDARD.decode(&event.encoded_waveform).unwrap();
        let mut reader = hound::WavReader::new(Cursor::new(wav)).unwrap();
        assert_eq!(reader.spec().sample_rate, 16000);
        assert_eq!(reader.spec().channels, 1);
        let decoded: Vec<i16> = reader.samples::<i16>().map(|s| s.unwrap()).collect();
        assert_eq!(decoded, chunk);
    }

    #[test]
    fn test_malformed_chunk_is_decode_error() {
        let analyzer = analyzer_for(&tone(100), 16000);
        let err = analyzer.analyze(SampleBuffer::new("s1", vec![1, 2, 3])).unwrap_err();
        assert!(matches!(err, AnalysisError::Decode(_)));
    }

    #[test]
    fn test_rate_mismatch_detected() {
        let analyzer = analyzer_for(&tone(100), 8000);
        let err = analyzer
            .analyze(SampleBuffer::new("s1", to_bytes(&tone(100))))
            .unwrap_err();
        assert!(matches!(
            err,
            AnalysisError::RateMismatch { chunk: 16000, reference: 8000 }
        ));
    }
}
