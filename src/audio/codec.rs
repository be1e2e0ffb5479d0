//! # PCM Decoding and WAV Encoding
//!
//! Converts between the three representations a chunk passes through:
//!
//! - **Raw PCM bytes**: what the sensor sends (16-bit little-endian, mono)
//! - **Integer samples**: `Vec<i16>`, the decoded form used for correlation
//! - **WAV container**: a self-describing copy of the original audio, base64
//!   encoded so it can travel inside a JSON message
//!
//! ## Validation Checks:
//! 1. **Data length**: Must be non-empty
//! 2. **Alignment**: Must be a whole number of 16-bit samples

use crate::audio::format::AudioFormat;
use crate::error::AnalysisError;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use byteorder::{LittleEndian, ReadBytesExt};
use hound::{SampleFormat, WavSpec, WavWriter};
use std::io::Cursor;

/// Decode raw PCM bytes into signed samples.
///
/// ## Parameters:
/// - **data**: Raw bytes exactly as received from the sensor
/// - **format**: Expected layout (only 16-bit integer PCM is understood)
///
/// ## Returns:
/// - **Ok(Vec<i16>)**: One entry per sample, in arrival order
/// - **Err(AnalysisError::Decode)**: Empty, misaligned, or unsupported data
pub fn decode_pcm(data: &[u8], format: &AudioFormat) -> Result<Vec<i16>, AnalysisError> {
    if format.bits_per_sample != 16 {
        return Err(AnalysisError::Decode(format!(
            "unsupported bit depth {}",
            format.bits_per_sample
        )));
    }

    if data.is_empty() {
        return Err(AnalysisError::Decode("chunk contains no audio data".to_string()));
    }

    let sample_width = format.bytes_per_sample();
    if data.len() % sample_width != 0 {
        return Err(AnalysisError::Decode(format!(
            "{} bytes is not a whole number of {}-bit samples",
            data.len(),
            format.bits_per_sample
        )));
    }

    let mut samples = vec![0i16; data.len() / sample_width];
    Cursor::new(data)
        .read_i16_into::<LittleEndian>(&mut samples)
        .map_err(|e| AnalysisError::Decode(e.to_string()))?;

    Ok(samples)
}

/// Wrap samples in a canonical RIFF/WAVE container.
pub fn encode_wav(samples: &[i16], format: &AudioFormat) -> Result<Vec<u8>, hound::Error> {
    let spec = WavSpec {
        channels: format.channels,
        sample_rate: format.sample_rate,
        bits_per_sample: format.bits_per_sample,
        sample_format: SampleFormat::Int,
    };

    let mut bytes = Vec::with_capacity(44 + samples.len() * format.bytes_per_sample());
    {
        let mut writer = WavWriter::new(Cursor::new(&mut bytes), spec)?;
        for &sample in samples {
            writer.write_sample(sample)?;
        }
        writer.finalize()?;
    }

    Ok(bytes)
}

/// WAV-encode and then base64-encode (standard alphabet, padded) for transport.
pub fn encode_wav_base64(samples: &[i16], format: &AudioFormat) -> Result<String, hound::Error> {
    let wav = encode_wav(samples, format)?;
    Ok(STANDARD.encode(wav))
}
