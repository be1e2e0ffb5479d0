//! # Audio Formats and Codecs
//!
//! Byte-level handling of sensor audio, independent of any analysis.
//!
//! ## Key Components:
//! - **format**: The fixed pipeline format (16 kHz, mono, 16-bit)
//! - **codec**: Raw PCM decoding and WAV re-encoding for transport
//! - **reference**: Loading the process-wide reference signal from a WAV file
//!
//! ## Audio Format Requirements:
//! - **Sample Rate**: 16kHz (16,000 Hz)
//! - **Bit Depth**: 16-bit PCM
//! - **Channels**: Mono (1 channel)
//! - **Encoding**: Little-endian signed integers

pub mod codec;
pub mod format;
pub mod reference;
