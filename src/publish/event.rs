//! # Published Message Schema
//!
//! The wire contract with downstream consumers. Every message is a UTF-8 JSON
//! object with exactly four fields:
//!
//! ```json
//! {"sensor_id": "s1", "coeff": 0.93, "lag": -12, "wav_buffer": "UklGR..."}
//! ```
//!
//! - **sensor_id**: opaque sensor identifier (string)
//! - **coeff**: similarity coefficient (decimal number)
//! - **lag**: best-alignment sample offset (integer)
//! - **wav_buffer**: base64 of a 16 kHz mono 16-bit WAV copy of the original PCM

use serde::{Deserialize, Serialize};

/// One analyzed chunk, ready to publish.
///
/// Created by the analyzer, consumed exactly once by the publisher, then dropped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AnalysisEvent {
    pub sensor_id: String,

    #[serde(rename = "coeff")]
    pub coefficient: f64,

    pub lag: i64,

    #[serde(rename = "wav_buffer")]
    pub encoded_waveform: String,
}

impl AnalysisEvent {
    /// Serialize to the compact JSON wire form.
    pub fn to_json_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}
