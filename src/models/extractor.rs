use serde::{Deserialize, Serialize};

/// First record on an extractor link, describing the raw PCM that follows.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExtractorInit {
    pub session_id: String,
    pub start_at: f64,
    pub voice_sampling_rate: u32,
    pub voice_sample_bytes: u32,
    pub voice_channels: u32,
}

impl ExtractorInit {
    /// 16 kHz, 16-bit, mono: the canonical pipeline input format.
    pub fn new(session_id: &str) -> Self {
        Self {
            session_id: session_id.to_string(),
            start_at: super::unix_time(),
            voice_sampling_rate: 16_000,
            voice_sample_bytes: 2,
            voice_channels: 1,
        }
    }
}

/// A chunk of detected speech.
///
/// `speech_id` identifies one utterance; `confirmed` is set on its last chunk only.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExtractionResult {
    pub session_id: String,
    #[serde(default)]
    pub speech_id: u64,
    #[serde(default)]
    pub sequence_id: u64,
    pub start_at: f64,
    #[serde(default)]
    pub confirmed: bool,
    /// Little-endian PCM bytes in `voice_dtype`
    #[serde(with = "serde_bytes", default)]
    pub voice: Vec<u8>,
    #[serde(default = "default_dtype")]
    pub voice_dtype: String,
    #[serde(default = "default_rate")]
    pub voice_sampling_rate: u32,
    #[serde(default = "default_sample_bytes")]
    pub voice_sample_bytes: u32,
    #[serde(default = "default_channels")]
    pub voice_channels: u32,
}

fn default_dtype() -> String {
    "int16".to_string()
}

fn default_rate() -> u32 {
    16_000
}

fn default_sample_bytes() -> u32 {
    2
}

fn default_channels() -> u32 {
    1
}

impl ExtractionResult {
    pub fn append_voice(&mut self, voice: &[u8]) {
        self.voice.extend_from_slice(voice);
    }

}
