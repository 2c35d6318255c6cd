use serde::{Deserialize, Serialize};

/// Phoneme timing unit from the synthesis query.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Mora {
    #[serde(default)]
    pub vowel: Option<String>,
    /// Seconds
    #[serde(default)]
    pub length: f64,
    #[serde(default)]
    pub text: Option<String>,
}

/// What the voice synthesizer sends back for one `voice_text` fragment.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SynthesisResult {
    pub message: String,
    /// Engine query parameters, passed through untouched
    #[serde(default)]
    pub query: serde_json::Value,
    #[serde(default)]
    pub mora_queue: Vec<Mora>,
    #[serde(default)]
    pub speaking_time: f64,
    #[serde(with = "serde_bytes")]
    pub voice: Vec<u8>,
    #[serde(default = "default_audio_format")]
    pub audio_format: String,
}

fn default_audio_format() -> String {
    "audio/wav".to_string()
}

/// One outbound frame worth of synthesized audio plus the mora active at its timestamp.
#[derive(Debug, Clone, PartialEq)]
pub struct SynthesisFrame {
    /// Seconds since the start of this synthesis result
    pub timestamp: f64,
    pub message: String,
    pub mora: Mora,
    /// Set only on the first frame of a mora
    pub new_text: bool,
    /// Interleaved samples in the session's output shape
    pub samples: Vec<i16>,
}

impl SynthesisFrame {
    pub fn telop(&self) -> TelopParams {
        TelopParams {
            timestamp: self.timestamp,
            message: self.message.clone(),
            vowel: self.mora.vowel.clone(),
            text: self.mora.text.clone(),
            length: self.mora.length,
            new_text: self.new_text,
        }
    }
}

/// Caption/viseme payload for `telop_ch`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TelopParams {
    pub timestamp: f64,
    pub message: String,
    pub vowel: Option<String>,
    pub text: Option<String>,
    pub length: f64,
    pub new_text: bool,
}

impl TelopParams {
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_telop_json_fields() {
        let frame = SynthesisFrame {
            timestamp: 0.04,
            message: "こんにちは".into(),
            mora: Mora { vowel: Some("o".into()), length: 0.12, text: Some("コ".into()) },
            new_text: true,
            samples: vec![0; 4],
        };
        let value: serde_json::Value = serde_json::from_str(&frame.telop().to_json()).unwrap();
        assert_eq!(value["vowel"], "o");
        assert_eq!(value["text"], "コ");
        assert_eq!(value["new_text"], true);
        assert!(value.get("samples").is_none());
    }

    #[test]
    fn test_result_voice_is_binary() {
        let result = SynthesisResult {
            message: "hi".into(),
            query: serde_json::json!({"speedScale": 1.0}),
            mora_queue: vec![Mora::default()],
            speaking_time: 0.5,
            voice: vec![1, 2, 3],
            audio_format: "audio/wav".into(),
        };
        let pack = crate::models::to_msgpack(&result).unwrap();
        // bin8 marker followed by the length, not a fixarray of integers
        assert!(pack.windows(2).any(|w| w == [0xc4, 3]));
        let decoded: SynthesisResult = crate::models::from_msgpack(&pack).unwrap();
        assert_eq!(decoded, result);
    }
}
