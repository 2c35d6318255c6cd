use serde::{Deserialize, Serialize};

/// Sentence-end marker emitted by the recognizer; never shown to the user.
pub const SENTENCE_END: &str = "</s>";

/// Recognized text fragments for one coalesced extraction.
///
/// `result` holds `(text, confidence)` pairs in order, for example
/// `[("こんにちは", 0.387), ("。", 0.998), ("</s>", 1.0)]`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RecognitionResult {
    pub session_id: String,
    pub speech_id: u64,
    pub sequence_id: u64,
    pub start_at: f64,
    #[serde(default)]
    pub confirmed: bool,
    #[serde(default)]
    pub result: Vec<(String, f64)>,
}

impl RecognitionResult {
    pub fn result_text(&self) -> String {
        self.result
            .iter()
            .filter(|(text, _)| text != SENTENCE_END)
            .map(|(text, _)| text.as_str())
            .collect()
    }
}
