use super::chat::{ChatHistory, ChatMessage};
use serde::{Deserialize, Serialize};

/// Request sent to the text processor for every recognition result, complete or not.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TextExchangeRequest {
    pub session_id: String,
    pub speech_id: u64,
    pub sequence_id: u64,
    pub confirmed: bool,
    pub history: ChatHistory,
    pub request_message: ChatMessage,
}

/// One step of the text processor's streamed reply.
///
/// The stream for one request ends with a result whose `end_of_response` is true.
/// `voice_text` carries a sentence-sized fragment not yet sent to synthesis.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TextExchangeResult {
    pub session_id: String,
    #[serde(default)]
    pub speech_id: u64,
    #[serde(default)]
    pub sequence_id: u64,
    #[serde(default)]
    pub confirmed: bool,
    #[serde(default)]
    pub history: ChatHistory,
    pub request_message: ChatMessage,
    #[serde(default)]
    pub response_message: Option<ChatMessage>,
    #[serde(default)]
    pub end_of_response: bool,
    #[serde(default)]
    pub voice_text: Option<String>,
}
