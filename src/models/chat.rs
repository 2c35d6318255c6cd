use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Speaker name used for messages the server itself produces.
pub const SYSTEM_SPEAKER_NAME: &str = "Sincromisor";

/// One chat line shown in the browser UI.
///
/// `message_type` affects how the UI renders the line: `system`, `error`, `reset`,
/// `user`, or whatever the text processor uses for its own replies.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatMessage {
    #[serde(default = "new_message_id")]
    pub message_id: String,
    pub message_type: String,
    pub speaker_id: String,
    pub speaker_name: String,
    #[serde(default)]
    pub message: String,
    #[serde(default = "super::unix_time")]
    pub created_at: f64,
}

fn new_message_id() -> String {
    Uuid::now_v7().to_string()
}

impl ChatMessage {
    pub fn new(message_type: &str, speaker_id: &str, speaker_name: &str, message: impl Into<String>) -> Self {
        Self {
            message_id: new_message_id(),
            message_type: message_type.to_string(),
            speaker_id: speaker_id.to_string(),
            speaker_name: speaker_name.to_string(),
            message: message.into(),
            created_at: super::unix_time(),
        }
    }

    /// Empty in-progress utterance of the user.
    pub fn user() -> Self {
        Self::new("user", "user", "User", "")
    }

    /// Error line from the server, used when a session dies before the user hears anything.
    pub fn system_error(message: impl Into<String>) -> Self {
        Self::new("error", "system", SYSTEM_SPEAKER_NAME, message)
    }

    /// JSON payload for the `text_ch` data channel.
    pub fn to_json(&self) -> String {
        // A struct of strings and floats always serializes
        serde_json::to_string(self).unwrap_or_default()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ChatHistory {
    #[serde(default)]
    pub messages: Vec<ChatMessage>,
}

impl ChatHistory {
    pub fn push(&mut self, message: ChatMessage) {
        self.messages.push(message);
    }

    pub fn last(&self) -> Option<&ChatMessage> {
        self.messages.last()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }
}
