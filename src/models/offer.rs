use serde::{Deserialize, Serialize};

/// Selects the text processor backend and the extractor's silence threshold.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TalkMode {
    #[default]
    Chat,
    Sincro,
}

impl TalkMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            TalkMode::Chat => "chat",
            TalkMode::Sincro => "sincro",
        }
    }

    /// Silence that closes an utterance. Sincro mode answers faster.
    pub fn max_silence_ms(&self) -> u32 {
        match self {
            TalkMode::Chat => 1000,
            TalkMode::Sincro => 600,
        }
    }
}

/// Body of `POST /offer`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionOffer {
    pub sdp: String,
    #[serde(rename = "type")]
    pub sdp_type: String,
    #[serde(default)]
    pub talk_mode: TalkMode,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionAnswer {
    pub sdp: String,
    #[serde(rename = "type")]
    pub sdp_type: String,
    pub session_id: String,
}
