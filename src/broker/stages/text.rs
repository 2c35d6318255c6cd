use super::recv_timeout;
use crate::broker::link::{InboundStage, OutboundStage};
use crate::error::PipelineResult;
use crate::models::{self, ChatHistory, ChatMessage, RecognitionResult, TextExchangeRequest, TextExchangeResult};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Turns recognition results into text exchange requests.
///
/// Keeps the conversation history and the user's in-progress message. Every result
/// rewrites that message; a confirmed one moves it into the history and starts a new one.
pub struct TextSender {
    recognitions: mpsc::Receiver<RecognitionResult>,
    captions: mpsc::UnboundedSender<ChatMessage>,
    history: ChatHistory,
    current: ChatMessage,
}

impl TextSender {
    pub fn new(recognitions: mpsc::Receiver<RecognitionResult>, captions: mpsc::UnboundedSender<ChatMessage>) -> Self {
        Self {
            recognitions,
            captions,
            history: ChatHistory::default(),
            current: ChatMessage::user(),
        }
    }

    pub fn request_for(&mut self, result: &RecognitionResult) -> TextExchangeRequest {
        self.current.message = result.result_text();
        if result.confirmed {
            self.history.push(self.current.clone());
            info!(history_len = self.history.len(), message = %self.current.message, "User message confirmed");
        }

        let request = TextExchangeRequest {
            session_id: result.session_id.clone(),
            speech_id: result.speech_id,
            sequence_id: result.sequence_id,
            confirmed: result.confirmed,
            history: self.history.clone(),
            request_message: self.current.clone(),
        };

        if result.confirmed {
            self.current = ChatMessage::user();
        }
        request
    }
}

impl OutboundStage for TextSender {
    async fn next_message(&mut self, wait: Duration) -> PipelineResult<Option<Vec<u8>>> {
        let Some(result) = recv_timeout(&mut self.recognitions, wait).await? else {
            return Ok(None);
        };

        let request = self.request_for(&result);
        // The caption consumer only goes away with the broker
        let _ = self.captions.send(request.request_message.clone());
        models::to_msgpack(&request).map(Some)
    }
}

/// Forwards every result to the synthesizer queue and its reply text to the captions.
pub struct TextReceiver {
    captions: mpsc::UnboundedSender<ChatMessage>,
}

impl TextReceiver {
    pub fn new(captions: mpsc::UnboundedSender<ChatMessage>) -> Self {
        Self { captions }
    }
}

impl InboundStage for TextReceiver {
    type Item = TextExchangeResult;

    fn decode(&mut self, pack: &[u8]) -> PipelineResult<Vec<TextExchangeResult>> {
        let result: TextExchangeResult = models::from_msgpack(pack)?;
        debug!(
            speech_id = result.speech_id,
            end_of_response = result.end_of_response,
            voice_text = ?result.voice_text,
            "Text exchange result"
        );
        if let Some(response) = &result.response_message {
            let _ = self.captions.send(response.clone());
        }
        Ok(vec![result])
    }
}
