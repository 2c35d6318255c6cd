use super::recv_timeout;
use crate::audio::FrameShape;
use crate::broker::link::{InboundStage, OutboundStage};
use crate::broker::synthesis::split_voice;
use crate::error::PipelineResult;
use crate::models::{self, SynthesisFrame, SynthesisResult, TextExchangeResult};
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

pub struct SynthesizerSender {
    texts: tokio::sync::mpsc::Receiver<TextExchangeResult>,
}

impl SynthesizerSender {
    pub fn new(texts: tokio::sync::mpsc::Receiver<TextExchangeResult>) -> Self {
        Self { texts }
    }
}

impl OutboundStage for SynthesizerSender {
    async fn next_message(&mut self, wait: Duration) -> PipelineResult<Option<Vec<u8>>> {
        let Some(result) = recv_timeout(&mut self.texts, wait).await? else {
            return Ok(None);
        };
        info!(voice_text = ?result.voice_text, end_of_response = result.end_of_response, "Send to synthesizer");
        models::to_msgpack(&result).map(Some)
    }
}

/// Splits every synthesis result into frames shaped like the session's current output.
pub struct SynthesizerReceiver {
    shape: Arc<RwLock<FrameShape>>,
}

impl SynthesizerReceiver {
    pub fn new(shape: Arc<RwLock<FrameShape>>) -> Self {
        Self { shape }
    }
}

impl InboundStage for SynthesizerReceiver {
    type Item = SynthesisFrame;

    fn decode(&mut self, pack: &[u8]) -> PipelineResult<Vec<SynthesisFrame>> {
        let result: SynthesisResult = models::from_msgpack(pack)?;
        let shape = *self.shape.read();
        let message = result.message.clone();
        let frames = split_voice(result, shape)?;
        debug!(message = %message, frames = frames.len(), "Synthesized voice split");
        Ok(frames)
    }
}
