use crate::audio::FrameBuffer;
use crate::broker::link::{InboundStage, OutboundStage};
use crate::error::{PipelineError, PipelineResult};
use crate::models::{self, ExtractionResult, ExtractorInit};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Sends the init record, then raw PCM chunks from the frame buffer.
pub struct ExtractorSender {
    init: Option<ExtractorInit>,
    frames: Arc<FrameBuffer>,
}

impl ExtractorSender {
    pub fn new(session_id: &str, frames: Arc<FrameBuffer>) -> Self {
        Self {
            init: Some(ExtractorInit::new(session_id)),
            frames,
        }
    }
}

impl OutboundStage for ExtractorSender {
    fn handshake(&mut self) -> PipelineResult<Option<Vec<u8>>> {
        self.init.take().map(|init| models::to_msgpack(&init)).transpose()
    }

    async fn next_message(&mut self, wait: Duration) -> PipelineResult<Option<Vec<u8>>> {
        Ok(self.frames.pop_timeout(wait).await)
    }
}

/// Identity rules for the extractor's output stream.
///
/// - `speech_id` never decreases and only moves on after a `confirmed` result
/// - `sequence_id` never decreases within one `speech_id`
/// - `confirmed` closes a `speech_id`; nothing may follow it under the same id
#[derive(Debug, Default)]
pub struct UtteranceTracker {
    speech_id: Option<u64>,
    sequence_id: u64,
    confirmed: bool,
}

impl UtteranceTracker {
    pub fn check(&mut self, result: &ExtractionResult) -> PipelineResult<()> {
        if let Some(current) = self.speech_id {
            if result.speech_id < current {
                return Err(violation(format!(
                    "speech_id went back from {} to {}",
                    current, result.speech_id
                )));
            }
            if result.speech_id == current {
                if self.confirmed {
                    return Err(violation(format!("speech_id {} continued after confirmation", current)));
                }
                if result.sequence_id < self.sequence_id {
                    return Err(violation(format!(
                        "sequence_id went back from {} to {} in speech {}",
                        self.sequence_id, result.sequence_id, current
                    )));
                }
            } else if !self.confirmed {
                return Err(violation(format!(
                    "speech_id advanced to {} before {} was confirmed",
                    result.speech_id, current
                )));
            }
        }

        self.speech_id = Some(result.speech_id);
        self.sequence_id = result.sequence_id;
        self.confirmed = result.confirmed;
        Ok(())
    }
}

fn violation(message: String) -> PipelineError {
    PipelineError::ProtocolViolation(message)
}

#[derive(Default)]
pub struct ExtractorReceiver {
    tracker: UtteranceTracker,
}

impl InboundStage for ExtractorReceiver {
    type Item = ExtractionResult;

    fn decode(&mut self, pack: &[u8]) -> PipelineResult<Vec<ExtractionResult>> {
        let result: ExtractionResult = models::from_msgpack(pack)?;
        self.tracker.check(&result)?;
        debug!(
            speech_id = result.speech_id,
            sequence_id = result.sequence_id,
            confirmed = result.confirmed,
            bytes = result.voice.len(),
            "Extraction result"
        );
        Ok(vec![result])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(speech_id: u64, sequence_id: u64, confirmed: bool) -> ExtractionResult {
        ExtractionResult {
            session_id: "s".into(),
            speech_id,
            sequence_id,
            start_at: 0.0,
            confirmed,
            voice: vec![0; 4],
            voice_dtype: "int16".into(),
            voice_sampling_rate: 16_000,
            voice_sample_bytes: 2,
            voice_channels: 1,
        }
    }

    #[test]
    fn test_tracker_accepts_well_formed_stream() {
        let mut tracker = UtteranceTracker::default();
        for r in [
            result(0, 1, false),
            result(0, 2, false),
            result(0, 2, true),
            result(1, 1, false),
            result(1, 3, true),
        ] {
            tracker.check(&r).unwrap();
        }
    }

    #[test]
    fn test_tracker_rejects_broken_identity() {
        let mut tracker = UtteranceTracker::default();
        tracker.check(&result(0, 2, false)).unwrap();
        assert!(tracker.check(&result(1, 1, false)).is_err());

        let mut tracker = UtteranceTracker::default();
        tracker.check(&result(0, 2, false)).unwrap();
        assert!(tracker.check(&result(0, 1, false)).is_err());

        let mut tracker = UtteranceTracker::default();
        tracker.check(&result(3, 1, true)).unwrap();
        assert!(tracker.check(&result(3, 2, false)).is_err());
        assert!(tracker.check(&result(2, 1, false)).is_err());
    }

    #[test]
    fn test_handshake_is_sent_once() {
        let mut sender = ExtractorSender::new("abc", Arc::new(FrameBuffer::new(4)));
        let first = sender.handshake().unwrap().unwrap();
        let init: ExtractorInit = models::from_msgpack(&first).unwrap();
        assert_eq!(init.voice_sampling_rate, 16_000);
        assert_eq!(init.voice_channels, 1);
        assert!(sender.handshake().unwrap().is_none());
    }
}
