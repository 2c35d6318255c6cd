use super::recv_timeout;
use crate::broker::link::{InboundStage, OutboundStage};
use crate::error::PipelineResult;
use crate::models::{self, ExtractionResult, RecognitionResult};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::debug;

/// Merge queued fragments of one utterance into a single request.
///
/// Voice buffers are concatenated in order and the latest `sequence_id` is kept.
/// Draining stops right after a `confirmed` fragment so the marker is never lost
/// and the next utterance is never pulled in.
pub fn coalesce_extractions(
    first: ExtractionResult,
    mut next: impl FnMut() -> Option<ExtractionResult>,
) -> ExtractionResult {
    let mut merged = first;
    while !merged.confirmed {
        let Some(fragment) = next() else { break };
        merged.append_voice(&fragment.voice);
        merged.sequence_id = fragment.sequence_id;
        merged.confirmed = fragment.confirmed;
    }
    merged
}

pub struct RecognizerSender {
    extractions: mpsc::Receiver<ExtractionResult>,
}

impl RecognizerSender {
    pub fn new(extractions: mpsc::Receiver<ExtractionResult>) -> Self {
        Self { extractions }
    }
}

impl OutboundStage for RecognizerSender {
    async fn next_message(&mut self, wait: Duration) -> PipelineResult<Option<Vec<u8>>> {
        let Some(first) = recv_timeout(&mut self.extractions, wait).await? else {
            return Ok(None);
        };

        let merged = coalesce_extractions(first, || self.extractions.try_recv().ok());
        debug!(
            speech_id = merged.speech_id,
            sequence_id = merged.sequence_id,
            confirmed = merged.confirmed,
            "Sending coalesced extraction"
        );
        models::to_msgpack(&merged).map(Some)
    }
}

#[derive(Default)]
pub struct RecognizerReceiver;

impl InboundStage for RecognizerReceiver {
    type Item = RecognitionResult;

    fn decode(&mut self, pack: &[u8]) -> PipelineResult<Vec<RecognitionResult>> {
        let result: RecognitionResult = models::from_msgpack(pack)?;
        debug!(speech_id = result.speech_id, text = %result.result_text(), "Recognition result");
        Ok(vec![result])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    fn fragment(sequence_id: u64, voice: &[u8], confirmed: bool) -> ExtractionResult {
        ExtractionResult {
            session_id: "s".into(),
            speech_id: 4,
            sequence_id,
            start_at: 1.0,
            confirmed,
            voice: voice.to_vec(),
            voice_dtype: "int16".into(),
            voice_sampling_rate: 16_000,
            voice_sample_bytes: 2,
            voice_channels: 1,
        }
    }

    #[test]
    fn test_coalesce_concatenates_until_confirmed() {
        let mut queue: VecDeque<_> = vec![
            fragment(2, &[3, 4], false),
            fragment(3, &[5, 6], true),
            fragment(1, &[9, 9], false),
        ]
        .into();
        let first = fragment(1, &[1, 2], false);

        let merged = coalesce_extractions(first, || queue.pop_front());
        assert_eq!(merged.voice, vec![1, 2, 3, 4, 5, 6]);
        assert_eq!(merged.sequence_id, 3);
        assert!(merged.confirmed);
        // The following utterance stays queued
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_coalesce_confirmed_first_takes_nothing() {
        let mut calls = 0;
        let merged = coalesce_extractions(fragment(7, &[1], true), || {
            calls += 1;
            None
        });
        assert_eq!(calls, 0);
        assert_eq!(merged.voice, vec![1]);
    }

    #[test]
    fn test_coalesce_partial_when_queue_runs_dry() {
        let mut queue: VecDeque<_> = vec![fragment(2, &[2], false)].into();
        let merged = coalesce_extractions(fragment(1, &[1], false), || queue.pop_front());
        assert_eq!(merged.voice, vec![1, 2]);
        assert!(!merged.confirmed);
    }

    #[tokio::test]
    async fn test_sender_idles_on_empty_queue() {
        let (_tx, rx) = mpsc::channel(10);
        let mut sender = RecognizerSender::new(rx);
        let message = sender.next_message(Duration::from_millis(10)).await.unwrap();
        assert!(message.is_none());
    }
}
