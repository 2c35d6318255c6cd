//! The four stage pairs a broker plugs into its worker links.

pub mod extractor;
pub mod recognizer;
pub mod synthesizer;
pub mod text;

pub use extractor::{ExtractorReceiver, ExtractorSender, UtteranceTracker};
pub use recognizer::{coalesce_extractions, RecognizerReceiver, RecognizerSender};
pub use synthesizer::{SynthesizerReceiver, SynthesizerSender};
pub use text::{TextReceiver, TextSender};

use crate::error::{PipelineError, PipelineResult};
use std::time::Duration;
use tokio::sync::mpsc;

/// Wait up to `wait` for the next queued item. `Err(NotLive)` once the producer is gone.
pub(crate) async fn recv_timeout<T>(rx: &mut mpsc::Receiver<T>, wait: Duration) -> PipelineResult<Option<T>> {
    match tokio::time::timeout(wait, rx.recv()).await {
        Err(_) => Ok(None),
        Ok(Some(item)) => Ok(Some(item)),
        Ok(None) => Err(PipelineError::NotLive),
    }
}
