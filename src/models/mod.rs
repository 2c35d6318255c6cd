//! # Wire Models
//!
//! Records exchanged with the pipeline workers (msgpack, one record per WebSocket
//! binary message) and with the browser (JSON over the signaling endpoint and the
//! data channels).
//!
//! ## Encoding rules:
//! - Worker records are msgpack maps keyed by field name (`rmp_serde::to_vec_named`)
//! - Voice payloads are msgpack `bin` values, never arrays of integers (`serde_bytes`)
//! - Data-channel payloads are compact JSON

pub mod chat;
pub mod extractor;
pub mod offer;
pub mod recognizer;
pub mod synthesis;
pub mod text;

pub use chat::{ChatHistory, ChatMessage};
pub use extractor::{ExtractionResult, ExtractorInit};
pub use offer::{SessionAnswer, SessionOffer, TalkMode};
pub use recognizer::RecognitionResult;
pub use synthesis::{Mora, SynthesisFrame, SynthesisResult, TelopParams};
pub use text::{TextExchangeRequest, TextExchangeResult};

use crate::error::PipelineResult;
use serde::{de::DeserializeOwned, Serialize};

/// Encode a record the way the workers expect it (a map, not a positional array).
pub fn to_msgpack<T: Serialize>(record: &T) -> PipelineResult<Vec<u8>> {
    Ok(rmp_serde::to_vec_named(record)?)
}

pub fn from_msgpack<T: DeserializeOwned>(pack: &[u8]) -> PipelineResult<T> {
    Ok(rmp_serde::from_slice(pack)?)
}

/// Seconds since the Unix epoch as a float, the timestamp format every worker uses.
pub fn unix_time() -> f64 {
    chrono::Utc::now().timestamp_micros() as f64 / 1_000_000.0
}
