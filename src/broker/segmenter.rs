//! Loopback workers for exercising the broker against real sockets.
//!
//! [`SpeechSegmenter`] follows the extractor worker protocol with a plain energy
//! detector in place of a classifier. [`LoopbackWorkers`] serves it, together with
//! scripted recognizer, text processor and synthesizer endpoints, on one local port.

use crate::audio::processor::{pcm_to_bytes, pcm_to_float};
use crate::error::{PipelineError, PipelineResult};
use crate::models::{
    self, ChatMessage, ExtractionResult, ExtractorInit, Mora, RecognitionResult, SynthesisResult,
    TextExchangeRequest, TextExchangeResult,
};
use byteorder::{LittleEndian, ReadBytesExt};
use futures_util::{SinkExt, StreamExt};
use std::io::Cursor;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message;

const SAMPLE_RATE: usize = 16_000;
/// Decide only once more than 200ms is buffered.
const MIN_DECISION_SAMPLES: usize = 3200;
/// Audio kept from before speech starts.
const PRE_ROLL_SAMPLES: usize = SAMPLE_RATE / 2;
const SPEECH_RMS: f32 = 0.02;

pub struct SpeechSegmenter {
    session_id: String,
    max_silence_ms: f64,
    pending: Vec<i16>,
    voice: Vec<i16>,
    in_speech: bool,
    silence_ms: f64,
    speech_id: u64,
    sequence_id: u64,
    start_at: f64,
}

impl SpeechSegmenter {
    pub fn new(session_id: &str, max_silence_ms: u32) -> Self {
        Self {
            session_id: session_id.to_string(),
            max_silence_ms: max_silence_ms as f64,
            pending: Vec::new(),
            voice: Vec::new(),
            in_speech: false,
            silence_ms: 0.0,
            speech_id: 0,
            sequence_id: 0,
            start_at: -1.0,
        }
    }

    pub fn feed(&mut self, pcm: &[i16]) -> Option<ExtractionResult> {
        self.pending.extend_from_slice(pcm);
        if self.pending.len() <= MIN_DECISION_SAMPLES {
            return None;
        }
        let chunk = std::mem::take(&mut self.pending);
        self.decide(chunk)
    }

    fn decide(&mut self, chunk: Vec<i16>) -> Option<ExtractionResult> {
        let is_speech = rms(&pcm_to_float(&chunk)) > SPEECH_RMS;
        if is_speech {
            self.start_at = models::unix_time();
            self.silence_ms = 0.0;
            self.in_speech = true;
        }
        self.voice.extend_from_slice(&chunk);

        if !self.in_speech {
            let keep_from = self.voice.len().saturating_sub(PRE_ROLL_SAMPLES);
            self.voice.drain(..keep_from);
            return None;
        }

        if is_speech {
            self.sequence_id += 1;
            return Some(self.emit(false));
        }

        self.silence_ms += chunk.len() as f64 / SAMPLE_RATE as f64 * 1000.0;
        if self.silence_ms < self.max_silence_ms {
            return None;
        }

        self.sequence_id += 1;
        let result = self.emit(true);
        self.speech_id += 1;
        self.start_at = -1.0;
        self.in_speech = false;
        Some(result)
    }

    fn emit(&mut self, confirmed: bool) -> ExtractionResult {
        ExtractionResult {
            session_id: self.session_id.clone(),
            speech_id: self.speech_id,
            sequence_id: self.sequence_id,
            start_at: self.start_at,
            confirmed,
            voice: pcm_to_bytes(&std::mem::take(&mut self.voice)),
            voice_dtype: "int16".into(),
            voice_sampling_rate: SAMPLE_RATE as u32,
            voice_sample_bytes: 2,
            voice_channels: 1,
        }
    }
}

/// Parse little-endian 16-bit PCM.
fn bytes_to_pcm(data: &[u8]) -> PipelineResult<Vec<i16>> {
    if data.len() % 2 != 0 {
        return Err(PipelineError::Decode(format!(
            "PCM length must be even for 16-bit samples, got {} bytes",
            data.len()
        )));
    }

    let mut cursor = Cursor::new(data);
    let mut samples = Vec::with_capacity(data.len() / 2);
    while let Ok(sample) = cursor.read_i16::<LittleEndian>() {
        samples.push(sample);
    }
    Ok(samples)
}

/// Root-mean-square level of a float signal.
fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    (samples.iter().map(|s| s * s).sum::<f32>() / samples.len() as f32).sqrt()
}

/// 20ms frame of a loud 440Hz tone at 16kHz.
pub fn speech_frame() -> Vec<i16> {
    (0..320)
        .map(|i| ((i as f32 * 440.0 * std::f32::consts::TAU / SAMPLE_RATE as f32).sin() * 12_000.0) as i16)
        .collect()
}

pub fn silent_frame() -> Vec<i16> {
    vec![0; 320]
}

/// What the loopback workers do besides answering.
#[derive(Default)]
pub struct LoopbackOptions {
    /// Every extraction result the segmenter emits is copied here
    pub extractions: Option<mpsc::UnboundedSender<ExtractionResult>>,
    /// The recognizer closes its socket after this many requests
    pub recognizer_close_after: Option<usize>,
    /// The recognizer answers with bytes that are not a msgpack record
    pub recognizer_garbage: bool,
    /// Request path of every connection a ping arrives on
    pub pings: Option<mpsc::UnboundedSender<String>>,
}

pub struct LoopbackWorkers {
    pub port: u16,
    handle: JoinHandle<()>,
}

impl Drop for LoopbackWorkers {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

impl LoopbackWorkers {
    pub async fn spawn(options: LoopbackOptions) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let handle = tokio::spawn(async move {
            let mut connections = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                let behaviour = Behaviour {
                    extractions: options.extractions.clone(),
                    recognizer_close_after: options.recognizer_close_after,
                    recognizer_garbage: options.recognizer_garbage,
                    pings: options.pings.clone(),
                };
                connections.push(tokio::spawn(serve(stream, behaviour)));
            }
        });
        Self { port, handle }
    }
}

/// Per-connection copy of [`LoopbackOptions`].
struct Behaviour {
    extractions: Option<mpsc::UnboundedSender<ExtractionResult>>,
    recognizer_close_after: Option<usize>,
    recognizer_garbage: bool,
    pings: Option<mpsc::UnboundedSender<String>>,
}

async fn serve(stream: TcpStream, behaviour: Behaviour) {
    let Behaviour {
        extractions,
        recognizer_close_after,
        recognizer_garbage,
        pings,
    } = behaviour;
    let mut target = String::new();
    let callback = |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
        target = req.uri().to_string();
        Ok(resp)
    };
    let Ok(ws) = tokio_tungstenite::accept_hdr_async(stream, callback).await else {
        return;
    };
    let (mut sink, mut source) = ws.split();

    let mut segmenter: Option<SpeechSegmenter> = None;
    let mut handled = 0usize;

    while let Some(Ok(message)) = source.next().await {
        let pack = match message {
            Message::Binary(pack) => pack,
            Message::Ping(_) => {
                if let Some(tx) = &pings {
                    let _ = tx.send(target.clone());
                }
                continue;
            }
            Message::Close(_) => break,
            _ => continue,
        };

        let replies: Vec<Vec<u8>> = if target.starts_with("/api/v1/SpeechExtractor/extract") {
            match segmenter.as_mut() {
                None => {
                    let init: ExtractorInit = models::from_msgpack(&pack).unwrap();
                    let max_silence_ms = target
                        .split("max_silence_ms=")
                        .nth(1)
                        .and_then(|v| v.parse().ok())
                        .unwrap_or(600);
                    segmenter = Some(SpeechSegmenter::new(&init.session_id, max_silence_ms));
                    Vec::new()
                }
                Some(seg) => {
                    let pcm = bytes_to_pcm(&pack).unwrap();
                    seg.feed(&pcm)
                        .map(|result| {
                            if let Some(tx) = &extractions {
                                let _ = tx.send(result.clone());
                            }
                            models::to_msgpack(&result).unwrap()
                        })
                        .into_iter()
                        .collect()
                }
            }
        } else if target.starts_with("/api/v1/SpeechRecognizer") {
            handled += 1;
            if recognizer_close_after.is_some_and(|limit| handled > limit) {
                break;
            }
            if recognizer_garbage {
                // 0xc1 is never used by msgpack
                vec![vec![0xc1, 0x00, 0xff]]
            } else {
                let request: ExtractionResult = models::from_msgpack(&pack).unwrap();
                vec![recognize(&request)]
            }
        } else if target.starts_with("/api/v1/TextProcessor") {
            let request: TextExchangeRequest = models::from_msgpack(&pack).unwrap();
            respond(&request)
        } else {
            let result: TextExchangeResult = models::from_msgpack(&pack).unwrap();
            result.voice_text.as_deref().map(synthesize).into_iter().collect()
        };

        for reply in replies {
            if sink.send(Message::Binary(reply)).await.is_err() {
                return;
            }
        }
    }
    let _ = sink.close().await;
}

fn recognize(request: &ExtractionResult) -> Vec<u8> {
    let result = RecognitionResult {
        session_id: request.session_id.clone(),
        speech_id: request.speech_id,
        sequence_id: request.sequence_id,
        start_at: request.start_at,
        confirmed: request.confirmed,
        result: vec![("hello".into(), 0.9), ("</s>".into(), 1.0)],
    };
    models::to_msgpack(&result).unwrap()
}

fn respond(request: &TextExchangeRequest) -> Vec<Vec<u8>> {
    if !request.confirmed {
        return Vec::new();
    }
    let reply = |voice_text: Option<&str>, end_of_response: bool| TextExchangeResult {
        session_id: request.session_id.clone(),
        speech_id: request.speech_id,
        sequence_id: request.sequence_id,
        confirmed: true,
        history: request.history.clone(),
        request_message: request.request_message.clone(),
        response_message: Some(ChatMessage::new("assistant", "avatar", "Avatar", "hi there")),
        end_of_response,
        voice_text: voice_text.map(str::to_string),
    };
    vec![
        models::to_msgpack(&reply(Some("hi there"), false)).unwrap(),
        models::to_msgpack(&reply(None, true)).unwrap(),
    ]
}

/// 100ms of 24kHz audio with two moras.
fn synthesize(text: &str) -> Vec<u8> {
    let mut voice = Cursor::new(Vec::new());
    let header = wav::Header::new(wav::WAV_FORMAT_PCM, 1, 24_000, 16);
    wav::write(header, &wav::BitDepth::Sixteen(vec![2000; 2400]), &mut voice).unwrap();

    let result = SynthesisResult {
        message: text.to_string(),
        query: serde_json::json!({"speedScale": 1.0}),
        mora_queue: vec![
            Mora { vowel: Some("a".into()), length: 0.05, text: Some("ha".into()) },
            Mora { vowel: Some("i".into()), length: 0.05, text: Some("i".into()) },
        ],
        speaking_time: 0.1,
        voice: voice.into_inner(),
        audio_format: "audio/wav".into(),
    };
    models::to_msgpack(&result).unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed_frames(seg: &mut SpeechSegmenter, frame: &[i16], count: usize) -> Vec<ExtractionResult> {
        (0..count).filter_map(|_| seg.feed(frame)).collect()
    }

    #[test]
    fn test_silence_never_confirms() {
        let mut seg = SpeechSegmenter::new("s", 600);
        let results = feed_frames(&mut seg, &silent_frame(), 20);
        assert!(results.iter().all(|r| !r.confirmed));
        assert!(results.is_empty());
    }

    #[test]
    fn test_speech_then_silence_confirms_once() {
        let mut seg = SpeechSegmenter::new("s", 600);
        let mut results = feed_frames(&mut seg, &speech_frame(), 25);
        results.extend(feed_frames(&mut seg, &silent_frame(), 50));

        let confirmed: Vec<_> = results.iter().filter(|r| r.confirmed).collect();
        assert_eq!(confirmed.len(), 1);
        assert_eq!(confirmed[0].speech_id, 0);
        assert!(results.last().is_some_and(|r| r.confirmed));
        assert!(results.windows(2).all(|w| w[0].sequence_id <= w[1].sequence_id));
    }

    #[test]
    fn test_pcm_bytes_parse() {
        assert_eq!(bytes_to_pcm(&pcm_to_bytes(&[1, -2])).unwrap(), vec![1, -2]);
        assert!(bytes_to_pcm(&[0u8; 3]).is_err());
    }

    #[test]
    fn test_short_pause_does_not_confirm() {
        let mut seg = SpeechSegmenter::new("s", 1000);
        let mut results = feed_frames(&mut seg, &speech_frame(), 25);
        // Pause well under the silence threshold
        results.extend(feed_frames(&mut seg, &silent_frame(), 11));
        assert!(results.iter().all(|r| !r.confirmed));
    }
}
