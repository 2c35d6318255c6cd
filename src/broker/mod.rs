//! # Audio Broker
//!
//! Per-session fan-out between the media track and the four pipeline workers.
//!
//! ## Queue chain:
//! ```text
//! frame buffer (lossy, 25) -> extractor -> extraction results (10) -> recognizer
//!   -> recognition results (10) -> text processor -> text results (10) -> synthesizer
//!   -> captions (unbounded) + voice frames (unbounded) -> media track adapter
//! ```
//!
//! Every link shares one [`Liveness`] flag. Whichever task hits a fatal condition
//! clears it and the rest of the session follows within one polling interval.

pub mod discovery;
pub mod link;
pub mod liveness;
pub mod stages;
pub mod synthesis;

#[cfg(test)]
pub(crate) mod segmenter;

pub use discovery::{StaticDirectory, WorkerAddress, WorkerDirectory, WorkerKind};
pub use liveness::Liveness;

use crate::audio::processor::pcm_to_bytes;
use crate::audio::{FrameBuffer, FrameShape};
use crate::config::{PipelineConfig, WorkersConfig};
use crate::error::{PipelineError, PipelineResult};
use crate::models::{ChatMessage, SynthesisFrame, TalkMode};
use link::{Downstream, LinkSettings, WorkerLink};
use parking_lot::RwLock;
use stages::*;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, info};

#[derive(Debug, Clone)]
pub struct BrokerSettings {
    pub frame_buffer_capacity: usize,
    pub stage_queue_capacity: usize,
    pub join_timeout: Duration,
    pub link: LinkSettings,
}

impl BrokerSettings {
    pub fn from_config(pipeline: &PipelineConfig, workers: &WorkersConfig) -> Self {
        Self {
            frame_buffer_capacity: pipeline.frame_buffer_capacity,
            stage_queue_capacity: pipeline.stage_queue_capacity,
            join_timeout: pipeline.join_timeout(),
            link: LinkSettings {
                connect_timeout: Duration::from_millis(workers.connect_timeout_ms),
                receive_timeout: pipeline.receive_timeout(),
                idle_poll: pipeline.idle_poll(),
                ping_interval: pipeline.ping_interval(),
            },
        }
    }
}

pub struct AudioBroker {
    session_id: String,
    liveness: Liveness,
    frames: Arc<FrameBuffer>,
    output_shape: Arc<RwLock<FrameShape>>,
    captions: mpsc::UnboundedReceiver<ChatMessage>,
    voice_frames: mpsc::UnboundedReceiver<SynthesisFrame>,
    links: Vec<WorkerLink>,
    join_timeout: Duration,
    closed: bool,
}

/// Queue ends handed to the links while they are being opened.
struct Wiring {
    captions: mpsc::UnboundedSender<ChatMessage>,
    voice_frames: mpsc::UnboundedSender<SynthesisFrame>,
}

impl AudioBroker {
    /// Open all four worker links.
    ///
    /// Never fails: if a link cannot be opened, the error goes to the caption queue as
    /// a system error message, the links opened so far are closed, and the returned
    /// broker is not live.
    pub async fn connect(
        session_id: &str,
        talk_mode: TalkMode,
        directory: &dyn WorkerDirectory,
        settings: &BrokerSettings,
    ) -> Self {
        let (caption_tx, caption_rx) = mpsc::unbounded_channel();
        let (voice_tx, voice_rx) = mpsc::unbounded_channel();

        let mut broker = Self {
            session_id: session_id.to_string(),
            liveness: Liveness::new(),
            frames: Arc::new(FrameBuffer::new(settings.frame_buffer_capacity)),
            output_shape: Arc::new(RwLock::new(FrameShape::default())),
            captions: caption_rx,
            voice_frames: voice_rx,
            links: Vec::with_capacity(WorkerKind::ALL.len()),
            join_timeout: settings.join_timeout,
            closed: false,
        };

        let wiring = Wiring {
            captions: caption_tx.clone(),
            voice_frames: voice_tx,
        };
        match broker.open_links(talk_mode, directory, settings, wiring).await {
            Ok(()) => info!(session_id, talk_mode = talk_mode.as_str(), "Audio broker started"),
            Err(e) => {
                error!(session_id, error = %e, "Failed to start audio broker");
                let _ = caption_tx.send(ChatMessage::system_error(e.to_string()));
                broker.close().await;
            }
        }
        broker
    }

    async fn open_links(
        &mut self,
        talk_mode: TalkMode,
        directory: &dyn WorkerDirectory,
        settings: &BrokerSettings,
        wiring: Wiring,
    ) -> PipelineResult<()> {
        let capacity = settings.stage_queue_capacity;
        let (extraction_tx, extraction_rx) = mpsc::channel(capacity);
        let (recognition_tx, recognition_rx) = mpsc::channel(capacity);
        let (text_tx, text_rx) = mpsc::channel(capacity);

        let url = |kind: WorkerKind| -> PipelineResult<String> {
            Ok(directory.resolve(kind)?.endpoint_url(kind, talk_mode))
        };

        let extractor = WorkerLink::open(
            WorkerKind::SpeechExtractor,
            &url(WorkerKind::SpeechExtractor)?,
            ExtractorSender::new(&self.session_id, self.frames.clone()),
            ExtractorReceiver::default(),
            Downstream::Bounded(extraction_tx),
            self.liveness.clone(),
            wiring.captions.clone(),
            &settings.link,
        )
        .await?;
        self.links.push(extractor);

        let recognizer = WorkerLink::open(
            WorkerKind::SpeechRecognizer,
            &url(WorkerKind::SpeechRecognizer)?,
            RecognizerSender::new(extraction_rx),
            RecognizerReceiver,
            Downstream::Bounded(recognition_tx),
            self.liveness.clone(),
            wiring.captions.clone(),
            &settings.link,
        )
        .await?;
        self.links.push(recognizer);

        let text_processor = WorkerLink::open(
            WorkerKind::TextProcessor,
            &url(WorkerKind::TextProcessor)?,
            TextSender::new(recognition_rx, wiring.captions.clone()),
            TextReceiver::new(wiring.captions.clone()),
            Downstream::Bounded(text_tx),
            self.liveness.clone(),
            wiring.captions.clone(),
            &settings.link,
        )
        .await?;
        self.links.push(text_processor);

        let synthesizer = WorkerLink::open(
            WorkerKind::VoiceSynthesizer,
            &url(WorkerKind::VoiceSynthesizer)?,
            SynthesizerSender::new(text_rx),
            SynthesizerReceiver::new(self.output_shape.clone()),
            Downstream::Unbounded(wiring.voice_frames),
            self.liveness.clone(),
            wiring.captions.clone(),
            &settings.link,
        )
        .await?;
        self.links.push(synthesizer);

        Ok(())
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn is_live(&self) -> bool {
        self.liveness.is_live()
    }

    pub fn liveness(&self) -> &Liveness {
        &self.liveness
    }

    /// Queue 16kHz mono samples for the extractor. Never blocks.
    pub fn push_frame(&self, pcm: &[i16]) -> PipelineResult<()> {
        if !self.liveness.is_live() {
            return Err(PipelineError::NotLive);
        }
        self.frames.push(pcm_to_bytes(pcm));
        Ok(())
    }

    /// Shape synthesized voice frames are cut to from now on.
    pub fn set_output_format(&self, shape: FrameShape) {
        if *self.output_shape.read() != shape {
            *self.output_shape.write() = shape;
        }
    }

    pub fn output_format(&self) -> FrameShape {
        *self.output_shape.read()
    }

    pub fn dropped_frames(&self) -> u64 {
        self.frames.dropped()
    }

    pub fn try_next_caption(&mut self) -> Option<ChatMessage> {
        self.captions.try_recv().ok()
    }

    pub fn try_next_voice_frame(&mut self) -> Option<SynthesisFrame> {
        self.voice_frames.try_recv().ok()
    }

    /// Stop every link and wait for its tasks, all within one join timeout.
    ///
    /// Safe to call more than once; only the first call does anything.
    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.liveness.clear("audio broker closed");

        if !self.frames.is_empty() {
            debug!(session_id = %self.session_id, unsent = self.frames.len(), "Dropping unsent frames");
        }

        let deadline = Instant::now() + self.join_timeout;
        for link in self.links.iter_mut() {
            debug!(worker = %link.kind(), "Joining worker link");
            link.join(deadline).await;
        }
        let closed_links = self.links.len();
        self.links.clear();
        info!(session_id = %self.session_id, links = closed_links, "Audio broker closed");
    }
}

#[cfg(test)]
mod tests {
    use super::segmenter::{silent_frame, speech_frame, LoopbackOptions, LoopbackWorkers};
    use super::*;
    use crate::config::WorkerEndpointConfig;
    use crate::models::ExtractionResult;

    fn settings() -> BrokerSettings {
        let pipeline = PipelineConfig {
            receive_timeout_ms: 100,
            idle_poll_ms: 20,
            join_timeout_secs: 2,
            ..PipelineConfig::default()
        };
        let workers = WorkersConfig {
            connect_timeout_ms: 1_000,
            ..WorkersConfig::default()
        };
        BrokerSettings::from_config(&pipeline, &workers)
    }

    fn directory(port: u16) -> StaticDirectory {
        StaticDirectory::new(WorkersConfig {
            fallback_host: Some("127.0.0.1".into()),
            fallback_port: Some(port),
            ..WorkersConfig::default()
        })
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
        for _ in 0..200 {
            if condition() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        false
    }

    #[tokio::test]
    async fn test_missing_worker_reports_error_caption() {
        let directory = StaticDirectory::new(WorkersConfig {
            fallback_host: None,
            ..WorkersConfig::default()
        });

        let mut broker = AudioBroker::connect("session", TalkMode::Chat, &directory, &settings()).await;
        assert!(!broker.is_live());
        assert_eq!(broker.push_frame(&silent_frame()), Err(PipelineError::NotLive));

        let caption = broker.try_next_caption().unwrap();
        assert_eq!(caption.message_type, "error");
        assert_eq!(caption.speaker_id, "system");
        assert_eq!(caption.message, "SpeechExtractor worker is not found");
    }

    #[tokio::test]
    async fn test_unreachable_worker_closes_opened_links() {
        let workers = LoopbackWorkers::spawn(LoopbackOptions::default()).await;
        let unused = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dead_port = unused.local_addr().unwrap().port();
        drop(unused);

        let directory = StaticDirectory::new(WorkersConfig {
            fallback_host: Some("127.0.0.1".into()),
            fallback_port: Some(workers.port),
            synthesizer: Some(WorkerEndpointConfig { host: "127.0.0.1".into(), port: dead_port }),
            ..WorkersConfig::default()
        });

        let mut broker = AudioBroker::connect("session", TalkMode::Chat, &directory, &settings()).await;
        assert!(!broker.is_live());
        assert!(broker.links.is_empty());
        assert!(broker.try_next_caption().unwrap().message.contains("VoiceSynthesizer"));
    }

    #[tokio::test]
    async fn test_pipeline_round_trip() {
        let (extraction_tx, mut extraction_rx) = mpsc::unbounded_channel::<ExtractionResult>();
        let workers = LoopbackWorkers::spawn(LoopbackOptions {
            extractions: Some(extraction_tx),
            ..LoopbackOptions::default()
        })
        .await;

        let mut broker = AudioBroker::connect("session", TalkMode::Sincro, &directory(workers.port), &settings()).await;
        assert!(broker.is_live());

        for _ in 0..25 {
            broker.push_frame(&speech_frame()).unwrap();
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        for _ in 0..60 {
            broker.push_frame(&silent_frame()).unwrap();
            tokio::time::sleep(Duration::from_millis(2)).await;
        }

        let mut voice_frames = Vec::new();
        let mut captions = Vec::new();
        let got_voice = wait_until(|| {
            while let Some(frame) = broker.try_next_voice_frame() {
                voice_frames.push(frame);
            }
            while let Some(caption) = broker.try_next_caption() {
                captions.push(caption);
            }
            voice_frames.len() >= 5
        })
        .await;
        assert!(got_voice, "no synthesized voice arrived");

        // 100ms of synthesized voice cut to the default 20ms stereo frames
        assert!(voice_frames.iter().all(|f| f.samples.len() == 960 * 2));
        assert!(voice_frames[0].new_text);
        assert!(captions.iter().any(|c| c.message_type == "user" && c.message == "hello"));
        assert!(captions.iter().any(|c| c.message == "hi there"));

        let mut extractions = Vec::new();
        while let Ok(result) = extraction_rx.try_recv() {
            extractions.push(result);
        }
        assert_eq!(extractions.iter().filter(|r| r.confirmed).count(), 1);

        broker.close().await;
        assert!(!broker.is_live());
        broker.close().await;
    }

    #[tokio::test]
    async fn test_one_dead_link_stops_the_session() {
        let workers = LoopbackWorkers::spawn(LoopbackOptions {
            recognizer_close_after: Some(0),
            ..LoopbackOptions::default()
        })
        .await;

        let mut broker = AudioBroker::connect("session", TalkMode::Chat, &directory(workers.port), &settings()).await;
        assert!(broker.is_live());

        for _ in 0..25 {
            broker.push_frame(&speech_frame()).unwrap();
        }
        assert!(wait_until(|| !broker.is_live()).await, "liveness was never cleared");

        let started = std::time::Instant::now();
        broker.close().await;
        assert!(started.elapsed() < Duration::from_secs(3));
        assert!(broker.links.is_empty());
    }

    #[tokio::test]
    async fn test_malformed_record_stops_the_session() {
        let workers = LoopbackWorkers::spawn(LoopbackOptions {
            recognizer_garbage: true,
            ..LoopbackOptions::default()
        })
        .await;

        let mut broker = AudioBroker::connect("session", TalkMode::Chat, &directory(workers.port), &settings()).await;
        assert!(broker.is_live());

        for _ in 0..25 {
            broker.push_frame(&speech_frame()).unwrap();
        }
        assert!(wait_until(|| !broker.is_live()).await, "liveness was never cleared");

        let mut captions = Vec::new();
        while let Some(caption) = broker.try_next_caption() {
            captions.push(caption);
        }
        let failure = captions
            .iter()
            .find(|c| c.message.starts_with("SpeechRecognizer link failed"))
            .expect("no failure caption");
        assert_eq!(failure.message_type, "error");
        assert!(failure.message.contains("Decode error"));

        broker.close().await;
    }

    #[tokio::test]
    async fn test_idle_sender_pings_worker() {
        let (ping_tx, mut ping_rx) = mpsc::unbounded_channel::<String>();
        let workers = LoopbackWorkers::spawn(LoopbackOptions {
            pings: Some(ping_tx),
            ..LoopbackOptions::default()
        })
        .await;
        let mut settings = settings();
        settings.link.ping_interval = Duration::from_millis(100);

        let mut broker = AudioBroker::connect("session", TalkMode::Chat, &directory(workers.port), &settings).await;
        assert!(broker.is_live());

        let path = tokio::time::timeout(Duration::from_secs(3), ping_rx.recv())
            .await
            .expect("no ping within 3s")
            .unwrap();
        assert!(path.starts_with("/api/v1/"));
        assert!(broker.is_live());

        broker.close().await;
    }
}
