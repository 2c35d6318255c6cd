//! Worker addressing.
//!
//! The broker asks a [`WorkerDirectory`] where each worker type lives. The shipped
//! directory is static (config file or environment); a service registry can be
//! plugged in behind the same trait.

use crate::config::WorkersConfig;
use crate::error::{PipelineError, PipelineResult};
use crate::models::TalkMode;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkerKind {
    SpeechExtractor,
    SpeechRecognizer,
    TextProcessor,
    VoiceSynthesizer,
}

impl WorkerKind {
    pub const ALL: [WorkerKind; 4] = [
        WorkerKind::SpeechExtractor,
        WorkerKind::SpeechRecognizer,
        WorkerKind::TextProcessor,
        WorkerKind::VoiceSynthesizer,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerKind::SpeechExtractor => "SpeechExtractor",
            WorkerKind::SpeechRecognizer => "SpeechRecognizer",
            WorkerKind::TextProcessor => "TextProcessor",
            WorkerKind::VoiceSynthesizer => "VoiceSynthesizer",
        }
    }
}

impl fmt::Display for WorkerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerAddress {
    pub host: String,
    pub port: u16,
}

impl WorkerAddress {
    /// WebSocket URL of this worker's endpoint for one session.
    pub fn endpoint_url(&self, kind: WorkerKind, talk_mode: TalkMode) -> String {
        let path = match kind {
            WorkerKind::SpeechExtractor => format!(
                "/api/v1/SpeechExtractor/extract?max_silence_ms={}",
                talk_mode.max_silence_ms()
            ),
            WorkerKind::SpeechRecognizer => "/api/v1/SpeechRecognizer/recognize".to_string(),
            WorkerKind::TextProcessor => format!("/api/v1/TextProcessor/{}", talk_mode.as_str()),
            WorkerKind::VoiceSynthesizer => "/api/v1/VoiceSynthesizer/synthesize".to_string(),
        };
        format!("ws://{}:{}{}", self.host, self.port, path)
    }
}

pub trait WorkerDirectory: Send + Sync {
    fn resolve(&self, kind: WorkerKind) -> PipelineResult<WorkerAddress>;
}

/// Addresses from the `workers` config section.
#[derive(Debug, Clone)]
pub struct StaticDirectory {
    config: WorkersConfig,
}

impl StaticDirectory {
    pub fn new(config: WorkersConfig) -> Self {
        Self { config }
    }
}

impl WorkerDirectory for StaticDirectory {
    fn resolve(&self, kind: WorkerKind) -> PipelineResult<WorkerAddress> {
        let explicit = match kind {
            WorkerKind::SpeechExtractor => &self.config.extractor,
            WorkerKind::SpeechRecognizer => &self.config.recognizer,
            WorkerKind::TextProcessor => &self.config.text_processor,
            WorkerKind::VoiceSynthesizer => &self.config.synthesizer,
        };

        if let Some(endpoint) = explicit {
            return Ok(WorkerAddress {
                host: endpoint.host.clone(),
                port: endpoint.port,
            });
        }

        match (&self.config.fallback_host, self.config.fallback_port) {
            (Some(host), Some(port)) => Ok(WorkerAddress {
                host: host.clone(),
                port,
            }),
            _ => Err(PipelineError::WorkerNotFound(kind.to_string())),
        }
    }
}
