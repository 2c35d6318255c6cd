//! # Configuration Management
//!
//! Loads the signaling server configuration from multiple sources:
//! - TOML configuration file (config.toml)
//! - Environment variables (with APP_ prefix, `__` between nested keys)
//! - Default values (built into the code)
//!
//! ## Key Rust Concepts Used:
//! - **Serde**: Converts between the config structs and TOML / JSON / env values
//! - **derive macros**: Generate Debug, Clone, Serialize, Deserialize for every section
//! - **Option<T>**: Optional settings such as TURN credentials or per-worker addresses
//! - **Result<T, E>**: Loading and validation both report errors instead of panicking
//!
//! ## Configuration Priority (highest to lowest):
//! 1. Environment variables (APP_SERVER__PORT, APP_WEBRTC__MAX_SESSIONS, etc.)
//! 2. Configuration file (config.toml)
//! 3. Default values (defined in the Default impls)
//!
//! ## Example config.toml:
//! ```toml
//! [webrtc]
//! max_sessions = 4
//!
//! [[webrtc.ice_servers]]
//! urls = "stun:stun.l.google.com:19302"
//!
//! [[webrtc.ice_servers]]
//! urls = "turn:turn.example.com:3478"
//! username = "avatar"
//! credential = "secret"
//!
//! [workers]
//! fallback_host = "127.0.0.1"
//! fallback_port = 8002
//! ```

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

/// Main application configuration.
///
/// ## Sections:
/// - `server`: where the signaling endpoint listens
/// - `webrtc`: admission limit and ICE servers handed to every peer connection
/// - `workers`: how to reach the four pipeline workers
/// - `pipeline`: queue sizes, timeouts and polling intervals for every session
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub webrtc: WebRtcConfig,
    #[serde(default)]
    pub workers: WorkersConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
}

/// Server-specific configuration settings.
///
/// ## Common values:
/// - `host = "127.0.0.1"`: Only accept connections from localhost (development)
/// - `host = "0.0.0.0"`: Accept connections from any IP address (production)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8001,
        }
    }
}

/// WebRTC settings shared by every session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebRtcConfig {
    /// New offers are rejected with 429 once the live session count exceeds this
    pub max_sessions: usize,
    pub ice_servers: Vec<IceServerConfig>,
}

impl Default for WebRtcConfig {
    fn default() -> Self {
        Self {
            max_sessions: 10,
            ice_servers: vec![IceServerConfig {
                urls: "stun:stun.l.google.com:19302".to_string(),
                username: None,
                credential: None,
            }],
        }
    }
}

/// One STUN or TURN server.
///
/// The server type is not configured explicitly: it is derived from the URL scheme.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IceServerConfig {
    pub urls: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub credential: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IceServerKind {
    Stun,
    Turn,
}

impl IceServerConfig {
    /// Classify by URL prefix (`stun:`, `stuns:`, `turn:`, `turns:`).
    pub fn kind(&self) -> Option<IceServerKind> {
        let url = self.urls.trim().to_ascii_lowercase();
        if url.starts_with("stun:") || url.starts_with("stuns:") {
            Some(IceServerKind::Stun)
        } else if url.starts_with("turn:") || url.starts_with("turns:") {
            Some(IceServerKind::Turn)
        } else {
            None
        }
    }
}

/// Address of one worker process.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkerEndpointConfig {
    pub host: String,
    pub port: u16,
}

/// How the broker reaches its four workers.
///
/// A worker type with its own entry uses it; every other type falls back to
/// `fallback_host:fallback_port`. With neither, opening that link fails.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkersConfig {
    #[serde(default)]
    pub fallback_host: Option<String>,
    #[serde(default)]
    pub fallback_port: Option<u16>,
    #[serde(default)]
    pub extractor: Option<WorkerEndpointConfig>,
    #[serde(default)]
    pub recognizer: Option<WorkerEndpointConfig>,
    #[serde(default)]
    pub text_processor: Option<WorkerEndpointConfig>,
    #[serde(default)]
    pub synthesizer: Option<WorkerEndpointConfig>,
    pub connect_timeout_ms: u64,
}

impl Default for WorkersConfig {
    fn default() -> Self {
        Self {
            fallback_host: Some("127.0.0.1".to_string()),
            fallback_port: Some(8002),
            extractor: None,
            recognizer: None,
            text_processor: None,
            synthesizer: None,
            connect_timeout_ms: 5_000,
        }
    }
}

/// Per-session pipeline tuning.
///
/// ## Tuning guidelines:
/// - `frame_buffer_capacity` is the only lossy queue; larger values add latency
/// - `receive_timeout_ms` bounds how long a receiver waits before re-checking liveness
/// - `join_timeout_secs` bounds every join before tasks are aborted
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub frame_buffer_capacity: usize,
    pub stage_queue_capacity: usize,
    pub receive_timeout_ms: u64,
    pub idle_poll_ms: u64,
    pub ping_interval_secs: u64,
    pub join_timeout_secs: u64,
    pub finalize_poll_ms: u64,
    pub cleanup_interval_secs: u64,
    pub answer_timeout_secs: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            frame_buffer_capacity: 25,
            stage_queue_capacity: 10,
            receive_timeout_ms: 1_000,
            idle_poll_ms: 200,
            ping_interval_secs: 10,
            join_timeout_secs: 10,
            finalize_poll_ms: 1_000,
            cleanup_interval_secs: 10,
            answer_timeout_secs: 30,
        }
    }
}

impl PipelineConfig {
    pub fn receive_timeout(&self) -> Duration {
        Duration::from_millis(self.receive_timeout_ms)
    }

    pub fn idle_poll(&self) -> Duration {
        Duration::from_millis(self.idle_poll_ms)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs)
    }

    pub fn join_timeout(&self) -> Duration {
        Duration::from_secs(self.join_timeout_secs)
    }

    pub fn finalize_poll(&self) -> Duration {
        Duration::from_millis(self.finalize_poll_ms)
    }
}

impl AppConfig {
    /// Load configuration from defaults, config.toml and the environment.
    ///
    /// ## Environment Variable Examples:
    /// - `APP_SERVER__PORT=9000`: Override server port
    /// - `APP_WEBRTC__MAX_SESSIONS=4`: Override the admission limit
    /// - `APP_WORKERS__FALLBACK_HOST=10.0.0.5`: Point every worker link at one host
    /// - `HOST=0.0.0.0` / `PORT=3000`: Special cases for deployment platforms
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(
                config::Environment::with_prefix("APP")
                    .prefix_separator("_")
                    .separator("__"),
            );

        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }

        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Validate that the configuration values make sense.
    ///
    /// ## What this checks:
    /// - Server port is not 0
    /// - At least one session may run
    /// - Every ICE server URL is a STUN or TURN URL
    /// - Queue capacities are non-zero
    /// - Receivers re-check liveness at least every 5 seconds
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow!("Server port cannot be 0"));
        }

        if self.webrtc.max_sessions == 0 {
            return Err(anyhow!("Max sessions must be greater than 0"));
        }

        for server in &self.webrtc.ice_servers {
            if server.kind().is_none() {
                return Err(anyhow!("Unsupported ICE server URL: {}", server.urls));
            }
        }

        if self.pipeline.frame_buffer_capacity == 0 || self.pipeline.stage_queue_capacity == 0 {
            return Err(anyhow!("Pipeline queue capacities must be greater than 0"));
        }

        if self.pipeline.receive_timeout_ms == 0 || self.pipeline.receive_timeout_ms > 5_000 {
            return Err(anyhow!("Receive timeout must be between 1 and 5000 ms"));
        }

        if self.pipeline.idle_poll_ms == 0 || self.pipeline.finalize_poll_ms == 0 {
            return Err(anyhow!("Polling intervals must be greater than 0"));
        }

        Ok(())
    }

    /// Apply a partial runtime update of the `webrtc` section.
    ///
    /// ## Partial updates:
    /// `{"webrtc": {"max_sessions": 4}}` changes only the admission limit;
    /// `{"webrtc": {"ice_servers": [...]}}` replaces the ICE server list for new sessions.
    pub fn update_from_json(&mut self, json_str: &str) -> Result<()> {
        let partial_config: serde_json::Value = serde_json::from_str(json_str)?;
        let mut updated = self.clone();

        if let Some(webrtc) = partial_config.get("webrtc") {
            if let Some(max_sessions) = webrtc.get("max_sessions").and_then(|v| v.as_u64()) {
                updated.webrtc.max_sessions = max_sessions as usize;
            }
            if let Some(servers) = webrtc.get("ice_servers") {
                updated.webrtc.ice_servers = serde_json::from_value(servers.clone())?;
            }
        }

        updated.validate()?;
        *self = updated;
        Ok(())
    }
}
