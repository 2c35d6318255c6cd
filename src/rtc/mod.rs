//! # RTC Session Layer
//!
//! WebRTC side of the service.
//!
//! ## Key Components:
//! - **Session Manager**: Creates, sweeps and shuts down sessions
//! - **Session Process**: Negotiates one peer connection and serves it until finalized
//! - **Voice Chat Session**: Peer connection, data channels and teardown of one browser
//! - **Track Pump**: RTP in, Opus decode, adapter, Opus encode, RTP out
//! - **Media Track Adapter**: Real-time bridge between audio frames and the audio broker

pub mod adapter;
pub mod manager;
pub mod process;
pub mod pump;
pub mod session;

pub use adapter::{AdapterOutput, MediaTrackAdapter};
pub use manager::SessionManager;
pub use process::SessionContext;
pub use session::{SessionState, VoiceChatSession};
