use crate::broker::Liveness;
use crate::error::{PipelineError, PipelineResult};
use crate::models::TalkMode;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use webrtc::data_channel::RTCDataChannel;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;

pub const TELOP_CHANNEL: &str = "telop_ch";
pub const TEXT_CHANNEL: &str = "text_ch";

/// Where a session is in its lifetime.
///
/// `Negotiating -> Connected -> {Failed -> Closing, Closed}`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Negotiating,
    Connected,
    Failed,
    Closing,
    Closed,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Negotiating => "negotiating",
            SessionState::Connected => "connected",
            SessionState::Failed => "failed",
            SessionState::Closing => "closing",
            SessionState::Closed => "closed",
        }
    }
}

/// Everything one browser connection owns.
///
/// Callbacks registered on the peer connection hold a `Weak` to this, so the peer and
/// the session never keep each other alive.
pub struct VoiceChatSession {
    session_id: String,
    talk_mode: TalkMode,
    peer: Arc<RTCPeerConnection>,
    telop_ch: Mutex<Option<Arc<RTCDataChannel>>>,
    text_ch: Mutex<Option<Arc<RTCDataChannel>>>,
    state: Mutex<SessionState>,
    pump: Mutex<Option<JoinHandle<()>>>,
    track_seen: AtomicBool,
    finalize: Liveness,
    join_timeout: Duration,
    closed: AtomicBool,
}

impl VoiceChatSession {
    pub fn new(
        session_id: &str,
        talk_mode: TalkMode,
        peer: Arc<RTCPeerConnection>,
        finalize: Liveness,
        join_timeout: Duration,
    ) -> Self {
        Self {
            session_id: session_id.to_string(),
            talk_mode,
            peer,
            telop_ch: Mutex::new(None),
            text_ch: Mutex::new(None),
            state: Mutex::new(SessionState::Negotiating),
            pump: Mutex::new(None),
            track_seen: AtomicBool::new(false),
            finalize,
            join_timeout,
            closed: AtomicBool::new(false),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn talk_mode(&self) -> TalkMode {
        self.talk_mode
    }

    pub fn peer(&self) -> &Arc<RTCPeerConnection> {
        &self.peer
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    pub fn set_state(&self, state: SessionState) {
        let mut current = self.state.lock();
        if *current != state {
            debug!(from = current.as_str(), to = state.as_str(), "Session state changed");
            *current = state;
        }
    }

    /// Cleared when the session should be torn down. Never set again.
    pub fn finalize(&self) -> &Liveness {
        &self.finalize
    }

    /// Bind a data channel opened by the peer to its slot.
    ///
    /// Only `telop_ch` and `text_ch` are accepted, once each.
    pub fn bind_channel(&self, channel: Arc<RTCDataChannel>) -> PipelineResult<()> {
        let label = channel.label().to_string();
        let slot = match label.as_str() {
            TELOP_CHANNEL => &self.telop_ch,
            TEXT_CHANNEL => &self.text_ch,
            _ => return Err(PipelineError::ProtocolViolation(format!("Unknown data channel: {}", label))),
        };

        let mut slot = slot.lock();
        if slot.is_some() {
            return Err(PipelineError::ProtocolViolation(format!("Duplicate data channel: {}", label)));
        }
        *slot = Some(channel);
        info!(label, "Data channel bound");
        Ok(())
    }

    pub fn telop_channel(&self) -> Option<Arc<RTCDataChannel>> {
        self.telop_ch.lock().clone()
    }

    pub fn text_channel(&self) -> Option<Arc<RTCDataChannel>> {
        self.text_ch.lock().clone()
    }

    /// Claim the single audio track slot. Returns `false` if a track already arrived.
    fn claim_track(&self) -> bool {
        !self.track_seen.swap(true, Ordering::AcqRel)
    }

    /// Accept the first audio track. A track of another kind, or a second one, is a
    /// protocol violation and finalizes the session.
    pub fn admit_track(&self, kind: RTPCodecType) -> PipelineResult<()> {
        let violation = if kind != RTPCodecType::Audio {
            format!("Unexpected {} track", kind)
        } else if !self.claim_track() {
            "Second audio track".to_string()
        } else {
            return Ok(());
        };
        self.finalize.clear("unexpected track");
        Err(PipelineError::ProtocolViolation(violation))
    }

    pub fn attach_pump(&self, handle: JoinHandle<()>) {
        *self.pump.lock() = Some(handle);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Tear the session down: stop the track pump (which closes its broker), close both
    /// data channels and the peer connection.
    ///
    /// Idempotent; concurrent callers return immediately.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.set_state(SessionState::Closing);
        self.finalize.clear("session closing");

        let pump = self.pump.lock().take();
        if let Some(mut pump) = pump {
            if tokio::time::timeout(self.join_timeout, &mut pump).await.is_err() {
                warn!(session_id = %self.session_id, "Track pump did not stop in time, aborting");
                pump.abort();
            }
        }

        let channels = [self.telop_ch.lock().take(), self.text_ch.lock().take()];
        for channel in channels.into_iter().flatten() {
            if let Err(e) = channel.close().await {
                debug!(label = channel.label(), error = %e, "Data channel already closed");
            }
        }

        if let Err(e) = self.peer.close().await {
            warn!(session_id = %self.session_id, error = %e, "Peer connection close failed");
        }
        self.set_state(SessionState::Closed);
        info!(session_id = %self.session_id, "RTC connection closed");
    }
}
