//! # Session Process
//!
//! One WebRTC peer connection and the pipeline behind it, from offer to teardown.
//!
//! ## Lifecycle:
//! 1. Build the peer connection with the configured ICE servers
//! 2. Add the outbound Opus track, apply the offer, create the answer
//! 3. Hand the answer back over a oneshot channel
//! 4. Poll the finalize flag until something clears it, then close everything
//!
//! ## Fatal protocol violations:
//! - A data channel other than `telop_ch` / `text_ch`, or one of them twice
//! - A non-audio track, or a second track

use super::adapter::MediaTrackAdapter;
use super::pump::{TrackPump, TRACK_CHANNELS, TRACK_SAMPLE_RATE};
use super::session::{SessionState, VoiceChatSession};
use crate::broker::{AudioBroker, BrokerSettings, Liveness, WorkerDirectory};
use crate::config::{IceServerConfig, IceServerKind};
use crate::error::{PipelineError, PipelineResult};
use crate::models::{SessionAnswer, SessionOffer};
use serde_json::json;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{error, info, warn, Instrument, Span};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS};
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_credential_type::RTCIceCredentialType;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

/// Everything a session needs from the service, copied at creation time.
#[derive(Clone)]
pub struct SessionContext {
    pub ice_servers: Vec<IceServerConfig>,
    pub directory: Arc<dyn WorkerDirectory>,
    pub broker: BrokerSettings,
    pub finalize_poll: Duration,
    pub answer_timeout: Duration,
}

impl SessionContext {
    /// How long a caller waits for the answer. Longer than the ICE gathering wait so a
    /// gathering timeout reaches the caller as such.
    pub fn answer_deadline(&self) -> Duration {
        self.answer_timeout + self.finalize_poll
    }
}

pub struct SessionProcess {
    session_id: String,
    context: SessionContext,
    finalize: Liveness,
}

impl SessionProcess {
    pub fn new(session_id: &str, context: SessionContext, finalize: Liveness) -> Self {
        Self {
            session_id: session_id.to_string(),
            context,
            finalize,
        }
    }

    /// Negotiate, send the answer, then serve until finalized.
    pub async fn run(self, offer: SessionOffer, answer_tx: oneshot::Sender<PipelineResult<SessionAnswer>>) {
        let session = match self.negotiate(&offer).await {
            Ok((session, answer)) => {
                if answer_tx.send(Ok(answer)).is_err() {
                    warn!("Nobody is waiting for the answer any more");
                    self.finalize.clear("answer abandoned");
                }
                session
            }
            Err(e) => {
                error!(error = %e, "Negotiation failed");
                self.finalize.clear("negotiation failed");
                let _ = answer_tx.send(Err(e));
                return;
            }
        };

        let mut ticker = tokio::time::interval(self.context.finalize_poll);
        while self.finalize.is_live() {
            ticker.tick().await;
        }
        info!("RTC session loop terminated");
        session.close().await;
    }

    async fn negotiate(&self, offer: &SessionOffer) -> PipelineResult<(Arc<VoiceChatSession>, SessionAnswer)> {
        if offer.sdp_type != "offer" {
            return Err(PipelineError::Negotiation(format!("Expected an offer, got {}", offer.sdp_type)));
        }

        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;
        let registry = register_default_interceptors(Registry::new(), &mut media_engine)?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers: rtc_ice_servers(&self.context.ice_servers),
            ..Default::default()
        };
        let peer = Arc::new(api.new_peer_connection(config).await?);
        let session = Arc::new(VoiceChatSession::new(
            &self.session_id,
            offer.talk_mode,
            peer,
            self.finalize.clone(),
            self.context.broker.join_timeout,
        ));

        match self.answer(&session, offer).await {
            Ok(answer) => Ok((session, answer)),
            Err(e) => {
                session.close().await;
                Err(e)
            }
        }
    }

    async fn answer(&self, session: &Arc<VoiceChatSession>, offer: &SessionOffer) -> PipelineResult<SessionAnswer> {
        let peer = session.peer().clone();

        // Added before the offer is applied so the answer sends audio back on the same m-line
        let outbound = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                clock_rate: TRACK_SAMPLE_RATE,
                channels: TRACK_CHANNELS,
                ..Default::default()
            },
            "audio".to_owned(),
            format!("avatar-{}", short_id(&self.session_id)),
        ));
        let rtp_sender = peer
            .add_track(Arc::clone(&outbound) as Arc<dyn TrackLocal + Send + Sync>)
            .await?;
        tokio::spawn(async move {
            let mut rtcp_buf = vec![0u8; 1500];
            while rtp_sender.read(&mut rtcp_buf).await.is_ok() {}
        });

        self.register_handlers(session, outbound);

        peer.set_remote_description(RTCSessionDescription::offer(offer.sdp.clone())?)
            .await?;
        let answer = peer.create_answer(None).await?;
        let mut gathering = peer.gathering_complete_promise().await;
        peer.set_local_description(answer).await?;
        if tokio::time::timeout(self.context.answer_timeout, gathering.recv()).await.is_err() {
            return Err(PipelineError::Timeout("ICE gathering did not complete".into()));
        }

        let local = peer
            .local_description()
            .await
            .ok_or_else(|| PipelineError::Negotiation("No local description".into()))?;
        info!(talk_mode = offer.talk_mode.as_str(), "Answer created");
        Ok(SessionAnswer {
            sdp: local.sdp,
            sdp_type: local.sdp_type.to_string(),
            session_id: self.session_id.clone(),
        })
    }

    fn register_handlers(&self, session: &Arc<VoiceChatSession>, outbound: Arc<TrackLocalStaticSample>) {
        let peer = session.peer();
        let span = Span::current();

        let weak = Arc::downgrade(session);
        let handler_span = span.clone();
        peer.on_data_channel(Box::new(move |channel: Arc<RTCDataChannel>| {
            let weak = weak.clone();
            Box::pin(
                async move {
                    let Some(session) = weak.upgrade() else {
                        return;
                    };
                    info!(label = channel.label(), "Data channel opened by peer");
                    match session.bind_channel(channel.clone()) {
                        Ok(()) => greet(&channel),
                        Err(e) => {
                            error!(error = %e, "Rejecting data channel");
                            session.finalize().clear("unexpected data channel");
                        }
                    }
                }
                .instrument(handler_span.clone()),
            )
        }));

        let weak = Arc::downgrade(session);
        let handler_span = span.clone();
        peer.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let weak = weak.clone();
            Box::pin(
                async move {
                    info!(state = %state, "Peer connection state changed");
                    let Some(session) = weak.upgrade() else {
                        return;
                    };
                    match state {
                        RTCPeerConnectionState::Connected => session.set_state(SessionState::Connected),
                        RTCPeerConnectionState::Failed if !session.is_closed() => {
                            session.set_state(SessionState::Failed);
                            tokio::spawn(async move { session.close().await }.in_current_span());
                        }
                        RTCPeerConnectionState::Closed => {
                            session.finalize().clear("peer connection closed");
                        }
                        _ => {}
                    }
                }
                .instrument(handler_span.clone()),
            )
        }));

        let weak = Arc::downgrade(session);
        let context = self.context.clone();
        peer.on_track(Box::new(move |track: Arc<TrackRemote>, _receiver, _transceiver| {
            let weak = weak.clone();
            let outbound = outbound.clone();
            let context = context.clone();
            let pump_span = span.clone();
            Box::pin(
                async move {
                    let Some(session) = weak.upgrade() else {
                        return;
                    };
                    accept_track(session, track, outbound, context, pump_span);
                }
                .instrument(span.clone()),
            )
        }));
    }
}

/// Start the pump for the first audio track; anything else ends the session.
fn accept_track(
    session: Arc<VoiceChatSession>,
    track: Arc<TrackRemote>,
    outbound: Arc<TrackLocalStaticSample>,
    context: SessionContext,
    span: Span,
) {
    let kind = track.kind();
    info!(kind = %kind, "Track received");
    if let Err(e) = session.admit_track(kind) {
        error!(error = %e, "Rejecting track");
        return;
    }

    let pump_session = session.clone();
    let handle = tokio::spawn(
        async move {
            let broker = AudioBroker::connect(
                pump_session.session_id(),
                pump_session.talk_mode(),
                context.directory.as_ref(),
                &context.broker,
            )
            .await;
            let adapter = MediaTrackAdapter::new(broker, pump_session.finalize().clone());
            TrackPump::new(pump_session, track, outbound, adapter, context.broker.link.idle_poll)
                .run()
                .await;
        }
        .instrument(span),
    );
    session.attach_pump(handle);
}

/// Say hello when the channel opens and answer every message with a pong.
fn greet(channel: &Arc<RTCDataChannel>) {
    let label = channel.label().to_string();

    let weak: Weak<RTCDataChannel> = Arc::downgrade(channel);
    let hello = json!({ "status": "hello", "label": label }).to_string();
    channel.on_open(Box::new(move || {
        Box::pin(async move {
            if let Some(channel) = weak.upgrade() {
                if let Err(e) = channel.send_text(hello).await {
                    warn!(error = %e, "Greeting failed");
                }
            }
        })
    }));

    let weak: Weak<RTCDataChannel> = Arc::downgrade(channel);
    channel.on_message(Box::new(move |message: DataChannelMessage| {
        let weak = weak.clone();
        let label = label.clone();
        Box::pin(async move {
            info!(label, message = %String::from_utf8_lossy(&message.data), "Data channel message");
            if let Some(channel) = weak.upgrade() {
                let pong = json!({ "status": "pong", "label": label }).to_string();
                let _ = channel.send_text(pong).await;
            }
        })
    }));
}

/// Map configured servers to webrtc-rs ones. Credentials only go to TURN servers.
pub fn rtc_ice_servers(servers: &[IceServerConfig]) -> Vec<RTCIceServer> {
    servers
        .iter()
        .map(|server| match server.kind() {
            Some(IceServerKind::Turn) => RTCIceServer {
                urls: vec![server.urls.clone()],
                username: server.username.clone().unwrap_or_default(),
                credential: server.credential.clone().unwrap_or_default(),
                credential_type: RTCIceCredentialType::Password,
            },
            _ => RTCIceServer {
                urls: vec![server.urls.clone()],
                ..Default::default()
            },
        })
        .collect()
}

/// Last five characters of a session id, used in span fields and track ids.
pub fn short_id(session_id: &str) -> &str {
    let start = session_id.len().saturating_sub(5);
    session_id.get(start..).unwrap_or(session_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::StaticDirectory;
    use crate::config::{PipelineConfig, WorkersConfig};

    #[test]
    fn test_credentials_only_for_turn() {
        let servers = rtc_ice_servers(&[
            IceServerConfig {
                urls: "stun:stun.example.com:3478".into(),
                username: Some("ignored".into()),
                credential: Some("ignored".into()),
            },
            IceServerConfig {
                urls: "turn:turn.example.com:3478".into(),
                username: Some("avatar".into()),
                credential: Some("secret".into()),
            },
        ]);
        assert_eq!(servers[0].username, "");
        assert_eq!(servers[0].credential, "");
        assert_eq!(servers[1].username, "avatar");
        assert_eq!(servers[1].credential, "secret");
        assert_eq!(servers[1].urls, vec!["turn:turn.example.com:3478".to_string()]);
    }

    #[test]
    fn test_answer_deadline_outlasts_gathering_wait() {
        let context = SessionContext {
            ice_servers: Vec::new(),
            directory: Arc::new(StaticDirectory::new(WorkersConfig::default())),
            broker: BrokerSettings::from_config(&PipelineConfig::default(), &WorkersConfig::default()),
            finalize_poll: Duration::from_millis(1000),
            answer_timeout: Duration::from_secs(30),
        };
        assert_eq!(context.answer_deadline(), Duration::from_secs(31));
        assert!(context.answer_deadline() > context.answer_timeout);
    }

    #[test]
    fn test_short_id() {
        assert_eq!(short_id("0190b2f4-7e1c-7a3b-9c2d-4f5e6a7b8c9d"), "b8c9d");
        assert_eq!(short_id("abc"), "abc");
    }
}
