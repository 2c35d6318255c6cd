//! Moves audio between the inbound RTP track, the adapter and the outbound track.

use super::adapter::{AdapterOutput, MediaTrackAdapter};
use super::session::VoiceChatSession;
use crate::audio::codec::{OpusDecoder, OpusEncoder};
use crate::audio::AudioFrame;
use crate::error::PipelineResult;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;
use webrtc::media::Sample;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_remote::TrackRemote;

/// Opus over WebRTC always runs a 48kHz clock; browsers send stereo-capable streams.
pub const TRACK_SAMPLE_RATE: u32 = 48_000;
pub const TRACK_CHANNELS: u16 = 2;

pub struct TrackPump {
    session: Arc<VoiceChatSession>,
    inbound: Arc<TrackRemote>,
    outbound: Arc<TrackLocalStaticSample>,
    adapter: MediaTrackAdapter,
    idle_poll: Duration,
}

impl TrackPump {
    pub fn new(
        session: Arc<VoiceChatSession>,
        inbound: Arc<TrackRemote>,
        outbound: Arc<TrackLocalStaticSample>,
        adapter: MediaTrackAdapter,
        idle_poll: Duration,
    ) -> Self {
        Self {
            session,
            inbound,
            outbound,
            adapter,
            idle_poll,
        }
    }

    /// Pump until the session finalizes or the inbound track ends, then close the
    /// adapter. Closing the adapter finalizes the session, so a pump that stops on its
    /// own always takes the session down with it.
    pub async fn run(mut self) {
        if let Err(e) = self.pump().await {
            error!(error = %e, "Track pump failed");
            self.adapter.broker().liveness().clear("track pump failed");
        }
        self.adapter.close().await;
        info!("Track pump stopped");
    }

    async fn pump(&mut self) -> PipelineResult<()> {
        let mut decoder = OpusDecoder::new(TRACK_SAMPLE_RATE, TRACK_CHANNELS)?;
        let mut encoder = OpusEncoder::new(TRACK_SAMPLE_RATE, TRACK_CHANNELS)?;
        let finalize = self.session.finalize().clone();

        while finalize.is_live() {
            let packet = match tokio::time::timeout(self.idle_poll, self.inbound.read_rtp()).await {
                Err(_) => continue,
                Ok(Ok((packet, _))) => packet,
                Ok(Err(e)) => {
                    info!(reason = %e, "Inbound track ended");
                    return Ok(());
                }
            };
            if packet.payload.is_empty() {
                continue;
            }

            let pcm = match decoder.decode(&packet.payload) {
                Ok(pcm) => pcm,
                Err(e) => {
                    debug!(error = %e, "Skipping undecodable packet");
                    continue;
                }
            };
            let frame = AudioFrame::new(TRACK_SAMPLE_RATE, TRACK_CHANNELS, pcm);
            let output = self.adapter.transform(&frame);
            self.deliver(output, &mut encoder).await?;
        }
        Ok(())
    }

    async fn deliver(&self, output: AdapterOutput, encoder: &mut OpusEncoder) -> PipelineResult<()> {
        if let Some(text) = output.text {
            send_text(self.session.text_channel(), text).await;
        }
        if let Some(telop) = output.telop {
            send_text(self.session.telop_channel(), telop).await;
        }

        let encoded = encoder.encode(&output.frame.data)?;
        self.outbound
            .write_sample(&Sample {
                data: Bytes::from(encoded),
                duration: Duration::from_secs_f64(output.frame.duration_secs()),
                ..Default::default()
            })
            .await?;
        Ok(())
    }
}

/// Best effort: a channel that is not open yet (or any more) just misses the message.
async fn send_text(channel: Option<Arc<RTCDataChannel>>, payload: String) {
    let Some(channel) = channel else {
        return;
    };
    if channel.ready_state() != RTCDataChannelState::Open {
        return;
    }
    if let Err(e) = channel.send_text(payload).await {
        warn!(label = channel.label(), error = %e, "Data channel send failed");
    }
}
