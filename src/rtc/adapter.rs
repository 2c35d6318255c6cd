//! # Media Track Adapter
//!
//! Sits in the outbound media path. For every inbound frame it feeds the broker and
//! returns exactly one outbound frame of the same shape, plus whatever data-channel
//! payloads became ready.
//!
//! ## Real-time contract:
//! - `transform` never blocks and never fails
//! - The returned frame always has the inbound frame's rate, layout and length
//! - With nothing synthesized (or a dead broker) the frame is silence
//!
//! Once the broker is gone and its last caption went out, the adapter clears the
//! session's finalize flag so the whole session is torn down.

use crate::audio::processor::{downmix_to_mono, float_to_pcm};
use crate::audio::{AudioFrame, StreamResampler, PIPELINE_SAMPLE_RATE};
use crate::broker::{AudioBroker, Liveness};
use crate::error::PipelineResult;
use tracing::{debug, warn};

/// What the transport sends for one inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub struct AdapterOutput {
    pub frame: AudioFrame,
    /// JSON chat message for `text_ch`
    pub text: Option<String>,
    /// JSON caption/viseme parameters for `telop_ch`
    pub telop: Option<String>,
}

pub struct MediaTrackAdapter {
    broker: AudioBroker,
    finalize: Liveness,
    resampler: Option<StreamResampler>,
    frames_in: u64,
    silent_frames_out: u64,
}

impl MediaTrackAdapter {
    pub fn new(broker: AudioBroker, finalize: Liveness) -> Self {
        Self {
            broker,
            finalize,
            resampler: None,
            frames_in: 0,
            silent_frames_out: 0,
        }
    }

    pub fn broker(&self) -> &AudioBroker {
        &self.broker
    }

    pub fn is_live(&self) -> bool {
        self.broker.is_live()
    }

    /// Turn one inbound frame into one outbound frame.
    pub fn transform(&mut self, frame: &AudioFrame) -> AdapterOutput {
        self.frames_in += 1;

        if self.broker.is_live() {
            if let Err(e) = self.feed(frame) {
                warn!(session_id = %self.broker.session_id(), error = %e, "Inbound frame rejected");
                self.broker.liveness().clear("media track adapter failed");
            }
        }

        // Captions keep flowing after the broker died so its error message gets through
        let text = self.broker.try_next_caption().map(|caption| caption.to_json());
        if text.is_none() && !self.broker.is_live() {
            self.finalize.clear("audio broker stopped");
        }

        let mut telop = None;
        let voice = if self.broker.is_live() {
            self.broker.try_next_voice_frame()
        } else {
            None
        };
        let out = match voice {
            Some(voice) if voice.samples.len() == frame.data.len() => {
                if voice.new_text {
                    telop = Some(voice.telop().to_json());
                }
                AudioFrame::new(frame.sample_rate, frame.channels, voice.samples)
            }
            Some(voice) => {
                debug!(
                    expected = frame.data.len(),
                    got = voice.samples.len(),
                    "Voice frame cut for a previous shape, sending silence"
                );
                self.silent_frames_out += 1;
                frame.silence_like()
            }
            None => {
                self.silent_frames_out += 1;
                frame.silence_like()
            }
        };

        AdapterOutput { frame: out, text, telop }
    }

    fn feed(&mut self, frame: &AudioFrame) -> PipelineResult<()> {
        self.broker.set_output_format(frame.shape());

        let resampler = match self.resampler.take() {
            Some(resampler) if resampler.input_rate() == frame.sample_rate => resampler,
            _ => StreamResampler::new(frame.sample_rate, PIPELINE_SAMPLE_RATE)?,
        };
        let resampler = self.resampler.insert(resampler);

        let mono = downmix_to_mono(&frame.data, frame.channels);
        let resampled = resampler.process(&mono)?;
        if !resampled.is_empty() {
            self.broker.push_frame(&float_to_pcm(&resampled))?;
        }
        Ok(())
    }

    /// Close the broker behind this track and finalize the session.
    pub async fn close(&mut self) {
        debug!(
            session_id = %self.broker.session_id(),
            frames_in = self.frames_in,
            silent_frames_out = self.silent_frames_out,
            dropped_frames = self.broker.dropped_frames(),
            output_format = ?self.broker.output_format(),
            "Closing media track adapter"
        );
        self.broker.close().await;
        self.finalize.clear("media track adapter closed");
    }
}
