//! Opus codec for the WebRTC audio track.

use crate::error::{PipelineError, PipelineResult};
use audiopus::{
    coder::{Decoder, Encoder},
    packet::Packet,
    Application, Channels, MutSignals, SampleRate,
};

/// Largest Opus frame is 120ms.
const MAX_FRAME_MS: usize = 120;
const MAX_PACKET_BYTES: usize = 4000;

fn opus_rate(sample_rate: u32) -> PipelineResult<SampleRate> {
    match sample_rate {
        8000 => Ok(SampleRate::Hz8000),
        12000 => Ok(SampleRate::Hz12000),
        16000 => Ok(SampleRate::Hz16000),
        24000 => Ok(SampleRate::Hz24000),
        48000 => Ok(SampleRate::Hz48000),
        _ => Err(PipelineError::Decode(format!("Unsupported Opus sample rate: {}", sample_rate))),
    }
}

fn opus_channels(channels: u16) -> PipelineResult<Channels> {
    match channels {
        1 => Ok(Channels::Mono),
        2 => Ok(Channels::Stereo),
        _ => Err(PipelineError::Decode(format!("Unsupported Opus channel count: {}", channels))),
    }
}

pub struct OpusDecoder {
    decoder: Decoder,
    channels: u16,
    buffer: Vec<i16>,
}

impl OpusDecoder {
    pub fn new(sample_rate: u32, channels: u16) -> PipelineResult<Self> {
        let decoder = Decoder::new(opus_rate(sample_rate)?, opus_channels(channels)?)?;
        let max_samples = sample_rate as usize * MAX_FRAME_MS / 1000 * channels as usize;
        Ok(Self {
            decoder,
            channels,
            buffer: vec![0; max_samples],
        })
    }

    /// Decode one packet into interleaved samples.
    pub fn decode(&mut self, payload: &[u8]) -> PipelineResult<Vec<i16>> {
        let packet = Packet::try_from(payload)?;
        let signals = MutSignals::try_from(&mut self.buffer[..])?;
        let per_channel = self.decoder.decode(Some(packet), signals, false)?;
        Ok(self.buffer[..per_channel * self.channels as usize].to_vec())
    }
}

pub struct OpusEncoder {
    encoder: Encoder,
    buffer: Vec<u8>,
}

impl OpusEncoder {
    pub fn new(sample_rate: u32, channels: u16) -> PipelineResult<Self> {
        let encoder = Encoder::new(opus_rate(sample_rate)?, opus_channels(channels)?, Application::Voip)?;
        Ok(Self {
            encoder,
            buffer: vec![0; MAX_PACKET_BYTES],
        })
    }

    /// Encode one frame of interleaved samples (2.5 to 60ms worth).
    pub fn encode(&mut self, pcm: &[i16]) -> PipelineResult<Vec<u8>> {
        let len = self.encoder.encode(pcm, &mut self.buffer)?;
        Ok(self.buffer[..len].to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_decode_keeps_frame_length() {
        let mut encoder = OpusEncoder::new(48_000, 2).unwrap();
        let mut decoder = OpusDecoder::new(48_000, 2).unwrap();

        let frame = vec![0i16; 960 * 2];
        let packet = encoder.encode(&frame).unwrap();
        assert!(!packet.is_empty());

        let decoded = decoder.decode(&packet).unwrap();
        assert_eq!(decoded.len(), 960 * 2);
    }

    #[test]
    fn test_rejects_unsupported_rate() {
        assert!(OpusDecoder::new(44_100, 2).is_err());
        assert!(OpusEncoder::new(48_000, 3).is_err());
    }
}
