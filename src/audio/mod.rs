//! # Audio Processing Module
//!
//! Audio plumbing between the WebRTC track and the pipeline workers.
//!
//! ## Key Components:
//! - **Frame Buffer**: Lossy ring of PCM chunks waiting for the extractor link
//! - **Audio Processor**: Sample format, channel layout and byte conversions
//! - **Resampler**: Streaming rate conversion (rubato)
//! - **Codec**: Opus decode/encode for the RTP track (audiopus)
//!
//! ## Pipeline input format:
//! - **Sample Rate**: 16kHz (16,000 Hz)
//! - **Bit Depth**: 16-bit PCM, little-endian
//! - **Channels**: Mono (1 channel)
//!
//! ## Transport format:
//! Whatever the peer sends; for Opus over WebRTC that is 48kHz stereo in 20ms frames.

pub mod buffer;       // Lossy frame buffer feeding the extractor
pub mod codec;        // Opus decoder/encoder
pub mod processor;    // Sample and byte conversions
pub mod resample;     // Streaming resampler

pub use buffer::FrameBuffer;
pub use resample::StreamResampler;

/// Sample rate every worker expects on its input.
pub const PIPELINE_SAMPLE_RATE: u32 = 16_000;

/// Shape of the frames the transport is exchanging with us.
///
/// The adapter updates it from every inbound frame so synthesized audio is cut to
/// exactly what the transport is using.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameShape {
    pub sample_rate: u32,
    /// Samples per channel in one frame
    pub sample_size: usize,
    pub channels: u16,
}

impl Default for FrameShape {
    fn default() -> Self {
        // 20ms of Opus audio
        Self {
            sample_rate: 48_000,
            sample_size: 960,
            channels: 2,
        }
    }
}

/// One block of interleaved 16-bit audio.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFrame {
    pub sample_rate: u32,
    pub channels: u16,
    pub samples_per_channel: usize,
    pub data: Vec<i16>,
}

impl AudioFrame {
    pub fn new(sample_rate: u32, channels: u16, data: Vec<i16>) -> Self {
        let samples_per_channel = data.len() / channels.max(1) as usize;
        Self {
            sample_rate,
            channels,
            samples_per_channel,
            data,
        }
    }

    pub fn shape(&self) -> FrameShape {
        FrameShape {
            sample_rate: self.sample_rate,
            sample_size: self.samples_per_channel,
            channels: self.channels,
        }
    }

    /// Zeroed frame with this frame's format, layout and length.
    pub fn silence_like(&self) -> Self {
        Self::silence(self.shape())
    }

    pub fn silence(shape: FrameShape) -> Self {
        Self {
            sample_rate: shape.sample_rate,
            channels: shape.channels,
            samples_per_channel: shape.sample_size,
            data: vec![0; shape.sample_size * shape.channels as usize],
        }
    }

    /// Frame duration in seconds.
    pub fn duration_secs(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.samples_per_channel as f64 / self.sample_rate as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_silence_keeps_shape() {
        let frame = AudioFrame::new(48_000, 2, vec![7; 1920]);
        let silent = frame.silence_like();
        assert_eq!(silent.shape(), frame.shape());
        assert_eq!(silent.data.len(), 1920);
        assert!(silent.data.iter().all(|&s| s == 0));
        assert!((frame.duration_secs() - 0.02).abs() < 1e-9);
    }
}
