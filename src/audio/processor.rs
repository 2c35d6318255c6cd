//! # Audio Format Conversion
//!
//! Sample format, channel layout and byte-level conversions used between the
//! transport (interleaved i16), the resampler (mono f32) and the workers
//! (little-endian PCM bytes).

use byteorder::{LittleEndian, WriteBytesExt};

/// Scale 16-bit samples into [-1.0, 1.0].
pub fn pcm_to_float(samples: &[i16]) -> Vec<f32> {
    samples.iter().map(|&sample| sample as f32 / 32768.0).collect()
}

/// Inverse of [`pcm_to_float`], clamping anything out of range.
pub fn float_to_pcm(samples: &[f32]) -> Vec<i16> {
    samples
        .iter()
        .map(|&sample| (sample * 32768.0).clamp(-32768.0, 32767.0) as i16)
        .collect()
}

/// Average interleaved channels into one mono f32 signal.
pub fn downmix_to_mono(interleaved: &[i16], channels: u16) -> Vec<f32> {
    let channels = channels.max(1) as usize;
    if channels == 1 {
        return pcm_to_float(interleaved);
    }

    interleaved
        .chunks_exact(channels)
        .map(|frame| frame.iter().map(|&s| s as f32).sum::<f32>() / (channels as f32 * 32768.0))
        .collect()
}

/// Copy a mono signal into every channel of an interleaved buffer.
pub fn expand_channels(mono: &[i16], channels: u16) -> Vec<i16> {
    let channels = channels.max(1) as usize;
    if channels == 1 {
        return mono.to_vec();
    }

    let mut interleaved = Vec::with_capacity(mono.len() * channels);
    for &sample in mono {
        interleaved.extend(std::iter::repeat(sample).take(channels));
    }
    interleaved
}

/// Serialize samples as little-endian 16-bit PCM, the extractor's wire format.
pub fn pcm_to_bytes(samples: &[i16]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(samples.len() * 2);
    for &sample in samples {
        // Writing into a Vec cannot fail
        let _ = bytes.write_i16::<LittleEndian>(sample);
    }
    bytes
}
