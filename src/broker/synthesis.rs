//! Synthesizer output demultiplexing.
//!
//! A synthesis result carries two streams with their own pacing: the encoded voice
//! and the mora timing. [`split_voice`] cuts the voice into transport-sized frames and
//! tags each frame with the mora active at its timestamp, so captions and visemes
//! advance in step with playback.

use crate::audio::processor::{expand_channels, float_to_pcm};
use crate::audio::resample::resample_clip;
use crate::audio::FrameShape;
use crate::error::{PipelineError, PipelineResult};
use crate::models::{Mora, SynthesisFrame, SynthesisResult};
use std::collections::VecDeque;
use std::io::Cursor;

const WAV_FORMATS: [&str; 3] = ["audio/wav", "audio/wave", "audio/x-wav"];

pub fn split_voice(result: SynthesisResult, shape: FrameShape) -> PipelineResult<Vec<SynthesisFrame>> {
    if !WAV_FORMATS.contains(&result.audio_format.as_str()) {
        return Err(PipelineError::ProtocolViolation(format!(
            "unsupported synthesized audio format: {}",
            result.audio_format
        )));
    }
    if shape.sample_rate == 0 || shape.sample_size == 0 {
        return Err(PipelineError::ProtocolViolation(format!("invalid output frame shape: {:?}", shape)));
    }

    let (voice_rate, mono) = decode_wav(&result.voice)?;
    let resampled = float_to_pcm(&resample_clip(&mono, voice_rate, shape.sample_rate)?);

    let frame_secs = shape.sample_size as f64 / shape.sample_rate as f64;
    let mut moras: VecDeque<Mora> = result.mora_queue.into();
    let mut mora = Mora::default();
    let mut timestamp = 0.0;
    let mut next_time = 0.0;

    let mut frames = Vec::with_capacity(resampled.len() / shape.sample_size + 1);
    for chunk in resampled.chunks(shape.sample_size) {
        let mut samples = chunk.to_vec();
        samples.resize(shape.sample_size, 0);

        // Moras shorter than a frame are skipped over, the frame shows the latest one
        let mut new_text = false;
        while timestamp >= next_time {
            let Some(next) = moras.pop_front() else { break };
            next_time += next.length;
            mora = next;
            new_text = true;
        }

        frames.push(SynthesisFrame {
            timestamp,
            message: result.message.clone(),
            mora: mora.clone(),
            new_text,
            samples: expand_channels(&samples, shape.channels),
        });
        timestamp += frame_secs;
    }
    Ok(frames)
}

/// Decode a WAV payload into its sample rate and a mono float signal.
fn decode_wav(voice: &[u8]) -> PipelineResult<(u32, Vec<f32>)> {
    let (header, data) = wav::read(&mut Cursor::new(voice))
        .map_err(|e| PipelineError::Decode(format!("wav: {}", e)))?;

    let interleaved: Vec<f32> = match data {
        wav::BitDepth::Eight(samples) => samples.iter().map(|&s| (s as f32 - 128.0) / 128.0).collect(),
        wav::BitDepth::Sixteen(samples) => samples.iter().map(|&s| s as f32 / 32768.0).collect(),
        wav::BitDepth::TwentyFour(samples) => samples.iter().map(|&s| s as f32 / 8_388_608.0).collect(),
        wav::BitDepth::ThirtyTwoFloat(samples) => samples,
        wav::BitDepth::Empty => Vec::new(),
    };

    let channels = header.channel_count.max(1) as usize;
    let mono = if channels == 1 {
        interleaved
    } else {
        interleaved
            .chunks_exact(channels)
            .map(|frame| frame.iter().sum::<f32>() / channels as f32)
            .collect()
    };
    Ok((header.sampling_rate, mono))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wav_bytes(rate: u32, samples: &[i16]) -> Vec<u8> {
        let mut out = Cursor::new(Vec::new());
        let header = wav::Header::new(wav::WAV_FORMAT_PCM, 1, rate, 16);
        wav::write(header, &wav::BitDepth::Sixteen(samples.to_vec()), &mut out).unwrap();
        out.into_inner()
    }

    fn result(voice: Vec<u8>, moras: Vec<(&str, f64)>) -> SynthesisResult {
        SynthesisResult {
            message: "こんにちは".into(),
            query: serde_json::Value::Null,
            mora_queue: moras
                .into_iter()
                .map(|(text, length)| Mora {
                    vowel: Some("a".into()),
                    length,
                    text: Some(text.into()),
                })
                .collect(),
            speaking_time: 0.1,
            voice,
            audio_format: "audio/wav".into(),
        }
    }

    #[test]
    fn test_frames_match_output_shape() {
        // 100ms at 48kHz mono, sliced into 20ms stereo frames
        let voice = wav_bytes(48_000, &vec![1000; 4800]);
        let frames = split_voice(result(voice, vec![]), FrameShape::default()).unwrap();

        assert_eq!(frames.len(), 5);
        for frame in &frames {
            assert_eq!(frame.samples.len(), 960 * 2);
        }
        assert!((frames[1].timestamp - 0.02).abs() < 1e-9);
    }

    #[test]
    fn test_last_frame_is_zero_padded() {
        let voice = wav_bytes(48_000, &vec![1000; 1000]);
        let frames = split_voice(result(voice, vec![]), FrameShape::default()).unwrap();

        assert_eq!(frames.len(), 2);
        let tail = &frames[1].samples;
        assert_eq!(tail.len(), 1920);
        assert_eq!(tail[(40 - 1) * 2], 1000);
        assert!(tail[40 * 2..].iter().all(|&s| s == 0));
    }

    #[test]
    fn test_new_text_marks_mora_starts() {
        // 200ms of audio, moras of 50ms and 100ms: starts at frames 0 and 3 (t=0.06 >= 0.05)
        let voice = wav_bytes(48_000, &vec![0; 9600]);
        let frames = split_voice(result(voice, vec![("コ", 0.05), ("ン", 0.1)]), FrameShape::default()).unwrap();

        let starts: Vec<usize> = frames
            .iter()
            .enumerate()
            .filter(|(_, f)| f.new_text)
            .map(|(i, _)| i)
            .collect();
        assert_eq!(starts, vec![0, 3]);
        assert_eq!(frames[2].mora.text.as_deref(), Some("コ"));
        assert_eq!(frames[9].mora.text.as_deref(), Some("ン"));
    }

    #[test]
    fn test_short_moras_catch_up_within_one_frame() {
        let voice = wav_bytes(48_000, &vec![0; 9600]);
        let moras = vec![("ア", 0.005), ("イ", 0.005), ("ウ", 0.005), ("エ", 0.1)];
        let frames = split_voice(result(voice, moras), FrameShape::default()).unwrap();

        let starts: Vec<usize> = frames
            .iter()
            .enumerate()
            .filter(|(_, f)| f.new_text)
            .map(|(i, _)| i)
            .collect();
        assert_eq!(starts, vec![0, 1]);
        assert_eq!(frames[0].mora.text.as_deref(), Some("ア"));
        // At t=0.02 the three 5ms moras are all over
        assert_eq!(frames[1].mora.text.as_deref(), Some("エ"));
        assert_eq!(frames[9].mora.text.as_deref(), Some("エ"));
    }

    #[test]
    fn test_rejects_unknown_format() {
        let mut res = result(vec![0; 16], vec![]);
        res.audio_format = "audio/ogg".into();
        let err = split_voice(res, FrameShape::default()).unwrap_err();
        assert!(matches!(err, PipelineError::ProtocolViolation(_)));
    }
}
