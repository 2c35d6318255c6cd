//! Streaming sample-rate conversion on top of rubato's FFT resampler.

use crate::error::{PipelineError, PipelineResult};
use rubato::{FftFixedIn, Resampler};

const RESAMPLER_CHUNK_SIZE: usize = 1024;

/// Mono resampler that accepts arbitrarily sized input blocks.
///
/// Input is collected until the resampler has a full chunk; leftovers carry over to
/// the next call. With equal rates the input passes through untouched.
pub struct StreamResampler {
    resampler: Option<FftFixedIn<f32>>,
    in_hz: u32,
    out_hz: u32,
    in_buf: Vec<f32>,
}

impl StreamResampler {
    pub fn new(in_hz: u32, out_hz: u32) -> PipelineResult<Self> {
        let resampler = if in_hz == out_hz {
            None
        } else {
            let resampler = FftFixedIn::<f32>::new(
                in_hz as usize,
                out_hz as usize,
                RESAMPLER_CHUNK_SIZE,
                1,
                1,
            )
            .map_err(|e| PipelineError::Decode(format!("cannot resample {} -> {}: {}", in_hz, out_hz, e)))?;
            Some(resampler)
        };

        Ok(Self {
            resampler,
            in_hz,
            out_hz,
            in_buf: Vec::with_capacity(RESAMPLER_CHUNK_SIZE),
        })
    }

    pub fn input_rate(&self) -> u32 {
        self.in_hz
    }

    /// Feed samples, returning whatever output is ready.
    pub fn process(&mut self, mut src: &[f32]) -> PipelineResult<Vec<f32>> {
        let Some(resampler) = self.resampler.as_mut() else {
            return Ok(src.to_vec());
        };

        let mut out = Vec::new();
        while !src.is_empty() {
            let needed = resampler.input_frames_next();
            let take = (needed - self.in_buf.len()).min(src.len());
            self.in_buf.extend_from_slice(&src[..take]);
            src = &src[take..];

            if self.in_buf.len() == needed {
                let chunk = resampler
                    .process(&[&self.in_buf[..]], None)
                    .map_err(|e| PipelineError::Decode(format!("resampler: {}", e)))?;
                out.extend_from_slice(&chunk[0]);
                self.in_buf.clear();
            }
        }
        Ok(out)
    }

    /// Push out the carried-over tail, zero padded, trimmed to its proportional length.
    pub fn flush(&mut self) -> PipelineResult<Vec<f32>> {
        let Some(resampler) = self.resampler.as_mut() else {
            return Ok(Vec::new());
        };
        if self.in_buf.is_empty() {
            return Ok(Vec::new());
        }

        let remaining = self.in_buf.len();
        let needed = resampler.input_frames_next();
        self.in_buf.resize(needed, 0.0);
        let chunk = resampler
            .process(&[&self.in_buf[..]], None)
            .map_err(|e| PipelineError::Decode(format!("resampler: {}", e)))?;
        self.in_buf.clear();

        let out_len = (remaining as f64 * self.out_hz as f64 / self.in_hz as f64).round() as usize;
        Ok(chunk[0][..out_len.min(chunk[0].len())].to_vec())
    }
}

/// Resample a complete clip in one go.
pub fn resample_clip(samples: &[f32], in_hz: u32, out_hz: u32) -> PipelineResult<Vec<f32>> {
    let mut resampler = StreamResampler::new(in_hz, out_hz)?;
    let mut out = resampler.process(samples)?;
    out.extend(resampler.flush()?);
    Ok(out)
}
