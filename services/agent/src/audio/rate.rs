//! Sample-rate conversion between the wire format and what a device runs at.

use super::AudioError;
use crate::audio_utils::create_resampler;
use rubato::{FastFixedIn, Resampler};

/// Converts mono f32 audio from one rate to another in fixed-size chunks.
///
/// Input that does not fill a chunk is held until more arrives or
/// [`RateConverter::drain`] is called.
pub(crate) enum RateConverter {
    Passthrough,
    Resample {
        resampler: FastFixedIn<f32>,
        pending: Vec<f32>,
    },
}

impl RateConverter {
    pub(crate) fn new(from: u32, to: u32, chunk: usize) -> Result<Self, AudioError> {
        if from == to {
            return Ok(Self::Passthrough);
        }
        let resampler = create_resampler(from as f64, to as f64, chunk)
            .map_err(|e| AudioError::Resampler(e.to_string()))?;
        Ok(Self::Resample {
            resampler,
            pending: Vec::with_capacity(chunk * 2),
        })
    }

    pub(crate) fn process(&mut self, samples: &[f32]) -> Result<Vec<f32>, AudioError> {
        match self {
            Self::Passthrough => Ok(samples.to_vec()),
            Self::Resample { resampler, pending } => {
                pending.extend_from_slice(samples);
                let mut out = Vec::new();
                while pending.len() >= resampler.input_frames_next() {
                    let needed = resampler.input_frames_next();
                    let chunk = resampler
                        .process(&[&pending[..needed]], None)
                        .map_err(|e| AudioError::Resampler(e.to_string()))?;
                    out.extend_from_slice(&chunk[0]);
                    pending.drain(..needed);
                }
                Ok(out)
            }
        }
    }

    /// Resamples the partial chunk left over from the last `process` call,
    /// padding it with silence.
    pub(crate) fn drain(&mut self) -> Result<Vec<f32>, AudioError> {
        match self {
            Self::Resample { resampler, pending } if !pending.is_empty() => {
                let chunk = resampler
                    .process_partial(Some(&[&pending[..]][..]), None)
                    .map_err(|e| AudioError::Resampler(e.to_string()))?;
                pending.clear();
                Ok(chunk.into_iter().next().unwrap_or_default())
            }
            _ => Ok(Vec::new()),
        }
    }

    pub(crate) fn reset(&mut self) {
        if let Self::Resample { resampler, pending } = self {
            resampler.reset();
            pending.clear();
        }
    }
}
