use bytes::Bytes;
use rubato::{FastFixedIn, PolynomialDegree};

/// Microphone audio is sent as 48 kHz mono linear16.
pub const CAPTURE_SAMPLE_RATE: u32 = 48_000;
/// Agent speech arrives as 16 kHz mono linear16.
pub const PLAYBACK_SAMPLE_RATE: u32 = 16_000;
/// 50 ms of capture audio per outbound frame.
pub const CAPTURE_SAMPLES_PER_FRAME: usize = (CAPTURE_SAMPLE_RATE as usize) / 20;

/// Creates a resampler to convert between audio sample rates.
pub fn create_resampler(
    in_sampling_rate: f64,
    out_sampling_rate: f64,
    chunk_size: usize,
) -> anyhow::Result<FastFixedIn<f32>> {
    let resampler = FastFixedIn::<f32>::new(
        out_sampling_rate / in_sampling_rate,
        1.0,
        PolynomialDegree::Cubic,
        chunk_size,
        1, // mono
    )?;
    Ok(resampler)
}

/// Serializes samples as little-endian PCM16.
pub fn pcm16_to_bytes(pcm16: &[i16]) -> Bytes {
    let mut bytes = Vec::with_capacity(pcm16.len() * 2);
    for sample in pcm16 {
        bytes.extend_from_slice(&sample.to_le_bytes());
    }
    Bytes::from(bytes)
}

/// Parses little-endian PCM16. A trailing odd byte is ignored.
pub fn pcm16_from_bytes(bytes: &[u8]) -> Vec<i16> {
    bytes
        .chunks_exact(2)
        .map(|chunk| i16::from_le_bytes([chunk[0], chunk[1]]))
        .collect()
}

/// Converts a slice of i16 samples to a vector of f32 samples.
pub fn convert_i16_to_f32(pcm16: &[i16]) -> Vec<f32> {
    pcm16
        .iter()
        .map(|&sample| sample as f32 / 32768.0)
        .collect()
}

/// Converts a slice of f32 samples to a vector of i16 samples.
pub fn convert_f32_to_i16(pcm32: &[f32]) -> Vec<i16> {
    pcm32
        .iter()
        .map(|&sample| (sample * i16::MAX as f32).clamp(i16::MIN as f32, i16::MAX as f32) as i16)
        .collect()
}

/// Cuts a continuous sample stream into fixed-size PCM16 frames.
///
/// Hardware callbacks rarely deliver exactly one frame's worth of samples, so
/// samples are accumulated here and emitted once a full frame is available.
#[derive(Debug)]
pub struct FrameAssembler {
    frame_len: usize,
    pending: Vec<i16>,
}

impl FrameAssembler {
    pub fn new(frame_len: usize) -> Self {
        Self {
            frame_len,
            pending: Vec::with_capacity(frame_len),
        }
    }

    /// Appends samples, calling `emit` once for every completed frame.
    pub fn push(&mut self, samples: impl IntoIterator<Item = i16>, mut emit: impl FnMut(Bytes)) {
        for sample in samples {
            self.pending.push(sample);
            if self.pending.len() == self.frame_len {
                emit(pcm16_to_bytes(&self.pending));
                self.pending.clear();
            }
        }
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_create_resampler() {
        assert!(create_resampler(16000.0, 48000.0, 800).is_ok());
        assert!(create_resampler(16000.0, 44100.0, 800).is_ok());
        assert!(create_resampler(16000.0, 16000.0, 800).is_ok());
    }

    #[test]
    fn test_pcm16_bytes_are_little_endian() {
        let bytes = pcm16_to_bytes(&[1, -2, 0x1234]);
        assert_eq!(&bytes[..], &[0x01, 0x00, 0xFE, 0xFF, 0x34, 0x12]);
        assert_eq!(pcm16_from_bytes(&bytes), vec![1, -2, 0x1234]);
    }

    #[test]
    fn test_pcm16_from_bytes_ignores_trailing_byte() {
        assert_eq!(pcm16_from_bytes(&[0x00, 0x40, 0x7F]), vec![16384]);
        assert!(pcm16_from_bytes(&[]).is_empty());
    }

    #[test]
    fn test_convert_i16_to_f32() {
        let result = convert_i16_to_f32(&[i16::MAX, i16::MIN, 0, 16384]);
        assert_eq!(result.len(), 4);
        assert_abs_diff_eq!(result[0], i16::MAX as f32 / 32768.0, epsilon = 0.0001);
        assert_abs_diff_eq!(result[1], -1.0, epsilon = 0.0001);
        assert_abs_diff_eq!(result[2], 0.0, epsilon = 0.0001);
        assert_abs_diff_eq!(result[3], 0.5, epsilon = 0.0001);
    }

    #[test]
    fn test_convert_f32_to_i16_clamps() {
        let result = convert_f32_to_i16(&[1.0, -1.0, 0.0, 2.0, -2.0]);
        assert_eq!(result[0], i16::MAX);
        // -1.0 * 32767 = -32767, not i16::MIN (-32768)
        assert_eq!(result[1], -32767);
        assert_eq!(result[2], 0);
        assert_eq!(result[3], i16::MAX);
        assert_eq!(result[4], i16::MIN);
    }

    #[test]
    fn test_capture_frame_is_fifty_milliseconds() {
        assert_eq!(CAPTURE_SAMPLES_PER_FRAME, 2400);
    }

    #[test]
    fn test_frame_assembler_emits_complete_frames_only() {
        let mut assembler = FrameAssembler::new(4);
        let mut frames = Vec::new();

        assembler.push([1, 2, 3], |f| frames.push(f));
        assert!(frames.is_empty());
        assert_eq!(assembler.pending_len(), 3);

        assembler.push([4, 5, 6, 7, 8, 9], |f| frames.push(f));
        assert_eq!(frames.len(), 2);
        assert_eq!(pcm16_from_bytes(&frames[0]), vec![1, 2, 3, 4]);
        assert_eq!(pcm16_from_bytes(&frames[1]), vec![5, 6, 7, 8]);
        assert_eq!(assembler.pending_len(), 1);
    }
}
