//! Conversion of device audio into recognizer frames.

use crate::CaptureFormat;

/// Sample rate recognizers expect.
pub const TARGET_SAMPLE_RATE: u32 = 16_000;

/// Samples per recognizer frame at [`TARGET_SAMPLE_RATE`] (256 ms).
pub const FRAME_SAMPLES: usize = 4096;

/// Averages interleaved channels into mono.
pub fn downmix(samples: &[f32], channels: usize) -> Vec<f32> {
    if channels <= 1 {
        return samples.to_vec();
    }
    samples
        .chunks(channels)
        .map(|chunk| chunk.iter().sum::<f32>() / chunk.len() as f32)
        .collect()
}

/// Simple linear interpolation resampling.
pub fn resample(samples: &[f32], from_rate: u32, to_rate: u32) -> Vec<f32> {
    if from_rate == to_rate {
        return samples.to_vec();
    }

    let ratio = from_rate as f64 / to_rate as f64;
    let new_len = (samples.len() as f64 / ratio) as usize;
    let mut result = Vec::with_capacity(new_len);

    for i in 0..new_len {
        let src_idx = i as f64 * ratio;
        let src_idx_floor = src_idx.floor() as usize;
        let frac = src_idx - src_idx_floor as f64;

        let sample = if src_idx_floor + 1 < samples.len() {
            let s0 = samples[src_idx_floor] as f64;
            let s1 = samples[src_idx_floor + 1] as f64;
            (s0 * (1.0 - frac) + s1 * frac) as f32
        } else if src_idx_floor < samples.len() {
            samples[src_idx_floor]
        } else {
            0.0
        };

        result.push(sample);
    }

    result
}

/// Converts normalized samples to signed 16 bit PCM.
pub fn to_i16(samples: &[f32]) -> Vec<i16> {
    samples
        .iter()
        .map(|&s| (s * 32767.0).clamp(-32768.0, 32767.0) as i16)
        .collect()
}

/// Buffers device chunks and emits fixed-size 16 kHz mono frames.
#[derive(Debug)]
pub struct FrameConverter {
    format: CaptureFormat,
    frame_len: usize,
    /// Mono samples at the device rate not yet emitted.
    pending: Vec<f32>,
}

impl FrameConverter {
    pub fn new(format: CaptureFormat) -> Self {
        Self::with_frame_len(format, FRAME_SAMPLES)
    }

    pub fn with_frame_len(format: CaptureFormat, frame_len: usize) -> Self {
        Self {
            format,
            frame_len: frame_len.max(1),
            pending: Vec::new(),
        }
    }

    /// Number of device-rate mono samples that make up one output frame.
    fn block_len(&self) -> usize {
        let ratio = self.format.sample_rate as f64 / TARGET_SAMPLE_RATE as f64;
        ((self.frame_len as f64 * ratio).ceil() as usize).max(1)
    }

    /// Feeds a raw interleaved chunk, returning every frame completed by it.
    pub fn push(&mut self, chunk: &[f32]) -> Vec<Vec<f32>> {
        self.pending
            .extend(downmix(chunk, self.format.channels as usize));

        let block_len = self.block_len();
        let mut frames = Vec::new();
        while self.pending.len() >= block_len {
            let block: Vec<f32> = self.pending.drain(..block_len).collect();
            let mut frame = resample(&block, self.format.sample_rate, TARGET_SAMPLE_RATE);
            frame.resize(self.frame_len, 0.0);
            frames.push(frame);
        }
        frames
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resample() {
        // Simple test: downsampling should produce fewer samples
        let samples: Vec<f32> = (0..48000).map(|i| (i as f32 / 48000.0).sin()).collect();
        let resampled = resample(&samples, 48000, 16000);
        assert_eq!(resampled.len(), 16000);
    }

    #[test]
    fn test_downmix_stereo() {
        let mono = downmix(&[1.0, 0.0, 0.5, 0.5], 2);
        assert_eq!(mono, vec![0.5, 0.5]);
    }

    #[test]
    fn test_to_i16_clamps() {
        assert_eq!(to_i16(&[2.0, -2.0, 0.0]), vec![32767, -32768, 0]);
    }

    #[test]
    fn test_converter_emits_fixed_frames() {
        let format = CaptureFormat {
            sample_rate: 48_000,
            channels: 2,
        };
        let mut converter = FrameConverter::with_frame_len(format, 160);

        // 10 ms of stereo audio at 48 kHz yields one 160 sample frame.
        let chunk = vec![0.25; 480 * 2];
        assert!(converter.push(&chunk[..480]).is_empty());
        let frames = converter.push(&chunk[480..]);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].len(), 160);
    }

    #[test]
    fn test_converter_passthrough_at_target_rate() {
        let format = CaptureFormat {
            sample_rate: TARGET_SAMPLE_RATE,
            channels: 1,
        };
        let mut converter = FrameConverter::new(format);
        let frames = converter.push(&vec![0.1; FRAME_SAMPLES * 2 + 10]);
        assert_eq!(frames.len(), 2);
        assert!(frames.iter().all(|f| f.len() == FRAME_SAMPLES));
    }
}
