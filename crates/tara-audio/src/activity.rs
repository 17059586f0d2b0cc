//! Loudness measurement and utterance segmentation.

use std::time::Duration;

use crate::TARGET_SAMPLE_RATE;

pub const MIN_DB: f32 = -96.0;

/// Convert a slice of f32 samples to dBFS.
pub fn db_fs(data: &[f32]) -> f32 {
    let max_sample = data
        .iter()
        .fold(f32::EPSILON, |max, &sample| sample.abs().max(max));

    (20.0 * max_sample.log10()).clamp(MIN_DB, 0.0)
}

/// Settings for [`UtteranceDetector`].
#[derive(Debug, Clone, Copy)]
pub struct DetectorConfig {
    /// Sample rate of the frames being pushed
    pub sample_rate: u32,
    /// Frames louder than this count as speech
    pub threshold_db: f32,
    /// Silence after speech that ends an utterance
    pub end_silence: Duration,
    /// Speech duration between interim results
    pub interim_interval: Duration,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            sample_rate: TARGET_SAMPLE_RATE,
            threshold_db: -45.0,
            end_silence: Duration::from_millis(800),
            interim_interval: Duration::from_secs(1),
        }
    }
}

impl DetectorConfig {
    fn samples(&self, duration: Duration) -> usize {
        (duration.as_secs_f64() * self.sample_rate as f64) as usize
    }
}

/// What a pushed frame means for the current utterance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Segment {
    /// Nothing heard yet
    Silence,
    /// Inside an utterance, nothing to report
    Speech,
    /// Inside an utterance, time for an interim result
    Interim,
    /// Trailing silence ended the utterance
    EndOfUtterance,
}

/// Splits a frame stream into utterances by loudness.
#[derive(Debug)]
pub struct UtteranceDetector {
    config: DetectorConfig,
    heard_speech: bool,
    trailing_silence: usize,
    since_interim: usize,
}

impl UtteranceDetector {
    pub fn new(config: DetectorConfig) -> Self {
        Self {
            config,
            heard_speech: false,
            trailing_silence: 0,
            since_interim: 0,
        }
    }

    /// Whether the current utterance has started.
    pub fn heard_speech(&self) -> bool {
        self.heard_speech
    }

    pub fn push(&mut self, frame: &[f32]) -> Segment {
        let loud = db_fs(frame) > self.config.threshold_db;

        if !self.heard_speech {
            if loud {
                self.heard_speech = true;
                self.since_interim = frame.len();
                return Segment::Speech;
            }
            return Segment::Silence;
        }

        self.trailing_silence = if loud {
            0
        } else {
            self.trailing_silence + frame.len()
        };
        if self.trailing_silence >= self.config.samples(self.config.end_silence) {
            self.reset();
            return Segment::EndOfUtterance;
        }

        self.since_interim += frame.len();
        if self.since_interim >= self.config.samples(self.config.interim_interval) {
            self.since_interim = 0;
            return Segment::Interim;
        }
        Segment::Speech
    }

    pub fn reset(&mut self) {
        self.heard_speech = false;
        self.trailing_silence = 0;
        self.since_interim = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FRAME: usize = 1600; // 100 ms at 16 kHz

    fn loud() -> Vec<f32> {
        vec![0.5; FRAME]
    }

    fn quiet() -> Vec<f32> {
        vec![0.0; FRAME]
    }

    #[test]
    fn test_db_fs_silence_is_floor() {
        assert_eq!(db_fs(&[0.0; 16]), MIN_DB);
        assert_eq!(db_fs(&[1.0, -1.0]), 0.0);
    }

    #[test]
    fn test_silence_before_speech() {
        let mut detector = UtteranceDetector::new(DetectorConfig::default());
        assert_eq!(detector.push(&quiet()), Segment::Silence);
        assert!(!detector.heard_speech());
    }

    #[test]
    fn test_utterance_ends_after_trailing_silence() {
        let mut detector = UtteranceDetector::new(DetectorConfig::default());
        assert_eq!(detector.push(&loud()), Segment::Speech);
        for _ in 0..7 {
            assert_eq!(detector.push(&quiet()), Segment::Speech);
        }
        assert_eq!(detector.push(&quiet()), Segment::EndOfUtterance);
        assert!(!detector.heard_speech());
    }

    #[test]
    fn test_interim_every_interval() {
        let mut detector = UtteranceDetector::new(DetectorConfig::default());
        let segments: Vec<Segment> = (0..20).map(|_| detector.push(&loud())).collect();
        let interims = segments.iter().filter(|s| **s == Segment::Interim).count();
        assert_eq!(interims, 2);
    }
}
