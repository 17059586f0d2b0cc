//! Microphone capture for tara.
//!
//! There can only be one active capture at a time. A capture hands raw
//! device chunks to the caller, who converts them into fixed-size
//! recognizer frames with [`FrameConverter`].

mod activity;
mod capture;
mod convert;

pub use activity::{DetectorConfig, MIN_DB, Segment, UtteranceDetector, db_fs};
pub use capture::{
    AudioCapture, AudioSource, CaptureError, CaptureFormat, ChunkResult, Microphone,
};
pub use convert::{
    FRAME_SAMPLES, FrameConverter, TARGET_SAMPLE_RATE, downmix, resample, to_i16,
};
