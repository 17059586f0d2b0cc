//! Microphone acquisition and release.
//!
//! cpal streams are not `Send`, so the stream lives on a dedicated capture
//! thread that forwards raw chunks over a channel. The [`AudioCapture`]
//! handle owns the receiving end and the means to stop that thread. A stream
//! error is forwarded as the last item and stops the thread.

use std::sync::mpsc as std_mpsc;
use std::thread::JoinHandle;

use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{FromSample, Sample, SizedSample};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info};

/// Backend messages that indicate the OS refused microphone access.
const PERMISSION_HINTS: &[&str] = &["permission", "denied", "not authorized", "unauthorized"];

#[derive(Debug, Error)]
pub enum CaptureError {
    /// The OS or user refused microphone access
    #[error("microphone access was denied")]
    PermissionDenied,
    /// No recording device available
    #[error("no input device available")]
    NoInputDevice,
    /// Sample format not supported
    #[error("sample format not supported: {0}")]
    SampleFormatNotSupported(String),
    /// The stream could not be built or started
    #[error("audio stream error: {0}")]
    Stream(String),
}

impl CaptureError {
    fn from_backend(message: String) -> Self {
        let lower = message.to_lowercase();
        if PERMISSION_HINTS.iter().any(|hint| lower.contains(hint)) {
            Self::PermissionDenied
        } else {
            Self::Stream(message)
        }
    }
}

impl From<cpal::DefaultStreamConfigError> for CaptureError {
    fn from(e: cpal::DefaultStreamConfigError) -> Self {
        match e {
            cpal::DefaultStreamConfigError::DeviceNotAvailable => Self::NoInputDevice,
            other => Self::from_backend(other.to_string()),
        }
    }
}

impl From<cpal::BuildStreamError> for CaptureError {
    fn from(e: cpal::BuildStreamError) -> Self {
        match e {
            cpal::BuildStreamError::DeviceNotAvailable => Self::NoInputDevice,
            other => Self::from_backend(other.to_string()),
        }
    }
}

impl From<cpal::StreamError> for CaptureError {
    fn from(e: cpal::StreamError) -> Self {
        match e {
            cpal::StreamError::DeviceNotAvailable => Self::NoInputDevice,
            other => Self::from_backend(other.to_string()),
        }
    }
}

impl From<cpal::PlayStreamError> for CaptureError {
    fn from(e: cpal::PlayStreamError) -> Self {
        match e {
            cpal::PlayStreamError::DeviceNotAvailable => Self::NoInputDevice,
            other => Self::from_backend(other.to_string()),
        }
    }
}

type Result<T> = std::result::Result<T, CaptureError>;

/// Shape of the raw chunks a capture delivers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureFormat {
    pub sample_rate: u32,
    pub channels: u16,
}

type ReleaseFn = Box<dyn FnOnce() + Send>;

/// What the capture thread delivers: raw chunks, or the error that ended
/// the stream.
pub type ChunkResult = Result<Vec<f32>>;

/// Handle to an acquired microphone. While it exists the device is open.
///
/// Releasing stops the device and closes the chunk channel. It runs at most
/// once, either through [`AudioCapture::release`] or on drop.
pub struct AudioCapture {
    format: CaptureFormat,
    chunks: mpsc::UnboundedReceiver<ChunkResult>,
    failure: Option<CaptureError>,
    release: Option<ReleaseFn>,
}

impl AudioCapture {
    /// Wraps a chunk channel and the action that frees the underlying device.
    pub fn new(
        format: CaptureFormat,
        chunks: mpsc::UnboundedReceiver<ChunkResult>,
        release: impl FnOnce() + Send + 'static,
    ) -> Self {
        Self {
            format,
            chunks,
            failure: None,
            release: Some(Box::new(release)),
        }
    }

    pub fn format(&self) -> CaptureFormat {
        self.format
    }

    /// Waits for the next raw interleaved chunk. Returns `None` once the
    /// capture is released, the device stops delivering, or the stream
    /// failed. See [`AudioCapture::failure`] for the last case.
    pub async fn next_chunk(&mut self) -> Option<Vec<f32>> {
        if self.release.is_none() || self.failure.is_some() {
            return None;
        }
        match self.chunks.recv().await? {
            Ok(chunk) => Some(chunk),
            Err(e) => {
                debug!(error = %e, "Audio stream ended with an error");
                self.chunks.close();
                self.failure = Some(e);
                None
            }
        }
    }

    /// The error that ended the stream, if it ended with one.
    pub fn failure(&self) -> Option<&CaptureError> {
        self.failure.as_ref()
    }

    pub fn is_released(&self) -> bool {
        self.release.is_none()
    }

    /// Stops accepting chunks, then frees the device.
    pub fn release(&mut self) {
        if let Some(release) = self.release.take() {
            self.chunks.close();
            release();
            debug!("Audio capture released");
        }
    }
}

impl Drop for AudioCapture {
    fn drop(&mut self) {
        self.release();
    }
}

/// Something that can hand out microphone captures.
#[async_trait]
pub trait AudioSource: Send + Sync {
    /// Opens the input device and starts delivering chunks.
    async fn acquire(&self) -> Result<AudioCapture>;
}

/// The system microphone, accessed through cpal.
#[derive(Debug, Clone, Default)]
pub struct Microphone {
    device_name: Option<String>,
}

impl Microphone {
    /// Uses the named input device instead of the host default.
    pub fn with_device(name: impl Into<String>) -> Self {
        Self {
            device_name: Some(name.into()),
        }
    }
}

#[async_trait]
impl AudioSource for Microphone {
    async fn acquire(&self) -> Result<AudioCapture> {
        let (ready_tx, ready_rx) = oneshot::channel();
        let (stop_tx, stop_rx) = std_mpsc::channel::<()>();
        let (chunk_tx, chunk_rx) = mpsc::unbounded_channel();
        let device_name = self.device_name.clone();

        let thread = std::thread::Builder::new()
            .name("tara-capture".to_string())
            .spawn({
                let stop_tx = stop_tx.clone();
                move || run_capture(device_name, chunk_tx, ready_tx, stop_tx, stop_rx)
            })
            .map_err(|e| CaptureError::Stream(format!("failed to spawn capture thread: {}", e)))?;

        let format = match ready_rx.await {
            Ok(result) => result?,
            Err(_) => {
                return Err(CaptureError::Stream(
                    "capture thread exited before the stream started".to_string(),
                ));
            }
        };

        Ok(AudioCapture::new(format, chunk_rx, move || {
            stop_tx.send(()).ok();
            join_capture(thread);
        }))
    }
}

fn join_capture(thread: JoinHandle<()>) {
    if thread.join().is_err() {
        error!("Capture thread panicked");
    }
}

/// Body of the capture thread: owns the stream until told to stop.
fn run_capture(
    device_name: Option<String>,
    chunks: mpsc::UnboundedSender<ChunkResult>,
    ready: oneshot::Sender<Result<CaptureFormat>>,
    on_error: std_mpsc::Sender<()>,
    stop: std_mpsc::Receiver<()>,
) {
    let (stream, format) = match open_stream(device_name.as_deref(), chunks, on_error) {
        Ok(opened) => opened,
        Err(e) => {
            ready.send(Err(e)).ok();
            return;
        }
    };

    if ready.send(Ok(format)).is_err() {
        // Nobody is waiting for this capture anymore.
        return;
    }

    // Returns on release (explicit or on drop) and on a stream error.
    stop.recv().ok();
    stream.pause().ok();
    drop(stream);
    info!("Microphone released");
}

fn open_stream(
    device_name: Option<&str>,
    chunks: mpsc::UnboundedSender<ChunkResult>,
    on_error: std_mpsc::Sender<()>,
) -> Result<(cpal::Stream, CaptureFormat)> {
    let host = cpal::default_host();
    let device = match device_name {
        None => host.default_input_device(),
        Some(name) => host
            .input_devices()
            .map_err(|e| CaptureError::from_backend(e.to_string()))?
            .find(|d| d.name().map(|n| n == name).unwrap_or(false)),
    }
    .ok_or(CaptureError::NoInputDevice)?;

    let config = device.default_input_config()?;
    let format = CaptureFormat {
        sample_rate: config.sample_rate().0,
        channels: config.channels(),
    };

    info!(
        device_name = %device.name().unwrap_or_else(|_| "unknown".to_string()),
        config = ?config,
        "Recording from device"
    );

    let stream_config: cpal::StreamConfig = config.clone().into();
    let stream = match config.sample_format() {
        cpal::SampleFormat::F32 => build_stream::<f32>(&device, &stream_config, chunks, on_error)?,
        cpal::SampleFormat::I16 => build_stream::<i16>(&device, &stream_config, chunks, on_error)?,
        cpal::SampleFormat::U16 => build_stream::<u16>(&device, &stream_config, chunks, on_error)?,
        sample_format => {
            return Err(CaptureError::SampleFormatNotSupported(format!(
                "{:?}",
                sample_format
            )));
        }
    };

    stream.play()?;
    Ok((stream, format))
}

fn build_stream<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    chunks: mpsc::UnboundedSender<ChunkResult>,
    on_error: std_mpsc::Sender<()>,
) -> Result<cpal::Stream>
where
    T: SizedSample,
    f32: FromSample<T>,
{
    let errors = chunks.clone();
    let err_fn = move |err: cpal::StreamError| {
        error!("an error occurred on stream: {}", err);
        errors.send(Err(err.into())).ok();
        on_error.send(()).ok();
    };

    let stream = device.build_input_stream(
        config,
        move |data: &[T], _: &cpal::InputCallbackInfo| {
            let chunk: Vec<f32> = data.iter().map(|&s| f32::from_sample(s)).collect();
            // The receiver is gone once the capture is released.
            chunks.send(Ok(chunk)).ok();
        },
        err_fn,
        None,
    )?;
    Ok(stream)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    fn format() -> CaptureFormat {
        CaptureFormat {
            sample_rate: 16_000,
            channels: 1,
        }
    }

    #[tokio::test]
    async fn test_release_runs_once() {
        let released = Arc::new(AtomicUsize::new(0));
        let counter = released.clone();
        let (_tx, rx) = mpsc::unbounded_channel();
        let mut capture = AudioCapture::new(format(), rx, move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        capture.release();
        capture.release();
        drop(capture);

        assert_eq!(released.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_drop_releases() {
        let released = Arc::new(AtomicUsize::new(0));
        let counter = released.clone();
        let (_tx, rx) = mpsc::unbounded_channel();
        let capture = AudioCapture::new(format(), rx, move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        drop(capture);
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_released_capture_yields_nothing() {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut capture = AudioCapture::new(format(), rx, || {});
        tx.send(Ok(vec![0.1; 4])).unwrap();
        assert_eq!(capture.next_chunk().await, Some(vec![0.1; 4]));

        capture.release();
        tx.send(Ok(vec![0.2; 4])).ok();
        assert!(capture.is_released());
        assert_eq!(capture.next_chunk().await, None);
    }

    #[tokio::test]
    async fn test_stream_error_ends_capture() {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut capture = AudioCapture::new(format(), rx, || {});
        tx.send(Ok(vec![0.1; 4])).unwrap();
        tx.send(Err(cpal::StreamError::DeviceNotAvailable.into())).unwrap();
        tx.send(Ok(vec![0.2; 4])).unwrap();

        assert_eq!(capture.next_chunk().await, Some(vec![0.1; 4]));
        assert_eq!(capture.next_chunk().await, None);
        assert!(matches!(capture.failure(), Some(CaptureError::NoInputDevice)));
        // The sender is still alive, but nothing more is read.
        assert_eq!(capture.next_chunk().await, None);
        assert!(!capture.is_released());
    }

    #[test]
    fn test_backend_permission_message_is_classified() {
        let err = CaptureError::from_backend("Access denied by the system".to_string());
        assert!(matches!(err, CaptureError::PermissionDenied));

        let err = CaptureError::from_backend("device busy".to_string());
        assert!(matches!(err, CaptureError::Stream(_)));
    }

    #[test]
    fn test_missing_device_is_classified() {
        let err: CaptureError = cpal::BuildStreamError::DeviceNotAvailable.into();
        assert!(matches!(err, CaptureError::NoInputDevice));
    }
}
