use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::debug;

/// Container encodings tried in order when opening a recording; the first one
/// the device accepts wins.
pub const PREFERRED_MIME_TYPES: &[&str] = &[
    "audio/webm;codecs=opus",
    "audio/webm",
    "audio/ogg;codecs=opus",
    "audio/mp4",
    "audio/wav",
];

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("microphone access denied: {0}")]
    PermissionDenied(String),
    #[error("no microphone available")]
    NoDevice,
    #[error("capture stream error: {0}")]
    Stream(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioConstraints {
    pub echo_cancellation: bool,
    pub noise_suppression: bool,
    pub auto_gain_control: bool,
}

impl Default for AudioConstraints {
    fn default() -> Self {
        Self {
            echo_cancellation: true,
            noise_suppression: true,
            auto_gain_control: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureRequest {
    pub constraints: AudioConstraints,
    /// `None` lets the platform pick its default encoding.
    pub mime_type: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleFormat {
    I16,
    F32,
}

impl SampleFormat {
    pub fn bytes_per_sample(&self) -> usize {
        match self {
            SampleFormat::I16 => 2,
            SampleFormat::F32 => 4,
        }
    }
}

/// What the chunks produced by a stream contain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureFormat {
    /// Interleaved little-endian samples.
    Pcm {
        sample_rate: u32,
        channels: u16,
        sample_format: SampleFormat,
    },
    /// Already containerized audio (e.g. webm/opus from a platform recorder).
    Encoded { mime_type: String },
}

impl CaptureFormat {
    pub fn mime_type(&self) -> String {
        match self {
            CaptureFormat::Pcm {
                sample_rate,
                channels,
                ..
            } => format!("audio/pcm;rate={sample_rate};channels={channels}"),
            CaptureFormat::Encoded { mime_type } => mime_type.clone(),
        }
    }
}

#[async_trait]
pub trait MediaCaptureDevice: Send + Sync {
    fn supports_mime_type(&self, mime_type: &str) -> bool;

    /// Acquires the microphone. The returned stream holds the device until
    /// [`CaptureStream::release`] is called.
    async fn open(&self, request: CaptureRequest) -> Result<Box<dyn CaptureStream>, CaptureError>;
}

#[async_trait]
pub trait CaptureStream: Send {
    fn format(&self) -> &CaptureFormat;

    /// Begins chunked capture, emitting roughly one chunk per `timeslice`.
    fn start(&mut self, timeslice: Duration)
        -> Result<mpsc::UnboundedReceiver<Bytes>, CaptureError>;

    /// Stops capture and flushes any buffered audio before closing the chunk
    /// channel. The device stays acquired.
    async fn stop(&mut self);

    /// Releases the underlying device.
    fn release(&mut self);
}

pub fn negotiate_mime_type(device: &dyn MediaCaptureDevice, preferred: &[&str]) -> Option<String> {
    let chosen = preferred
        .iter()
        .find(|candidate| device.supports_mime_type(candidate))
        .map(|candidate| candidate.to_string());
    debug!(?chosen, "capture: negotiated recording encoding");
    chosen
}

pub struct UnavailableCaptureDevice;

#[async_trait]
impl MediaCaptureDevice for UnavailableCaptureDevice {
    fn supports_mime_type(&self, _mime_type: &str) -> bool {
        false
    }

    async fn open(
        &self,
        _request: CaptureRequest,
    ) -> Result<Box<dyn CaptureStream>, CaptureError> {
        Err(CaptureError::NoDevice)
    }
}

#[cfg(test)]
#[path = "tests/capture_tests.rs"]
mod tests;
