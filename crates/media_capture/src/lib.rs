//! Microphone capture, voice-note encoding and local preview playback.

pub mod capture;
pub mod encoder;
#[cfg(feature = "native-audio")]
pub mod native;
pub mod playback;

pub use capture::{
    negotiate_mime_type, AudioConstraints, CaptureError, CaptureFormat, CaptureRequest,
    CaptureStream, MediaCaptureDevice, SampleFormat, UnavailableCaptureDevice,
    PREFERRED_MIME_TYPES,
};
pub use encoder::{AudioEncoder, EncodeError, EncodedAudio, WavEncoder, WAV_MIME_TYPE};
pub use playback::{ObjectUrl, ObjectUrlRegistry, PlaybackError, PreviewPlayback};
