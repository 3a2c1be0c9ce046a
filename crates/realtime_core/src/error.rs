use media_capture::{CaptureError, EncodeError, PlaybackError};
use thiserror::Error;

use crate::voice_recorder::RecorderState;

/// Failure classes reported by an object storage client.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("transfer failed: {0}")]
    Transfer(String),
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("payload of {size} bytes exceeds the storage limit")]
    PayloadTooLarge { size: u64 },
    #[error("upload rejected: {0}")]
    Rejected(String),
}

impl StorageError {
    pub fn is_retriable(&self) -> bool {
        matches!(self, StorageError::Transfer(_))
    }
}

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("permission denied uploading to bucket {bucket}: {message}")]
    PermissionDenied { bucket: String, message: String },
    #[error("payload of {size} bytes exceeds the upload limit")]
    PayloadTooLarge { size: u64, limit: Option<u64> },
    #[error("bucket {bucket} rejected the upload: {message}")]
    Rejected { bucket: String, message: String },
    #[error("refusing to upload an empty payload")]
    EmptyPayload,
    #[error("no storage destination configured for {0} uploads")]
    NoDestination(&'static str),
    #[error("upload exhausted after {attempts} attempts across {candidates} destinations: {last_error}")]
    Exhausted {
        attempts: u32,
        candidates: usize,
        last_error: String,
    },
}

#[derive(Debug, Error)]
pub enum RecorderError {
    #[error("microphone unavailable: {0}")]
    DeviceUnavailable(#[from] CaptureError),
    #[error("recording captured no audio")]
    EmptyRecording,
    #[error("cannot {action} a voice recording while {state:?}")]
    InvalidTransition {
        action: &'static str,
        state: RecorderState,
    },
    #[error("failed to encode recording: {0}")]
    Encoding(#[from] EncodeError),
    #[error("preview playback failed: {0}")]
    Playback(#[from] PlaybackError),
    #[error("voice message upload failed: {0}")]
    UploadFailed(#[from] UploadError),
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("not signed in")]
    NotSignedIn,
    #[error("failed to load conversation {conversation}: {source}")]
    ConversationLoad {
        conversation: String,
        source: anyhow::Error,
    },
    #[error("failed to send message: {source}")]
    SendFailed { source: anyhow::Error },
    #[error("failed to update read state: {source}")]
    ReadUpdate { source: anyhow::Error },
    #[error("malformed {entity} row: {source}")]
    Decode {
        entity: &'static str,
        source: serde_json::Error,
    },
    #[error("attachment upload failed: {0}")]
    Attachment(#[from] UploadError),
    #[error("no failed message with correlation id {0}")]
    UnknownPending(String),
}

#[derive(Debug, Error)]
pub enum SubscriptionError {
    #[error("failed to open realtime topic {topic}: {source}")]
    ConnectFailed { topic: String, source: anyhow::Error },
    #[error("realtime topic {topic} dropped: {reason}")]
    SubscriptionDropped { topic: String, reason: String },
    #[error("gave up reconnecting realtime topic {topic} after {attempts} attempts")]
    ReconnectExhausted { topic: String, attempts: u32 },
}
