use std::{
    collections::HashMap,
    fmt,
    sync::Mutex,
};

use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

use crate::encoder::EncodedAudio;

/// Session-local locator for a captured blob, used for preview playback.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ObjectUrl(pub String);

impl fmt::Display for ObjectUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Error)]
pub enum PlaybackError {
    #[error("unknown or revoked object url {0}")]
    UnknownUrl(ObjectUrl),
    #[error("playback backend error: {0}")]
    Backend(String),
}

pub trait PreviewPlayback: Send + Sync {
    fn create_object_url(&self, audio: &EncodedAudio) -> Result<ObjectUrl, PlaybackError>;
    fn revoke_object_url(&self, url: &ObjectUrl);
    fn play(&self, url: &ObjectUrl) -> Result<(), PlaybackError>;
    fn pause(&self, url: &ObjectUrl);
}

/// In-process url table with no audio output; hosts that can play sound wrap
/// or replace it.
#[derive(Default)]
pub struct ObjectUrlRegistry {
    entries: Mutex<HashMap<ObjectUrl, EncodedAudio>>,
    playing: Mutex<Option<ObjectUrl>>,
}

impl ObjectUrlRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn live_urls(&self) -> usize {
        self.entries.lock().map(|entries| entries.len()).unwrap_or(0)
    }

    pub fn is_playing(&self, url: &ObjectUrl) -> bool {
        self.playing
            .lock()
            .map(|playing| playing.as_ref() == Some(url))
            .unwrap_or(false)
    }

    pub fn resolve(&self, url: &ObjectUrl) -> Option<EncodedAudio> {
        self.entries.lock().ok()?.get(url).cloned()
    }
}

impl PreviewPlayback for ObjectUrlRegistry {
    fn create_object_url(&self, audio: &EncodedAudio) -> Result<ObjectUrl, PlaybackError> {
        let url = ObjectUrl(format!("blob:local/{}", Uuid::new_v4()));
        self.entries
            .lock()
            .map_err(|_| PlaybackError::Backend("object url table poisoned".into()))?
            .insert(url.clone(), audio.clone());
        debug!(url = %url, bytes = audio.len(), "playback: created object url");
        Ok(url)
    }

    fn revoke_object_url(&self, url: &ObjectUrl) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.remove(url);
        }
        if let Ok(mut playing) = self.playing.lock() {
            if playing.as_ref() == Some(url) {
                *playing = None;
            }
        }
        debug!(url = %url, "playback: revoked object url");
    }

    fn play(&self, url: &ObjectUrl) -> Result<(), PlaybackError> {
        let known = self
            .entries
            .lock()
            .map(|entries| entries.contains_key(url))
            .unwrap_or(false);
        if !known {
            return Err(PlaybackError::UnknownUrl(url.clone()));
        }
        if let Ok(mut playing) = self.playing.lock() {
            *playing = Some(url.clone());
        }
        Ok(())
    }

    fn pause(&self, url: &ObjectUrl) {
        if let Ok(mut playing) = self.playing.lock() {
            if playing.as_ref() == Some(url) {
                *playing = None;
            }
        }
    }
}

#[cfg(test)]
#[path = "tests/playback_tests.rs"]
mod tests;
