//! Voice-note recorder: capture, bounded duration, preview, upload.
//!
//! ```text
//! Idle --start--> Recording --stop / max duration--> Recorded --send--> Uploading
//!  ^                 |                                 |   ^               |    |
//!  +----cancel-------+------------cancel---------------+   +---failure-----+    +--> Sent
//! ```
//!
//! The microphone is held from `start` until the session ends (cancel, a
//! successful send, an empty capture, or a new `start`), and is released
//! exactly once per session.

use std::{
    sync::{
        atomic::{AtomicU8, Ordering},
        Arc, Weak,
    },
    time::Duration,
};

use bytes::Bytes;
use media_capture::{
    negotiate_mime_type, AudioConstraints, AudioEncoder, CaptureRequest, CaptureStream,
    EncodeError, EncodedAudio, MediaCaptureDevice, ObjectUrl, PreviewPlayback,
    PREFERRED_MIME_TYPES,
};
use shared::domain::{MediaKind, UserId};
use tokio::{
    sync::{broadcast, mpsc, Mutex},
    task::JoinHandle,
    time::Instant,
};
use tracing::{error, info, warn};

use crate::{
    error::RecorderError,
    upload::{extension_for, MediaBlob, PublicReference, UploadDestination, UploadPipeline},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecorderState {
    Idle,
    Recording,
    Recorded,
    Uploading,
    Sent,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RecorderEvent {
    StateChanged(RecorderState),
    Tick { elapsed_seconds: u32 },
    AutoStopped { elapsed_seconds: u32 },
    UploadProgress(u8),
    Sent(PublicReference),
    Cancelled,
    Failed(String),
}

#[derive(Debug, Clone)]
pub struct RecorderConfig {
    pub max_duration: Duration,
    pub tick: Duration,
    pub chunk_timeslice: Duration,
    pub constraints: AudioConstraints,
    pub preferred_mime_types: Vec<String>,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            max_duration: Duration::from_secs(300),
            tick: Duration::from_secs(1),
            chunk_timeslice: Duration::from_secs(1),
            constraints: AudioConstraints::default(),
            preferred_mime_types: PREFERRED_MIME_TYPES.iter().map(|m| m.to_string()).collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RecorderSnapshot {
    pub state: RecorderState,
    pub elapsed_seconds: u32,
    pub upload_progress: u8,
    pub mime_type: Option<String>,
    pub recorded_bytes: usize,
    pub preview_url: Option<ObjectUrl>,
    pub playing: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StopReason {
    Manual,
    MaxDuration,
}

struct RecordingSession {
    state: RecorderState,
    generation: u64,
    started_at: Option<Instant>,
    elapsed_seconds: u32,
    stream: Option<Box<dyn CaptureStream>>,
    chunks: Option<mpsc::UnboundedReceiver<Bytes>>,
    raw_chunks: Vec<Bytes>,
    mime_type: Option<String>,
    recording: Option<EncodedAudio>,
    preview_url: Option<ObjectUrl>,
    playing: bool,
    ticker: Option<JoinHandle<()>>,
}

impl RecordingSession {
    fn new() -> Self {
        Self {
            state: RecorderState::Idle,
            generation: 0,
            started_at: None,
            elapsed_seconds: 0,
            stream: None,
            chunks: None,
            raw_chunks: Vec::new(),
            mime_type: None,
            recording: None,
            preview_url: None,
            playing: false,
            ticker: None,
        }
    }
}

struct RecorderInner {
    device: Arc<dyn MediaCaptureDevice>,
    encoder: Arc<dyn AudioEncoder>,
    playback: Arc<dyn PreviewPlayback>,
    uploads: Arc<UploadPipeline>,
    owner: UserId,
    config: RecorderConfig,
    session: Mutex<RecordingSession>,
    upload_progress: AtomicU8,
    events: broadcast::Sender<RecorderEvent>,
}

#[derive(Clone)]
pub struct VoiceRecorder {
    inner: Arc<RecorderInner>,
}

impl VoiceRecorder {
    pub fn new(
        device: Arc<dyn MediaCaptureDevice>,
        encoder: Arc<dyn AudioEncoder>,
        playback: Arc<dyn PreviewPlayback>,
        uploads: Arc<UploadPipeline>,
        owner: UserId,
        config: RecorderConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            inner: Arc::new(RecorderInner {
                device,
                encoder,
                playback,
                uploads,
                owner,
                config,
                session: Mutex::new(RecordingSession::new()),
                upload_progress: AtomicU8::new(0),
                events,
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RecorderEvent> {
        self.inner.events.subscribe()
    }

    pub async fn state(&self) -> RecorderState {
        self.inner.session.lock().await.state
    }

    pub async fn snapshot(&self) -> RecorderSnapshot {
        let session = self.inner.session.lock().await;
        RecorderSnapshot {
            state: session.state,
            elapsed_seconds: session.elapsed_seconds,
            upload_progress: self.inner.upload_progress.load(Ordering::SeqCst),
            mime_type: session.mime_type.clone(),
            recorded_bytes: session.recording.as_ref().map_or(0, EncodedAudio::len),
            preview_url: session.preview_url.clone(),
            playing: session.playing,
        }
    }

    /// Acquires the microphone and begins capturing. A session that is still
    /// recording or holding an unsent recording is discarded first.
    pub async fn start(&self) -> Result<(), RecorderError> {
        let inner = &self.inner;
        let mut session = inner.session.lock().await;
        match session.state {
            RecorderState::Uploading => {
                return Err(RecorderError::InvalidTransition {
                    action: "start",
                    state: session.state,
                })
            }
            RecorderState::Recording | RecorderState::Recorded => {
                info!(state = ?session.state, "recorder: discarding previous session");
                inner.teardown(&mut session).await;
                inner.emit(RecorderEvent::Cancelled);
            }
            RecorderState::Idle | RecorderState::Sent => {}
        }
        session.state = RecorderState::Idle;
        session.elapsed_seconds = 0;
        session.started_at = None;
        inner.upload_progress.store(0, Ordering::SeqCst);

        let preferred: Vec<&str> = inner
            .config
            .preferred_mime_types
            .iter()
            .map(String::as_str)
            .collect();
        let negotiated = negotiate_mime_type(inner.device.as_ref(), &preferred);
        let request = CaptureRequest {
            constraints: inner.config.constraints,
            mime_type: negotiated.clone(),
        };
        let mut stream = inner.device.open(request).await.map_err(|err| {
            warn!("recorder: microphone unavailable: {err}");
            RecorderError::DeviceUnavailable(err)
        })?;
        let chunks = match stream.start(inner.config.chunk_timeslice) {
            Ok(chunks) => chunks,
            Err(err) => {
                stream.release();
                warn!("recorder: capture failed to start: {err}");
                return Err(RecorderError::DeviceUnavailable(err));
            }
        };

        session.generation += 1;
        session.mime_type = Some(negotiated.unwrap_or_else(|| stream.format().mime_type()));
        session.stream = Some(stream);
        session.chunks = Some(chunks);
        session.started_at = Some(Instant::now());
        session.state = RecorderState::Recording;
        session.ticker = Some(spawn_ticker(
            Arc::downgrade(inner),
            session.generation,
            inner.config.tick,
        ));
        info!(mime_type = ?session.mime_type, "recorder: recording started");
        inner.emit(RecorderEvent::StateChanged(RecorderState::Recording));
        Ok(())
    }

    /// Ends capture and produces the recording for preview and sending.
    pub async fn stop(&self) -> Result<(), RecorderError> {
        self.inner.finish(StopReason::Manual, None).await
    }

    /// Starts or pauses preview playback; returns whether audio is playing.
    pub async fn toggle_playback(&self) -> Result<bool, RecorderError> {
        let inner = &self.inner;
        let mut session = inner.session.lock().await;
        if session.state != RecorderState::Recorded {
            return Err(RecorderError::InvalidTransition {
                action: "preview",
                state: session.state,
            });
        }
        let url = match session.preview_url.clone() {
            Some(url) => url,
            None => {
                let recording = session
                    .recording
                    .as_ref()
                    .ok_or(RecorderError::EmptyRecording)?;
                let url = inner.playback.create_object_url(recording)?;
                session.preview_url = Some(url.clone());
                url
            }
        };
        if session.playing {
            inner.playback.pause(&url);
            session.playing = false;
        } else {
            inner.playback.play(&url)?;
            session.playing = true;
        }
        Ok(session.playing)
    }

    /// Uploads the recording. On failure the recording is kept and the
    /// recorder returns to `Recorded` so the send can be retried.
    pub async fn send(&self) -> Result<PublicReference, RecorderError> {
        let inner = &self.inner;
        let blob = {
            let mut session = inner.session.lock().await;
            if session.state != RecorderState::Recorded {
                return Err(RecorderError::InvalidTransition {
                    action: "send",
                    state: session.state,
                });
            }
            let recording = session
                .recording
                .clone()
                .ok_or(RecorderError::EmptyRecording)?;
            if session.playing {
                if let Some(url) = &session.preview_url {
                    inner.playback.pause(url);
                }
                session.playing = false;
            }
            session.state = RecorderState::Uploading;
            inner.upload_progress.store(0, Ordering::SeqCst);
            inner.emit(RecorderEvent::StateChanged(RecorderState::Uploading));
            let extension = extension_for(&recording.mime_type, None);
            MediaBlob::new(recording.bytes, recording.mime_type)
                .with_file_name(format!("voice-message.{extension}"))
        };

        let destination = UploadDestination::new(MediaKind::Voice, inner.owner.clone());
        let on_progress = |percent: u8| {
            inner.upload_progress.store(percent, Ordering::SeqCst);
            inner.emit(RecorderEvent::UploadProgress(percent));
        };
        let result = inner
            .uploads
            .upload(&blob, &destination, Some(&on_progress))
            .await;

        let mut session = inner.session.lock().await;
        match result {
            Ok(reference) => {
                inner.upload_progress.store(100, Ordering::SeqCst);
                session.state = RecorderState::Sent;
                inner.teardown(&mut session).await;
                info!(bucket = %reference.bucket, path = %reference.path, "recorder: voice message sent");
                inner.emit(RecorderEvent::Sent(reference.clone()));
                inner.emit(RecorderEvent::StateChanged(RecorderState::Sent));
                Ok(reference)
            }
            Err(err) => {
                session.state = RecorderState::Recorded;
                inner.upload_progress.store(0, Ordering::SeqCst);
                error!("recorder: voice message upload failed: {err}");
                inner.emit(RecorderEvent::Failed(err.to_string()));
                inner.emit(RecorderEvent::StateChanged(RecorderState::Recorded));
                Err(RecorderError::UploadFailed(err))
            }
        }
    }

    /// Discards the session and releases every held resource.
    pub async fn cancel(&self) -> Result<(), RecorderError> {
        let inner = &self.inner;
        let mut session = inner.session.lock().await;
        match session.state {
            RecorderState::Recording | RecorderState::Recorded => {
                inner.teardown(&mut session).await;
                session.state = RecorderState::Idle;
                info!("recorder: session cancelled");
                inner.emit(RecorderEvent::Cancelled);
                inner.emit(RecorderEvent::StateChanged(RecorderState::Idle));
                Ok(())
            }
            state => Err(RecorderError::InvalidTransition {
                action: "cancel",
                state,
            }),
        }
    }

    /// Releases anything still held, for when the owning view goes away.
    pub async fn dispose(&self) {
        let inner = &self.inner;
        let mut session = inner.session.lock().await;
        if session.state == RecorderState::Uploading {
            // The in-flight send tears down on completion.
            return;
        }
        inner.teardown(&mut session).await;
        if session.state != RecorderState::Sent {
            session.state = RecorderState::Idle;
        }
    }
}

impl RecorderInner {
    fn emit(&self, event: RecorderEvent) {
        let _ = self.events.send(event);
    }

    async fn finish(
        &self,
        reason: StopReason,
        expected_generation: Option<u64>,
    ) -> Result<(), RecorderError> {
        let mut session = self.session.lock().await;
        if expected_generation.is_some_and(|generation| generation != session.generation) {
            return Ok(());
        }
        if session.state != RecorderState::Recording {
            return Err(RecorderError::InvalidTransition {
                action: "stop",
                state: session.state,
            });
        }
        if let Some(ticker) = session.ticker.take() {
            // The ticker itself drives a max-duration stop and must not be aborted.
            if reason == StopReason::Manual {
                ticker.abort();
            }
        }
        if let Some(stream) = session.stream.as_mut() {
            stream.stop().await;
        }
        if let Some(mut chunks) = session.chunks.take() {
            while let Ok(chunk) = chunks.try_recv() {
                if !chunk.is_empty() {
                    session.raw_chunks.push(chunk);
                }
            }
        }
        if let Some(started_at) = session.started_at {
            let measured = started_at.elapsed().as_secs() as u32;
            session.elapsed_seconds = session.elapsed_seconds.max(measured);
        }

        if session.raw_chunks.is_empty() {
            warn!("recorder: capture produced no audio");
            self.teardown(&mut session).await;
            session.state = RecorderState::Idle;
            self.emit(RecorderEvent::Failed(RecorderError::EmptyRecording.to_string()));
            self.emit(RecorderEvent::StateChanged(RecorderState::Idle));
            return Err(RecorderError::EmptyRecording);
        }

        let Some(format) = session.stream.as_ref().map(|stream| stream.format().clone()) else {
            self.teardown(&mut session).await;
            session.state = RecorderState::Idle;
            return Err(RecorderError::EmptyRecording);
        };
        let recording = match self.encoder.encode(&session.raw_chunks, &format) {
            Ok(recording) => recording,
            Err(EncodeError::UnsupportedInput(mime_type)) => {
                // Keep the platform's own container rather than lose the take.
                info!(mime_type = %mime_type, "recorder: keeping recorder output without transcoding");
                let joined: Vec<u8> = session
                    .raw_chunks
                    .iter()
                    .flat_map(|chunk| chunk.iter().copied())
                    .collect();
                EncodedAudio {
                    bytes: Bytes::from(joined),
                    mime_type,
                    duration: None,
                }
            }
            Err(err) => {
                error!("recorder: encoding failed: {err}");
                self.teardown(&mut session).await;
                session.state = RecorderState::Idle;
                self.emit(RecorderEvent::Failed(err.to_string()));
                self.emit(RecorderEvent::StateChanged(RecorderState::Idle));
                return Err(RecorderError::Encoding(err));
            }
        };

        session.raw_chunks.clear();
        session.mime_type = Some(recording.mime_type.clone());
        session.recording = Some(recording);
        session.state = RecorderState::Recorded;
        let elapsed_seconds = session.elapsed_seconds;
        info!(elapsed_seconds, ?reason, "recorder: recording stopped");
        if reason == StopReason::MaxDuration {
            self.emit(RecorderEvent::AutoStopped { elapsed_seconds });
        }
        self.emit(RecorderEvent::StateChanged(RecorderState::Recorded));
        Ok(())
    }

    /// Stops the timer and releases the stream and preview url. Each resource
    /// is taken out of the session so it is released at most once.
    async fn teardown(&self, session: &mut RecordingSession) {
        if let Some(ticker) = session.ticker.take() {
            ticker.abort();
        }
        if let Some(mut stream) = session.stream.take() {
            if session.state == RecorderState::Recording {
                stream.stop().await;
            }
            stream.release();
        }
        session.chunks = None;
        session.raw_chunks.clear();
        session.recording = None;
        if let Some(url) = session.preview_url.take() {
            if session.playing {
                self.playback.pause(&url);
            }
            self.playback.revoke_object_url(&url);
        }
        session.playing = false;
        session.started_at = None;
    }
}

fn spawn_ticker(inner: Weak<RecorderInner>, generation: u64, tick: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval_at(Instant::now() + tick, tick);
        loop {
            interval.tick().await;
            let Some(inner) = inner.upgrade() else {
                return;
            };
            let reached_limit = {
                let mut session = inner.session.lock().await;
                if session.generation != generation || session.state != RecorderState::Recording {
                    return;
                }
                session.elapsed_seconds += 1;
                let elapsed_seconds = session.elapsed_seconds;
                inner.emit(RecorderEvent::Tick { elapsed_seconds });
                Duration::from_secs(u64::from(elapsed_seconds)) >= inner.config.max_duration
            };
            if reached_limit {
                info!("recorder: maximum duration reached, stopping");
                if let Err(err) = inner.finish(StopReason::MaxDuration, Some(generation)).await {
                    warn!("recorder: automatic stop failed: {err}");
                }
                return;
            }
        }
    })
}

#[cfg(test)]
#[path = "tests/voice_recorder_tests.rs"]
mod tests;
