use std::{
    collections::HashMap,
    fmt,
    sync::{
        atomic::{AtomicU8, Ordering},
        Arc,
    },
    time::Duration,
};

use bytes::Bytes;
use chrono::Utc;
use shared::domain::{MediaKind, UserId};
use tracing::{info, warn};
use uuid::Uuid;

use crate::{
    backend::{ObjectStorage, UploadOptions},
    error::{StorageError, UploadError},
};

const DEFAULT_EXTENSION: &str = "bin";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BucketDescriptor {
    pub bucket: String,
    /// Optional folder inside the bucket.
    pub prefix: Option<String>,
}

impl BucketDescriptor {
    pub fn new(bucket: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            prefix: None,
        }
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = Some(prefix.into());
        self
    }

    fn object_path(&self, object_name: &str) -> String {
        match self.prefix.as_deref().map(|p| p.trim_matches('/')) {
            Some(prefix) if !prefix.is_empty() => format!("{prefix}/{object_name}"),
            _ => object_name.to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct MediaBlob {
    pub bytes: Bytes,
    pub content_type: String,
    pub file_name: Option<String>,
}

impl MediaBlob {
    pub fn new(bytes: impl Into<Bytes>, content_type: impl Into<String>) -> Self {
        Self {
            bytes: bytes.into(),
            content_type: content_type.into(),
            file_name: None,
        }
    }

    pub fn with_file_name(mut self, file_name: impl Into<String>) -> Self {
        self.file_name = Some(file_name.into());
        self
    }

    pub fn kind(&self) -> MediaKind {
        MediaKind::from_mime(&self.content_type)
    }

    pub fn len(&self) -> u64 {
        self.bytes.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// Who owns the object and which bucket chain to try.
#[derive(Debug, Clone)]
pub struct UploadDestination {
    pub kind: MediaKind,
    pub owner: UserId,
    /// Overrides the pipeline's configured chain when non-empty.
    pub candidates: Vec<BucketDescriptor>,
}

impl UploadDestination {
    pub fn new(kind: MediaKind, owner: UserId) -> Self {
        Self {
            kind,
            owner,
            candidates: Vec::new(),
        }
    }

    pub fn with_candidates(mut self, candidates: Vec<BucketDescriptor>) -> Self {
        self.candidates = candidates;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublicReference {
    pub url: String,
    pub bucket: String,
    pub path: String,
}

impl fmt::Display for PublicReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.url)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadStatus {
    Pending,
    Uploading,
    Succeeded,
    Failed,
}

#[derive(Debug, Clone)]
pub struct UploadTask {
    pub candidates: Vec<BucketDescriptor>,
    pub object_name: String,
    pub attempts_remaining: u32,
    pub attempts_made: u32,
    pub progress_percent: u8,
    pub status: UploadStatus,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts_per_candidate: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts_per_candidate: 3,
            delay: Duration::from_secs(1),
        }
    }
}

/// Whole-percent progress observer.
pub type ProgressCallback<'a> = dyn Fn(u8) + Send + Sync + 'a;

/// Forwards only strictly increasing percentages.
struct ProgressReporter<'a> {
    reported: AtomicU8,
    callback: Option<&'a ProgressCallback<'a>>,
}

impl ProgressReporter<'_> {
    fn report(&self, percent: u8) {
        let percent = percent.min(100);
        let previous = self.reported.fetch_max(percent, Ordering::SeqCst);
        if percent > previous {
            if let Some(callback) = self.callback {
                callback(percent);
            }
        }
    }

    fn current(&self) -> u8 {
        self.reported.load(Ordering::SeqCst)
    }
}

pub struct UploadPipeline {
    storage: Arc<dyn ObjectStorage>,
    policy: RetryPolicy,
    chains: HashMap<MediaKind, Vec<BucketDescriptor>>,
    fallback_chain: Vec<BucketDescriptor>,
    max_bytes: Option<u64>,
}

impl UploadPipeline {
    pub fn new(storage: Arc<dyn ObjectStorage>, policy: RetryPolicy) -> Self {
        Self {
            storage,
            policy,
            chains: HashMap::new(),
            fallback_chain: Vec::new(),
            max_bytes: None,
        }
    }

    pub fn with_chain(mut self, kind: MediaKind, candidates: Vec<BucketDescriptor>) -> Self {
        self.chains.insert(kind, candidates);
        self
    }

    /// Chain used for kinds without a dedicated one.
    pub fn with_fallback_chain(mut self, candidates: Vec<BucketDescriptor>) -> Self {
        self.fallback_chain = candidates;
        self
    }

    pub fn with_max_bytes(mut self, max_bytes: u64) -> Self {
        self.max_bytes = Some(max_bytes);
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn candidates_for(&self, kind: MediaKind) -> Vec<BucketDescriptor> {
        self.chains
            .get(&kind)
            .cloned()
            .unwrap_or_else(|| self.fallback_chain.clone())
    }

    /// Validates the blob and lays out the attempt budget without touching
    /// storage.
    pub fn prepare(
        &self,
        blob: &MediaBlob,
        destination: &UploadDestination,
    ) -> Result<UploadTask, UploadError> {
        if blob.is_empty() {
            return Err(UploadError::EmptyPayload);
        }
        if let Some(limit) = self.max_bytes {
            if blob.len() > limit {
                return Err(UploadError::PayloadTooLarge {
                    size: blob.len(),
                    limit: Some(limit),
                });
            }
        }
        let candidates = if destination.candidates.is_empty() {
            self.candidates_for(destination.kind)
        } else {
            destination.candidates.clone()
        };
        if candidates.is_empty() {
            return Err(UploadError::NoDestination(destination.kind.as_str()));
        }
        let per_candidate = self.policy.attempts_per_candidate.max(1);
        Ok(UploadTask {
            attempts_remaining: per_candidate.saturating_mul(candidates.len() as u32),
            candidates,
            object_name: object_name(
                &destination.owner,
                &extension_for(&blob.content_type, blob.file_name.as_deref()),
            ),
            attempts_made: 0,
            progress_percent: 0,
            status: UploadStatus::Pending,
        })
    }

    pub async fn upload(
        &self,
        blob: &MediaBlob,
        destination: &UploadDestination,
        on_progress: Option<&ProgressCallback<'_>>,
    ) -> Result<PublicReference, UploadError> {
        let mut task = self.prepare(blob, destination)?;
        self.run(&mut task, blob, on_progress).await
    }

    /// Walks the candidate chain. Transfer failures are retried on the same
    /// bucket, then the next one; any other failure ends the task at once.
    pub async fn run(
        &self,
        task: &mut UploadTask,
        blob: &MediaBlob,
        on_progress: Option<&ProgressCallback<'_>>,
    ) -> Result<PublicReference, UploadError> {
        let reporter = ProgressReporter {
            reported: AtomicU8::new(task.progress_percent),
            callback: on_progress,
        };
        let options = UploadOptions::new(blob.content_type.clone());
        let per_candidate = self.policy.attempts_per_candidate.max(1);
        let candidates = task.candidates.clone();
        let mut last_error = String::new();
        task.status = UploadStatus::Uploading;

        for (candidate_index, candidate) in candidates.iter().enumerate() {
            let path = candidate.object_path(&task.object_name);
            for attempt in 1..=per_candidate {
                if task.attempts_remaining == 0 {
                    break;
                }
                if task.attempts_made > 0 {
                    tokio::time::sleep(self.policy.delay).await;
                }
                task.attempts_remaining -= 1;
                task.attempts_made += 1;
                info!(
                    bucket = %candidate.bucket,
                    candidate_index,
                    attempt,
                    max_attempts = per_candidate,
                    bytes = blob.len(),
                    "upload: attempt"
                );

                let progress = |sent: u64, total: u64| {
                    if total > 0 {
                        // 100 is reserved for confirmed completion.
                        let percent = (sent.saturating_mul(100) / total).min(99) as u8;
                        reporter.report(percent);
                    }
                };
                let outcome = self
                    .storage
                    .upload(
                        &candidate.bucket,
                        &path,
                        blob.bytes.clone(),
                        &options,
                        &progress,
                    )
                    .await;
                task.progress_percent = reporter.current();

                let failure = match outcome {
                    Ok(()) => {
                        reporter.report(100);
                        task.progress_percent = 100;
                        task.status = UploadStatus::Succeeded;
                        let url = self.storage.public_url(&candidate.bucket, &path);
                        info!(bucket = %candidate.bucket, candidate_index, path = %path, "upload: stored");
                        return Ok(PublicReference {
                            url,
                            bucket: candidate.bucket.clone(),
                            path,
                        });
                    }
                    Err(StorageError::Transfer(message)) => message,
                    Err(StorageError::PermissionDenied(message)) => {
                        return Err(self.abandon(
                            task,
                            candidate_index,
                            UploadError::PermissionDenied {
                                bucket: candidate.bucket.clone(),
                                message,
                            },
                        ));
                    }
                    Err(StorageError::PayloadTooLarge { size }) => {
                        return Err(self.abandon(
                            task,
                            candidate_index,
                            UploadError::PayloadTooLarge {
                                size,
                                limit: self.max_bytes,
                            },
                        ));
                    }
                    Err(StorageError::Rejected(message)) => {
                        return Err(self.abandon(
                            task,
                            candidate_index,
                            UploadError::Rejected {
                                bucket: candidate.bucket.clone(),
                                message,
                            },
                        ));
                    }
                };
                warn!(
                    bucket = %candidate.bucket,
                    candidate_index,
                    attempt,
                    attempts_remaining = task.attempts_remaining,
                    "upload: attempt failed: {failure}"
                );
                last_error = failure;
            }
            if candidate_index + 1 < candidates.len() {
                info!(
                    bucket = %candidate.bucket,
                    candidate_index,
                    "upload: bucket exhausted, falling back to next candidate"
                );
            }
        }

        task.status = UploadStatus::Failed;
        let err = UploadError::Exhausted {
            attempts: task.attempts_made,
            candidates: candidates.len(),
            last_error,
        };
        warn!("upload: {err}");
        Err(err)
    }

    fn abandon(&self, task: &mut UploadTask, candidate_index: usize, err: UploadError) -> UploadError {
        // A permanent failure forfeits the remaining budget.
        task.attempts_remaining = 0;
        task.status = UploadStatus::Failed;
        warn!(candidate_index, "upload: giving up: {err}");
        err
    }
}

/// Collision-resistant object name: `{owner}/{millis}-{random}.{ext}`.
pub fn object_name(owner: &UserId, extension: &str) -> String {
    let random = Uuid::new_v4().simple().to_string();
    format!(
        "{}/{}-{}.{extension}",
        sanitize_segment(owner.as_str()),
        Utc::now().timestamp_millis(),
        &random[..8]
    )
}

fn sanitize_segment(segment: &str) -> String {
    let cleaned: String = segment
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_'))
        .collect();
    if cleaned.is_empty() {
        "anonymous".to_string()
    } else {
        cleaned
    }
}

/// File extension for a content type, falling back to the declared file name
/// and finally to `bin`.
pub fn extension_for(content_type: &str, file_name: Option<&str>) -> String {
    let essence = content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();
    let preferred = match essence.as_str() {
        "audio/wav" | "audio/x-wav" | "audio/wave" => Some("wav"),
        "audio/webm" | "video/webm" => Some("webm"),
        "audio/ogg" => Some("ogg"),
        "audio/mpeg" => Some("mp3"),
        "audio/mp4" => Some("m4a"),
        "image/jpeg" => Some("jpg"),
        "image/png" => Some("png"),
        "image/gif" => Some("gif"),
        "image/webp" => Some("webp"),
        "video/mp4" => Some("mp4"),
        "video/quicktime" => Some("mov"),
        "application/pdf" => Some("pdf"),
        _ => None,
    };
    let opaque = essence.is_empty() || essence == "application/octet-stream";
    let guessed = preferred.map(str::to_string).or_else(|| {
        if opaque {
            return None;
        }
        mime_guess::get_mime_extensions_str(&essence)
            .and_then(|extensions| extensions.first())
            .map(|extension| extension.to_string())
    });
    let from_name = || {
        file_name
            .and_then(|name| name.rsplit_once('.'))
            .map(|(_, extension)| extension.to_string())
    };
    guessed
        .or_else(from_name)
        .map(|extension| sanitize_extension(&extension))
        .filter(|extension| !extension.is_empty())
        .unwrap_or_else(|| DEFAULT_EXTENSION.to_string())
}

fn sanitize_extension(extension: &str) -> String {
    extension
        .chars()
        .filter(char::is_ascii_alphanumeric)
        .take(8)
        .collect::<String>()
        .to_ascii_lowercase()
}

#[cfg(test)]
#[path = "tests/upload_tests.rs"]
mod tests;
