use std::{collections::HashMap, sync::Arc};

use anyhow::{Context, Result};
use media_capture::{AudioEncoder, MediaCaptureDevice, PreviewPlayback};
use shared::domain::{ConversationKey, MediaKind, UserId};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::{
    backend::{CurrentUser, IdentityProvider, ObjectStorage, RelationalStore},
    clock::{Clock, SystemClock},
    config::Settings,
    conversation::Conversation,
    error::{StoreError, SubscriptionError},
    notifications::{NotificationDispatcher, NotificationTopics},
    realtime::ChannelSubscriptionManager,
    rest::{HttpObjectStorage, RestStore},
    transport::{RealtimeTransport, WebSocketTransport},
    upload::UploadPipeline,
    voice_recorder::{RecorderConfig, VoiceRecorder},
};

pub struct SessionDependencies {
    pub identity: Arc<dyn IdentityProvider>,
    pub db: Arc<dyn RelationalStore>,
    pub storage: Arc<dyn ObjectStorage>,
    pub transport: Arc<dyn RealtimeTransport>,
    pub clock: Arc<dyn Clock>,
}

impl SessionDependencies {
    /// HTTP and websocket collaborators pointed at the configured backend.
    pub fn from_settings(settings: &Settings, identity: Arc<dyn IdentityProvider>) -> Result<Self> {
        Ok(Self {
            identity,
            db: Arc::new(RestStore::from_settings(settings)),
            storage: Arc::new(HttpObjectStorage::from_settings(settings)),
            transport: Arc::new(
                WebSocketTransport::from_settings(settings)
                    .context("failed to configure realtime transport")?,
            ),
            clock: Arc::new(SystemClock),
        })
    }
}

/// Everything realtime that lives between login and logout.
pub struct RealtimeSession {
    settings: Settings,
    user: CurrentUser,
    db: Arc<dyn RelationalStore>,
    clock: Arc<dyn Clock>,
    subscriptions: Arc<ChannelSubscriptionManager>,
    uploads: Arc<UploadPipeline>,
    notifications: Arc<NotificationDispatcher>,
    conversations: Mutex<HashMap<ConversationKey, Arc<Conversation>>>,
}

impl RealtimeSession {
    pub fn new(settings: Settings, deps: SessionDependencies) -> Result<Self, StoreError> {
        let user = deps.identity.current_user().ok_or(StoreError::NotSignedIn)?;
        let subscriptions = Arc::new(ChannelSubscriptionManager::new(
            deps.transport,
            settings.reconnect_policy(),
        ));
        let uploads = Arc::new(
            UploadPipeline::new(deps.storage, settings.retry_policy())
                .with_chain(MediaKind::Voice, settings.bucket_candidates(MediaKind::Voice))
                .with_fallback_chain(settings.bucket_candidates(MediaKind::File))
                .with_max_bytes(settings.max_upload_bytes),
        );
        let topics = NotificationTopics {
            follows: settings.notify_follows,
            ..NotificationTopics::default()
        };
        let notifications = Arc::new(NotificationDispatcher::new(
            &user,
            Arc::clone(&deps.db),
            Arc::clone(&subscriptions),
            Arc::clone(&deps.clock),
            topics,
            settings.notification_feed_limit,
        ));
        Ok(Self {
            settings,
            user,
            db: deps.db,
            clock: deps.clock,
            subscriptions,
            uploads,
            notifications,
            conversations: Mutex::new(HashMap::new()),
        })
    }

    /// Builds the session and opens the notification topics. Topics that
    /// fail to open are returned alongside the session rather than failing
    /// the login.
    pub async fn start(
        settings: Settings,
        deps: SessionDependencies,
    ) -> Result<(Arc<Self>, Vec<SubscriptionError>), StoreError> {
        let session = Arc::new(Self::new(settings, deps)?);
        let failures = session.notifications.start().await;
        info!(user = %session.user.id, failed_topics = failures.len(), "session: started");
        Ok((session, failures))
    }

    pub fn user(&self) -> &CurrentUser {
        &self.user
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn subscriptions(&self) -> &Arc<ChannelSubscriptionManager> {
        &self.subscriptions
    }

    pub fn uploads(&self) -> &Arc<UploadPipeline> {
        &self.uploads
    }

    pub fn notifications(&self) -> &Arc<NotificationDispatcher> {
        &self.notifications
    }

    /// Returns the cached thread with `peer`, loading history and going live
    /// on first use. A live-update failure leaves a usable, pull-only thread.
    pub async fn open_conversation(&self, peer: UserId) -> Result<Arc<Conversation>, StoreError> {
        let key = ConversationKey::new(self.user.id.clone(), peer.clone());
        if let Some(existing) = self.conversations.lock().await.get(&key) {
            return Ok(Arc::clone(existing));
        }
        let conversation = Arc::new(Conversation::new(
            &self.user,
            peer,
            Arc::clone(&self.db),
            Arc::clone(&self.uploads),
            Arc::clone(&self.subscriptions),
            Arc::clone(&self.clock),
        ));
        conversation.load().await?;
        if let Err(err) = conversation.open_live().await {
            warn!(conversation = %key, "session: live updates unavailable: {err}");
        }
        let winner = {
            let mut conversations = self.conversations.lock().await;
            Arc::clone(
                conversations
                    .entry(key.clone())
                    .or_insert_with(|| Arc::clone(&conversation)),
            )
        };
        if !Arc::ptr_eq(&winner, &conversation) {
            // A concurrent open got there first.
            debug!(conversation = %key, "session: dropping duplicate thread");
            conversation.close().await;
        }
        Ok(winner)
    }

    pub fn voice_recorder(
        &self,
        device: Arc<dyn MediaCaptureDevice>,
        encoder: Arc<dyn AudioEncoder>,
        playback: Arc<dyn PreviewPlayback>,
    ) -> VoiceRecorder {
        VoiceRecorder::new(
            device,
            encoder,
            playback,
            Arc::clone(&self.uploads),
            self.user.id.clone(),
            RecorderConfig {
                max_duration: self.settings.max_recording_duration(),
                ..RecorderConfig::default()
            },
        )
    }

    /// Logout: closes every thread and topic.
    pub async fn shutdown(&self) {
        let conversations: Vec<Arc<Conversation>> = self
            .conversations
            .lock()
            .await
            .drain()
            .map(|(_, conversation)| conversation)
            .collect();
        for conversation in conversations {
            conversation.close().await;
        }
        self.notifications.stop().await;
        self.subscriptions.shutdown().await;
        info!(user = %self.user.id, "session: shut down");
    }
}

#[cfg(test)]
#[path = "tests/session_tests.rs"]
mod tests;
