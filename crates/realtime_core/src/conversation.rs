use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use shared::{
    domain::{ChangeType, ConversationKey, MediaKind, MessageId, Timestamp, UserId},
    protocol::{EventFilter, Message, NewMessage, Predicate},
};
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{
    backend::{CurrentUser, Filter, RelationalStore},
    clock::Clock,
    error::{StoreError, SubscriptionError},
    message_store::{DeliveryState, MessageGroup, MessageStore, MESSAGES_TABLE},
    realtime::{ChannelEvent, ChannelHandler, ChannelSubscriptionManager, SubscriptionHandle},
    upload::{MediaBlob, PublicReference, UploadDestination, UploadPipeline},
};

#[derive(Debug, Clone, PartialEq)]
pub enum ConversationEvent {
    Updated,
    SendFailed { client_ref: String, reason: String },
    RefreshFailed(String),
}

/// Shared by the conversation and its realtime handler.
struct ConversationCore {
    key: ConversationKey,
    db: Arc<dyn RelationalStore>,
    store: Mutex<MessageStore>,
    events: broadcast::Sender<ConversationEvent>,
}

impl ConversationCore {
    async fn refresh(&self) -> Result<usize, StoreError> {
        let mut store = self.store.lock().await;
        let count = store.load(self.db.as_ref(), &self.key).await?.len();
        drop(store);
        let _ = self.events.send(ConversationEvent::Updated);
        Ok(count)
    }

    async fn apply_change(&self, change: &shared::protocol::ChangeEvent) {
        let message = match change.decode::<Message>() {
            Ok(message) => message,
            Err(err) => {
                warn!(conversation = %self.key, "messages: malformed realtime row: {err}");
                return;
            }
        };
        if message.conversation_key() != self.key {
            return;
        }
        let changed = {
            let mut store = self.store.lock().await;
            match change.change_type {
                ChangeType::Insert => store.append_incoming(message),
                ChangeType::Update => store.apply_update(&message),
                _ => false,
            }
        };
        if changed {
            let _ = self.events.send(ConversationEvent::Updated);
        }
    }
}

struct ConversationHandler {
    core: Arc<ConversationCore>,
}

#[async_trait]
impl ChannelHandler for ConversationHandler {
    async fn handle(&self, event: &ChannelEvent) {
        match event {
            ChannelEvent::Change(change) => self.core.apply_change(change).await,
            ChannelEvent::Reconnected { topic } => {
                info!(topic = %topic, "messages: reconciling after reconnect");
                if let Err(err) = self.core.refresh().await {
                    error!(conversation = %self.core.key, "messages: refresh after reconnect failed: {err}");
                    let _ = self
                        .core
                        .events
                        .send(ConversationEvent::RefreshFailed(err.to_string()));
                }
            }
        }
    }
}

/// One direct-message thread: history, live updates and the send path.
pub struct Conversation {
    me: UserId,
    peer: UserId,
    core: Arc<ConversationCore>,
    clock: Arc<dyn Clock>,
    uploads: Arc<UploadPipeline>,
    manager: Arc<ChannelSubscriptionManager>,
    subscription: Mutex<Option<SubscriptionHandle>>,
}

impl Conversation {
    pub fn new(
        me: &CurrentUser,
        peer: UserId,
        db: Arc<dyn RelationalStore>,
        uploads: Arc<UploadPipeline>,
        manager: Arc<ChannelSubscriptionManager>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let key = ConversationKey::new(me.id.clone(), peer.clone());
        let (events, _) = broadcast::channel(256);
        Self {
            me: me.id.clone(),
            peer,
            core: Arc::new(ConversationCore {
                key,
                db,
                store: Mutex::new(MessageStore::new(Arc::clone(&clock))),
                events,
            }),
            clock,
            uploads,
            manager,
            subscription: Mutex::new(None),
        }
    }

    pub fn key(&self) -> &ConversationKey {
        &self.core.key
    }

    pub fn peer(&self) -> &UserId {
        &self.peer
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ConversationEvent> {
        self.core.events.subscribe()
    }

    pub async fn load(&self) -> Result<Vec<Message>, StoreError> {
        self.core.refresh().await?;
        Ok(self.messages().await)
    }

    pub async fn messages(&self) -> Vec<Message> {
        self.core.store.lock().await.messages().to_vec()
    }

    pub async fn groups(&self) -> Vec<MessageGroup> {
        self.core.store.lock().await.group_by_date().to_vec()
    }

    pub async fn delivery_state(&self, client_ref: &str) -> Option<DeliveryState> {
        self.core.store.lock().await.delivery_state(client_ref)
    }

    pub async fn failed_sends(&self) -> Vec<String> {
        self.core.store.lock().await.failed_refs()
    }

    /// Follows new messages and read receipts on the thread's topic.
    pub async fn open_live(&self) -> Result<(), SubscriptionError> {
        let mut subscription = self.subscription.lock().await;
        if subscription.is_some() {
            return Ok(());
        }
        let me = self.me.as_str();
        let filters = vec![
            EventFilter::table(MESSAGES_TABLE, ChangeType::Insert)
                .with_predicate(Predicate::eq("recipient_id", me)),
            EventFilter::table(MESSAGES_TABLE, ChangeType::Insert)
                .with_predicate(Predicate::eq("sender_id", me)),
            EventFilter::table(MESSAGES_TABLE, ChangeType::Update)
                .with_predicate(Predicate::eq("sender_id", me)),
        ];
        let handler = Arc::new(ConversationHandler {
            core: Arc::clone(&self.core),
        });
        let handle = self
            .manager
            .subscribe(&self.core.key.topic(), filters, handler)
            .await?;
        *subscription = Some(handle);
        Ok(())
    }

    pub async fn close(&self) {
        if let Some(handle) = self.subscription.lock().await.take() {
            self.manager.unsubscribe(&handle).await;
        }
    }

    /// Sends a text message. It is shown immediately and reconciled with the
    /// stored row; on failure it stays in the list flagged as failed.
    pub async fn send(&self, content: impl Into<String>) -> Result<Message, StoreError> {
        let draft = NewMessage::text(self.me.clone(), self.peer.clone(), content);
        self.send_draft(draft).await
    }

    /// Sends an already-uploaded attachment.
    pub async fn send_attachment(
        &self,
        content: impl Into<String>,
        reference: &PublicReference,
        kind: MediaKind,
        file_name: Option<String>,
    ) -> Result<Message, StoreError> {
        let mut draft = NewMessage::text(self.me.clone(), self.peer.clone(), content);
        draft.media_url = Some(reference.url.clone());
        draft.media_type = Some(kind);
        draft.file_name = file_name;
        self.send_draft(draft).await
    }

    /// Uploads `blob` and sends a message pointing at it.
    pub async fn send_media(
        &self,
        content: impl Into<String>,
        blob: &MediaBlob,
    ) -> Result<Message, StoreError> {
        let kind = blob.kind();
        let destination = UploadDestination::new(kind, self.me.clone());
        let reference = self.uploads.upload(blob, &destination, None).await?;
        self.send_attachment(content, &reference, kind, blob.file_name.clone())
            .await
    }

    pub async fn retry_failed(&self, client_ref: &str) -> Result<Message, StoreError> {
        let local = {
            let mut store = self.core.store.lock().await;
            if store.delivery_state(client_ref) != Some(DeliveryState::Failed) {
                return Err(StoreError::UnknownPending(client_ref.to_string()));
            }
            let Some(local) = store.local_message(client_ref).cloned() else {
                return Err(StoreError::UnknownPending(client_ref.to_string()));
            };
            store.mark_sending(client_ref);
            local
        };
        let _ = self.core.events.send(ConversationEvent::Updated);
        let draft = NewMessage {
            sender_id: local.sender_id,
            recipient_id: local.recipient_id,
            content: local.content,
            media_url: local.media_url,
            media_type: local.media_type,
            file_name: local.file_name,
            client_ref: Some(client_ref.to_string()),
        };
        self.persist(draft, client_ref).await
    }

    pub async fn discard_failed(&self, client_ref: &str) -> Option<Message> {
        let mut store = self.core.store.lock().await;
        if store.delivery_state(client_ref) != Some(DeliveryState::Failed) {
            return None;
        }
        let removed = store.remove_local(client_ref);
        drop(store);
        if removed.is_some() {
            let _ = self.core.events.send(ConversationEvent::Updated);
        }
        removed
    }

    /// Marks inbound messages as read, remotely first and then locally.
    pub async fn mark_read(&self) -> Result<usize, StoreError> {
        let unread = self.core.store.lock().await.unread_from(&self.me);
        if unread.is_empty() {
            return Ok(0);
        }
        let read_at = Timestamp::from(self.clock.now());
        let filters = [
            Filter::eq("recipient_id", &self.me),
            Filter::eq("sender_id", &self.peer),
            Filter::is_null("read_at"),
        ];
        self.core
            .db
            .update(MESSAGES_TABLE, &filters, json!({ "read_at": read_at }))
            .await
            .map_err(|source| StoreError::ReadUpdate { source })?;
        let updated = self
            .core
            .store
            .lock()
            .await
            .mark_read_locally(&self.me, &read_at);
        debug!(conversation = %self.core.key, count = updated.len(), "messages: marked read");
        let _ = self.core.events.send(ConversationEvent::Updated);
        Ok(updated.len())
    }

    async fn send_draft(&self, mut draft: NewMessage) -> Result<Message, StoreError> {
        let client_ref = Uuid::new_v4().to_string();
        draft.client_ref = Some(client_ref.clone());
        let optimistic = Message {
            id: MessageId::local(&client_ref),
            sender_id: draft.sender_id.clone(),
            recipient_id: draft.recipient_id.clone(),
            content: draft.content.clone(),
            created_at: Timestamp::from(self.clock.now()),
            media_url: draft.media_url.clone(),
            media_type: draft.media_type,
            file_name: draft.file_name.clone(),
            read_at: None,
            client_ref: Some(client_ref.clone()),
        };
        self.core.store.lock().await.insert_optimistic(optimistic);
        let _ = self.core.events.send(ConversationEvent::Updated);
        self.persist(draft, &client_ref).await
    }

    async fn persist(&self, draft: NewMessage, client_ref: &str) -> Result<Message, StoreError> {
        let row = serde_json::to_value(&draft).map_err(|source| StoreError::Decode {
            entity: MESSAGES_TABLE,
            source,
        })?;
        let stored = match self.core.db.insert(MESSAGES_TABLE, row).await {
            Ok(stored) => stored,
            Err(source) => {
                warn!(conversation = %self.core.key, client_ref, "messages: send failed: {source:#}");
                self.core.store.lock().await.mark_failed(client_ref);
                let _ = self.core.events.send(ConversationEvent::SendFailed {
                    client_ref: client_ref.to_string(),
                    reason: format!("{source:#}"),
                });
                return Err(StoreError::SendFailed { source });
            }
        };
        let mut confirmed: Message =
            serde_json::from_value(stored).map_err(|source| StoreError::Decode {
                entity: MESSAGES_TABLE,
                source,
            })?;
        if confirmed.client_ref.is_none() {
            confirmed.client_ref = Some(client_ref.to_string());
        }
        self.core
            .store
            .lock()
            .await
            .append_incoming(confirmed.clone());
        let _ = self.core.events.send(ConversationEvent::Updated);
        info!(conversation = %self.core.key, message_id = %confirmed.id, "messages: sent");
        Ok(confirmed)
    }
}

#[cfg(test)]
#[path = "tests/conversation_tests.rs"]
mod tests;
