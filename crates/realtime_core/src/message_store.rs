use std::{
    collections::{BTreeMap, HashMap, HashSet},
    sync::Arc,
};

use chrono::{DateTime, Duration as ChronoDuration, FixedOffset, NaiveDate, Utc};
use shared::{
    domain::{ConversationKey, MessageId, Timestamp, UserId},
    protocol::Message,
};
use tracing::{debug, info};

use crate::{
    backend::{Filter, RelationalStore, SelectQuery},
    clock::Clock,
    error::StoreError,
};

pub const MESSAGES_TABLE: &str = "messages";
pub const UNKNOWN_DATE_LABEL: &str = "Unknown date";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryState {
    Sending,
    Failed,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MessageGroup {
    pub label: String,
    /// `None` for the bucket of messages whose timestamp could not be parsed.
    pub date: Option<NaiveDate>,
    pub messages: Vec<Message>,
}

/// Ordered, de-duplicated message list for one conversation.
pub struct MessageStore {
    clock: Arc<dyn Clock>,
    conversation: Option<ConversationKey>,
    messages: Vec<Message>,
    ids: HashSet<MessageId>,
    pending: HashMap<String, DeliveryState>,
    groups: Vec<MessageGroup>,
}

impl MessageStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            conversation: None,
            messages: Vec::new(),
            ids: HashSet::new(),
            pending: HashMap::new(),
            groups: Vec::new(),
        }
    }

    pub fn conversation(&self) -> Option<&ConversationKey> {
        self.conversation.as_ref()
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn contains(&self, id: &MessageId) -> bool {
        self.ids.contains(id)
    }

    pub fn group_by_date(&self) -> &[MessageGroup] {
        &self.groups
    }

    pub fn delivery_state(&self, client_ref: &str) -> Option<DeliveryState> {
        self.pending.get(client_ref).copied()
    }

    pub fn failed_refs(&self) -> Vec<String> {
        self.pending
            .iter()
            .filter(|(_, state)| **state == DeliveryState::Failed)
            .map(|(client_ref, _)| client_ref.clone())
            .collect()
    }

    /// Replaces the list with the persisted history of `key`. Unconfirmed
    /// local sends for the same conversation survive the reload.
    pub async fn load(
        &mut self,
        db: &dyn RelationalStore,
        key: &ConversationKey,
    ) -> Result<&[Message], StoreError> {
        let (a, b) = key.participants();
        let query = SelectQuery::from(MESSAGES_TABLE)
            .filter(Filter::Any(vec![
                vec![Filter::eq("sender_id", a), Filter::eq("recipient_id", b)],
                vec![Filter::eq("sender_id", b), Filter::eq("recipient_id", a)],
            ]))
            .order_by("created_at", true);
        let rows = db
            .select(&query)
            .await
            .map_err(|source| StoreError::ConversationLoad {
                conversation: key.to_string(),
                source,
            })?;
        let mut fetched = rows
            .into_iter()
            .map(|row| {
                serde_json::from_value::<Message>(row).map_err(|source| StoreError::Decode {
                    entity: MESSAGES_TABLE,
                    source,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        sort_chronologically(&mut fetched);

        let same_conversation = self.conversation.as_ref() == Some(key);
        let carried: Vec<Message> = if same_conversation {
            self.messages
                .iter()
                .filter(|message| message.id.is_local())
                .cloned()
                .collect()
        } else {
            self.pending.clear();
            Vec::new()
        };

        self.conversation = Some(key.clone());
        self.messages.clear();
        self.ids.clear();
        for message in fetched {
            if self.ids.insert(message.id.clone()) {
                self.messages.push(message);
            }
        }
        for local in carried {
            let confirmed = local
                .client_ref
                .as_deref()
                .is_some_and(|client_ref| self.confirmed_ref(client_ref));
            if confirmed {
                if let Some(client_ref) = &local.client_ref {
                    self.pending.remove(client_ref);
                }
                continue;
            }
            self.ids.insert(local.id.clone());
            self.insert_ordered(local);
        }
        self.regroup();
        info!(conversation = %key, messages = self.messages.len(), "messages: loaded history");
        Ok(&self.messages)
    }

    /// Adds a message arriving from realtime or a send confirmation. Returns
    /// false when it was already present or belongs elsewhere.
    pub fn append_incoming(&mut self, message: Message) -> bool {
        if let Some(key) = &self.conversation {
            if &message.conversation_key() != key {
                debug!(message_id = %message.id, "messages: ignoring message for another conversation");
                return false;
            }
        }
        if self.ids.contains(&message.id) {
            // The row may have arrived before its send confirmation; the
            // optimistic copy is then redundant.
            if let Some(client_ref) = &message.client_ref {
                if self.remove_local(client_ref).is_some() {
                    return true;
                }
            }
            debug!(message_id = %message.id, "messages: duplicate ignored");
            return false;
        }

        if let Some(client_ref) = message.client_ref.clone() {
            let local_id = MessageId::local(&client_ref);
            if let Some(index) = self.messages.iter().position(|m| m.id == local_id) {
                self.ids.remove(&local_id);
                self.ids.insert(message.id.clone());
                self.messages[index] = message;
                self.pending.remove(&client_ref);
                self.regroup();
                return true;
            }
        }

        self.ids.insert(message.id.clone());
        self.insert_ordered(message);
        self.regroup();
        true
    }

    /// Shows a not-yet-persisted message immediately. It must carry a
    /// `client_ref`, which is what the confirmed row is matched on.
    pub fn insert_optimistic(&mut self, message: Message) -> bool {
        let Some(client_ref) = message.client_ref.clone() else {
            return false;
        };
        if self.ids.contains(&message.id) {
            return false;
        }
        self.pending.insert(client_ref, DeliveryState::Sending);
        self.ids.insert(message.id.clone());
        self.insert_ordered(message);
        self.regroup();
        true
    }

    pub fn mark_sending(&mut self, client_ref: &str) {
        if let Some(state) = self.pending.get_mut(client_ref) {
            *state = DeliveryState::Sending;
        }
    }

    pub fn mark_failed(&mut self, client_ref: &str) {
        if let Some(state) = self.pending.get_mut(client_ref) {
            *state = DeliveryState::Failed;
        }
    }

    /// Local copy of an unconfirmed message.
    pub fn local_message(&self, client_ref: &str) -> Option<&Message> {
        let local_id = MessageId::local(client_ref);
        self.messages.iter().find(|m| m.id == local_id)
    }

    pub fn remove_local(&mut self, client_ref: &str) -> Option<Message> {
        let local_id = MessageId::local(client_ref);
        let index = self.messages.iter().position(|m| m.id == local_id)?;
        self.pending.remove(client_ref);
        self.ids.remove(&local_id);
        let removed = self.messages.remove(index);
        self.regroup();
        Some(removed)
    }

    /// Applies a mutation of an already-known message. Only the read marker
    /// may change, and the message keeps its position.
    pub fn apply_update(&mut self, message: &Message) -> bool {
        let Some(existing) = self.messages.iter_mut().find(|m| m.id == message.id) else {
            return false;
        };
        if existing.read_at == message.read_at {
            return false;
        }
        existing.read_at = message.read_at.clone();
        self.regroup();
        true
    }

    /// Marks every unread message addressed to `reader` as read at `at`.
    pub fn mark_read_locally(&mut self, reader: &UserId, at: &Timestamp) -> Vec<MessageId> {
        let mut updated = Vec::new();
        for message in self.messages.iter_mut() {
            if &message.recipient_id == reader && message.read_at.is_none() && !message.id.is_local()
            {
                message.read_at = Some(at.clone());
                updated.push(message.id.clone());
            }
        }
        if !updated.is_empty() {
            self.regroup();
        }
        updated
    }

    pub fn unread_from(&self, reader: &UserId) -> Vec<MessageId> {
        self.messages
            .iter()
            .filter(|m| &m.recipient_id == reader && m.read_at.is_none() && !m.id.is_local())
            .map(|m| m.id.clone())
            .collect()
    }

    /// Inserts after every message that does not sort later.
    fn insert_ordered(&mut self, message: Message) {
        let key = sort_key(&message);
        let index = self
            .messages
            .iter()
            .rposition(|existing| sort_key(existing) <= key)
            .map_or(0, |i| i + 1);
        self.messages.insert(index, message);
    }

    fn confirmed_ref(&self, client_ref: &str) -> bool {
        self.messages
            .iter()
            .any(|m| !m.id.is_local() && m.client_ref.as_deref() == Some(client_ref))
    }

    fn regroup(&mut self) {
        self.groups = group_messages(&self.messages, self.clock.local_now());
    }
}

/// Stable chronological sort; unparseable timestamps go last in their
/// original order.
fn sort_chronologically(messages: &mut [Message]) {
    messages.sort_by_key(sort_key);
}

fn sort_key(message: &Message) -> (bool, Option<DateTime<Utc>>) {
    let parsed = message.created_at.parse();
    (parsed.is_none(), parsed)
}

/// Buckets messages by calendar date in `now`'s offset, oldest date first,
/// keeping list order inside each bucket.
pub fn group_messages(messages: &[Message], now: DateTime<FixedOffset>) -> Vec<MessageGroup> {
    let offset = *now.offset();
    let today = now.date_naive();
    let mut dated: BTreeMap<NaiveDate, Vec<Message>> = BTreeMap::new();
    let mut unknown = Vec::new();

    for message in messages {
        match message.created_at.parse() {
            Some(at) => dated
                .entry(at.with_timezone(&offset).date_naive())
                .or_default()
                .push(message.clone()),
            None => unknown.push(message.clone()),
        }
    }

    let mut groups: Vec<MessageGroup> = dated
        .into_iter()
        .map(|(date, messages)| MessageGroup {
            label: date_label(date, today),
            date: Some(date),
            messages,
        })
        .collect();
    if !unknown.is_empty() {
        groups.push(MessageGroup {
            label: UNKNOWN_DATE_LABEL.to_string(),
            date: None,
            messages: unknown,
        });
    }
    groups
}

pub fn date_label(date: NaiveDate, today: NaiveDate) -> String {
    if date == today {
        "Today".to_string()
    } else if today
        .checked_sub_signed(ChronoDuration::days(1))
        .is_some_and(|yesterday| yesterday == date)
    {
        "Yesterday".to_string()
    } else {
        date.format("%A, %B %-d, %Y").to_string()
    }
}

#[cfg(test)]
#[path = "tests/message_store_tests.rs"]
mod tests;
