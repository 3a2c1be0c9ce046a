use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;

use crate::domain::{
    ChangeType, ConversationKey, MediaKind, MessageId, NotificationId, NotificationKind,
    Timestamp, UserId,
};

/// Row of the `messages` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub sender_id: UserId,
    pub recipient_id: UserId,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub created_at: Timestamp,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<MediaKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read_at: Option<Timestamp>,
    /// Client-generated correlation id attached to optimistic sends.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_ref: Option<String>,
}

impl Message {
    pub fn conversation_key(&self) -> ConversationKey {
        ConversationKey::new(self.sender_id.clone(), self.recipient_id.clone())
    }

    pub fn is_read(&self) -> bool {
        self.read_at.is_some()
    }
}

/// Insert payload for a new direct message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewMessage {
    pub sender_id: UserId,
    pub recipient_id: UserId,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<MediaKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_ref: Option<String>,
}

impl NewMessage {
    pub fn text(sender_id: UserId, recipient_id: UserId, content: impl Into<String>) -> Self {
        Self {
            sender_id,
            recipient_id,
            content: content.into(),
            media_url: None,
            media_type: None,
            file_name: None,
            client_ref: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActorRef {
    pub id: UserId,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
}

impl ActorRef {
    pub fn anonymous(id: UserId) -> Self {
        Self {
            id,
            name: "Someone".to_string(),
            avatar: None,
        }
    }
}

/// Subset of the `profiles` row used to render actors.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfileSummary {
    pub id: UserId,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub avatar_url: Option<String>,
}

impl ProfileSummary {
    pub fn into_actor(self) -> ActorRef {
        let name = self
            .display_name
            .filter(|name| !name.trim().is_empty())
            .or(self.username)
            .unwrap_or_else(|| "Someone".to_string());
        ActorRef {
            id: self.id,
            name,
            avatar: self.avatar_url,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationEvent {
    pub id: NotificationId,
    pub user_id: UserId,
    pub kind: NotificationKind,
    pub message: String,
    pub created_at: Timestamp,
    pub is_read: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<ActorRef>,
}

/// Equality predicate evaluated against the changed record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Predicate {
    pub column: String,
    pub value: String,
}

impl Predicate {
    pub fn eq(column: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            value: value.into(),
        }
    }

    /// Server-side filter expression, e.g. `recipient_id=eq.42`.
    pub fn to_wire(&self) -> String {
        format!("{}=eq.{}", self.column, self.value)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventFilter {
    pub entity: String,
    pub change_type: ChangeType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub predicate: Option<Predicate>,
}

impl EventFilter {
    pub fn table(entity: impl Into<String>, change_type: ChangeType) -> Self {
        Self {
            entity: entity.into(),
            change_type,
            predicate: None,
        }
    }

    pub fn broadcast(event: impl Into<String>) -> Self {
        Self {
            entity: event.into(),
            change_type: ChangeType::Broadcast,
            predicate: None,
        }
    }

    pub fn with_predicate(mut self, predicate: Predicate) -> Self {
        self.predicate = Some(predicate);
        self
    }

    pub fn is_broadcast(&self) -> bool {
        self.change_type == ChangeType::Broadcast
    }

    pub fn matches(&self, event: &ChangeEvent) -> bool {
        if self.entity != event.entity || !self.change_type.accepts(event.change_type) {
            return false;
        }
        match &self.predicate {
            None => true,
            Some(predicate) => {
                event.field_str(&predicate.column).as_deref() == Some(predicate.value.as_str())
            }
        }
    }
}

/// One change delivered on a topic: a table insert/update/delete, or a raw
/// broadcast (entity = broadcast event name, record = payload).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub entity: String,
    pub change_type: ChangeType,
    #[serde(default)]
    pub record: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_record: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit_timestamp: Option<String>,
}

impl ChangeEvent {
    pub fn insert(entity: impl Into<String>, record: Value) -> Self {
        Self {
            entity: entity.into(),
            change_type: ChangeType::Insert,
            record,
            old_record: None,
            commit_timestamp: None,
        }
    }

    pub fn update(entity: impl Into<String>, record: Value) -> Self {
        Self {
            change_type: ChangeType::Update,
            ..Self::insert(entity, record)
        }
    }

    pub fn broadcast(event: impl Into<String>, payload: Value) -> Self {
        Self {
            change_type: ChangeType::Broadcast,
            ..Self::insert(event, payload)
        }
    }

    /// Reads a record column as text; numbers and booleans are stringified.
    pub fn field_str(&self, column: &str) -> Option<String> {
        match self.record.get(column)? {
            Value::String(value) => Some(value.clone()),
            Value::Number(value) => Some(value.to_string()),
            Value::Bool(value) => Some(value.to_string()),
            _ => None,
        }
    }

    pub fn record_id(&self) -> Option<String> {
        self.field_str("id")
    }

    pub fn decode<T: DeserializeOwned>(&self) -> serde_json::Result<T> {
        serde_json::from_value(self.record.clone())
    }
}

/// Frame of the Phoenix-channel realtime protocol.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhoenixFrame {
    pub topic: String,
    pub event: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(rename = "ref", default, skip_serializing_if = "Option::is_none")]
    pub reference: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub join_ref: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostgresChangesPayload {
    pub data: PostgresChangeData,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostgresChangeData {
    #[serde(rename = "type")]
    pub change_type: ChangeType,
    pub table: String,
    #[serde(default)]
    pub schema: Option<String>,
    #[serde(default)]
    pub record: Value,
    #[serde(default)]
    pub old_record: Option<Value>,
    #[serde(default)]
    pub commit_timestamp: Option<String>,
}

impl From<PostgresChangeData> for ChangeEvent {
    fn from(value: PostgresChangeData) -> Self {
        Self {
            entity: value.table,
            change_type: value.change_type,
            record: value.record,
            old_record: value.old_record,
            commit_timestamp: value.commit_timestamp,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BroadcastPayload {
    pub event: String,
    #[serde(default)]
    pub payload: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplyPayload {
    pub status: String,
    #[serde(default)]
    pub response: Value,
}

#[cfg(test)]
#[path = "tests/protocol_tests.rs"]
mod tests;
