//! Realtime layer of the forum client: topic subscriptions, direct-message
//! threads, media uploads, voice notes and the notification feed.

pub mod backend;
pub mod clock;
pub mod config;
pub mod conversation;
pub mod error;
pub mod message_store;
pub mod notifications;
pub mod realtime;
pub mod rest;
pub mod session;
pub mod transport;
pub mod upload;
pub mod voice_recorder;

pub use backend::{
    CurrentUser, Filter, IdentityProvider, MissingObjectStorage, MissingRelationalStore,
    ObjectStorage, RelationalStore, SelectQuery, StaticIdentity, UploadOptions,
};
pub use clock::{Clock, FixedClock, SystemClock};
pub use config::{load_settings, load_settings_from, Settings};
pub use conversation::{Conversation, ConversationEvent};
pub use error::{RecorderError, StorageError, StoreError, SubscriptionError, UploadError};
pub use message_store::{group_messages, DeliveryState, MessageGroup, MessageStore};
pub use notifications::{FeedEvent, NotificationDispatcher, NotificationTopics};
pub use realtime::{
    ChannelEvent, ChannelHandler, ChannelSubscriptionManager, ConnectionState, ReconnectPolicy,
    SubscriptionHandle, TopicStatus,
};
pub use rest::{HttpObjectStorage, RestStore};
pub use session::{RealtimeSession, SessionDependencies};
pub use transport::{
    MissingRealtimeTransport, RealtimeTransport, TransportConnection, WebSocketTransport,
};
pub use upload::{
    BucketDescriptor, MediaBlob, PublicReference, RetryPolicy, UploadDestination, UploadPipeline,
    UploadStatus, UploadTask,
};
pub use voice_recorder::{
    RecorderConfig, RecorderEvent, RecorderSnapshot, RecorderState, VoiceRecorder,
};

#[cfg(test)]
#[path = "tests/support.rs"]
pub(crate) mod test_support;
