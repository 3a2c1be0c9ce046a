use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use async_trait::async_trait;
use serde::Deserialize;
use shared::{
    domain::{ChangeType, NotificationId, NotificationKind, Timestamp, UserId},
    protocol::{ActorRef, ChangeEvent, EventFilter, NotificationEvent, Predicate, ProfileSummary},
};
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, warn};

use crate::{
    backend::{CurrentUser, Filter, RelationalStore, SelectQuery},
    clock::Clock,
    error::SubscriptionError,
    realtime::{ChannelEvent, ChannelHandler, ChannelSubscriptionManager, SubscriptionHandle},
};

const POST_TITLE_PREVIEW_CHARS: usize = 40;

/// Which topic families the dispatcher listens to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NotificationTopics {
    pub likes: bool,
    pub profile_views: bool,
    pub messages: bool,
    pub follows: bool,
}

impl Default for NotificationTopics {
    fn default() -> Self {
        Self {
            likes: true,
            profile_views: true,
            messages: true,
            follows: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Family {
    Likes,
    ProfileViews,
    Messages,
    Follows,
}

impl Family {
    fn name(self) -> &'static str {
        match self {
            Family::Likes => "likes",
            Family::ProfileViews => "profile_views",
            Family::Messages => "messages",
            Family::Follows => "follows",
        }
    }

    fn filters(self, me: &UserId) -> Vec<EventFilter> {
        match self {
            // The liked post's author is not on the vote row, so every upvote
            // is received and filtered client-side.
            Family::Likes => vec![EventFilter::table("votes", ChangeType::Insert)],
            Family::ProfileViews => vec![EventFilter::table("profile_views", ChangeType::Insert)
                .with_predicate(Predicate::eq("profile_id", me.as_str()))],
            Family::Messages => vec![EventFilter::table("messages", ChangeType::Insert)
                .with_predicate(Predicate::eq("recipient_id", me.as_str()))],
            Family::Follows => vec![EventFilter::table("followers", ChangeType::Insert)
                .with_predicate(Predicate::eq("following_id", me.as_str()))],
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum FeedEvent {
    Added(NotificationEvent),
    ReadStateChanged { unread: usize },
}

#[derive(Debug, Deserialize)]
struct VoteRow {
    #[serde(default)]
    post_id: Option<serde_json::Value>,
    user_id: UserId,
    #[serde(default)]
    vote_type: Option<String>,
    #[serde(default)]
    value: Option<i64>,
}

impl VoteRow {
    fn is_upvote(&self) -> bool {
        match (&self.vote_type, self.value) {
            (Some(kind), _) => matches!(kind.as_str(), "up" | "upvote" | "like"),
            (None, Some(value)) => value > 0,
            (None, None) => false,
        }
    }
}

#[derive(Debug, Deserialize)]
struct PostRow {
    #[serde(alias = "user_id")]
    author_id: UserId,
    #[serde(default)]
    title: Option<String>,
}

/// A change event recognised as a notification, before the actor is known.
struct Candidate {
    kind: NotificationKind,
    actor_id: UserId,
    source_key: Option<String>,
    detail: Option<String>,
}

impl Candidate {
    fn render(&self, actor: &str) -> String {
        match (self.kind, &self.detail) {
            (NotificationKind::Like, Some(title)) => {
                format!("{actor} liked your post \"{title}\"")
            }
            (NotificationKind::Like, None) => format!("{actor} liked your post"),
            (NotificationKind::ProfileView, _) => format!("{actor} viewed your profile"),
            (NotificationKind::NewMessage, _) => format!("New message from {actor}"),
            (NotificationKind::Generic, _) => format!("{actor} started following you"),
        }
    }
}

type SourceKey = (NotificationKind, String);

struct FeedEntry {
    /// Order in which the originating change reached the dispatcher.
    arrival: u64,
    source: Option<SourceKey>,
    event: NotificationEvent,
}

/// Entries ordered by descending arrival. `seen` only holds the sources of
/// entries still in the feed.
#[derive(Default)]
struct Feed {
    entries: VecDeque<FeedEntry>,
    seen: HashSet<SourceKey>,
}

impl Feed {
    fn unread(&self) -> usize {
        self.entries.iter().filter(|entry| !entry.event.is_read).count()
    }

    fn contains_source(&self, source: &SourceKey) -> bool {
        self.seen.contains(source)
    }

    /// Places `entry` by arrival and trims the oldest entries beyond `limit`.
    /// Returns false when the source is already present or the entry is
    /// itself trimmed.
    fn insert(&mut self, entry: FeedEntry, limit: usize) -> bool {
        if let Some(source) = &entry.source {
            if !self.seen.insert(source.clone()) {
                return false;
            }
        }
        let arrival = entry.arrival;
        let index = self
            .entries
            .iter()
            .position(|existing| existing.arrival < arrival)
            .unwrap_or(self.entries.len());
        self.entries.insert(index, entry);

        let mut kept = true;
        while self.entries.len() > limit {
            let Some(evicted) = self.entries.pop_back() else {
                break;
            };
            kept &= evicted.arrival != arrival;
            if let Some(source) = evicted.source {
                self.seen.remove(&source);
            }
        }
        kept
    }
}

struct DispatcherShared {
    me: UserId,
    db: Arc<dyn RelationalStore>,
    clock: Arc<dyn Clock>,
    limit: usize,
    arrivals: AtomicU64,
    feed: Mutex<Feed>,
    directory: Mutex<HashMap<UserId, ActorRef>>,
    events: broadcast::Sender<FeedEvent>,
}

impl DispatcherShared {
    async fn ingest(&self, family: Family, change: &ChangeEvent) {
        // Taken before any lookup so slow lookups cannot reorder the feed.
        let arrival = self.arrivals.fetch_add(1, Ordering::SeqCst);
        let Some(candidate) = self.interpret(family, change).await else {
            return;
        };
        let source = candidate
            .source_key
            .clone()
            .map(|key| (candidate.kind, key));
        if let Some(source) = &source {
            if self.feed.lock().await.contains_source(source) {
                debug!(family = family.name(), source = %source.1, "notifications: duplicate ignored");
                return;
            }
        }

        let actor = self.resolve_actor(&candidate.actor_id).await;
        let event = NotificationEvent {
            id: NotificationId::generate(),
            user_id: self.me.clone(),
            kind: candidate.kind,
            message: candidate.render(&actor.name),
            created_at: Timestamp::from(self.clock.now()),
            is_read: false,
            sender: Some(actor),
        };

        let kept = self.feed.lock().await.insert(
            FeedEntry {
                arrival,
                source,
                event: event.clone(),
            },
            self.limit,
        );
        if !kept {
            debug!(family = family.name(), "notifications: entry not kept");
            return;
        }
        info!(family = family.name(), kind = ?event.kind, "notifications: new notification");
        let _ = self.events.send(FeedEvent::Added(event));
    }

    async fn interpret(&self, family: Family, change: &ChangeEvent) -> Option<Candidate> {
        if change.change_type != ChangeType::Insert {
            return None;
        }
        let source_key = change.record_id();
        let candidate = match family {
            Family::Likes => {
                let vote: VoteRow = self.decode(family, change)?;
                if !vote.is_upvote() || vote.user_id == self.me {
                    return None;
                }
                let post = self.lookup_post(vote.post_id.as_ref()?).await?;
                if post.author_id != self.me {
                    return None;
                }
                Candidate {
                    kind: NotificationKind::Like,
                    actor_id: vote.user_id,
                    source_key,
                    detail: post.title.map(|title| preview(&title)),
                }
            }
            Family::ProfileViews => {
                let viewer = UserId::new(change.field_str("viewer_id")?);
                if viewer == self.me || change.field_str("profile_id")? != self.me.as_str() {
                    return None;
                }
                Candidate {
                    kind: NotificationKind::ProfileView,
                    actor_id: viewer,
                    source_key,
                    detail: None,
                }
            }
            Family::Messages => {
                let sender = UserId::new(change.field_str("sender_id")?);
                if sender == self.me || change.field_str("recipient_id")? != self.me.as_str() {
                    return None;
                }
                Candidate {
                    kind: NotificationKind::NewMessage,
                    actor_id: sender,
                    source_key,
                    detail: None,
                }
            }
            Family::Follows => {
                let follower = UserId::new(change.field_str("follower_id")?);
                if follower == self.me || change.field_str("following_id")? != self.me.as_str() {
                    return None;
                }
                Candidate {
                    kind: NotificationKind::Generic,
                    actor_id: follower,
                    source_key,
                    detail: None,
                }
            }
        };
        Some(candidate)
    }

    fn decode<T: serde::de::DeserializeOwned>(&self, family: Family, change: &ChangeEvent) -> Option<T> {
        match change.decode::<T>() {
            Ok(row) => Some(row),
            Err(err) => {
                warn!(family = family.name(), "notifications: malformed {} row: {err}", change.entity);
                None
            }
        }
    }

    async fn lookup_post(&self, post_id: &serde_json::Value) -> Option<PostRow> {
        let post_id = match post_id {
            serde_json::Value::String(id) => id.clone(),
            other => other.to_string(),
        };
        // Author column naming varies between schemas; both are accepted.
        let query = SelectQuery::from("posts")
            .filter(Filter::eq("id", &post_id))
            .limit(1);
        match self.db.select(&query).await {
            Ok(rows) => rows
                .into_iter()
                .next()
                .and_then(|row| serde_json::from_value(row).ok()),
            Err(err) => {
                warn!(post_id = %post_id, "notifications: post lookup failed: {err:#}");
                None
            }
        }
    }

    async fn resolve_actor(&self, id: &UserId) -> ActorRef {
        if let Some(actor) = self.directory.lock().await.get(id) {
            return actor.clone();
        }
        let query = SelectQuery::from("profiles")
            .columns("id,username,display_name,avatar_url")
            .filter(Filter::eq("id", id))
            .limit(1);
        let found = match self.db.select(&query).await {
            Ok(rows) => rows
                .into_iter()
                .next()
                .and_then(|row| serde_json::from_value::<ProfileSummary>(row).ok()),
            Err(err) => {
                warn!(actor = %id, "notifications: profile lookup failed: {err:#}");
                None
            }
        };
        match found {
            Some(profile) => {
                let actor = profile.into_actor();
                self.directory
                    .lock()
                    .await
                    .insert(id.clone(), actor.clone());
                actor
            }
            None => ActorRef::anonymous(id.clone()),
        }
    }
}

fn preview(title: &str) -> String {
    let mut chars = title.chars();
    let head: String = chars.by_ref().take(POST_TITLE_PREVIEW_CHARS).collect();
    if chars.next().is_some() {
        format!("{head}…")
    } else {
        head
    }
}

struct FamilyHandler {
    family: Family,
    shared: Arc<DispatcherShared>,
}

#[async_trait]
impl ChannelHandler for FamilyHandler {
    async fn handle(&self, event: &ChannelEvent) {
        match event {
            ChannelEvent::Change(change) => self.shared.ingest(self.family, change).await,
            ChannelEvent::Reconnected { topic } => {
                debug!(topic = %topic, "notifications: topic re-established");
            }
        }
    }
}

/// Turns realtime changes addressed to the current user into an in-memory,
/// newest-first notification feed.
pub struct NotificationDispatcher {
    shared: Arc<DispatcherShared>,
    manager: Arc<ChannelSubscriptionManager>,
    topics: NotificationTopics,
    handles: Mutex<Vec<SubscriptionHandle>>,
}

impl NotificationDispatcher {
    pub fn new(
        user: &CurrentUser,
        db: Arc<dyn RelationalStore>,
        manager: Arc<ChannelSubscriptionManager>,
        clock: Arc<dyn Clock>,
        topics: NotificationTopics,
        limit: usize,
    ) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            shared: Arc::new(DispatcherShared {
                me: user.id.clone(),
                db,
                clock,
                limit: limit.max(1),
                arrivals: AtomicU64::new(0),
                feed: Mutex::new(Feed::default()),
                directory: Mutex::new(HashMap::new()),
                events,
            }),
            manager,
            topics,
            handles: Mutex::new(Vec::new()),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<FeedEvent> {
        self.shared.events.subscribe()
    }

    pub fn topic_name(&self, family_name: &str) -> String {
        format!("notifications:{}:{family_name}", self.shared.me)
    }

    /// Opens every enabled topic family. A family that fails to open is
    /// reported and skipped; the others stay live.
    pub async fn start(&self) -> Vec<SubscriptionError> {
        let mut failures = Vec::new();
        let mut handles = self.handles.lock().await;
        if !handles.is_empty() {
            return failures;
        }
        let families = [
            (Family::Likes, self.topics.likes),
            (Family::ProfileViews, self.topics.profile_views),
            (Family::Messages, self.topics.messages),
            (Family::Follows, self.topics.follows),
        ];
        for (family, enabled) in families {
            if !enabled {
                continue;
            }
            let handler = Arc::new(FamilyHandler {
                family,
                shared: Arc::clone(&self.shared),
            });
            match self
                .manager
                .subscribe(
                    &self.topic_name(family.name()),
                    family.filters(&self.shared.me),
                    handler,
                )
                .await
            {
                Ok(handle) => handles.push(handle),
                Err(err) => {
                    warn!(family = family.name(), "notifications: {err}");
                    failures.push(err);
                }
            }
        }
        info!(topics = handles.len(), "notifications: dispatcher started");
        failures
    }

    pub async fn stop(&self) {
        let handles: Vec<SubscriptionHandle> = self.handles.lock().await.drain(..).collect();
        for handle in &handles {
            self.manager.unsubscribe(handle).await;
        }
        if !handles.is_empty() {
            info!("notifications: dispatcher stopped");
        }
    }

    pub async fn feed(&self) -> Vec<NotificationEvent> {
        self.shared
            .feed
            .lock()
            .await
            .entries
            .iter()
            .map(|entry| entry.event.clone())
            .collect()
    }

    pub async fn unread_count(&self) -> usize {
        self.shared.feed.lock().await.unread()
    }

    /// Returns false when no unread entry has `id`.
    pub async fn mark_as_read(&self, id: &NotificationId) -> bool {
        let unread = {
            let mut feed = self.shared.feed.lock().await;
            let Some(entry) = feed
                .entries
                .iter_mut()
                .map(|entry| &mut entry.event)
                .find(|event| &event.id == id && !event.is_read)
            else {
                return false;
            };
            entry.is_read = true;
            feed.unread()
        };
        let _ = self.shared.events.send(FeedEvent::ReadStateChanged { unread });
        true
    }

    /// Returns how many entries changed.
    pub async fn mark_all_as_read(&self) -> usize {
        let changed = {
            let mut feed = self.shared.feed.lock().await;
            let mut changed = 0;
            for event in feed
                .entries
                .iter_mut()
                .map(|entry| &mut entry.event)
                .filter(|event| !event.is_read)
            {
                event.is_read = true;
                changed += 1;
            }
            changed
        };
        if changed > 0 {
            let _ = self
                .shared
                .events
                .send(FeedEvent::ReadStateChanged { unread: 0 });
        }
        changed
    }
}

#[cfg(test)]
#[path = "tests/notifications_tests.rs"]
mod tests;
