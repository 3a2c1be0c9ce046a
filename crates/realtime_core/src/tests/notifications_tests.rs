use super::*;

use std::sync::atomic::Ordering;

use serde_json::json;

use crate::{
    realtime::ReconnectPolicy,
    test_support::{eventually, fixed_clock, user, InMemoryStore, InMemoryTransport},
};

struct Rig {
    hub: InMemoryTransport,
    db: Arc<InMemoryStore>,
    manager: Arc<ChannelSubscriptionManager>,
    dispatcher: NotificationDispatcher,
}

fn rig_with(topics: NotificationTopics, limit: usize) -> Rig {
    let hub = InMemoryTransport::new();
    let db = Arc::new(InMemoryStore::new());
    db.seed(
        "profiles",
        [
            json!({ "id": "bob", "username": "bobby", "display_name": "Bob" }),
            json!({ "id": "carol", "username": "carol_c", "display_name": "  " }),
        ],
    );
    db.seed(
        "posts",
        [
            json!({ "id": "p1", "author_id": "me", "title": "Rust ownership explained" }),
            json!({ "id": 7, "user_id": "me", "title": "A post title that is definitely longer than forty characters" }),
            json!({ "id": "p2", "author_id": "carol", "title": "Not mine" }),
        ],
    );
    let manager = Arc::new(ChannelSubscriptionManager::new(
        Arc::new(hub.clone()),
        ReconnectPolicy::default(),
    ));
    let dispatcher = NotificationDispatcher::new(
        &user("me"),
        Arc::clone(&db) as Arc<dyn RelationalStore>,
        Arc::clone(&manager),
        fixed_clock(),
        topics,
        limit,
    );
    Rig {
        hub,
        db,
        manager,
        dispatcher,
    }
}

fn rig() -> Rig {
    rig_with(NotificationTopics::default(), 100)
}

impl Rig {
    fn topic(&self, family: &str) -> String {
        self.dispatcher.topic_name(family)
    }

    fn publish(&self, family: &str, event: ChangeEvent) {
        self.hub.publish(&self.topic(family), event);
    }

    async fn wait_for_feed(&self, len: usize) -> Vec<NotificationEvent> {
        assert!(
            eventually(|| async { self.dispatcher.feed().await.len() == len }).await,
            "feed never reached {len} entries"
        );
        self.dispatcher.feed().await
    }
}

fn message(id: &str, sender: &str) -> ChangeEvent {
    ChangeEvent::insert(
        "messages",
        json!({ "id": id, "sender_id": sender, "recipient_id": "me", "content": "hey" }),
    )
}

fn vote(id: &str, post_id: serde_json::Value, voter: &str, vote_type: &str) -> ChangeEvent {
    ChangeEvent::insert(
        "votes",
        json!({ "id": id, "post_id": post_id, "user_id": voter, "vote_type": vote_type }),
    )
}

fn view(id: &str, viewer: &str) -> ChangeEvent {
    ChangeEvent::insert(
        "profile_views",
        json!({ "id": id, "viewer_id": viewer, "profile_id": "me" }),
    )
}

#[tokio::test]
async fn start_opens_one_topic_per_enabled_family() {
    let rig = rig();

    let failures = rig.dispatcher.start().await;

    assert!(failures.is_empty());
    let mut topics = rig.manager.open_topics().await;
    topics.sort();
    assert_eq!(
        topics,
        vec![
            "notifications:me:likes",
            "notifications:me:messages",
            "notifications:me:profile_views",
        ]
    );
    assert_eq!(
        rig.hub.joined_filters("notifications:me:messages"),
        vec![EventFilter::table("messages", ChangeType::Insert)
            .with_predicate(Predicate::eq("recipient_id", "me"))]
    );

    // Starting twice does not double-subscribe.
    rig.dispatcher.start().await;
    assert_eq!(rig.hub.connects("notifications:me:likes"), 1);
}

#[tokio::test]
async fn message_and_like_land_newest_first_and_are_read_independently() {
    let rig = rig();
    rig.dispatcher.start().await;
    let mut feed_events = rig.dispatcher.subscribe();

    rig.publish("messages", message("m1", "bob"));
    rig.wait_for_feed(1).await;
    rig.publish("likes", vote("v1", json!("p1"), "bob", "up"));
    let feed = rig.wait_for_feed(2).await;

    assert_eq!(feed[0].kind, NotificationKind::Like);
    assert_eq!(feed[0].message, "Bob liked your post \"Rust ownership explained\"");
    assert_eq!(feed[1].kind, NotificationKind::NewMessage);
    assert_eq!(feed[1].message, "New message from Bob");
    assert_eq!(feed[1].sender.as_ref().map(|s| s.id.as_str()), Some("bob"));
    assert_eq!(feed[1].created_at.as_str(), "2024-05-15T12:00:00.000Z");
    assert_eq!(rig.dispatcher.unread_count().await, 2);

    assert!(rig.dispatcher.mark_as_read(&feed[1].id).await);
    assert_eq!(rig.dispatcher.unread_count().await, 1);
    let feed = rig.dispatcher.feed().await;
    assert!(!feed[0].is_read);
    assert!(feed[1].is_read);

    assert!(rig.dispatcher.mark_as_read(&feed[0].id).await);
    assert_eq!(rig.dispatcher.unread_count().await, 0);

    assert!(matches!(feed_events.recv().await, Ok(FeedEvent::Added(_))));
    assert!(matches!(feed_events.recv().await, Ok(FeedEvent::Added(_))));
    assert_eq!(
        feed_events.recv().await.expect("read event"),
        FeedEvent::ReadStateChanged { unread: 1 }
    );
}

#[tokio::test]
async fn only_upvotes_from_others_on_my_posts_count() {
    let rig = rig();
    rig.dispatcher.start().await;

    rig.publish("likes", vote("v1", json!("p1"), "me", "up"));
    rig.publish("likes", vote("v2", json!("p1"), "bob", "down"));
    rig.publish("likes", vote("v3", json!("p2"), "bob", "up"));
    rig.publish("likes", vote("v4", json!("missing"), "bob", "up"));
    rig.publish("likes", vote("v5", json!(7), "carol", "like"));

    let feed = rig.wait_for_feed(1).await;
    assert_eq!(
        feed[0].message,
        "carol_c liked your post \"A post title that is definitely longer t…\""
    );
}

#[tokio::test]
async fn repeated_rows_produce_one_notification() {
    let rig = rig();
    rig.dispatcher.start().await;

    for _ in 0..2 {
        rig.publish("profile_views", view("pv1", "bob"));
    }
    rig.publish("messages", message("m2", "bob"));

    let feed = rig.wait_for_feed(2).await;
    let views: Vec<_> = feed
        .iter()
        .filter(|n| n.kind == NotificationKind::ProfileView)
        .collect();
    assert_eq!(views.len(), 1);
    assert_eq!(views[0].message, "Bob viewed your profile");
}

#[tokio::test]
async fn unknown_actors_render_anonymously() {
    let rig = rig();
    rig.dispatcher.start().await;

    rig.publish("profile_views", view("pv2", "stranger"));

    let feed = rig.wait_for_feed(1).await;
    assert_eq!(feed[0].message, "Someone viewed your profile");
    assert_eq!(feed[0].sender.as_ref().map(|s| s.id.as_str()), Some("stranger"));
}

#[tokio::test]
async fn actor_profiles_are_cached() {
    let rig = rig();
    rig.dispatcher.start().await;

    rig.publish("messages", message("m1", "bob"));
    rig.wait_for_feed(1).await;
    let selects = rig.db.selects.load(Ordering::SeqCst);
    rig.publish("messages", message("m2", "bob"));
    rig.wait_for_feed(2).await;

    assert_eq!(
        rig.db.selects.load(Ordering::SeqCst),
        selects
    );
}

#[tokio::test]
async fn read_entries_never_become_unread() {
    let rig = rig();
    rig.dispatcher.start().await;
    rig.publish("messages", message("m1", "bob"));
    rig.publish("messages", message("m2", "carol"));
    let before = rig.wait_for_feed(2).await;

    assert_eq!(rig.dispatcher.mark_all_as_read().await, 2);
    assert_eq!(rig.dispatcher.mark_all_as_read().await, 0);
    assert!(!rig.dispatcher.mark_as_read(&before[0].id).await);

    rig.publish("messages", message("m3", "bob"));
    // Re-delivery of an old row must not resurrect it as unread.
    rig.publish("messages", message("m1", "bob"));
    let after = rig.wait_for_feed(3).await;

    assert!(!after[0].is_read);
    assert!(after[1..].iter().all(|n| n.is_read));
    assert_eq!(rig.dispatcher.unread_count().await, 1);
}

#[tokio::test]
async fn feed_is_capped_at_the_limit() {
    let rig = rig_with(NotificationTopics::default(), 2);
    rig.dispatcher.start().await;
    let mut feed_events = rig.dispatcher.subscribe();

    for (id, sender) in [("m1", "bob"), ("m2", "carol"), ("m3", "bob")] {
        rig.publish("messages", message(id, sender));
    }
    for _ in 0..3 {
        assert!(matches!(feed_events.recv().await, Ok(FeedEvent::Added(_))));
    }

    let feed = rig.dispatcher.feed().await;
    let senders: Vec<&str> = feed
        .iter()
        .filter_map(|n| n.sender.as_ref().map(|s| s.id.as_str()))
        .collect();
    assert_eq!(senders, vec!["bob", "carol"]);
    assert_eq!(feed[0].message, "New message from Bob");
}

#[tokio::test]
async fn follows_are_opt_in() {
    let rig = rig_with(
        NotificationTopics {
            follows: true,
            ..NotificationTopics::default()
        },
        100,
    );
    rig.dispatcher.start().await;

    rig.publish(
        "follows",
        ChangeEvent::insert(
            "followers",
            json!({ "id": "f1", "follower_id": "bob", "following_id": "me" }),
        ),
    );

    let feed = rig.wait_for_feed(1).await;
    assert_eq!(feed[0].kind, NotificationKind::Generic);
    assert_eq!(feed[0].message, "Bob started following you");
}

#[tokio::test]
async fn a_failing_family_does_not_block_the_others() {
    let rig = rig();
    rig.hub.refuse_next("notifications:me:likes", 1);

    let failures = rig.dispatcher.start().await;

    assert_eq!(failures.len(), 1);
    assert!(matches!(
        &failures[0],
        SubscriptionError::ConnectFailed { topic, .. } if topic == "notifications:me:likes"
    ));
    rig.publish("messages", message("m1", "bob"));
    rig.wait_for_feed(1).await;
}

#[tokio::test]
async fn stop_releases_every_topic() {
    let rig = rig();
    rig.dispatcher.start().await;

    rig.dispatcher.stop().await;

    assert!(rig.manager.open_topics().await.is_empty());
    for family in ["likes", "profile_views", "messages"] {
        let topic = rig.topic(family);
        assert!(eventually(|| async { rig.hub.live(&topic) == 0 }).await);
    }
}

#[tokio::test]
async fn evicted_rows_can_notify_again() {
    let rig = rig_with(NotificationTopics::default(), 1);
    rig.dispatcher.start().await;
    let mut feed_events = rig.dispatcher.subscribe();

    rig.publish("messages", message("m1", "bob"));
    assert!(matches!(feed_events.recv().await, Ok(FeedEvent::Added(_))));
    rig.publish("messages", message("m2", "carol"));
    assert!(matches!(feed_events.recv().await, Ok(FeedEvent::Added(_))));
    rig.publish("messages", message("m1", "bob"));
    assert!(matches!(feed_events.recv().await, Ok(FeedEvent::Added(_))));

    let feed = rig.dispatcher.feed().await;
    assert_eq!(feed.len(), 1);
    assert_eq!(feed[0].message, "New message from Bob");
    assert_eq!(rig.dispatcher.shared.feed.lock().await.seen.len(), 1);
}

#[test]
fn feed_forgets_the_sources_of_evicted_entries() {
    let entry = |arrival: u64, id: &str| FeedEntry {
        arrival,
        source: Some((NotificationKind::NewMessage, id.to_string())),
        event: NotificationEvent {
            id: NotificationId::new(id),
            user_id: UserId::new("me"),
            kind: NotificationKind::NewMessage,
            message: format!("message {id}"),
            created_at: Timestamp::default(),
            is_read: false,
            sender: None,
        },
    };
    let mut feed = Feed::default();

    for (arrival, id) in ["a", "b", "c", "d"].into_iter().enumerate() {
        assert!(feed.insert(entry(arrival as u64, id), 2));
    }
    assert_eq!(feed.seen.len(), 2);
    assert!(!feed.insert(entry(9, "d"), 2));

    // An arrival older than everything kept is trimmed straight away.
    assert!(!feed.insert(entry(0, "z"), 2));
    assert_eq!(feed.seen.len(), 2);

    assert!(feed.insert(entry(10, "a"), 2));
    let order: Vec<&str> = feed.entries.iter().map(|e| e.event.id.as_str()).collect();
    assert_eq!(order, vec!["a", "d"]);
}

#[tokio::test]
async fn slow_lookups_keep_arrival_order() {
    let rig = rig();
    rig.dispatcher.start().await;
    rig.db.hold_selects("posts");
    let selects = rig.db.selects.load(Ordering::SeqCst);

    rig.publish("likes", vote("v1", json!("p1"), "bob", "up"));
    assert!(eventually(|| async { rig.db.selects.load(Ordering::SeqCst) > selects }).await);
    rig.publish("messages", message("m1", "carol"));
    rig.wait_for_feed(1).await;

    rig.db.release_selects("posts");
    let feed = rig.wait_for_feed(2).await;

    assert_eq!(feed[0].kind, NotificationKind::NewMessage);
    assert_eq!(feed[1].kind, NotificationKind::Like);
}
