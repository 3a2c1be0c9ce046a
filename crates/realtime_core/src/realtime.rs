//! Topic-multiplexed realtime subscriptions.
//!
//! One backend connection is held per topic no matter how many subscribers
//! share it. A pump task per topic reads events and awaits each interested
//! handler in registration order, so delivery within a topic is sequential.
//! Dropped connections are re-established with exponential backoff; once the
//! policy is exhausted the topic is reported as failed on the status feed.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use shared::protocol::{ChangeEvent, EventFilter};
use tokio::{
    sync::{broadcast, mpsc, oneshot, watch, Mutex, RwLock},
    task::JoinHandle,
};
use tracing::{debug, error, info, warn};

use crate::{
    error::SubscriptionError,
    transport::{RealtimeTransport, TransportConnection},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Open,
    Closed,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    Change(ChangeEvent),
    /// The topic was re-established after a drop; events may have been missed.
    Reconnected { topic: String },
}

#[derive(Debug, Clone, PartialEq)]
pub enum TopicStatus {
    State {
        topic: String,
        state: ConnectionState,
    },
    ReconnectFailed {
        topic: String,
        attempts: u32,
        reason: String,
    },
}

#[async_trait]
pub trait ChannelHandler: Send + Sync {
    async fn handle(&self, event: &ChannelEvent);
}

#[async_trait]
impl ChannelHandler for mpsc::UnboundedSender<ChannelEvent> {
    async fn handle(&self, event: &ChannelEvent) {
        let _ = self.send(event.clone());
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle {
    id: u64,
    topic: String,
}

impl SubscriptionHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            max_attempts: 10,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before the given 1-based attempt.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.initial_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay)
    }
}

struct Subscriber {
    id: u64,
    filters: Vec<EventFilter>,
    handler: Arc<dyn ChannelHandler>,
}

impl Subscriber {
    fn wants(&self, event: &ChannelEvent) -> bool {
        match event {
            ChannelEvent::Change(change) => {
                self.filters.is_empty() || self.filters.iter().any(|f| f.matches(change))
            }
            ChannelEvent::Reconnected { .. } => true,
        }
    }
}

type Subscribers = Arc<RwLock<Vec<Subscriber>>>;

struct TopicEntry {
    subscribers: Subscribers,
    joined_filters: Vec<EventFilter>,
    state: watch::Receiver<ConnectionState>,
    shutdown: Option<oneshot::Sender<()>>,
    pump: JoinHandle<()>,
}

impl TopicEntry {
    fn stop_pump(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
    }
}

pub struct ChannelSubscriptionManager {
    transport: Arc<dyn RealtimeTransport>,
    policy: ReconnectPolicy,
    topics: Mutex<HashMap<String, TopicEntry>>,
    /// Per-topic serialization of subscribes.
    gates: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    next_id: AtomicU64,
    status: broadcast::Sender<TopicStatus>,
}

impl ChannelSubscriptionManager {
    pub fn new(transport: Arc<dyn RealtimeTransport>, policy: ReconnectPolicy) -> Self {
        let (status, _) = broadcast::channel(256);
        Self {
            transport,
            policy,
            topics: Mutex::new(HashMap::new()),
            gates: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            status,
        }
    }

    pub fn subscribe_status(&self) -> broadcast::Receiver<TopicStatus> {
        self.status.subscribe()
    }

    /// Registers a handler for `filters` on `topic`, opening the topic if it
    /// is not open yet. Resolves once the connection is established.
    ///
    /// Subscribes to the same topic are serialized; the manager itself is
    /// never locked while a connection is being opened.
    pub async fn subscribe(
        &self,
        topic: &str,
        filters: Vec<EventFilter>,
        handler: Arc<dyn ChannelHandler>,
    ) -> Result<SubscriptionHandle, SubscriptionError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let subscriber = Subscriber {
            id,
            filters: filters.clone(),
            handler,
        };

        let gate = {
            let mut gates = self.gates.lock().await;
            Arc::clone(gates.entry(topic.to_string()).or_default())
        };
        let guard = gate.lock().await;
        let result = self.attach(topic, filters, subscriber).await;
        drop(guard);

        let mut gates = self.gates.lock().await;
        // Only the map and this call still hold the gate.
        if Arc::strong_count(&gate) == 2 {
            gates.remove(topic);
        }
        result.map(|()| SubscriptionHandle {
            id,
            topic: topic.to_string(),
        })
    }

    async fn attach(
        &self,
        topic: &str,
        filters: Vec<EventFilter>,
        subscriber: Subscriber,
    ) -> Result<(), SubscriptionError> {
        let id = subscriber.id;
        let joined = {
            let mut topics = self.topics.lock().await;
            match topics.get_mut(topic) {
                Some(entry) => {
                    let widened = union_filters(&entry.joined_filters, &filters);
                    let dead = *entry.state.borrow() == ConnectionState::Closed;
                    if !dead && widened.len() == entry.joined_filters.len() {
                        entry.subscribers.write().await.push(subscriber);
                        debug!(topic, subscription = id, "realtime: added subscriber to open topic");
                        return Ok(());
                    }
                    info!(topic, dead, filters = widened.len(), "realtime: rejoining topic");
                    widened
                }
                None => union_filters(&[], &filters),
            }
        };

        let connection = self.open(topic, &joined).await?;

        let mut topics = self.topics.lock().await;
        match topics.get_mut(topic) {
            Some(entry) => {
                entry.stop_pump();
                let (state, shutdown, pump) =
                    self.spawn_pump(topic, connection, &joined, Arc::clone(&entry.subscribers));
                entry.state = state;
                entry.shutdown = Some(shutdown);
                entry.pump = pump;
                entry.joined_filters = joined;
                entry.subscribers.write().await.push(subscriber);
                debug!(topic, subscription = id, "realtime: added subscriber to rejoined topic");
            }
            None => {
                let subscribers: Subscribers = Arc::new(RwLock::new(vec![subscriber]));
                let (state, shutdown, pump) =
                    self.spawn_pump(topic, connection, &joined, Arc::clone(&subscribers));
                topics.insert(
                    topic.to_string(),
                    TopicEntry {
                        subscribers,
                        joined_filters: joined,
                        state,
                        shutdown: Some(shutdown),
                        pump,
                    },
                );
                info!(topic, subscription = id, "realtime: opened topic");
            }
        }
        Ok(())
    }

    /// Removes one subscriber. The topic connection is closed with the last
    /// one. Unknown or already-removed handles are ignored.
    pub async fn unsubscribe(&self, handle: &SubscriptionHandle) {
        let mut topics = self.topics.lock().await;
        let Some(entry) = topics.get_mut(&handle.topic) else {
            return;
        };
        let remaining = {
            let mut subscribers = entry.subscribers.write().await;
            subscribers.retain(|subscriber| subscriber.id != handle.id);
            subscribers.len()
        };
        if remaining == 0 {
            if let Some(mut entry) = topics.remove(&handle.topic) {
                entry.stop_pump();
                info!(topic = %handle.topic, "realtime: closing topic");
            }
        }
    }

    pub async fn topic_state(&self, topic: &str) -> Option<ConnectionState> {
        let topics = self.topics.lock().await;
        topics.get(topic).map(|entry| *entry.state.borrow())
    }

    pub async fn subscriber_count(&self, topic: &str) -> usize {
        let subscribers = {
            let topics = self.topics.lock().await;
            match topics.get(topic) {
                Some(entry) => Arc::clone(&entry.subscribers),
                None => return 0,
            }
        };
        let count = subscribers.read().await.len();
        count
    }

    pub async fn open_topics(&self) -> Vec<String> {
        let topics = self.topics.lock().await;
        topics.keys().cloned().collect()
    }

    /// Closes every topic and forgets every subscriber.
    pub async fn shutdown(&self) {
        let drained: Vec<(String, TopicEntry)> = self.topics.lock().await.drain().collect();
        for (topic, mut entry) in drained {
            entry.stop_pump();
            if let Err(err) = entry.pump.await {
                if !err.is_cancelled() {
                    warn!(topic, "realtime: pump task ended abnormally: {err}");
                }
            }
        }
    }

    async fn open(
        &self,
        topic: &str,
        filters: &[EventFilter],
    ) -> Result<Box<dyn TransportConnection>, SubscriptionError> {
        let _ = self.status.send(TopicStatus::State {
            topic: topic.to_string(),
            state: ConnectionState::Connecting,
        });
        match self.transport.connect(topic, filters).await {
            Ok(connection) => Ok(connection),
            Err(source) => {
                error!(topic, "realtime: failed to open topic: {source:#}");
                let _ = self.status.send(TopicStatus::State {
                    topic: topic.to_string(),
                    state: ConnectionState::Closed,
                });
                Err(SubscriptionError::ConnectFailed {
                    topic: topic.to_string(),
                    source,
                })
            }
        }
    }

    fn spawn_pump(
        &self,
        topic: &str,
        connection: Box<dyn TransportConnection>,
        filters: &[EventFilter],
        subscribers: Subscribers,
    ) -> (
        watch::Receiver<ConnectionState>,
        oneshot::Sender<()>,
        JoinHandle<()>,
    ) {
        let (state_tx, state_rx) = watch::channel(ConnectionState::Open);
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let _ = self.status.send(TopicStatus::State {
            topic: topic.to_string(),
            state: ConnectionState::Open,
        });
        let pump = Pump {
            topic: topic.to_string(),
            filters: filters.to_vec(),
            subscribers,
            transport: Arc::clone(&self.transport),
            policy: self.policy.clone(),
            state: state_tx,
            status: self.status.clone(),
        };
        let handle = tokio::spawn(pump.run(connection, shutdown_rx));
        (state_rx, shutdown_tx, handle)
    }
}

/// Filters in `existing` followed by any in `added` not already present.
fn union_filters(existing: &[EventFilter], added: &[EventFilter]) -> Vec<EventFilter> {
    let mut merged = existing.to_vec();
    for filter in added {
        if !merged.contains(filter) {
            merged.push(filter.clone());
        }
    }
    merged
}

enum Reconnect {
    Connected(Box<dyn TransportConnection>),
    Exhausted { attempts: u32, reason: String },
    ShutDown,
}

struct Pump {
    topic: String,
    filters: Vec<EventFilter>,
    subscribers: Subscribers,
    transport: Arc<dyn RealtimeTransport>,
    policy: ReconnectPolicy,
    state: watch::Sender<ConnectionState>,
    status: broadcast::Sender<TopicStatus>,
}

impl Pump {
    async fn run(
        self,
        mut connection: Box<dyn TransportConnection>,
        mut shutdown: oneshot::Receiver<()>,
    ) {
        loop {
            let next = tokio::select! {
                _ = &mut shutdown => {
                    connection.close().await;
                    self.set_state(ConnectionState::Closed);
                    return;
                }
                next = connection.next_event() => next,
            };

            let reason = match next {
                Ok(Some(event)) => {
                    self.dispatch(&ChannelEvent::Change(event)).await;
                    continue;
                }
                Ok(None) => "closed by backend".to_string(),
                Err(err) => format!("{err:#}"),
            };
            let dropped = SubscriptionError::SubscriptionDropped {
                topic: self.topic.clone(),
                reason,
            };
            warn!(topic = %self.topic, "realtime: {dropped}; reconnecting");
            self.set_state(ConnectionState::Connecting);

            match self.reconnect(&mut shutdown).await {
                Reconnect::Connected(fresh) => {
                    connection = fresh;
                    self.set_state(ConnectionState::Open);
                    info!(topic = %self.topic, "realtime: topic re-established");
                    self.dispatch(&ChannelEvent::Reconnected {
                        topic: self.topic.clone(),
                    })
                    .await;
                }
                Reconnect::ShutDown => {
                    self.set_state(ConnectionState::Closed);
                    return;
                }
                Reconnect::Exhausted { attempts, reason } => {
                    let exhausted = SubscriptionError::ReconnectExhausted {
                        topic: self.topic.clone(),
                        attempts,
                    };
                    error!(topic = %self.topic, "realtime: {exhausted}: {reason}");
                    self.set_state(ConnectionState::Closed);
                    let _ = self.status.send(TopicStatus::ReconnectFailed {
                        topic: self.topic.clone(),
                        attempts,
                        reason,
                    });
                    return;
                }
            }
        }
    }

    async fn reconnect(&self, shutdown: &mut oneshot::Receiver<()>) -> Reconnect {
        let mut reason = String::new();
        for attempt in 1..=self.policy.max_attempts {
            let delay = self.policy.delay_for(attempt);
            tokio::select! {
                _ = &mut *shutdown => return Reconnect::ShutDown,
                _ = tokio::time::sleep(delay) => {}
            }
            info!(
                topic = %self.topic,
                attempt,
                max_attempts = self.policy.max_attempts,
                "realtime: reconnecting"
            );
            let connect = self.transport.connect(&self.topic, &self.filters);
            tokio::select! {
                _ = &mut *shutdown => return Reconnect::ShutDown,
                result = connect => match result {
                    Ok(connection) => return Reconnect::Connected(connection),
                    Err(err) => {
                        warn!(topic = %self.topic, attempt, "realtime: reconnect failed: {err:#}");
                        reason = format!("{err:#}");
                    }
                },
            }
        }
        Reconnect::Exhausted {
            attempts: self.policy.max_attempts,
            reason,
        }
    }

    async fn dispatch(&self, event: &ChannelEvent) {
        let targets: Vec<Arc<dyn ChannelHandler>> = self
            .subscribers
            .read()
            .await
            .iter()
            .filter(|subscriber| subscriber.wants(event))
            .map(|subscriber| Arc::clone(&subscriber.handler))
            .collect();
        debug!(topic = %self.topic, targets = targets.len(), "realtime: dispatching event");
        for handler in targets {
            handler.handle(event).await;
        }
    }

    fn set_state(&self, state: ConnectionState) {
        let _ = self.state.send(state);
        let _ = self.status.send(TopicStatus::State {
            topic: self.topic.clone(),
            state,
        });
    }
}

#[cfg(test)]
#[path = "tests/realtime_tests.rs"]
mod tests;
