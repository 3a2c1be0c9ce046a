//! Realtime transport seam plus the Phoenix-channel websocket client.

use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use futures::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use serde_json::{json, Value};
use shared::protocol::{
    BroadcastPayload, ChangeEvent, EventFilter, PhoenixFrame, PostgresChangesPayload, ReplyPayload,
};
use tokio::{
    net::TcpStream,
    sync::{mpsc, Mutex},
    task::JoinHandle,
};
use tokio_tungstenite::{
    connect_async, tungstenite::Message as WsMessage, MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, info, warn};

use crate::config::Settings;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(25);
const JOIN_TIMEOUT: Duration = Duration::from_secs(10);
const PROTOCOL_VERSION: &str = "1.0.0";
const PHOENIX_TOPIC: &str = "phoenix";

#[async_trait]
pub trait RealtimeTransport: Send + Sync {
    /// Opens one topic with the given server-side filters. Resolves once the
    /// backend has acknowledged the join.
    async fn connect(
        &self,
        topic: &str,
        filters: &[EventFilter],
    ) -> Result<Box<dyn TransportConnection>>;
}

#[async_trait]
pub trait TransportConnection: Send {
    /// `Ok(None)` means the backend closed the topic.
    async fn next_event(&mut self) -> Result<Option<ChangeEvent>>;
    async fn close(&mut self);
}

pub struct MissingRealtimeTransport;

#[async_trait]
impl RealtimeTransport for MissingRealtimeTransport {
    async fn connect(
        &self,
        topic: &str,
        _filters: &[EventFilter],
    ) -> Result<Box<dyn TransportConnection>> {
        Err(anyhow!("realtime transport is not configured (topic {topic})"))
    }
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsWriter = Arc<Mutex<SplitSink<WsStream, WsMessage>>>;

pub struct WebSocketTransport {
    realtime_url: String,
    api_key: String,
    access_token: Option<String>,
    heartbeat_interval: Duration,
    join_timeout: Duration,
}

impl WebSocketTransport {
    pub fn new(
        realtime_url: impl Into<String>,
        api_key: impl Into<String>,
        access_token: Option<String>,
    ) -> Self {
        Self {
            realtime_url: realtime_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            access_token,
            heartbeat_interval: HEARTBEAT_INTERVAL,
            join_timeout: JOIN_TIMEOUT,
        }
    }

    pub fn from_settings(settings: &Settings) -> Result<Self> {
        Ok(Self::new(
            settings.realtime_url()?,
            &settings.api_key,
            settings.access_token.clone(),
        ))
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    fn socket_url(&self) -> String {
        format!(
            "{}/realtime/v1/websocket?apikey={}&vsn={PROTOCOL_VERSION}",
            self.realtime_url, self.api_key
        )
    }
}

/// `config` body of a `phx_join` for the given filters.
pub fn join_config(filters: &[EventFilter]) -> Value {
    let postgres_changes: Vec<Value> = filters
        .iter()
        .filter(|filter| !filter.is_broadcast())
        .map(|filter| {
            let mut entry = json!({
                "event": filter.change_type.as_wire(),
                "schema": "public",
                "table": filter.entity,
            });
            if let Some(predicate) = &filter.predicate {
                entry["filter"] = Value::String(predicate.to_wire());
            }
            entry
        })
        .collect();
    json!({
        "broadcast": { "self": false, "ack": false },
        "presence": { "key": "" },
        "postgres_changes": postgres_changes,
    })
}

async fn send_frame(writer: &WsWriter, frame: &PhoenixFrame) -> Result<()> {
    let text = serde_json::to_string(frame)?;
    writer
        .lock()
        .await
        .send(WsMessage::Text(text.into()))
        .await
        .context("websocket send failed")
}

#[async_trait]
impl RealtimeTransport for WebSocketTransport {
    async fn connect(
        &self,
        topic: &str,
        filters: &[EventFilter],
    ) -> Result<Box<dyn TransportConnection>> {
        let url = self.socket_url();
        let (ws_stream, _) = connect_async(url.as_str())
            .await
            .with_context(|| format!("failed to connect websocket for topic {topic}"))?;
        let (writer, mut reader) = ws_stream.split();
        let writer: WsWriter = Arc::new(Mutex::new(writer));

        let channel_topic = format!("realtime:{topic}");
        let refs = Arc::new(AtomicU64::new(1));
        let join_ref = refs.fetch_add(1, Ordering::SeqCst).to_string();
        let mut payload = json!({ "config": join_config(filters) });
        if let Some(token) = &self.access_token {
            payload["access_token"] = Value::String(token.clone());
        }
        send_frame(
            &writer,
            &PhoenixFrame {
                topic: channel_topic.clone(),
                event: "phx_join".into(),
                payload,
                reference: Some(join_ref.clone()),
                join_ref: Some(join_ref.clone()),
            },
        )
        .await?;

        tokio::time::timeout(
            self.join_timeout,
            await_join_reply(&mut reader, &channel_topic, &join_ref),
        )
        .await
        .map_err(|_| anyhow!("timed out joining topic {topic}"))??;
        info!(topic, filters = filters.len(), "realtime: joined topic");

        let acked = Arc::new(AtomicU64::new(0));
        let (failure_tx, heartbeat_failures) = mpsc::channel(1);
        let heartbeat = spawn_heartbeat(
            Heartbeat {
                writer: Arc::clone(&writer),
                refs: Arc::clone(&refs),
                acked: Arc::clone(&acked),
                failures: failure_tx,
            },
            self.heartbeat_interval,
        );

        Ok(Box::new(WebSocketConnection {
            channel_topic,
            join_ref,
            reader,
            writer,
            refs,
            acked,
            heartbeat,
            heartbeat_failures,
        }))
    }
}

async fn await_join_reply(
    reader: &mut SplitStream<WsStream>,
    channel_topic: &str,
    join_ref: &str,
) -> Result<()> {
    while let Some(message) = reader.next().await {
        let WsMessage::Text(text) = message.context("websocket receive failed")? else {
            continue;
        };
        let Ok(frame) = serde_json::from_str::<PhoenixFrame>(&text) else {
            continue;
        };
        if frame.topic != channel_topic
            || frame.event != "phx_reply"
            || frame.reference.as_deref() != Some(join_ref)
        {
            continue;
        }
        let reply: ReplyPayload =
            serde_json::from_value(frame.payload).context("malformed join reply")?;
        if reply.status == "ok" {
            return Ok(());
        }
        return Err(anyhow!("join rejected: {}", reply.response));
    }
    Err(anyhow!("websocket closed before join reply"))
}

struct Heartbeat {
    writer: WsWriter,
    refs: Arc<AtomicU64>,
    /// Highest heartbeat ref the server has replied to.
    acked: Arc<AtomicU64>,
    failures: mpsc::Sender<String>,
}

/// Sends a heartbeat every `period`. A heartbeat still unanswered when the
/// next one is due, or one that cannot be sent, fails the connection.
fn spawn_heartbeat(heartbeat: Heartbeat, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        let mut outstanding: Option<u64> = None;
        loop {
            interval.tick().await;
            if let Some(reference) = outstanding {
                if heartbeat.acked.load(Ordering::SeqCst) < reference {
                    warn!(reference, "realtime: heartbeat timed out");
                    let _ = heartbeat
                        .failures
                        .send(format!("heartbeat {reference} was not acknowledged"))
                        .await;
                    return;
                }
            }
            let reference = heartbeat.refs.fetch_add(1, Ordering::SeqCst);
            let frame = PhoenixFrame {
                topic: PHOENIX_TOPIC.into(),
                event: "heartbeat".into(),
                payload: json!({}),
                reference: Some(reference.to_string()),
                join_ref: None,
            };
            if let Err(err) = send_frame(&heartbeat.writer, &frame).await {
                warn!("realtime: heartbeat failed: {err}");
                let _ = heartbeat
                    .failures
                    .send(format!("heartbeat failed: {err:#}"))
                    .await;
                return;
            }
            outstanding = Some(reference);
        }
    })
}

struct WebSocketConnection {
    channel_topic: String,
    join_ref: String,
    reader: SplitStream<WsStream>,
    writer: WsWriter,
    refs: Arc<AtomicU64>,
    acked: Arc<AtomicU64>,
    heartbeat: JoinHandle<()>,
    heartbeat_failures: mpsc::Receiver<String>,
}

#[async_trait]
impl TransportConnection for WebSocketConnection {
    async fn next_event(&mut self) -> Result<Option<ChangeEvent>> {
        loop {
            let message = tokio::select! {
                Some(reason) = self.heartbeat_failures.recv() => return Err(anyhow!(reason)),
                message = self.reader.next() => message,
            };
            let Some(message) = message else {
                return Ok(None);
            };
            let text = match message.context("websocket receive failed")? {
                WsMessage::Text(text) => text,
                WsMessage::Close(_) => return Ok(None),
                _ => continue,
            };
            let frame = match serde_json::from_str::<PhoenixFrame>(&text) {
                Ok(frame) => frame,
                Err(err) => {
                    warn!("realtime: ignoring malformed frame: {err}");
                    continue;
                }
            };
            if frame.topic == PHOENIX_TOPIC && frame.event == "phx_reply" {
                if let Some(reference) = frame.reference.as_deref().and_then(|r| r.parse::<u64>().ok()) {
                    self.acked.fetch_max(reference, Ordering::SeqCst);
                }
                continue;
            }
            if frame.topic != self.channel_topic {
                continue;
            }
            match frame.event.as_str() {
                "postgres_changes" => {
                    match serde_json::from_value::<PostgresChangesPayload>(frame.payload) {
                        Ok(payload) => return Ok(Some(payload.data.into())),
                        Err(err) => warn!("realtime: malformed change payload: {err}"),
                    }
                }
                "broadcast" => match serde_json::from_value::<BroadcastPayload>(frame.payload) {
                    Ok(payload) => {
                        return Ok(Some(ChangeEvent::broadcast(payload.event, payload.payload)))
                    }
                    Err(err) => warn!("realtime: malformed broadcast payload: {err}"),
                },
                "phx_close" => return Ok(None),
                "phx_error" => return Err(anyhow!("channel error: {}", frame.payload)),
                other => debug!(event = other, "realtime: skipping control frame"),
            }
        }
    }

    async fn close(&mut self) {
        self.heartbeat.abort();
        let leave = PhoenixFrame {
            topic: self.channel_topic.clone(),
            event: "phx_leave".into(),
            payload: json!({}),
            reference: Some(self.refs.fetch_add(1, Ordering::SeqCst).to_string()),
            join_ref: Some(self.join_ref.clone()),
        };
        if let Err(err) = send_frame(&self.writer, &leave).await {
            debug!("realtime: leave frame not delivered: {err}");
        }
        let _ = self.writer.lock().await.close().await;
    }
}

impl Drop for WebSocketConnection {
    fn drop(&mut self) {
        self.heartbeat.abort();
    }
}

#[cfg(test)]
#[path = "tests/transport_tests.rs"]
mod tests;
