use super::*;

use std::collections::HashMap;

use axum::{
    extract::{
        ws::{Message as AxMessage, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    response::Response,
    routing::get,
    Router,
};
use shared::{domain::ChangeType, protocol::Predicate};
use tokio::{net::TcpListener, sync::mpsc};

type FrameLog = mpsc::UnboundedSender<Value>;

async fn push(socket: &mut WebSocket, frame: Value) {
    let _ = socket.send(AxMessage::Text(frame.to_string())).await;
}

async fn realtime_socket(
    ws: WebSocketUpgrade,
    Query(params): Query<HashMap<String, String>>,
    State(log): State<FrameLog>,
) -> Response {
    let _ = log.send(json!({ "query": params }));
    ws.on_upgrade(move |socket| phoenix_session(socket, log))
}

/// Phoenix server double. Heartbeats are answered unless the joined topic
/// ends with "silent".
async fn phoenix_session(mut socket: WebSocket, log: FrameLog) {
    let mut silent = false;
    while let Some(Ok(message)) = socket.recv().await {
        let AxMessage::Text(text) = message else {
            continue;
        };
        let Ok(frame) = serde_json::from_str::<Value>(&text) else {
            continue;
        };
        let _ = log.send(frame.clone());
        if frame["event"] == "heartbeat" && !silent {
            push(
                &mut socket,
                json!({
                    "topic": "phoenix",
                    "event": "phx_reply",
                    "payload": { "status": "ok", "response": {} },
                    "ref": frame["ref"],
                }),
            )
            .await;
            continue;
        }
        if frame["event"] != "phx_join" {
            continue;
        }
        let topic = frame["topic"].as_str().unwrap_or_default().to_string();
        silent = topic.ends_with("silent");
        let status = if topic.ends_with("denied") { "error" } else { "ok" };
        push(
            &mut socket,
            json!({
                "topic": topic,
                "event": "phx_reply",
                "payload": { "status": status, "response": { "reason": "unauthorized" } },
                "ref": frame["ref"],
            }),
        )
        .await;
        if status != "ok" {
            return;
        }
        push(
            &mut socket,
            json!({
                "topic": "realtime:someone-else",
                "event": "postgres_changes",
                "payload": { "data": { "type": "INSERT", "table": "messages", "record": { "id": "noise" } } },
            }),
        )
        .await;
        push(
            &mut socket,
            json!({ "topic": topic, "event": "presence_state", "payload": {} }),
        )
        .await;
        push(
            &mut socket,
            json!({
                "topic": topic,
                "event": "postgres_changes",
                "payload": { "data": {
                    "type": "INSERT",
                    "table": "messages",
                    "schema": "public",
                    "record": { "id": "m1", "recipient_id": "u1" },
                    "commit_timestamp": "2024-05-15T12:00:00Z",
                } },
            }),
        )
        .await;
        push(
            &mut socket,
            json!({
                "topic": topic,
                "event": "broadcast",
                "payload": { "event": "typing", "payload": { "user": "u2" } },
            }),
        )
        .await;
        if topic.ends_with("closing") {
            push(
                &mut socket,
                json!({ "topic": topic, "event": "phx_close", "payload": {} }),
            )
            .await;
        }
    }
}

async fn spawn_realtime() -> anyhow::Result<(String, mpsc::UnboundedReceiver<Value>)> {
    std::env::set_var("NO_PROXY", "127.0.0.1,localhost");
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let (tx, rx) = mpsc::unbounded_channel();
    let app = Router::new()
        .route("/realtime/v1/websocket", get(realtime_socket))
        .with_state(tx);
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    Ok((format!("ws://{addr}"), rx))
}

async fn next_frame_with_event(rx: &mut mpsc::UnboundedReceiver<Value>, event: &str) -> Value {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let frame = rx.recv().await.expect("frame log open");
            if frame["event"] == event {
                return frame;
            }
        }
    })
    .await
    .expect("frame within timeout")
}

fn inbox_filters() -> Vec<EventFilter> {
    vec![
        EventFilter::table("messages", ChangeType::Insert)
            .with_predicate(Predicate::eq("recipient_id", "u1")),
        EventFilter::broadcast("typing"),
    ]
}

#[test]
fn join_config_lists_table_filters_only() {
    let config = join_config(&inbox_filters());
    assert_eq!(config["broadcast"]["self"], false);
    let changes = config["postgres_changes"].as_array().expect("array");
    assert_eq!(changes.len(), 1);
    assert_eq!(changes[0]["event"], "INSERT");
    assert_eq!(changes[0]["schema"], "public");
    assert_eq!(changes[0]["table"], "messages");
    assert_eq!(changes[0]["filter"], "recipient_id=eq.u1");
}

#[tokio::test]
async fn joins_topic_and_surfaces_changes_and_broadcasts() {
    let (url, mut frames) = spawn_realtime().await.expect("server");
    let transport = WebSocketTransport::new(url, "anon-key", Some("user-jwt".into()));

    let mut connection = transport
        .connect("dm:u1:u2", &inbox_filters())
        .await
        .expect("connect");

    let query = frames.recv().await.expect("query");
    assert_eq!(query["query"]["apikey"], "anon-key");
    assert_eq!(query["query"]["vsn"], "1.0.0");

    let join = next_frame_with_event(&mut frames, "phx_join").await;
    assert_eq!(join["topic"], "realtime:dm:u1:u2");
    assert_eq!(join["payload"]["access_token"], "user-jwt");
    assert_eq!(join["ref"], join["join_ref"]);
    assert_eq!(
        join["payload"]["config"]["postgres_changes"][0]["filter"],
        "recipient_id=eq.u1"
    );

    let change = connection
        .next_event()
        .await
        .expect("receive")
        .expect("change event");
    assert_eq!(change.entity, "messages");
    assert_eq!(change.change_type, ChangeType::Insert);
    assert_eq!(change.record_id().as_deref(), Some("m1"));
    assert_eq!(change.commit_timestamp.as_deref(), Some("2024-05-15T12:00:00Z"));

    let broadcast = connection
        .next_event()
        .await
        .expect("receive")
        .expect("broadcast event");
    assert_eq!(broadcast.entity, "typing");
    assert_eq!(broadcast.change_type, ChangeType::Broadcast);
    assert_eq!(broadcast.record["user"], "u2");

    connection.close().await;
    let leave = next_frame_with_event(&mut frames, "phx_leave").await;
    assert_eq!(leave["topic"], "realtime:dm:u1:u2");
    assert_eq!(leave["join_ref"], join["join_ref"]);
}

#[tokio::test]
async fn rejected_join_fails_connect() {
    let (url, _frames) = spawn_realtime().await.expect("server");
    let transport = WebSocketTransport::new(url, "anon-key", None);

    let err = transport
        .connect("notifications:denied", &[])
        .await
        .err()
        .expect("join should be rejected");
    assert!(err.to_string().contains("join rejected"), "{err}");
}

#[tokio::test]
async fn phx_close_ends_the_stream() {
    let (url, _frames) = spawn_realtime().await.expect("server");
    let transport = WebSocketTransport::new(url, "anon-key", None);
    let mut connection = transport.connect("closing", &[]).await.expect("connect");

    assert!(connection.next_event().await.expect("change").is_some());
    assert!(connection.next_event().await.expect("broadcast").is_some());
    assert!(connection.next_event().await.expect("close").is_none());
}

#[tokio::test]
async fn sends_heartbeats_on_the_phoenix_topic() {
    let (url, mut frames) = spawn_realtime().await.expect("server");
    let transport = WebSocketTransport::new(url, "anon-key", None)
        .with_heartbeat_interval(Duration::from_millis(20));
    let _connection = transport.connect("beats", &[]).await.expect("connect");

    let heartbeat = next_frame_with_event(&mut frames, "heartbeat").await;
    assert_eq!(heartbeat["topic"], "phoenix");
    assert!(heartbeat["ref"].is_string());
}

#[tokio::test]
async fn unanswered_heartbeats_fail_the_connection() {
    let (url, _frames) = spawn_realtime().await.expect("server");
    let transport = WebSocketTransport::new(url, "anon-key", None)
        .with_heartbeat_interval(Duration::from_millis(20));
    let mut connection = transport.connect("silent", &[]).await.expect("connect");

    assert!(connection.next_event().await.expect("change").is_some());
    assert!(connection.next_event().await.expect("broadcast").is_some());
    let err = tokio::time::timeout(Duration::from_secs(2), connection.next_event())
        .await
        .expect("failure within timeout")
        .err()
        .expect("heartbeat timeout surfaces as an error");
    assert!(err.to_string().contains("heartbeat"), "{err}");
}

#[tokio::test]
async fn answered_heartbeats_keep_the_connection_open() {
    let (url, mut frames) = spawn_realtime().await.expect("server");
    let transport = WebSocketTransport::new(url, "anon-key", None)
        .with_heartbeat_interval(Duration::from_millis(20));
    let mut connection = transport.connect("beats", &[]).await.expect("connect");

    assert!(connection.next_event().await.expect("change").is_some());
    assert!(connection.next_event().await.expect("broadcast").is_some());
    let idle = tokio::time::timeout(Duration::from_millis(200), connection.next_event()).await;
    assert!(idle.is_err(), "connection ended early: {idle:?}");

    let mut heartbeats = 0;
    while let Ok(frame) = frames.try_recv() {
        heartbeats += usize::from(frame["event"] == "heartbeat");
    }
    assert!(heartbeats >= 3, "only {heartbeats} heartbeats sent");
}

#[tokio::test]
async fn missing_transport_refuses_connections() {
    let err = MissingRealtimeTransport
        .connect("anything", &[])
        .await
        .err()
        .expect("not configured");
    assert!(err.to_string().contains("anything"));
}
