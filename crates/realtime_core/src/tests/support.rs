//! In-memory collaborators shared by the unit tests.

use std::{
    collections::{HashMap, VecDeque},
    future::Future,
    sync::{
        atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{TimeZone, Utc};
use media_capture::{
    CaptureError, CaptureFormat, CaptureRequest, CaptureStream, MediaCaptureDevice, SampleFormat,
};
use serde_json::{json, Value};
use shared::protocol::{ChangeEvent, EventFilter};
use tokio::sync::{mpsc, Notify, Semaphore};

use crate::{
    backend::{
        CurrentUser, Filter, ObjectStorage, RelationalStore, SelectQuery, TransferProgress,
        UploadOptions,
    },
    clock::FixedClock,
    error::StorageError,
    transport::{RealtimeTransport, TransportConnection},
};

pub fn user(id: &str) -> CurrentUser {
    CurrentUser::new(id, format!("User {id}"))
}

/// 2024-05-15 12:00:00 UTC.
pub fn fixed_clock() -> Arc<FixedClock> {
    Arc::new(FixedClock::utc(
        Utc.with_ymd_and_hms(2024, 5, 15, 12, 0, 0).unwrap(),
    ))
}

pub fn message_row(id: &str, sender: &str, recipient: &str, content: &str, created_at: &str) -> Value {
    json!({
        "id": id,
        "sender_id": sender,
        "recipient_id": recipient,
        "content": content,
        "created_at": created_at,
    })
}

/// Polls `check` until it holds, for up to five (possibly virtual) seconds.
pub async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..500 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

enum HubFrame {
    Event(ChangeEvent),
    Reset,
}

struct HubConnection {
    topic: String,
    filters: Vec<EventFilter>,
    tx: mpsc::UnboundedSender<HubFrame>,
    closed: Arc<AtomicBool>,
}

#[derive(Default)]
struct HubState {
    connections: Vec<HubConnection>,
    connects: HashMap<String, usize>,
    closes: HashMap<String, usize>,
    refuse: HashMap<String, u32>,
    refuse_all: bool,
    held: HashMap<String, Arc<Semaphore>>,
}

/// Realtime backend double. Published events reach every live connection on
/// the topic whose joined filters accept them.
#[derive(Clone, Default)]
pub struct InMemoryTransport {
    state: Arc<Mutex<HubState>>,
}

impl InMemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish(&self, topic: &str, event: ChangeEvent) -> usize {
        let state = self.state.lock().unwrap();
        let mut delivered = 0;
        for connection in state.connections.iter().filter(|c| c.topic == topic) {
            if connection.closed.load(Ordering::SeqCst) {
                continue;
            }
            let accepted = connection.filters.is_empty()
                || connection.filters.iter().any(|filter| filter.matches(&event));
            if accepted && connection.tx.send(HubFrame::Event(event.clone())).is_ok() {
                delivered += 1;
            }
        }
        delivered
    }

    /// Severs every live connection on `topic`.
    pub fn reset(&self, topic: &str) {
        let state = self.state.lock().unwrap();
        for connection in state.connections.iter().filter(|c| c.topic == topic) {
            if !connection.closed.swap(true, Ordering::SeqCst) {
                let _ = connection.tx.send(HubFrame::Reset);
            }
        }
    }

    pub fn refuse_next(&self, topic: &str, count: u32) {
        self.state
            .lock()
            .unwrap()
            .refuse
            .insert(topic.to_string(), count);
    }

    pub fn refuse_all(&self, refuse: bool) {
        self.state.lock().unwrap().refuse_all = refuse;
    }

    /// Connects to `topic` stay pending until `release` is called.
    pub fn hold(&self, topic: &str) {
        self.state
            .lock()
            .unwrap()
            .held
            .insert(topic.to_string(), Arc::new(Semaphore::new(0)));
    }

    pub fn release(&self, topic: &str) {
        if let Some(gate) = self.state.lock().unwrap().held.remove(topic) {
            gate.close();
        }
    }

    pub fn connects(&self, topic: &str) -> usize {
        self.state.lock().unwrap().connects.get(topic).copied().unwrap_or(0)
    }

    pub fn closes(&self, topic: &str) -> usize {
        self.state.lock().unwrap().closes.get(topic).copied().unwrap_or(0)
    }

    pub fn live(&self, topic: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .connections
            .iter()
            .filter(|c| c.topic == topic && !c.closed.load(Ordering::SeqCst))
            .count()
    }

    pub fn joined_filters(&self, topic: &str) -> Vec<EventFilter> {
        self.state
            .lock()
            .unwrap()
            .connections
            .iter()
            .rev()
            .find(|c| c.topic == topic)
            .map(|c| c.filters.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl RealtimeTransport for InMemoryTransport {
    async fn connect(
        &self,
        topic: &str,
        filters: &[EventFilter],
    ) -> Result<Box<dyn TransportConnection>> {
        let held = {
            let mut state = self.state.lock().unwrap();
            *state.connects.entry(topic.to_string()).or_default() += 1;
            state.held.get(topic).cloned()
        };
        if let Some(gate) = held {
            // Closed on release.
            let _ = gate.acquire().await;
        }
        let mut state = self.state.lock().unwrap();
        if state.refuse_all {
            return Err(anyhow!("backend unreachable"));
        }
        if let Some(remaining) = state.refuse.get_mut(topic) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(anyhow!("backend unreachable"));
            }
        }
        let (tx, rx) = mpsc::unbounded_channel();
        let closed = Arc::new(AtomicBool::new(false));
        state.connections.push(HubConnection {
            topic: topic.to_string(),
            filters: filters.to_vec(),
            tx,
            closed: Arc::clone(&closed),
        });
        Ok(Box::new(InMemoryConnection {
            topic: topic.to_string(),
            rx,
            closed,
            state: Arc::clone(&self.state),
        }))
    }
}

struct InMemoryConnection {
    topic: String,
    rx: mpsc::UnboundedReceiver<HubFrame>,
    closed: Arc<AtomicBool>,
    state: Arc<Mutex<HubState>>,
}

#[async_trait]
impl TransportConnection for InMemoryConnection {
    async fn next_event(&mut self) -> Result<Option<ChangeEvent>> {
        match self.rx.recv().await {
            Some(HubFrame::Event(event)) => Ok(Some(event)),
            Some(HubFrame::Reset) => Err(anyhow!("connection reset by peer")),
            None => Ok(None),
        }
    }

    async fn close(&mut self) {
        self.closed.store(true, Ordering::SeqCst);
        *self
            .state
            .lock()
            .unwrap()
            .closes
            .entry(self.topic.clone())
            .or_default() += 1;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Succeed,
    Transfer,
    Denied,
    TooLarge,
    Rejected,
}

/// Object storage double that replays a script of outcomes, then succeeds.
#[derive(Default)]
pub struct ScriptedStorage {
    script: Mutex<VecDeque<Outcome>>,
    attempts: Mutex<Vec<(String, String)>>,
    gate: Mutex<Option<Arc<Notify>>>,
}

impl ScriptedStorage {
    pub fn new(script: impl IntoIterator<Item = Outcome>) -> Self {
        Self {
            script: Mutex::new(script.into_iter().collect()),
            ..Self::default()
        }
    }

    /// Uploads wait on `gate` before completing.
    pub fn hold_on(&self, gate: Arc<Notify>) {
        *self.gate.lock().unwrap() = Some(gate);
    }

    pub fn attempts(&self) -> Vec<(String, String)> {
        self.attempts.lock().unwrap().clone()
    }

    pub fn buckets_tried(&self) -> Vec<String> {
        self.attempts().into_iter().map(|(bucket, _)| bucket).collect()
    }
}

#[async_trait]
impl ObjectStorage for ScriptedStorage {
    async fn upload(
        &self,
        bucket: &str,
        path: &str,
        body: Bytes,
        _options: &UploadOptions,
        progress: &TransferProgress<'_>,
    ) -> Result<(), StorageError> {
        self.attempts
            .lock()
            .unwrap()
            .push((bucket.to_string(), path.to_string()));
        let outcome = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Outcome::Succeed);
        let gate = self.gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        let total = body.len() as u64;
        progress(total / 2, total);
        match outcome {
            Outcome::Succeed => {
                progress(total, total);
                Ok(())
            }
            Outcome::Transfer => Err(StorageError::Transfer("connection reset".into())),
            Outcome::Denied => Err(StorageError::PermissionDenied(
                "new row violates row-level security policy".into(),
            )),
            Outcome::TooLarge => Err(StorageError::PayloadTooLarge { size: total }),
            Outcome::Rejected => Err(StorageError::Rejected("invalid mime type".into())),
        }
    }

    fn public_url(&self, bucket: &str, path: &str) -> String {
        format!("https://cdn.test/{bucket}/{path}")
    }
}

/// Relational store double over JSON rows.
#[derive(Default)]
pub struct InMemoryStore {
    tables: Mutex<HashMap<String, Vec<Value>>>,
    next_id: AtomicU32,
    failing_inserts: AtomicU32,
    failing_selects: AtomicU32,
    held_selects: Mutex<HashMap<String, Arc<Semaphore>>>,
    pub selects: AtomicUsize,
    pub inserts: AtomicUsize,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seed(&self, table: &str, rows: impl IntoIterator<Item = Value>) {
        self.tables
            .lock()
            .unwrap()
            .entry(table.to_string())
            .or_default()
            .extend(rows);
    }

    pub fn rows(&self, table: &str) -> Vec<Value> {
        self.tables
            .lock()
            .unwrap()
            .get(table)
            .cloned()
            .unwrap_or_default()
    }

    pub fn fail_inserts(&self, count: u32) {
        self.failing_inserts.store(count, Ordering::SeqCst);
    }

    pub fn fail_selects(&self, count: u32) {
        self.failing_selects.store(count, Ordering::SeqCst);
    }

    /// Selects on `table` stay pending until `release_selects` is called.
    pub fn hold_selects(&self, table: &str) {
        self.held_selects
            .lock()
            .unwrap()
            .insert(table.to_string(), Arc::new(Semaphore::new(0)));
    }

    pub fn release_selects(&self, table: &str) {
        if let Some(gate) = self.held_selects.lock().unwrap().remove(table) {
            gate.close();
        }
    }

    fn take_failure(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl RelationalStore for InMemoryStore {
    async fn select(&self, query: &SelectQuery) -> Result<Vec<Value>> {
        self.selects.fetch_add(1, Ordering::SeqCst);
        let held = self.held_selects.lock().unwrap().get(&query.table).cloned();
        if let Some(gate) = held {
            let _ = gate.acquire().await;
        }
        if Self::take_failure(&self.failing_selects) {
            return Err(anyhow!("HTTP 503: upstream unavailable"));
        }
        let mut rows: Vec<Value> = self
            .rows(&query.table)
            .into_iter()
            .filter(|row| query.matches(row))
            .collect();
        if let Some(order) = &query.order {
            rows.sort_by(|a, b| {
                let a = a.get(&order.column).map(Value::to_string).unwrap_or_default();
                let b = b.get(&order.column).map(Value::to_string).unwrap_or_default();
                if order.ascending {
                    a.cmp(&b)
                } else {
                    b.cmp(&a)
                }
            });
        }
        if let Some(limit) = query.limit {
            rows.truncate(limit as usize);
        }
        Ok(rows)
    }

    async fn insert(&self, table: &str, row: Value) -> Result<Value> {
        self.inserts.fetch_add(1, Ordering::SeqCst);
        if Self::take_failure(&self.failing_inserts) {
            return Err(anyhow!("HTTP 503: upstream unavailable"));
        }
        let mut row = row;
        let n = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(object) = row.as_object_mut() {
            object
                .entry("id")
                .or_insert_with(|| Value::String(format!("row-{n}")));
            object
                .entry("created_at")
                .or_insert_with(|| Value::String(format!("2024-05-15T12:00:{:02}Z", n % 60)));
        }
        self.seed(table, [row.clone()]);
        Ok(row)
    }

    async fn update(&self, table: &str, filters: &[Filter], patch: Value) -> Result<Vec<Value>> {
        let mut tables = self.tables.lock().unwrap();
        let mut updated = Vec::new();
        for row in tables.entry(table.to_string()).or_default().iter_mut() {
            if !filters.iter().all(|filter| filter.matches(row)) {
                continue;
            }
            if let (Some(target), Some(fields)) = (row.as_object_mut(), patch.as_object()) {
                for (key, value) in fields {
                    target.insert(key.clone(), value.clone());
                }
            }
            updated.push(row.clone());
        }
        Ok(updated)
    }

    async fn rpc(&self, _function: &str, _args: Value) -> Result<Value> {
        Ok(Value::Null)
    }
}

/// Microphone double that counts acquisitions and releases.
pub struct CountingDevice {
    supported: Vec<String>,
    format: CaptureFormat,
    chunks: Mutex<Vec<Bytes>>,
    deny: AtomicBool,
    pub opened: Arc<AtomicUsize>,
    pub released: Arc<AtomicUsize>,
}

impl CountingDevice {
    /// 16 kHz mono PCM device that only satisfies `audio/wav`.
    pub fn pcm(chunks: Vec<Bytes>) -> Self {
        Self {
            supported: vec!["audio/wav".into()],
            format: CaptureFormat::Pcm {
                sample_rate: 16_000,
                channels: 1,
                sample_format: SampleFormat::I16,
            },
            chunks: Mutex::new(chunks),
            deny: AtomicBool::new(false),
            opened: Arc::new(AtomicUsize::new(0)),
            released: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Platform-recorder style device producing webm/opus.
    pub fn webm(chunks: Vec<Bytes>) -> Self {
        Self {
            supported: vec!["audio/webm;codecs=opus".into(), "audio/webm".into()],
            format: CaptureFormat::Encoded {
                mime_type: "audio/webm;codecs=opus".into(),
            },
            ..Self::pcm(chunks)
        }
    }

    pub fn deny(&self) {
        self.deny.store(true, Ordering::SeqCst);
    }

    pub fn set_chunks(&self, chunks: Vec<Bytes>) {
        *self.chunks.lock().unwrap() = chunks;
    }

    pub fn held(&self) -> usize {
        self.opened.load(Ordering::SeqCst) - self.released.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MediaCaptureDevice for CountingDevice {
    fn supports_mime_type(&self, mime_type: &str) -> bool {
        self.supported.iter().any(|supported| supported == mime_type)
    }

    async fn open(&self, _request: CaptureRequest) -> Result<Box<dyn CaptureStream>, CaptureError> {
        if self.deny.load(Ordering::SeqCst) {
            return Err(CaptureError::PermissionDenied("blocked by user".into()));
        }
        self.opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(CountingStream {
            format: self.format.clone(),
            chunks: self.chunks.lock().unwrap().clone(),
            tx: None,
            released: Arc::clone(&self.released),
        }))
    }
}

struct CountingStream {
    format: CaptureFormat,
    chunks: Vec<Bytes>,
    tx: Option<mpsc::UnboundedSender<Bytes>>,
    released: Arc<AtomicUsize>,
}

#[async_trait]
impl CaptureStream for CountingStream {
    fn format(&self) -> &CaptureFormat {
        &self.format
    }

    fn start(&mut self, _timeslice: Duration) -> Result<mpsc::UnboundedReceiver<Bytes>, CaptureError> {
        let (tx, rx) = mpsc::unbounded_channel();
        for chunk in &self.chunks {
            let _ = tx.send(chunk.clone());
        }
        self.tx = Some(tx);
        Ok(rx)
    }

    async fn stop(&mut self) {
        self.tx = None;
    }

    fn release(&mut self) {
        self.released.fetch_add(1, Ordering::SeqCst);
    }
}

/// 16-bit mono PCM of `samples` samples.
pub fn pcm_chunk(samples: usize) -> Bytes {
    let mut raw = Vec::with_capacity(samples * 2);
    for i in 0..samples {
        raw.extend_from_slice(&((i % 200) as i16 * 100).to_le_bytes());
    }
    Bytes::from(raw)
}
