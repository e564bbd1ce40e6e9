//! Typed pub/sub and append-only streams — the transport every component
//! shares.
//!
//! Key layout (one set per task, created lazily on first write):
//!
//! - `task:{task_id}:output` — per-task output stream
//! - `task-output` — shared output stream across all tasks
//! - `task:{task_id}:input_request` — prompt channel (pub/sub)
//! - `task:{task_id}:input_response` — response channel (pub/sub)
//! - `task:{task_id}:status` — status/control channel (pub/sub)
//!
//! Within a single stream, readers observe envelopes in append order;
//! cross-stream ordering is not guaranteed. Publishes are at-least-once;
//! consumers dedupe on `Envelope::dedupe_key`.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::envelope::Envelope;
use crate::errors::RunnerError;

pub const COMMON_OUTPUT_STREAM: &str = "task-output";

pub fn task_output_stream(task_id: &str) -> String {
    format!("task:{}:output", task_id)
}

pub fn input_request_channel(task_id: &str) -> String {
    format!("task:{}:input_request", task_id)
}

pub fn input_response_channel(task_id: &str) -> String {
    format!("task:{}:input_response", task_id)
}

pub fn status_channel(task_id: &str) -> String {
    format!("task:{}:status", task_id)
}

/// Every key belonging to one task, in cleanup order.
pub fn task_stream_keys(task_id: &str) -> Vec<String> {
    vec![
        task_output_stream(task_id),
        input_request_channel(task_id),
        input_response_channel(task_id),
        status_channel(task_id),
    ]
}

/// Where a stream subscription starts reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadFrom {
    /// Only envelopes appended after the subscription.
    Latest,
    /// Full backlog first, then live envelopes.
    Earliest,
}

/// Abstraction over the stream backend: per-key append-only logs plus
/// pub/sub channels. The shipped backend is in-process; any store with the
/// same semantics can implement this.
#[async_trait]
pub trait StreamBus: Send + Sync {
    /// Fire-and-forget publish to a pub/sub topic.
    async fn publish(&self, topic: &str, envelope: &Envelope) -> Result<(), RunnerError>;

    /// Subscribe to a pub/sub topic from now.
    async fn subscribe(&self, topic: &str) -> Result<TopicSubscription, RunnerError>;

    /// Append to a stream; returns the entry id. Timestamps within one
    /// stream are clamped monotonic non-decreasing.
    async fn xadd(&self, stream: &str, envelope: &Envelope) -> Result<u64, RunnerError>;

    /// Read stream entries with id >= `from_id`, in append order.
    async fn xrange(&self, stream: &str, from_id: u64) -> Result<Vec<(u64, Envelope)>, RunnerError>;

    /// Tail a stream, optionally replaying the backlog first.
    async fn subscribe_stream(
        &self,
        stream: &str,
        from: ReadFrom,
    ) -> Result<StreamSubscription, RunnerError>;

    /// Drop a stream or topic and its retained entries.
    async fn delete(&self, key: &str) -> Result<(), RunnerError>;

    /// Trim a stream to at most `maxlen` newest entries.
    async fn trim(&self, stream: &str, maxlen: usize) -> Result<(), RunnerError>;

    /// All stream keys currently retained (for periodic trimming).
    async fn list_streams(&self) -> Result<Vec<String>, RunnerError>;
}

/// Live subscription to a pub/sub topic.
pub struct TopicSubscription {
    rx: broadcast::Receiver<Envelope>,
}

impl TopicSubscription {
    pub async fn next(&mut self) -> Option<Envelope> {
        loop {
            match self.rx.recv().await {
                Ok(env) => return Some(env),
                // Missed some messages; keep receiving.
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

/// Subscription to a stream: backlog (when requested) then live entries.
pub struct StreamSubscription {
    backlog: VecDeque<(u64, Envelope)>,
    rx: broadcast::Receiver<(u64, Envelope)>,
    last_delivered: u64,
}

impl StreamSubscription {
    pub async fn next(&mut self) -> Option<(u64, Envelope)> {
        if let Some((id, env)) = self.backlog.pop_front() {
            self.last_delivered = id;
            return Some((id, env));
        }
        loop {
            match self.rx.recv().await {
                Ok((id, env)) => {
                    // Entries already seen via the backlog snapshot.
                    if id <= self.last_delivered {
                        continue;
                    }
                    self.last_delivered = id;
                    return Some((id, env));
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

const CHANNEL_CAPACITY: usize = 256;

struct StreamState {
    entries: VecDeque<(u64, Envelope)>,
    next_id: u64,
    last_ts: i64,
    tx: broadcast::Sender<(u64, Envelope)>,
}

impl StreamState {
    fn new() -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            entries: VecDeque::new(),
            next_id: 1,
            last_ts: 0,
            tx,
        }
    }
}

/// In-process stream backend over tokio broadcast channels and bounded
/// per-key logs.
pub struct MemoryBus {
    topics: Mutex<HashMap<String, broadcast::Sender<Envelope>>>,
    streams: Mutex<HashMap<String, StreamState>>,
    max_stream_size: usize,
}

impl MemoryBus {
    pub fn new(max_stream_size: usize) -> Self {
        Self {
            topics: Mutex::new(HashMap::new()),
            streams: Mutex::new(HashMap::new()),
            max_stream_size,
        }
    }

    fn topic_sender(&self, topic: &str) -> broadcast::Sender<Envelope> {
        let mut topics = self.topics.lock().expect("bus topics lock poisoned");
        topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone()
    }
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::new(1000)
    }
}

#[async_trait]
impl StreamBus for MemoryBus {
    async fn publish(&self, topic: &str, envelope: &Envelope) -> Result<(), RunnerError> {
        // A send error only means no receivers are subscribed.
        let _ = self.topic_sender(topic).send(envelope.clone());
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<TopicSubscription, RunnerError> {
        Ok(TopicSubscription {
            rx: self.topic_sender(topic).subscribe(),
        })
    }

    async fn xadd(&self, stream: &str, envelope: &Envelope) -> Result<u64, RunnerError> {
        let mut streams = self.streams.lock().expect("bus streams lock poisoned");
        let state = streams
            .entry(stream.to_string())
            .or_insert_with(StreamState::new);

        let mut entry = envelope.clone();
        let ts = entry.timestamp().max(state.last_ts);
        entry.set_timestamp(ts);
        state.last_ts = ts;

        let id = state.next_id;
        state.next_id += 1;
        state.entries.push_back((id, entry.clone()));
        while state.entries.len() > self.max_stream_size {
            state.entries.pop_front();
        }
        let _ = state.tx.send((id, entry));
        Ok(id)
    }

    async fn xrange(&self, stream: &str, from_id: u64) -> Result<Vec<(u64, Envelope)>, RunnerError> {
        let streams = self.streams.lock().expect("bus streams lock poisoned");
        Ok(streams
            .get(stream)
            .map(|state| {
                state
                    .entries
                    .iter()
                    .filter(|(id, _)| *id >= from_id)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn subscribe_stream(
        &self,
        stream: &str,
        from: ReadFrom,
    ) -> Result<StreamSubscription, RunnerError> {
        let mut streams = self.streams.lock().expect("bus streams lock poisoned");
        let state = streams
            .entry(stream.to_string())
            .or_insert_with(StreamState::new);
        // The receiver is created under the same lock as the backlog
        // snapshot, so no entry can fall between the two.
        let rx = state.tx.subscribe();
        let (backlog, last_delivered) = match from {
            ReadFrom::Earliest => (state.entries.clone(), 0),
            ReadFrom::Latest => (VecDeque::new(), state.next_id.saturating_sub(1)),
        };
        Ok(StreamSubscription {
            backlog,
            rx,
            last_delivered,
        })
    }

    async fn delete(&self, key: &str) -> Result<(), RunnerError> {
        self.topics
            .lock()
            .expect("bus topics lock poisoned")
            .remove(key);
        self.streams
            .lock()
            .expect("bus streams lock poisoned")
            .remove(key);
        Ok(())
    }

    async fn trim(&self, stream: &str, maxlen: usize) -> Result<(), RunnerError> {
        let mut streams = self.streams.lock().expect("bus streams lock poisoned");
        if let Some(state) = streams.get_mut(stream) {
            while state.entries.len() > maxlen {
                state.entries.pop_front();
            }
        }
        Ok(())
    }

    async fn list_streams(&self) -> Result<Vec<String>, RunnerError> {
        let streams = self.streams.lock().expect("bus streams lock poisoned");
        Ok(streams.keys().cloned().collect())
    }
}

const MAX_RETRY_ATTEMPTS: u32 = 6;
const RETRY_BASE_DELAY: Duration = Duration::from_millis(50);
const RETRY_MAX_DELAY: Duration = Duration::from_secs(5);

/// Retry a transient-failing operation with capped exponential backoff
/// (50 ms doubling to a 5 s cap, at most 6 attempts). Non-transient errors
/// fail immediately.
pub async fn retry<T, F, Fut>(what: &str, mut op: F) -> Result<T, RunnerError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, RunnerError>>,
{
    let mut delay = RETRY_BASE_DELAY;
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() && attempt < MAX_RETRY_ATTEMPTS => {
                tracing::warn!(attempt, error = %err, "{} failed, retrying", what);
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(RETRY_MAX_DELAY);
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}
