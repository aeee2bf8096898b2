//! In-memory implementation of the World traits
//!
//! The reference backend: used by the test suites and for embedding the
//! engine in a single process. It provides the same semantics durable
//! backends must implement, including idempotent enqueue, per-run tick
//! serialization, terminal-run append rejection, and the health-stream
//! validation exemption.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use wrun_core::{
    is_legacy, BlobId, Event, EventBody, HookToken, MessageId, MessagePayload, QueueMessage,
    RunId, RunProjection, StreamKind,
};

use super::store::{
    BlobStore, Delivery, EnqueueOptions, EnqueueOutcome, EventPage, EventStore, ListOptions,
    NewRun, QueueClient, QueueError, RunRecord, SortOrder, StoreError, StreamPage, StreamStore,
    World, DEFAULT_BLOB_THRESHOLD, HEALTH_STREAM_PREFIX,
};

const DEFAULT_PAGE_LIMIT: usize = 100;

/// Internal run state: stored metadata plus the log itself.
struct RunState {
    record: RunRecord,
    events: Vec<Event>,
}

/// Internal queued message state.
struct QueuedMessage {
    id: MessageId,
    message: QueueMessage,
    deliver_at: DateTime<Utc>,
    delivery_count: u32,
    in_flight: bool,
}

/// Internal stream state.
struct StreamState {
    kind: StreamKind,
    #[allow(dead_code)] // Stored for debugging/inspection
    namespace: Option<String>,
    chunks: Vec<Vec<u8>>,
    closed: bool,
}

/// In-memory World.
///
/// # Example
///
/// ```
/// use wrun_durable::world::InMemoryWorld;
///
/// let world = InMemoryWorld::new();
/// ```
pub struct InMemoryWorld {
    runs: RwLock<HashMap<RunId, RunState>>,
    // Hook token -> owning run. A cache over hook_created events, rebuilt
    // by append, never authoritative on its own.
    hooks: RwLock<HashMap<String, RunId>>,
    queues: RwLock<HashMap<String, Vec<QueuedMessage>>>,
    // (queue, idempotency key) -> accepted message id.
    idempotency: RwLock<HashMap<(String, String), MessageId>>,
    streams: RwLock<HashMap<(RunId, String), StreamState>>,
    blobs: RwLock<HashMap<BlobId, Vec<u8>>>,
    blob_threshold: usize,
}

impl InMemoryWorld {
    /// Create an empty world with the default blob threshold.
    pub fn new() -> Self {
        Self::with_blob_threshold(DEFAULT_BLOB_THRESHOLD)
    }

    /// Create an empty world with a custom blob threshold.
    pub fn with_blob_threshold(blob_threshold: usize) -> Self {
        Self {
            runs: RwLock::new(HashMap::new()),
            hooks: RwLock::new(HashMap::new()),
            queues: RwLock::new(HashMap::new()),
            idempotency: RwLock::new(HashMap::new()),
            streams: RwLock::new(HashMap::new()),
            blobs: RwLock::new(HashMap::new()),
            blob_threshold,
        }
    }

    /// Number of runs.
    pub fn run_count(&self) -> usize {
        self.runs.read().len()
    }

    /// Number of messages waiting (not in flight) on a queue.
    pub fn pending_message_count(&self, queue_name: &str) -> usize {
        self.queues
            .read()
            .get(queue_name)
            .map(|q| q.iter().filter(|m| !m.in_flight).count())
            .unwrap_or(0)
    }

    /// Names of queues holding at least one message.
    pub fn active_queues(&self) -> Vec<String> {
        self.queues
            .read()
            .iter()
            .filter(|(_, q)| !q.is_empty())
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Clear all state (for tests).
    pub fn clear(&self) {
        self.runs.write().clear();
        self.hooks.write().clear();
        self.queues.write().clear();
        self.idempotency.write().clear();
        self.streams.write().clear();
        self.blobs.write().clear();
    }

    fn run_is_terminal(&self, run_id: RunId) -> Option<bool> {
        let runs = self.runs.read();
        let state = runs.get(&run_id)?;
        Some(RunProjection::from_events(&state.events).status.is_terminal())
    }
}

impl Default for InMemoryWorld {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventStore for InMemoryWorld {
    async fn create_run(&self, run: NewRun) -> Result<(), StoreError> {
        let mut runs = self.runs.write();
        if runs.contains_key(&run.run_id) {
            return Err(StoreError::RunAlreadyExists(run.run_id));
        }

        let legacy = is_legacy(&run.spec_version)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        runs.insert(
            run.run_id,
            RunState {
                record: RunRecord {
                    run_id: run.run_id,
                    workflow_name: run.workflow_name,
                    spec_version: run.spec_version,
                    created_at: run.created_at,
                    legacy,
                },
                events: Vec::new(),
            },
        );
        Ok(())
    }

    async fn get_run(&self, run_id: RunId) -> Result<RunRecord, StoreError> {
        let runs = self.runs.read();
        runs.get(&run_id)
            .map(|state| state.record.clone())
            .ok_or(StoreError::RunNotFound(run_id))
    }

    async fn append(
        &self,
        run_id: RunId,
        expected_sequence: u64,
        events: Vec<Event>,
    ) -> Result<u64, StoreError> {
        let mut runs = self.runs.write();
        let state = runs.get_mut(&run_id).ok_or(StoreError::RunNotFound(run_id))?;

        let actual = state.events.len() as u64;
        if actual != expected_sequence {
            return Err(StoreError::ConcurrentAppend {
                run_id,
                expected: expected_sequence,
                actual,
            });
        }

        let projection = RunProjection::from_events(&state.events);
        if projection.status.is_terminal() {
            if events.iter().all(|e| e.body.is_informational()) {
                // Late stream content is dropped silently.
                return Ok(actual);
            }
            return Err(StoreError::TerminalRun {
                run_id,
                status: projection.status,
            });
        }

        let mut hooks = self.hooks.write();
        let mut floor = state
            .events
            .last()
            .map(|e| e.created_at)
            .unwrap_or(state.record.created_at);

        for mut event in events {
            // The log guarantees non-decreasing created_at within a run.
            if event.created_at < floor {
                event.created_at = floor;
            }
            floor = event.created_at;

            if let EventBody::HookCreated { hook_token, .. } = &event.body {
                hooks.insert(hook_token.as_str().to_string(), run_id);
            }
            state.events.push(event);
        }

        Ok(state.events.len() as u64)
    }

    async fn list(&self, run_id: RunId, options: ListOptions) -> Result<EventPage, StoreError> {
        let runs = self.runs.read();
        let state = runs.get(&run_id).ok_or(StoreError::RunNotFound(run_id))?;

        let limit = options.limit.unwrap_or(DEFAULT_PAGE_LIMIT).max(1);
        let offset: usize = match &options.cursor {
            Some(cursor) => cursor
                .parse()
                .map_err(|_| StoreError::Serialization(format!("bad cursor: {cursor:?}")))?,
            None => 0,
        };

        // The log is stored in append order, which is ascending
        // (created_at, event_id) order by construction.
        let total = state.events.len();
        let data: Vec<Event> = match options.order {
            SortOrder::Asc => state.events.iter().skip(offset).take(limit).cloned().collect(),
            SortOrder::Desc => state
                .events
                .iter()
                .rev()
                .skip(offset)
                .take(limit)
                .cloned()
                .collect(),
        };

        let consumed = offset + data.len();
        let has_more = consumed < total;
        Ok(EventPage {
            data,
            cursor: has_more.then(|| consumed.to_string()),
            has_more,
        })
    }

    async fn find_hook(&self, token: &HookToken) -> Result<Option<RunId>, StoreError> {
        Ok(self.hooks.read().get(token.as_str()).copied())
    }
}

#[async_trait]
impl QueueClient for InMemoryWorld {
    async fn enqueue(
        &self,
        message: QueueMessage,
        options: EnqueueOptions,
    ) -> Result<EnqueueOutcome, QueueError> {
        let key = (message.queue_name.clone(), message.idempotency_key.clone());

        let mut idempotency = self.idempotency.write();
        if let Some(existing) = idempotency.get(&key) {
            return Ok(EnqueueOutcome::Duplicate(*existing));
        }

        let id = MessageId::generate();
        idempotency.insert(key, id);
        drop(idempotency);

        let deliver_at = options.deliver_at.unwrap_or(message.created_at);
        let mut queues = self.queues.write();
        queues
            .entry(message.queue_name.clone())
            .or_default()
            .push(QueuedMessage {
                id,
                message,
                deliver_at,
                delivery_count: 0,
                in_flight: false,
            });

        Ok(EnqueueOutcome::Enqueued(id))
    }

    async fn receive(
        &self,
        queue_name: &str,
        now: DateTime<Utc>,
        max_messages: usize,
    ) -> Result<Vec<Delivery>, QueueError> {
        let mut queues = self.queues.write();
        let Some(queue) = queues.get_mut(queue_name) else {
            return Ok(Vec::new());
        };

        // Runs whose tick is already in flight: delivering another tick for
        // the same run would break the single-writer lease.
        let busy_runs: Vec<RunId> = queue
            .iter()
            .filter(|m| m.in_flight)
            .filter_map(|m| match &m.message.payload {
                MessagePayload::Tick(tick) => Some(tick.run_id),
                _ => None,
            })
            .collect();

        let mut deliveries = Vec::new();
        let mut claimed_runs = busy_runs;

        for entry in queue.iter_mut() {
            if deliveries.len() >= max_messages {
                break;
            }
            if entry.in_flight || entry.deliver_at > now {
                continue;
            }
            if let MessagePayload::Tick(tick) = &entry.message.payload {
                if claimed_runs.contains(&tick.run_id) {
                    continue;
                }
                claimed_runs.push(tick.run_id);
            }

            entry.in_flight = true;
            entry.delivery_count += 1;
            deliveries.push(Delivery {
                message_id: entry.id,
                message: entry.message.clone(),
                delivery_count: entry.delivery_count,
            });
        }

        Ok(deliveries)
    }

    async fn ack(&self, queue_name: &str, message_id: MessageId) -> Result<(), QueueError> {
        let mut queues = self.queues.write();
        let queue = queues
            .get_mut(queue_name)
            .ok_or(QueueError::MessageNotFound(message_id))?;
        let before = queue.len();
        queue.retain(|m| m.id != message_id);
        if queue.len() == before {
            return Err(QueueError::MessageNotFound(message_id));
        }
        Ok(())
    }

    async fn nack(
        &self,
        queue_name: &str,
        message_id: MessageId,
        redeliver_at: DateTime<Utc>,
    ) -> Result<(), QueueError> {
        let mut queues = self.queues.write();
        let queue = queues
            .get_mut(queue_name)
            .ok_or(QueueError::MessageNotFound(message_id))?;
        let entry = queue
            .iter_mut()
            .find(|m| m.id == message_id)
            .ok_or(QueueError::MessageNotFound(message_id))?;
        entry.in_flight = false;
        entry.deliver_at = redeliver_at;
        Ok(())
    }
}

#[async_trait]
impl StreamStore for InMemoryWorld {
    async fn open(
        &self,
        run_id: RunId,
        stream_name: &str,
        kind: StreamKind,
        namespace: Option<&str>,
    ) -> Result<(), StoreError> {
        if !stream_name.starts_with(HEALTH_STREAM_PREFIX)
            && !self.runs.read().contains_key(&run_id)
        {
            return Err(StoreError::RunNotFound(run_id));
        }

        let mut streams = self.streams.write();
        streams
            .entry((run_id, stream_name.to_string()))
            .or_insert_with(|| StreamState {
                kind,
                namespace: namespace.map(String::from),
                chunks: Vec::new(),
                closed: false,
            });
        Ok(())
    }

    async fn append_chunk(
        &self,
        run_id: RunId,
        stream_name: &str,
        chunk: &[u8],
    ) -> Result<(), StoreError> {
        // Late writers against finished runs are dropped silently.
        if self.run_is_terminal(run_id) == Some(true) {
            return Ok(());
        }

        let mut streams = self.streams.write();
        let state = streams
            .get_mut(&(run_id, stream_name.to_string()))
            .ok_or_else(|| StoreError::StreamNotFound {
                run_id,
                stream_name: stream_name.to_string(),
            })?;
        if state.closed {
            return Err(StoreError::StreamClosed {
                run_id,
                stream_name: stream_name.to_string(),
            });
        }
        state.chunks.push(chunk.to_vec());
        Ok(())
    }

    async fn close(&self, run_id: RunId, stream_name: &str) -> Result<(), StoreError> {
        let mut streams = self.streams.write();
        let state = streams
            .get_mut(&(run_id, stream_name.to_string()))
            .ok_or_else(|| StoreError::StreamNotFound {
                run_id,
                stream_name: stream_name.to_string(),
            })?;
        state.closed = true;
        Ok(())
    }

    async fn read(
        &self,
        run_id: RunId,
        stream_name: &str,
        cursor: usize,
        max_chunks: usize,
    ) -> Result<StreamPage, StoreError> {
        let streams = self.streams.read();
        let state = streams
            .get(&(run_id, stream_name.to_string()))
            .ok_or_else(|| StoreError::StreamNotFound {
                run_id,
                stream_name: stream_name.to_string(),
            })?;

        let chunks: Vec<Vec<u8>> = state
            .chunks
            .iter()
            .skip(cursor)
            .take(max_chunks)
            .cloned()
            .collect();
        let next_cursor = cursor + chunks.len();
        Ok(StreamPage {
            chunks,
            next_cursor,
            closed: state.closed && next_cursor >= state.chunks.len(),
            kind: state.kind,
        })
    }
}

#[async_trait]
impl BlobStore for InMemoryWorld {
    async fn put(&self, bytes: Vec<u8>) -> Result<BlobId, StoreError> {
        let id = BlobId::generate();
        self.blobs.write().insert(id, bytes);
        Ok(id)
    }

    async fn get(&self, blob: BlobId) -> Result<Vec<u8>, StoreError> {
        self.blobs
            .read()
            .get(&blob)
            .cloned()
            .ok_or(StoreError::BlobNotFound(blob))
    }
}

impl World for InMemoryWorld {
    fn events(&self) -> &dyn EventStore {
        self
    }

    fn queue(&self) -> &dyn QueueClient {
        self
    }

    fn streams(&self) -> &dyn StreamStore {
        self
    }

    fn blobs(&self) -> &dyn BlobStore {
        self
    }

    fn blob_threshold(&self) -> usize {
        self.blob_threshold
    }
}
